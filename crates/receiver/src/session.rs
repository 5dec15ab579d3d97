//! Per-session transfer state: payload decoding, reassembly, mapping, pass
//! counting, and the timestamp deduplication applied before flushing.
//!
//! A [`TransferSession`] is built fresh for every session by the
//! controller and dropped when the session ends.  It does no I/O.

use std::collections::{BTreeMap, HashSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use crate::config::{PayloadEncoding, ProtocolConfig};
use crate::frame::{FrameEvent, Reassembler};
use crate::record::{parse_frame, DropReason, SoilReading};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Counters for one session, including drops keyed by [`DropReason::kind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub chunks: u64,
    pub frames: u64,
    pub accepted: u64,
    pub dropped: BTreeMap<&'static str, u64>,
}

impl SessionStats {
    #[cfg(test)]
    pub fn dropped(&self, kind: &str) -> u64 {
        self.dropped.get(kind).copied().unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }

    fn record_drop(&mut self, reason: &DropReason) {
        *self.dropped.entry(reason.kind()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Accepted(SoilReading),
    Dropped(DropReason),
    PassComplete { pass: u32 },
    /// The final expected pass finished; the session is now closing.
    TransferComplete,
}

pub struct TransferSession {
    reassembler: Reassembler,
    encoding: PayloadEncoding,
    expected_passes: u32,
    passes: u32,
    readings: Vec<SoilReading>,
    closing: bool,
    stats: SessionStats,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

impl TransferSession {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            reassembler: Reassembler::new(
                &protocol.frame_end_marker,
                &protocol.completion_markers,
                protocol.metadata_trim_limit,
            ),
            encoding: protocol.payload_encoding,
            expected_passes: protocol.expected_passes,
            passes: 0,
            readings: Vec::new(),
            closing: false,
            stats: SessionStats::default(),
        }
    }

    /// Feed one notification payload.  Chunks arriving after the final
    /// completion marker are ignored.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<SessionEvent> {
        if self.closing || chunk.is_empty() {
            return Vec::new();
        }
        self.stats.chunks += 1;

        let frame_events = match self.encoding {
            PayloadEncoding::Raw => self.reassembler.push_bytes(chunk),
            PayloadEncoding::Base64 => match decode_base64(chunk) {
                Some(bytes) => self.reassembler.push_bytes(&bytes),
                None => {
                    let reason = DropReason::UndecodableChunk;
                    self.stats.record_drop(&reason);
                    return vec![SessionEvent::Dropped(reason)];
                }
            },
        };

        let mut events = Vec::with_capacity(frame_events.len());
        for event in frame_events {
            if self.closing {
                break;
            }
            match event {
                FrameEvent::Frame(span) => {
                    self.stats.frames += 1;
                    match parse_frame(&span) {
                        Ok(reading) => {
                            self.stats.accepted += 1;
                            self.readings.push(reading.clone());
                            events.push(SessionEvent::Accepted(reading));
                        }
                        Err(reason) => {
                            self.stats.record_drop(&reason);
                            events.push(SessionEvent::Dropped(reason));
                        }
                    }
                }
                FrameEvent::Dropped(reason) => {
                    self.stats.frames += 1;
                    self.stats.record_drop(&reason);
                    events.push(SessionEvent::Dropped(reason));
                }
                FrameEvent::PassComplete => {
                    self.passes += 1;
                    events.push(SessionEvent::PassComplete { pass: self.passes });
                    if self.passes >= self.expected_passes {
                        self.closing = true;
                        self.reassembler.reset();
                        events.push(SessionEvent::TransferComplete);
                    }
                }
            }
        }
        events
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    #[cfg(test)]
    pub fn collected(&self) -> usize {
        self.readings.len()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Take the deduplicated readings for flushing.
    pub fn take_unique(&mut self) -> Vec<SoilReading> {
        dedup_by_timestamp(std::mem::take(&mut self.readings))
    }

    /// Drop collected readings without flushing; returns how many.
    pub fn discard(&mut self) -> usize {
        let n = self.readings.len();
        self.readings.clear();
        self.reassembler.reset();
        n
    }
}

fn decode_base64(chunk: &[u8]) -> Option<Vec<u8>> {
    let compact: Vec<u8> = chunk
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact).ok()
}

/// Keep the first reading per timestamp, preserving arrival order.
pub fn dedup_by_timestamp(readings: Vec<SoilReading>) -> Vec<SoilReading> {
    let mut seen = HashSet::new();
    readings
        .into_iter()
        .filter(|r| seen.insert(r.timestamp.clone()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
