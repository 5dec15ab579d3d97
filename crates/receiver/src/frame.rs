//! Frame reassembly over the transfer characteristic's byte stream.
//!
//! Notifications arrive in arbitrary sizes.  Bytes are appended to one
//! text buffer and markers are searched in the accumulated buffer, never
//! in a single chunk, so a marker split across notifications is still
//! found exactly once.
//!
//! ```text
//! {"parameters":{..},"timestamp":"..",..}FILE_END:reading_0001.json\n
//! └──────────── candidate span ─────────┘└marker┘└─── metadata ───┘
//! ```
//!
//! After each frame marker the trailing metadata is trimmed up to the
//! first newline, the next `{`, the start of another marker, or
//! `trim_limit` characters, whichever comes first.  If the buffer ends
//! before any of those, the metadata is left in place: it precedes the
//! next `{` and is never part of a candidate span.

use crate::record::DropReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Text between the first `{` and the last `}` before a frame marker.
    Frame(String),
    Dropped(DropReason),
    /// A completion marker was consumed.
    PassComplete,
}

pub struct Reassembler {
    frame_marker: String,
    completion_markers: Vec<String>,
    trim_limit: usize,
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
}

impl Reassembler {
    pub fn new(frame_marker: &str, completion_markers: &[String], trim_limit: usize) -> Self {
        Self {
            frame_marker: frame_marker.to_string(),
            completion_markers: completion_markers.to_vec(),
            trim_limit,
            buffer: String::new(),
            pending: Vec::new(),
        }
    }

    /// Append decoded notification bytes and extract every complete event.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        if bytes.is_empty() {
            return Vec::new();
        }
        self.decode_into_buffer(bytes);
        self.drain()
    }

    #[cfg(test)]
    pub fn push_str(&mut self, text: &str) -> Vec<FrameEvent> {
        self.push_bytes(text.as_bytes())
    }

    #[cfg(test)]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }

    fn decode_into_buffer(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    self.buffer.push_str(s);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    let prefix = &self.pending[start..start + valid];
                    self.buffer
                        .push_str(std::str::from_utf8(prefix).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            start += valid + bad;
                        }
                        // Incomplete sequence: wait for the next chunk.
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }

    /// Process markers in buffer order until none is left.
    fn drain(&mut self) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        loop {
            let frame_at = self.buffer.find(self.frame_marker.as_str());
            let done_at = self.find_completion();
            match (frame_at, done_at) {
                (Some(f), Some((d, _))) if f < d => events.push(self.take_frame(f)),
                (Some(f), None) => events.push(self.take_frame(f)),
                (_, Some((d, len))) => {
                    self.take_completion(d, len);
                    events.push(FrameEvent::PassComplete);
                }
                (None, None) => break,
            }
        }
        events
    }

    /// Earliest completion marker as `(position, length)`.
    fn find_completion(&self) -> Option<(usize, usize)> {
        self.completion_markers
            .iter()
            .filter_map(|m| self.buffer.find(m.as_str()).map(|pos| (pos, m.len())))
            .min_by_key(|&(pos, _)| pos)
    }

    fn take_frame(&mut self, marker_at: usize) -> FrameEvent {
        let head = &self.buffer[..marker_at];
        let event = match (head.find('{'), head.rfind('}')) {
            (Some(open), Some(close)) if close > open => {
                FrameEvent::Frame(head[open..=close].to_string())
            }
            _ => FrameEvent::Dropped(DropReason::NoJsonSpan),
        };

        let after = marker_at + self.frame_marker.len();
        let cut = after + self.metadata_len(&self.buffer[after..]);
        self.buffer.drain(..cut);
        event
    }

    fn take_completion(&mut self, at: usize, len: usize) {
        let mut cut = at + len;
        if self.buffer[cut..].starts_with("\r\n") {
            cut += 2;
        } else if self.buffer[cut..].starts_with('\n') {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }

    /// Bytes of trailing metadata to drop after a frame marker.
    fn metadata_len(&self, rest: &str) -> usize {
        for (count, (i, c)) in rest.char_indices().enumerate() {
            if c == '\n' {
                return i + 1;
            }
            if c == '{' || self.marker_starts_at(&rest[i..]) || count == self.trim_limit {
                return i;
            }
        }
        0
    }

    /// Whether `s` begins with a marker, or is a prefix of one that may
    /// complete with the next chunk.
    fn marker_starts_at(&self, s: &str) -> bool {
        std::iter::once(&self.frame_marker)
            .chain(self.completion_markers.iter())
            .any(|m| s.starts_with(m.as_str()) || m.starts_with(s))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
