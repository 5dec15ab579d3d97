//! Device-side rendering of a transfer session.
//!
//! The probe dumps every stored reading as one JSON file followed by a
//! `FILE_END` marker and the file name, then a completion marker.  The
//! whole dump is repeated once per pass.  The resulting text is cut into
//! notification-sized pieces and, when the firmware is built for it,
//! base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::sim::SoilSim;

/// Marker written after every frame.
pub const FRAME_END: &str = "FILE_END";

/// Completion marker written after every pass but the last.  The spelling
/// matches the shipped firmware.
pub const ALL_FILES_TRANSFERRED: &str = "ALL FILES TRANSFERED";

/// Completion marker written after the final pass.
pub const TRANSFER_COMPLETE: &str = "TRANSFER_COMPLETE";

/// ATT notification header bytes that do not carry payload.
pub const ATT_HEADER: usize = 3;

/// Passes the firmware performs per session.
pub const DEFAULT_PASSES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Base64,
    Raw,
}

/// Write one frame, its end marker, and the trailing file name.
pub fn render_frame(out: &mut String, json: &str, filename: &str, newline: bool) {
    out.push_str(json);
    out.push_str(FRAME_END);
    out.push(':');
    out.push_str(filename);
    if newline {
        out.push('\n');
    }
}

/// Render `readings` frames repeated over `passes` passes.
///
/// Readings are generated once so every pass carries the same timestamps;
/// corruption is rolled independently per pass.
pub fn render_transcript(sim: &mut SoilSim, readings: usize, passes: usize) -> String {
    let scenario = sim.scenario();
    let frames: Vec<String> = (0..readings).map(|_| sim.next_frame().to_string()).collect();
    let keepalive = sim.keepalive_frame().to_string();

    let mut out = String::new();
    for pass in 0..passes {
        for (i, json) in frames.iter().enumerate() {
            let filename = format!("reading_{:04}.json", i + 1);

            if sim.roll(scenario.keepalive_prob()) {
                render_frame(&mut out, &keepalive, "keepalive.json", true);
            }

            let newline = !sim.roll(scenario.missing_newline_prob());
            if sim.roll(scenario.truncate_prob()) {
                let cut = json.len() / 2;
                render_frame(&mut out, &json[..cut], &filename, newline);
            } else {
                render_frame(&mut out, json, &filename, newline);
            }
        }

        if pass + 1 == passes {
            out.push_str(TRANSFER_COMPLETE);
        } else {
            out.push_str(ALL_FILES_TRANSFERRED);
        }
        out.push('\n');
    }
    out
}

/// Raw payload bytes that fit one notification at `mtu` for `encoding`.
pub fn payload_capacity(mtu: usize, encoding: Encoding) -> usize {
    let usable = mtu.saturating_sub(ATT_HEADER).max(4);
    match encoding {
        Encoding::Raw => usable,
        Encoding::Base64 => (usable / 4) * 3,
    }
}

/// Split `text` into notification payloads for the given MTU.
pub fn notifications(text: &str, mtu: usize, encoding: Encoding) -> Vec<Vec<u8>> {
    let size = payload_capacity(mtu, encoding);
    text.as_bytes()
        .chunks(size)
        .map(|chunk| match encoding {
            Encoding::Raw => chunk.to_vec(),
            Encoding::Base64 => STANDARD.encode(chunk).into_bytes(),
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
