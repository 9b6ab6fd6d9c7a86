//! Multi-protocol frame codec (spec §4.2).
//!
//! The codec is a capability set (`SubCodec`), not a class hierarchy: each
//! vendor dialect is a variant in a fixed trial order, and a `generic`
//! catch-all always succeeds so the composed codec itself never rejects.

mod generic;
mod gps303;
mod gt06;
mod h02;
mod tk103;

use crate::domain::{AlertKind, CommandKind, Fingerprint};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A position report as decoded off the wire, before a device id is known.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub course: f64,
    pub altitude: f64,
    pub recorded_at: Option<DateTime<Utc>>,
    pub satellites: u8,
    pub hdop: f64,
    pub battery_level: Option<u8>,
    pub signal_strength: Option<u8>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAlert {
    pub alert_kind: AlertKind,
    pub message: String,
    pub latitude: f64,
    pub longitude: f64,
    pub triggered_at: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

/// The typed payload of a decoded frame, dispatched by kind (spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Login,
    Location(DecodedLocation),
    Heartbeat,
    Alarm(DecodedAlert),
    CommandResponse { command_id: Option<String>, raw: Vec<u8> },
    Unknown { hex: String, ascii: String, length: usize },
}

/// A decoded frame. `imei` is set whenever the frame itself carries the
/// device identity, independent of `kind` (GT06 logins and GPS303
/// position lines both can; GT06 locations/heartbeats never do).
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub imei: Option<String>,
    pub kind: EventKind,
}

pub enum DecodeResult {
    Success { event: Decoded, consumed: usize },
    NeedMore,
    Reject,
}

/// Per sub-codec capability set (spec §4.2 contract).
pub trait SubCodec: Send + Sync {
    fn fingerprint(&self) -> Fingerprint;
    fn decode(&self, buf: &[u8]) -> DecodeResult;
    fn encode_auth_ack(&self, ok: bool) -> Option<Vec<u8>>;
    fn encode_login_ack(&self, ok: bool) -> Option<Vec<u8>>;
    fn encode_location_ack(&self, sequence: u8) -> Option<Vec<u8>>;
    fn encode_heartbeat_ack(&self) -> Option<Vec<u8>>;
    fn encode_command(&self, kind: CommandKind, params: &Value) -> Option<Vec<u8>>;
}

/// The composed codec: tries each specific sub-codec in order, falls back
/// to `generic`. The first sub-codec to succeed fixes the session's
/// fingerprint (the caller is responsible for remembering it and calling
/// `by_fingerprint` afterwards).
pub struct Codec {
    trial_order: Vec<Box<dyn SubCodec>>,
    generic: Box<dyn SubCodec>,
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            trial_order: vec![
                Box::new(gps303::Gps303Codec),
                Box::new(gt06::Gt06Codec),
                Box::new(tk103::Tk103Codec),
                Box::new(h02::H02Codec),
            ],
            generic: Box::new(generic::GenericCodec),
        }
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_fingerprint(&self, fp: Fingerprint) -> &dyn SubCodec {
        if fp == Fingerprint::Generic {
            return self.generic.as_ref();
        }
        self.trial_order
            .iter()
            .find(|c| c.fingerprint() == fp)
            .map(|c| c.as_ref())
            .expect("fingerprint fixed from a known sub-codec")
    }

    /// Try each sub-codec in the fixed trial order; `NeedMore` from any
    /// sub-codec short-circuits the whole trial (more bytes might turn a
    /// later reject into a match, but we can't know without them).
    pub fn decode_unfixed(&self, buf: &[u8]) -> (Fingerprint, DecodeResult) {
        for sub in &self.trial_order {
            match sub.decode(buf) {
                DecodeResult::Reject => continue,
                DecodeResult::NeedMore => return (sub.fingerprint(), DecodeResult::NeedMore),
                success => return (sub.fingerprint(), success),
            }
        }
        let result = self.generic.decode(buf);
        (Fingerprint::Generic, result)
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn ascii_printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
        .collect()
}
