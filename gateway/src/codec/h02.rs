//! H02 sub-codec (spec §4.2, §9 Open Question 3).
//!
//! The reference implementation never actually decodes H02 frames — spec.md
//! explicitly permits rejecting all of them rather than inferring a wire
//! format that was never specified. Kept as a distinct, always-rejecting
//! variant (not folded into `generic`) so the trial order and fingerprint
//! set match spec.md exactly, and so a real H02 decoder can be dropped in
//! here later without touching the rest of the codec.

use super::{DecodeResult, SubCodec};
use crate::domain::{CommandKind, Fingerprint};
use serde_json::Value;

pub struct H02Codec;

impl SubCodec for H02Codec {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::H02
    }

    fn decode(&self, _buf: &[u8]) -> DecodeResult {
        DecodeResult::Reject
    }

    fn encode_auth_ack(&self, _ok: bool) -> Option<Vec<u8>> {
        None
    }

    fn encode_login_ack(&self, _ok: bool) -> Option<Vec<u8>> {
        None
    }

    fn encode_location_ack(&self, _sequence: u8) -> Option<Vec<u8>> {
        None
    }

    fn encode_heartbeat_ack(&self) -> Option<Vec<u8>> {
        None
    }

    fn encode_command(&self, _kind: CommandKind, _params: &Value) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_rejects() {
        let codec = H02Codec;
        match codec.decode(b"anything") {
            DecodeResult::Reject => {}
            _ => panic!("H02 must reject: no wire format specified"),
        }
    }
}
