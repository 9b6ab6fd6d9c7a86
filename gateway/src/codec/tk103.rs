//! TK103 ASCII sub-codec (spec §4.2).
//!
//! Frame starts with `##`, comma-separated, terminated by `;`. The only
//! frame shape spec.md actually specifies is login: a field beginning
//! `imei:` yields a login event carrying that IMEI. Other TK103 message
//! shapes (location/heartbeat payloads) are not described in spec.md and
//! are left unimplemented here, the same way H02 is left unimplemented —
//! a frame recognized as TK103 (`##...;`) without an `imei:` field rejects
//! rather than guessing a shape.

use super::{DecodeResult, Decoded, EventKind, SubCodec};
use crate::domain::{CommandKind, Fingerprint};
use serde_json::Value;

pub struct Tk103Codec;

impl SubCodec for Tk103Codec {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::Tk103
    }

    fn decode(&self, buf: &[u8]) -> DecodeResult {
        if !buf.starts_with(b"##") {
            return DecodeResult::Reject;
        }
        let end = match buf.iter().position(|&b| b == b';') {
            Some(end) => end,
            None => return DecodeResult::NeedMore,
        };
        let line = match std::str::from_utf8(&buf[..end]) {
            Ok(s) => s,
            Err(_) => return DecodeResult::Reject,
        };

        let imei = line.split(',').find_map(|f| f.strip_prefix("imei:"));
        match imei {
            Some(imei) => DecodeResult::Success {
                event: Decoded { imei: Some(imei.to_string()), kind: EventKind::Login },
                consumed: end + 1,
            },
            None => DecodeResult::Reject,
        }
    }

    fn encode_auth_ack(&self, _ok: bool) -> Option<Vec<u8>> {
        Some(b"LOAD".to_vec())
    }

    fn encode_login_ack(&self, _ok: bool) -> Option<Vec<u8>> {
        Some(b"LOAD".to_vec())
    }

    fn encode_location_ack(&self, _sequence: u8) -> Option<Vec<u8>> {
        Some(b"ON".to_vec())
    }

    fn encode_heartbeat_ack(&self) -> Option<Vec<u8>> {
        Some(b"ON".to_vec())
    }

    fn encode_command(&self, _kind: CommandKind, _params: &Value) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_extracts_imei_field() {
        let codec = Tk103Codec;
        let buf = b"##,imei:123456789012345,A;";
        match codec.decode(buf) {
            DecodeResult::Success { event, consumed } => {
                assert_eq!(event.imei.as_deref(), Some("123456789012345"));
                assert_eq!(consumed, buf.len());
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn rejects_without_imei_field() {
        let codec = Tk103Codec;
        match codec.decode(b"##,tracker,A;") {
            DecodeResult::Reject => {}
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn rejects_non_tk103_bytes() {
        let codec = Tk103Codec;
        match codec.decode(b"imei:123456789012345,x;") {
            DecodeResult::Reject => {}
            _ => panic!("expected reject"),
        }
    }
}
