//! Generic fallback sub-codec (spec §4.2). Always succeeds, consuming the
//! entire buffer as an `unknown` event; never reached until every
//! vendor-specific sub-codec has rejected.

use super::{ascii_printable, hex_encode, DecodeResult, Decoded, EventKind, SubCodec};
use crate::domain::{CommandKind, Fingerprint};
use serde_json::Value;

pub struct GenericCodec;

impl SubCodec for GenericCodec {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::Generic
    }

    fn decode(&self, buf: &[u8]) -> DecodeResult {
        DecodeResult::Success {
            event: Decoded {
                imei: None,
                kind: EventKind::Unknown {
                    hex: hex_encode(buf),
                    ascii: ascii_printable(buf),
                    length: buf.len(),
                },
            },
            consumed: buf.len(),
        }
    }

    fn encode_auth_ack(&self, _ok: bool) -> Option<Vec<u8>> {
        Some(b"OK".to_vec())
    }

    fn encode_login_ack(&self, _ok: bool) -> Option<Vec<u8>> {
        Some(b"OK".to_vec())
    }

    fn encode_location_ack(&self, _sequence: u8) -> Option<Vec<u8>> {
        Some(b"ACK".to_vec())
    }

    fn encode_heartbeat_ack(&self) -> Option<Vec<u8>> {
        Some(b"PONG".to_vec())
    }

    fn encode_command(&self, _kind: CommandKind, _params: &Value) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_succeeds_consuming_whole_buffer() {
        let codec = GenericCodec;
        match codec.decode(b"\x01\x02hello") {
            DecodeResult::Success { event, consumed } => {
                assert_eq!(consumed, 7);
                match event.kind {
                    EventKind::Unknown { hex, ascii, length } => {
                        assert_eq!(hex, "010268656c6c6f");
                        assert_eq!(ascii, "..hello");
                        assert_eq!(length, 7);
                    }
                    _ => panic!("expected unknown"),
                }
            }
            _ => panic!("expected success"),
        }
    }
}
