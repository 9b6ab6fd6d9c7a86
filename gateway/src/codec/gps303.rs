//! GPS303 ASCII sub-codec (spec §4.2).
//!
//! Two frame shapes, both terminated by a trailing `;`:
//!   - Login: starts with `##`; arbitrary content; no IMEI extracted even
//!     if the content happens to contain `imei:` (§4.1 two-step auth).
//!   - Position: starts with `imei:`, comma-separated fields.

use super::{DecodeResult, Decoded, DecodedLocation, EventKind, SubCodec};
use crate::domain::{CommandKind, Fingerprint};
use chrono::{TimeZone, Utc};
use serde_json::Value;

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b';')
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    let whole = (value / 100.0).trunc();
    let frac = value - whole * 100.0;
    Some(whole + frac / 60.0)
}

pub struct Gps303Codec;

impl SubCodec for Gps303Codec {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::Gps303
    }

    fn decode(&self, buf: &[u8]) -> DecodeResult {
        if buf.starts_with(b"##") {
            return match find_terminator(buf) {
                Some(end) => DecodeResult::Success {
                    event: Decoded { imei: None, kind: EventKind::Login },
                    consumed: end + 1,
                },
                None => DecodeResult::NeedMore,
            };
        }

        if !buf.starts_with(b"imei:") {
            return DecodeResult::Reject;
        }

        let end = match find_terminator(buf) {
            Some(end) => end,
            None => return DecodeResult::NeedMore,
        };
        let line = match std::str::from_utf8(&buf[..end]) {
            Ok(s) => s,
            Err(_) => return DecodeResult::Reject,
        };
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 12 {
            return DecodeResult::Reject;
        }

        let imei = fields[0].trim_start_matches("imei:").to_string();
        let datetime_field = fields[2];
        let recorded_at = parse_gps303_datetime(datetime_field);

        let lat_raw = fields[7];
        let lat_hemi = fields[8];
        let lon_raw = fields[9];
        let lon_hemi = fields[10];
        let speed: f64 = fields[11].trim().parse().unwrap_or(0.0);

        let mut latitude = match parse_coordinate(lat_raw) {
            Some(v) => v,
            None => return DecodeResult::Reject,
        };
        let mut longitude = match parse_coordinate(lon_raw) {
            Some(v) => v,
            None => return DecodeResult::Reject,
        };
        if lat_hemi.eq_ignore_ascii_case("S") {
            latitude = -latitude;
        }
        if lon_hemi.eq_ignore_ascii_case("W") {
            longitude = -longitude;
        }

        let raw = buf[..end + 1].to_vec();
        DecodeResult::Success {
            event: Decoded {
                imei: Some(imei),
                kind: EventKind::Location(DecodedLocation {
                    latitude,
                    longitude,
                    speed,
                    course: 0.0,
                    altitude: 0.0,
                    recorded_at,
                    satellites: 0,
                    hdop: 0.0,
                    battery_level: None,
                    signal_strength: None,
                    raw,
                }),
            },
            consumed: end + 1,
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

fn parse_gps303_datetime(field: &str) -> Option<chrono::DateTime<Utc>> {
    if field.len() != 12 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let yy: i32 = field[0..2].parse().ok()?;
    let mm: u32 = field[2..4].parse().ok()?;
    let dd: u32 = field[4..6].parse().ok()?;
    let hh: u32 = field[6..8].parse().ok()?;
    let mi: u32 = field[8..10].parse().ok()?;
    let ss: u32 = field[10..12].parse().ok()?;
    Utc.with_ymd_and_hms(2000 + yy, mm, dd, hh, mi, ss).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_frame_carries_no_imei() {
        let codec = Gps303Codec;
        let buf = b"##,imei:359710045490084,A;";
        match codec.decode(buf) {
            DecodeResult::Success { event, consumed } => {
                assert_eq!(event.imei, None);
                assert_eq!(event.kind, EventKind::Login);
                assert_eq!(consumed, buf.len());
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn position_frame_decodes_southwest_coordinates() {
        let codec = Gps303Codec;
        let buf = b"imei:359710045490084,tracker,250101120000,,F,120000.000,A,2230.0000,S,04310.0000,W,42.5,;";
        match codec.decode(buf) {
            DecodeResult::Success { event, .. } => {
                assert_eq!(event.imei.as_deref(), Some("359710045490084"));
                match event.kind {
                    EventKind::Location(loc) => {
                        assert!((loc.latitude - (-22.5)).abs() < 1e-6);
                        assert!((loc.longitude - (-43.1666667)).abs() < 1e-4);
                        assert_eq!(loc.speed, 42.5);
                    }
                    _ => panic!("expected location"),
                }
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn needs_more_without_terminator() {
        let codec = Gps303Codec;
        match codec.decode(b"imei:359710045490084,tracker") {
            DecodeResult::NeedMore => {}
            _ => panic!("expected need-more"),
        }
    }

    #[test]
    fn rejects_unrelated_bytes() {
        let codec = Gps303Codec;
        match codec.decode(b"garbage") {
            DecodeResult::Reject => {}
            _ => panic!("expected reject"),
        }
    }
}
