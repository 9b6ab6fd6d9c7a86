//! Core data types shared by the codec, registry, store and dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered tracking device, as persisted in the `devices` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub imei: String,
    pub company_id: i64,
    pub active: bool,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

/// The protocol dialect a session is speaking, fixed on first successful decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fingerprint {
    Gps303,
    Gt06,
    Tk103,
    H02,
    Generic,
}

impl Fingerprint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fingerprint::Gps303 => "gps303",
            Fingerprint::Gt06 => "gt06",
            Fingerprint::Tk103 => "tk103",
            Fingerprint::H02 => "h02",
            Fingerprint::Generic => "generic",
        }
    }
}

/// A decoded position report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationEvent {
    pub device_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub course: f64,
    pub altitude: f64,
    pub recorded_at: DateTime<Utc>,
    pub satellites: u8,
    pub hdop: f64,
    pub battery_level: Option<u8>,
    pub signal_strength: Option<u8>,
    pub raw: Vec<u8>,
}

/// The kind of alarm/alert condition carried by an alert frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Sos,
    PowerCut,
    Vibration,
    FenceIn,
    FenceOut,
    OverSpeed,
    Normal,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub device_id: i64,
    pub alert_kind: AlertKind,
    pub message: String,
    pub latitude: f64,
    pub longitude: f64,
    pub triggered_at: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub resolved: bool,
}

/// An outbound command kind, as understood by `SubCodec::encode_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Locate,
    Reboot,
    EngineStop,
    EngineResume,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl CommandStatus {
    /// Spec §3 invariant: transitions are monotonic, `failed`/`acknowledged` terminal.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Acknowledged) | (Sent, Acknowledged) | (Pending, Failed) | (Sent, Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Command {
    pub id: String,
    pub device_id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_status_monotonic() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Sent));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Acknowledged));
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Failed));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Failed));
        assert!(!CommandStatus::Acknowledged.can_transition_to(CommandStatus::Sent));
        assert!(!CommandStatus::Failed.can_transition_to(CommandStatus::Pending));
        assert!(!CommandStatus::Pending.can_transition_to(CommandStatus::Pending));
    }
}
