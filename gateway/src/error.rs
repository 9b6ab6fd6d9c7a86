//! Error taxonomy for the boundaries that must propagate or reconnect
//! rather than tear down the process (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unknown or inactive IMEI: {0}")]
    AuthUnknownImei(String),

    #[error("authentication timed out after {0}s")]
    AuthTimeout(u64),

    #[error("store error: {0}")]
    StoreIo(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    BusIo(#[from] lapin::Error),

    #[error("command has no encoding for this session's protocol")]
    CommandBuild,

    #[error("failed writing command to device socket: {0}")]
    CommandWrite(#[from] std::io::Error),

    #[error("device not connected")]
    DeviceOffline,
}
