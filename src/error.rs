use thiserror::Error;

/// Reserved separator between a device key and a reading reference inside
/// a compound queue key. Neither component may contain it.
pub const KEY_DELIMITER: char = '+';

/// A call to the Bluetooth adapter failed. Never fatal; callers log and
/// keep cycling.
#[derive(Debug, Error)]
#[error("adapter call `{call}` failed: {reason}")]
pub struct AdapterError {
    pub call: &'static str,
    pub reason: String,
}

impl AdapterError {
    pub fn new(call: &'static str, reason: impl ToString) -> Self {
        AdapterError {
            call,
            reason: reason.to_string(),
        }
    }
}

/// A batch publish attempt was rejected by the connectivity channel.
/// Queued readings are retained and retried on a later sweep.
#[derive(Debug, Error)]
#[error("publish to `{destination}` failed: {reason}")]
pub struct ChannelError {
    pub destination: String,
    pub reason: String,
}

impl ChannelError {
    pub fn new(destination: impl ToString, reason: impl ToString) -> Self {
        ChannelError {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A compound queue key could not be built or decoded.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("component `{0}` contains the reserved delimiter `{KEY_DELIMITER}`")]
    ReservedDelimiter(String),
    #[error("compound key component is empty")]
    EmptyComponent,
    #[error("malformed compound key `{0}`")]
    MalformedKey(String),
}

/// Invalid startup configuration. The only fatal error in the system.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no devices configured")]
    NoDevices,
    #[error("device entry has an empty key")]
    EmptyDeviceKey,
    #[error("duplicate device key `{0}`")]
    DuplicateDeviceKey(String),
    #[error("{field} `{value}` contains the reserved delimiter `{KEY_DELIMITER}`")]
    ReservedDelimiter {
        field: &'static str,
        value: String,
    },
}
