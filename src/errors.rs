/// All error types that can occur when interacting with Govee devices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to deserialize JSON data.
    #[error("failed to load json: {0:?}")]
    JsonLoad(serde_json::Error),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: std::io::Error },

    /// The number of configured network masks does not match the number of
    /// listening addresses.
    #[error("number of network masks ({masks}) must match number of listening addresses ({addresses})")]
    NetworkMaskMismatch { addresses: usize, masks: usize },

    /// The controller was configured with no listening address.
    #[error("at least one listening address is required")]
    NoListeningAddress,

    /// The controller was started twice.
    #[error("controller is already started")]
    AlreadyStarted,

    /// An operation that needs the network was called before `start`.
    #[error("controller is not started")]
    NotStarted,

    /// No known device matches the given fingerprint.
    #[error("no device with fingerprint {0:?}")]
    DeviceNotFound(String),

    /// The device model does not support the requested feature.
    #[error("device {sku} does not support {feature}")]
    FeatureNotSupported { sku: String, feature: &'static str },

    /// The requested segment index is outside the device's segment range.
    #[error("segment {segment} is not valid; device has {available} segments")]
    SegmentOutOfRange { segment: usize, available: usize },

    /// The named scene is not available for the device.
    #[error("scene {0:?} is not available for this device")]
    SceneNotFound(String),

    /// A raw command string could not be parsed as hexadecimal bytes.
    #[error("invalid raw command {0:?}; expected an even-length hex string")]
    InvalidHexCommand(String),
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new feature not supported error
    pub fn feature_not_supported(sku: &str, feature: &'static str) -> Self {
        Error::FeatureNotSupported {
            sku: sku.to_string(),
            feature,
        }
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
