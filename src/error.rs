// MIT License - Copyright (c) 2021 TJForc

/// All errors that can occur in the visonic-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum VisonicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to panel lost")]
    Disconnected,

    #[error("Protocol engine suspended")]
    Suspended,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid message: {details}")]
    InvalidMessage { details: String },

    #[error("Patch at offset {offset} (len {len}) exceeds template length {template_len}")]
    PatchOutOfBounds {
        offset: usize,
        len: usize,
        template_len: usize,
    },

    #[error("Patch at offset {offset} overlaps a previous patch")]
    PatchOverlap { offset: usize },

    #[error("Invalid PIN or code: {pin}")]
    InvalidPin { pin: String },

    #[error("A user code is required for this command")]
    PinRequired,

    #[error("Invalid device ID: {id} (max: {max})")]
    InvalidDeviceId { id: u32, max: u32 },

    #[error("Operation not supported: {operation}")]
    NotSupported { operation: String },

    #[error("Invalid configuration: {details}")]
    InvalidConfig { details: String },
}

impl VisonicError {
    /// Whether this error is transient and the connection should be recreated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VisonicError::Io(_)
                | VisonicError::Disconnected
                | VisonicError::Suspended
                | VisonicError::ChannelClosed
        )
    }

    pub(crate) fn invalid_message(details: impl Into<String>) -> Self {
        VisonicError::InvalidMessage {
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VisonicError>;
