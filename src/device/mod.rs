pub mod manager;
pub mod models;
pub mod motion;
pub mod registry;

pub use manager::DeviceManager;
pub use models::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid device id: {0}")]
    InvalidHandle(DeviceId),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serial communication error: {0}")]
    Communication(#[from] crate::serial::SerialError),
}

impl DeviceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DeviceError::InvalidHandle(_) => ErrorCode::InvalidId,
            DeviceError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            DeviceError::InvalidState(_) => ErrorCode::InvalidState,
            DeviceError::Communication(_) => ErrorCode::Communication,
        }
    }
}

/// Numeric result codes of the C-style rotator SDK
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Success = 0,
    InvalidId = 1,
    InvalidParameter = 2,
    InvalidState = 3,
    Communication = 4,
    /// Reserved for foreign callers passing a null output pointer
    NullPointer = 5,
}

pub type Result<T> = std::result::Result<T, DeviceError>;
