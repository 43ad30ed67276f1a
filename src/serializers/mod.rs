//! Frame serialization
//!
//! Only data frames cross a serialization boundary. Control and system frames
//! are meaningful inside a running pipeline only and are rejected.

mod json;

pub use json::JsonSerializer;

use thiserror::Error;

use crate::frame::{Frame, FrameFactory};

/// Errors that can occur while encoding or decoding frames
#[derive(Debug, Error)]
pub enum SerializerError {
    /// The frame has no wire representation
    #[error("Unsupported frame for serialization: {0}")]
    UnsupportedFrame(String),

    /// The payload names a frame type this serializer does not know
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait FrameSerializer: Send + Sync {
    fn serialize(&self, frame: &Frame) -> Result<Vec<u8>, SerializerError>;

    /// Decode a payload into a frame with a fresh id from `frames`.
    fn deserialize(&self, data: &[u8], frames: &FrameFactory) -> Result<Frame, SerializerError>;
}
