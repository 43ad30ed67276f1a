use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FrameSerializer, SerializerError};
use crate::frame::{Frame, FrameFactory};

const TYPE_TEXT: &str = "text";
const TYPE_AUDIO: &str = "audio";
const TYPE_IMAGE: &str = "image";
const TYPE_BYTES: &str = "bytes";

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

#[derive(Serialize, Deserialize)]
struct TextData {
    text: String,
}

#[derive(Serialize, Deserialize)]
struct AudioData {
    audio: Vec<u8>,
    sample_rate: u32,
    num_channels: u16,
    sample_width: u16,
}

#[derive(Serialize, Deserialize)]
struct ImageData {
    image: Vec<u8>,
    size: (u32, u32),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BytesData {
    data: Vec<u8>,
}

/// Encodes data frames as `{"type": ..., "data": {...}}`.
///
/// Frame ids are process-local and never written; decoding assigns new ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl FrameSerializer for JsonSerializer {
    fn serialize(&self, frame: &Frame) -> Result<Vec<u8>, SerializerError> {
        let (kind, data) = match frame {
            Frame::Text { text, .. } => (
                TYPE_TEXT,
                serde_json::to_value(TextData { text: text.clone() })?,
            ),
            Frame::AudioRaw {
                audio,
                sample_rate,
                num_channels,
                sample_width,
                ..
            } => (
                TYPE_AUDIO,
                serde_json::to_value(AudioData {
                    audio: audio.clone(),
                    sample_rate: *sample_rate,
                    num_channels: *num_channels,
                    sample_width: *sample_width,
                })?,
            ),
            Frame::ImageRaw {
                image,
                size,
                format,
                mode,
                ..
            } => (
                TYPE_IMAGE,
                serde_json::to_value(ImageData {
                    image: image.clone(),
                    size: *size,
                    format: format.clone(),
                    mode: mode.clone(),
                })?,
            ),
            Frame::Bytes { data, .. } => (
                TYPE_BYTES,
                serde_json::to_value(BytesData { data: data.clone() })?,
            ),
            other => return Err(SerializerError::UnsupportedFrame(other.name())),
        };

        let envelope = Envelope {
            kind: kind.to_string(),
            data,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn deserialize(&self, data: &[u8], frames: &FrameFactory) -> Result<Frame, SerializerError> {
        let envelope: Envelope = serde_json::from_slice(data)?;

        let frame = match envelope.kind.as_str() {
            TYPE_TEXT => {
                let TextData { text } = serde_json::from_value(envelope.data)?;
                frames.text(text)
            }
            TYPE_AUDIO => {
                let audio: AudioData = serde_json::from_value(envelope.data)?;
                frames.audio_raw(
                    audio.audio,
                    audio.sample_rate,
                    audio.num_channels,
                    audio.sample_width,
                )
            }
            TYPE_IMAGE => {
                let image: ImageData = serde_json::from_value(envelope.data)?;
                frames.image_raw(image.image, image.size, image.format, image.mode)
            }
            TYPE_BYTES => {
                let BytesData { data } = serde_json::from_value(envelope.data)?;
                frames.bytes(data)
            }
            other => return Err(SerializerError::UnknownType(other.to_string())),
        };
        Ok(frame)
    }
}
