//! Wire formats spoken with the log engine: length-prefixed binary frames,
//! text commands and their `ok` replies.

use std::fmt;

mod commands;
mod frames;
mod version;

pub use commands::*;
pub use frames::*;
pub use version::*;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodecError {
    PayloadTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTooLarge { len: usize, max: usize },
    FrameTruncated { expected: usize, actual: usize },
}

impl fmt::Display for FrameCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
            Self::FrameTooShort { len } => write!(f, "frame too short: {len}"),
            Self::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
            Self::FrameTruncated { expected, actual } => {
                write!(
                    f,
                    "truncated frame payload: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for FrameCodecError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Frame(FrameCodecError),
    Json(String),
    /// An `ok` reply whose shape did not match the command that was sent.
    UnexpectedReply { command: &'static str, reply: String },
    InvalidVersion(String),
    VersionMismatch { actual: EngineVersion, required: VersionRange },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::UnexpectedReply { command, reply } => {
                write!(f, "unexpected reply to '{command}': {reply}")
            }
            Self::InvalidVersion(raw) => write!(f, "invalid engine version '{raw}'"),
            Self::VersionMismatch { actual, required } => {
                write!(f, "engine version {actual} is outside {required}")
            }
        }
    }
}

impl std::error::Error for WireError {}

impl From<FrameCodecError> for WireError {
    fn from(value: FrameCodecError) -> Self {
        Self::Frame(value)
    }
}

pub fn encode_frame(payload: &[u8], max_payload_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    if payload.len() > max_payload_bytes {
        return Err(FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload_bytes,
        });
    }

    let payload_len =
        u32::try_from(payload.len()).map_err(|_| FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn decode_frame(frame: &[u8], max_payload_bytes: usize) -> Result<&[u8], FrameCodecError> {
    if frame.len() < 4 {
        return Err(FrameCodecError::FrameTooShort { len: frame.len() });
    }

    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&frame[..4]);
    let payload_len = u32::from_be_bytes(prefix) as usize;
    if payload_len > max_payload_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        });
    }

    let actual_payload_len = frame.len() - 4;
    if actual_payload_len != payload_len {
        return Err(FrameCodecError::FrameTruncated {
            expected: payload_len,
            actual: actual_payload_len,
        });
    }

    Ok(&frame[4..])
}

pub fn encode_bin_frame(frame: &BinFrame, max_payload_bytes: usize) -> Result<Vec<u8>, WireError> {
    let payload = facet_json::to_vec(frame).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn encode_bin_frame_default(frame: &BinFrame) -> Result<Vec<u8>, WireError> {
    encode_bin_frame(frame, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_bin_frame(frame: &[u8], max_payload_bytes: usize) -> Result<BinFrame, WireError> {
    let payload = decode_frame(frame, max_payload_bytes)?;
    facet_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn decode_bin_frame_default(frame: &[u8]) -> Result<BinFrame, WireError> {
    decode_bin_frame(frame, DEFAULT_MAX_FRAME_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_json(frame: &BinFrame) -> String {
        let bytes = encode_bin_frame_default(frame).expect("frame should encode");
        let payload = decode_frame(&bytes, DEFAULT_MAX_FRAME_BYTES).expect("frame should decode");
        std::str::from_utf8(payload)
            .expect("payload should be utf8 json")
            .to_string()
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut bytes = encode_frame(b"hello", 64).unwrap();
        bytes.pop();
        assert_eq!(
            decode_frame(&bytes, 64),
            Err(FrameCodecError::FrameTruncated {
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(
            encode_frame(&[0u8; 8], 4),
            Err(FrameCodecError::PayloadTooLarge { len: 8, max: 4 })
        );
        let bytes = encode_frame(&[0u8; 8], 64).unwrap();
        assert_eq!(
            decode_frame(&bytes, 4),
            Err(FrameCodecError::FrameTooLarge { len: 8, max: 4 })
        );
    }

    #[test]
    fn end_of_stream_batch_wire_shape() {
        let json = payload_json(&BinFrame::DltMsgs(MsgBatch {
            stream_id: 4,
            msgs: vec![],
        }));
        assert_eq!(json, r#"{"dlt_msgs":{"stream_id":4,"msgs":[]}}"#);
    }

    #[test]
    fn file_info_wire_shape() {
        let json = payload_json(&BinFrame::FileInfo(FileInfo { nr_msgs: 1234 }));
        assert_eq!(json, r#"{"file_info":{"nr_msgs":1234}}"#);
    }

    #[test]
    fn stream_info_decodes() {
        let frame = encode_frame(
            br#"{"stream_info":{"stream_id":2,"nr_stream_msgs":10,"nr_file_msgs_processed":50,"nr_file_msgs_total":100}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .unwrap();
        match decode_bin_frame_default(&frame).expect("stream info should decode") {
            BinFrame::StreamInfo(info) => {
                assert_eq!(info.stream_id, 2);
                assert_eq!(info.nr_file_msgs_total, 100);
            }
            _ => panic!("expected stream info"),
        }
    }
}
