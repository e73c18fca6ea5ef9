//! Bus frames on a byte stream: a little-endian `u32` payload length, then
//! the bincode-encoded [`Message`]. Both ends reject frames over [`MAX_FRAME_LEN`].

use crate::protocol::Message;

/// Bytes in the length header.
pub const LEN_SIZE: usize = 4;
/// Largest payload a daemon or client accepts.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("serialize {kind}: {source}")]
    Encode {
        kind: &'static str,
        source: bincode::Error,
    },
    #[error("{kind} exceeds the frame limit of {} bytes", MAX_FRAME_LEN)]
    TooLarge { kind: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// The buffer ends inside the header or the payload.
    #[error("incomplete frame")]
    NeedMore,
    #[error("announced frame of {0} bytes exceeds the limit")]
    TooLarge(u32),
    #[error("malformed bus message: {0}")]
    Decode(#[from] bincode::Error),
}

/// Header plus payload for `msg`, ready to write.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let kind = msg.kind();
    let payload =
        bincode::serialize(msg).map_err(|source| FrameEncodeError::Encode { kind, source })?;
    match u32::try_from(payload.len()) {
        Ok(len) if len <= MAX_FRAME_LEN => {
            let mut frame = len.to_le_bytes().to_vec();
            frame.extend(payload);
            Ok(frame)
        }
        _ => Err(FrameEncodeError::TooLarge { kind }),
    }
}

/// Payload length from a frame header. Stream readers call this before
/// allocating the payload buffer.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    match u32::from_le_bytes(header) {
        len if len > MAX_FRAME_LEN => Err(FrameDecodeError::TooLarge(len)),
        len => Ok(len as usize),
    }
}

pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(payload)?)
}

/// Split the first bus frame off `buf`. Returns the message and how many bytes
/// it took; `NeedMore` while the frame is still arriving.
pub fn decode_frame(buf: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some((header, rest)) = buf.split_first_chunk::<LEN_SIZE>() else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = frame_len(*header)?;
    let payload = rest.get(..len).ok_or(FrameDecodeError::NeedMore)?;
    Ok((decode_payload(payload)?, LEN_SIZE + len))
}
