//! Codec for encoding/decoding control frames

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a frame to bytes
///
/// Format: [length: u32 BE][payload: bincode serialized message]
pub fn encode_frame<M: Serialize>(msg: &M) -> Result<Bytes, CodecError> {
    let payload = bincode::serialize(msg)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a frame from bytes
///
/// Returns Ok(Some(message)) if a complete frame was decoded,
/// Ok(None) if more data is needed,
/// Err on error
pub fn decode_frame<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&buf[..4]);
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }

    if buf.len() < 4 + length {
        // Reserve so the next read can complete the frame in one go
        buf.reserve(4 + length - buf.len());
        return Ok(None);
    }

    buf.advance(4);
    let frame = buf.split_to(length);

    Ok(Some(bincode::deserialize(&frame)?))
}

/// Try to decode every complete frame in the buffer
pub fn decode_all<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Vec<M>, CodecError> {
    let mut messages = Vec::new();

    while let Some(msg) = decode_frame(buf)? {
        messages.push(msg);
    }

    Ok(messages)
}

/// Length-prefixed bincode codec for use with `tokio_util::codec::Framed`
///
/// Defaults to [`ControlMessage`]; the relay bind preamble uses
/// `ControlCodec<RelayBind>`.
pub struct ControlCodec<T = ControlMessage> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ControlCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ControlCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for ControlCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        decode_frame(src)
    }
}

impl<T: Serialize> Encoder<T> for ControlCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = encode_frame(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
