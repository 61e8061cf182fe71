/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Length-prefixed framing of borsh-serialized messages.
//!
//! Every frame is a little-endian `u32` body length followed by the borsh encoding of one message. Data
//! sockets carry [`BatchTuplePayload`](crate::types::BatchTuplePayload) frames and control sockets carry
//! [`ControlTuple`](crate::messages::ControlTuple) frames.

use std::io::{self, ErrorKind, Read, Write};

use borsh::{BorshDeserialize, BorshSerialize};

/// Frames longer than this are rejected when reading.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Serialize `msg` into a complete frame, length prefix included.
pub fn encode_frame<T: BorshSerialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let body = msg.try_to_vec().map_err(CodecError::Malformed)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write `msg` as one frame into `writer`, and flush it.
pub fn write_frame<W: Write, T: BorshSerialize>(writer: &mut W, msg: &T) -> Result<(), CodecError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from `reader` and deserialize it.
///
/// Returns [`CodecError::Closed`] if the peer closed the stream cleanly between two frames.
pub fn read_frame<R: Read, T: BorshDeserialize>(reader: &mut R) -> Result<T, CodecError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => (),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Err(CodecError::Closed),
        Err(err) => return Err(CodecError::Io(err)),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    T::try_from_slice(&body).map_err(CodecError::Malformed)
}

#[derive(Debug)]
pub enum CodecError {
    /// Reading or writing the underlying stream failed.
    Io(io::Error),

    /// The peer closed the stream between two frames.
    Closed,

    /// A frame's length exceeds [`MAX_FRAME_LEN`].
    FrameTooLarge(usize),

    /// A frame's body could not be (de)serialized.
    Malformed(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(value: io::Error) -> Self {
        CodecError::Io(value)
    }
}
