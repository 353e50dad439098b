// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2019 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Stream codec for agent and peer connections.
//!
//! Decoding yields [`RawFrame`]s so that a relaying node can forward a frame
//! by header alone. Encoding accepts either a [`Frame`] or pre-encoded frame
//! bytes.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameHeader, MAX_FRAME_SIZE, RawFrame};

#[derive(Debug, Clone)]
pub struct AgentCodec {
    max_frame: usize,
}

impl AgentCodec {
    pub fn new() -> Self {
        AgentCodec {
            max_frame: MAX_FRAME_SIZE,
        }
    }

    /// Codec rejecting bodies larger than `max_frame` (capped at
    /// [`MAX_FRAME_SIZE`]).
    pub fn with_max_frame(max_frame: usize) -> Self {
        AgentCodec {
            max_frame: max_frame.min(MAX_FRAME_SIZE),
        }
    }
}

impl Default for AgentCodec {
    fn default() -> Self {
        AgentCodec::new()
    }
}

impl Decoder for AgentCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        let Some(header) = FrameHeader::peek(&src[..])? else {
            return Ok(None);
        };
        if header.body_len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge(header.body_len));
        }

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(frame_len).freeze();
        Ok(Some(RawFrame { header, bytes }))
    }
}

impl Encoder<Frame> for AgentCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        frame.encode(dst)
    }
}

impl Encoder<Bytes> for AgentCodec {
    type Error = ProtocolError;

    fn encode(&mut self, bytes: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
