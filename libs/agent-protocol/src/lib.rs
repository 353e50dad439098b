// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2019 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Agent protocol
//!
//! Management servers and host agents exchange batches of opaque commands and
//! answers over a persistent, ordered stream. Each batch travels inside a
//! sequenced frame:
//!
//! - [`command`] - `Command`, `Answer` and the `Commands` batch with its
//!   error-handling policy
//! - [`frame`] - `Request`/`Response` frames, header layout and peeking
//! - [`codec`] - a `tokio_util` codec splitting a byte stream into raw frames
//!
//! Frames at [`frame::VERSION_ROUTABLE`] or above carry the originating
//! management server and the target host so that a cluster peer can relay
//! them without decoding the payload.

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;

pub use codec::AgentCodec;
pub use command::{Answer, Command, Commands, OnError};
pub use error::ProtocolError;
pub use frame::{Frame, FrameHeader, RawFrame, Request, Response};
