// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use thiserror::Error;

/// Errors raised while building, encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame version is older or newer than anything this side speaks.
    /// The connection carrying it must be dropped.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// A frame announced a payload larger than the configured maximum.
    #[error("frame payload of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// The payload checksum did not match the header.
    #[error("payload checksum mismatch: header {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Fewer bytes than the header announced were supplied.
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// A batch received a different number of answers than it had commands.
    #[error("expected {expected} answers but received {actual}")]
    AnswerCountMismatch { expected: usize, actual: usize },

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
