// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2019 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Frame layout
//!
//! All integers are big-endian. A legacy (version 1) header is 18 bytes:
//!
//! ```text
//! 0       1          2       4     12    14         18
//! | ver   | reserved | flags | seq | crc | body_len | body ...
//! ```
//!
//! A routable (version 2) header is 42 bytes and adds the originating
//! management server, the target host and the relaying management server:
//!
//! ```text
//! 0     1     2       4     12      20        28    36    38         42
//! | ver | res | flags | seq | ms_id | host_id | via | crc | body_len | body
//! ```
//!
//! The body is a JSON array of commands (requests) or answers (responses).
//! The CRC-16/ARC checksum covers the body only, so a relaying node may
//! rewrite `flags` and `via` without recomputing it.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use host_types::{HostId, MsId};

use crate::command::{Answer, Command, Commands, OnError};
use crate::error::ProtocolError;

pub const VERSION_LEGACY: u8 = 1;
/// First version whose frames carry enough addressing to be relayed.
pub const VERSION_ROUTABLE: u8 = 2;
pub const CURRENT_VERSION: u8 = VERSION_ROUTABLE;

pub const LEGACY_HEADER_LEN: usize = 18;
pub const ROUTABLE_HEADER_LEN: usize = 42;

/// Largest body accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub mod flags {
    pub const REQUEST: u16 = 0x01;
    pub const STOP_ON_ERROR: u16 = 0x02;
    pub const REVERT_ON_ERROR: u16 = 0x04;
    pub const IN_SEQUENCE: u16 = 0x08;
    pub const CONTROL: u16 = 0x10;
    /// Frame was relayed by a management server rather than sent by an agent
    pub const FROM_SERVER: u16 = 0x20;
}

const FLAGS_OFFSET: usize = 2;
const VIA_OFFSET: usize = 28;

fn header_len(version: u8) -> usize {
    if version >= VERSION_ROUTABLE {
        ROUTABLE_HEADER_LEN
    } else {
        LEGACY_HEADER_LEN
    }
}

fn on_error_flags(on_error: OnError) -> u16 {
    match on_error {
        OnError::Stop => flags::STOP_ON_ERROR,
        OnError::Revert => flags::STOP_ON_ERROR | flags::REVERT_ON_ERROR,
        OnError::Continue => 0,
    }
}

fn on_error_from_flags(f: u16) -> OnError {
    if f & flags::REVERT_ON_ERROR != 0 {
        OnError::Revert
    } else if f & flags::STOP_ON_ERROR != 0 {
        OnError::Stop
    } else {
        OnError::Continue
    }
}

/// The fixed-size part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u16,
    pub seq: u64,
    /// Zero on legacy frames
    pub ms_id: MsId,
    /// Zero on legacy frames
    pub host_id: HostId,
    /// Relaying management server, zero when not relayed
    pub via: MsId,
    pub crc: u16,
    pub body_len: usize,
}

impl FrameHeader {
    /// Parse a header from the front of `buf` without consuming it.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete header. The
    /// version byte is checked as soon as it is available, so a peer speaking
    /// an unknown version is rejected before anything else is read.
    pub fn peek(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
        let Some(&version) = buf.first() else {
            return Ok(None);
        };
        if version == 0 || version > CURRENT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let len = header_len(version);
        if buf.len() < len {
            return Ok(None);
        }

        let flags = BigEndian::read_u16(&buf[2..4]);
        let seq = BigEndian::read_u64(&buf[4..12]);

        let header = if version >= VERSION_ROUTABLE {
            FrameHeader {
                version,
                flags,
                seq,
                ms_id: BigEndian::read_u64(&buf[12..20]),
                host_id: BigEndian::read_u64(&buf[20..28]),
                via: BigEndian::read_u64(&buf[28..36]),
                crc: BigEndian::read_u16(&buf[36..38]),
                body_len: BigEndian::read_u32(&buf[38..42]) as usize,
            }
        } else {
            FrameHeader {
                version,
                flags,
                seq,
                ms_id: 0,
                host_id: 0,
                via: 0,
                crc: BigEndian::read_u16(&buf[12..14]),
                body_len: BigEndian::read_u32(&buf[14..18]) as usize,
            }
        };

        if header.body_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(header.body_len));
        }

        Ok(Some(header))
    }

    pub fn header_len(&self) -> usize {
        header_len(self.version)
    }

    /// Total size of the frame on the wire.
    pub fn frame_len(&self) -> usize {
        self.header_len() + self.body_len
    }

    pub fn is_request(&self) -> bool {
        self.flags & flags::REQUEST != 0
    }

    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }

    pub fn in_sequence(&self) -> bool {
        self.flags & flags::IN_SEQUENCE != 0
    }

    pub fn stop_on_error(&self) -> bool {
        self.flags & flags::STOP_ON_ERROR != 0
    }

    pub fn from_server(&self) -> bool {
        self.flags & flags::FROM_SERVER != 0
    }

    pub fn is_routable(&self) -> bool {
        self.version >= VERSION_ROUTABLE
    }

    fn write(&self, dst: &mut BytesMut) {
        dst.reserve(self.frame_len());
        dst.put_u8(self.version);
        dst.put_u8(0);
        dst.put_u16(self.flags);
        dst.put_u64(self.seq);
        if self.is_routable() {
            dst.put_u64(self.ms_id);
            dst.put_u64(self.host_id);
            dst.put_u64(self.via);
        }
        dst.put_u16(self.crc);
        dst.put_u32(self.body_len as u32);
    }
}

fn checksum(body: &[u8]) -> u16 {
    crc16::State::<crc16::ARC>::calculate(body)
}

/// A sequenced batch of commands addressed to a host.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub version: u8,
    pub seq: u64,
    /// Management server the request originates from
    pub ms_id: MsId,
    pub host_id: HostId,
    pub via: MsId,
    pub flags: u16,
    pub commands: Commands,
}

impl Request {
    pub fn new(seq: u64, ms_id: MsId, host_id: HostId, commands: Commands) -> Self {
        let mut flags = flags::REQUEST | on_error_flags(commands.on_error());
        if commands.in_sequence() {
            flags |= flags::IN_SEQUENCE;
        }
        Request {
            version: CURRENT_VERSION,
            seq,
            ms_id,
            host_id,
            via: 0,
            flags,
            commands,
        }
    }

    /// An out-of-band request (cancellation, cluster notification). Control
    /// requests are never queued behind in-sequence work.
    pub fn control(seq: u64, ms_id: MsId, host_id: HostId, cmd: Command) -> Self {
        let mut req = Request::new(seq, ms_id, host_id, Commands::single(cmd));
        req.flags = (req.flags | flags::CONTROL) & !flags::IN_SEQUENCE;
        req
    }

    /// Downgrade the frame for an agent that only speaks the legacy format.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Mark the request as sent by management server `via` rather than by an
    /// agent.
    pub fn relayed_by(mut self, via: MsId) -> Self {
        self.flags |= flags::FROM_SERVER;
        self.via = via;
        self
    }

    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }

    pub fn in_sequence(&self) -> bool {
        self.flags & flags::IN_SEQUENCE != 0
    }

    pub fn stop_on_error(&self) -> bool {
        self.flags & flags::STOP_ON_ERROR != 0
    }

    pub fn from_server(&self) -> bool {
        self.flags & flags::FROM_SERVER != 0
    }

    /// Whether this is a startup handshake, i.e. the first command is a
    /// startup command.
    pub fn is_startup(&self) -> bool {
        self.commands
            .to_commands()
            .first()
            .is_some_and(Command::is_startup)
    }
}

/// The answers to a [`Request`], keyed by the same sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub version: u8,
    pub seq: u64,
    pub ms_id: MsId,
    pub host_id: HostId,
    pub via: MsId,
    pub flags: u16,
    pub answers: Vec<Answer>,
}

impl Response {
    pub fn for_request(req: &Request, answers: Vec<Answer>) -> Self {
        Response {
            version: req.version,
            seq: req.seq,
            ms_id: req.ms_id,
            host_id: req.host_id,
            via: 0,
            flags: req.flags & !(flags::REQUEST | flags::FROM_SERVER),
            answers,
        }
    }

    pub fn relayed_by(mut self, via: MsId) -> Self {
        self.flags |= flags::FROM_SERVER;
        self.via = via;
        self
    }

    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }

    /// Whether every answer succeeded.
    pub fn is_successful(&self) -> bool {
        self.answers.iter().all(|a| a.result)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    pub fn seq(&self) -> u64 {
        match self {
            Frame::Request(r) => r.seq,
            Frame::Response(r) => r.seq,
        }
    }

    /// Serialize the frame onto the end of `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let (body, mut header) = match self {
            Frame::Request(r) => (
                serde_json::to_vec(r.commands.to_commands())?,
                FrameHeader {
                    version: r.version,
                    flags: r.flags,
                    seq: r.seq,
                    ms_id: r.ms_id,
                    host_id: r.host_id,
                    via: r.via,
                    crc: 0,
                    body_len: 0,
                },
            ),
            Frame::Response(r) => (
                serde_json::to_vec(&r.answers)?,
                FrameHeader {
                    version: r.version,
                    flags: r.flags,
                    seq: r.seq,
                    ms_id: r.ms_id,
                    host_id: r.host_id,
                    via: r.via,
                    crc: 0,
                    body_len: 0,
                },
            ),
        };

        if header.version == 0 || header.version > CURRENT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(body.len()));
        }

        header.crc = checksum(&body);
        header.body_len = body.len();
        header.write(dst);
        dst.extend_from_slice(&body);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl From<Request> for Frame {
    fn from(req: Request) -> Self {
        Frame::Request(req)
    }
}

impl From<Response> for Frame {
    fn from(resp: Response) -> Self {
        Frame::Response(resp)
    }
}

/// A complete, undecoded frame as read off the wire.
///
/// Routing decisions only need the header, so relaying nodes pass these along
/// without touching the body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub bytes: Bytes,
}

impl RawFrame {
    /// Build a raw frame from a buffer holding exactly one frame.
    pub fn from_bytes(bytes: Bytes) -> Result<RawFrame, ProtocolError> {
        let header = FrameHeader::peek(&bytes)?.ok_or(ProtocolError::Truncated {
            needed: LEGACY_HEADER_LEN,
            available: bytes.len(),
        })?;
        if bytes.len() < header.frame_len() {
            return Err(ProtocolError::Truncated {
                needed: header.frame_len(),
                available: bytes.len(),
            });
        }
        Ok(RawFrame { header, bytes })
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn host_id(&self) -> HostId {
        self.header.host_id
    }

    fn body(&self) -> &[u8] {
        let start = self.header.header_len();
        &self.bytes[start..start + self.header.body_len]
    }

    /// Verify the checksum and decode the body.
    pub fn decode(&self) -> Result<Frame, ProtocolError> {
        let body = self.body();
        let actual = checksum(body);
        if actual != self.header.crc {
            return Err(ProtocolError::ChecksumMismatch {
                expected: self.header.crc,
                actual,
            });
        }

        let h = &self.header;
        if h.is_request() {
            let list: Vec<Command> = serde_json::from_slice(body)?;
            let mut commands = Commands::new(on_error_from_flags(h.flags));
            for cmd in list {
                commands.add(cmd);
            }
            Ok(Frame::Request(Request {
                version: h.version,
                seq: h.seq,
                ms_id: h.ms_id,
                host_id: h.host_id,
                via: h.via,
                flags: h.flags,
                commands,
            }))
        } else {
            let answers: Vec<Answer> = serde_json::from_slice(body)?;
            Ok(Frame::Response(Response {
                version: h.version,
                seq: h.seq,
                ms_id: h.ms_id,
                host_id: h.host_id,
                via: h.via,
                flags: h.flags,
                answers,
            }))
        }
    }

    /// Copy of the frame marked as relayed through management server `via`.
    ///
    /// Only routable frames can be relayed.
    pub fn mark_forwarded(&self, via: MsId) -> Result<Bytes, ProtocolError> {
        if !self.header.is_routable() {
            return Err(ProtocolError::UnsupportedVersion(self.header.version));
        }
        let mut buf = BytesMut::from(&self.bytes[..]);
        let f = self.header.flags | flags::FROM_SERVER;
        BigEndian::write_u16(&mut buf[FLAGS_OFFSET..FLAGS_OFFSET + 2], f);
        BigEndian::write_u64(&mut buf[VIA_OFFSET..VIA_OFFSET + 8], via);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::names;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn request() -> Request {
        let mut cmds = Commands::new(OnError::Stop);
        cmds.add(Command::new("StartVmCommand", serde_json::json!({"vm": 3})));
        cmds.add(Command::ping(5).in_sequence());
        Request::new(77, 1, 5, cmds)
    }

    #[test]
    fn test_request_flags() {
        let req = request();
        assert!(req.stop_on_error());
        assert!(req.in_sequence());
        assert!(!req.is_control());

        let ctl = Request::control(78, 1, 5, Command::cancel(77, "timeout"));
        assert!(ctl.is_control());
        assert!(!ctl.in_sequence());
    }

    #[test]
    fn test_routable_header_layout() {
        let bytes = Frame::Request(request()).to_bytes().expect("encode");
        let header = FrameHeader::peek(&bytes).expect("peek").expect("complete");
        assert_eq!(header.version, VERSION_ROUTABLE);
        assert_eq!(header.seq, 77);
        assert_eq!(header.ms_id, 1);
        assert_eq!(header.host_id, 5);
        assert_eq!(header.frame_len(), bytes.len());
        assert_eq!(header.header_len(), ROUTABLE_HEADER_LEN);
    }

    #[test]
    fn test_legacy_frame_decodes_without_addressing() {
        let req = request().with_version(VERSION_LEGACY);
        let bytes = Frame::Request(req.clone()).to_bytes().expect("encode");
        let raw = RawFrame::from_bytes(bytes).expect("raw");
        assert_eq!(raw.header.header_len(), LEGACY_HEADER_LEN);

        let Frame::Request(decoded) = raw.decode().expect("decode") else {
            panic!("expected a request");
        };
        assert_eq!(decoded.seq, 77);
        assert_eq!(decoded.host_id, 0);
        assert_eq!(decoded.commands.to_commands(), req.commands.to_commands());
        assert!(raw.mark_forwarded(2).is_err());
    }

    #[test]
    fn test_peek_rejects_unknown_versions() {
        assert!(matches!(
            FrameHeader::peek(&[0]),
            Err(ProtocolError::UnsupportedVersion(0))
        ));
        assert!(matches!(
            FrameHeader::peek(&[9, 0, 0]),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
        assert!(matches!(FrameHeader::peek(&[2, 0, 0]), Ok(None)));
        assert!(matches!(FrameHeader::peek(&[]), Ok(None)));
    }

    #[test]
    fn test_checksum_mismatch_is_detected() {
        let bytes = Frame::Request(request()).to_bytes().expect("encode");
        let mut corrupt = BytesMut::from(&bytes[..]);
        let last = corrupt.len() - 2;
        corrupt[last] ^= 0xff;
        let raw = RawFrame::from_bytes(corrupt.freeze()).expect("raw");
        assert!(matches!(
            raw.decode(),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_mark_forwarded_keeps_body_valid() {
        let bytes = Frame::Request(request()).to_bytes().expect("encode");
        let raw = RawFrame::from_bytes(bytes).expect("raw");
        let relayed = RawFrame::from_bytes(raw.mark_forwarded(4).expect("relay")).expect("raw");
        assert!(relayed.header.from_server());
        assert_eq!(relayed.header.via, 4);
        assert!(relayed.decode().is_ok());
    }

    #[test]
    fn test_response_mirrors_request() {
        let req = request();
        let answers: Vec<Answer> = req
            .commands
            .to_commands()
            .iter()
            .map(|c| Answer::success(c, Value::Null))
            .collect();
        let resp = Response::for_request(&req, answers);
        let raw = RawFrame::from_bytes(Frame::Response(resp).to_bytes().expect("encode"))
            .expect("raw");
        assert!(!raw.header.is_request());

        let Frame::Response(decoded) = raw.decode().expect("decode") else {
            panic!("expected a response");
        };
        assert_eq!(decoded.seq, 77);
        assert_eq!(decoded.answers.len(), 2);
        assert_eq!(decoded.answers[1].name, names::PING);
        assert!(decoded.is_successful());
    }
}
