// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

// Tests are allowed to panic and use unwrap/expect
#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use serde_json::{Value, json};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use agent_protocol::frame::{self, VERSION_LEGACY};
use agent_protocol::{
    AgentCodec, Answer, Command, Commands, Frame, OnError, ProtocolError, RawFrame, Request,
    Response,
};

#[derive(Debug, Clone)]
struct ArbitraryBatch {
    names: Vec<String>,
    on_error: OnError,
    in_sequence: bool,
}

impl Arbitrary for ArbitraryBatch {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = usize::arbitrary(g) % 16 + 1;
        let names = (0..len)
            .map(|i| format!("Command{}{}", i, u16::arbitrary(g)))
            .collect();
        let on_error = *g
            .choose(&[OnError::Stop, OnError::Revert, OnError::Continue])
            .unwrap_or(&OnError::Stop);
        ArbitraryBatch {
            names,
            on_error,
            in_sequence: bool::arbitrary(g),
        }
    }
}

impl ArbitraryBatch {
    fn commands(&self) -> Commands {
        let mut cmds = Commands::new(self.on_error);
        for (i, name) in self.names.iter().enumerate() {
            let mut cmd = Command::new(name.clone(), json!({ "index": i }));
            if self.in_sequence {
                cmd = cmd.in_sequence();
            }
            cmds.add(cmd);
        }
        cmds
    }
}

fn decode_one(bytes: &[u8]) -> Frame {
    let mut buf = BytesMut::from(bytes);
    let raw = AgentCodec::new()
        .decode(&mut buf)
        .expect("decode")
        .expect("complete frame");
    assert!(buf.is_empty());
    raw.decode().expect("body")
}

// ---- Test 1 ----
// A batch of N commands survives the trip through a request frame with its
// order, count and policy intact, and the response carries N answers.
#[quickcheck]
fn prop_request_round_trip_preserves_batch(batch: ArbitraryBatch, seq: u64, host: u64) -> bool {
    let cmds = batch.commands();
    let req = Request::new(seq, 1, host, cmds.clone());

    let mut buf = BytesMut::new();
    AgentCodec::new()
        .encode(Frame::Request(req), &mut buf)
        .expect("encode");

    let Frame::Request(decoded) = decode_one(&buf) else {
        return false;
    };
    let mut received = decoded.commands;
    if received.to_commands() != cmds.to_commands() || received.on_error() != batch.on_error {
        return false;
    }

    let answers: Vec<Answer> = received
        .to_commands()
        .iter()
        .map(|c| Answer::success(c, Value::Null))
        .collect();
    let n = answers.len();
    if received.set_answers(answers).is_err() {
        return false;
    }

    let resp = Response::for_request(
        &Request::new(seq, 1, host, received.clone()),
        received.answers().unwrap_or_default().to_vec(),
    );
    let mut buf = BytesMut::new();
    AgentCodec::new()
        .encode(Frame::Response(resp), &mut buf)
        .expect("encode");

    match decode_one(&buf) {
        Frame::Response(r) => r.seq == seq && r.answers.len() == n && n == batch.names.len(),
        Frame::Request(_) => false,
    }
}

// ---- Test 2 ----
#[test]
fn test_partial_frames_wait_for_more_bytes() {
    let frame = Frame::Request(Request::new(1, 1, 2, Commands::single(Command::ping(2))));
    let bytes = frame.to_bytes().expect("encode");

    let mut codec = AgentCodec::new();
    let mut buf = BytesMut::new();
    for chunk in bytes.chunks(7) {
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(chunk);
    }
    let raw = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(raw.seq(), 1);
    assert_eq!(raw.host_id(), 2);
}

// ---- Test 3 ----
#[test]
fn test_unsupported_version_is_rejected() {
    let mut buf = BytesMut::from(&[7u8, 0, 0, 0][..]);
    let err = AgentCodec::new().decode(&mut buf).expect_err("version");
    assert!(matches!(err, ProtocolError::UnsupportedVersion(7)));
}

// ---- Test 4 ----
#[test]
fn test_oversized_frame_is_rejected() {
    let frame = Frame::Request(Request::new(
        1,
        1,
        2,
        Commands::single(Command::new("Big", json!({ "blob": "x".repeat(256) }))),
    ));
    let mut buf = BytesMut::from(&frame.to_bytes().expect("encode")[..]);
    let err = AgentCodec::with_max_frame(64)
        .decode(&mut buf)
        .expect_err("too large");
    assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
}

// ---- Test 5 ----
#[test]
fn test_legacy_and_routable_frames_share_a_stream() {
    let legacy = Frame::Request(
        Request::new(10, 0, 0, Commands::single(Command::ping(0))).with_version(VERSION_LEGACY),
    );
    let routable = Frame::Request(Request::new(11, 3, 4, Commands::single(Command::ping(4))));

    let mut buf = BytesMut::new();
    let mut codec = AgentCodec::new();
    codec.encode(legacy, &mut buf).expect("encode");
    codec.encode(routable, &mut buf).expect("encode");

    let first = codec.decode(&mut buf).expect("decode").expect("frame");
    let second = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(first.header.version, frame::VERSION_LEGACY);
    assert_eq!(second.header.version, frame::VERSION_ROUTABLE);
    assert_eq!(second.header.ms_id, 3);
    assert!(buf.is_empty());
}

// ---- Test 6 ----
#[tokio::test]
async fn test_framed_stream_carries_relayed_bytes() {
    let (client, server) = tokio::io::duplex(4096);
    let mut writer = FramedWrite::new(client, AgentCodec::new());
    let mut reader = FramedRead::new(server, AgentCodec::new());

    let req = Request::new(42, 1, 9, Commands::single(Command::check_health()));
    let raw = RawFrame::from_bytes(Frame::Request(req).to_bytes().expect("encode")).expect("raw");
    writer
        .send(raw.mark_forwarded(2).expect("relay"))
        .await
        .expect("send");

    let received = reader.next().await.expect("frame").expect("decode");
    assert!(received.header.from_server());
    assert_eq!(received.header.via, 2);
    assert_eq!(received.seq(), 42);
}
