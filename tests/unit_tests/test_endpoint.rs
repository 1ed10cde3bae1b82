// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use bytes::Bytes;
use peermux::{
    io::{
        endpoint::{Direction, IoHandler, PacketIo},
        event::IoEvent,
    },
    wire::frame::{HEADER_LEN, Packet, PacketKind},
};

use super::load_fixture;

/// Collects everything the endpoint dispatches; optionally frees the
/// endpoint from inside the packet callback.
#[derive(Default)]
struct Recorder {
    pkts: Mutex<Vec<Packet>>,
    errors: Mutex<Vec<IoEvent>>,
    free_on_packet: bool,
    saw_live_endpoint: AtomicBool,
}

impl Recorder {
    fn freeing() -> Self {
        Self {
            free_on_packet: true,
            ..Self::default()
        }
    }

    fn packets(&self) -> Vec<Packet> {
        self.pkts.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<IoEvent> {
        self.errors.lock().unwrap().clone()
    }
}

impl IoHandler for Recorder {
    fn on_packet(&self, io: &PacketIo, pkt: Packet) {
        self.pkts.lock().unwrap().push(pkt);
        if self.free_on_packet {
            io.free();
            // destruction must wait until dispatch unwinds
            self.saw_live_endpoint
                .store(!io.is_freed(), Ordering::SeqCst);
        }
    }

    fn on_error(&self, _io: &PacketIo, what: IoEvent) {
        self.errors.lock().unwrap().push(what);
    }
}

#[test]
fn test_single_packet_dispatch() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/echo_packet.hex")?;
    let io = PacketIo::loopback(Direction::Incoming);
    let recorder = Arc::new(Recorder::default());
    io.set_handler(recorder.clone());

    io.feed(&bytes);

    let pkts = recorder.packets();
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].version, 1);
    assert_eq!(pkts[0].kind, 2);
    assert_eq!(pkts[0].id, 42);
    assert_eq!(&pkts[0].body[..], b"hello");
    assert_eq!(io.buffered_len(), 0, "dispatch must consume the frame");
    Ok(())
}

#[test]
fn test_partial_then_complete() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/echo_packet.hex")?;
    let io = PacketIo::loopback(Direction::Incoming);
    let recorder = Arc::new(Recorder::default());
    io.set_handler(recorder.clone());

    // header plus "he": a frame boundary has not been reached
    io.feed(&bytes[..HEADER_LEN + 2]);
    assert_eq!(recorder.packets().len(), 0);

    io.feed(&bytes[HEADER_LEN + 2..]);
    let pkts = recorder.packets();
    assert_eq!(pkts.len(), 1);
    assert_eq!(&pkts[0].body[..], b"hello");
    Ok(())
}

#[test]
fn test_two_packets_one_buffer() -> Result<()> {
    let first = Packet::new(PacketKind::Update, 7, Bytes::from_static(b"one"));
    let second = Packet::new(PacketKind::Update, 8, Bytes::from_static(b"two"));
    let mut wire = first.encode()?.to_vec();
    wire.extend_from_slice(&second.encode()?);

    let io = PacketIo::loopback(Direction::Incoming);
    let recorder = Arc::new(Recorder::default());
    io.set_handler(recorder.clone());

    io.feed(&wire);

    let pkts = recorder.packets();
    assert_eq!(pkts.len(), 2);
    assert_eq!(pkts[0].id, 7);
    assert_eq!(pkts[1].id, 8);
    assert_eq!(io.buffered_len(), 0);
    Ok(())
}

#[test]
fn test_self_destruct_in_callback() -> Result<()> {
    let first = Packet::new(PacketKind::Update, 7, Bytes::from_static(b"one"));
    let second = Packet::new(PacketKind::Update, 8, Bytes::from_static(b"two"));
    let mut wire = first.encode()?.to_vec();
    wire.extend_from_slice(&second.encode()?);

    let io = PacketIo::loopback(Direction::Incoming);
    let recorder = Arc::new(Recorder::freeing());
    io.set_handler(recorder.clone());

    io.feed(&wire);

    // the first callback freed the endpoint; the second frame must die with it
    assert_eq!(recorder.packets().len(), 1);
    assert!(recorder.saw_live_endpoint.load(Ordering::SeqCst));
    assert!(io.is_freed());

    io.feed(&first.encode()?);
    assert_eq!(recorder.packets().len(), 1, "a freed endpoint dispatches nothing");

    // freeing again is harmless
    io.free();
    assert!(io.is_freed());
    Ok(())
}

#[test]
fn test_write_packet_wire_encoding() -> Result<()> {
    let expected = load_fixture("tests/fixtures/echo_packet.hex")?;
    let io = PacketIo::loopback(Direction::Outgoing);

    io.write_packet(&Packet::new(
        PacketKind::Response,
        42,
        Bytes::from_static(b"hello"),
    ))?;

    let written = io.take_written();
    assert_eq!(written.len(), 1);
    assert_eq!(&written[0][..], &expected[..]);
    Ok(())
}

#[test]
fn test_write_after_free_is_noop() -> Result<()> {
    let io = PacketIo::loopback(Direction::Outgoing);
    io.free();
    io.write_packet(&Packet::new(PacketKind::Update, 1, Bytes::new()))?;
    assert!(io.take_written().is_empty());
    Ok(())
}

#[test]
fn test_try_read_drains_early_packets() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/echo_packet.hex")?;
    let io = PacketIo::loopback(Direction::Incoming);

    // no handler yet: the frame stays buffered
    io.feed(&bytes);
    assert_eq!(io.buffered_len(), bytes.len());

    let recorder = Arc::new(Recorder::default());
    io.set_handler(recorder.clone());
    assert_eq!(recorder.packets().len(), 0);

    io.try_read();
    assert_eq!(recorder.packets().len(), 1);
    assert_eq!(io.buffered_len(), 0);
    Ok(())
}

#[test]
fn test_oversized_frame_is_stream_error() {
    // limit low enough that a u16 length can overshoot it
    let io = PacketIo::loopback_with_limit(Direction::Incoming, 16);
    let recorder = Arc::new(Recorder::default());
    io.set_handler(recorder.clone());

    let mut wire = Vec::new();
    wire.extend_from_slice(&[1, 3]); // version, kind
    wire.extend_from_slice(&100u16.to_be_bytes());
    wire.extend_from_slice(&9u32.to_be_bytes());
    io.feed(&wire);

    assert_eq!(recorder.packets().len(), 0);
    assert_eq!(recorder.errors(), vec![IoEvent::READ | IoEvent::OTHER]);
}
