// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use peermux::wire::{
    frame::{FrameError, HEADER_LEN, Packet, PacketHeader, PacketKind},
    id::{SLAVE_BIT, counterpart, is_master, master_id, print_id, slave_id},
    status::{
        SC_PROC_ALIVE, SC_PROC_KEEPALIVE, SS_PROC_KEEPALIVE, format_status, is_status,
        parse_status,
    },
};

use super::load_fixture;

#[test]
fn test_encode_matches_fixture() -> Result<()> {
    let expected = load_fixture("tests/fixtures/echo_packet.hex")?;

    let pkt = Packet::new(PacketKind::Response, 42, Bytes::from_static(b"hello"));
    let encoded = pkt.encode()?;

    assert_eq!(&encoded[..], &expected[..], "wire bytes mismatch");
    Ok(())
}

#[test]
fn test_decode_matches_fixture() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/echo_packet.hex")?;

    let header = PacketHeader::peek(&bytes)?;
    assert_eq!(header.version, 1);
    assert_eq!(header.kind, 2);
    assert_eq!(header.body_len(), 5);
    assert_eq!(header.id.get(), 42);

    let pkt = Packet::decode(&bytes)?;
    assert_eq!(pkt.version, 1);
    assert_eq!(pkt.kind, 2);
    assert_eq!(pkt.id, 42);
    assert_eq!(&pkt.body[..], b"hello");
    assert_eq!(pkt.wire_len(), HEADER_LEN + 5);
    Ok(())
}

#[test]
fn test_round_trip() -> Result<()> {
    let pkt = Packet::new(
        PacketKind::Update,
        0x8000_0007,
        Bytes::from_static(b"some opaque body"),
    );
    let decoded = Packet::decode(&pkt.encode()?)?;
    assert_eq!(decoded, pkt);
    Ok(())
}

#[test]
fn test_decode_truncated() {
    let pkt = Packet::new(PacketKind::Request, 1, Bytes::from_static(b"echo"));
    let bytes = pkt.encode().expect("encode");
    let err = Packet::decode(&bytes[..bytes.len() - 1]).expect_err("must be short");
    assert_eq!(err, FrameError::Truncated(bytes.len() - 1, bytes.len()));
}

#[test]
fn test_id_space_laws() {
    for x in [1u32, 7, 0x7fff_ffff] {
        assert!(is_master(master_id(x)));
        assert!(!is_master(slave_id(x)));
        // converting to the other side and back is the identity
        assert_eq!(master_id(counterpart(master_id(x))), master_id(x));
        assert_eq!(slave_id(counterpart(slave_id(x))), slave_id(x));
        assert_eq!(counterpart(counterpart(x)), x);
        assert_eq!(print_id(slave_id(x)), print_id(master_id(x)));
    }
    assert_eq!(slave_id(5), 5 | SLAVE_BIT);
}

#[test]
fn test_status_lines() -> Result<()> {
    let body = format_status(SC_PROC_KEEPALIVE, SS_PROC_KEEPALIVE);
    assert_eq!(&body[..], b"100 processor keep alive\n");

    let (code, text) = parse_status(&body)?;
    assert_eq!(code, SC_PROC_KEEPALIVE);
    assert_eq!(text, SS_PROC_KEEPALIVE);

    assert!(is_status(&body, SC_PROC_KEEPALIVE));
    assert!(!is_status(&body, SC_PROC_ALIVE));

    assert!(parse_status(b"10 x\n").is_err());
    assert!(parse_status(b"abc d\n").is_err());
    assert!(parse_status(b"1234\n").is_err());
    assert!(parse_status(b"").is_err());
    Ok(())
}

#[test]
fn test_packet_kind_closed_set() {
    assert_eq!(PacketKind::try_from(1).expect("request"), PacketKind::Request);
    assert_eq!(PacketKind::try_from(2).expect("response"), PacketKind::Response);
    assert_eq!(PacketKind::try_from(3).expect("update"), PacketKind::Update);
    assert_eq!(PacketKind::try_from(9), Err(FrameError::BadKind(9)));
}
