// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

/// Size of the fixed header preceding every frame body.
pub const HEADER_LEN: usize = 8;

/// Protocol version carried in byte 0 of every header.
pub const PACKET_VERSION: u8 = 1;

/// Frame-level failures. This set is closed: anything else the stream can do
/// wrong is an I/O error and is reported through the endpoint instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body of {0} bytes cannot fit under the read buffer limit {1}")]
    Oversized(usize, usize),
    #[error("frame truncated: have {0} bytes, need {1}")]
    Truncated(usize, usize),
    #[error("unknown packet kind 0x{0:02x}")]
    BadKind(u8),
    #[error("malformed status line")]
    BadStatus,
}

/// On-the-wire header layout. Multi-byte fields are big-endian; they are
/// converted to host order exactly once, when a complete frame is sliced out
/// of the read buffer.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    pub version: u8,
    pub kind: u8,
    pub length: U16<BigEndian>,
    pub id: U32<BigEndian>,
}

impl PacketHeader {
    /// View the first [`HEADER_LEN`] bytes of `buf` as a header without
    /// copying. Fails only when fewer than [`HEADER_LEN`] bytes are present.
    pub fn peek(buf: &[u8]) -> Result<&Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len(), HEADER_LEN));
        }
        Self::ref_from_bytes(&buf[..HEADER_LEN])
            .map_err(|_| FrameError::Truncated(buf.len(), HEADER_LEN))
    }

    /// Body length advertised by this header.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.length.get() as usize
    }
}

/// The kinds of packet the conversation layer exchanges. The framer itself
/// treats byte 1 as opaque; only routing interprets it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Opens a conversation; the body is a service line.
    Request = 1,
    /// Slave to master traffic.
    Response = 2,
    /// Master to slave traffic.
    Update = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, FrameError> {
        match b {
            1 => Ok(PacketKind::Request),
            2 => Ok(PacketKind::Response),
            3 => Ok(PacketKind::Update),
            other => Err(FrameError::BadKind(other)),
        }
    }
}

/// One decoded frame. All fields are host order; callbacks never see wire
/// byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub kind: u8,
    pub id: u32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, id: u32, body: Bytes) -> Self {
        Self {
            version: PACKET_VERSION,
            kind: kind as u8,
            id,
            body,
        }
    }

    /// Encode header and body into one contiguous buffer, header fields in
    /// network byte order.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.body.len() > u16::MAX as usize {
            return Err(FrameError::Oversized(self.body.len(), u16::MAX as usize));
        }
        let header = PacketHeader {
            version: self.version,
            kind: self.kind,
            length: U16::new(self.body.len() as u16),
            id: U32::new(self.id),
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        out.put_slice(header.as_bytes());
        out.put_slice(&self.body);
        Ok(out.freeze())
    }

    /// Decode one complete frame from the front of `buf`. The caller is
    /// expected to have checked the advertised length already; a short
    /// buffer is reported as [`FrameError::Truncated`].
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = PacketHeader::peek(buf)?;
        let len = header.body_len();
        if buf.len() < HEADER_LEN + len {
            return Err(FrameError::Truncated(buf.len(), HEADER_LEN + len));
        }
        Ok(Self {
            version: header.version,
            kind: header.kind,
            id: header.id.get(),
            body: Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + len]),
        })
    }

    /// Total number of bytes this frame occupies on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}
