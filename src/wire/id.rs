// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 32-bit conversation-id space is split in half by the most
//! significant bit: MASTER ids (the initiating side) have it clear, SLAVE
//! ids (the responding side) have it set. Each side allocates ids
//! monotonically within its own half per peer, so both halves of a
//! conversation can live in the same table without colliding. Id 0 is
//! never valid.

/// Bit that marks an id as belonging to the SLAVE half of the space.
pub const SLAVE_BIT: u32 = 1 << 31;

/// Normalise `id` into the MASTER half.
#[inline]
pub const fn master_id(id: u32) -> u32 {
    id & !SLAVE_BIT
}

/// Normalise `id` into the SLAVE half.
#[inline]
pub const fn slave_id(id: u32) -> u32 {
    id | SLAVE_BIT
}

/// Map an id to its counterpart on the other side of the conversation.
#[inline]
pub const fn counterpart(id: u32) -> u32 {
    id ^ SLAVE_BIT
}

#[inline]
pub const fn is_master(id: u32) -> bool {
    id & SLAVE_BIT == 0
}

/// Id with the side bit stripped, as shown in traces.
#[inline]
pub const fn print_id(id: u32) -> u32 {
    id & !SLAVE_BIT
}
