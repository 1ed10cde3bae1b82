// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-level building blocks: the fixed packet header, the conversation-id
//! space and the status lines carried in control packet bodies.

/// Fixed 8-byte packet header and the decoded [`Packet`](frame::Packet).
pub mod frame;
/// MASTER/SLAVE partition of the 32-bit conversation-id space.
pub mod id;
/// `"<code> <text>\n"` status lines used by the keepalive sub-protocol.
pub mod status;
