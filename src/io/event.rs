// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bitflags::bitflags;

bitflags! {
    /// What went wrong on an endpoint, delivered to
    /// [`IoHandler::on_error`](crate::io::endpoint::IoHandler::on_error).
    /// READ/WRITE name the side, the remaining bits the cause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvent: u8 {
        const READ    = 0b0000_0001;
        const WRITE   = 0b0000_0010;
        const EOF     = 0b0000_0100;
        const TIMEOUT = 0b0000_1000;
        const OTHER   = 0b0001_0000;
    }
}
