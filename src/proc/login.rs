// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal login handshake: the client opens `recv-login` on the server,
//! the server acknowledges with `200 OK`, both halves finish. There is no
//! credential exchange here; sessions that need one hang it off their own
//! registered handler.

use std::any::Any;

use anyhow::Result;
use tracing::info;

use crate::{
    proc::{ProcCore, Processor, ShutdownReason},
    wire::{
        frame::{Packet, PacketKind},
        status::{SC_OK, SS_OK, parse_status},
    },
};

/// Client-side half, registered as `send-login`.
pub struct SendLoginProc {
    core: ProcCore,
}

impl SendLoginProc {
    pub fn new(core: ProcCore) -> Self {
        Self { core }
    }
}

impl Processor for SendLoginProc {
    fn core(&self) -> &ProcCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn start(&self) -> Result<()> {
        self.core.send_request_line("recv-login")
    }

    fn on_packet(&self, pkt: &Packet) -> Result<()> {
        if let Ok((SC_OK, _)) = parse_status(&pkt.body) {
            info!("logged in to peer {}", self.core.peer.id);
            self.shutdown(ShutdownReason::Done);
        }
        Ok(())
    }
}

/// Server-side half, registered as `recv-login`.
pub struct RecvLoginProc {
    core: ProcCore,
}

impl RecvLoginProc {
    pub fn new(core: ProcCore) -> Self {
        Self { core }
    }
}

impl Processor for RecvLoginProc {
    fn core(&self) -> &ProcCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn on_packet(&self, pkt: &Packet) -> Result<()> {
        if matches!(PacketKind::try_from(pkt.kind), Ok(PacketKind::Request)) {
            info!("peer {} logged in", self.core.peer.id);
            self.core.send_status(SC_OK, SS_OK)?;
            self.shutdown(ShutdownReason::Done);
        }
        Ok(())
    }
}
