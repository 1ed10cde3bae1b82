// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, sync::Arc, time::Duration};

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::{
    proc::{ProcCore, ProcKind, Processor, ShutdownReason},
    utils::Timer,
    wire::{
        frame::{Packet, PacketKind},
        id::is_master,
        status::{SC_OK, SC_PROC_KEEPALIVE, SS_OK, SS_PROC_KEEPALIVE, format_status},
    },
};

/// How often the master side probes the peer. Must stay well under the
/// factory's connection timeout or healthy links would be reaped.
const PEER_PULSE: Duration = Duration::from_secs(30);

/// The distinguished conversation that keeps the whole link warm. It
/// probes at peer scope on its own schedule, so the factory sweep leaves
/// it alone.
pub struct KeepaliveProc {
    core: ProcCore,
    timer: OnceCell<Timer>,
}

impl KeepaliveProc {
    pub fn new(core: ProcCore) -> Self {
        Self {
            core,
            timer: OnceCell::new(),
        }
    }
}

impl Processor for KeepaliveProc {
    fn core(&self) -> &ProcCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ProcKind {
        ProcKind::Keepalive
    }

    fn start(&self) -> Result<()> {
        if !is_master(self.core.id) {
            return self.core.send_status(SC_OK, SS_OK);
        }

        self.core.send_request_line("keepalive")?;

        let peer = Arc::clone(&self.core.peer);
        let id = self.core.id;
        let timer = Timer::schedule(PEER_PULSE, move || {
            let probe = Packet::new(
                PacketKind::Update,
                id,
                format_status(SC_PROC_KEEPALIVE, SS_PROC_KEEPALIVE),
            );
            if let Err(e) = peer.write_packet(&probe) {
                debug!("peer {} keepalive probe failed: {e}", peer.id);
            }
        });
        let _ = self.timer.set(timer);
        Ok(())
    }

    fn on_shutdown(&self, _reason: ShutdownReason) {
        if let Some(timer) = self.timer.get() {
            timer.cancel();
        }
    }
}
