// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, sync::Mutex};

use anyhow::{Result, ensure};
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    proc::{ProcCore, Processor},
    utils::lock,
    wire::{
        frame::{Packet, PacketKind},
        id::is_master,
        status::{SC_OK, SS_OK, parse_status},
    },
};

/// Mirror conversation: the master sends payload updates, the slave sends
/// each body straight back. Doubles as the link check in the demo binary.
pub struct EchoProc {
    core: ProcCore,
    last_reply: Mutex<Option<Bytes>>,
    replied: Notify,
}

impl EchoProc {
    pub fn new(core: ProcCore) -> Self {
        Self {
            core,
            last_reply: Mutex::new(None),
            replied: Notify::new(),
        }
    }

    /// Master side: send one payload to be echoed.
    pub fn send_ping(&self, payload: &[u8]) -> Result<()> {
        ensure!(is_master(self.core.id), "only the initiator sends pings");
        self.core
            .send_packet(PacketKind::Update, Bytes::copy_from_slice(payload))
    }

    /// Master side: the next echoed payload, or `None` once the
    /// conversation is gone.
    pub async fn wait_reply(&self) -> Option<Bytes> {
        loop {
            if let Some(b) = lock(&self.last_reply).take() {
                return Some(b);
            }
            if self.core.is_reaped() {
                return None;
            }
            self.replied.notified().await;
        }
    }
}

impl Processor for EchoProc {
    fn core(&self) -> &ProcCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn start(&self) -> Result<()> {
        if is_master(self.core.id) {
            self.core.send_request_line("echo")
        } else {
            self.core.send_status(SC_OK, SS_OK)
        }
    }

    fn on_packet(&self, pkt: &Packet) -> Result<()> {
        if is_master(self.core.id) {
            // the conversation ack is not an echo
            if let Ok((code, _)) = parse_status(&pkt.body) {
                debug!("echo({}): status {code}", self.core.id);
                return Ok(());
            }
            *lock(&self.last_reply) = Some(pkt.body.clone());
            self.replied.notify_one();
            return Ok(());
        }

        match PacketKind::try_from(pkt.kind) {
            // the initiation line carries nothing to echo
            Ok(PacketKind::Request) => Ok(()),
            _ => self.core.send_packet(PacketKind::Response, pkt.body.clone()),
        }
    }

    fn on_shutdown(&self, _reason: crate::proc::ShutdownReason) {
        // unblock a master stuck in wait_reply
        self.replied.notify_one();
    }
}
