// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    sync::{
        Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;

use crate::{
    proc::{ProcCore, ProcKind, Processor, ShutdownReason},
    wire::frame::{Packet, PacketKind},
};

/// Provider-facing half of a relayed conversation: a master towards the
/// target peer, opened with the service line the proxy handed over.
/// Everything the provider answers is pushed back through the proxy.
pub struct ServiceStubProc {
    core: ProcCore,
    counterpart: OnceCell<Weak<dyn Processor>>,
    orphan: AtomicBool,
    service_line: OnceCell<String>,
}

impl ServiceStubProc {
    pub fn new(core: ProcCore) -> Self {
        Self {
            core,
            counterpart: OnceCell::new(),
            orphan: AtomicBool::new(false),
            service_line: OnceCell::new(),
        }
    }

    /// Must run before `start()`: which service to open on the target and
    /// which proxy relays the answers.
    pub fn prime(&self, proxy: Weak<dyn Processor>, line: &str) {
        let _ = self.counterpart.set(proxy);
        let _ = self.service_line.set(line.to_owned());
    }

    fn proxy(&self) -> Option<std::sync::Arc<dyn Processor>> {
        self.counterpart.get().and_then(Weak::upgrade)
    }
}

impl Processor for ServiceStubProc {
    fn core(&self) -> &ProcCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ProcKind {
        ProcKind::ServiceStub
    }

    fn start(&self) -> Result<()> {
        let line = self
            .service_line
            .get()
            .context("stub started before prime()")?;
        self.core.send_request_line(line)
    }

    fn on_packet(&self, pkt: &Packet) -> Result<()> {
        let Some(proxy) = self.proxy() else {
            // the requester side is gone; the sweep will reap us
            return Ok(());
        };
        proxy
            .core()
            .send_packet(PacketKind::Response, pkt.body.clone())
    }

    fn is_orphan(&self) -> bool {
        if self.orphan.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.counterpart.get(), Some(w) if w.upgrade().is_none())
    }

    fn mark_orphan(&self) {
        self.orphan.store(true, Ordering::Release);
    }

    fn on_shutdown(&self, _reason: ShutdownReason) {
        if let Some(proxy) = self.proxy() {
            proxy.mark_orphan();
        }
    }
}
