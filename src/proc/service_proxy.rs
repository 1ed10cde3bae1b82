// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, ensure};
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::{
    proc::{ProcCore, ProcKind, Processor, ShutdownReason, service_stub::ServiceStubProc},
    wire::frame::{Packet, PacketKind},
};

/// Requester-facing half of a relayed conversation. Created as a slave by
/// a request line of the form `service-proxy <peer-id> <service> [args]`;
/// it opens a [`ServiceStubProc`] towards the named peer and shovels
/// updates across.
pub struct ServiceProxyProc {
    core: ProcCore,
    counterpart: OnceCell<Weak<dyn Processor>>,
    orphan: AtomicBool,
}

impl ServiceProxyProc {
    pub fn new(core: ProcCore) -> Self {
        Self {
            core,
            counterpart: OnceCell::new(),
            orphan: AtomicBool::new(false),
        }
    }

    fn stub(&self) -> Option<Arc<dyn Processor>> {
        self.counterpart.get().and_then(Weak::upgrade)
    }

    fn open_stub(&self, line: &str) -> Result<()> {
        let mut parts = line.split_whitespace();
        parts.next(); // our own service name
        let target_id = parts.next().context("proxy request names no target peer")?;
        let inner: Vec<&str> = parts.collect();
        ensure!(!inner.is_empty(), "proxy request names no service");
        let inner = inner.join(" ");

        let session = self.core.session.upgrade().context("session is gone")?;
        let target = session
            .peers
            .lookup(target_id)
            .with_context(|| format!("unknown peer {target_id}"))?;

        let stub_proc = session.factory().create_master("service-stub", &target)?;
        let stub = stub_proc
            .as_any()
            .downcast_ref::<ServiceStubProc>()
            .context("service-stub maps to the wrong handler type")?;
        stub.prime(
            self.core.self_weak().context("proxy core is unbound")?,
            &inner,
        );
        stub_proc.start()?;

        let _ = self.counterpart.set(Arc::downgrade(&stub_proc));
        debug!(
            "proxy {}: relaying {inner:?} to peer {target_id}",
            self.core.id
        );
        Ok(())
    }
}

impl Processor for ServiceProxyProc {
    fn core(&self) -> &ProcCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ProcKind {
        ProcKind::ServiceProxy
    }

    fn start(&self) -> Result<()> {
        // no ack of our own: the provider's answer is relayed through
        Ok(())
    }

    fn on_packet(&self, pkt: &Packet) -> Result<()> {
        match PacketKind::try_from(pkt.kind) {
            Ok(PacketKind::Request) => {
                let line = String::from_utf8_lossy(&pkt.body);
                self.open_stub(&line)
            }
            Ok(PacketKind::Update) => {
                let Some(stub) = self.stub() else {
                    return Ok(());
                };
                stub.core().send_packet(PacketKind::Update, pkt.body.clone())
            }
            _ => Ok(()),
        }
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
        if let Some(stub) = self.stub() {
            stub.mark_orphan();
        }
    }
}
