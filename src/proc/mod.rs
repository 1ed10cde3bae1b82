// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Conversation handlers ("processors") and their lifecycle manager.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    peer::Peer,
    proc::factory::ProcFactory,
    session::Session,
    wire::{
        frame::{Packet, PacketKind},
        id::{is_master, print_id},
        status::{
            SC_PROC_ALIVE, SC_PROC_DEAD, SC_PROC_KEEPALIVE, SS_PROC_ALIVE, SS_PROC_DEAD,
            SS_PROC_KEEPALIVE, format_status, parse_status,
        },
    },
};

pub mod echo;
pub mod factory;
pub mod keepalive;
pub mod login;
pub mod service_proxy;
pub mod service_stub;

/// Why a conversation was torn down. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ran to completion.
    Done,
    /// The peer's connection died.
    Netdown,
    /// Keepalive probe went unanswered past the hard deadline.
    Timeout,
    /// The handshake never completed.
    ConTimeout,
    /// The peer declared the conversation closed.
    Remote,
    /// A frame this handler could not make sense of.
    BadPacket,
    NotSet,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::Done => "done",
            ShutdownReason::Netdown => "netdown",
            ShutdownReason::Timeout => "timeout",
            ShutdownReason::ConTimeout => "connect timeout",
            ShutdownReason::Remote => "remote",
            ShutdownReason::BadPacket => "bad packet",
            ShutdownReason::NotSet => "not set",
        })
    }
}

/// How the keepalive sweep treats a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Plain,
    /// The distinguished peer-scope liveness conversation; the sweep skips
    /// it.
    Keepalive,
    /// Requester-facing half of a relayed conversation.
    ServiceProxy,
    /// Provider-facing half of a relayed conversation.
    ServiceStub,
}

/// State shared by every processor: identity, back-references and the
/// liveness timestamps the factory sweep reads.
pub struct ProcCore {
    pub session: Weak<Session>,
    pub peer: Arc<Peer>,
    pub(crate) factory: Weak<ProcFactory>,
    pub(crate) serial: u64,

    /// Conversation id; the MSB encodes which side this handler is.
    pub id: u32,
    /// Service name, possibly distinct from the handler type's own name.
    pub name: Arc<str>,

    pub start_time: i64,
    /// 0 until the first peer packet arrives, then only moves forward.
    pub t_packet_recv: AtomicI64,
    /// Updated whenever the local side sends a keepalive probe.
    pub t_keepalive_sent: AtomicI64,

    reaped: AtomicBool,
    self_proc: OnceCell<Weak<dyn Processor>>,
}

impl ProcCore {
    pub(crate) fn new(
        session: Weak<Session>,
        peer: Arc<Peer>,
        factory: Weak<ProcFactory>,
        serial: u64,
        id: u32,
        name: Arc<str>,
        start_time: i64,
    ) -> Self {
        Self {
            session,
            peer,
            factory,
            serial,
            id,
            name,
            start_time,
            t_packet_recv: AtomicI64::new(0),
            t_keepalive_sent: AtomicI64::new(0),
            reaped: AtomicBool::new(false),
            self_proc: OnceCell::new(),
        }
    }

    pub(crate) fn bind_self(&self, handle: Weak<dyn Processor>) {
        let _ = self.self_proc.set(handle);
    }

    /// Weak handle to the processor this core lives in.
    pub fn self_weak(&self) -> Option<Weak<dyn Processor>> {
        self.self_proc.get().cloned()
    }

    pub fn now(&self) -> i64 {
        self.session.upgrade().map_or(0, |s| s.now())
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// Record that a peer packet was just received.
    pub fn touch_recv(&self) {
        let t = self.now().max(self.start_time).max(1);
        self.t_packet_recv.store(t, Ordering::Release);
    }

    /// Control traffic flows master -> slave as updates and back as
    /// responses.
    pub fn ctl_kind(&self) -> PacketKind {
        if is_master(self.id) {
            PacketKind::Update
        } else {
            PacketKind::Response
        }
    }

    /// Send a raw frame on this conversation.
    pub fn send_packet(&self, kind: PacketKind, body: bytes::Bytes) -> Result<()> {
        self.peer.write_packet(&Packet::new(kind, self.id, body))
    }

    /// Send a status line on this conversation.
    pub fn send_status(&self, code: u16, text: &str) -> Result<()> {
        self.send_packet(self.ctl_kind(), format_status(code, text))
    }

    /// Open the conversation: the body's first token names the remote
    /// service.
    pub fn send_request_line(&self, line: &str) -> Result<()> {
        self.send_packet(
            PacketKind::Request,
            bytes::Bytes::copy_from_slice(line.as_bytes()),
        )
    }

    /// Send a keepalive probe and record the send time.
    pub fn send_keepalive(&self) -> Result<()> {
        self.send_status(SC_PROC_KEEPALIVE, SS_PROC_KEEPALIVE)?;
        self.t_keepalive_sent
            .store(self.now().max(1), Ordering::Release);
        Ok(())
    }
}

impl fmt::Debug for ProcCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcCore")
            .field("name", &self.name)
            .field("id", &print_id(self.id))
            .field("master", &is_master(self.id))
            .field("reaped", &self.is_reaped())
            .finish()
    }
}

/// A conversation handler. Concrete processors implement the required
/// methods; lifecycle bookkeeping lives in the provided ones and is shared
/// by every handler type.
pub trait Processor: Send + Sync {
    fn core(&self) -> &ProcCore;

    fn as_any(&self) -> &dyn Any;

    fn kind(&self) -> ProcKind {
        ProcKind::Plain
    }

    /// Initial entry once the caller has installed per-conversation state.
    /// Master side opens the conversation; slave side acknowledges it.
    fn start(&self) -> Result<()>;

    /// Type-specific traffic, after the core has done its bookkeeping.
    fn on_packet(&self, _pkt: &Packet) -> Result<()> {
        Ok(())
    }

    /// Hook invoked exactly once, from inside [`shutdown`](Self::shutdown).
    fn on_shutdown(&self, _reason: ShutdownReason) {}

    /// True iff this handler's relay counterpart has been torn down. Only
    /// proxy/stub handlers ever say yes.
    fn is_orphan(&self) -> bool {
        false
    }

    /// Called by the counterpart's shutdown path on proxy/stub pairs.
    fn mark_orphan(&self) {}

    /// A frame addressed to this conversation arrived. Refreshes the
    /// receive timestamp, runs the keepalive sub-protocol, then hands
    /// anything else to [`on_packet`](Self::on_packet).
    fn handle_packet(&self, pkt: &Packet) {
        let core = self.core();
        core.touch_recv();

        if let Ok((code, _)) = parse_status(&pkt.body) {
            match code {
                SC_PROC_KEEPALIVE => {
                    if let Err(e) = core.send_status(SC_PROC_ALIVE, SS_PROC_ALIVE) {
                        warn!("{}({}): probe ack failed: {e}", core.name, print_id(core.id));
                    }
                    return;
                }
                // receive timestamp already refreshed above
                SC_PROC_ALIVE => return,
                SC_PROC_DEAD => {
                    self.shutdown(ShutdownReason::Remote);
                    return;
                }
                _ => {}
            }
        }

        if let Err(e) = self.on_packet(pkt) {
            warn!(
                "{}({}): dropping conversation on bad packet: {e}",
                core.name,
                print_id(core.id)
            );
            self.shutdown(ShutdownReason::BadPacket);
        }
    }

    /// Probe the peer handler's liveness.
    fn keep_alive(&self) {
        let core = self.core();
        if let Err(e) = core.send_keepalive() {
            warn!("{}({}): keepalive failed: {e}", core.name, print_id(core.id));
        }
    }

    /// Tear the conversation down. Idempotent: only the first call has any
    /// effect. Unlinks the handler from its peer's table and from the
    /// factory's live set.
    fn shutdown(&self, reason: ShutdownReason) {
        let core = self.core();
        if core.reaped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutdown {}({}): {reason}", core.name, print_id(core.id));

        self.on_shutdown(reason);

        // tell the peer unless it already knows the conversation is gone
        if !matches!(reason, ShutdownReason::Remote | ShutdownReason::Netdown) {
            let _ = core.send_status(SC_PROC_DEAD, SS_PROC_DEAD);
        }

        core.peer.remove_processor(core.id);
        if let Some(factory) = core.factory.upgrade() {
            factory.recycle(core);
        }
    }
}
