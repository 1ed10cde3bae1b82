// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use tracing::debug;

use crate::{
    cfg::config::KeepaliveConfig,
    peer::Peer,
    proc::{
        ProcCore, ProcKind, Processor, ShutdownReason,
        echo::EchoProc,
        keepalive::KeepaliveProc,
        login::{RecvLoginProc, SendLoginProc},
        service_proxy::ServiceProxyProc,
        service_stub::ServiceStubProc,
    },
    session::{Role, Session},
    utils::Timer,
    wire::id::{master_id, print_id, slave_id},
};

/// Handlers must survive this long without traffic before the factory
/// probes them, unless the config says otherwise.
pub const DEFAULT_NO_PACKET_TIMEOUT: i64 = 10;

/// How often the sweep runs.
pub const KEEPALIVE_PULSE_MS: u64 = 5_000;

/// A handler whose handshake has not completed within this window, or
/// whose probe stays unanswered this long past the soft timeout, is dead.
/// Must stay larger than the peer-scope keepalive conversation's own
/// period.
pub const CONNECTION_TIMEOUT: i64 = 182;

/// Probe budget per sweep tick; the rest of the walk is deferred.
pub const MAX_PROCS_KEEPALIVE: usize = 50;

/// How many recently closed handlers the debug log remembers.
const RECYCLE_LOG_CAP: usize = 32;

/// Builds a concrete processor around the shared core state.
pub type ProcCtor = Arc<dyn Fn(ProcCore) -> Arc<dyn Processor> + Send + Sync>;

/// Summary of a closed conversation, kept for debugging.
#[derive(Debug, Clone)]
pub struct RecycledProc {
    pub name: Arc<str>,
    pub peer: Arc<str>,
    pub ctime: i64,
    pub dtime: i64,
}

/// Registry of service names to handler types plus the global set of live
/// conversations. One per session.
pub struct ProcFactory {
    session: Weak<Session>,

    types: DashMap<String, ProcCtor>,
    live: DashMap<u64, Arc<dyn Processor>>,
    next_serial: AtomicU64,
    alive_cnt: AtomicUsize,

    no_packet_timeout: AtomicI64,
    pulse: Duration,
    connection_timeout: i64,
    max_probes: usize,

    sweeper: Mutex<Option<Timer>>,
    recycled: Mutex<VecDeque<RecycledProc>>,
}

impl ProcFactory {
    /// Create the factory and register the fundamental handler types. The
    /// `role` picks which side of the login pair this session offers.
    pub fn new(session: Weak<Session>, cfg: &KeepaliveConfig, role: Role) -> Arc<Self> {
        let factory = Arc::new(Self {
            session,
            types: DashMap::new(),
            live: DashMap::new(),
            next_serial: AtomicU64::new(1),
            alive_cnt: AtomicUsize::new(0),
            no_packet_timeout: AtomicI64::new(cfg.no_packet_timeout_secs),
            pulse: Duration::from_millis(cfg.pulse_ms),
            connection_timeout: cfg.connection_timeout_secs,
            max_probes: cfg.max_procs_per_pulse,
            sweeper: Mutex::new(None),
            recycled: Mutex::new(VecDeque::new()),
        });

        factory.register("echo", |core| Arc::new(EchoProc::new(core)));
        factory.register("keepalive", |core| Arc::new(KeepaliveProc::new(core)));
        factory.register("service-proxy", |core| Arc::new(ServiceProxyProc::new(core)));
        factory.register("service-stub", |core| Arc::new(ServiceStubProc::new(core)));
        match role {
            Role::Server => {
                factory.register("recv-login", |core| Arc::new(RecvLoginProc::new(core)));
            }
            Role::Client => {
                factory.register("send-login", |core| Arc::new(SendLoginProc::new(core)));
            }
        }

        factory
    }

    /// Map a service name to a handler type. A duplicate name replaces the
    /// earlier entry.
    pub fn register<F>(&self, serv_name: &str, ctor: F)
    where
        F: Fn(ProcCore) -> Arc<dyn Processor> + Send + Sync + 'static,
    {
        self.types.insert(serv_name.to_owned(), Arc::new(ctor));
    }

    /// Begin the periodic keepalive sweep.
    pub fn start(self: &Arc<Self>) {
        let factory = Arc::clone(self);
        let timer = Timer::schedule(self.pulse, move || factory.pulse());
        *crate::utils::lock(&self.sweeper) = Some(timer);
    }

    pub fn stop(&self) {
        crate::utils::lock(&self.sweeper).take();
    }

    pub fn set_no_packet_timeout(&self, secs: i64) {
        self.no_packet_timeout.store(secs, Ordering::Release);
    }

    pub fn alive_count(&self) -> usize {
        self.alive_cnt.load(Ordering::Acquire)
    }

    /// Recently closed conversations, newest first.
    pub fn recent_recycled(&self) -> Vec<RecycledProc> {
        crate::utils::lock(&self.recycled).iter().cloned().collect()
    }

    fn create_common(
        self: &Arc<Self>,
        serv_name: &str,
        peer: &Arc<Peer>,
        id: u32,
    ) -> Result<Arc<dyn Processor>> {
        let Some(ctor) = self.types.get(serv_name).map(|e| Arc::clone(e.value())) else {
            bail!("unknown service {serv_name}");
        };
        let session = self.session.clone();
        let start_time = session.upgrade().map_or(0, |s| s.now());
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let core = ProcCore::new(
            session,
            Arc::clone(peer),
            Arc::downgrade(self),
            serial,
            id,
            Arc::from(serv_name),
            start_time,
        );
        let processor = ctor(core);
        processor
            .core()
            .bind_self(Arc::downgrade(&processor));

        debug!(
            "create processor {}({}) on peer {}",
            serv_name,
            print_id(id),
            peer.id
        );
        peer.add_processor(Arc::clone(&processor));
        self.live.insert(serial, Arc::clone(&processor));
        self.alive_cnt.fetch_add(1, Ordering::AcqRel);

        Ok(processor)
    }

    /// Create the initiating half of a conversation. Does not call
    /// `start()`: the caller installs per-conversation state first. A
    /// redirected peer is followed exactly one hop.
    pub fn create_master(
        self: &Arc<Self>,
        serv_name: &str,
        peer: &Arc<Peer>,
    ) -> Result<Arc<dyn Processor>> {
        let peer = match peer.redirect_to() {
            Some(target) => {
                debug!("redirect processor request from {} to {}", peer.id, target.id);
                target
            }
            None => Arc::clone(peer),
        };
        let id = master_id(peer.next_request_id());
        self.create_common(serv_name, &peer, id)
    }

    /// Create the responding half for an inbound conversation-initiation
    /// frame; the id comes off the wire and is normalised into the SLAVE
    /// space.
    pub fn create_slave(
        self: &Arc<Self>,
        serv_name: &str,
        peer: &Arc<Peer>,
        req_id: u32,
    ) -> Result<Arc<dyn Processor>> {
        self.create_common(serv_name, peer, slave_id(req_id))
    }

    /// Unlink a handler from the live set and log it. Safe to call from
    /// inside the handler's own shutdown path.
    pub fn recycle(&self, core: &ProcCore) {
        if self.live.remove(&core.serial).is_none() {
            return;
        }
        self.alive_cnt.fetch_sub(1, Ordering::AcqRel);

        let dtime = self.session.upgrade().map_or(0, |s| s.now());
        let mut log = crate::utils::lock(&self.recycled);
        log.push_front(RecycledProc {
            name: Arc::clone(&core.name),
            peer: Arc::clone(&core.peer.id),
            ctime: core.start_time,
            dtime,
        });
        log.truncate(RECYCLE_LOG_CAP);
    }

    /// The peer's connection died: shut down every conversation it still
    /// holds. Iterates over a snapshot; the table is not assumed intact
    /// while handlers unlink themselves.
    pub fn shutdown_for_peer(&self, peer: &Peer) {
        for processor in peer.processors_snapshot() {
            processor.shutdown(ShutdownReason::Netdown);
        }
        peer.clear_processors();
    }

    /// One keepalive sweep tick.
    ///
    /// This covers the case where TCP is healthy but the remote handler has
    /// died or was never created; TCP keepalive knows nothing about
    /// conversations. A handler silent past `no_packet_timeout` gets one
    /// probe; a probe unanswered past `no_packet_timeout +
    /// CONNECTION_TIMEOUT` kills the conversation.
    pub fn pulse(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let now = session.now();
        let no_packet_timeout1 = self.no_packet_timeout.load(Ordering::Acquire);
        let no_packet_timeout2 = no_packet_timeout1 + self.connection_timeout;
        let mut count = 0usize;

        // snapshot the keys: shutdown unlinks entries mid-walk
        let serials: Vec<u64> = self.live.iter().map(|e| *e.key()).collect();
        for serial in serials {
            let Some(processor) = self.live.get(&serial).map(|e| Arc::clone(e.value()))
            else {
                continue;
            };

            if processor.kind() == ProcKind::Keepalive {
                continue;
            }

            // proxy and stub go down in pairs: whichever side shuts down
            // first declares the other an orphan, and the orphan is reaped
            // on a later visit
            if matches!(
                processor.kind(),
                ProcKind::ServiceProxy | ProcKind::ServiceStub
            ) && processor.is_orphan()
            {
                debug!(
                    "[proc-fact] shutdown orphan {}({})",
                    processor.core().name,
                    print_id(processor.core().id)
                );
                processor.shutdown(ShutdownReason::NotSet);
                continue;
            }

            let core = processor.core();
            if core.peer.is_local {
                // no keepalive towards ourselves
                continue;
            }

            let recv = core.t_packet_recv.load(Ordering::Acquire);
            if recv == 0 {
                // a just-started master that never completed the handshake
                if now - core.start_time >= self.connection_timeout {
                    debug!(
                        "[proc-fact] shutdown {}({}) on connect timeout {}s",
                        core.name,
                        print_id(core.id),
                        now - core.start_time
                    );
                    processor.shutdown(ShutdownReason::ConTimeout);
                }
                continue;
            }

            if now - recv <= no_packet_timeout1 {
                continue;
            }

            if core.t_keepalive_sent.load(Ordering::Acquire) <= recv {
                // no probe outstanding yet; past the budget the rest of the
                // walk waits for the next tick
                processor.keep_alive();
                count += 1;
                if count >= self.max_probes {
                    break;
                }
                continue;
            }

            if now - recv > no_packet_timeout2 {
                debug!(
                    "[proc-fact] shutdown {}({}) on keepalive timeout",
                    core.name,
                    print_id(core.id)
                );
                processor.shutdown(ShutdownReason::Timeout);
            }
        }
    }
}
