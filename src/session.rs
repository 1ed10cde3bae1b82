// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The top-level container: one session owns the peer directory, the
//! processor factory, the clock and the framed links.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak, atomic::AtomicI64},
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    io::{
        endpoint::{IoHandler, PacketIo},
        event::IoEvent,
    },
    peer::{Peer, PeerDirectory},
    proc::factory::ProcFactory,
    wire::frame::Packet,
};

/// Monotone wall clock in whole seconds. The factory sweep and the
/// processor timestamps only ever read time through this.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Hand-driven clock for virtual-time tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    t: AtomicI64,
}

impl ManualClock {
    pub fn new(t: i64) -> Self {
        Self {
            t: AtomicI64::new(t),
        }
    }

    pub fn set(&self, t: i64) {
        self.t.store(t, std::sync::atomic::Ordering::Release);
    }

    pub fn advance(&self, secs: i64) {
        self.t.fetch_add(secs, std::sync::atomic::Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.t.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Which side of the login pair this session offers.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[default]
    #[serde(rename = "client", alias = "Client")]
    Client,
    #[serde(rename = "server", alias = "Server")]
    Server,
}

pub struct Session {
    pub cfg: Config,
    pub peers: PeerDirectory,
    pub role: Role,

    clock: Arc<dyn Clock>,
    factory: Arc<ProcFactory>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(cfg: Config) -> Arc<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: Config, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let role = cfg.session.role;
            let factory = ProcFactory::new(weak.clone(), &cfg.keepalive, role);
            Session {
                peers: PeerDirectory::new(),
                role,
                clock,
                factory,
                cancel: CancellationToken::new(),
                cfg,
            }
        })
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn factory(&self) -> &Arc<ProcFactory> {
        &self.factory
    }

    /// Begin the periodic keepalive sweep.
    pub fn start(self: &Arc<Self>) {
        self.factory.start();
    }

    /// Accept inbound links until the session shuts down.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let Some(listen) = self.cfg.session.listen.clone() else {
            bail!("no listen address configured");
        };
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("binding {listen}"))?;
        info!("listening on {listen}");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.context("accept failed")?;
                    self.adopt(stream, addr);
                }
            }
        }
    }

    fn adopt(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        // inbound link: provisional identity until login names the peer
        let peer = Peer::new(Arc::downgrade(self), format!("inbound/{addr}"), false);
        let io = PacketIo::new_incoming(self, Some(addr), stream);
        self.attach(&peer, io);
        self.peers.insert(peer);
    }

    /// Dial a peer and register it in the directory.
    pub async fn connect_peer(
        self: &Arc<Self>,
        peer_id: &str,
        addr: &str,
        port: u16,
    ) -> Result<Arc<Peer>> {
        let io = PacketIo::new_outgoing(self, addr, port).await?;
        let peer = Peer::new(Arc::downgrade(self), peer_id, false);
        self.attach(&peer, io);
        self.peers.insert(Arc::clone(&peer));
        Ok(peer)
    }

    /// Wire an endpoint to a peer: routing callbacks in, NETDOWN teardown
    /// out. Frames that arrived before the handler was installed are
    /// drained right away.
    pub fn attach(self: &Arc<Self>, peer: &Arc<Peer>, io: PacketIo) {
        io.set_timeout_secs(self.cfg.net.io_timeout_secs);
        io.set_handler(Arc::new(PeerIoHandler {
            session: Arc::downgrade(self),
            peer: Arc::downgrade(peer),
        }));
        peer.bind_io(io.clone());
        io.try_read();
    }

    /// Tear everything down: the sweep, every conversation, every link.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.factory.stop();
        for peer in self.peers.snapshot() {
            self.factory.shutdown_for_peer(&peer);
            if let Some(io) = peer.unbind_io() {
                io.free();
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// Glue between one endpoint and its peer.
struct PeerIoHandler {
    session: Weak<Session>,
    peer: Weak<Peer>,
}

impl IoHandler for PeerIoHandler {
    fn on_packet(&self, _io: &PacketIo, pkt: Packet) {
        if let Some(peer) = self.peer.upgrade() {
            peer.on_packet(pkt);
        }
    }

    fn on_error(&self, io: &PacketIo, what: IoEvent) {
        if let (Some(session), Some(peer)) = (self.session.upgrade(), self.peer.upgrade()) {
            warn!("link to peer {} failed: {what:?}", peer.id);
            session.factory().shutdown_for_peer(&peer);
            peer.unbind_io();
            session.peers.remove(&peer.id);
        }
        io.free();
    }
}
