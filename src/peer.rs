// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A peer is the remote end of one framed link: it owns the conversation
//! table for that link, allocates master ids, and routes inbound frames to
//! the right handler.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicU32, Ordering},
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    io::endpoint::PacketIo,
    proc::{Processor, ShutdownReason},
    session::Session,
    utils::lock,
    wire::{
        frame::{PACKET_VERSION, Packet, PacketKind},
        id::{counterpart, print_id, slave_id},
        status::{
            SC_PROC_DEAD, SC_UNKNOWN_SERVICE, SS_PROC_DEAD, SS_UNKNOWN_SERVICE,
            format_status, is_status,
        },
    },
};

pub struct Peer {
    /// 40-hex peer identity.
    pub id: Arc<str>,
    /// Local peers never get keepalive probes.
    pub is_local: bool,

    session: Weak<Session>,
    /// Master creation on this peer is diverted here, one hop only.
    redirect_to: Mutex<Option<Arc<Peer>>>,

    /// Conversation table: id (side bit included) to live handler.
    procs: DashMap<u32, Arc<dyn Processor>>,
    next_req_id: AtomicU32,

    io: Mutex<Option<PacketIo>>,
}

impl Peer {
    pub fn new(session: Weak<Session>, id: impl Into<Arc<str>>, is_local: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            is_local,
            session,
            redirect_to: Mutex::new(None),
            procs: DashMap::new(),
            next_req_id: AtomicU32::new(1),
            io: Mutex::new(None),
        })
    }

    /// Fresh request id in this peer's master space. Id 0 is never handed
    /// out.
    pub fn next_request_id(&self) -> u32 {
        self.next_req_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn set_redirect(&self, target: Option<Arc<Peer>>) {
        *lock(&self.redirect_to) = target;
    }

    pub fn redirect_to(&self) -> Option<Arc<Peer>> {
        lock(&self.redirect_to).clone()
    }

    pub fn add_processor(&self, processor: Arc<dyn Processor>) {
        let id = processor.core().id;
        if self.procs.insert(id, processor).is_some() {
            warn!("peer {}: conversation {} replaced", self.id, print_id(id));
        }
    }

    pub fn remove_processor(&self, id: u32) {
        self.procs.remove(&id);
    }

    pub fn processor(&self, id: u32) -> Option<Arc<dyn Processor>> {
        self.procs.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn processors_snapshot(&self) -> Vec<Arc<dyn Processor>> {
        self.procs.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn clear_processors(&self) {
        self.procs.clear();
    }

    pub fn conversation_count(&self) -> usize {
        self.procs.len()
    }

    /// Attach the framed link this peer talks through.
    pub fn bind_io(&self, io: PacketIo) {
        *lock(&self.io) = Some(io);
    }

    pub fn unbind_io(&self) -> Option<PacketIo> {
        lock(&self.io).take()
    }

    pub fn io(&self) -> Option<PacketIo> {
        lock(&self.io).clone()
    }

    /// Enqueue a frame on this peer's link.
    pub fn write_packet(&self, pkt: &Packet) -> Result<()> {
        match lock(&self.io).as_ref() {
            Some(io) => {
                io.write_packet(pkt)?;
                Ok(())
            }
            None => bail!("no endpoint bound to peer {}", self.id),
        }
    }

    /// Route one inbound frame. Requests spawn a slave handler; updates and
    /// responses go to the conversation the id's counterpart names. A frame
    /// for a vanished conversation is answered with status 102 so the
    /// remote side can reap its half.
    pub fn on_packet(self: &Arc<Self>, pkt: Packet) {
        if pkt.version != PACKET_VERSION {
            warn!("peer {}: dropping packet with version {}", self.id, pkt.version);
            return;
        }
        let Ok(kind) = PacketKind::try_from(pkt.kind) else {
            warn!("peer {}: dropping packet with kind 0x{:02x}", self.id, pkt.kind);
            return;
        };

        match kind {
            PacketKind::Request => self.on_request(pkt),
            PacketKind::Update | PacketKind::Response => {
                let key = counterpart(pkt.id);
                let Some(processor) = self.processor(key) else {
                    self.reply_dead(kind, key, &pkt);
                    return;
                };
                processor.handle_packet(&pkt);
            }
        }
    }

    fn on_request(self: &Arc<Self>, pkt: Packet) {
        if pkt.id == 0 {
            warn!("peer {}: request with invalid id 0", self.id);
            return;
        }
        let line = String::from_utf8_lossy(&pkt.body);
        let Some(serv_name) = line.split_whitespace().next() else {
            warn!("peer {}: request with empty service line", self.id);
            return;
        };
        let Some(session) = self.session.upgrade() else {
            return;
        };

        match session.factory().create_slave(serv_name, self, pkt.id) {
            Ok(processor) => {
                if let Err(e) = processor.start() {
                    warn!("peer {}: {serv_name} failed to start: {e}", self.id);
                    processor.shutdown(ShutdownReason::NotSet);
                    return;
                }
                // the initiation frame itself counts as peer traffic and
                // may carry arguments for the handler
                processor.handle_packet(&pkt);
            }
            Err(e) => {
                debug!("peer {}: {e}", self.id);
                let reply = Packet::new(
                    PacketKind::Response,
                    slave_id(pkt.id),
                    format_status(SC_UNKNOWN_SERVICE, SS_UNKNOWN_SERVICE),
                );
                let _ = self.write_packet(&reply);
            }
        }
    }

    fn reply_dead(&self, inbound: PacketKind, key: u32, pkt: &Packet) {
        // never answer a death notice with another one
        if is_status(&pkt.body, SC_PROC_DEAD) {
            return;
        }
        debug!(
            "peer {}: packet for dead conversation {}",
            self.id,
            print_id(pkt.id)
        );
        let reply_kind = match inbound {
            PacketKind::Update => PacketKind::Response,
            _ => PacketKind::Update,
        };
        let reply = Packet::new(reply_kind, key, format_status(SC_PROC_DEAD, SS_PROC_DEAD));
        let _ = self.write_packet(&reply);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("is_local", &self.is_local)
            .field("conversations", &self.procs.len())
            .finish()
    }
}

/// Lookup and association of peers by identity.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.id.to_string(), peer);
    }

    pub fn lookup(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.remove(peer_id).map(|(_, p)| p)
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
