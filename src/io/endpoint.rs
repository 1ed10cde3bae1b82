// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    io::event::IoEvent,
    session::Session,
    utils::lock,
    wire::frame::{FrameError, HEADER_LEN, Packet, PacketHeader},
};

/// High watermark of the read buffer. Must exceed the largest single frame,
/// so a complete packet always fits below it.
pub const READ_BUF_LIMIT: usize = 100_000;

/// Callbacks a [`PacketIo`] dispatches into. Write-drained and error
/// notifications are optional; a handler that is never installed leaves
/// arriving frames buffered until [`PacketIo::try_read`].
pub trait IoHandler: Send + Sync {
    /// A complete frame, header fields already in host order.
    ///
    /// The handler may call [`PacketIo::free`] on its own endpoint from
    /// here; destruction is deferred until dispatch unwinds.
    fn on_packet(&self, io: &PacketIo, pkt: Packet);

    /// The outbound queue went empty.
    fn on_write_drained(&self, _io: &PacketIo) {}

    /// Stream error, timeout or EOF. The endpoint does nothing further by
    /// itself; cleanup is the handler's call.
    fn on_error(&self, _io: &PacketIo, _what: IoEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    /// Buffer exhausted below a frame boundary.
    Idle,
    /// A callback freed the endpoint during dispatch.
    Freed,
    /// Impossible frame length; the stream cannot be resynchronised.
    Broken,
}

struct Shared {
    direction: Direction,
    peer_addr: Option<SocketAddr>,
    session: Weak<Session>,
    read_limit: usize,
    loopback: bool,

    inbuf: Mutex<BytesMut>,
    handler: Mutex<Option<Arc<dyn IoHandler>>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    loopback_out: Mutex<Vec<Bytes>>,

    /// Reentrancy pair: while `handling` is set no code path may release
    /// the endpoint; `free()` only records `schedule_free` and the dispatch
    /// frame performs the release on its way out.
    handling: AtomicBool,
    schedule_free: AtomicBool,
    freed: AtomicBool,

    /// Inactivity timeout in whole seconds, 0 disables. Pumps sample it
    /// before every wait, so a store re-arms both directions at once.
    timeout_secs: AtomicU64,

    drained: Notify,
    cancel: CancellationToken,
}

/// One TCP connection wrapped with framing. Cheap to clone; all clones
/// refer to the same endpoint.
#[derive(Clone)]
pub struct PacketIo {
    shared: Arc<Shared>,
}

impl PacketIo {
    fn build(
        session: Weak<Session>,
        direction: Direction,
        peer_addr: Option<SocketAddr>,
        read_limit: usize,
        loopback: bool,
        outbox: Option<mpsc::UnboundedSender<Bytes>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                direction,
                peer_addr,
                session,
                read_limit,
                loopback,
                inbuf: Mutex::new(BytesMut::with_capacity(HEADER_LEN)),
                handler: Mutex::new(None),
                outbox: Mutex::new(outbox),
                loopback_out: Mutex::new(Vec::new()),
                handling: AtomicBool::new(false),
                schedule_free: AtomicBool::new(false),
                freed: AtomicBool::new(false),
                timeout_secs: AtomicU64::new(0),
                drained: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn spawn_pumps(&self, stream: TcpStream, rx: mpsc::UnboundedReceiver<Bytes>) {
        let (r, w) = stream.into_split();
        tokio::spawn(read_pump(self.clone(), r));
        tokio::spawn(write_pump(self.clone(), w, rx));
    }

    /// Wrap an already-accepted socket.
    pub fn new_incoming(
        session: &Arc<Session>,
        peer_addr: Option<SocketAddr>,
        stream: TcpStream,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let io = Self::build(
            Arc::downgrade(session),
            Direction::Incoming,
            peer_addr,
            session.cfg.net.read_buf_limit,
            false,
            Some(tx),
        );
        io.spawn_pumps(stream, rx);
        io
    }

    /// Parse `addr:port`, open a TCP connection and wrap it. Connect
    /// failures surface here; the caller retries or gives up.
    pub async fn new_outgoing(session: &Arc<Session>, addr: &str, port: u16) -> Result<Self> {
        let target: SocketAddr = format!("{addr}:{port}")
            .parse()
            .with_context(|| format!("bad peer address {addr}:{port}"))?;
        let stream = TcpStream::connect(target)
            .await
            .with_context(|| format!("opening tcp connection to {target}"))?;
        stream.set_nodelay(true)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let io = Self::build(
            Arc::downgrade(session),
            Direction::Outgoing,
            Some(target),
            session.cfg.net.read_buf_limit,
            false,
            Some(tx),
        );
        io.spawn_pumps(stream, rx);
        Ok(io)
    }

    /// Endpoint with no socket behind it. Local conversations and tests
    /// push inbound bytes through [`feed`](Self::feed) and collect outbound
    /// frames with [`take_written`](Self::take_written).
    pub fn loopback(direction: Direction) -> Self {
        Self::loopback_with_limit(direction, READ_BUF_LIMIT)
    }

    /// Loopback endpoint with a custom read high watermark.
    pub fn loopback_with_limit(direction: Direction, read_limit: usize) -> Self {
        Self::build(Weak::new(), direction, None, read_limit, true, None)
    }

    /// Install the dispatch handler. Frames that arrived earlier stay
    /// buffered; call [`try_read`](Self::try_read) to drain them.
    pub fn set_handler(&self, handler: Arc<dyn IoHandler>) {
        *lock(&self.shared.handler) = Some(handler);
    }

    /// Arm the read and write inactivity timers; 0 disables them. The new
    /// value takes effect before the next wait on either side.
    pub fn set_timeout_secs(&self, secs: u64) {
        self.shared.timeout_secs.store(secs, Ordering::Release);
    }

    /// Convert header fields to network byte order and enqueue the frame on
    /// the outbound stream. Never blocks; backpressure lives in the stream.
    /// Writing to a freed endpoint is a no-op.
    pub fn write_packet(&self, pkt: &Packet) -> Result<(), FrameError> {
        let bytes = pkt.encode()?;
        if self.shared.freed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.shared.loopback {
            lock(&self.shared.loopback_out).push(bytes);
            return Ok(());
        }
        if let Some(tx) = lock(&self.shared.outbox).as_ref() {
            let _ = tx.send(bytes);
        }
        Ok(())
    }

    /// Outbound frames captured by a loopback endpoint.
    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut *lock(&self.shared.loopback_out))
    }

    /// Append stream bytes to the read buffer and dispatch, exactly as if
    /// they had arrived from the socket.
    pub fn feed(&self, bytes: &[u8]) {
        if self.shared.freed.load(Ordering::Acquire) {
            return;
        }
        let len = {
            let mut buf = lock(&self.shared.inbuf);
            buf.extend_from_slice(bytes);
            buf.len()
        };
        if len >= HEADER_LEN {
            self.dispatch();
        }
    }

    /// Drain any packets that were buffered before a handler was installed.
    pub fn try_read(&self) {
        if !lock(&self.shared.inbuf).is_empty() {
            self.dispatch();
        }
    }

    /// Bytes currently sitting in the read buffer.
    pub fn buffered_len(&self) -> usize {
        lock(&self.shared.inbuf).len()
    }

    /// Destroy the endpoint. Inside the dispatch path this only schedules
    /// destruction; the dispatch frame performs it on the way out.
    pub fn free(&self) {
        if self.shared.handling.load(Ordering::Acquire) {
            self.shared.schedule_free.store(true, Ordering::Release);
            return;
        }
        self.release();
    }

    pub fn is_freed(&self) -> bool {
        self.shared.freed.load(Ordering::Acquire)
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn is_incoming(&self) -> bool {
        self.shared.direction == Direction::Incoming
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.session.upgrade()
    }

    /// The read dispatch loop. Runs frames out of the buffer until it drops
    /// below a frame boundary, the handler frees the endpoint, or the
    /// stream turns out to be unframeable.
    fn dispatch(&self) -> DispatchOutcome {
        let sh = &*self.shared;
        if sh.handling.swap(true, Ordering::AcqRel) {
            return DispatchOutcome::Idle;
        }

        let outcome = loop {
            // looked up per frame: the previous callback may have swapped
            // the handler, and an uninstalled one leaves frames buffered
            let Some(handler) = lock(&sh.handler).clone() else {
                break DispatchOutcome::Idle;
            };
            let pkt = {
                let buf = lock(&sh.inbuf);
                let Ok(header) = PacketHeader::peek(&buf) else {
                    break DispatchOutcome::Idle;
                };
                let need = HEADER_LEN + header.body_len();
                if need > sh.read_limit {
                    warn!(
                        "frame of {need} bytes cannot fit under the read buffer limit {}",
                        sh.read_limit
                    );
                    break DispatchOutcome::Broken;
                }
                if buf.len() < need {
                    // wait for more data
                    break DispatchOutcome::Idle;
                }
                match Packet::decode(&buf) {
                    Ok(p) => p,
                    Err(_) => break DispatchOutcome::Broken,
                }
            };
            let wire_len = pkt.wire_len();

            handler.on_packet(self, pkt);

            // the handler may have scheduled us for destruction
            if sh.schedule_free.swap(false, Ordering::AcqRel) {
                break DispatchOutcome::Freed;
            }

            let remaining = {
                let mut buf = lock(&sh.inbuf);
                buf.advance(wire_len);
                buf.len()
            };
            sh.drained.notify_one();
            if remaining < HEADER_LEN {
                break DispatchOutcome::Idle;
            }
        };

        sh.handling.store(false, Ordering::Release);
        match outcome {
            DispatchOutcome::Freed => self.release(),
            DispatchOutcome::Broken => self.emit_error(IoEvent::READ | IoEvent::OTHER),
            DispatchOutcome::Idle => {}
        }
        outcome
    }

    fn emit_error(&self, what: IoEvent) {
        let handler = lock(&self.shared.handler).clone();
        if let Some(h) = handler {
            h.on_error(self, what);
        }
    }

    fn release(&self) {
        let sh = &*self.shared;
        if sh.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("endpoint to {:?} released", sh.peer_addr);
        *lock(&sh.handler) = None;
        lock(&sh.outbox).take();
        sh.cancel.cancel();
        lock(&sh.inbuf).clear();
        sh.drained.notify_one();
    }
}

impl fmt::Debug for PacketIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketIo")
            .field("direction", &self.shared.direction)
            .field("peer_addr", &self.shared.peer_addr)
            .field("freed", &self.is_freed())
            .finish()
    }
}

async fn read_pump(io: PacketIo, mut r: OwnedReadHalf) {
    let sh = io.shared.clone();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        if sh.cancel.is_cancelled() {
            return;
        }

        // high watermark: stop pulling off the socket until dispatch drains
        while lock(&sh.inbuf).len() >= sh.read_limit {
            tokio::select! {
                _ = sh.cancel.cancelled() => return,
                _ = sh.drained.notified() => {}
            }
        }

        let secs = sh.timeout_secs.load(Ordering::Acquire);
        let res = if secs == 0 {
            tokio::select! {
                _ = sh.cancel.cancelled() => return,
                r2 = r.read(&mut chunk) => r2,
            }
        } else {
            tokio::select! {
                _ = sh.cancel.cancelled() => return,
                r2 = timeout(Duration::from_secs(secs), r.read(&mut chunk)) => match r2 {
                    Ok(inner) => inner,
                    Err(_) => {
                        io.emit_error(IoEvent::READ | IoEvent::TIMEOUT);
                        return;
                    }
                },
            }
        };

        match res {
            Ok(0) => {
                io.emit_error(IoEvent::READ | IoEvent::EOF);
                return;
            }
            Ok(n) => {
                let len = {
                    let mut buf = lock(&sh.inbuf);
                    buf.extend_from_slice(&chunk[..n]);
                    buf.len()
                };
                // low watermark: a header must be complete before dispatch
                if len < HEADER_LEN {
                    continue;
                }
                match io.dispatch() {
                    DispatchOutcome::Idle => {}
                    DispatchOutcome::Freed | DispatchOutcome::Broken => return,
                }
            }
            Err(e) => {
                debug!("read error: {e}");
                io.emit_error(IoEvent::READ);
                return;
            }
        }
    }
}

async fn write_pump(
    io: PacketIo,
    mut w: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let sh = io.shared.clone();
    loop {
        let bytes = tokio::select! {
            _ = sh.cancel.cancelled() => {
                let _ = w.shutdown().await;
                return;
            }
            b = rx.recv() => match b {
                Some(b) => b,
                None => {
                    let _ = w.shutdown().await;
                    return;
                }
            },
        };

        let secs = sh.timeout_secs.load(Ordering::Acquire);
        let res = if secs == 0 {
            w.write_all(&bytes).await
        } else {
            match timeout(Duration::from_secs(secs), w.write_all(&bytes)).await {
                Ok(inner) => inner,
                Err(_) => {
                    io.emit_error(IoEvent::WRITE | IoEvent::TIMEOUT);
                    return;
                }
            }
        };
        if let Err(e) = res {
            debug!("write error: {e}");
            io.emit_error(IoEvent::WRITE);
            return;
        }

        if rx.is_empty() {
            let handler = lock(&sh.handler).clone();
            if let Some(h) = handler {
                h.on_write_drained(&io);
            }
        }
    }
}
