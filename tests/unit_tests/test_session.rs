// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use peermux::{
    cfg::config::{Config, SessionConfig},
    io::endpoint::PacketIo,
    peer::Peer,
    proc::echo::EchoProc,
    session::{Role, Session},
};
use tokio::{net::TcpListener, time::timeout};

fn server_config() -> Config {
    Config {
        session: SessionConfig {
            role: Role::Server,
            ..SessionConfig::default()
        },
        ..Config::default()
    }
}

/// Accept one link and wire it into the session, the way `serve` does.
async fn accept_one(server: Arc<Session>, listener: TcpListener) {
    if let Ok((stream, addr)) = listener.accept().await {
        let peer = Peer::new(Arc::downgrade(&server), format!("inbound/{addr}"), false);
        let io = PacketIo::new_incoming(&server, Some(addr), stream);
        server.attach(&peer, io);
        server.peers.insert(peer);
    }
}

#[tokio::test]
async fn test_echo_round_trip_over_tcp() -> Result<()> {
    let server = Session::new(server_config());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(accept_one(Arc::clone(&server), listener));

    let client = Session::new(Config::default());
    let peer = client.connect_peer("srv", "127.0.0.1", port).await?;

    let login = client.factory().create_master("send-login", &peer)?;
    login.start()?;

    let echo_proc = client.factory().create_master("echo", &peer)?;
    echo_proc.start()?;
    let echo = echo_proc
        .as_any()
        .downcast_ref::<EchoProc>()
        .expect("echo handler type");
    echo.send_ping(b"hello mux")?;

    let reply = timeout(Duration::from_secs(5), echo.wait_reply()).await?;
    assert_eq!(reply.as_deref(), Some(&b"hello mux"[..]));

    // responses arrive in stream order, so the login handshake is done too
    assert!(login.core().is_reaped());
    assert!(echo_proc.core().t_packet_recv.load(std::sync::atomic::Ordering::SeqCst) > 0);

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_two_conversations_multiplex_one_link() -> Result<()> {
    let server = Session::new(server_config());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(accept_one(Arc::clone(&server), listener));

    let client = Session::new(Config::default());
    let peer = client.connect_peer("srv", "127.0.0.1", port).await?;

    let a_proc = client.factory().create_master("echo", &peer)?;
    let b_proc = client.factory().create_master("echo", &peer)?;
    a_proc.start()?;
    b_proc.start()?;
    let a = a_proc.as_any().downcast_ref::<EchoProc>().expect("echo");
    let b = b_proc.as_any().downcast_ref::<EchoProc>().expect("echo");

    a.send_ping(b"first")?;
    b.send_ping(b"second")?;

    let ra = timeout(Duration::from_secs(5), a.wait_reply()).await?;
    let rb = timeout(Duration::from_secs(5), b.wait_reply()).await?;
    assert_eq!(ra.as_deref(), Some(&b"first"[..]));
    assert_eq!(rb.as_deref(), Some(&b"second"[..]));

    client.shutdown();
    server.shutdown();
    Ok(())
}
