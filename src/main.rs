// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use peermux::{
    cfg::{
        cli::{config_path_from_args, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    proc::{ShutdownReason, echo::EchoProc},
    session::{Role, Session},
    utils::generate_peer_id,
};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = match init_logger("config_logger.yaml") {
        Ok(guard) => guard,
        Err(_) => {
            // no logger config next to us; default to stderr
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .init();
            None
        }
    };

    let cfg = resolve_config_path(&config_path_from_args())
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let session = Session::new(cfg.clone());
    session.start();

    if cfg.session.listen.is_some() {
        let server = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                warn!("serve failed: {e}");
            }
        });
    }

    for entry in &cfg.peers {
        let peer_id = entry
            .id
            .clone()
            .unwrap_or_else(|| generate_peer_id().1);
        let peer = session
            .connect_peer(&peer_id, &entry.addr, entry.port)
            .await
            .with_context(|| format!("dialing {}:{}", entry.addr, entry.port))?;
        info!("connected to peer {} at {}:{}", peer.id, entry.addr, entry.port);

        if session.role == Role::Client {
            let login = session.factory().create_master("send-login", &peer)?;
            login.start()?;
        }

        // one echo round as a link check
        let echo_proc = session.factory().create_master("echo", &peer)?;
        echo_proc.start()?;
        if let Some(echo) = echo_proc.as_any().downcast_ref::<EchoProc>() {
            echo.send_ping(b"ping")?;
            match timeout(Duration::from_secs(10), echo.wait_reply()).await {
                Ok(Some(reply)) => {
                    info!("echo reply from {}: {} bytes", peer.id, reply.len());
                }
                _ => warn!("no echo reply from {}", peer.id),
            }
        }
        echo_proc.shutdown(ShutdownReason::Done);
    }

    if cfg.session.listen.is_some() {
        info!("serving; ctrl-c to stop");
        tokio::signal::ctrl_c().await.ok();
    }

    session.shutdown();
    Ok(())
}
