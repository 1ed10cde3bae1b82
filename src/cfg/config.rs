// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    io::endpoint::READ_BUF_LIMIT,
    proc::factory::{
        CONNECTION_TIMEOUT, DEFAULT_NO_PACKET_TIMEOUT, KEEPALIVE_PULSE_MS,
        MAX_PROCS_KEEPALIVE,
    },
    session::Role,
    wire::frame::HEADER_LEN,
};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Who this session is and where it listens.
    #[serde(default)]
    pub session: SessionConfig,
    /// Endpoint-level knobs.
    #[serde(default)]
    pub net: NetConfig,
    /// Conversation liveness knobs.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    /// Peers to dial at startup.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub role: Role,
    /// Address to accept framed links on; absent for pure clients.
    #[serde(default)]
    pub listen: Option<String>,
    /// Fixed 40-hex peer identity; generated fresh when absent.
    #[serde(default)]
    pub peer_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetConfig {
    /// Endpoint inactivity timeout in whole seconds, 0 disables. Long
    /// links leave this off; conversation keepalive owns their liveness.
    #[serde(default)]
    pub io_timeout_secs: u64,
    /// Read buffer high watermark. Must exceed the largest single frame.
    #[serde(default = "default_read_buf_limit")]
    pub read_buf_limit: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: 0,
            read_buf_limit: READ_BUF_LIMIT,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KeepaliveConfig {
    /// Silence before a conversation gets probed.
    #[serde(default = "default_no_packet_timeout")]
    pub no_packet_timeout_secs: i64,
    /// Sweep period.
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
    /// Handshake deadline, and the probe grace on top of the soft timeout.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: i64,
    /// Probe budget per sweep tick.
    #[serde(default = "default_max_procs_per_pulse")]
    pub max_procs_per_pulse: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            no_packet_timeout_secs: DEFAULT_NO_PACKET_TIMEOUT,
            pulse_ms: KEEPALIVE_PULSE_MS,
            connection_timeout_secs: CONNECTION_TIMEOUT,
            max_procs_per_pulse: MAX_PROCS_KEEPALIVE,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PeerEntry {
    /// Known identity of the remote, if any.
    #[serde(default)]
    pub id: Option<String>,
    pub addr: String,
    pub port: u16,
}

fn default_read_buf_limit() -> usize {
    READ_BUF_LIMIT
}

fn default_no_packet_timeout() -> i64 {
    DEFAULT_NO_PACKET_TIMEOUT
}

fn default_pulse_ms() -> u64 {
    KEEPALIVE_PULSE_MS
}

fn default_connection_timeout() -> i64 {
    CONNECTION_TIMEOUT
}

fn default_max_procs_per_pulse() -> usize {
    MAX_PROCS_KEEPALIVE
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.net.read_buf_limit > HEADER_LEN,
            "net.read_buf_limit must exceed the frame header size"
        );
        ensure!(
            self.keepalive.pulse_ms > 0,
            "keepalive.pulse_ms must be positive"
        );
        ensure!(
            self.keepalive.no_packet_timeout_secs > 0,
            "keepalive.no_packet_timeout_secs must be positive"
        );
        ensure!(
            self.keepalive.connection_timeout_secs > 0,
            "keepalive.connection_timeout_secs must be positive"
        );
        Ok(())
    }
}
