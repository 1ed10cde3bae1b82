// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use peermux::{
    cfg::config::Config,
    session::Role,
};

#[test]
fn test_load_config() -> Result<()> {
    let cfg = Config::load_from_file("tests/config.yaml")?;
    assert_eq!(cfg.session.role, Role::Client);
    assert_eq!(cfg.net.io_timeout_secs, 0);
    assert_eq!(cfg.net.read_buf_limit, 100_000);
    assert_eq!(cfg.keepalive.no_packet_timeout_secs, 10);
    assert_eq!(cfg.keepalive.pulse_ms, 5_000);
    assert_eq!(cfg.keepalive.connection_timeout_secs, 182);
    assert_eq!(cfg.keepalive.max_procs_per_pulse, 50);
    assert!(cfg.peers.is_empty());
    Ok(())
}

#[test]
fn test_defaults_match_reference_values() {
    let cfg = Config::default();
    assert_eq!(cfg.net.read_buf_limit, 100_000);
    assert_eq!(cfg.keepalive.no_packet_timeout_secs, 10);
    assert_eq!(cfg.keepalive.pulse_ms, 5_000);
    assert_eq!(cfg.keepalive.connection_timeout_secs, 182);
    assert_eq!(cfg.keepalive.max_procs_per_pulse, 50);
    assert_eq!(cfg.session.role, Role::Client);
}

#[test]
fn test_invalid_config_rejected() {
    assert!(Config::load_from_file("tests/config_bad.yaml").is_err());
    assert!(Config::load_from_file("tests/no_such_config.yaml").is_err());
}
