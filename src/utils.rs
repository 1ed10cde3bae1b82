// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Write,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::RngExt;
use tokio_util::sync::CancellationToken;

/// Lock a mutex, recovering the data from a poisoned one.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generate a random 20-byte peer id and return:
/// - `[u8; 20]` raw bytes
/// - `String` containing its hexadecimal representation (no prefix)
pub fn generate_peer_id() -> ([u8; 20], String) {
    let mut raw = [0u8; 20];
    rand::rng().fill(&mut raw);

    let mut hex = String::with_capacity(40);
    for byte in &raw {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (raw, hex)
}

/// A periodic callback handle. The task runs until the handle is cancelled
/// or dropped; the first firing happens one full period after creation.
#[derive(Debug)]
pub struct Timer {
    cancel: CancellationToken,
}

impl Timer {
    pub fn schedule<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = guard.cancelled() => return,
                    _ = interval.tick() => tick(),
                }
            }
        });
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
