// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Configuration, command-line path handling and logger setup.

/// Command-line helpers.
pub mod cli;
/// Configuration file parsing and validation.
pub mod config;
/// Logger initialization.
pub mod logger;
