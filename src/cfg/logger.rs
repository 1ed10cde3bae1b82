// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt::writer::BoxMakeWriter};

#[derive(Debug, Deserialize, Clone)]
struct LoggerConfig {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    #[serde(default)]
    rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Clone)]
struct LogConfig {
    level: String,
    output: Output,
    /// One JSON object per event instead of the human format.
    #[serde(default)]
    json: bool,
    #[serde(default)]
    is_show_line: bool,
    #[serde(default)]
    is_show_target: bool,
    file: Option<LogFileConfig>,
}

/// Install the global tracing subscriber from a YAML logger config. The
/// returned guard must stay alive while file output is in use; dropping
/// it flushes the writer.
pub fn init_logger(path: impl AsRef<Path>) -> Result<Option<WorkerGuard>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading logger config {}", path.display()))?;
    let cfg: LoggerConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing logger config {}", path.display()))?;
    let lc = cfg.logger;

    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&lc.level));

    let (writer, guard): (BoxMakeWriter, Option<WorkerGuard>) = match lc.output {
        Output::Stdout => (BoxMakeWriter::new(std::io::stdout), None),
        Output::Stderr => (BoxMakeWriter::new(std::io::stderr), None),
        Output::File => {
            let file = lc
                .file
                .as_ref()
                .context("logger.output = file needs a logger.file section")?;
            let full = Path::new(&file.path);
            let dir = match full.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let name = full
                .file_name()
                .map_or_else(|| "peermux.log".into(), |n| n.to_os_string());
            let rotation = match file.rotation_frequency {
                Some(RotationFreq::Minutely) => Rotation::MINUTELY,
                Some(RotationFreq::Hourly) => Rotation::HOURLY,
                Some(RotationFreq::Daily) => Rotation::DAILY,
                Some(RotationFreq::Never) | None => Rotation::NEVER,
            };
            let appender = RollingFileAppender::new(rotation, dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_line_number(lc.is_show_line)
        .with_target(lc.is_show_target);

    let installed = if lc.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("installing tracing subscriber: {e}"))?;

    Ok(guard)
}
