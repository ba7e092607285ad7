//! Tracing setup for the flashing station.
//!
//! The daemon normally runs as a systemd unit on the bench appliance, so
//! init prefers journald when stderr actually is the journal socket and
//! falls back to human-readable stdout otherwise. The rest of the crate
//! just uses the `tracing` macros.

use std::fmt;

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer as FmtWriter, time::FormatTime},
    prelude::*,
};

#[cfg(target_os = "linux")]
use std::{env, io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

/// Check if stderr is connected to the systemd journal by validating
/// JOURNAL_STREAM: the variable carries "device:inode" of the journal
/// socket, which must match stderr's fd to rule out redirection.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Ok(journal_stream) = env::var("JOURNAL_STREAM") else {
        return false;
    };
    let Some((dev, ino)) = journal_stream.split_once(':') else {
        return false;
    };
    let (Ok(expected_dev), Ok(expected_ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let fd = io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    stat.st_dev == expected_dev && stat.st_ino == expected_ino
}

/// Initialize logging: journald under systemd, stdout otherwise.
pub fn init() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            eprintln!("journald unavailable, logging to stdout");
        }
    }
    init_stdout();
}

/// Log to stdout, filtering per RUST_LOG with a default level of INFO.
pub fn init_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true),
        )
        .init();
}

/// Short local-time timestamps; the journal keeps the full ones.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = time::OffsetDateTime::now_local().unwrap_or(time::OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .unwrap(),
        )
    }
}
