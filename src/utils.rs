//! # Utility Functions
//!
//! Small helpers shared across the harness: identifiers, duration
//! formatting, port validation, host lookups and file ownership.

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a run
///
/// UUID v4 string, recorded in the run manifest so result files from
/// different runs can be told apart.
pub fn generate_test_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ```rust
/// # use handshake_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Validate that a port number is usable without privileges
///
/// Ports below 1024 are reserved for system services. The servers started by
/// the harness are not expected to run with the capability to bind them.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Get the number of available CPU cores
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Reverse-resolve `addr` to the name the client should connect to.
///
/// The emulated server address resolves to the name its certificate was
/// issued for, so the client is handed that name rather than the address.
pub fn reverse_resolve(addr: IpAddr) -> Result<String> {
    dns_lookup::lookup_addr(&addr).with_context(|| format!("Reverse lookup of {} failed", addr))
}

/// Hand `path` to `uid:gid`.
pub fn chown_path(path: &Path, uid: u32, gid: u32) -> Result<()> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .with_context(|| format!("Failed to chown {} to {}:{}", path.display(), uid, gid))
}
