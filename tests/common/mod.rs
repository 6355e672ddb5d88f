//! Stub handshake binaries for the integration tests.
//!
//! The stubs are `sh` scripts installed under the names the harness launches
//! (`pqtlsserver`, `pqtlsclient`). They are run with the suite directory as
//! working directory, so counter files they keep there are visible to the
//! test through [`read_counter`].

#![allow(dead_code)]

use handshake_bench::cli::{CachingMode, HandshakeMode};
use handshake_bench::trial::{AlgorithmSuite, LaunchSettings, TrialConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Prints `$4` client records, the loop count passed by `--loops`.
pub const CLIENT_PRINTS_LOOPS: &str = r#"
echo "Connecting to $9"
i=0
while [ "$i" -lt "$4" ]; do
    echo "CLIENT HELLO SENT: $((i + 10)) ns"
    echo "garbage line"
    echo "HANDSHAKE COMPLETED: $((i + 20)) ns"
    i=$((i + 1))
done
"#;

/// Never answers.
pub const HANGS: &str = "exec sleep 30\n";

/// Server printing `count` records valued `value`, then idling until
/// terminated.
pub fn server_printing(count: usize, value: u64) -> String {
    format!(
        r#"
i=0
while [ "$i" -lt {count} ]; do
    echo "SERVER HELLO SENT: {value} ns"
    echo "HANDSHAKE COMPLETED: {value} ns"
    i=$((i + 1))
done
exec sleep 30
"#
    )
}

/// Increment the counter file `name` and leave its new value in `$n`.
pub fn counting(name: &str, body: &str) -> String {
    format!(
        "n=$(cat {name} 2>/dev/null || echo 0)\nn=$((n + 1))\necho \"$n\" > {name}\n{body}"
    )
}

pub fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A suite directory holding a stub server and client.
pub fn stub_binaries(server: &str, client: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "pqtlsserver", server);
    write_script(dir.path(), "pqtlsclient", client);
    dir
}

pub fn read_counter(dir: &Path, name: &str) -> usize {
    std::fs::read_to_string(dir.join(name))
        .map(|s| s.trim().parse().unwrap())
        .unwrap_or(0)
}

/// Sign/cached trial over the stubs in `dir`, run without namespaces and
/// with short timings.
pub fn local_trial(dir: &Path, target: usize, per_session: usize, timeout_unit: Duration) -> TrialConfig {
    let suite = AlgorithmSuite::new(HandshakeMode::Sign, "X25519", "RSA2048", "RSA2048", "RSA2048");
    let launch = LaunchSettings {
        hostname: "localhost".to_string(),
        server_namespace: None,
        client_namespace: None,
        warmup: Duration::from_millis(50),
        server_grace: Duration::from_secs(2),
        client_timeout_unit: timeout_unit,
        ..LaunchSettings::default()
    };
    TrialConfig::new(suite, CachingMode::Cached, dir, target, per_session, launch).unwrap()
}
