//! Per-grid-point trial configuration and the command lines it implies.

use crate::cli::{CachingMode, HandshakeMode};
use crate::process::CommandSpec;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// One row of the algorithm table: which handshake variant and which
/// algorithms sit at each level of the certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgorithmSuite {
    pub mode: HandshakeMode,
    pub kex: String,
    pub leaf: String,
    pub intermediate: String,
    pub root: String,
}

impl AlgorithmSuite {
    pub fn new(mode: HandshakeMode, kex: &str, leaf: &str, intermediate: &str, root: &str) -> Self {
        Self {
            mode,
            kex: kex.to_string(),
            leaf: leaf.to_string(),
            intermediate: intermediate.to_string(),
            root: root.to_string(),
        }
    }

    /// Directory (relative to the binaries root) holding the server/client
    /// builds and credentials for this suite.
    pub fn binary_dir(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}-{}-{}-{}",
            self.kex, self.leaf, self.intermediate, self.root
        ))
    }
}

impl fmt::Display for AlgorithmSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.mode, self.kex, self.leaf, self.intermediate, self.root
        )
    }
}

impl FromStr for AlgorithmSuite {
    type Err = anyhow::Error;

    /// Parse `mode:kex:leaf:intermediate:root`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
            bail!(
                "Invalid suite '{}': expected mode:kex:leaf:intermediate:root",
                s
            );
        }
        let mode = match parts[0] {
            "sign" => HandshakeMode::Sign,
            "kem" => HandshakeMode::Kem,
            other => bail!("Invalid handshake mode '{}' (expected sign or kem)", other),
        };
        Ok(Self::new(mode, parts[1], parts[2], parts[3], parts[4]))
    }
}

/// Settings shared by every session of a sweep.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Name the client connects to.
    pub hostname: String,
    /// Namespace the server runs in (`ip netns exec`), if any.
    pub server_namespace: Option<String>,
    /// Namespace the client runs in, if any.
    pub client_namespace: Option<String>,
    pub warmup: Duration,
    pub server_grace: Duration,
    /// Client invocations get `2 * per_session * client_timeout_unit`.
    pub client_timeout_unit: Duration,
    pub terminal_label: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            hostname: crate::defaults::HOSTNAME.to_string(),
            server_namespace: Some(crate::defaults::SERVER_NAMESPACE.to_string()),
            client_namespace: Some(crate::defaults::CLIENT_NAMESPACE.to_string()),
            warmup: crate::defaults::WARMUP,
            server_grace: crate::defaults::SERVER_GRACE,
            client_timeout_unit: crate::defaults::CLIENT_TIMEOUT_UNIT,
            terminal_label: crate::timing::TERMINAL_LABEL.to_string(),
        }
    }
}

/// Everything a measurement session needs for one grid point.
#[derive(Debug, Clone)]
pub struct TrialConfig {
    pub suite: AlgorithmSuite,
    pub caching: CachingMode,
    /// Directory holding the server/client executables and credentials.
    pub workdir: PathBuf,
    /// Paired records wanted from each session.
    pub target: usize,
    /// Handshakes per client invocation.
    pub per_session: usize,
    pub restart_budget: u32,
    pub launch: LaunchSettings,
}

impl TrialConfig {
    /// Build a trial with the default restart budget of
    /// `2 * target / per_session`.
    pub fn new(
        suite: AlgorithmSuite,
        caching: CachingMode,
        workdir: impl AsRef<Path>,
        target: usize,
        per_session: usize,
        launch: LaunchSettings,
    ) -> Result<Self> {
        if target == 0 {
            bail!("Target record count must be greater than 0");
        }
        if per_session == 0 {
            bail!("Records per client invocation must be greater than 0");
        }
        Ok(Self {
            suite,
            caching,
            workdir: workdir.as_ref().to_path_buf(),
            target,
            per_session,
            restart_budget: default_restart_budget(target, per_session),
            launch,
        })
    }

    pub fn mode(&self) -> HandshakeMode {
        self.suite.mode
    }

    pub fn client_timeout(&self) -> Duration {
        self.launch.client_timeout_unit * (2 * self.per_session) as u32
    }

    /// `<server> --certs <cert> --key <key> -p <port> http`
    pub fn server_command(&self, port: u16) -> CommandSpec {
        let (binary, cert, key) = match (self.mode(), self.caching) {
            (HandshakeMode::Sign, CachingMode::Cached) => ("pqtlsserver", "signing.crt", "signing.key"),
            (HandshakeMode::Sign, CachingMode::FullChain) => {
                ("pqtlsserver", "signing.chain.crt", "signing.key")
            }
            (HandshakeMode::Kem, CachingMode::Cached) => ("kemtlsserver", "kem.crt", "kem.key"),
            (HandshakeMode::Kem, CachingMode::FullChain) => ("kemtlsserver", "kem.chain.crt", "kem.key"),
        };
        let spec = CommandSpec::new(local_binary(binary))
            .args(["--certs", cert, "--key", key, "-p"])
            .arg(port.to_string())
            .arg("http")
            .current_dir(&self.workdir);
        match self.launch.server_namespace {
            Some(ref ns) => spec.in_namespace(ns),
            None => spec,
        }
    }

    /// `<client> --cafile <ca> --loops <n> --port <port> --no-tickets --http <host>`
    pub fn client_command(&self, port: u16, loops: usize) -> CommandSpec {
        let (binary, cafile) = match (self.mode(), self.caching) {
            (HandshakeMode::Sign, CachingMode::Cached) => ("pqtlsclient", "signing-int.crt"),
            (HandshakeMode::Sign, CachingMode::FullChain) => ("pqtlsclient", "signing-ca.crt"),
            (HandshakeMode::Kem, CachingMode::Cached) => ("kemtlsclient", "kem-int.crt"),
            (HandshakeMode::Kem, CachingMode::FullChain) => ("kemtlsclient", "kem-ca.crt"),
        };
        let spec = CommandSpec::new(local_binary(binary))
            .args(["--cafile", cafile, "--loops"])
            .arg(loops.to_string())
            .arg("--port")
            .arg(port.to_string())
            .args(["--no-tickets", "--http"])
            .arg(&self.launch.hostname)
            .current_dir(&self.workdir);
        match self.launch.client_namespace {
            Some(ref ns) => spec.in_namespace(ns),
            None => spec,
        }
    }
}

/// `./<binary>`. Children run with the suite directory as working directory,
/// so the program is resolved from there whether `workdir` is relative or not.
fn local_binary(binary: &str) -> PathBuf {
    Path::new(".").join(binary)
}

pub fn default_restart_budget(target: usize, per_session: usize) -> u32 {
    (2 * target / per_session.max(1)) as u32
}
