use crate::trial::AlgorithmSuite;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Handshake Benchmark - paired server/client timing trials under emulated networks
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Directory holding one sub-directory of binaries per algorithm suite
    #[clap(long, default_value = crate::defaults::BIN_DIR, help_heading = "Core Options")]
    pub bin_dir: PathBuf,

    /// Directory the CSV record files and the run manifest are written to
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_DIR, help_heading = "Core Options")]
    pub output_dir: PathBuf,

    /// Emulated one-way delays to sweep (netem syntax, e.g. 15.458ms)
    #[clap(long, num_args = 1.., default_values_t = crate::defaults::LATENCIES.map(String::from).to_vec(), help_heading = "Sweep")]
    pub latencies: Vec<String>,

    /// Packet loss percentages to sweep
    #[clap(long, num_args = 1.., default_values_t = crate::defaults::LOSS_RATES.to_vec(), help_heading = "Sweep")]
    pub loss_rates: Vec<f64>,

    /// Certificate caching modes to sweep
    #[clap(long, value_enum, num_args = 1.., default_values_t = vec![CachingMode::Cached, CachingMode::FullChain], help_heading = "Sweep")]
    pub caching_modes: Vec<CachingMode>,

    /// Algorithm suite as mode:kex:leaf:intermediate:root (repeatable; replaces the built-in table)
    #[clap(long = "suite", value_parser = parse_suite, help_heading = "Sweep")]
    pub suites: Vec<AlgorithmSuite>,

    /// JSON file with a list of algorithm suites (replaces the built-in table)
    #[clap(long, conflicts_with = "suites", help_heading = "Sweep")]
    pub suites_file: Option<PathBuf>,

    /// Times the worker pool is run per grid point
    #[clap(short = 'r', long, default_value_t = crate::defaults::REPETITIONS, help_heading = "Sweep")]
    pub repetitions: usize,

    /// Number of concurrent sessions (one port each)
    #[clap(short = 'c', long, default_value_t = crate::defaults::POOL_SIZE, help_heading = "Measurement")]
    pub pool_size: usize,

    /// First port of the reserved range
    #[clap(long, default_value_t = crate::defaults::BASE_PORT, help_heading = "Measurement")]
    pub base_port: u16,

    /// Paired records collected by each session
    #[clap(long, default_value_t = crate::defaults::MEASUREMENTS_PER_PROCESS, help_heading = "Measurement")]
    pub measurements_per_process: usize,

    /// Handshakes per client invocation
    #[clap(long, default_value_t = crate::defaults::MEASUREMENTS_PER_CLIENT, help_heading = "Measurement")]
    pub measurements_per_client: usize,

    /// Server restarts allowed per session (default: 2 * per-process / per-client)
    #[clap(long, help_heading = "Measurement")]
    pub restart_budget: Option<u32>,

    /// Delay after starting a server before the first client connects
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Measurement")]
    pub warmup: Duration,

    /// Time a terminated server gets to exit before it is killed
    #[clap(long, value_parser = parse_duration, default_value = "5s", help_heading = "Measurement")]
    pub server_grace: Duration,

    /// Client time limit per handshake in its batch (limit = 2 * per-client * unit)
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Measurement")]
    pub client_timeout_unit: Duration,

    /// Server name given to the client (default: reverse lookup of --resolve-from)
    #[clap(long, help_heading = "Network")]
    pub hostname: Option<String>,

    /// Address whose reverse lookup yields the server name
    #[clap(long, default_value = crate::defaults::RESOLVE_FROM, help_heading = "Network")]
    pub resolve_from: IpAddr,

    /// Pings sent to measure the emulated round-trip time
    #[clap(long, default_value_t = crate::defaults::NUM_PINGS, help_heading = "Network")]
    pub num_pings: u32,

    /// Network namespace of the server
    #[clap(long, default_value = crate::defaults::SERVER_NAMESPACE, help_heading = "Network")]
    pub server_namespace: String,

    /// Network namespace of the client
    #[clap(long, default_value = crate::defaults::CLIENT_NAMESPACE, help_heading = "Network")]
    pub client_namespace: String,

    /// Emulated device inside the server namespace
    #[clap(long, default_value = crate::defaults::SERVER_DEVICE, help_heading = "Network")]
    pub server_device: String,

    /// Emulated device inside the client namespace
    #[clap(long, default_value = crate::defaults::CLIENT_DEVICE, help_heading = "Network")]
    pub client_device: String,

    /// Run binaries directly on this host without namespaces or netem
    #[clap(long, default_value_t = false, help_heading = "Network")]
    pub no_netns: bool,

    /// Hand output directories and files to uid:gid
    #[clap(long, value_parser = parse_owner, help_heading = "Output")]
    pub owner: Option<(u32, u32)>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

/// How the server authenticates during the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeMode {
    /// Signature-authenticated handshake
    #[clap(name = "sign")]
    Sign,

    /// Key-encapsulation-authenticated handshake
    #[clap(name = "kem")]
    Kem,
}

impl std::fmt::Display for HandshakeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeMode::Sign => write!(f, "sign"),
            HandshakeMode::Kem => write!(f, "kem"),
        }
    }
}

/// Whether the client already holds the intermediate certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum CachingMode {
    /// Intermediate certificate cached by the client; server sends the leaf only
    #[clap(name = "cached")]
    #[serde(rename = "cached")]
    Cached,

    /// Server sends the full certificate chain
    #[clap(name = "int-chain")]
    #[serde(rename = "int-chain")]
    FullChain,
}

impl std::fmt::Display for CachingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachingMode::Cached => write!(f, "cached"),
            CachingMode::FullChain => write!(f, "int-chain"),
        }
    }
}

impl CachingMode {
    pub fn describe(&self) -> &'static str {
        match self {
            CachingMode::Cached => "cached intermediate",
            CachingMode::FullChain => "full cert chain",
        }
    }
}

fn parse_suite(s: &str) -> Result<AlgorithmSuite, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

/// Parse `uid:gid`
fn parse_owner(s: &str) -> Result<(u32, u32), String> {
    let (uid, gid) = s
        .split_once(':')
        .ok_or_else(|| format!("Invalid owner '{}': expected uid:gid", s))?;
    let uid = uid
        .trim()
        .parse()
        .map_err(|_| format!("Invalid uid in owner: {}", uid))?;
    let gid = gid
        .trim()
        .parse()
        .map_err(|_| format!("Invalid gid in owner: {}", gid))?;
    Ok((uid, gid))
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_owner() {
        assert_eq!(parse_owner("1001:1001").unwrap(), (1001, 1001));
        assert_eq!(parse_owner("0:100").unwrap(), (0, 100));
        assert!(parse_owner("1001").is_err());
        assert!(parse_owner("a:b").is_err());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(HandshakeMode::Sign.to_string(), "sign");
        assert_eq!(HandshakeMode::Kem.to_string(), "kem");
        assert_eq!(CachingMode::Cached.to_string(), "cached");
        assert_eq!(CachingMode::FullChain.to_string(), "int-chain");
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["handshake-bench"]);
        assert_eq!(args.pool_size, 40);
        assert_eq!(args.base_port, 10000);
        assert_eq!(args.measurements_per_process, 400);
        assert_eq!(args.measurements_per_client, 100);
        assert_eq!(args.repetitions, 2);
        assert_eq!(args.latencies, vec!["15.458ms", "97.73ms"]);
        assert_eq!(args.loss_rates, vec![0.0, 5.0]);
        assert_eq!(
            args.caching_modes,
            vec![CachingMode::Cached, CachingMode::FullChain]
        );
        assert!(args.suites.is_empty());
        assert_eq!(args.warmup, Duration::from_secs(1));
        assert_eq!(args.server_grace, Duration::from_secs(5));
        assert!(!args.no_netns);
    }

    #[test]
    fn test_suite_and_owner_flags() {
        let args = Args::parse_from([
            "handshake-bench",
            "--suite",
            "sign:X25519:RSA2048:RSA2048:RSA2048",
            "--suite",
            "kem:kyber512:Dilithium2:Dilithium2:Dilithium2",
            "--owner",
            "1001:1001",
            "-vv",
            "--latencies",
            "2.684ms",
            "--loss-rates",
            "0",
            "0.5",
        ]);
        assert_eq!(args.suites.len(), 2);
        assert_eq!(args.suites[1].mode, HandshakeMode::Kem);
        assert_eq!(args.owner, Some((1001, 1001)));
        assert_eq!(args.verbose, 2);
        assert_eq!(args.latencies, vec!["2.684ms"]);
        assert_eq!(args.loss_rates, vec![0.0, 0.5]);
    }

    #[test]
    fn test_bad_suite_rejected() {
        assert!(Args::try_parse_from(["handshake-bench", "--suite", "tls:a:b:c:d"]).is_err());
    }
}
