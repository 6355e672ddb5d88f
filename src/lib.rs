//! # Handshake Benchmark Harness Library
//!
//! Drives reproducible handshake timing trials: for every point of a sweep
//! over emulated latency, packet loss, algorithm suite and certificate
//! caching mode, it launches paired server and client programs, collects the
//! per-handshake timer breakdowns both endpoints print, pairs them, and writes
//! the matched records out.
//!
//! ## Architecture Overview
//!
//! - `timing`: parses timer lines into per-handshake records
//! - `process`: owned child processes with bounded waits and graceful shutdown
//! - `session`: one server and its client invocations on one reserved port
//! - `pool`: one session per port, run concurrently
//! - `emulation`: netem shaping of the emulated links and RTT probing
//! - `sweep`: grid traversal, repetitions and output naming
//! - `results`: CSV record files and the run manifest
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use handshake_bench::cli::{CachingMode, HandshakeMode};
//! use handshake_bench::trial::{AlgorithmSuite, LaunchSettings, TrialConfig};
//! use handshake_bench::WorkerPool;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let suite = AlgorithmSuite::new(HandshakeMode::Kem, "kyber512", "Dilithium2", "Dilithium2", "Dilithium2");
//!     let trial = TrialConfig::new(
//!         suite,
//!         CachingMode::Cached,
//!         "bin/kyber512-Dilithium2-Dilithium2-Dilithium2",
//!         400,
//!         100,
//!         LaunchSettings::default(),
//!     )?;
//!
//!     let pool = WorkerPool::new(10000, 40)?;
//!     let records = pool.run(&trial).await?;
//!     println!("collected {} paired handshakes", records.len());
//!     Ok(())
//! }
//! ```

/// Command-line interface and the enumerations shared with configuration
pub mod cli;

/// Network emulation: netem qdisc updates on both emulated links and RTT
/// measurement with `ping`. A failed command aborts the run.
pub mod emulation;

/// Typed error conditions (`thiserror`) carried inside `anyhow::Error`
pub mod error;

pub mod logging;

/// Concurrent execution of one measurement session per reserved port
pub mod pool;

/// Child process handles: line-by-line reading, bounded waits, and
/// SIGTERM-then-SIGKILL shutdown
pub mod process;

/// CSV record files per grid point and the JSON run manifest
pub mod results;

/// A measurement session: one server, repeated client batches, restart on
/// stalls, and the server/client pairing invariant
pub mod session;

/// Sweep traversal over latency, caching mode, suite, loss rate and
/// repetitions
pub mod sweep;

/// Timer line parsing into per-handshake records
pub mod timing;

/// Per-grid-point trial configuration and derived command lines
pub mod trial;

pub mod utils;

pub use error::HarnessError;
pub use pool::WorkerPool;
pub use results::ResultsManager;
pub use session::{MeasurementSession, PairedRecord, SessionResult};
pub use sweep::{SweepConfig, SweepController};
pub use timing::{TimingParser, TimingRecord};
pub use trial::TrialConfig;

/// The current version of the handshake benchmark harness
///
/// Recorded in the run manifest for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// These reproduce the parameters of the reference experiment: 40 concurrent
/// sessions, 400 paired handshakes per session in client batches of 100,
/// two repetitions per grid point.
pub mod defaults {
    use crate::cli::HandshakeMode::{Kem, Sign};
    use crate::trial::AlgorithmSuite;
    use std::time::Duration;

    /// Concurrent sessions, one reserved port each
    pub const POOL_SIZE: usize = 40;

    /// First port of the reserved range
    pub const BASE_PORT: u16 = 10000;

    /// Paired records each session aims to collect
    pub const MEASUREMENTS_PER_PROCESS: usize = 400;

    /// Handshakes per client invocation
    pub const MEASUREMENTS_PER_CLIENT: usize = 100;

    /// Worker pool runs per grid point
    pub const REPETITIONS: usize = 2;

    pub const LATENCIES: [&str; 2] = ["15.458ms", "97.73ms"];

    pub const LOSS_RATES: [f64; 2] = [0.0, 5.0];

    /// Pings used to measure the emulated round-trip time
    pub const NUM_PINGS: u32 = 50;

    /// Delay between starting a server and the first client
    pub const WARMUP: Duration = Duration::from_secs(1);

    /// Time a terminated server gets before it is killed
    pub const SERVER_GRACE: Duration = Duration::from_secs(5);

    /// Client time limit per handshake of a batch, doubled
    pub const CLIENT_TIMEOUT_UNIT: Duration = Duration::from_secs(1);

    pub const HOSTNAME: &str = "servername";
    pub const RESOLVE_FROM: &str = "10.99.0.1";

    pub const SERVER_NAMESPACE: &str = "srv_ns";
    pub const CLIENT_NAMESPACE: &str = "cli_ns";
    pub const SERVER_DEVICE: &str = "srv_ve";
    pub const CLIENT_DEVICE: &str = "cli_ve";

    pub const BIN_DIR: &str = "bin";
    pub const OUTPUT_DIR: &str = "data";

    /// The algorithm table of the reference experiment
    pub fn suites() -> Vec<AlgorithmSuite> {
        const TABLE: [(crate::cli::HandshakeMode, &str, &str, &str, &str); 14] = [
            (Sign, "X25519", "RSA2048", "RSA2048", "RSA2048"),
            (Sign, "sikep434compressed", "Falcon512", "XMSS", "RainbowIaCyclic"),
            (Sign, "sikep434compressed", "Falcon512", "XMSS", "Gemss128"),
            (Sign, "sikep434compressed", "Falcon512", "RainbowIaCyclic", "RainbowIaCyclic"),
            (Sign, "sikep434compressed", "Falcon512", "RainbowIaCyclic", "Gemss128"),
            (Sign, "kyber512", "Dilithium2", "Dilithium2", "Dilithium2"),
            (Sign, "ntruhps2048509", "Falcon512", "Falcon512", "Falcon512"),
            (Kem, "X25519", "RSA2048", "RSA2048", "RSA2048"),
            (Kem, "sikep434compressed", "Falcon512", "XMSS", "RainbowIaCyclic"),
            (Kem, "sikep434compressed", "Falcon512", "XMSS", "Gemss128"),
            (Kem, "sikep434compressed", "Falcon512", "RainbowIaCyclic", "RainbowIaCyclic"),
            (Kem, "sikep434compressed", "Falcon512", "Gemss128", "Gemss128"),
            (Kem, "kyber512", "Dilithium2", "Dilithium2", "Dilithium2"),
            (Kem, "ntruhps2048509", "Falcon512", "Falcon512", "Falcon512"),
        ];
        TABLE
            .iter()
            .map(|&(mode, kex, leaf, int, root)| AlgorithmSuite::new(mode, kex, leaf, int, root))
            .collect()
    }
}
