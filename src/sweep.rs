//! # Sweep Controller
//!
//! Walks the experiment grid and produces one record collection per grid
//! point. The traversal order is fixed:
//!
//! ```text
//! for latency:
//!     shape links with (latency, loss 0) and measure the RTT
//!     for caching mode, for suite:
//!         for loss rate:
//!             shape links with (latency, loss)
//!             run the worker pool `repetitions` times and concatenate
//!             hand the collection to the results sink
//! ```
//!
//! Each collection is identified by [`GridPoint::output_id`], a relative path
//! derived only from the grid coordinates and the measured RTT.

use crate::cli::{Args, CachingMode, HandshakeMode};
use crate::emulation::{LinkConditions, NetworkShaper};
use crate::pool::TrialRunner;
use crate::results::ResultSink;
use crate::session::PairedRecord;
use crate::trial::{AlgorithmSuite, LaunchSettings, TrialConfig};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Coordinates of one record collection.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPoint {
    pub latency: String,
    /// Average RTT measured for `latency`, as printed by `ping`.
    pub rtt_ms: String,
    pub caching: CachingMode,
    pub suite: AlgorithmSuite,
    pub loss: f64,
}

impl GridPoint {
    /// `<mode>-<caching>/<kex>_<kex or leaf>_<int>[_<root>]_<rtt>ms_<loss>.csv`
    ///
    /// KEM suites repeat the key exchange in the second slot because the
    /// leaf authenticates with it. The root only appears when the full chain
    /// is sent.
    pub fn output_id(&self) -> PathBuf {
        let suite = &self.suite;
        let second = match suite.mode {
            HandshakeMode::Kem => &suite.kex,
            HandshakeMode::Sign => &suite.leaf,
        };
        let mut stem = format!("{}_{}_{}", suite.kex, second, suite.intermediate);
        if self.caching == CachingMode::FullChain {
            stem.push('_');
            stem.push_str(&suite.root);
        }
        let file = format!("{}_{}ms_{}.csv", stem, self.rtt_ms, self.loss);
        PathBuf::from(format!("{}-{}", suite.mode, self.caching)).join(file)
    }

    pub fn conditions(&self) -> LinkConditions {
        LinkConditions::new(self.latency.clone(), self.loss)
    }
}

/// Everything the controller needs to run a full sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub bin_dir: PathBuf,
    pub latencies: Vec<String>,
    pub loss_rates: Vec<f64>,
    pub caching_modes: Vec<CachingMode>,
    pub suites: Vec<AlgorithmSuite>,
    pub repetitions: usize,
    pub target: usize,
    pub per_session: usize,
    /// Overrides the default of `2 * target / per_session`.
    pub restart_budget: Option<u32>,
    pub launch: LaunchSettings,
}

impl SweepConfig {
    pub fn from_args(args: &Args, hostname: String) -> Result<Self> {
        let suites = if !args.suites.is_empty() {
            args.suites.clone()
        } else if let Some(ref path) = args.suites_file {
            load_suites(path)?
        } else {
            crate::defaults::suites()
        };

        let (server_namespace, client_namespace) = if args.no_netns {
            (None, None)
        } else {
            (
                Some(args.server_namespace.clone()),
                Some(args.client_namespace.clone()),
            )
        };

        let config = Self {
            bin_dir: args.bin_dir.clone(),
            latencies: args.latencies.clone(),
            loss_rates: args.loss_rates.clone(),
            caching_modes: args.caching_modes.clone(),
            suites,
            repetitions: args.repetitions,
            target: args.measurements_per_process,
            per_session: args.measurements_per_client,
            restart_budget: args.restart_budget,
            launch: LaunchSettings {
                hostname,
                server_namespace,
                client_namespace,
                warmup: args.warmup,
                server_grace: args.server_grace,
                client_timeout_unit: args.client_timeout_unit,
                ..LaunchSettings::default()
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.latencies.is_empty() {
            bail!("At least one latency is required");
        }
        if self.loss_rates.is_empty() {
            bail!("At least one loss rate is required");
        }
        if let Some(loss) = self
            .loss_rates
            .iter()
            .find(|l| !l.is_finite() || **l < 0.0 || **l > 100.0)
        {
            bail!("Loss rate {} is not a percentage", loss);
        }
        if self.caching_modes.is_empty() {
            bail!("At least one caching mode is required");
        }
        if self.suites.is_empty() {
            bail!("At least one algorithm suite is required");
        }
        if self.repetitions == 0 {
            bail!("Repetitions must be greater than 0");
        }
        if self.target == 0 || self.per_session == 0 {
            bail!("Measurement counts must be greater than 0");
        }
        Ok(())
    }

    /// Number of record collections a full sweep produces.
    pub fn grid_size(&self) -> usize {
        self.latencies.len() * self.caching_modes.len() * self.suites.len() * self.loss_rates.len()
    }

    pub fn trial_for(&self, point: &GridPoint) -> Result<TrialConfig> {
        let mut trial = TrialConfig::new(
            point.suite.clone(),
            point.caching,
            self.bin_dir.join(point.suite.binary_dir()),
            self.target,
            self.per_session,
            self.launch.clone(),
        )?;
        if let Some(budget) = self.restart_budget {
            trial.restart_budget = budget;
        }
        Ok(trial)
    }
}

/// Read a JSON list of suites, e.g.
/// `[{"mode": "kem", "kex": "kyber512", "leaf": "Dilithium2", ...}]`.
pub fn load_suites(path: &Path) -> Result<Vec<AlgorithmSuite>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read suites file {}", path.display()))?;
    let suites: Vec<AlgorithmSuite> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse suites file {}", path.display()))?;
    Ok(suites)
}

/// Drives the sweep: shapes the network, runs trials, hands off records.
pub struct SweepController<N, R> {
    config: SweepConfig,
    shaper: N,
    runner: R,
}

impl<N: NetworkShaper, R: TrialRunner> SweepController<N, R> {
    pub fn new(config: SweepConfig, shaper: N, runner: R) -> Self {
        Self {
            config,
            shaper,
            runner,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run the whole grid, writing every collection to `sink`. Returns the
    /// number of collections written.
    pub async fn run<W: ResultSink>(&self, sink: &mut W) -> Result<usize> {
        let config = &self.config;
        let started = Instant::now();
        let mut written = 0;
        info!(
            "Sweeping {} grid points x {} repetitions",
            config.grid_size(),
            config.repetitions
        );

        for latency in &config.latencies {
            let baseline = LinkConditions::new(latency.clone(), 0.0);
            self.shaper.apply(&baseline).await?;
            let rtt_ms = self.shaper.measure_rtt_ms(&baseline).await?;

            for &caching in &config.caching_modes {
                for suite in &config.suites {
                    info!(
                        "[+] Experiment for {} {} {} {} {} for {}ms latency with {}",
                        suite.mode,
                        suite.kex,
                        suite.leaf,
                        suite.intermediate,
                        suite.root,
                        rtt_ms,
                        caching.describe()
                    );
                    for &loss in &config.loss_rates {
                        let point = GridPoint {
                            latency: latency.clone(),
                            rtt_ms: rtt_ms.clone(),
                            caching,
                            suite: suite.clone(),
                            loss,
                        };
                        let records = self.measure(&point).await?;
                        sink.write(&point, &records).await?;
                        written += 1;
                    }
                }
            }
        }

        info!(
            "Sweep finished: {} collections in {}",
            written,
            crate::utils::format_duration(started.elapsed())
        );
        Ok(written)
    }

    /// Shape the links for `point` and collect all of its repetitions.
    async fn measure(&self, point: &GridPoint) -> Result<Vec<PairedRecord>> {
        info!("[+] Measuring loss rate {}", point.loss);
        self.shaper.apply(&point.conditions()).await?;

        let trial = self.config.trial_for(point)?;
        let mut records = Vec::new();
        for repetition in 0..self.config.repetitions {
            let batch = self
                .runner
                .run_trial(&trial)
                .await
                .with_context(|| format!("Trial for {} failed", point.output_id().display()))?;
            debug!(
                "Repetition {} of {} produced {} records",
                repetition + 1,
                self.config.repetitions,
                batch.len()
            );
            records.extend(batch);
        }
        Ok(records)
    }
}
