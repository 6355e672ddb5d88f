//! # Worker Pool
//!
//! Runs one [`MeasurementSession`] per port of a contiguous port range, all at
//! the same time, and merges what they return. The merged collection has no
//! meaningful order across sessions.
//!
//! The pool never cancels a session. It waits for every one of them to
//! finish; if any session failed (a desynchronised port, a binary that could
//! not be spawned) the whole grid point fails with the first error observed,
//! once the remaining sessions are done.

use crate::error::HarnessError;
use crate::session::{MeasurementSession, PairedRecord, SessionResult};
use crate::trial::TrialConfig;
use crate::utils::validate_port;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Something that can produce the paired records of one trial.
#[async_trait]
pub trait TrialRunner: Send + Sync {
    async fn run_trial(&self, trial: &TrialConfig) -> Result<Vec<PairedRecord>>;
}

/// Fixed-size pool of sessions over `base_port .. base_port + size`.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    base_port: u16,
    size: usize,
}

impl WorkerPool {
    pub fn new(base_port: u16, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(HarnessError::PortRange("pool size must be greater than 0".into()).into());
        }
        validate_port(base_port).map_err(|e| HarnessError::PortRange(e.to_string()))?;
        if base_port as usize + size - 1 > u16::MAX as usize {
            return Err(HarnessError::PortRange(format!(
                "{} ports starting at {} run past {}",
                size,
                base_port,
                u16::MAX
            ))
            .into());
        }
        Ok(Self { base_port, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let base = self.base_port;
        (0..self.size).map(move |i| base + i as u16)
    }

    /// Run one session per port and return all of their records.
    pub async fn run(&self, trial: &TrialConfig) -> Result<Vec<PairedRecord>> {
        let started = Instant::now();
        let trial = Arc::new(trial.clone());
        info!(
            "[+] Starting {} sessions on {} for {}",
            self.size,
            trial.workdir.display(),
            trial.mode()
        );

        let results = run_sessions(self.ports(), |port| {
            let session = MeasurementSession::new(Arc::clone(&trial), port);
            async move { session.run().await }
        })
        .await?;

        let restarts: u32 = results.iter().map(|r| r.restarts).sum();
        let failed: u32 = results.iter().map(|r| r.failed_batches).sum();
        let short = results.iter().filter(|r| r.len() < trial.target).count();
        let records: Vec<PairedRecord> = results.into_iter().flat_map(|r| r.records).collect();
        info!(
            "[+] Collected {} paired records in {} ({} restarts, {} failed batches, {} short sessions)",
            records.len(),
            crate::utils::format_duration(started.elapsed()),
            restarts,
            failed,
            short
        );
        Ok(records)
    }
}

#[async_trait]
impl TrialRunner for WorkerPool {
    async fn run_trial(&self, trial: &TrialConfig) -> Result<Vec<PairedRecord>> {
        self.run(trial).await
    }
}

/// Spawn `session(port)` for every port and wait for all of them.
///
/// Results are returned in completion order. When any session fails, the
/// remaining ones still run to completion and the first failure is returned.
pub async fn run_sessions<P, F, Fut>(ports: P, mut session: F) -> Result<Vec<SessionResult>>
where
    P: IntoIterator<Item = u16>,
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<SessionResult>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for port in ports {
        set.spawn(session(port));
    }

    let mut results = Vec::with_capacity(set.len());
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let outcome = joined.map_err(|e| anyhow!("session task failed: {}", e)).and_then(|r| r);
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                error!("Session failed: {:#}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingRecord;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn simulated(port: u16, count: usize) -> SessionResult {
        let record = |side: &str| -> TimingRecord { [(side, port as u64)].into_iter().collect() };
        let server = (0..count).map(|_| record("SERVER")).collect();
        let client = (0..count).map(|_| record("CLIENT")).collect();
        SessionResult::pair(port, server, client, 0).unwrap()
    }

    #[test]
    fn test_port_range() {
        let pool = WorkerPool::new(10000, 40).unwrap();
        let ports: Vec<u16> = pool.ports().collect();
        assert_eq!(ports.len(), 40);
        assert_eq!(ports[0], 10000);
        assert_eq!(ports[39], 10039);

        assert!(WorkerPool::new(10000, 0).is_err());
        assert!(WorkerPool::new(80, 4).is_err());
        assert!(WorkerPool::new(65530, 6).is_ok());
        let err = WorkerPool::new(65530, 7).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::PortRange(_))
        ));
    }

    #[tokio::test]
    async fn test_aggregate_size_independent_of_completion_order() {
        let ports: Vec<u16> = (10000..10016).collect();
        let sizes: Vec<usize> = ports.iter().map(|p| (*p as usize % 5) + 1).collect();
        let expected: usize = sizes.iter().sum();

        for _ in 0..4 {
            // Permute the simulated completion timing for every round.
            let mut delays: Vec<u64> = (0..ports.len() as u64).map(|i| i * 3).collect();
            delays.shuffle(&mut rand::thread_rng());
            let jitter: u64 = rand::thread_rng().gen_range(0..3);

            let plan: Vec<(u16, usize, u64)> = ports
                .iter()
                .zip(&sizes)
                .zip(&delays)
                .map(|((p, s), d)| (*p, *s, d + jitter))
                .collect();

            let results = run_sessions(plan.iter().map(|(p, _, _)| *p), |port| {
                let (_, size, delay) = *plan.iter().find(|(p, _, _)| *p == port).unwrap();
                async move {
                    sleep(Duration::from_millis(delay)).await;
                    Ok::<_, anyhow::Error>(simulated(port, size))
                }
            })
            .await
            .unwrap();

            assert_eq!(results.len(), ports.len());
            let total: usize = results.iter().map(|r| r.len()).sum();
            assert_eq!(total, expected);

            let mut seen: Vec<u16> = results.iter().map(|r| r.port).collect();
            seen.sort_unstable();
            assert_eq!(seen, ports);
        }
    }

    #[tokio::test]
    async fn test_one_desync_fails_the_point_after_all_sessions_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);

        let err = run_sessions(10000..10008, move |port| {
            let counter = Arc::clone(&counter);
            async move {
                if port == 10003 {
                    return Err(anyhow::Error::from(HarnessError::Desync {
                        port,
                        server: 399,
                        client: 400,
                    }));
                }
                sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(simulated(port, 2))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(finished.load(Ordering::SeqCst), 7);
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::Desync { port, .. }) => assert_eq!(*port, 10003),
            other => panic!("expected desync, got {:?}", other),
        }
    }

    async fn explode(_port: u16) -> Result<SessionResult> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_session_is_reported() {
        let err = run_sessions([10000u16], explode).await.unwrap_err();
        assert!(err.to_string().contains("session task failed"));
    }
}
