//! # Measurement Session
//!
//! A session owns one reserved port for the duration of a grid point. It
//! keeps one handshake server running on that port and repeatedly invokes the
//! client against it until enough handshakes have been timed on both sides.
//!
//! ## Lifecycle
//!
//! 1. **Server start**: the server's standard output is handed to a reader
//!    task which parses it continuously and forwards each sealed record over
//!    a bounded channel, stopping once the target count is reached.
//! 2. **Warm-up**: a fixed delay so the server can start accepting.
//! 3. **Client batches**: each invocation performs at most `per_session`
//!    handshakes and must finish within `2 * per_session` timeout units.
//! 4. **Restart on stall**: a client timeout means the server stopped
//!    answering. Every client record of the session is dropped, the server is
//!    replaced by a fresh one, and collection starts again from zero. The
//!    number of restarts is bounded by the trial's restart budget. A client
//!    that finishes without a single sealed record (refused connection,
//!    missing trust file) is charged to the same budget, so a session never
//!    spins on clients that cannot make progress.
//! 5. **Shutdown**: the server gets SIGTERM, then SIGKILL after the grace
//!    period, and the records its reader collected are drained.
//! 6. **Pairing**: the i-th server record is paired with the i-th client
//!    record. Unequal counts mean the two sides disagree about which
//!    handshakes happened, which is reported as [`HarnessError::Desync`].
//!
//! Exhausting the restart budget is not an error: the session returns
//! whatever it has, which may be fewer records than requested.

use crate::error::HarnessError;
use crate::process::{run_bounded, BoundedOutcome, ManagedProcess};
use crate::timing::{TimingParser, TimingRecord};
use crate::trial::TrialConfig;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, Lines};
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Server- and client-side timers of the same handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedRecord {
    pub server: TimingRecord,
    pub client: TimingRecord,
}

/// Everything one session produced.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub port: u16,
    /// Paired in arrival order.
    pub records: Vec<PairedRecord>,
    pub restarts: u32,
    /// Client batches that completed without producing a record.
    pub failed_batches: u32,
}

impl SessionResult {
    /// Pair server and client records positionally.
    ///
    /// Fails with [`HarnessError::Desync`] when the counts differ.
    pub fn pair(
        port: u16,
        server: Vec<TimingRecord>,
        client: Vec<TimingRecord>,
        restarts: u32,
    ) -> Result<Self> {
        if server.len() != client.len() {
            return Err(HarnessError::Desync {
                port,
                server: server.len(),
                client: client.len(),
            }
            .into());
        }
        let records = server
            .into_iter()
            .zip(client)
            .map(|(server, client)| PairedRecord { server, client })
            .collect();
        Ok(Self {
            port,
            records,
            restarts,
            failed_batches: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A server process together with the task reading its output.
struct RunningServer {
    process: ManagedProcess,
    reader: Option<JoinHandle<()>>,
    records: mpsc::Receiver<TimingRecord>,
}

impl RunningServer {
    fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Shut the server down and return every record its reader forwarded.
    async fn stop(&mut self, grace: Duration) -> Result<Vec<TimingRecord>> {
        self.process.terminate(grace).await?;

        if let Some(mut reader) = self.reader.take() {
            match timeout(grace, &mut reader).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Server output reader failed: {}", e),
                Err(_) => {
                    warn!("Server output reader did not finish within {:?}, aborting it", grace);
                    reader.abort();
                }
            }
        }

        let mut collected = Vec::new();
        while let Ok(record) = self.records.try_recv() {
            collected.push(record);
        }
        Ok(collected)
    }
}

/// Forward sealed server records until `cap` have been sent or the stream
/// ends.
async fn forward_server_records(
    port: u16,
    mut lines: Lines<BufReader<ChildStdout>>,
    mut parser: TimingParser,
    records: mpsc::Sender<TimingRecord>,
    cap: usize,
) {
    let mut sent = 0;
    while sent < cap {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(record) = parser.feed(&line) {
                    if records.send(record).await.is_err() {
                        break;
                    }
                    sent += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Reading server output on port {} failed: {}", port, e);
                break;
            }
        }
    }
    debug!("Server reader on port {} collected {} records", port, sent);
}

/// One server plus its client invocations on a single reserved port.
#[derive(Debug, Clone)]
pub struct MeasurementSession {
    trial: Arc<TrialConfig>,
    port: u16,
}

impl MeasurementSession {
    pub fn new(trial: Arc<TrialConfig>, port: u16) -> Self {
        Self { trial, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Collect up to `target` paired records on this session's port.
    pub async fn run(&self) -> Result<SessionResult> {
        let grace = self.trial.launch.server_grace;
        let mut server = self.start_server().await?;

        let collected = self.collect_client_records(&mut server).await;
        // The server is stopped on every path before the outcome is looked at.
        let server_records = server.stop(grace).await;
        let (client_records, restarts, failed_batches) = collected?;
        let server_records = server_records?;

        match SessionResult::pair(self.port, server_records, client_records, restarts) {
            Ok(mut result) => {
                result.failed_batches = failed_batches;
                debug!(
                    "Session on port {} finished with {} paired records after {} restarts",
                    self.port,
                    result.len(),
                    restarts
                );
                Ok(result)
            }
            Err(e) => {
                error!("[!] {}", e);
                Err(e)
            }
        }
    }

    async fn start_server(&self) -> Result<RunningServer> {
        let spec = self.trial.server_command(self.port);
        let mut process = ManagedProcess::start(&spec, format!("server on port {}", self.port))?;
        let lines = process.take_stdout()?;

        let (tx, rx) = mpsc::channel(self.trial.target.max(1));
        let parser = TimingParser::new(self.trial.launch.terminal_label.clone());
        let reader = tokio::spawn(forward_server_records(
            self.port,
            lines,
            parser,
            tx,
            self.trial.target,
        ));

        sleep(self.trial.launch.warmup).await;
        Ok(RunningServer {
            process,
            reader: Some(reader),
            records: rx,
        })
    }

    /// Run client batches until the target is met, the server dies, or the
    /// restart budget is spent. Returns the client records, the number of
    /// restarts and the number of batches that produced nothing.
    async fn collect_client_records(
        &self,
        server: &mut RunningServer,
    ) -> Result<(Vec<TimingRecord>, u32, u32)> {
        let trial = &self.trial;
        let mut client_records: Vec<TimingRecord> = Vec::new();
        let mut restarts = 0;
        let mut failed_batches = 0;

        while client_records.len() < trial.target
            && server.is_alive()
            && restarts + failed_batches < trial.restart_budget
        {
            let loops = (trial.target - client_records.len()).min(trial.per_session);
            let spec = trial.client_command(self.port, loops);

            match run_bounded(&spec, trial.client_timeout()).await? {
                BoundedOutcome::Completed { status, stdout } => {
                    if !status.success() {
                        warn!("Client on port {} exited with {}", self.port, status);
                    }
                    let batch = TimingParser::parse_output(&trial.launch.terminal_label, &stdout);
                    debug!(
                        "Client batch on port {} produced {} of {} records",
                        self.port,
                        batch.len(),
                        loops
                    );
                    if batch.is_empty() {
                        warn!(
                            "Client on port {} completed without a handshake, charging the restart budget",
                            self.port
                        );
                        failed_batches += 1;
                    }
                    client_records.extend(batch);
                }
                BoundedOutcome::TimedOut => {
                    warn!(
                        "Server on port {} stopped responding, restarting measurements ({} client records dropped)",
                        self.port,
                        client_records.len()
                    );
                    client_records.clear();
                    let dropped = server.stop(trial.launch.server_grace).await?;
                    debug!("Dropped {} server records on port {}", dropped.len(), self.port);
                    *server = self.start_server().await?;
                    restarts += 1;
                }
            }
        }

        if client_records.len() < trial.target {
            if restarts + failed_batches >= trial.restart_budget {
                warn!(
                    "Restart budget of {} exhausted on port {}, keeping {} of {} records",
                    trial.restart_budget,
                    self.port,
                    client_records.len(),
                    trial.target
                );
            } else {
                info!(
                    "Server on port {} exited after {} of {} records",
                    self.port,
                    client_records.len(),
                    trial.target
                );
            }
        }

        Ok((client_records, restarts, failed_batches))
    }
}
