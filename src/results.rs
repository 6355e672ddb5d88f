use crate::cli::{CachingMode, HandshakeMode};
use crate::session::PairedRecord;
use crate::sweep::GridPoint;
use crate::trial::AlgorithmSuite;
use crate::utils::chown_path;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Destination for the record collection of each grid point.
#[async_trait]
pub trait ResultSink: Send {
    async fn write(&mut self, point: &GridPoint, records: &[PairedRecord]) -> Result<()>;
}

/// One CSV file written during the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative to the output directory
    pub path: PathBuf,
    pub suite: AlgorithmSuite,
    pub caching: CachingMode,
    pub latency: String,
    pub rtt_ms: String,
    pub loss: f64,
    pub rows: usize,
    pub columns: usize,
    pub written_at: chrono::DateTime<chrono::Utc>,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// Totals across all files
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_files: usize,
    pub total_records: usize,
    pub empty_files: usize,
}

/// Contents of `manifest.json`
#[derive(Debug, Serialize, Deserialize)]
pub struct RunManifest {
    pub metadata: RunMetadata,
    pub files: Vec<FileEntry>,
    pub summary: RunSummary,
}

/// Writes one CSV per grid point under the output directory and a manifest
/// describing the whole run.
pub struct ResultsManager {
    output_dir: PathBuf,
    owner: Option<(u32, u32)>,
    run_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    files: Vec<FileEntry>,
}

impl ResultsManager {
    /// Create the output directory if needed.
    pub fn new(output_dir: &Path, owner: Option<(u32, u32)>) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let manager = Self {
            output_dir: output_dir.to_path_buf(),
            owner,
            run_id: crate::utils::generate_test_id(),
            started_at: chrono::Utc::now(),
            files: Vec::new(),
        };
        manager.hand_over(output_dir)?;
        Ok(manager)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Create `<mode>-<caching>` for every handshake mode and the given
    /// caching modes.
    pub fn prepare_directories(&self, caching_modes: &[CachingMode]) -> Result<()> {
        for mode in [HandshakeMode::Kem, HandshakeMode::Sign] {
            for caching in caching_modes {
                let dir = self.output_dir.join(format!("{}-{}", mode, caching));
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                self.hand_over(&dir)?;
            }
        }
        Ok(())
    }

    fn hand_over(&self, path: &Path) -> Result<()> {
        match self.owner {
            Some((uid, gid)) => chown_path(path, uid, gid),
            None => Ok(()),
        }
    }

    /// Write `manifest.json` and return its path.
    pub fn finalize(&self) -> Result<PathBuf> {
        info!("Finalizing run {}", self.run_id);

        let manifest = RunManifest {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                started_at: self.started_at,
                finished_at: chrono::Utc::now(),
                system_info: SystemInfo::default(),
            },
            files: self.files.clone(),
            summary: RunSummary {
                total_files: self.files.len(),
                total_records: self.files.iter().map(|f| f.rows).sum(),
                empty_files: self.files.iter().filter(|f| f.rows == 0).count(),
            },
        };

        let path = self.output_dir.join("manifest.json");
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.hand_over(&path)?;

        info!("Manifest written to: {:?}", path);
        Ok(path)
    }
}

#[async_trait]
impl ResultSink for ResultsManager {
    async fn write(&mut self, point: &GridPoint, records: &[PairedRecord]) -> Result<()> {
        let relative = point.output_id();
        let path = self.output_dir.join(&relative);
        if let Some(parent) = path.parent() {
            if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
                self.hand_over(parent)?;
            }
        }

        if records.is_empty() {
            warn!("No records collected for {}, writing an empty file", relative.display());
        }
        let mut csv = Vec::new();
        let summary = write_csv(&mut csv, records)?;
        tokio::fs::write(&path, csv)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.hand_over(&path)?;

        if summary.dropped_labels > 0 {
            warn!(
                "{} timer values in {} had labels absent from the first record and were not written",
                summary.dropped_labels,
                relative.display()
            );
        }
        info!("Wrote {} records to {}", summary.rows, path.display());

        self.files.push(FileEntry {
            path: relative,
            suite: point.suite.clone(),
            caching: point.caching,
            latency: point.latency.clone(),
            rtt_ms: point.rtt_ms.clone(),
            loss: point.loss,
            rows: summary.rows,
            columns: summary.columns,
            written_at: chrono::Utc::now(),
        });
        Ok(())
    }
}

/// What [`write_csv`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvSummary {
    pub rows: usize,
    pub columns: usize,
    /// Values whose label is not one of the header columns.
    pub dropped_labels: usize,
}

/// Write paired records as CSV.
///
/// The columns are taken from the first record: `client <label>` for each
/// client timer, then `server <label>` for each server timer, labels
/// lowercased. Later records missing a column leave it empty. An empty slice
/// produces an empty file.
pub fn write_csv<W: Write>(mut out: W, records: &[PairedRecord]) -> Result<CsvSummary> {
    let Some(first) = records.first() else {
        return Ok(CsvSummary {
            rows: 0,
            columns: 0,
            dropped_labels: 0,
        });
    };

    let client_labels: Vec<&str> = first.client.labels().collect();
    let server_labels: Vec<&str> = first.server.labels().collect();
    let header: Vec<String> = client_labels
        .iter()
        .map(|l| format!("client {}", l.to_lowercase()))
        .chain(
            server_labels
                .iter()
                .map(|l| format!("server {}", l.to_lowercase())),
        )
        .collect();
    writeln!(out, "{}", header.join(","))?;

    let client_set: BTreeSet<&str> = client_labels.iter().copied().collect();
    let server_set: BTreeSet<&str> = server_labels.iter().copied().collect();
    let mut dropped = 0;

    for record in records {
        let row: Vec<String> = client_labels
            .iter()
            .map(|l| record.client.get(l))
            .chain(server_labels.iter().map(|l| record.server.get(l)))
            .map(|v| v.map(|n| n.to_string()).unwrap_or_default())
            .collect();
        writeln!(out, "{}", row.join(","))?;

        dropped += record.client.labels().filter(|l| !client_set.contains(l)).count();
        dropped += record.server.labels().filter(|l| !server_set.contains(l)).count();
    }
    debug!("Wrote {} CSV rows with {} columns", records.len(), header.len());

    Ok(CsvSummary {
        rows: records.len(),
        columns: header.len(),
        dropped_labels: dropped,
    })
}
