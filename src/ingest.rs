//! Row-group orchestration.
//!
//! Drives every discovered input file through read → correct → enrich →
//! accumulate, checkpointing after each row-group, then merges the
//! accumulated rows into the output file, records the verdict in the
//! status ledger and removes the source. A failing file is marked
//! `failed`, left in place, and the run moves on.
//!
//! Only store unavailability during startup aborts a run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::connector_fs;
use crate::correct::DeviceCorrector;
use crate::enrich::Enricher;
use crate::error::PipelineError;
use crate::geocode::GeocodeFetcher;
use crate::kv::KvStore;
use crate::location::LocationCache;
use crate::mapping::MappingStore;
use crate::models::DeviceRecord;
use crate::parquet_io::{self, ParquetSource, WriteSummary};
use crate::progress::{
    format_number, CheckpointFile, FileStatus, ProgressCheckpoint, StatusLedger,
};
use crate::vendor::VendorSet;

/// Counters for one input file.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub row_groups: u64,
    pub final_counter: u64,
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
    pub locations_resolved: u64,
    pub write: WriteSummary,
}

/// Counters for a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub files_succeeded: Vec<String>,
    pub files_failed: Vec<String>,
    pub row_groups: u64,
    pub records_in: u64,
    pub records_out: u64,
    pub records_dropped: u64,
    pub duplicates_skipped: u64,
    pub expired_purged: u64,
}

impl RunSummary {
    fn add(&mut self, file: String, report: &FileReport) {
        self.files_succeeded.push(file);
        self.row_groups += report.row_groups;
        self.records_in += report.records_in;
        self.records_out += report.write.written_rows as u64;
        self.records_dropped += report.records_dropped;
        self.duplicates_skipped += report.write.skipped_duplicates as u64;
    }

    pub fn print(&self) {
        println!("run {}", self.run_id);
        println!("  files succeeded: {}", self.files_succeeded.len());
        println!("  files failed: {}", self.files_failed.len());
        for file in &self.files_failed {
            println!("    - {}", file);
        }
        println!("  row groups: {}", format_number(self.row_groups));
        println!("  records read: {}", format_number(self.records_in));
        println!("  records written: {}", format_number(self.records_out));
        println!("  records dropped: {}", format_number(self.records_dropped));
        if self.duplicates_skipped > 0 {
            println!(
                "  duplicates skipped: {}",
                format_number(self.duplicates_skipped)
            );
        }
        println!("  expired cache entries purged: {}", self.expired_purged);
        println!("ok");
    }
}

/// The row-group orchestrator and the clients it owns.
pub struct Pipeline {
    config: Config,
    mapping: MappingStore,
    cache: LocationCache,
    checkpoint: CheckpointFile,
    ledger: StatusLedger,
}

impl Pipeline {
    pub fn new(config: Config, kv: Arc<dyn KvStore>, fetcher: GeocodeFetcher) -> Self {
        let mapping = MappingStore::new(kv.clone(), config.vendors.default_list());
        let cache = LocationCache::new(kv, fetcher, config.geocoder.cache_ttl());
        let checkpoint = CheckpointFile::new(&config.paths.progress_file);
        let ledger = StatusLedger::new(&config.paths.status_file);
        Self {
            config,
            mapping,
            cache,
            checkpoint,
            ledger,
        }
    }

    /// Process every input file once.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", run_id = %run_id);
        let mut summary = self.run_inner().instrument(span).await?;
        summary.run_id = run_id;
        Ok(summary)
    }

    async fn run_inner(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        summary.expired_purged = self.cache.purge_expired().await?;
        if summary.expired_purged > 0 {
            info!(purged = summary.expired_purged, "purged expired cache entries");
        }

        let vendors = self.mapping.load_or_create_vendors().await?;
        let models = self.mapping.get_model_mapping().await?.len();
        info!(vendors = vendors.len(), models, "mapping store loaded");

        let checkpoint = self.checkpoint.load();
        if let Some(cp) = &checkpoint {
            info!(file = %cp.file, row_count = cp.row_count, "found checkpoint");
        }

        let inputs = connector_fs::discover_inputs(&self.config.paths)?;
        std::fs::create_dir_all(&self.config.paths.output_dir).with_context(|| {
            format!(
                "Failed to create output directory: {}",
                self.config.paths.output_dir.display()
            )
        })?;
        info!(files = inputs.len(), "starting integrated processing");

        for path in inputs {
            if !path.exists() {
                warn!(file = %path.display(), "input disappeared, skipping");
                continue;
            }
            let name = file_name(&path);
            let span = info_span!("file", file = %name);

            match self
                .process_file(&path, &vendors, checkpoint.as_ref())
                .instrument(span)
                .await
            {
                Ok(report) => {
                    self.record_status(&name, FileStatus::Success);
                    info!(
                        file = %name,
                        row_groups = report.row_groups,
                        written = report.write.written_rows,
                        dropped = report.records_dropped,
                        "file processed"
                    );
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(file = %path.display(), error = %e, "failed to remove processed input");
                    }
                    summary.add(name, &report);
                }
                Err(e) => {
                    self.record_status(&name, FileStatus::Failed);
                    error!(file = %name, error = %e, "file failed, leaving source in place");
                    summary.files_failed.push(name);
                }
            }
        }

        info!(
            succeeded = summary.files_succeeded.len(),
            failed = summary.files_failed.len(),
            "processing completed"
        );
        Ok(summary)
    }

    fn record_status(&self, name: &str, status: FileStatus) {
        if let Err(e) = self.ledger.record(name, status) {
            error!(file = %name, error = %e, "failed to update status ledger");
        }
    }

    async fn process_file(
        &self,
        path: &Path,
        vendors: &VendorSet,
        checkpoint: Option<&ProgressCheckpoint>,
    ) -> std::result::Result<FileReport, PipelineError> {
        self.process_file_inner(path, vendors, checkpoint)
            .await
            .map_err(|e| PipelineError::FileProcessing {
                file: path.display().to_string(),
                reason: format!("{:#}", e),
            })
    }

    async fn process_file_inner(
        &self,
        path: &Path,
        vendors: &VendorSet,
        checkpoint: Option<&ProgressCheckpoint>,
    ) -> Result<FileReport> {
        let source = ParquetSource::open(path)?;
        let corrector = DeviceCorrector::new(vendors, &self.mapping);
        let enricher = Enricher::new(&self.cache);

        let mut report = FileReport::default();
        let mut counter = ProgressCheckpoint::resume_offset(checkpoint, path);
        if counter > 0 {
            info!(row_count = counter, "resuming row-group counter from checkpoint");
        }

        let file_id = path.display().to_string();
        let mut accumulated: Vec<DeviceRecord> = Vec::new();

        for index in 0..source.num_row_groups() {
            let records = source.read_row_group(index).await?;
            report.records_in += records.len() as u64;

            let corrected = corrector.correct_batch(records).await?;
            let enriched = enricher.enrich_batch(corrected.records).await?;

            report.records_dropped += (corrected.dropped + enriched.dropped) as u64;
            report.locations_resolved += enriched.resolved as u64;
            report.records_out += enriched.records.len() as u64;
            accumulated.extend(enriched.records);

            counter += 1;
            report.row_groups += 1;
            self.checkpoint
                .save(&ProgressCheckpoint::new(file_id.clone(), counter))?;
            info!(
                row_group = index,
                processed = counter,
                "row group processed"
            );
        }
        report.final_counter = counter;

        let output = self.output_path(path);
        report.write =
            parquet_io::write_output(output.clone(), accumulated, self.config.output.clone())
                .await?;
        info!(output = %output.display(), "output written");
        Ok(report)
    }

    fn output_path(&self, input: &Path) -> PathBuf {
        self.config.paths.output_dir.join(file_name(input))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
