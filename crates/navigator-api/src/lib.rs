use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use navigator_core::{
    aggregate, ingest_csv, project, BatchId, DashboardView, IngestOptions, IngestReport,
    SurveyError, Taxonomy, ViewPayload,
};
use navigator_store_sqlite::{
    BatchRecord, BatchSummary, CommitOutcome, NewBatch, SchemaStatus, SqliteStore,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "famnav.api.v1";

pub const UPLOAD_SUCCESS_MESSAGE: &str = "CSV successfully uploaded and processed.";

const MAX_ORGANIZATION_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("Only CSV files are allowed.")]
    NotCsv,
    #[error("No file uploaded.")]
    EmptyFile,
    #[error("invalid organization id: {0}")]
    InvalidOrganization(String),
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("upload did not finish within {} seconds", .0.as_secs_f64())]
    Timeout(Duration),
    #[error(transparent)]
    Survey(#[from] SurveyError),
    #[error("batch commit kept conflicting after {attempts} attempts")]
    StoreConflict { attempts: u32 },
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),
    #[error("no batch has been uploaded for organization {0}")]
    NoCurrentBatch(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Limits applied to every upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestConfig {
    pub delimiter: u8,
    pub max_invalid_ratio: f64,
    /// Budget for lock acquisition plus processing, checked before commit.
    pub upload_timeout: Duration,
    pub max_upload_bytes: usize,
    pub commit_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            max_invalid_ratio: 0.2,
            upload_timeout: Duration::from_secs(30),
            max_upload_bytes: 10 * 1024 * 1024,
            commit_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub organization_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Overrides the configured delimiter for this file.
    pub delimiter: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadOutcome {
    pub message: String,
    pub batch_id: BatchId,
    pub batch: BatchRecord,
    pub report: IngestReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReaggregateOutcome {
    pub batch_id: BatchId,
    pub source_batch_id: BatchId,
    pub batch: BatchRecord,
}

/// Facade over the ingestion pipeline and the result store.
///
/// Cheap to clone; clones share the per-organization upload locks.
#[derive(Debug, Clone)]
pub struct DashboardApi {
    db_path: PathBuf,
    taxonomy: Arc<Taxonomy>,
    config: IngestConfig,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DashboardApi {
    #[must_use]
    pub fn new(db_path: PathBuf, taxonomy: Arc<Taxonomy>, config: IngestConfig) -> Self {
        Self { db_path, taxonomy, config, locks: Arc::default() }
    }

    #[must_use]
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    #[must_use]
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn organization_lock(&self, organization_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(organization_id.to_string()).or_default())
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Parse, validate, aggregate and commit one uploaded CSV file.
    ///
    /// Uploads for the same organization are serialized. The new batch
    /// replaces the organization's current batch; nothing is committed when
    /// any step fails.
    ///
    /// # Errors
    /// Returns [`DashboardError`] describing the first failing step.
    pub fn upload_csv(&self, request: UploadRequest) -> Result<UploadOutcome, DashboardError> {
        let started = Instant::now();
        let deadline = started + self.config.upload_timeout;

        validate_organization_id(&request.organization_id)?;
        if !is_csv_filename(&request.filename) {
            return Err(DashboardError::NotCsv);
        }
        if request.bytes.is_empty() {
            return Err(DashboardError::EmptyFile);
        }
        if request.bytes.len() > self.config.max_upload_bytes {
            return Err(DashboardError::TooLarge {
                size: request.bytes.len(),
                limit: self.config.max_upload_bytes,
            });
        }

        tracing::info!(
            organization = %request.organization_id,
            filename = %request.filename,
            bytes = request.bytes.len(),
            "upload started"
        );

        let committed = self.with_organization_lock(&request.organization_id, deadline, || {
            let mut store = self.open_store()?;
            let expected = store.current_batch_id(&request.organization_id)?;

            let options = IngestOptions {
                delimiter: request.delimiter.unwrap_or(self.config.delimiter),
                max_invalid_ratio: self.config.max_invalid_ratio,
            };
            let ingested = match ingest_csv(&request.bytes, &self.taxonomy, &options) {
                Ok(ingested) => ingested,
                Err(err) => {
                    tracing::warn!(organization = %request.organization_id, error = %err, "upload rejected");
                    return Err(err.into());
                }
            };
            for warning in &ingested.report.warnings {
                tracing::warn!(organization = %request.organization_id, %warning, "column mapping warning");
            }
            for row_error in &ingested.report.row_errors {
                tracing::debug!(organization = %request.organization_id, %row_error, "row skipped");
            }

            let aggregates = aggregate(&self.taxonomy, &ingested.rows);
            let record = BatchRecord {
                batch_id: BatchId::new(),
                organization_id: request.organization_id.clone(),
                uploaded_at: OffsetDateTime::now_utc(),
                source_filename: request.filename.clone(),
                row_count: ingested.report.total_rows,
                valid_row_count: ingested.report.valid_rows,
                invalid_row_count: ingested.report.invalid_rows,
                taxonomy_version: self.taxonomy.version.clone(),
                taxonomy_fingerprint: self.taxonomy.fingerprint().to_string(),
                derived_from: None,
            };

            if Instant::now() > deadline {
                tracing::warn!(organization = %request.organization_id, "upload exceeded its time budget");
                return Err(DashboardError::Timeout(self.config.upload_timeout));
            }

            self.commit_with_retry(
                &mut store,
                NewBatch {
                    record: &record,
                    report: &ingested.report,
                    rows: &ingested.rows,
                    aggregates: &aggregates,
                },
                expected,
            )?;
            Ok((record, ingested.report))
        });
        let (record, report) = committed?;

        tracing::info!(
            organization = %record.organization_id,
            batch_id = %record.batch_id,
            valid_rows = record.valid_row_count,
            invalid_rows = record.invalid_row_count,
            elapsed_ms = started.elapsed().as_millis(),
            "upload committed"
        );

        Ok(UploadOutcome {
            message: UPLOAD_SUCCESS_MESSAGE.to_string(),
            batch_id: record.batch_id,
            batch: record,
            report,
        })
    }

    /// Run `work` while holding the organization's upload lock.
    ///
    /// Waiting for the lock counts against `deadline`. The lock entry is
    /// dropped from the map once no other caller holds it.
    fn with_organization_lock<T>(
        &self,
        organization_id: &str,
        deadline: Instant,
        work: impl FnOnce() -> Result<T, DashboardError>,
    ) -> Result<T, DashboardError> {
        let lock = self.organization_lock(organization_id);
        let result = match lock.try_lock_for(deadline.saturating_duration_since(Instant::now())) {
            Some(_guard) => work(),
            None => {
                tracing::warn!(organization = %organization_id, "upload lock wait timed out");
                Err(DashboardError::Timeout(self.config.upload_timeout))
            }
        };
        drop(lock);
        self.evict_idle_lock(organization_id);
        result
    }

    fn evict_idle_lock(&self, organization_id: &str) {
        let mut locks = self.locks.lock();
        // Clones are only handed out under the map lock, so a count of one is stable here.
        if locks.get(organization_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(organization_id);
        }
    }

    /// Commit against `expected`; on conflict retry against the pointer the
    /// store reported, up to the configured number of attempts.
    fn commit_with_retry(
        &self,
        store: &mut SqliteStore,
        batch: NewBatch<'_>,
        mut expected: Option<BatchId>,
    ) -> Result<(), DashboardError> {
        let organization_id = &batch.record.organization_id;
        for attempt in 1..=self.config.commit_attempts {
            match store.commit_batch(batch, expected)? {
                CommitOutcome::Committed => return Ok(()),
                CommitOutcome::Conflict { current } => {
                    tracing::warn!(
                        organization = %organization_id,
                        attempt,
                        expected = ?expected.map(|id| id.to_string()),
                        current = ?current.map(|id| id.to_string()),
                        "current batch moved during commit"
                    );
                    expected = current;
                }
            }
        }
        Err(DashboardError::StoreConflict { attempts: self.config.commit_attempts })
    }

    /// Project one dashboard view from the current batch, or from `batch_id`.
    ///
    /// Organizations without uploads receive empty views.
    ///
    /// # Errors
    /// Returns [`DashboardError::BatchNotFound`] for an unknown `batch_id` and
    /// [`DashboardError::Store`] when the snapshot cannot be read.
    pub fn view(
        &self,
        organization_id: &str,
        view: DashboardView,
        batch_id: Option<BatchId>,
    ) -> Result<ViewPayload, DashboardError> {
        validate_organization_id(organization_id)?;
        let store = self.open_store()?;
        let stored = store.load_aggregates(organization_id, batch_id)?;
        if let (Some(batch_id), None) = (batch_id, stored.as_ref()) {
            return Err(DashboardError::BatchNotFound(batch_id));
        }
        Ok(project(view, &self.taxonomy, stored.as_ref().map(|stored| &stored.aggregates)))
    }

    /// Batch history for one organization, newest first.
    ///
    /// # Errors
    /// Returns an error when the organization id is invalid or the store cannot be read.
    pub fn list_batches(&self, organization_id: &str) -> Result<Vec<BatchSummary>, DashboardError> {
        validate_organization_id(organization_id)?;
        let store = self.open_store()?;
        Ok(store.list_batches(organization_id)?)
    }

    /// Re-aggregate the current batch's retained rows under the running
    /// taxonomy and commit the result as a new current batch.
    ///
    /// # Errors
    /// Returns [`DashboardError::NoCurrentBatch`] when nothing was uploaded yet,
    /// or the store/lock failures of a regular upload.
    pub fn reaggregate(&self, organization_id: &str) -> Result<ReaggregateOutcome, DashboardError> {
        let deadline = Instant::now() + self.config.upload_timeout;
        validate_organization_id(organization_id)?;

        let (record, source_batch_id) =
            self.with_organization_lock(organization_id, deadline, || {
                let mut store = self.open_store()?;
                let source = store
                    .list_batches(organization_id)?
                    .into_iter()
                    .find(|summary| summary.current)
                    .ok_or_else(|| DashboardError::NoCurrentBatch(organization_id.to_string()))?;
                let rows = store.load_rows(source.batch.batch_id)?;

                let aggregates = aggregate(&self.taxonomy, &rows);
                let record = BatchRecord {
                    batch_id: BatchId::new(),
                    uploaded_at: OffsetDateTime::now_utc(),
                    taxonomy_version: self.taxonomy.version.clone(),
                    taxonomy_fingerprint: self.taxonomy.fingerprint().to_string(),
                    derived_from: Some(source.batch.batch_id),
                    ..source.batch.clone()
                };

                if Instant::now() > deadline {
                    return Err(DashboardError::Timeout(self.config.upload_timeout));
                }
                self.commit_with_retry(
                    &mut store,
                    NewBatch {
                        record: &record,
                        report: &source.report,
                        rows: &rows,
                        aggregates: &aggregates,
                    },
                    Some(source.batch.batch_id),
                )?;
                Ok((record, source.batch.batch_id))
            })?;

        tracing::info!(
            organization = %organization_id,
            batch_id = %record.batch_id,
            source_batch_id = %source_batch_id,
            "batch re-aggregated"
        );

        Ok(ReaggregateOutcome { batch_id: record.batch_id, source_batch_id, batch: record })
    }
}

/// Validate an organization namespace key.
///
/// # Errors
/// Returns [`DashboardError::InvalidOrganization`] for empty, overlong or
/// non `[A-Za-z0-9._-]` ids.
pub fn validate_organization_id(organization_id: &str) -> Result<(), DashboardError> {
    let valid = !organization_id.is_empty()
        && organization_id.len() <= MAX_ORGANIZATION_ID_LEN
        && organization_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DashboardError::InvalidOrganization(organization_id.to_string()))
    }
}

fn is_csv_filename(filename: &str) -> bool {
    std::path::Path::new(filename)
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("csv"))
}

/// Load a taxonomy document from disk, or the embedded survey when `path` is `None`.
///
/// # Errors
/// Returns an error when the file cannot be read or the document is invalid.
pub fn load_taxonomy(path: Option<&std::path::Path>) -> Result<Taxonomy> {
    match path {
        None => Taxonomy::default_survey().context("embedded taxonomy is invalid"),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read taxonomy file {}", path.display()))?;
            Taxonomy::from_json(&raw)
                .with_context(|| format!("invalid taxonomy file {}", path.display()))
        }
    }
}
