use std::path::Path;

use anyhow::{anyhow, Context, Result};
use navigator_core::{AggregateSet, BatchId, IngestReport, ResponseRow};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS upload_batches (
  batch_id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL CHECK (length(organization_id) > 0),
  uploaded_at TEXT NOT NULL,
  source_filename TEXT NOT NULL,
  row_count INTEGER NOT NULL CHECK (row_count >= 0),
  valid_row_count INTEGER NOT NULL CHECK (valid_row_count >= 0),
  invalid_row_count INTEGER NOT NULL CHECK (invalid_row_count >= 0),
  taxonomy_version TEXT NOT NULL,
  taxonomy_fingerprint TEXT NOT NULL,
  derived_from TEXT REFERENCES upload_batches(batch_id),
  report_json TEXT NOT NULL,
  aggregates_json TEXT NOT NULL,
  CHECK (valid_row_count + invalid_row_count = row_count)
);

CREATE TABLE IF NOT EXISTS response_rows (
  batch_id TEXT NOT NULL REFERENCES upload_batches(batch_id) ON DELETE CASCADE,
  respondent_id INTEGER NOT NULL CHECK (respondent_id > 0),
  constituency TEXT NOT NULL,
  answers_json TEXT NOT NULL,
  PRIMARY KEY (batch_id, respondent_id)
);

CREATE TABLE IF NOT EXISTS current_batches (
  organization_id TEXT PRIMARY KEY,
  batch_id TEXT NOT NULL REFERENCES upload_batches(batch_id),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_batches_organization ON upload_batches(organization_id);
";

const BATCH_COLUMNS: &str = "b.batch_id, b.organization_id, b.uploaded_at, b.source_filename,
    b.row_count, b.valid_row_count, b.invalid_row_count, b.taxonomy_version,
    b.taxonomy_fingerprint, b.derived_from";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Metadata of one committed upload. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub organization_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    pub source_filename: String,
    pub row_count: u32,
    pub valid_row_count: u32,
    pub invalid_row_count: u32,
    pub taxonomy_version: String,
    pub taxonomy_fingerprint: String,
    /// Set when the batch was re-aggregated from another batch's retained rows.
    pub derived_from: Option<BatchId>,
}

/// Everything written by one [`SqliteStore::commit_batch`] call.
#[derive(Debug, Clone, Copy)]
pub struct NewBatch<'a> {
    pub record: &'a BatchRecord,
    pub report: &'a IngestReport,
    pub rows: &'a [ResponseRow],
    pub aggregates: &'a AggregateSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The organization's current batch moved since the caller read it.
    Conflict { current: Option<BatchId> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredAggregates {
    pub batch: BatchRecord,
    pub aggregates: AggregateSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    #[serde(flatten)]
    pub batch: BatchRecord,
    pub current: bool,
    pub report: IngestReport,
}

impl SqliteStore {
    /// Open a SQLite-backed result store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Write a batch with its retained rows and aggregates, then point the
    /// organization at it, all in one IMMEDIATE transaction.
    ///
    /// Nothing is written when the organization's current batch is no longer
    /// `expected_current`; the caller receives [`CommitOutcome::Conflict`].
    ///
    /// # Errors
    /// Returns an error when serialization or any statement fails.
    pub fn commit_batch(
        &mut self,
        batch: NewBatch<'_>,
        expected_current: Option<BatchId>,
    ) -> Result<CommitOutcome> {
        let record = batch.record;
        let report_json =
            serde_json::to_string(batch.report).context("failed to serialize ingest report")?;
        let aggregates_json =
            serde_json::to_string(batch.aggregates).context("failed to serialize aggregates")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start commit transaction")?;

        let current = read_current_batch_id(&tx, &record.organization_id)?;
        if current != expected_current {
            return Ok(CommitOutcome::Conflict { current });
        }

        tx.execute(
            "INSERT INTO upload_batches(
                batch_id, organization_id, uploaded_at, source_filename,
                row_count, valid_row_count, invalid_row_count, taxonomy_version,
                taxonomy_fingerprint, derived_from, report_json, aggregates_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.batch_id.to_string(),
                record.organization_id,
                rfc3339(record.uploaded_at)?,
                record.source_filename,
                record.row_count,
                record.valid_row_count,
                record.invalid_row_count,
                record.taxonomy_version,
                record.taxonomy_fingerprint,
                record.derived_from.map(|id| id.to_string()),
                report_json,
                aggregates_json,
            ],
        )
        .context("failed to insert upload batch")?;

        {
            let mut insert_row = tx
                .prepare(
                    "INSERT INTO response_rows(batch_id, respondent_id, constituency, answers_json)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare response row insert")?;
            for row in batch.rows {
                let answers_json =
                    serde_json::to_string(&row.answers).context("failed to serialize answers")?;
                insert_row
                    .execute(params![
                        record.batch_id.to_string(),
                        row.respondent_id,
                        row.constituency,
                        answers_json,
                    ])
                    .with_context(|| {
                        format!("failed to insert response row {}", row.respondent_id)
                    })?;
            }
        }

        tx.execute(
            "INSERT INTO current_batches(organization_id, batch_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(organization_id) DO UPDATE SET
               batch_id = excluded.batch_id,
               updated_at = excluded.updated_at",
            params![record.organization_id, record.batch_id.to_string(), now_rfc3339()?],
        )
        .context("failed to move current batch pointer")?;

        tx.commit().context("failed to commit batch transaction")?;
        Ok(CommitOutcome::Committed)
    }

    /// The batch currently served for `organization_id`, if any.
    ///
    /// # Errors
    /// Returns an error when the pointer cannot be read or decoded.
    pub fn current_batch_id(&self, organization_id: &str) -> Result<Option<BatchId>> {
        read_current_batch_id(&self.conn, organization_id)
    }

    /// Load the aggregates of the current batch, or of `batch_id` when given.
    ///
    /// A single statement reads the committed snapshot, so a concurrent commit
    /// is either fully visible or not at all.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored JSON cannot be decoded.
    pub fn load_aggregates(
        &self,
        organization_id: &str,
        batch_id: Option<BatchId>,
    ) -> Result<Option<StoredAggregates>> {
        let loaded = match batch_id {
            None => self
                .conn
                .query_row(
                    &format!(
                        "SELECT {BATCH_COLUMNS}, b.aggregates_json
                         FROM current_batches c
                         JOIN upload_batches b ON b.batch_id = c.batch_id
                         WHERE c.organization_id = ?1"
                    ),
                    params![organization_id],
                    |row| Ok((RawBatch::from_row(row)?, row.get::<_, String>(10)?)),
                )
                .optional(),
            Some(batch_id) => self
                .conn
                .query_row(
                    &format!(
                        "SELECT {BATCH_COLUMNS}, b.aggregates_json
                         FROM upload_batches b
                         WHERE b.batch_id = ?1 AND b.organization_id = ?2"
                    ),
                    params![batch_id.to_string(), organization_id],
                    |row| Ok((RawBatch::from_row(row)?, row.get::<_, String>(10)?)),
                )
                .optional(),
        }
        .with_context(|| format!("failed to load aggregates for organization {organization_id}"))?;

        let Some((raw, aggregates_json)) = loaded else {
            return Ok(None);
        };
        Ok(Some(StoredAggregates {
            batch: raw.decode()?,
            aggregates: serde_json::from_str(&aggregates_json)
                .context("failed to deserialize aggregates")?,
        }))
    }

    /// Batch history for an organization, most recently committed first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_batches(&self, organization_id: &str) -> Result<Vec<BatchSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BATCH_COLUMNS}, b.report_json, c.batch_id IS NOT NULL
             FROM upload_batches b
             LEFT JOIN current_batches c
               ON c.organization_id = b.organization_id AND c.batch_id = b.batch_id
             WHERE b.organization_id = ?1
             ORDER BY b.rowid DESC"
        ))?;

        let mut rows = stmt.query(params![organization_id])?;
        let mut batches = Vec::new();
        while let Some(row) = rows.next()? {
            let raw = RawBatch::from_row(row)?;
            let report_json: String = row.get(10)?;
            batches.push(BatchSummary {
                batch: raw.decode()?,
                current: row.get(11)?,
                report: serde_json::from_str(&report_json)
                    .context("failed to deserialize ingest report")?,
            });
        }

        Ok(batches)
    }

    /// Retained rows of one batch in respondent order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_rows(&self, batch_id: BatchId) -> Result<Vec<ResponseRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT respondent_id, constituency, answers_json
             FROM response_rows
             WHERE batch_id = ?1
             ORDER BY respondent_id ASC",
        )?;

        let mut rows = stmt.query(params![batch_id.to_string()])?;
        let mut decoded = Vec::new();
        while let Some(row) = rows.next()? {
            let answers_json: String = row.get(2)?;
            decoded.push(ResponseRow {
                respondent_id: row.get(0)?,
                constituency: row.get(1)?,
                answers: serde_json::from_str(&answers_json)
                    .context("failed to deserialize answers")?,
            });
        }

        Ok(decoded)
    }
}

/// Column values of one `upload_batches` row before ids and timestamps are parsed.
struct RawBatch {
    batch_id: String,
    organization_id: String,
    uploaded_at: String,
    source_filename: String,
    row_count: u32,
    valid_row_count: u32,
    invalid_row_count: u32,
    taxonomy_version: String,
    taxonomy_fingerprint: String,
    derived_from: Option<String>,
}

impl RawBatch {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: row.get(0)?,
            organization_id: row.get(1)?,
            uploaded_at: row.get(2)?,
            source_filename: row.get(3)?,
            row_count: row.get(4)?,
            valid_row_count: row.get(5)?,
            invalid_row_count: row.get(6)?,
            taxonomy_version: row.get(7)?,
            taxonomy_fingerprint: row.get(8)?,
            derived_from: row.get(9)?,
        })
    }

    fn decode(self) -> Result<BatchRecord> {
        Ok(BatchRecord {
            batch_id: parse_batch_id(&self.batch_id)?,
            organization_id: self.organization_id,
            uploaded_at: parse_rfc3339(&self.uploaded_at)?,
            source_filename: self.source_filename,
            row_count: self.row_count,
            valid_row_count: self.valid_row_count,
            invalid_row_count: self.invalid_row_count,
            taxonomy_version: self.taxonomy_version,
            taxonomy_fingerprint: self.taxonomy_fingerprint,
            derived_from: self.derived_from.as_deref().map(parse_batch_id).transpose()?,
        })
    }
}

fn read_current_batch_id(conn: &Connection, organization_id: &str) -> Result<Option<BatchId>> {
    let raw = conn
        .query_row(
            "SELECT batch_id FROM current_batches WHERE organization_id = ?1",
            params![organization_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to read current batch for {organization_id}"))?;
    raw.as_deref().map(parse_batch_id).transpose()
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_batch_id(raw: &str) -> Result<BatchId> {
    BatchId::parse(raw).ok_or_else(|| anyhow!("invalid ULID: {raw}"))
}
