use serde::{Deserialize, Serialize};

use crate::mapper::SchemaMapper;
use crate::parser::SurveyCsvReader;
use crate::taxonomy::Taxonomy;
use crate::{BatchRejected, MalformedRowError, ResponseRow, SurveyError};

/// Row errors beyond this many are counted but not listed in the report.
pub const MAX_REPORTED_ROW_ERRORS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestOptions {
    pub delimiter: u8,
    /// A batch fails when `invalid_rows / total_rows` exceeds this ratio.
    pub max_invalid_ratio: f64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { delimiter: b',', max_invalid_ratio: 0.2 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub total_rows: u32,
    pub valid_rows: u32,
    pub invalid_rows: u32,
    pub ignored_answers: u32,
    pub row_errors: Vec<MalformedRowError>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IngestedBatch {
    pub rows: Vec<ResponseRow>,
    pub report: IngestReport,
}

/// Parse, map and validate one uploaded file.
///
/// # Errors
/// Returns [`SurveyError::Header`] for an unreadable header row,
/// [`SurveyError::SchemaMismatch`] when required columns are missing and
/// [`SurveyError::BatchRejected`] when the file has no usable rows or too many
/// malformed ones.
pub fn ingest_csv(
    bytes: &[u8],
    taxonomy: &Taxonomy,
    options: &IngestOptions,
) -> Result<IngestedBatch, SurveyError> {
    let reader = SurveyCsvReader::new(bytes, options.delimiter)?;
    let mapping = SchemaMapper::new(taxonomy).resolve(reader.headers())?;

    let mut report = IngestReport {
        warnings: mapping.warnings.iter().map(ToString::to_string).collect(),
        ..IngestReport::default()
    };
    let mut rows = Vec::new();
    let mut decoded = reader.into_rows(&mapping, taxonomy);
    for result in decoded.by_ref() {
        report.total_rows += 1;
        match result {
            Ok(row) => rows.push(row),
            Err(err) => {
                report.invalid_rows += 1;
                if report.row_errors.len() < MAX_REPORTED_ROW_ERRORS {
                    report.row_errors.push(err);
                }
            }
        }
    }
    report.ignored_answers = decoded.ignored_answers();
    report.valid_rows = report.total_rows - report.invalid_rows;

    let rejected = |reason: &str| BatchRejected {
        reason: reason.to_string(),
        total_rows: report.total_rows,
        invalid_rows: report.invalid_rows,
    };
    if report.total_rows == 0 {
        return Err(rejected("no respondent rows").into());
    }
    let invalid_ratio = f64::from(report.invalid_rows) / f64::from(report.total_rows);
    if invalid_ratio > options.max_invalid_ratio {
        return Err(rejected("too many invalid rows").into());
    }
    if report.valid_rows == 0 {
        return Err(rejected("no valid respondent rows").into());
    }

    Ok(IngestedBatch { rows, report })
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;

    use super::*;
    use crate::fixtures::small_taxonomy;

    fn csv_with_invalid(valid: usize, invalid: usize) -> String {
        let mut csv = String::from("Constituency,Q1,Q2,Q3,Q4\n");
        for index in 0..valid {
            let score = index % 6 + 1;
            let _ = writeln!(csv, "Owners,{score},{score},{score},{score}");
        }
        for _ in 0..invalid {
            csv.push_str("Owners,7,1,1,1\n");
        }
        csv
    }

    fn ingest(csv: &str) -> Result<IngestedBatch, SurveyError> {
        ingest_csv(csv.as_bytes(), &small_taxonomy(), &IngestOptions::default())
    }

    #[test]
    fn two_invalid_rows_out_of_ten_are_tolerated() {
        let batch = match ingest(&csv_with_invalid(8, 2)) {
            Ok(batch) => batch,
            Err(err) => panic!("batch should be accepted: {err}"),
        };
        assert_eq!(batch.rows.len(), 8);
        assert_eq!(batch.report.total_rows, 10);
        assert_eq!(batch.report.valid_rows, 8);
        assert_eq!(batch.report.invalid_rows, 2);
        assert_eq!(batch.report.row_errors.len(), 2);
        assert_eq!(batch.report.row_errors[0].row_number, 10);
    }

    #[test]
    fn three_invalid_rows_out_of_ten_reject_the_batch() {
        match ingest(&csv_with_invalid(7, 3)) {
            Err(SurveyError::BatchRejected(rejected)) => {
                assert_eq!(rejected.reason, "too many invalid rows");
                assert_eq!(rejected.total_rows, 10);
                assert_eq!(rejected.invalid_rows, 3);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn header_only_file_has_no_respondent_rows() {
        match ingest("Constituency,Q1,Q2,Q3,Q4\n") {
            Err(SurveyError::BatchRejected(rejected)) => {
                assert_eq!(rejected.reason, "no respondent rows");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn all_invalid_rows_are_rejected_even_with_a_lenient_ratio() {
        let options = IngestOptions { max_invalid_ratio: 1.0, ..IngestOptions::default() };
        match ingest_csv(csv_with_invalid(0, 2).as_bytes(), &small_taxonomy(), &options) {
            Err(SurveyError::BatchRejected(rejected)) => {
                assert_eq!(rejected.reason, "no valid respondent rows");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn missing_columns_are_reported_before_rows_are_read() {
        match ingest("Constituency,Q1,Q2\nOwners,1,2\n") {
            Err(err @ SurveyError::SchemaMismatch(_)) => {
                assert_eq!(err.to_string(), "missingColumns: [Q3, Q4]");
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn report_lists_mapping_warnings_and_caps_row_errors() {
        let mut csv = String::from("Constituency,Q1,Q2,Q3,Q4,Notes\n");
        for _ in 0..300 {
            csv.push_str("Owners,1,2,3,4,ok\n");
        }
        for _ in 0..(MAX_REPORTED_ROW_ERRORS + 10) {
            csv.push_str("Owners,x,2,3,4,bad\n");
        }
        let batch = match ingest(&csv) {
            Ok(batch) => batch,
            Err(err) => panic!("batch should be accepted: {err}"),
        };
        assert_eq!(batch.report.invalid_rows, 60);
        assert_eq!(batch.report.row_errors.len(), MAX_REPORTED_ROW_ERRORS);
        assert_eq!(
            batch.report.warnings,
            vec!["column 6 'Notes' is not part of the survey and was ignored".to_string()]
        );
    }

    #[test]
    fn unreadable_header_is_a_header_error() {
        assert!(matches!(ingest(""), Err(SurveyError::Header(_))));
    }
}
