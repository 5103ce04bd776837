use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod aggregate;
mod ingest;
mod mapper;
mod parser;
mod taxonomy;
mod views;

pub use aggregate::{
    aggregate, competition_ranks, AggregateSet, CategoryAggregate, ConstituencyScore,
    ConstituencyTally, QuestionAggregate, ScoreStats,
};
pub use ingest::{ingest_csv, IngestOptions, IngestReport, IngestedBatch, MAX_REPORTED_ROW_ERRORS};
pub use mapper::{ColumnMapping, MappedQuestion, MappingWarning, SchemaMapper};
pub use parser::{parse_score, ResponseRows, SurveyCsvReader};
pub use taxonomy::{
    normalize_label, Competency, Constituency, ConstituencyGroup, FocusArea, LikertScale,
    QuestionDefinition, Taxonomy, DEFAULT_TAXONOMY_JSON,
};
pub use views::{
    project, CategoryData, ChartCompetency, ChartSection, CompetencyChart, ConstituencyData,
    ConstituencyMembers, DashboardView, DefinitionSection, DistributionData, HeatmapView,
    QuestionData, SectionData, ViewPayload,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SurveyError {
    #[error("taxonomy error: {0}")]
    Taxonomy(String),
    #[error("invalid csv header: {0}")]
    Header(String),
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),
    #[error(transparent)]
    BatchRejected(#[from] BatchRejected),
}

/// One data row that could not be turned into a [`ResponseRow`].
///
/// Row errors never abort a batch on their own; they are counted and reported.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[error("row {row_number}: {reason}")]
pub struct MalformedRowError {
    pub row_number: u64,
    pub reason: String,
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[error("missingColumns: [{}]", .missing_columns.join(", "))]
pub struct SchemaMismatchError {
    pub missing_columns: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[error("{reason}")]
pub struct BatchRejected {
    pub reason: String,
    pub total_rows: u32,
    pub invalid_rows: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BatchId(pub Ulid);

impl BatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One respondent's validated answers.
///
/// `constituency` holds the canonical constituency name and `answers` maps
/// question ids to scores already checked against the survey scale. Blank
/// cells are simply absent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResponseRow {
    pub respondent_id: u32,
    pub constituency: String,
    pub answers: BTreeMap<String, u8>,
}
