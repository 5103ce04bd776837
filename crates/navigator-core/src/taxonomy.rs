use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::SurveyError;

/// The Family Navigator survey shipped with the service.
pub const DEFAULT_TAXONOMY_JSON: &str = include_str!("../taxonomy/famnav.json");

const DEFAULT_CONSTITUENCY_COLUMN: &str = "Constituency";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LikertScale {
    pub min: u8,
    pub max: u8,
}

impl Default for LikertScale {
    fn default() -> Self {
        Self { min: 1, max: 6 }
    }
}

impl LikertScale {
    #[must_use]
    pub fn contains(self, value: i64) -> bool {
        value >= i64::from(self.min) && value <= i64::from(self.max)
    }

    /// Number of discrete points on the scale.
    #[must_use]
    pub fn width(self) -> usize {
        usize::from(self.max.saturating_sub(self.min)) + 1
    }

    pub fn values(self) -> impl Iterator<Item = u8> {
        self.min..=self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Constituency {
    pub name: String,
    pub abbreviation: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConstituencyGroup {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Competency {
    pub name: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FocusArea {
    pub title: String,
    pub border_color: String,
    pub competencies: Vec<Competency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestionDefinition {
    pub id: String,
    pub text: String,
    pub competency: String,
    pub constituency_group: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyDocument {
    version: String,
    #[serde(default)]
    scale: LikertScale,
    #[serde(default = "default_constituency_column")]
    constituency_column: String,
    constituencies: Vec<Constituency>,
    constituency_groups: Vec<ConstituencyGroup>,
    focus_areas: Vec<FocusArea>,
    questions: Vec<QuestionDefinition>,
}

fn default_constituency_column() -> String {
    DEFAULT_CONSTITUENCY_COLUMN.to_string()
}

/// Where one competency sits inside the focus-area tree.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct CompetencySlot {
    focus_area: usize,
    position: usize,
}

/// The fixed question/competency/constituency structure of the survey.
///
/// Built once at startup and shared read-only. Lookups by label go through
/// [`normalize_label`], so "q1", " Q1 " and "Q1" resolve to the same question.
#[derive(Debug, Clone, Serialize)]
pub struct Taxonomy {
    pub version: String,
    pub scale: LikertScale,
    pub constituency_column: String,
    pub constituencies: Vec<Constituency>,
    pub constituency_groups: Vec<ConstituencyGroup>,
    pub focus_areas: Vec<FocusArea>,
    pub questions: Vec<QuestionDefinition>,
    #[serde(skip)]
    fingerprint: String,
    #[serde(skip)]
    competency_slots: Vec<CompetencySlot>,
    #[serde(skip)]
    constituency_by_label: BTreeMap<String, usize>,
    #[serde(skip)]
    question_by_id: BTreeMap<String, usize>,
    #[serde(skip)]
    question_competency: Vec<usize>,
    #[serde(skip)]
    question_audience: Vec<BTreeSet<usize>>,
}

impl Taxonomy {
    /// Parse and validate a taxonomy document.
    ///
    /// # Errors
    /// Returns [`SurveyError::Taxonomy`] when the JSON is malformed or the
    /// document violates a structural rule (duplicates, dangling references,
    /// empty sections, inverted scale).
    pub fn from_json(raw: &str) -> Result<Self, SurveyError> {
        let document: TaxonomyDocument = serde_json::from_str(raw)
            .map_err(|err| SurveyError::Taxonomy(format!("malformed taxonomy json: {err}")))?;
        Self::from_document(document)
    }

    /// The embedded Family Navigator survey.
    ///
    /// # Errors
    /// Returns an error only if the embedded document is invalid.
    pub fn default_survey() -> Result<Self, SurveyError> {
        Self::from_json(DEFAULT_TAXONOMY_JSON)
    }

    fn from_document(document: TaxonomyDocument) -> Result<Self, SurveyError> {
        if document.version.trim().is_empty() {
            return Err(invalid("version MUST be provided"));
        }
        if document.scale.min >= document.scale.max {
            return Err(invalid(format!(
                "scale min {} MUST be below max {}",
                document.scale.min, document.scale.max
            )));
        }
        if normalize_label(&document.constituency_column).is_empty() {
            return Err(invalid("constituency_column MUST be provided"));
        }
        if document.constituencies.is_empty() {
            return Err(invalid("at least one constituency is required"));
        }
        if document.focus_areas.is_empty() {
            return Err(invalid("at least one focus area is required"));
        }
        if document.questions.is_empty() {
            return Err(invalid("at least one question is required"));
        }

        let mut constituency_by_label = BTreeMap::new();
        for (index, constituency) in document.constituencies.iter().enumerate() {
            for label in [&constituency.name, &constituency.abbreviation] {
                let key = normalize_label(label);
                if key.is_empty() {
                    return Err(invalid("constituency name and abbreviation MUST be non-empty"));
                }
                match constituency_by_label.insert(key, index) {
                    Some(existing) if existing != index => {
                        return Err(invalid(format!("duplicate constituency label: {label}")));
                    }
                    _ => {}
                }
            }
        }

        let mut group_members = BTreeMap::new();
        for group in &document.constituency_groups {
            let mut members = BTreeSet::new();
            for member in &group.members {
                let index =
                    constituency_by_label.get(&normalize_label(member)).copied().ok_or_else(
                        || {
                            invalid(format!(
                                "constituency group {} references unknown constituency {member}",
                                group.name
                            ))
                        },
                    )?;
                members.insert(index);
            }
            if members.is_empty() {
                return Err(invalid(format!("constituency group {} has no members", group.name)));
            }
            if group_members.insert(normalize_label(&group.name), members).is_some() {
                return Err(invalid(format!("duplicate constituency group: {}", group.name)));
            }
        }

        let mut competency_slots = Vec::new();
        let mut competency_by_label = BTreeMap::new();
        let mut focus_titles = BTreeSet::new();
        for (focus_index, focus_area) in document.focus_areas.iter().enumerate() {
            if !focus_titles.insert(normalize_label(&focus_area.title)) {
                return Err(invalid(format!("duplicate focus area: {}", focus_area.title)));
            }
            if focus_area.competencies.is_empty() {
                return Err(invalid(format!("focus area {} has no competencies", focus_area.title)));
            }
            for (position, competency) in focus_area.competencies.iter().enumerate() {
                let key = normalize_label(&competency.name);
                if competency_by_label.insert(key, competency_slots.len()).is_some() {
                    return Err(invalid(format!("duplicate competency: {}", competency.name)));
                }
                competency_slots.push(CompetencySlot { focus_area: focus_index, position });
            }
        }

        let mut question_by_id = BTreeMap::new();
        let mut question_competency = Vec::with_capacity(document.questions.len());
        let mut question_audience = Vec::with_capacity(document.questions.len());
        for (index, question) in document.questions.iter().enumerate() {
            if normalize_label(&question.id).is_empty() {
                return Err(invalid("question id MUST be non-empty"));
            }
            if question_by_id.insert(normalize_label(&question.id), index).is_some() {
                return Err(invalid(format!("duplicate question id: {}", question.id)));
            }
            let competency =
                competency_by_label.get(&normalize_label(&question.competency)).copied().ok_or_else(
                    || {
                        invalid(format!(
                            "question {} references unknown competency {}",
                            question.id, question.competency
                        ))
                    },
                )?;
            let audience = group_members
                .get(&normalize_label(&question.constituency_group))
                .cloned()
                .ok_or_else(|| {
                    invalid(format!(
                        "question {} references unknown constituency group {}",
                        question.id, question.constituency_group
                    ))
                })?;
            question_competency.push(competency);
            question_audience.push(audience);
        }

        let mut taxonomy = Self {
            version: document.version,
            scale: document.scale,
            constituency_column: document.constituency_column,
            constituencies: document.constituencies,
            constituency_groups: document.constituency_groups,
            focus_areas: document.focus_areas,
            questions: document.questions,
            fingerprint: String::new(),
            competency_slots,
            constituency_by_label,
            question_by_id,
            question_competency,
            question_audience,
        };
        taxonomy.fingerprint = compute_fingerprint(&taxonomy)?;
        Ok(taxonomy)
    }

    /// SHA-256 over the canonical serialization; stable across whitespace edits.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn competency_count(&self) -> usize {
        self.competency_slots.len()
    }

    /// Competency by flat index, paired with its focus area.
    #[must_use]
    pub fn competency(&self, index: usize) -> Option<(&FocusArea, &Competency)> {
        let slot = self.competency_slots.get(index)?;
        let focus_area = self.focus_areas.get(slot.focus_area)?;
        Some((focus_area, focus_area.competencies.get(slot.position)?))
    }

    #[must_use]
    pub fn competency_focus_area(&self, index: usize) -> Option<usize> {
        self.competency_slots.get(index).map(|slot| slot.focus_area)
    }

    #[must_use]
    pub fn question_index(&self, id: &str) -> Option<usize> {
        self.question_by_id.get(&normalize_label(id)).copied()
    }

    #[must_use]
    pub fn question_competency(&self, question: usize) -> Option<usize> {
        self.question_competency.get(question).copied()
    }

    /// Resolve a cell value to a constituency by name or abbreviation.
    #[must_use]
    pub fn resolve_constituency(&self, raw: &str) -> Option<usize> {
        self.constituency_by_label.get(&normalize_label(raw)).copied()
    }

    /// Whether respondents of `constituency` are asked `question`.
    #[must_use]
    pub fn applies_to(&self, question: usize, constituency: usize) -> bool {
        self.question_audience.get(question).is_some_and(|members| members.contains(&constituency))
    }
}

fn invalid(message: impl Into<String>) -> SurveyError {
    SurveyError::Taxonomy(message.into())
}

fn compute_fingerprint(taxonomy: &Taxonomy) -> Result<String, SurveyError> {
    let canonical = serde_json::to_vec(taxonomy)
        .map_err(|err| SurveyError::Taxonomy(format!("failed to serialize taxonomy: {err}")))?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("sha256:{digest:x}"))
}

/// Case-, whitespace- and BOM-insensitive form of a header or label.
#[must_use]
pub fn normalize_label(value: &str) -> String {
    value
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{small_taxonomy, SMALL_TAXONOMY_JSON};

    #[test]
    fn default_survey_is_valid() {
        let taxonomy = match Taxonomy::default_survey() {
            Ok(taxonomy) => taxonomy,
            Err(err) => panic!("embedded taxonomy should load: {err}"),
        };
        assert_eq!(taxonomy.version, "famnav.v1");
        assert_eq!(taxonomy.focus_areas.len(), 4);
        assert_eq!(taxonomy.competency_count(), 8);
        assert_eq!(taxonomy.questions.len(), 16);
        assert!(taxonomy.fingerprint().starts_with("sha256:"));
    }

    #[test]
    fn normalize_label_ignores_case_whitespace_and_bom() {
        assert_eq!(normalize_label("\u{feff}  Family   Owners "), "family owners");
        assert_eq!(normalize_label("Q1"), normalize_label(" q1\t"));
    }

    #[test]
    fn lookups_resolve_by_normalized_labels() {
        let taxonomy = small_taxonomy();
        assert_eq!(taxonomy.resolve_constituency("owners"), Some(0));
        assert_eq!(taxonomy.resolve_constituency(" bd "), Some(1));
        assert_eq!(taxonomy.resolve_constituency("Visitors"), None);
        assert_eq!(taxonomy.question_index("q4"), Some(3));

        let (focus_area, competency) = match taxonomy.competency(2) {
            Some(pair) => pair,
            None => panic!("competency 2 should exist"),
        };
        assert_eq!(focus_area.title, "Transition Planning");
        assert_eq!(competency.name, "Succession");
    }

    #[test]
    fn constituency_groups_restrict_question_audience() {
        let taxonomy = small_taxonomy();
        assert!(taxonomy.applies_to(3, 0));
        assert!(!taxonomy.applies_to(3, 1));
        assert!(taxonomy.applies_to(0, 2));
    }

    #[test]
    fn fingerprint_ignores_formatting() {
        let compact = SMALL_TAXONOMY_JSON.split_whitespace().collect::<Vec<_>>().join(" ");
        let reformatted = match Taxonomy::from_json(&compact) {
            Ok(taxonomy) => taxonomy,
            Err(err) => panic!("reformatted taxonomy should load: {err}"),
        };
        assert_eq!(reformatted.fingerprint(), small_taxonomy().fingerprint());
    }

    #[test]
    fn dangling_references_are_rejected() {
        let broken = SMALL_TAXONOMY_JSON.replace(
            r#""competency": "Trust""#,
            r#""competency": "Loyalty""#,
        );
        let err = match Taxonomy::from_json(&broken) {
            Ok(_) => panic!("unknown competency should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unknown competency Loyalty"));

        let broken_group = SMALL_TAXONOMY_JSON.replace(r#"["Owners"]"#, r#"["Founders"]"#);
        assert!(Taxonomy::from_json(&broken_group).is_err());
    }

    #[test]
    fn question_competency_labels_are_normalized() {
        let loose = SMALL_TAXONOMY_JSON.replace(
            r#""competency": "Trust""#,
            r#""competency": "  TRUST ""#,
        );
        let taxonomy = match Taxonomy::from_json(&loose) {
            Ok(taxonomy) => taxonomy,
            Err(err) => panic!("normalized competency label should resolve: {err}"),
        };
        let q3 = taxonomy.question_index("Q3");
        let competency = q3.and_then(|question| taxonomy.question_competency(question));
        let name = competency.and_then(|index| taxonomy.competency(index)).map(|(_, c)| c.name.as_str());
        assert_eq!(name, Some("Trust"));
    }

    #[test]
    fn duplicate_question_ids_are_rejected() {
        let broken = SMALL_TAXONOMY_JSON.replace(r#""id": "Q2""#, r#""id": "q1""#);
        let err = match Taxonomy::from_json(&broken) {
            Ok(_) => panic!("duplicate ids should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("duplicate question id"));
    }

    #[test]
    fn inverted_scale_is_rejected() {
        let broken =
            SMALL_TAXONOMY_JSON.replace(r#"{ "min": 1, "max": 6 }"#, r#"{ "min": 5, "max": 2 }"#);
        assert!(Taxonomy::from_json(&broken).is_err());
    }

    #[test]
    fn scale_reports_width_and_membership() {
        let scale = LikertScale::default();
        assert_eq!(scale.width(), 6);
        assert!(scale.contains(1));
        assert!(scale.contains(6));
        assert!(!scale.contains(0));
        assert!(!scale.contains(7));
        assert_eq!(scale.values().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
    }
}
