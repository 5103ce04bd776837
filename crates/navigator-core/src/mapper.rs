use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::taxonomy::{normalize_label, Taxonomy};
use crate::SchemaMismatchError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MappedQuestion {
    pub column: usize,
    pub header: String,
    pub question: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingWarning {
    UnmappedColumn { column: usize, header: String },
    DuplicateColumn { column: usize, header: String, target: String },
}

impl Display for MappingWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnmappedColumn { column, header } => {
                write!(f, "column {} '{header}' is not part of the survey and was ignored", column + 1)
            }
            Self::DuplicateColumn { column, header, target } => write!(
                f,
                "column {} '{header}' duplicates {target} and was ignored",
                column + 1
            ),
        }
    }
}

/// How the columns of one upload line up with the taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnMapping {
    pub constituency_column: usize,
    pub questions: Vec<MappedQuestion>,
    pub warnings: Vec<MappingWarning>,
}

/// Resolves CSV headers to question definitions.
pub struct SchemaMapper<'t> {
    taxonomy: &'t Taxonomy,
    question_by_label: BTreeMap<String, usize>,
}

impl<'t> SchemaMapper<'t> {
    #[must_use]
    pub fn new(taxonomy: &'t Taxonomy) -> Self {
        let mut question_by_label = BTreeMap::new();
        for (index, question) in taxonomy.questions.iter().enumerate() {
            question_by_label.entry(normalize_label(&question.text)).or_insert(index);
        }
        // Ids win over texts that happen to normalize to the same label.
        for (index, question) in taxonomy.questions.iter().enumerate() {
            question_by_label.insert(normalize_label(&question.id), index);
        }
        Self { taxonomy, question_by_label }
    }

    /// Map a header row onto the taxonomy.
    ///
    /// # Errors
    /// Returns [`SchemaMismatchError`] listing the constituency column and every
    /// required question that has no matching header.
    pub fn resolve(&self, headers: &[String]) -> Result<ColumnMapping, SchemaMismatchError> {
        let constituency_label = normalize_label(&self.taxonomy.constituency_column);
        let mut constituency_column = None;
        let mut questions = Vec::new();
        let mut seen = BTreeSet::new();
        let mut warnings = Vec::new();

        for (column, header) in headers.iter().enumerate() {
            let label = normalize_label(header);
            if label == constituency_label {
                if constituency_column.is_some() {
                    warnings.push(MappingWarning::DuplicateColumn {
                        column,
                        header: header.clone(),
                        target: self.taxonomy.constituency_column.clone(),
                    });
                } else {
                    constituency_column = Some(column);
                }
                continue;
            }

            match self.question_by_label.get(&label).copied() {
                Some(question) if seen.insert(question) => {
                    questions.push(MappedQuestion { column, header: header.clone(), question });
                }
                Some(question) => warnings.push(MappingWarning::DuplicateColumn {
                    column,
                    header: header.clone(),
                    target: self.taxonomy.questions[question].id.clone(),
                }),
                None => warnings.push(MappingWarning::UnmappedColumn {
                    column,
                    header: header.clone(),
                }),
            }
        }

        let mut missing_columns = Vec::new();
        if constituency_column.is_none() {
            missing_columns.push(self.taxonomy.constituency_column.clone());
        }
        for (index, question) in self.taxonomy.questions.iter().enumerate() {
            if !question.optional && !seen.contains(&index) {
                missing_columns.push(question.id.clone());
            }
        }

        match constituency_column {
            Some(constituency_column) if missing_columns.is_empty() => {
                Ok(ColumnMapping { constituency_column, questions, warnings })
            }
            _ => Err(SchemaMismatchError { missing_columns }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::small_taxonomy;

    fn headers(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    #[test]
    fn resolves_ids_and_texts_case_and_whitespace_insensitively() {
        let taxonomy = small_taxonomy();
        let mapping = match SchemaMapper::new(&taxonomy).resolve(&headers(&[
            "Respondent",
            " constituency ",
            "q1",
            "I am  kept informed.",
            "Q3",
            "Q4",
        ])) {
            Ok(mapping) => mapping,
            Err(err) => panic!("mapping should succeed: {err}"),
        };

        assert_eq!(mapping.constituency_column, 1);
        let resolved = mapping
            .questions
            .iter()
            .map(|mapped| (mapped.column, mapped.question))
            .collect::<Vec<_>>();
        assert_eq!(resolved, vec![(2, 0), (3, 1), (4, 2), (5, 3)]);
        assert_eq!(
            mapping.warnings,
            vec![MappingWarning::UnmappedColumn { column: 0, header: "Respondent".to_string() }]
        );
    }

    #[test]
    fn missing_required_columns_fail_with_their_names() {
        let taxonomy = small_taxonomy();
        let err = match SchemaMapper::new(&taxonomy).resolve(&headers(&["Q1", "Q2", "Q5"])) {
            Ok(_) => panic!("mapping should fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.missing_columns,
            vec!["Constituency".to_string(), "Q3".to_string(), "Q4".to_string()]
        );
    }

    #[test]
    fn optional_questions_are_not_required() {
        let taxonomy = small_taxonomy();
        let mapping =
            SchemaMapper::new(&taxonomy).resolve(&headers(&["Constituency", "Q1", "Q2", "Q3", "Q4"]));
        assert!(mapping.is_ok());
    }

    #[test]
    fn duplicate_columns_keep_the_first_and_warn() {
        let taxonomy = small_taxonomy();
        let mapping = match SchemaMapper::new(&taxonomy).resolve(&headers(&[
            "Constituency",
            "Q1",
            "Q2",
            "Q3",
            "Q4",
            "We talk openly.",
        ])) {
            Ok(mapping) => mapping,
            Err(err) => panic!("mapping should succeed: {err}"),
        };
        assert_eq!(mapping.questions.len(), 4);
        assert_eq!(mapping.warnings.len(), 1);
        assert_eq!(
            mapping.warnings[0].to_string(),
            "column 6 'We talk openly.' duplicates Q1 and was ignored"
        );
    }
}
