use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize, Serializer};

use crate::aggregate::{AggregateSet, CategoryAggregate};
use crate::taxonomy::Taxonomy;

/// The read-only projections the dashboard pages request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DashboardView {
    Heatmap,
    Subsections,
    Questions,
    CompetencyChart,
    Constituencies,
    Definitions,
}

impl DashboardView {
    pub const ALL: [Self; 6] = [
        Self::Heatmap,
        Self::Subsections,
        Self::Questions,
        Self::CompetencyChart,
        Self::Constituencies,
        Self::Definitions,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heatmap => "heatmap",
            Self::Subsections => "subsections",
            Self::Questions => "questions",
            Self::CompetencyChart => "competency-chart",
            Self::Constituencies => "constituencies",
            Self::Definitions => "definitions",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|view| view.as_str() == value)
    }
}

impl Display for DashboardView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeatmapView {
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    #[serde(serialize_with = "serialize_rounded_grid")]
    pub data: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConstituencyData {
    pub name: String,
    #[serde(serialize_with = "serialize_rounded")]
    pub avg: Option<f64>,
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryData {
    pub category: String,
    #[serde(serialize_with = "serialize_rounded")]
    pub avg: Option<f64>,
    pub rank: Option<u32>,
    pub constituencies: Vec<ConstituencyData>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SectionData {
    pub section: String,
    pub categories: Vec<CategoryData>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DistributionData {
    pub group: String,
    pub value: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuestionData {
    pub question: String,
    #[serde(serialize_with = "serialize_rounded")]
    pub average: Option<f64>,
    pub distributions: Vec<DistributionData>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartCompetency {
    pub name: String,
    #[serde(serialize_with = "serialize_rounded")]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSection {
    pub title: String,
    pub border_color: String,
    pub competencies: Vec<ChartCompetency>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompetencyChart {
    pub sections: Vec<ChartSection>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConstituencyMembers {
    pub name: String,
    pub abbreviation: String,
    pub definition: String,
    pub num_of_members: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DefinitionSection {
    pub title: String,
    pub subtitle: String,
    pub definition: String,
}

/// One projected view, serialized as the bare payload the page expects.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ViewPayload {
    Heatmap(HeatmapView),
    Subsections(Vec<SectionData>),
    Questions(Vec<QuestionData>),
    CompetencyChart(CompetencyChart),
    Constituencies(Vec<ConstituencyMembers>),
    Definitions(Vec<DefinitionSection>),
}

/// Project `view` from a stored aggregate set.
///
/// Without a batch every view is empty but well formed, except `definitions`
/// and `constituencies`, which describe the taxonomy itself.
#[must_use]
pub fn project(view: DashboardView, taxonomy: &Taxonomy, set: Option<&AggregateSet>) -> ViewPayload {
    match view {
        DashboardView::Heatmap => ViewPayload::Heatmap(set.map_or_else(empty_heatmap, heatmap)),
        DashboardView::Subsections => {
            ViewPayload::Subsections(set.map(subsections).unwrap_or_default())
        }
        DashboardView::Questions => ViewPayload::Questions(set.map(questions).unwrap_or_default()),
        DashboardView::CompetencyChart => ViewPayload::CompetencyChart(CompetencyChart {
            sections: set.map(|set| chart_sections(taxonomy, set)).unwrap_or_default(),
        }),
        DashboardView::Constituencies => ViewPayload::Constituencies(constituencies(taxonomy, set)),
        DashboardView::Definitions => ViewPayload::Definitions(definitions(taxonomy)),
    }
}

fn empty_heatmap() -> HeatmapView {
    HeatmapView { rows: Vec::new(), columns: Vec::new(), data: Vec::new() }
}

// Rows and columns come from the set itself so historical batches keep the
// shape they were aggregated with.
fn heatmap(set: &AggregateSet) -> HeatmapView {
    HeatmapView {
        rows: set.categories.iter().map(|category| category.competency.clone()).collect(),
        columns: set.constituencies.iter().map(|tally| tally.name.clone()).collect(),
        data: set
            .categories
            .iter()
            .map(|category| {
                category.per_constituency.iter().map(|score| score.stats.mean()).collect()
            })
            .collect(),
    }
}

/// Categories grouped by focus area, preserving first-seen order.
fn grouped_categories(set: &AggregateSet) -> Vec<(&str, Vec<&CategoryAggregate>)> {
    let mut sections: Vec<(&str, Vec<&CategoryAggregate>)> = Vec::new();
    for category in &set.categories {
        match sections.iter_mut().find(|(title, _)| *title == category.focus_area) {
            Some((_, members)) => members.push(category),
            None => sections.push((category.focus_area.as_str(), vec![category])),
        }
    }
    sections
}

fn subsections(set: &AggregateSet) -> Vec<SectionData> {
    grouped_categories(set)
        .into_iter()
        .map(|(title, categories)| SectionData {
            section: title.to_string(),
            categories: categories
                .into_iter()
                .map(|category| CategoryData {
                    category: category.competency.clone(),
                    avg: category.stats.mean(),
                    rank: category.rank,
                    constituencies: category
                        .per_constituency
                        .iter()
                        .map(|score| ConstituencyData {
                            name: score.constituency.clone(),
                            avg: score.stats.mean(),
                            rank: score.rank,
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect()
}

fn questions(set: &AggregateSet) -> Vec<QuestionData> {
    set.questions
        .iter()
        .map(|question| QuestionData {
            question: question.text.clone(),
            average: question.overall.mean(),
            distributions: set
                .scale
                .values()
                .zip(&question.distribution)
                .map(|(score, count)| DistributionData { group: score.to_string(), value: *count })
                .collect(),
        })
        .collect()
}

fn chart_sections(taxonomy: &Taxonomy, set: &AggregateSet) -> Vec<ChartSection> {
    grouped_categories(set)
        .into_iter()
        .map(|(title, categories)| ChartSection {
            title: title.to_string(),
            border_color: taxonomy
                .focus_areas
                .iter()
                .find(|focus_area| focus_area.title == title)
                .map(|focus_area| focus_area.border_color.clone())
                .unwrap_or_default(),
            competencies: categories
                .into_iter()
                .map(|category| ChartCompetency {
                    name: category.competency.clone(),
                    value: category.stats.mean(),
                })
                .collect(),
        })
        .collect()
}

fn constituencies(taxonomy: &Taxonomy, set: Option<&AggregateSet>) -> Vec<ConstituencyMembers> {
    taxonomy
        .constituencies
        .iter()
        .map(|constituency| ConstituencyMembers {
            name: constituency.name.clone(),
            abbreviation: constituency.abbreviation.clone(),
            definition: constituency.definition.clone(),
            num_of_members: set
                .and_then(|set| set.constituencies.iter().find(|tally| tally.name == constituency.name))
                .map_or(0, |tally| tally.respondents),
        })
        .collect()
}

fn definitions(taxonomy: &Taxonomy) -> Vec<DefinitionSection> {
    taxonomy
        .focus_areas
        .iter()
        .flat_map(|focus_area| {
            focus_area.competencies.iter().map(|competency| DefinitionSection {
                title: focus_area.title.clone(),
                subtitle: competency.name.clone(),
                definition: competency.definition.clone(),
            })
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn serialize_rounded<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_some(&round2(*value)),
        None => serializer.serialize_none(),
    }
}

fn serialize_rounded_grid<S: Serializer>(
    grid: &[Vec<Option<f64>>],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let rounded = grid
        .iter()
        .map(|row| row.iter().map(|cell| cell.map(round2)).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    rounded.serialize(serializer)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::aggregate::aggregate;
    use crate::fixtures::small_taxonomy;
    use crate::ResponseRow;

    fn row(constituency: &str, answers: &[(&str, u8)]) -> ResponseRow {
        ResponseRow {
            respondent_id: 1,
            constituency: constituency.to_string(),
            answers: answers
                .iter()
                .map(|(question, score)| ((*question).to_string(), *score))
                .collect(),
        }
    }

    fn sample_set() -> AggregateSet {
        aggregate(
            &small_taxonomy(),
            &[
                row("Owners", &[("Q1", 5), ("Q2", 4), ("Q3", 6), ("Q4", 2)]),
                row("Board", &[("Q1", 4), ("Q2", 4), ("Q3", 3)]),
                row("Board", &[("Q1", 3)]),
            ],
        )
    }

    fn to_json(view: DashboardView, set: Option<&AggregateSet>) -> serde_json::Value {
        match serde_json::to_value(project(view, &small_taxonomy(), set)) {
            Ok(value) => value,
            Err(err) => panic!("view should serialize: {err}"),
        }
    }

    #[test]
    fn view_names_round_trip() {
        for view in DashboardView::ALL {
            assert_eq!(DashboardView::parse(view.as_str()), Some(view));
        }
        assert_eq!(DashboardView::parse("pie"), None);
    }

    #[test]
    fn heatmap_has_competency_rows_and_constituency_columns() {
        let value = to_json(DashboardView::Heatmap, Some(&sample_set()));
        assert_eq!(
            value,
            json!({
                "rows": ["Communication", "Trust", "Succession"],
                "columns": ["Owners", "Board", "Staff"],
                "data": [
                    [4.5, 3.67, null],
                    [6.0, 3.0, null],
                    [2.0, null, null]
                ]
            })
        );
    }

    #[test]
    fn views_without_a_batch_are_empty_but_valid() {
        assert_eq!(to_json(DashboardView::Heatmap, None), json!({"rows": [], "columns": [], "data": []}));
        assert_eq!(to_json(DashboardView::Subsections, None), json!([]));
        assert_eq!(to_json(DashboardView::Questions, None), json!([]));
        assert_eq!(to_json(DashboardView::CompetencyChart, None), json!({"sections": []}));

        let members = to_json(DashboardView::Constituencies, None);
        assert_eq!(members[0]["numOfMembers"], json!(0));
        let definitions = to_json(DashboardView::Definitions, None);
        assert_eq!(definitions.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn subsections_and_chart_agree_with_heatmap() {
        let set = sample_set();
        let subsections = to_json(DashboardView::Subsections, Some(&set));
        let chart = to_json(DashboardView::CompetencyChart, Some(&set));
        let heatmap = to_json(DashboardView::Heatmap, Some(&set));

        let communication = &subsections[0]["categories"][0];
        assert_eq!(subsections[0]["section"], json!("Family Dynamics"));
        assert_eq!(communication["category"], json!("Communication"));
        assert_eq!(communication["avg"], json!(4.0));
        assert_eq!(communication["constituencies"][1]["avg"], heatmap["data"][0][1]);
        assert_eq!(communication["constituencies"][2], json!({"name": "Staff", "avg": null, "rank": null}));

        assert_eq!(chart["sections"][0]["borderColor"], json!("#4CAF50"));
        assert_eq!(chart["sections"][0]["competencies"][0]["value"], communication["avg"]);
        assert_eq!(chart["sections"][1]["title"], json!("Transition Planning"));
    }

    #[test]
    fn questions_list_every_scale_value() {
        let value = to_json(DashboardView::Questions, Some(&sample_set()));
        assert_eq!(value[0]["question"], json!("We talk openly."));
        assert_eq!(value[0]["average"], json!(4.0));
        let groups = value[0]["distributions"]
            .as_array()
            .map(|items| items.iter().map(|item| item["value"].clone()).collect::<Vec<_>>());
        assert_eq!(groups, Some(vec![json!(0), json!(0), json!(1), json!(1), json!(1), json!(0)]));
        assert_eq!(value[4]["average"], json!(null));
    }

    #[test]
    fn constituency_members_count_respondents() {
        let value = to_json(DashboardView::Constituencies, Some(&sample_set()));
        assert_eq!(
            value[1],
            json!({"name": "Board", "abbreviation": "BD", "definition": "Directors", "numOfMembers": 2})
        );
    }

    proptest! {
        #[test]
        fn heatmap_shape_matches_rows_and_columns(
            raw in prop::collection::vec((0_usize..3, prop::collection::vec(prop::option::of(1_u8..=6), 5)), 0..30)
        ) {
            let names = ["Owners", "Board", "Staff"];
            let ids = ["Q1", "Q2", "Q3", "Q4", "Q5"];
            let rows = raw
                .into_iter()
                .map(|(constituency, scores)| ResponseRow {
                    respondent_id: 1,
                    constituency: names[constituency].to_string(),
                    answers: ids
                        .iter()
                        .zip(scores)
                        .filter_map(|(id, score)| score.map(|s| ((*id).to_string(), s)))
                        .collect::<BTreeMap<_, _>>(),
                })
                .collect::<Vec<_>>();
            let set = aggregate(&small_taxonomy(), &rows);
            let ViewPayload::Heatmap(heatmap) = project(DashboardView::Heatmap, &small_taxonomy(), Some(&set)) else {
                panic!("heatmap view should project a heatmap");
            };
            prop_assert_eq!(heatmap.data.len(), heatmap.rows.len());
            for row in &heatmap.data {
                prop_assert_eq!(row.len(), heatmap.columns.len());
            }
        }
    }
}
