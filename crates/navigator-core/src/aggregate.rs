use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::taxonomy::{LikertScale, Taxonomy};
use crate::ResponseRow;

/// Integer count and sum of scores. Means are derived on demand so every
/// reader computes exactly the same value from the stored snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoreStats {
    pub count: u32,
    pub sum: u32,
}

impl ScoreStats {
    pub fn record(&mut self, score: u8) {
        self.count += 1;
        self.sum += u32::from(score);
    }

    pub fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.sum += other.sum;
    }

    /// `None` when nothing was recorded; an empty pair is never reported as 0.
    #[must_use]
    pub fn mean(self) -> Option<f64> {
        (self.count > 0).then(|| f64::from(self.sum) / f64::from(self.count))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestionAggregate {
    pub question_id: String,
    pub text: String,
    pub competency: String,
    pub overall: ScoreStats,
    /// Count per scale value, lowest value first, zeros included.
    pub distribution: Vec<u32>,
    /// Indexed like `AggregateSet::constituencies`.
    pub per_constituency: Vec<ScoreStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConstituencyScore {
    pub constituency: String,
    pub stats: ScoreStats,
    pub rank: Option<u32>,
}

/// Pooled scores for one competency.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryAggregate {
    pub focus_area: String,
    pub competency: String,
    pub stats: ScoreStats,
    /// Rank among the competencies of the same focus area.
    pub rank: Option<u32>,
    pub per_constituency: Vec<ConstituencyScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConstituencyTally {
    pub name: String,
    pub respondents: u32,
}

/// Everything the dashboard views are projected from, derived from one batch.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AggregateSet {
    pub taxonomy_version: String,
    pub scale: LikertScale,
    pub respondent_count: u32,
    /// Rows whose constituency is unknown to the taxonomy they were aggregated under.
    pub unassigned_rows: u32,
    pub constituencies: Vec<ConstituencyTally>,
    pub questions: Vec<QuestionAggregate>,
    pub categories: Vec<CategoryAggregate>,
}

/// Aggregate validated rows under `taxonomy`.
///
/// The result depends only on the multiset of rows, never on their order.
/// Answers to unknown questions, answers outside the scale and answers to
/// questions not asked of the respondent's constituency are skipped, which
/// matters when retained rows are re-aggregated under a newer taxonomy.
#[must_use]
pub fn aggregate(taxonomy: &Taxonomy, rows: &[ResponseRow]) -> AggregateSet {
    let scale = taxonomy.scale;
    let constituency_count = taxonomy.constituencies.len();

    let mut tallies = vec![0_u32; constituency_count];
    let mut overall = vec![ScoreStats::default(); taxonomy.questions.len()];
    let mut distributions = vec![vec![0_u32; scale.width()]; taxonomy.questions.len()];
    let mut per_constituency =
        vec![vec![ScoreStats::default(); constituency_count]; taxonomy.questions.len()];
    let mut respondent_count = 0_u32;
    let mut unassigned_rows = 0_u32;

    for row in rows {
        let Some(constituency) = taxonomy.resolve_constituency(&row.constituency) else {
            unassigned_rows += 1;
            continue;
        };
        respondent_count += 1;
        tallies[constituency] += 1;

        for (question_id, &score) in &row.answers {
            let Some(question) = taxonomy.question_index(question_id) else {
                continue;
            };
            if !scale.contains(i64::from(score)) || !taxonomy.applies_to(question, constituency) {
                continue;
            }
            overall[question].record(score);
            distributions[question][usize::from(score - scale.min)] += 1;
            per_constituency[question][constituency].record(score);
        }
    }

    let questions = taxonomy
        .questions
        .iter()
        .enumerate()
        .map(|(index, definition)| QuestionAggregate {
            question_id: definition.id.clone(),
            text: definition.text.clone(),
            competency: definition.competency.clone(),
            overall: overall[index],
            distribution: distributions[index].clone(),
            per_constituency: per_constituency[index].clone(),
        })
        .collect::<Vec<_>>();

    let mut competency_stats = vec![ScoreStats::default(); taxonomy.competency_count()];
    let mut competency_by_constituency =
        vec![vec![ScoreStats::default(); constituency_count]; taxonomy.competency_count()];
    for (index, question) in questions.iter().enumerate() {
        let Some(competency) = taxonomy.question_competency(index) else {
            continue;
        };
        competency_stats[competency].merge(question.overall);
        for (constituency, stats) in question.per_constituency.iter().enumerate() {
            competency_by_constituency[competency][constituency].merge(*stats);
        }
    }

    let categories = rank_categories(taxonomy, &competency_stats, &competency_by_constituency);

    AggregateSet {
        taxonomy_version: taxonomy.version.clone(),
        scale,
        respondent_count,
        unassigned_rows,
        constituencies: taxonomy
            .constituencies
            .iter()
            .zip(tallies)
            .map(|(constituency, respondents)| ConstituencyTally {
                name: constituency.name.clone(),
                respondents,
            })
            .collect(),
        questions,
        categories,
    }
}

fn rank_categories(
    taxonomy: &Taxonomy,
    competency_stats: &[ScoreStats],
    competency_by_constituency: &[Vec<ScoreStats>],
) -> Vec<CategoryAggregate> {
    let mut ranks = vec![None; competency_stats.len()];
    for focus_area in 0..taxonomy.focus_areas.len() {
        let members = (0..competency_stats.len())
            .filter(|&index| taxonomy.competency_focus_area(index) == Some(focus_area))
            .collect::<Vec<_>>();
        let means = members.iter().map(|&index| competency_stats[index].mean()).collect::<Vec<_>>();
        for (&index, rank) in members.iter().zip(competition_ranks(&means)) {
            ranks[index] = rank;
        }
    }

    let mut categories = Vec::with_capacity(competency_stats.len());
    for (index, stats) in competency_stats.iter().enumerate() {
        let Some((focus_area, competency)) = taxonomy.competency(index) else {
            continue;
        };
        let by_constituency = &competency_by_constituency[index];
        let means = by_constituency.iter().map(|stats| stats.mean()).collect::<Vec<_>>();
        let per_constituency = taxonomy
            .constituencies
            .iter()
            .zip(by_constituency)
            .zip(competition_ranks(&means))
            .map(|((constituency, stats), rank)| ConstituencyScore {
                constituency: constituency.name.clone(),
                stats: *stats,
                rank,
            })
            .collect();
        categories.push(CategoryAggregate {
            focus_area: focus_area.title.clone(),
            competency: competency.name.clone(),
            stats: *stats,
            rank: ranks[index],
            per_constituency,
        });
    }
    categories
}

/// Competition ranking ("1224") by descending value.
///
/// Tied values share the lower rank and the next distinct value resumes at
/// `tie_rank + tie_count`. Missing values get no rank and do not displace others.
#[must_use]
pub fn competition_ranks(values: &[Option<f64>]) -> Vec<Option<u32>> {
    values
        .iter()
        .map(|value| {
            let value = (*value)?;
            let ahead = values
                .iter()
                .flatten()
                .filter(|other| other.total_cmp(&value) == Ordering::Greater)
                .count();
            Some(u32::try_from(ahead).map_or(u32::MAX, |ahead| ahead + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::fixtures::small_taxonomy;

    fn row(respondent_id: u32, constituency: &str, answers: &[(&str, u8)]) -> ResponseRow {
        ResponseRow {
            respondent_id,
            constituency: constituency.to_string(),
            answers: answers
                .iter()
                .map(|(question, score)| ((*question).to_string(), *score))
                .collect(),
        }
    }

    fn category<'a>(set: &'a AggregateSet, competency: &str) -> &'a CategoryAggregate {
        match set.categories.iter().find(|category| category.competency == competency) {
            Some(category) => category,
            None => panic!("category {competency} should exist"),
        }
    }

    #[test]
    fn competition_ranks_share_the_lower_number() {
        let ranks = competition_ranks(&[Some(4.0), Some(5.0), None, Some(4.0), Some(3.5)]);
        assert_eq!(ranks, vec![Some(2), Some(1), None, Some(2), Some(4)]);
        assert_eq!(competition_ranks(&[]), Vec::<Option<u32>>::new());
        assert_eq!(competition_ranks(&[None, None]), vec![None, None]);
    }

    #[test]
    fn empty_pairs_have_no_mean() {
        assert_eq!(ScoreStats::default().mean(), None);
        let mut stats = ScoreStats::default();
        stats.record(3);
        stats.record(4);
        assert_eq!(stats.mean(), Some(3.5));
    }

    #[test]
    fn category_mean_is_pooled_over_respondent_scores() {
        let taxonomy = small_taxonomy();
        // Q1 has three answers, Q2 only one: the pooled mean weights each score equally.
        let rows = vec![
            row(1, "Owners", &[("Q1", 6), ("Q2", 2)]),
            row(2, "Board", &[("Q1", 6)]),
            row(3, "Staff", &[("Q1", 6)]),
        ];
        let set = aggregate(&taxonomy, &rows);

        let communication = category(&set, "Communication");
        assert_eq!(communication.stats, ScoreStats { count: 4, sum: 20 });
        assert_eq!(communication.stats.mean(), Some(5.0));
        assert_ne!(communication.stats.mean(), Some((6.0 + 2.0) / 2.0));
    }

    #[test]
    fn ranks_are_scoped_to_sibling_groups() {
        let taxonomy = small_taxonomy();
        let rows = vec![
            row(1, "Owners", &[("Q1", 5), ("Q3", 5), ("Q4", 2)]),
            row(2, "Board", &[("Q1", 3), ("Q3", 3)]),
        ];
        let set = aggregate(&taxonomy, &rows);

        assert_eq!(category(&set, "Communication").rank, Some(1));
        assert_eq!(category(&set, "Trust").rank, Some(1));
        // Alone in its focus area, so first despite the lowest mean.
        assert_eq!(category(&set, "Succession").rank, Some(1));

        let trust = category(&set, "Trust");
        let ranks = trust
            .per_constituency
            .iter()
            .map(|score| (score.constituency.as_str(), score.rank))
            .collect::<Vec<_>>();
        assert_eq!(ranks, vec![("Owners", Some(1)), ("Board", Some(2)), ("Staff", None)]);
    }

    #[test]
    fn distribution_lists_every_scale_value() {
        let taxonomy = small_taxonomy();
        let rows = vec![row(1, "Owners", &[("Q1", 1)]), row(2, "Staff", &[("Q1", 6)])];
        let set = aggregate(&taxonomy, &rows);
        assert_eq!(set.questions[0].distribution, vec![1, 0, 0, 0, 0, 1]);
        assert_eq!(set.questions[1].distribution, vec![0; 6]);
        assert_eq!(set.questions[1].overall.mean(), None);
    }

    #[test]
    fn answers_outside_taxonomy_or_audience_are_skipped() {
        let taxonomy = small_taxonomy();
        let rows = vec![
            row(1, "Board", &[("Q4", 6), ("Q99", 3), ("Q1", 4)]),
            row(2, "Retired", &[("Q1", 1)]),
        ];
        let set = aggregate(&taxonomy, &rows);
        assert_eq!(set.respondent_count, 1);
        assert_eq!(set.unassigned_rows, 1);
        assert_eq!(set.questions[3].overall.count, 0);
        assert_eq!(set.questions[0].overall, ScoreStats { count: 1, sum: 4 });
        assert_eq!(set.constituencies[1].respondents, 1);
    }

    const CONSTITUENCIES: [&str; 3] = ["Owners", "Board", "Staff"];
    const QUESTIONS: [&str; 5] = ["Q1", "Q2", "Q3", "Q4", "Q5"];

    fn arb_rows() -> impl Strategy<Value = Vec<ResponseRow>> {
        prop::collection::vec(
            (0..CONSTITUENCIES.len(), prop::collection::vec(prop::option::of(1_u8..=6), 5)),
            0..40,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(index, (constituency, scores))| ResponseRow {
                    respondent_id: u32::try_from(index + 1).unwrap_or(u32::MAX),
                    constituency: CONSTITUENCIES[constituency].to_string(),
                    answers: QUESTIONS
                        .iter()
                        .zip(scores)
                        .filter_map(|(question, score)| score.map(|s| ((*question).to_string(), s)))
                        .collect::<BTreeMap<_, _>>(),
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn distribution_sums_to_answer_count(rows in arb_rows()) {
            let set = aggregate(&small_taxonomy(), &rows);
            for question in &set.questions {
                prop_assert_eq!(question.distribution.iter().sum::<u32>(), question.overall.count);
                let by_constituency = question.per_constituency.iter().map(|stats| stats.count).sum::<u32>();
                prop_assert_eq!(by_constituency, question.overall.count);
            }
        }

        #[test]
        fn row_order_does_not_matter(shuffled in arb_rows().prop_shuffle()) {
            let taxonomy = small_taxonomy();
            let mut ordered = shuffled.clone();
            ordered.sort_by_key(|row| row.respondent_id);
            prop_assert_eq!(aggregate(&taxonomy, &shuffled), aggregate(&taxonomy, &ordered));
        }

        #[test]
        fn ranks_follow_descending_means(rows in arb_rows()) {
            let set = aggregate(&small_taxonomy(), &rows);
            for category in &set.categories {
                let mut ranked = category
                    .per_constituency
                    .iter()
                    .filter_map(|score| score.rank.map(|rank| (rank, score.stats.mean())))
                    .collect::<Vec<_>>();
                ranked.sort_by_key(|(rank, _)| *rank);
                for pair in ranked.windows(2) {
                    prop_assert!(pair[0].1 >= pair[1].1);
                    if pair[0].1 == pair[1].1 {
                        prop_assert_eq!(pair[0].0, pair[1].0);
                    }
                }
                for score in &category.per_constituency {
                    prop_assert_eq!(score.rank.is_some(), score.stats.count > 0);
                }
            }
        }
    }
}
