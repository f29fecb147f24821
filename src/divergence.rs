//! Rank-turbulence divergence between two snapshots of n-gram usage
//!
//! Each snapshot ranks n-grams by decreasing prevalence. The contribution of
//! an n-gram ranked r1 in the first snapshot and r2 in the second is
//!
//! ```text
//! ((α+1)/α) |r1^(-α) - r2^(-α)|^(1/(α+1))
//! ```
//!
//! and the divergence between the snapshots is the sum of all contributions.
//! Small values of α emphasize movements near the top of the rankings.

use crate::{
    progress::{ProgressReport, Work},
    stats::Statistic,
    table::WideTable,
    Date, Ngram, Result,
};
use anyhow::Context;
use rayon::prelude::*;
use std::{cmp::Ordering, collections::HashMap};

/// Default divergence exponent
pub const DEFAULT_ALPHA: f64 = 1.0 / 3.0;

/// Rank of each n-gram within a snapshot, 1 being the most prevalent
pub type Ranks = HashMap<Ngram, f64>;

/// Invalid divergence input
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DivergenceError {
    /// Ranks must be finite and strictly positive
    #[error("n-gram {ngram:?} has invalid rank {rank}")]
    InvalidRank { ngram: Ngram, rank: f64 },

    /// The exponent must be finite and strictly positive
    #[error("invalid divergence exponent {0}")]
    InvalidAlpha(f64),
}

/// Contribution of one n-gram to the divergence between two snapshots
#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    /// N-gram
    pub ngram: Ngram,

    /// Rank in the first snapshot
    pub rank1: f64,

    /// Rank in the second snapshot
    pub rank2: f64,

    /// Contribution to the divergence
    pub divergence: f64,
}

/// Contribution of an n-gram with ranks `rank1` and `rank2`
///
/// Ranks must have been validated as finite and strictly positive.
fn contribution(rank1: f64, rank2: f64, alpha: f64) -> f64 {
    (alpha + 1.0) / alpha * (rank1.powf(-alpha) - rank2.powf(-alpha)).abs().powf(1.0 / (alpha + 1.0))
}

/// Rank the values of a snapshot
///
/// The most prevalent n-gram gets rank 1. Depending on the statistic, more
/// prevalent means larger (counts, frequencies) or smaller (ranks) values.
/// Ties are broken by n-gram text, so that ranks are distinct. Non-finite
/// values are ignored.
pub fn rank_snapshot<'a>(
    values: impl IntoIterator<Item = (&'a Ngram, f64)>,
    statistic: Statistic,
) -> Ranks {
    let mut values = values
        .into_iter()
        .filter(|(ngram, value)| {
            let finite = value.is_finite();
            if !finite {
                log::debug!("Ignored non-finite value {value} of {ngram:?}");
            }
            finite
        })
        .collect::<Vec<_>>();
    values.sort_unstable_by(|(ngram1, value1), (ngram2, value2)| {
        let by_value = if statistic.higher_is_better() {
            value2.total_cmp(value1)
        } else {
            value1.total_cmp(value2)
        };
        by_value.then_with(|| ngram1.cmp(ngram2))
    });
    values
        .into_iter()
        .enumerate()
        .map(|(idx, (ngram, _value))| (ngram.clone(), (idx + 1) as f64))
        .collect()
}

/// Per-n-gram divergence between two snapshots
#[derive(Clone, Debug, PartialEq)]
pub struct Divergence {
    /// Contributions, by decreasing divergence
    contributions: Vec<Contribution>,

    /// Position of each n-gram in `contributions`
    index: HashMap<Ngram, usize>,
}
//
impl Divergence {
    /// Compute the divergence between two snapshots
    ///
    /// Every n-gram ranked in either snapshot gets a contribution. An n-gram
    /// that is missing from one snapshot is given that snapshot's worst
    /// rank, one past the deepest rank that it tracks.
    pub fn compute(ranks1: &Ranks, ranks2: &Ranks, alpha: f64) -> Result<Self, DivergenceError> {
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(DivergenceError::InvalidAlpha(alpha));
        }
        let worst1 = worst_rank(ranks1)?;
        let worst2 = worst_rank(ranks2)?;

        let mut contributions = (ranks1.keys())
            .chain(ranks2.keys().filter(|ngram| !ranks1.contains_key(*ngram)))
            .map(|ngram| {
                let rank1 = ranks1.get(ngram).copied().unwrap_or(worst1);
                let rank2 = ranks2.get(ngram).copied().unwrap_or(worst2);
                Contribution {
                    ngram: ngram.clone(),
                    rank1,
                    rank2,
                    divergence: contribution(rank1, rank2, alpha),
                }
            })
            .collect::<Vec<_>>();
        contributions.sort_unstable_by(|c1, c2| {
            match c2.divergence.total_cmp(&c1.divergence) {
                Ordering::Equal => c1.ngram.cmp(&c2.ngram),
                other => other,
            }
        });
        let index = (contributions.iter().enumerate())
            .map(|(idx, contribution)| (contribution.ngram.clone(), idx))
            .collect();
        Ok(Self {
            contributions,
            index,
        })
    }

    /// All contributions, by decreasing divergence
    pub fn contributions(&self) -> &[Contribution] {
        &self.contributions
    }

    /// The `k` largest contributions
    pub fn top(&self, k: usize) -> &[Contribution] {
        &self.contributions[..k.min(self.contributions.len())]
    }

    /// Contribution of an n-gram, zero if neither snapshot ranks it
    pub fn score(&self, ngram: &str) -> f64 {
        self.index
            .get(ngram)
            .map_or(0.0, |&idx| self.contributions[idx].divergence)
    }

    /// Divergence between the two snapshots
    pub fn total(&self) -> f64 {
        self.contributions.iter().map(|c| c.divergence).sum()
    }
}

/// Validate the ranks of a snapshot and determine its worst rank
fn worst_rank(ranks: &Ranks) -> Result<f64, DivergenceError> {
    let mut deepest = 0.0f64;
    for (ngram, &rank) in ranks {
        if !(rank.is_finite() && rank > 0.0) {
            return Err(DivergenceError::InvalidRank {
                ngram: ngram.clone(),
                rank,
            });
        }
        deepest = deepest.max(rank);
    }
    Ok(deepest.floor() + 1.0)
}

/// Ranks of a table's n-grams on some day
pub fn snapshot(table: &WideTable, date: Date, statistic: Statistic) -> Result<Ranks> {
    let row = table
        .row(date)
        .with_context(|| format!("no data was recorded on {date}"))?;
    Ok(rank_snapshot(row, statistic))
}

/// Divergence between two days of a table
pub fn compare_dates(
    table: &WideTable,
    date1: Date,
    date2: Date,
    statistic: Statistic,
    alpha: f64,
) -> Result<Divergence> {
    let ranks1 = snapshot(table, date1, statistic)?;
    let ranks2 = snapshot(table, date2, statistic)?;
    Divergence::compute(&ranks1, &ranks2, alpha)
        .with_context(|| format!("comparing {date1} with {date2}"))
}

/// Settings of a divergence sweep
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepSettings {
    /// First compared day
    pub begin: Date,

    /// Last compared day
    pub end: Date,

    /// Each day is compared with the day this long before it
    pub offset: chrono::Days,

    /// Number of top contributors kept from each comparison
    pub top: usize,

    /// Statistic whose values are ranked
    pub statistic: Statistic,

    /// Divergence exponent
    pub alpha: f64,
}

/// Accumulate the top contributors of many comparisons
///
/// Each day of the sweep range is compared with the day that precedes it by
/// the configured offset, and the contributions of the top contributors of
/// each comparison are summed. Days for which either snapshot is missing are
/// skipped. Returns n-grams by decreasing summed contribution.
pub fn sweep(
    table: &WideTable,
    settings: SweepSettings,
    report: &ProgressReport,
) -> Result<Vec<(Ngram, f64)>> {
    let days = (settings.begin.iter_days())
        .take_while(|day| *day <= settings.end)
        .collect::<Vec<_>>();
    let progress = report.add("Comparing snapshots", Work::PercentSteps(days.len()));
    let sums = days
        .into_par_iter()
        .map(|day| {
            let result = compare_with_past(table, day, &settings);
            progress.make_progress(1);
            result
        })
        .try_fold(HashMap::<Ngram, f64>::new, |mut sums, top| {
            for contribution in top? {
                *sums.entry(contribution.ngram).or_default() += contribution.divergence;
            }
            Ok::<_, anyhow::Error>(sums)
        })
        .try_reduce(HashMap::new, |mut sums1, sums2| {
            for (ngram, sum) in sums2 {
                *sums1.entry(ngram).or_default() += sum;
            }
            Ok(sums1)
        })?;
    let mut sums = sums.into_iter().collect::<Vec<_>>();
    sums.par_sort_unstable_by(|(ngram1, sum1), (ngram2, sum2)| {
        sum2.total_cmp(sum1).then_with(|| ngram1.cmp(ngram2))
    });
    Ok(sums)
}

/// Top contributors of the comparison of a day with its past
fn compare_with_past(
    table: &WideTable,
    day: Date,
    settings: &SweepSettings,
) -> Result<Vec<Contribution>> {
    let Some(past) = day.checked_sub_days(settings.offset) else {
        log::warn!("Skipped {day}: comparison date is out of range");
        return Ok(Vec::new());
    };
    if table.row(past).is_none() || table.row(day).is_none() {
        log::warn!("Skipped comparison of {past} with {day}: missing data");
        return Ok(Vec::new());
    }
    let divergence = compare_dates(table, past, day, settings.statistic, settings.alpha)?;
    Ok(divergence.top(settings.top).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(list: &[(&str, f64)]) -> Ranks {
        list.iter()
            .map(|&(ngram, rank)| (Ngram::from(ngram), rank))
            .collect()
    }

    fn day(s: &str) -> Date {
        s.parse().unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn regression_baseline() {
        let divergence = Divergence::compute(
            &ranks(&[("w", 1.0), ("x", 999.0)]),
            &ranks(&[("w", 1000.0), ("x", 1.0)]),
            DEFAULT_ALPHA,
        )
        .unwrap();
        assert_close(divergence.score("w"), 3.696_084_3);
        assert_close(contribution(1.0, 1000.0, DEFAULT_ALPHA), 3.696_084_3);
        assert_close(contribution(1.0, 3.0, 1.0), 1.632_993_2);
        assert_close(contribution(7.0, 7.0, 0.5), 0.0);
    }

    #[test]
    fn symmetric_under_swap() {
        let before = ranks(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        let after = ranks(&[("b", 1.0), ("d", 2.0), ("a", 3.0)]);
        let forward = Divergence::compute(&before, &after, DEFAULT_ALPHA).unwrap();
        let backward = Divergence::compute(&after, &before, DEFAULT_ALPHA).unwrap();
        for ngram in ["a", "b", "c", "d"] {
            assert_close(forward.score(ngram), backward.score(ngram));
        }
        assert_close(forward.total(), backward.total());
    }

    #[test]
    fn monotonic_in_rank_distance() {
        for alpha in [0.1, DEFAULT_ALPHA, 1.0, 5.0] {
            let mut previous = 0.0;
            for rank2 in [5.0, 6.0, 10.0, 100.0, 1e6] {
                let score = contribution(5.0, rank2, alpha);
                assert!(score >= previous, "score decreased at rank {rank2}");
                previous = score;
            }
            let mut previous = 0.0;
            for rank2 in [5.0, 4.0, 2.0, 1.0] {
                let score = contribution(5.0, rank2, alpha);
                assert!(score >= previous, "score decreased at rank {rank2}");
                previous = score;
            }
        }
    }

    #[test]
    fn missing_ngrams_get_worst_rank() {
        let before = ranks(&[("a", 1.0), ("b", 2.0), ("gone", 3.0)]);
        let after = ranks(&[("a", 1.0), ("b", 2.0), ("new", 3.0), ("c", 4.0)]);
        let divergence = Divergence::compute(&before, &after, DEFAULT_ALPHA).unwrap();
        let gone = (divergence.contributions().iter())
            .find(|c| &*c.ngram == "gone")
            .unwrap();
        assert_eq!((gone.rank1, gone.rank2), (3.0, 5.0));
        let new = (divergence.contributions().iter())
            .find(|c| &*c.ngram == "new")
            .unwrap();
        assert_eq!((new.rank1, new.rank2), (4.0, 3.0));
        assert_eq!(divergence.score("a"), 0.0);
        assert_eq!(divergence.score("never seen"), 0.0);
        assert_eq!(divergence.contributions().len(), 5);
    }

    #[test]
    fn contributions_are_sorted() {
        let before = ranks(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let after = ranks(&[("d", 1.0), ("b", 2.0), ("c", 3.0), ("a", 4.0)]);
        let divergence = Divergence::compute(&before, &after, DEFAULT_ALPHA).unwrap();
        let order = (divergence.contributions().iter())
            .map(|c| &*c.ngram)
            .collect::<Vec<_>>();
        assert_eq!(order, ["a", "d", "b", "c"]);
        assert_eq!(divergence.top(2).len(), 2);
        assert_eq!(divergence.top(10).len(), 4);
        let sum = divergence.contributions().iter().map(|c| c.divergence).sum::<f64>();
        assert_close(divergence.total(), sum);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let good = ranks(&[("a", 1.0)]);
        for rank in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let bad = ranks(&[("a", rank)]);
            assert!(matches!(
                Divergence::compute(&good, &bad, DEFAULT_ALPHA),
                Err(DivergenceError::InvalidRank { .. })
            ));
        }
        for alpha in [0.0, -0.5, f64::NAN] {
            assert!(matches!(
                Divergence::compute(&good, &good, alpha),
                Err(DivergenceError::InvalidAlpha(_))
            ));
        }
    }

    #[test]
    fn ranking_breaks_ties() {
        let values = [("b", 10.0), ("a", 10.0), ("c", 50.0), ("d", f64::NAN)]
            .map(|(ngram, value)| (Ngram::from(ngram), value));
        let counted = rank_snapshot(values.iter().map(|(n, v)| (n, *v)), Statistic::Count);
        assert_eq!(counted, ranks(&[("c", 1.0), ("a", 2.0), ("b", 3.0)]));
        let ranked = rank_snapshot(values.iter().map(|(n, v)| (n, *v)), Statistic::Rank);
        assert_eq!(ranked, ranks(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]));
    }

    fn history() -> WideTable {
        let mut table = WideTable::default();
        let data = [
            ("2020-01-01", [("virus", 1.0), ("flu", 50.0), ("beach", 30.0)]),
            ("2020-01-08", [("virus", 90.0), ("flu", 40.0), ("beach", 5.0)]),
            ("2020-01-15", [("virus", 120.0), ("flu", 10.0), ("beach", 1.0)]),
        ];
        for (date, counts) in data {
            for (ngram, count) in counts {
                table.set(day(date), ngram, Some(count));
            }
        }
        table.set(day("2020-01-08"), "lockdown", None);
        table
    }

    #[test]
    fn compares_table_dates() {
        let table = history();
        let divergence = compare_dates(
            &table,
            day("2020-01-01"),
            day("2020-01-08"),
            Statistic::Count,
            DEFAULT_ALPHA,
        )
        .unwrap();
        assert_eq!(divergence.contributions().len(), 3);
        assert_eq!(&*divergence.contributions()[0].ngram, "virus");
        assert_eq!(divergence.score("lockdown"), 0.0);
        assert!(compare_dates(
            &table,
            day("2020-01-01"),
            day("2020-01-02"),
            Statistic::Count,
            DEFAULT_ALPHA,
        )
        .is_err());
    }

    #[test]
    fn sweep_accumulates_top_contributors() {
        let table = history();
        let settings = SweepSettings {
            begin: day("2020-01-08"),
            end: day("2020-01-15"),
            offset: chrono::Days::new(7),
            top: 1,
            statistic: Statistic::Count,
            alpha: DEFAULT_ALPHA,
        };
        let sums = sweep(&table, settings, &ProgressReport::hidden()).unwrap();
        let first = compare_dates(&table, day("2020-01-01"), day("2020-01-08"), Statistic::Count, DEFAULT_ALPHA)
            .unwrap();
        let second = compare_dates(&table, day("2020-01-08"), day("2020-01-15"), Statistic::Count, DEFAULT_ALPHA)
            .unwrap();
        let mut expected = HashMap::<Ngram, f64>::new();
        for top in [first.top(1), second.top(1)] {
            for c in top {
                *expected.entry(c.ngram.clone()).or_default() += c.divergence;
            }
        }
        assert_eq!(sums.len(), expected.len());
        for (ngram, sum) in &sums {
            assert_close(*sum, expected[ngram]);
        }
        assert!(sums.windows(2).all(|pair| pair[0].1 >= pair[1].1));
    }
}
