//! Daily n-gram usage statistics

use crate::{Date, Ngram};
use clap::ValueEnum;
use std::fmt;

/// Usage statistics of one n-gram on one day
///
/// Every field may be missing. A missing rank means that the n-gram fell out
/// of the set of tracked n-grams that day, which makes it less prevalent than
/// any ranked n-gram, not equally prevalent.
#[derive(Clone, Debug, PartialEq)]
pub struct DailyRecord {
    /// N-gram whose usage is being recorded
    pub ngram: Ngram,

    /// Day on which the usage was recorded
    pub date: Date,

    /// Number of occurences
    pub count: Option<f64>,

    /// Number of occurences, excluding resent content
    pub count_no_rt: Option<f64>,

    /// 1-based rank by number of occurences
    pub rank: Option<f64>,

    /// 1-based rank by number of occurences, excluding resent content
    pub rank_no_rt: Option<f64>,

    /// Fraction of all occurences
    pub freq: Option<f64>,

    /// Fraction of all occurences, excluding resent content
    pub freq_no_rt: Option<f64>,
}

/// Kind of statistic that is recorded daily
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, ValueEnum)]
pub enum Statistic {
    /// Number of occurences
    Count,

    /// 1-based rank by number of occurences
    Rank,

    /// Fraction of all occurences
    Freq,
}
//
impl Statistic {
    /// Truth that larger values of this statistic mean more prevalence
    pub fn higher_is_better(self) -> bool {
        match self {
            Self::Count | Self::Freq => true,
            Self::Rank => false,
        }
    }
}

/// One of the six statistics of a [`DailyRecord`]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StatisticKind {
    /// What is being measured
    pub statistic: Statistic,

    /// Truth that resent content is accounted for
    pub resends: bool,
}
//
impl StatisticKind {
    /// Designate a statistic
    pub const fn new(statistic: Statistic, resends: bool) -> Self {
        Self {
            statistic,
            resends,
        }
    }

    /// Every statistic kind, in table file order
    pub const ALL: [Self; 6] = [
        Self::new(Statistic::Count, true),
        Self::new(Statistic::Count, false),
        Self::new(Statistic::Rank, true),
        Self::new(Statistic::Rank, false),
        Self::new(Statistic::Freq, true),
        Self::new(Statistic::Freq, false),
    ];

    /// Name under which this statistic is stored
    pub fn file_stem(self) -> &'static str {
        match (self.statistic, self.resends) {
            (Statistic::Count, true) => "count",
            (Statistic::Count, false) => "count_no_rt",
            (Statistic::Rank, true) => "rank",
            (Statistic::Rank, false) => "rank_no_rt",
            (Statistic::Freq, true) => "freq",
            (Statistic::Freq, false) => "freq_no_rt",
        }
    }

    /// Extract this statistic from a daily record
    pub fn select(self, record: &DailyRecord) -> Option<f64> {
        match (self.statistic, self.resends) {
            (Statistic::Count, true) => record.count,
            (Statistic::Count, false) => record.count_no_rt,
            (Statistic::Rank, true) => record.rank,
            (Statistic::Rank, false) => record.rank_no_rt,
            (Statistic::Freq, true) => record.freq,
            (Statistic::Freq, false) => record.freq_no_rt,
        }
    }
}
//
impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Which resend variants of the statistics are kept on disk
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, ValueEnum)]
pub enum ResendSelection {
    /// Only statistics that include resent content
    With,

    /// Only statistics that exclude resent content
    Without,

    /// Both variants
    #[default]
    Both,
}
//
impl ResendSelection {
    /// Statistic kinds selected by this setting
    pub fn kinds(self) -> impl Iterator<Item = StatisticKind> {
        StatisticKind::ALL
            .into_iter()
            .filter(move |kind| match self {
                Self::With => kind.resends,
                Self::Without => !kind.resends,
                Self::Both => true,
            })
    }
}

/// Decode the day of a remote timestamp
///
/// Accepts plain ISO 8601 dates, naive date-times with a `T` or space
/// separator, and RFC 3339 timestamps, of which only the calendar day is kept.
pub fn parse_day(time: &str) -> Option<Date> {
    let time = time.trim();
    if let Ok(date) = Date::parse_from_str(time, "%Y-%m-%d") {
        return Some(date);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(date_time) = chrono::NaiveDateTime::parse_from_str(time, format) {
            return Some(date_time.date());
        }
    }
    chrono::DateTime::parse_from_rfc3339(time)
        .ok()
        .map(|date_time| date_time.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> Date {
        s.parse().unwrap()
    }

    #[test]
    fn parses_remote_timestamps() {
        assert_eq!(parse_day("2020-03-01"), Some(day("2020-03-01")));
        assert_eq!(parse_day("2020-03-01T00:00:00"), Some(day("2020-03-01")));
        assert_eq!(parse_day("2020-03-01 12:30:00.250"), Some(day("2020-03-01")));
        assert_eq!(parse_day("2020-03-01T23:00:00+00:00"), Some(day("2020-03-01")));
        assert_eq!(parse_day("NaT"), None);
        assert_eq!(parse_day("2020-02-30"), None);
        assert_eq!(parse_day(""), None);
    }

    #[test]
    fn statistic_kinds_are_distinct() {
        let record = DailyRecord {
            ngram: "virus".into(),
            date: day("2020-03-01"),
            count: Some(1.0),
            count_no_rt: Some(2.0),
            rank: Some(3.0),
            rank_no_rt: Some(4.0),
            freq: Some(5.0),
            freq_no_rt: Some(6.0),
        };
        let selected = StatisticKind::ALL.map(|kind| kind.select(&record));
        assert_eq!(
            selected,
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].map(Some)
        );
        let stems = StatisticKind::ALL.map(StatisticKind::file_stem);
        assert_eq!(
            stems,
            ["count", "count_no_rt", "rank", "rank_no_rt", "freq", "freq_no_rt"]
        );
    }

    #[test]
    fn resend_selection() {
        assert_eq!(ResendSelection::Both.kinds().count(), 6);
        assert!(ResendSelection::With.kinds().all(|kind| kind.resends));
        assert!(ResendSelection::Without.kinds().all(|kind| !kind.resends));
        assert_eq!(ResendSelection::Without.kinds().count(), 3);
    }
}
