//! Remote store of daily n-gram statistics

pub mod http;

use crate::{
    stats::{self, DailyRecord},
    Date, Ngram, Partition,
};
use serde::Deserialize;
use std::{future::Future, time::Duration};

/// Remote source of truth for n-gram time series
pub trait TimeseriesSource: Send + Sync + 'static {
    /// Fetch the daily records of some n-grams of a partition, starting at
    /// some day and up to the most recent data
    ///
    /// N-grams that the source does not know about must yield no rows
    /// rather than an error.
    fn query(
        &self,
        partition: &Partition,
        ngrams: &[Ngram],
        start: Date,
    ) -> impl Future<Output = Result<Vec<Row>, SourceError>> + Send;
}

/// Failure to fetch a partition from the remote store
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The remote store could not be reached or rejected the query
    #[error("querying {url} failed")]
    Request {
        url: Box<str>,
        #[source]
        source: reqwest::Error,
    },

    /// The remote store replied with something that isn't valid row data
    #[error("decoding the reply of {url} failed")]
    Decode {
        url: Box<str>,
        #[source]
        source: csv_async::Error,
    },

    /// The remote store did not reply in time
    #[error("no reply after {0:?}")]
    Timeout(Duration),

    /// The remote store is unavailable for another reason
    #[error("source unavailable: {0}")]
    Unavailable(Box<str>),
}

/// Row of data from the remote store
///
/// Field names follow the remote store's vocabulary.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Row {
    /// N-gram whose usage was recorded
    pub ngram: Ngram,

    /// Timestamp of the recording, whose day is kept
    pub time: Box<str>,

    /// Number of occurences
    pub counts: Option<f64>,

    /// Number of occurences, excluding resent content
    #[serde(rename = "count_noRT")]
    pub count_no_rt: Option<f64>,

    /// Rank by number of occurences
    pub rank: Option<f64>,

    /// Rank by number of occurences, excluding resent content
    #[serde(rename = "rank_noRT")]
    pub rank_no_rt: Option<f64>,

    /// Fraction of all occurences
    pub freq: Option<f64>,

    /// Fraction of all occurences, excluding resent content
    #[serde(rename = "freq_noRT")]
    pub freq_no_rt: Option<f64>,
}
//
impl Row {
    /// Decode the timestamp of this row into a daily record
    pub fn into_record(self) -> Result<DailyRecord, MalformedDate> {
        let Some(date) = stats::parse_day(&self.time) else {
            return Err(MalformedDate(self));
        };
        Ok(DailyRecord {
            ngram: self.ngram,
            date,
            count: self.counts,
            count_no_rt: self.count_no_rt,
            rank: self.rank,
            rank_no_rt: self.rank_no_rt,
            freq: self.freq,
            freq_no_rt: self.freq_no_rt,
        })
    }
}

/// Row whose timestamp could not be decoded
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("row {0:?} has a malformed timestamp")]
pub struct MalformedDate(pub Row);
