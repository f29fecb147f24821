//! Incremental synchronization of local tables with the remote store
//!
//! Each partition is synchronized independently of the others:
//!
//! 1. Decide from which day to fetch each n-gram. N-grams that every persisted
//!    table already tracks only need their last few days refreshed, others
//!    need their full history.
//! 2. Fetch the daily records of every requested n-gram, dropping records
//!    whose timestamp cannot be decoded.
//! 3. Pivot the records into one wide table per statistic.
//! 4. Merge each table into its persisted counterpart, without ever
//!    overwriting a value that is already known, and write back what changed.
//!
//! A partition that cannot be fetched, or whose tables cannot be read back, is
//! reported and skipped, the others carry on. Only write failures, which
//! would affect every partition, stop the whole run.

use crate::{
    config::SyncConfig,
    progress::{ProgressReport, Work},
    source::{Row, SourceError, TimeseriesSource},
    stats::StatisticKind,
    table::WideTable,
    Date, Ngram, Partition,
};
use anyhow::Context;
use clap::ValueEnum;
use std::{
    collections::BTreeMap,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Semaphore,
    task::JoinSet,
};

/// How n-grams are grouped into remote queries
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, ValueEnum)]
pub enum BatchStrategy {
    /// One query per partition, covering all of its n-grams
    #[default]
    Batched,

    /// One query per n-gram
    PerNgram,
}

/// Successful end of a partition's synchronization
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Some tables were created or updated
    Fetched {
        /// Number of tables that were written
        tables: usize,
    },

    /// Every table was already up to date
    NoNewData,
}

/// Failed synchronization of a partition
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// The remote store could not provide the partition's data
    #[error("fetching from the remote store failed")]
    Source(#[from] SourceError),

    /// Another synchronization of this partition is in progress, or a
    /// previous one crashed
    #[error(
        "partition is locked by {}, delete this file if no other synchronization is running",
        .0.display()
    )]
    Locked(PathBuf),

    /// A persisted table of this partition could not be read back
    #[error("persisted table is unreadable")]
    Corrupt(#[source] anyhow::Error),

    /// Tables could not be written
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
//
impl PartitionError {
    /// Truth that this error affects more than one partition, and should thus
    /// stop the synchronization run
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Partition-by-partition report of a synchronization run
#[derive(Debug, Default)]
pub struct Summary {
    /// Partitions whose tables were updated
    pub fetched: Vec<Partition>,

    /// Partitions whose tables were already up to date
    pub unchanged: Vec<Partition>,

    /// Partitions that could not be synchronized, and why
    pub failed: Vec<(Partition, String)>,
}
//
impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for partition in &self.fetched {
            writeln!(f, "fetched\t{partition}")?;
        }
        for partition in &self.unchanged {
            writeln!(f, "skipped (no new data)\t{partition}")?;
        }
        for (partition, cause) in &self.failed {
            writeln!(f, "failed\t{partition}\t{cause}")?;
        }
        Ok(())
    }
}

/// Synchronize a set of partitions, each with its list of n-grams
///
/// Partitions are processed concurrently, up to the configured number of
/// workers. Fails if a systemic error occurs, or if every partition failed.
pub async fn sync_all<S: TimeseriesSource>(
    config: Arc<SyncConfig>,
    source: Arc<S>,
    jobs: Vec<(Partition, Vec<Ngram>)>,
    report: &ProgressReport,
) -> anyhow::Result<Summary> {
    // Track partition completion
    let num_jobs = jobs.len();
    let progress = report.add("Synchronizing partitions", Work::Steps(num_jobs));

    // Start synchronizing all partitions
    let workers = Arc::new(Semaphore::new(config.workers.get()));
    let mut partitions = JoinSet::new();
    for (partition, ngrams) in jobs {
        let config = config.clone();
        let source = source.clone();
        let workers = workers.clone();
        let progress = progress.clone();
        partitions.spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .expect("the worker semaphore is never closed");
            log::info!("Synchronizing {} n-grams of {partition}", ngrams.len());
            let result = sync_partition(&config, &*source, &partition, &ngrams).await;
            progress.make_progress(1);
            (partition, result)
        });
    }

    // Collect results as partitions finish
    let mut summary = Summary::default();
    while let Some(joined) = partitions.join_next().await {
        let (partition, result) = joined.context("collecting results from one partition")?;
        match result {
            Ok(Outcome::Fetched { tables }) => {
                log::info!("Updated {tables} tables of {partition}");
                summary.fetched.push(partition);
            }
            Ok(Outcome::NoNewData) => {
                log::info!("Tables of {partition} were already up to date");
                summary.unchanged.push(partition);
            }
            Err(e) if e.is_systemic() => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("synchronizing {partition}"));
            }
            Err(e) => {
                let cause = format!("{:#}", anyhow::Error::new(e));
                log::warn!("Skipped {partition}: {cause}");
                summary.failed.push((partition, cause));
            }
        }
    }
    anyhow::ensure!(
        num_jobs == 0 || summary.failed.len() < num_jobs,
        "all {num_jobs} partitions failed to synchronize"
    );
    Ok(summary)
}

/// Synchronize one partition's tables for some n-grams
pub async fn sync_partition<S: TimeseriesSource>(
    config: &SyncConfig,
    source: &S,
    partition: &Partition,
    ngrams: &[Ngram],
) -> Result<Outcome, PartitionError> {
    // Make sure nobody else is working on this partition
    let dir = config.partition_dir(partition);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating table directory {}", dir.display()))?;
    let _lock = PartitionLock::acquire(&dir).await?;

    // Load what we already know
    let mut stored = BTreeMap::new();
    for kind in config.persisted_kinds() {
        let table = WideTable::load(&config.table_path(partition, kind))
            .await
            .map_err(PartitionError::Corrupt)?;
        stored.insert(kind, table);
    }

    // Fetch new data
    let windows = fetch_windows(config, &stored, ngrams);
    let fetched = tokio::time::timeout(config.timeout, async {
        let mut fetched = Vec::with_capacity(windows.len());
        for (start, ngrams) in &windows {
            log::debug!("Fetching {} n-grams of {partition} from {start}", ngrams.len());
            fetched.push(fetch(config, source, partition, ngrams, *start).await?);
        }
        Ok::<_, SourceError>(fetched)
    })
    .await
    .map_err(|_| SourceError::Timeout(config.timeout))??;

    // Pivot it into tables
    let mut pivoted = Vec::with_capacity(windows.len());
    for ((start, ngrams), rows) in windows.iter().zip(fetched) {
        let records = rows
            .into_iter()
            .filter_map(|row| match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("Dropped a record of {partition}: {e}");
                    None
                }
            })
            .collect::<Vec<_>>();
        pivoted.push(WideTable::pivot(
            &records,
            ngrams,
            (*start, config.today),
            config.case_insensitive,
        ));
    }

    // Merge these into the persisted tables
    let mut written = 0;
    for (kind, stored) in stored {
        let mut fetched = (pivoted.iter_mut()).map(|tables| {
            tables
                .remove(&kind)
                .expect("pivoting produces a table for every statistic")
        });
        let (mut table, mut changed) = match stored {
            Some(stored) => (stored, false),
            None => match fetched.next() {
                Some(first) => (first, true),
                None => continue,
            },
        };
        for fetched in fetched {
            changed |= table.merge(&fetched);
        }
        if changed {
            table.save(&config.table_path(partition, kind)).await?;
            written += 1;
        }
    }
    Ok(if written > 0 {
        Outcome::Fetched { tables: written }
    } else {
        Outcome::NoNewData
    })
}

/// Group requested n-grams by the day from which they must be fetched
///
/// N-grams that every persisted table already tracks only need their last
/// few days refreshed. Others, including all n-grams of a partition that
/// misses some tables, need their full history.
fn fetch_windows(
    config: &SyncConfig,
    stored: &BTreeMap<StatisticKind, Option<WideTable>>,
    ngrams: &[Ngram],
) -> Vec<(Date, Vec<Ngram>)> {
    let (known, new): (Vec<Ngram>, Vec<Ngram>) = ngrams.iter().cloned().partition(|ngram| {
        stored
            .values()
            .all(|table| table.as_ref().is_some_and(|table| table.contains(ngram)))
    });
    let mut windows = Vec::with_capacity(2);
    if !new.is_empty() {
        log::debug!("{} n-grams need their full history", new.len());
        windows.push((config.history_floor, new));
    }
    if !known.is_empty() {
        windows.push((config.incremental_start(), known));
    }
    windows
}

/// Fetch the rows of a partition according to the batching strategy
async fn fetch<S: TimeseriesSource>(
    config: &SyncConfig,
    source: &S,
    partition: &Partition,
    ngrams: &[Ngram],
    start: Date,
) -> Result<Vec<Row>, SourceError> {
    match config.batch {
        BatchStrategy::Batched => source.query(partition, ngrams, start).await,
        BatchStrategy::PerNgram => {
            let mut rows = Vec::new();
            for ngram in ngrams {
                log::trace!("Fetching {partition} n-gram {ngram:?}");
                rows.extend(
                    source
                        .query(partition, std::slice::from_ref(ngram), start)
                        .await?,
                );
            }
            Ok(rows)
        }
    }
}

/// Exclusive right to synchronize a partition, released on drop
#[derive(Debug)]
struct PartitionLock(PathBuf);
//
impl PartitionLock {
    /// Name of the lock file within the partition directory
    const FILE_NAME: &'static str = ".lock";

    /// Try to take the lock of a partition directory
    async fn acquire(dir: &Path) -> Result<Self, PartitionError> {
        let path = dir.join(Self::FILE_NAME);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PartitionError::Locked(path))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("creating lock file {}", path.display()))
                    .into())
            }
        };
        let lock = Self(path);
        file.write_all(std::process::id().to_string().as_bytes())
            .await
            .with_context(|| format!("writing lock file {}", lock.0.display()))?;
        Ok(lock)
    }
}
//
impl Drop for PartitionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            log::error!("Failed to release lock {}: {e}", self.0.display());
        }
    }
}
