//! Daily n-gram usage time series, kept in sync with a remote message store,
//! and rank-turbulence divergence between two points in time.
//!
//! The remote store publishes, for every language and n-gram size, daily
//! counts, ranks and frequencies of each n-gram, with and without resent
//! content. We mirror the n-grams we care about into local TSV tables that
//! only ever grow, then compare the rank distributions of two dates.

mod config;
mod divergence;
mod filter;
mod languages;
mod progress;
mod source;
mod stats;
mod sync;
mod table;
mod targets;

use crate::{
    config::{Connection, SyncConfig},
    filter::FilterMode,
    progress::ProgressReport,
    source::http::HttpSource,
    stats::{ResendSelection, Statistic, StatisticKind},
    sync::BatchStrategy,
    table::WideTable,
};
use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use log::LevelFilter;
use std::{
    fmt,
    num::{NonZeroU32, NonZeroUsize},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Track n-gram usage over time and measure how it shifts
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Available actions
#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the local time series tables up to date with the remote store
    Sync(SyncArgs),

    /// Rank n-grams by their contribution to the divergence between two dates
    Divergence(DivergenceArgs),

    /// Accumulate the top divergence contributors over a range of dates
    Sweep(SweepArgs),

    /// Filter candidate n-grams read from stdin, one per line
    Filter(FilterArgs),
}

/// Settings of the `sync` action
#[derive(ClapArgs, Debug)]
pub struct SyncArgs {
    /// Language registry, a TSV file with `code` and `language` columns
    #[arg(short, long, default_value = "data/languages.tsv")]
    languages: PathBuf,

    /// Only synchronize these languages of the registry
    #[arg(long, value_delimiter = ',')]
    only: Vec<Box<str>>,

    /// Directory of candidate n-gram lists, laid out as
    /// `<targets>/<n>grams/<code>.tsv`
    #[arg(short, long, default_value = "data/targets")]
    targets: PathBuf,

    /// Directory where time series tables are accumulated
    #[arg(short, long, default_value = "data/timeseries")]
    data_dir: PathBuf,

    /// N-gram sizes to synchronize
    #[arg(short = 'n', long, value_delimiter = ',', default_value = "1,2")]
    sizes: Vec<NonZeroUsize>,

    /// Which resend variants of each statistic should be kept on disk
    #[arg(long, value_enum, default_value_t = ResendSelection::Both)]
    resends: ResendSelection,

    /// Date from which the full history of a new n-gram table is fetched
    #[arg(long, default_value = "2008-09-09")]
    since: Date,

    /// Number of past days that are fetched again when a table already exists
    ///
    /// The remote store may still be revising recent days. Anything revised
    /// further in the past than this will never reach the local tables.
    #[arg(long, default_value_t = config::DEFAULT_LOOKBACK_DAYS)]
    lookback_days: u32,

    /// How n-grams are grouped into remote queries
    #[arg(long, value_enum, default_value_t = BatchStrategy::Batched)]
    batch: BatchStrategy,

    /// Fold remote n-grams which only differ by case onto requested n-grams
    #[arg(long, default_value_t = false)]
    case_insensitive: bool,

    /// Filter applied to candidate n-grams before they are synchronized
    #[arg(long, value_enum, default_value_t = FilterMode::International)]
    filter: FilterMode,

    /// Synchronize candidates as-is, without filtering
    #[arg(long, default_value_t = false, conflicts_with = "filter")]
    no_filter: bool,

    /// Maximal number of partitions synchronized concurrently
    #[arg(short, long, default_value = "10")]
    workers: NonZeroUsize,

    /// Time budget of the remote fetch of one partition, in seconds
    #[arg(long, default_value = "300")]
    timeout: NonZeroU32,

    /// Base URL of the remote time series store
    #[arg(long, env = "NGRAM_SOURCE_URL")]
    source_url: Box<str>,

    /// User name used to authenticate to the remote store
    #[arg(long, env = "NGRAM_SOURCE_USER")]
    source_user: Option<Box<str>>,

    /// Password used to authenticate to the remote store
    #[arg(long, env = "NGRAM_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Option<Box<str>>,
}

/// Location of the table that a divergence is computed from
#[derive(ClapArgs, Debug)]
struct TableArgs {
    /// Directory where time series tables are accumulated
    #[arg(short, long, default_value = "data/timeseries")]
    data_dir: PathBuf,

    /// Language registry, used to prompt for a language when none is given
    #[arg(long, default_value = "data/languages.tsv")]
    languages: PathBuf,

    /// Language code, e.g. "en"
    ///
    /// Will interactively prompt for a known language if not specified.
    #[arg(short, long)]
    language: Option<Box<str>>,

    /// N-gram size
    #[arg(short = 'n', long, default_value = "1")]
    size: NonZeroUsize,

    /// Rank on the statistic that excludes resent content
    #[arg(long, default_value_t = false)]
    no_resends: bool,

    /// Statistic whose values are ranked
    #[arg(short, long, value_enum, default_value_t = Statistic::Count)]
    statistic: Statistic,

    /// Divergence exponent, smaller values emphasize the top ranks
    #[arg(short, long, default_value_t = divergence::DEFAULT_ALPHA)]
    alpha: f64,
}
//
impl TableArgs {
    /// Locate and load the table that these arguments designate
    async fn load(&self) -> Result<WideTable> {
        let language = match &self.language {
            Some(code) => code.clone(),
            None => {
                let registry = languages::load(&self.languages).await?;
                languages::prompt(&registry)?.code
            }
        };
        let partition = Partition::new(language, self.size);
        let kind = StatisticKind::new(self.statistic, !self.no_resends);
        let path = table::path(&self.data_dir, &partition, kind);
        WideTable::load(&path)
            .await?
            .with_context(|| format!("no {kind} table for {partition} at {}", path.display()))
    }
}

/// Settings of the `divergence` action
#[derive(ClapArgs, Debug)]
struct DivergenceArgs {
    #[command(flatten)]
    table: TableArgs,

    /// Earlier date
    date1: Date,

    /// Later date
    date2: Date,

    /// Only report this many top contributors
    #[arg(short = 'k', long)]
    top: Option<NonZeroUsize>,
}

/// Settings of the `sweep` action
#[derive(ClapArgs, Debug)]
struct SweepArgs {
    #[command(flatten)]
    table: TableArgs,

    /// First compared date
    begin: Date,

    /// Last compared date
    end: Date,

    /// Each date is compared with the date this many weeks earlier
    #[arg(short, long, default_value = "52")]
    weeks: NonZeroU32,

    /// Number of top contributors kept from each comparison
    #[arg(short = 'k', long, default_value = "1000")]
    top: NonZeroUsize,
}

/// Settings of the `filter` action
#[derive(ClapArgs, Debug)]
struct FilterArgs {
    /// Active filter
    #[arg(short, long, value_enum, default_value_t = FilterMode::LatinNoDigits)]
    mode: FilterMode,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    setup_logging().map_err(|e| anyhow::format_err!("{e}"))?;

    // Decode CLI arguments and dispatch
    match Args::parse().command {
        Command::Sync(args) => run_sync(args).await,
        Command::Divergence(args) => run_divergence(args).await,
        Command::Sweep(args) => run_sweep(args).await,
        Command::Filter(args) => run_filter(args).await,
    }
}

/// Synchronize every partition that has candidate n-grams
async fn run_sync(args: SyncArgs) -> Result<()> {
    let mut registry = languages::load(&args.languages).await?;
    if !args.only.is_empty() {
        registry = (args.only.iter())
            .map(|code| languages::get(&registry, code).cloned())
            .collect::<Result<_>>()?;
    }
    let filter = (!args.no_filter).then_some(args.filter);
    let jobs = targets::plan(&args.targets, &registry, &args.sizes, filter).await?;
    let source = Arc::new(HttpSource::new(Connection::from_args(&args)));
    let config = SyncConfig::new(args);

    let report = ProgressReport::new();
    let summary = sync::sync_all(config, source, jobs, &report).await?;

    let mut stdout = BufWriter::new(tokio::io::stdout());
    stdout.write_all(summary.to_string().as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Compare two dates of one table
async fn run_divergence(args: DivergenceArgs) -> Result<()> {
    let table = args.table.load().await?;
    let divergence = divergence::compare_dates(
        &table,
        args.date1,
        args.date2,
        args.table.statistic,
        args.table.alpha,
    )?;
    let shown = match args.top {
        Some(k) => divergence.top(k.get()),
        None => divergence.contributions(),
    };
    log::info!(
        "Divergence between {} and {} is {} over {} n-grams",
        args.date1,
        args.date2,
        divergence.total(),
        divergence.contributions().len()
    );
    for contribution in shown {
        log::debug!(
            "{:?} moved from rank {} to rank {}",
            contribution.ngram,
            contribution.rank1,
            contribution.rank2
        );
    }
    write_scores(
        shown
            .iter()
            .map(|contribution| (&*contribution.ngram, contribution.divergence)),
    )
    .await
}

/// Accumulate top contributors over a date range
async fn run_sweep(args: SweepArgs) -> Result<()> {
    anyhow::ensure!(args.begin <= args.end, "sweep range ends before it begins");
    let table = args.table.load().await?;
    let report = ProgressReport::new();
    let sums = divergence::sweep(
        &table,
        divergence::SweepSettings {
            begin: args.begin,
            end: args.end,
            offset: chrono::Days::new(7 * u64::from(args.weeks.get())),
            top: args.top.get(),
            statistic: args.table.statistic,
            alpha: args.table.alpha,
        },
        &report,
    )?;
    write_scores(sums.iter().map(|(ngram, sum)| (&**ngram, *sum))).await
}

/// Filter stdin into stdout
async fn run_filter(args: FilterArgs) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut candidates = Vec::new();
    while let Some(line) = lines.next_line().await.context("reading candidates")? {
        candidates.push(Ngram::from(line));
    }
    let mut stdout = BufWriter::new(tokio::io::stdout());
    for ngram in filter::filter(args.mode, candidates) {
        stdout.write_all(ngram.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Print (n-gram, score) rows as TSV on stdout
async fn write_scores<'a>(scores: impl Iterator<Item = (&'a str, f64)>) -> Result<()> {
    let mut stdout = BufWriter::new(tokio::io::stdout());
    stdout.write_all(b"ngram\tdivergence\n").await?;
    for (ngram, score) in scores {
        stdout
            .write_all(format!("{ngram}\t{score}\n").as_bytes())
            .await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Case-sensitive n-gram
pub type Ngram = Box<str>;

/// Calendar day at which statistics are recorded
pub type Date = chrono::NaiveDate;

/// Number of words in an n-gram
pub fn arity(ngram: &str) -> usize {
    ngram.split_whitespace().count()
}

/// Scope under which statistics are independently tracked and persisted
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Partition {
    /// Short language code, as used by the remote store
    pub language: Box<str>,

    /// Number of words per n-gram
    pub ngram_size: NonZeroUsize,
}
//
impl Partition {
    /// Designate a partition
    pub fn new(language: impl Into<Box<str>>, ngram_size: NonZeroUsize) -> Self {
        Self {
            language: language.into(),
            ngram_size,
        }
    }

    /// Directory holding this partition's tables below some root
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&*self.language)
            .join(format!("{}grams", self.ngram_size))
    }
}
//
impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}grams", self.language, self.ngram_size)
    }
}

/// Set up logging
fn setup_logging() -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_layout() {
        let partition = Partition::new("en", NonZeroUsize::new(2).unwrap());
        assert_eq!(partition.to_string(), "en/2grams");
        assert_eq!(
            partition.dir(Path::new("/data")),
            Path::new("/data/en/2grams")
        );
    }

    #[test]
    fn arity_counts_words() {
        assert_eq!(arity("social distancing"), 2);
        assert_eq!(arity(" virus "), 1);
        assert_eq!(arity(""), 0);
    }
}
