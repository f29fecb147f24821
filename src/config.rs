//! Synchronization configuration

use crate::{
    stats::{ResendSelection, StatisticKind},
    sync::BatchStrategy,
    table, Date, Partition, SyncArgs,
};
use std::{
    fmt,
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

/// Number of past days that are fetched again when a table already exists
pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;

/// Final synchronization configuration
///
/// This is the result of digesting [`SyncArgs`]. Please refer to them to know
/// more about individual fields.
#[allow(missing_docs)]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SyncConfig {
    /// Root of the persisted tables
    pub data_dir: PathBuf,

    /// Day from which new tables are filled
    pub history_floor: Date,

    /// Day at which the synchronization is performed
    pub today: Date,

    // Other fields have the same meaning as in SyncArgs
    pub lookback_days: u32,
    pub batch: BatchStrategy,
    pub resends: ResendSelection,
    pub case_insensitive: bool,
    pub workers: NonZeroUsize,
    pub timeout: Duration,
}
//
impl SyncConfig {
    /// Determine synchronization configuration from CLI arguments
    pub(crate) fn new(args: SyncArgs) -> Arc<Self> {
        let SyncArgs {
            languages: _,
            only: _,
            targets: _,
            data_dir,
            sizes: _,
            resends,
            since,
            lookback_days,
            batch,
            case_insensitive,
            filter: _,
            no_filter: _,
            workers,
            timeout,
            source_url: _,
            source_user: _,
            source_password: _,
        } = args;
        Arc::new(Self {
            data_dir,
            history_floor: since,
            today: chrono::Local::now().date_naive(),
            lookback_days,
            batch,
            resends,
            case_insensitive,
            workers,
            timeout: Duration::from_secs(timeout.get().into()),
        })
    }

    /// Statistic kinds which are persisted
    pub fn persisted_kinds(&self) -> impl Iterator<Item = StatisticKind> {
        self.resends.kinds()
    }

    /// Directory holding a partition's tables
    pub fn partition_dir(&self, partition: &Partition) -> PathBuf {
        partition.dir(&self.data_dir)
    }

    /// Location of a partition's table for some statistic
    pub fn table_path(&self, partition: &Partition, kind: StatisticKind) -> PathBuf {
        table::path(&self.data_dir, partition, kind)
    }

    /// Day from which existing tables are refreshed
    pub fn incremental_start(&self) -> Date {
        let start = self
            .today
            .checked_sub_days(chrono::Days::new(self.lookback_days.into()))
            .unwrap_or(self.history_floor);
        start.max(self.history_floor)
    }
}

/// Where the remote store is and how to authenticate to it
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Connection {
    /// Base URL
    pub endpoint: Box<str>,

    /// User name, if authentication is needed
    pub user: Option<Box<str>>,

    /// Password, if authentication is needed
    pub password: Option<Box<str>>,
}
//
impl Connection {
    /// Extract the connection descriptor from CLI arguments
    pub(crate) fn from_args(args: &SyncArgs) -> Self {
        Self {
            endpoint: args.source_url.clone(),
            user: args.source_user.clone(),
            password: args.source_password.clone(),
        }
    }
}
//
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    /// Configuration used by tests, synchronizing on 2020-01-10 with a floor
    /// on 2020-01-01
    pub fn test_config(data_dir: &Path) -> SyncConfig {
        SyncConfig {
            data_dir: data_dir.into(),
            history_floor: "2020-01-01".parse().unwrap(),
            today: "2020-01-10".parse().unwrap(),
            lookback_days: 2,
            batch: BatchStrategy::Batched,
            resends: ResendSelection::Both,
            case_insensitive: false,
            workers: NonZeroUsize::new(2).unwrap(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn incremental_start_respects_floor() {
        let mut config = test_config(Path::new("/data"));
        assert_eq!(config.incremental_start(), "2020-01-08".parse::<Date>().unwrap());
        config.lookback_days = 30;
        assert_eq!(config.incremental_start(), config.history_floor);
    }

    #[test]
    fn connection_hides_password() {
        let connection = Connection {
            endpoint: "https://example.org".into(),
            user: Some("guest".into()),
            password: Some("hunter2".into()),
        };
        let debug = format!("{connection:?}");
        assert!(debug.contains("guest"));
        assert!(!debug.contains("hunter2"));
    }
}
