//! Wide statistic tables: one row per day, one column per n-gram
//!
//! Tables are stored on disk as TSV, with a `date` column followed by one
//! column per n-gram, and missing values as empty fields. They only ever grow:
//! newly fetched data is merged in by filling the gaps of the stored table,
//! never by overwriting what it already knows.

use crate::{
    stats::{DailyRecord, StatisticKind},
    Date, Ngram, Partition, Result,
};
use anyhow::Context;
use csv_async::{AsyncReaderBuilder, AsyncWriterBuilder, StringRecord};
use std::{
    collections::{btree_map, BTreeMap, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs::{self, File};
use unicase::UniCase;

/// Header of the first column of stored tables
const DATE_HEADER: &str = "date";

/// Value of one (date, n-gram) cell, `None` when unknown
pub type Cell = Option<f64>;

/// Dense date × n-gram table of one statistic
///
/// Dates are unique and sorted. Every row has one cell per column, missing
/// values are explicit nulls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WideTable {
    /// N-grams, in column order
    columns: Vec<Ngram>,

    /// Position of each n-gram in `columns`
    column_index: HashMap<Ngram, usize>,

    /// Cells of each day, in column order
    rows: BTreeMap<Date, Box<[Cell]>>,
}
//
impl WideTable {
    /// Set up an empty table with some columns
    ///
    /// Duplicate column names are only kept once.
    pub fn new(columns: impl IntoIterator<Item = Ngram>) -> Self {
        let mut table = Self::default();
        for ngram in columns {
            table.add_column(ngram);
        }
        table
    }

    /// N-grams, in column order
    pub fn columns(&self) -> &[Ngram] {
        &self.columns
    }

    /// Days covered by the table, in increasing order
    pub fn dates(&self) -> impl Iterator<Item = Date> + '_ {
        self.rows.keys().copied()
    }

    /// Number of days covered by the table
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Truth that the table has a column for this n-gram
    pub fn contains(&self, ngram: &str) -> bool {
        self.column_index.contains_key(ngram)
    }

    /// Value of a cell, if known
    pub fn get(&self, date: Date, ngram: &str) -> Cell {
        let column = *self.column_index.get(ngram)?;
        self.rows.get(&date)?[column]
    }

    /// Set the value of a cell, adding the row and column if needed
    pub fn set(&mut self, date: Date, ngram: &str, value: Cell) {
        let column = self.add_column(ngram.into());
        self.row_mut(date)[column] = value;
    }

    /// Known values of a day, if that day is covered by the table
    pub fn row(&self, date: Date) -> Option<impl Iterator<Item = (&Ngram, f64)> + '_> {
        let cells = self.rows.get(&date)?;
        Some(
            self.columns
                .iter()
                .zip(cells.iter())
                .filter_map(|(ngram, cell)| cell.map(|value| (ngram, value))),
        )
    }

    /// Add an all-null column if it does not exist yet, return its position
    fn add_column(&mut self, ngram: Ngram) -> usize {
        if let Some(&column) = self.column_index.get(&ngram) {
            return column;
        }
        let column = self.columns.len();
        self.column_index.insert(ngram.clone(), column);
        self.columns.push(ngram);
        for cells in self.rows.values_mut() {
            let mut extended = std::mem::take(cells).into_vec();
            extended.push(None);
            *cells = extended.into();
        }
        column
    }

    /// Access the cells of a row, adding an all-null row if needed
    fn row_mut(&mut self, date: Date) -> &mut [Cell] {
        let width = self.columns.len();
        self.rows
            .entry(date)
            .or_insert_with(|| vec![None; width].into())
    }

    /// Reshape long-format daily records into one table per statistic
    ///
    /// Every table has exactly the `requested` columns, even if no record
    /// mentions some of them, and one row per day of `days`, even if no
    /// record was collected on some days. Records about other n-grams are
    /// ignored, except when `fold_case` is set, in which case records whose
    /// n-gram only differs from a requested one by case are accumulated into
    /// that n-gram's column: counts and frequencies add up, and the best rank
    /// is kept.
    pub fn pivot(
        records: &[DailyRecord],
        requested: &[Ngram],
        days: (Date, Date),
        fold_case: bool,
    ) -> BTreeMap<StatisticKind, WideTable> {
        let mut template = WideTable::new(requested.iter().cloned());
        let (first_day, last_day) = days;
        for date in first_day.iter_days().take_while(|date| *date <= last_day) {
            template.row_mut(date);
        }
        let folded = fold_case.then(|| {
            (template.columns.iter().enumerate())
                .map(|(column, ngram)| (UniCase::new(&**ngram), column))
                .collect::<HashMap<_, _>>()
        });

        let mut tables = StatisticKind::ALL
            .into_iter()
            .map(|kind| (kind, template.clone()))
            .collect::<BTreeMap<_, _>>();
        for record in records {
            let column = (template.column_index.get(&record.ngram).copied()).or_else(|| {
                let folded = folded.as_ref()?;
                folded.get(&UniCase::new(&*record.ngram)).copied()
            });
            let Some(column) = column else {
                log::trace!("Ignored record {record:?} about an n-gram that wasn't requested");
                continue;
            };
            for (kind, table) in &mut tables {
                let Some(value) = kind.select(record) else {
                    continue;
                };
                let cell = &mut table.row_mut(record.date)[column];
                *cell = match (*cell, fold_case) {
                    (Some(previous), true) if kind.statistic.higher_is_better() => {
                        Some(previous + value)
                    }
                    (Some(previous), true) => Some(previous.min(value)),
                    _ => Some(value),
                };
            }
        }
        tables
    }

    /// Merge newly fetched data into this table
    ///
    /// Cells which are already known are kept as-is, even if the fetched data
    /// disagrees. Unknown cells are filled with the fetched values. Fetched
    /// rows and columns that the table does not have yet are added.
    ///
    /// Returns truth that some cell went from unknown to known. Adding rows or
    /// columns that only hold unknown values does not count as a change.
    pub fn merge(&mut self, fetched: &WideTable) -> bool {
        let mut changed = false;
        let columns = (fetched.columns.iter())
            .map(|ngram| self.add_column(ngram.clone()))
            .collect::<Vec<_>>();
        for (&date, fetched_cells) in &fetched.rows {
            let cells = self.row_mut(date);
            for (&column, &fetched_cell) in columns.iter().zip(fetched_cells.iter()) {
                let cell = &mut cells[column];
                if cell.is_none() && fetched_cell.is_some() {
                    *cell = fetched_cell;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Load a table from disk, if it exists
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let context = || format!("loading table {}", path.display());
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(context),
        };
        let mut reader = AsyncReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .create_reader(file);

        // Decode the header into table columns
        let headers = reader.headers().await.with_context(context)?.clone();
        let mut header_fields = headers.iter();
        anyhow::ensure!(
            header_fields.next() == Some(DATE_HEADER),
            "table {} does not start with a {DATE_HEADER} column",
            path.display()
        );
        let mut table = Self::new(header_fields.map(Ngram::from));
        anyhow::ensure!(
            table.columns.len() + 1 == headers.len(),
            "table {} has duplicate n-gram columns",
            path.display()
        );

        // Decode the rows
        let mut record = StringRecord::new();
        while reader.read_record(&mut record).await.with_context(context)? {
            let mut fields = record.iter();
            let date_field = fields.next().unwrap_or_default();
            let date = date_field
                .parse::<Date>()
                .with_context(|| format!("decoding date {date_field:?}"))
                .with_context(context)?;
            let cells = fields
                .map(|field| {
                    if field.is_empty() {
                        Ok(None)
                    } else {
                        field
                            .parse::<f64>()
                            .map(Some)
                            .with_context(|| format!("decoding value {field:?} on {date}"))
                    }
                })
                .collect::<Result<Box<[Cell]>>>()
                .with_context(context)?;
            match table.rows.entry(date) {
                btree_map::Entry::Vacant(v) => {
                    v.insert(cells);
                }
                btree_map::Entry::Occupied(_) => {
                    anyhow::bail!("table {} has duplicate rows for {date}", path.display())
                }
            }
        }
        Ok(Some(table))
    }

    /// Write the whole table to disk
    ///
    /// The table is first written next to its final location, then moved
    /// there, so readers never observe a partially written table.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let context = || format!("saving table {}", path.display());
        let temp_path = path.with_extension("tsv.tmp");
        let file = File::create(&temp_path).await.with_context(context)?;
        let mut writer = AsyncWriterBuilder::new()
            .delimiter(b'\t')
            .create_writer(file);
        let header = std::iter::once(DATE_HEADER)
            .chain(self.columns.iter().map(|c| &**c))
            .collect::<Vec<_>>();
        writer
            .write_record(&header)
            .await
            .with_context(context)?;
        for (date, cells) in &self.rows {
            let fields = std::iter::once(date.to_string())
                .chain(
                    cells
                        .iter()
                        .map(|cell| cell.map(|value| value.to_string()).unwrap_or_default()),
                )
                .collect::<Vec<_>>();
            writer.write_record(&fields).await.with_context(context)?;
        }
        writer.flush().await.with_context(context)?;
        drop(writer);
        fs::rename(&temp_path, path).await.with_context(context)
    }
}

/// Location of a partition's table for some statistic
pub fn path(root: &Path, partition: &Partition, kind: StatisticKind) -> PathBuf {
    partition.dir(root).join(format!("{}.tsv", kind.file_stem()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistic;

    fn day(s: &str) -> Date {
        s.parse().unwrap()
    }

    fn table(cells: &[(&str, &str, f64)]) -> WideTable {
        let mut table = WideTable::default();
        for &(date, ngram, value) in cells {
            table.set(day(date), ngram, Some(value));
        }
        table
    }

    fn record(ngram: &str, date: &str, count: f64, rank: f64) -> DailyRecord {
        DailyRecord {
            ngram: ngram.into(),
            date: day(date),
            count: Some(count),
            count_no_rt: Some(count / 2.0),
            rank: Some(rank),
            rank_no_rt: None,
            freq: None,
            freq_no_rt: None,
        }
    }

    const COUNT: StatisticKind = StatisticKind::new(Statistic::Count, true);
    const RANK: StatisticKind = StatisticKind::new(Statistic::Rank, true);

    #[test]
    fn merge_keeps_known_cells_and_fills_gaps() {
        let mut stored = table(&[("2020-01-01", "w", 5.0)]);
        let fetched = table(&[("2020-01-01", "w", 7.0), ("2020-01-02", "w", 9.0)]);
        assert!(stored.merge(&fetched));
        assert_eq!(
            stored,
            table(&[("2020-01-01", "w", 5.0), ("2020-01-02", "w", 9.0)])
        );
    }

    #[test]
    fn merge_never_clobbers() {
        let mut stored = table(&[("2020-01-01", "w", 5.0), ("2020-01-01", "x", 1.0)]);
        let before = stored.clone();
        let fetched = table(&[("2020-01-01", "w", 6.0), ("2020-01-01", "x", 2.0)]);
        assert!(!stored.merge(&fetched));
        assert_eq!(stored, before);
    }

    #[test]
    fn merge_fills_null_cells() {
        let mut stored = WideTable::new([Ngram::from("w")]);
        stored.set(day("2020-01-01"), "w", None);
        let fetched = table(&[("2020-01-01", "w", 3.0)]);
        assert!(stored.merge(&fetched));
        assert_eq!(stored.get(day("2020-01-01"), "w"), Some(3.0));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut stored = table(&[("2020-01-01", "w", 5.0)]);
        let mut fetched = table(&[("2020-01-02", "w", 9.0), ("2020-01-02", "y", 1.0)]);
        fetched.set(day("2020-01-03"), "w", None);
        assert!(stored.merge(&fetched));
        let once = stored.clone();
        assert!(!stored.merge(&fetched));
        assert_eq!(stored, once);
        assert_eq!(stored.columns(), [Ngram::from("w"), Ngram::from("y")]);
        assert_eq!(stored.get(day("2020-01-01"), "y"), None);
        assert_eq!(stored.num_rows(), 3);
    }

    #[test]
    fn merging_unknown_values_is_not_a_change() {
        let mut stored = table(&[("2020-01-01", "w", 5.0)]);
        let mut fetched = WideTable::new([Ngram::from("w"), Ngram::from("z")]);
        fetched.set(day("2020-01-02"), "w", None);
        fetched.set(day("2020-01-03"), "z", None);
        assert!(!stored.merge(&fetched));
        assert!(stored.contains("z"));
        assert_eq!(stored.num_rows(), 3);
        assert_eq!(stored.get(day("2020-01-01"), "w"), Some(5.0));
    }

    #[test]
    fn pivot_reindexes_against_requested_ngrams() {
        let requested: Vec<Ngram> = vec!["virus".into(), "quarantine".into(), "masks".into()];
        let records = [
            record("virus", "2020-03-01", 10.0, 2.0),
            record("virus", "2020-03-03", 12.0, 1.0),
            record("unrequested", "2020-03-01", 99.0, 1.0),
        ];
        let tables = WideTable::pivot(
            &records,
            &requested,
            (day("2020-03-01"), day("2020-03-03")),
            false,
        );
        assert_eq!(tables.len(), 6);
        for table in tables.values() {
            assert_eq!(table.columns(), &requested[..]);
            assert_eq!(
                table.dates().collect::<Vec<_>>(),
                [day("2020-03-01"), day("2020-03-02"), day("2020-03-03")]
            );
        }
        let counts = &tables[&COUNT];
        assert_eq!(counts.get(day("2020-03-01"), "virus"), Some(10.0));
        assert_eq!(counts.get(day("2020-03-02"), "virus"), None);
        assert_eq!(counts.get(day("2020-03-03"), "masks"), None);
        assert_eq!(tables[&RANK].get(day("2020-03-03"), "virus"), Some(1.0));
        let no_rt = StatisticKind::new(Statistic::Count, false);
        assert_eq!(tables[&no_rt].get(day("2020-03-03"), "virus"), Some(6.0));
    }

    #[test]
    fn pivot_folds_case_variants() {
        let requested: Vec<Ngram> = vec!["virus".into()];
        let records = [
            record("virus", "2020-03-01", 10.0, 5.0),
            record("Virus", "2020-03-01", 4.0, 30.0),
            record("VIRUS", "2020-03-01", 1.0, 200.0),
        ];
        let days = (day("2020-03-01"), day("2020-03-01"));
        let folded = WideTable::pivot(&records, &requested, days, true);
        assert_eq!(folded[&COUNT].get(day("2020-03-01"), "virus"), Some(15.0));
        assert_eq!(folded[&RANK].get(day("2020-03-01"), "virus"), Some(5.0));
        let exact = WideTable::pivot(&records, &requested, days, false);
        assert_eq!(exact[&COUNT].get(day("2020-03-01"), "virus"), Some(10.0));
    }

    #[test]
    fn row_lists_known_values() {
        let mut stored = table(&[("2020-01-01", "a", 1.0), ("2020-01-01", "b", 2.0)]);
        stored.set(day("2020-01-01"), "c", None);
        let row = stored
            .row(day("2020-01-01"))
            .unwrap()
            .map(|(ngram, value)| (ngram.to_string(), value))
            .collect::<Vec<_>>();
        assert_eq!(row, [("a".to_string(), 1.0), ("b".to_string(), 2.0)]);
        assert!(stored.row(day("2020-01-02")).is_none());
    }

    #[tokio::test]
    async fn disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count.tsv");
        assert_eq!(WideTable::load(&path).await.unwrap(), None);

        let mut stored = table(&[
            ("2020-01-02", "social distancing", 1.5),
            ("2020-01-01", "\"quoted\"", 3.0),
        ]);
        stored.set(day("2020-01-03"), "social distancing", None);
        stored.save(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("date\tsocial distancing\t"));
        assert_eq!(WideTable::load(&path).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn rejects_corrupt_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count.tsv");
        std::fs::write(&path, "date\tw\n2020-01-01\tfive\n").unwrap();
        assert!(WideTable::load(&path).await.is_err());
        std::fs::write(&path, "date\tw\n2020-01-01\t5\n2020-01-01\t6\n").unwrap();
        assert!(WideTable::load(&path).await.is_err());
        std::fs::write(&path, "day\tw\n2020-01-01\t5\n").unwrap();
        assert!(WideTable::load(&path).await.is_err());
    }
}
