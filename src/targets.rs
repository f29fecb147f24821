//! Candidate n-gram lists, and the synchronization jobs derived from them
//!
//! Candidates of each partition are listed in `<root>/<n>grams/<code>.tsv`,
//! one per line, below an `ngram` header.

use crate::{
    arity,
    filter::{self, FilterMode},
    languages::LanguageInfo,
    Ngram, Partition, Result,
};
use anyhow::Context;
use csv_async::AsyncReaderBuilder;
use futures::StreamExt;
use serde::Deserialize;
use std::{io::ErrorKind, num::NonZeroUsize, path::Path};
use tokio::{fs::File, io::AsyncRead};

/// Entry of a candidate list
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct Candidate {
    /// Candidate n-gram
    ngram: Ngram,
}

/// Decode a candidate list
pub async fn parse(input: impl AsyncRead + Unpin + Send) -> Result<Vec<Ngram>> {
    let mut entries = AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .has_headers(true)
        .create_deserializer(input)
        .into_deserialize::<Candidate>();
    let mut ngrams = Vec::new();
    while let Some(entry) = entries.next().await {
        ngrams.push(entry?.ngram);
    }
    Ok(ngrams)
}

/// Load the candidate list of a partition, if there is one
pub async fn load(root: &Path, partition: &Partition) -> Result<Option<Vec<Ngram>>> {
    let path = root
        .join(format!("{}grams", partition.ngram_size))
        .join(format!("{}.tsv", partition.language));
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    parse(file)
        .await
        .map(Some)
        .with_context(|| format!("loading candidates from {}", path.display()))
}

/// Turn a partition's candidates into the n-grams to be synchronized
///
/// Candidates are filtered if requested, and those whose number of words does
/// not match the partition are dropped. Duplicates are only kept once.
pub fn select(
    partition: &Partition,
    candidates: Vec<Ngram>,
    filter: Option<FilterMode>,
) -> Vec<Ngram> {
    let candidates = match filter {
        Some(mode) => filter::filter(mode, candidates),
        None => candidates,
    };
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|ngram| {
            if arity(ngram) != partition.ngram_size.get() {
                log::warn!("Ignored candidate {ngram:?} of {partition}: wrong number of words");
                return false;
            }
            seen.insert(ngram.clone())
        })
        .collect()
}

/// Plan the synchronization of every partition that has candidates
pub async fn plan(
    root: &Path,
    languages: &[LanguageInfo],
    sizes: &[NonZeroUsize],
    filter: Option<FilterMode>,
) -> Result<Vec<(Partition, Vec<Ngram>)>> {
    let mut jobs = Vec::new();
    for language in languages {
        for &size in sizes {
            let partition = Partition::new(language.code.clone(), size);
            let Some(candidates) = load(root, &partition).await? else {
                log::debug!("No candidates for {partition} ({}), skipping it", language.name);
                continue;
            };
            let ngrams = select(&partition, candidates, filter);
            if ngrams.is_empty() {
                log::info!("No candidate of {partition} survived filtering, skipping it");
                continue;
            }
            jobs.push((partition, ngrams));
        }
    }
    Ok(jobs)
}
