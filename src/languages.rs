//! Registry of the languages tracked by the remote store

use crate::Result;
use anyhow::Context;
use csv_async::AsyncReaderBuilder;
use dialoguer::FuzzySelect;
use futures::StreamExt;
use serde::Deserialize;
use std::path::Path;
use tokio::{fs::File, io::AsyncRead};

/// What we know about a language of the remote store
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub struct LanguageInfo {
    /// Short code, as used by the remote store
    pub code: Box<str>,

    /// Human-readable name
    #[serde(rename = "language")]
    pub name: Box<str>,
}

/// Load the language registry from a file
///
/// The registry is a TSV file with `code` and `language` columns. Lines
/// starting with `#` are comments.
pub async fn load(path: &Path) -> Result<Vec<LanguageInfo>> {
    let context = || format!("loading language registry {}", path.display());
    let file = File::open(path).await.with_context(context)?;
    parse(file).await.with_context(context)
}

/// Decode a language registry
pub async fn parse(input: impl AsyncRead + Unpin + Send) -> Result<Vec<LanguageInfo>> {
    let mut entries = AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .trim(csv_async::Trim::All)
        .has_headers(true)
        .create_deserializer(input)
        .into_deserialize::<LanguageInfo>();
    let mut languages = Vec::new();
    while let Some(language) = entries.next().await {
        languages.push(language?);
    }
    Ok(languages)
}

/// Get information about a language
pub fn get<'registry>(
    registry: &'registry [LanguageInfo],
    code: &str,
) -> Result<&'registry LanguageInfo> {
    registry
        .iter()
        .find(|language| &*language.code == code)
        .with_context(|| format!("Failed to find user-requested language {code}"))
}

/// Ask the user to select a language
pub fn prompt(registry: &[LanguageInfo]) -> Result<LanguageInfo> {
    anyhow::ensure!(!registry.is_empty(), "the language registry is empty");
    let language_names = registry
        .iter()
        .map(|language| format!("{} ({})", language.name, language.code))
        .collect::<Vec<_>>();
    let language_idx = FuzzySelect::new()
        .with_prompt("Which language should I use?")
        .items(&language_names)
        .default(0)
        .max_length(usize::MAX)
        .interact()?;
    Ok(registry[language_idx].clone())
}
