//! Rejection of candidate n-grams that are unsuitable for analysis
//!
//! Candidates go through this filter before being synchronized. A candidate
//! is kept if and only if none of its whitespace-separated words matches the
//! disallow predicate of the active filter mode.

use crate::Ngram;
use clap::ValueEnum;
use regex::Regex;
use std::{fmt, sync::LazyLock};

/// Filtering policy
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ValueEnum)]
pub enum FilterMode {
    /// Every word must contain a Latin letter or a digit
    Latin,

    /// Every word must contain a Latin letter or a digit, and no word may
    /// contain a digit
    LatinNoDigits,

    /// Words must not be social media markup or links, and must not be made
    /// only of punctuation, accents, invisible characters or symbols
    International,
}

/// Reasons why a candidate n-gram could be rejected
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectCause {
    /// N-gram has no words
    Empty,

    /// N-gram contains a hashtag
    Hashtag,

    /// A word is a user mention
    Mention,

    /// A word has neither Latin letters nor digits
    NonLatin,

    /// A word contains a digit
    Digit,

    /// A word marks resent content
    ResendMarker,

    /// A word is an HTML entity
    HtmlEntity,

    /// A word is a link
    Url,

    /// A word only contains punctuation
    Punctuation,

    /// A word only contains combining accents
    Accents,

    /// A word only contains control or other invisible characters
    Control,

    /// A word only contains symbols, possibly with modifying marks such as
    /// emoji presentation selectors
    Symbols,
}
//
impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "it has no words",
            Self::Hashtag => "it contains a hashtag",
            Self::Mention => "it mentions a user",
            Self::NonLatin => "a word has no Latin letter or digit",
            Self::Digit => "it contains a digit",
            Self::ResendMarker => "it contains a resend marker",
            Self::HtmlEntity => "it contains an HTML entity",
            Self::Url => "it contains a link",
            Self::Punctuation => "a word is only punctuation",
            Self::Accents => "a word is only combining accents",
            Self::Control => "a word is only control characters",
            Self::Symbols => "a word is only symbols",
        })
    }
}

/// Build a lazily compiled regex
macro_rules! pattern {
    ($name:ident, $regex:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($regex).expect("filter patterns should be valid regexes"));
    };
}
pattern!(LATIN_OR_DIGIT, r"[A-Za-z0-9]");
pattern!(DIGIT, r"[0-9]");
pattern!(RESEND_MARKER, r"^(?:RT|rt):?$");
pattern!(HTML_ENTITY, r"^&(?:[A-Za-z][A-Za-z0-9]*|#[0-9]+|#[xX][0-9A-Fa-f]+);?$");
pattern!(URL, r"(?i)^(?:[a-z][a-z0-9+.\-]*://|www\.)");
pattern!(PUNCTUATION, r"^\p{P}+$");
pattern!(ACCENTS, r"^\p{M}+$");
pattern!(CONTROL, r"^\p{C}+$");
pattern!(SYMBOLS, r"^\p{S}[\p{S}\p{M}\p{Cf}]*$");

/// Determine why a candidate n-gram should be rejected, if it should
pub fn rejection(mode: FilterMode, ngram: &str) -> Option<RejectCause> {
    if ngram.contains('#') {
        return Some(RejectCause::Hashtag);
    }
    let mut words = ngram.split_whitespace().peekable();
    if words.peek().is_none() {
        return Some(RejectCause::Empty);
    }
    words.find_map(|word| word_rejection(mode, word))
}

/// Apply the disallow predicate of a filter mode to a single word
fn word_rejection(mode: FilterMode, word: &str) -> Option<RejectCause> {
    if word.starts_with('@') {
        return Some(RejectCause::Mention);
    }
    match mode {
        FilterMode::Latin | FilterMode::LatinNoDigits => {
            if !LATIN_OR_DIGIT.is_match(word) {
                Some(RejectCause::NonLatin)
            } else if mode == FilterMode::LatinNoDigits && DIGIT.is_match(word) {
                Some(RejectCause::Digit)
            } else {
                None
            }
        }
        FilterMode::International => [
            (&RESEND_MARKER, RejectCause::ResendMarker),
            (&HTML_ENTITY, RejectCause::HtmlEntity),
            (&URL, RejectCause::Url),
            (&PUNCTUATION, RejectCause::Punctuation),
            (&ACCENTS, RejectCause::Accents),
            (&CONTROL, RejectCause::Control),
            (&SYMBOLS, RejectCause::Symbols),
        ]
        .into_iter()
        .find_map(|(pattern, cause)| pattern.is_match(word).then_some(cause)),
    }
}

/// Keep the candidate n-grams that the filter mode accepts, in order
pub fn filter(mode: FilterMode, candidates: impl IntoIterator<Item = Ngram>) -> Vec<Ngram> {
    candidates
        .into_iter()
        .filter(|ngram| match rejection(mode, ngram) {
            Some(cause) => {
                log::trace!("Rejected {ngram:?} because {cause}");
                false
            }
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(list: &[&str]) -> Vec<Ngram> {
        list.iter().map(|&ngram| ngram.into()).collect()
    }

    #[test]
    fn latin_without_digits() {
        let kept = filter(
            FilterMode::LatinNoDigits,
            candidates(&["hello world", "@user mention", "COVID19", "5g conspiracy", "日本語"]),
        );
        assert_eq!(kept, candidates(&["hello world"]));
    }

    #[test]
    fn latin_allows_digits() {
        let kept = filter(
            FilterMode::Latin,
            candidates(&["COVID19", "5g conspiracy", "日本語", "café au lait", "#covid", "a …"]),
        );
        assert_eq!(kept, candidates(&["COVID19", "5g conspiracy", "café au lait"]));
    }

    #[test]
    fn international_rejections() {
        let cases = [
            ("日本語", None),
            ("coronavírus", None),
            ("COVID19", None),
            ("#stayhome", Some(RejectCause::Hashtag)),
            ("thanks @who", Some(RejectCause::Mention)),
            ("RT news", Some(RejectCause::ResendMarker)),
            ("rock &amp;", Some(RejectCause::HtmlEntity)),
            ("see https://t.co/abc", Some(RejectCause::Url)),
            ("www.example.org", Some(RejectCause::Url)),
            ("wow !!!", Some(RejectCause::Punctuation)),
            ("\u{301}\u{302}", Some(RejectCause::Accents)),
            ("€ ❤️", Some(RejectCause::Symbols)),
            ("love ❤️", Some(RejectCause::Symbols)),
            ("👍🏽", Some(RejectCause::Symbols)),
            ("👨\u{200d}👩\u{200d}👧", Some(RejectCause::Symbols)),
            ("e\u{301}", None),
            ("\u{200b}", Some(RejectCause::Control)),
            ("   ", Some(RejectCause::Empty)),
        ];
        for (ngram, expected) in cases {
            assert_eq!(
                rejection(FilterMode::International, ngram),
                expected,
                "unexpected verdict for {ngram:?}"
            );
        }
    }

    #[test]
    fn filtering_preserves_order() {
        let input = candidates(&["zebra", "!!", "apple", "mango"]);
        let kept = filter(FilterMode::International, input);
        assert_eq!(kept, candidates(&["zebra", "apple", "mango"]));
    }
}
