use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::rules::NoMatchPolicy;

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

/// Stripped before digit extraction. `$` is left in so a price next to a
/// number stays a separate run.
const PUNCTUATION: &str = "!\"#%&'()*+,-./:;<=>?@[\\]^_`{|}~";

const NUMBER_WORDS: [(&str, &str); 10] = [
    ("zero", "0"),
    ("one", "1"),
    ("two", "2"),
    ("three", "3"),
    ("four", "4"),
    ("five", "5"),
    ("six", "6"),
    ("seven", "7"),
    ("eight", "8"),
    ("nine", "9"),
];

const MIN_LEN: usize = 7;
const MAX_LEN: usize = 11;

/// Deduplicated digit strings that look like phone numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhoneCandidates(BTreeSet<String>);

impl PhoneCandidates {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn contains(&self, phone: &str) -> bool {
        self.0.contains(phone)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// `;`-joined column value.
    pub fn to_field(&self, policy: NoMatchPolicy) -> String {
        if self.is_empty() {
            policy.placeholder().to_string()
        } else {
            self.iter().collect::<Vec<_>>().join(";")
        }
    }
}

/// Find phone-number candidates in free text.
///
/// Number words are replaced as plain substrings ("phone" becomes "ph1"),
/// and the stripped text has no spaces left, so digits spelled out one by one
/// join into a single run.
pub fn extract(text: &str) -> PhoneCandidates {
    let mut post: String = text
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !PUNCTUATION.contains(*c) && !c.is_whitespace())
        .collect();

    for (word, digit) in NUMBER_WORDS {
        if post.contains(word) {
            post = post.replace(word, digit);
        }
    }

    let phones = DIGITS_RE
        .find_iter(&post)
        .map(|m| m.as_str())
        .filter(|run| (MIN_LEN..=MAX_LEN).contains(&run.len()))
        .map(str::to_string)
        .collect();
    PhoneCandidates(phones)
}

/// Normalizer output as stored in the clean store.
pub fn phone_field(text: &str, policy: NoMatchPolicy) -> String {
    extract(text).to_field(policy)
}
