//! Local-part shape analysis: entropy, recognizable business
//! patterns, and cross-batch anomaly detection.

use crate::email::EmailAddress;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Ordered from most to least specific; the first match names the
/// pattern a local part follows.
static BUSINESS_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("firstname.lastname", r"^[a-z]{2,}\.[a-z]{2,}$"),
        ("f.lastname", r"^[a-z]\.[a-z]{2,}$"),
        ("firstname_lastname", r"^[a-z]{2,}_[a-z]{2,}$"),
        ("firstname-lastname", r"^[a-z]{2,}-[a-z]{2,}$"),
        ("flastname", r"^[a-z]\.[a-z]{2,}[0-9]{0,3}$"),
        ("firstnameNNN", r"^[a-z]{2,}[0-9]{1,4}$"),
        ("firstname", r"^[a-z]{2,24}$"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("pattern compiles")))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternFlag {
    AutoGenerated,
    UnusuallyShort,
    MostlyNumeric,
}

impl PatternFlag {
    pub fn note(&self) -> &'static str {
        match self {
            Self::AutoGenerated => "Local part looks auto-generated",
            Self::UnusuallyShort => "Local part is unusually short",
            Self::MostlyNumeric => "Local part is mostly numeric",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalAnalysis {
    pub entropy: f64,
    pub digit_ratio: f64,
    pub matched_pattern: Option<&'static str>,
    pub looks_human: bool,
    pub flags: Vec<PatternFlag>,
}

/// Shannon entropy in bits per character.
pub fn shannon_entropy(text: &str) -> f64 {
    let len = text.chars().count();
    if len == 0 {
        return 0.0;
    }

    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }

    let len = len as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

pub fn analyze_local(local: &str) -> LocalAnalysis {
    let len = local.chars().count();
    let entropy = shannon_entropy(local);
    let digits = local.chars().filter(|c| c.is_ascii_digit()).count();
    let digit_ratio = if len == 0 {
        0.0
    } else {
        digits as f64 / len as f64
    };

    let matched_pattern = BUSINESS_PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(local))
        .map(|(name, _)| *name);

    let mut flags = vec![];
    if entropy > 3.5 && len > 10 {
        flags.push(PatternFlag::AutoGenerated);
    }
    if len <= 2 {
        flags.push(PatternFlag::UnusuallyShort);
    }
    if digit_ratio > 0.5 && len > 5 {
        flags.push(PatternFlag::MostlyNumeric);
    }

    let looks_human = matched_pattern.is_some()
        || (entropy < 3.5 && (3..=30).contains(&len) && digit_ratio < 0.4);

    LocalAnalysis {
        entropy,
        digit_ratio,
        matched_pattern,
        looks_human,
        flags,
    }
}

/// For each domain with at least three addresses in the batch, find
/// the dominant naming pattern; when at least half the locals follow
/// it (and at least three do), every local that does not follow it is
/// flagged. Returns indexes into `emails`.
pub fn bulk_anomalies(emails: &[Option<EmailAddress>]) -> HashSet<usize> {
    let mut by_domain: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, email) in emails.iter().enumerate() {
        if let Some(email) = email {
            by_domain.entry(&email.domain).or_default().push(index);
        }
    }

    let mut anomalous = HashSet::new();

    for indexes in by_domain.values() {
        if indexes.len() < 3 {
            continue;
        }

        let matched: Vec<Option<&'static str>> = indexes
            .iter()
            .map(|&index| {
                emails[index]
                    .as_ref()
                    .and_then(|email| analyze_local(&email.local).matched_pattern)
            })
            .collect();

        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for pattern in matched.iter().flatten() {
            *counts.entry(pattern).or_insert(0) += 1;
        }

        let Some((&dominant, &count)) = counts.iter().max_by_key(|(_, &count)| count) else {
            continue;
        };

        if count < 3 || count * 2 < indexes.len() {
            continue;
        }

        for (position, &index) in indexes.iter().enumerate() {
            if matched[position] != Some(dominant) {
                anomalous.insert(index);
            }
        }
    }

    anomalous
}
