//! Name matching between local files and library items.
//!
//! Tiers, first decisive tier wins:
//! 1. exact case-insensitive match of the entry name against `fs_name`
//! 2. normalized match against the item name or the `fs_name` stem
//! 3. normalized match after stripping `(...)` and `[...]` tags
//!
//! A tier with more than one distinct item is ambiguous and stops the search.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::LibraryItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(String),
    Ambiguous(Vec<String>),
    Unmatched,
}

/// Lowercase and keep only alphanumerics: "Sonic the Hedgehog 2!" -> "sonicthehedgehog2".
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Remove bracketed and parenthesized tags: "Sonic 2 (USA) [!]" -> "Sonic 2  ".
pub fn strip_tags(name: &str) -> String {
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    match TAGS.get_or_init(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").ok()) {
        Some(re) => re.replace_all(name, "").into_owned(),
        None => name.to_string(),
    }
}

fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

/// Lookup tables for one platform's library items.
#[derive(Debug, Default)]
pub struct LibraryIndex {
    exact: HashMap<String, BTreeSet<String>>,
    normalized: HashMap<String, BTreeSet<String>>,
    stripped: HashMap<String, BTreeSet<String>>,
}

impl LibraryIndex {
    pub fn new(items: &[LibraryItem]) -> Self {
        let mut index = Self::default();
        for item in items {
            let mut names = vec![item.name.as_str()];
            if let Some(fs_name) = item.fs_name.as_deref() {
                index
                    .exact
                    .entry(fs_name.to_lowercase())
                    .or_default()
                    .insert(item.item_id.clone());
                names.push(file_stem(fs_name));
            }
            for name in names {
                insert_key(&mut index.normalized, normalize(name), &item.item_id);
                insert_key(&mut index.stripped, normalize(&strip_tags(name)), &item.item_id);
            }
        }
        index
    }

    /// Match a directory entry. Files are compared by stem, directories by full name.
    pub fn match_entry(&self, entry_name: &str, is_dir: bool) -> MatchOutcome {
        if let Some(outcome) = decide(self.exact.get(&entry_name.to_lowercase())) {
            return outcome;
        }

        let candidate = if is_dir {
            entry_name
        } else {
            file_stem(entry_name)
        };
        if let Some(outcome) = decide(self.normalized.get(&normalize(candidate))) {
            return outcome;
        }
        if let Some(outcome) = decide(self.stripped.get(&normalize(&strip_tags(candidate)))) {
            return outcome;
        }
        MatchOutcome::Unmatched
    }
}

fn insert_key(map: &mut HashMap<String, BTreeSet<String>>, key: String, item_id: &str) {
    if !key.is_empty() {
        map.entry(key).or_default().insert(item_id.to_string());
    }
}

fn decide(ids: Option<&BTreeSet<String>>) -> Option<MatchOutcome> {
    let ids = ids?;
    match ids.len() {
        0 => None,
        1 => ids.iter().next().cloned().map(MatchOutcome::Matched),
        _ => Some(MatchOutcome::Ambiguous(ids.iter().cloned().collect())),
    }
}
