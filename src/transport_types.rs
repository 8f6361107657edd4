// Transport-mode discovery from the dataset page.
//
// The page describes each mode in free text, e.g. "3 (Metropolitan Tram)" or
// "4 Myki Bus (Metro Bus and Regional Town Bus)". The number is the top-level folder of the
// outer archive; the label becomes the collection prefix.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{IngestError, Result};

/// Rewrites any label containing `needle` (case-insensitive) to `canonical`.
///
/// Upstream formats the same mode differently across page revisions, so these corrections are
/// configuration rather than code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRule {
    pub needle: String,
    pub canonical: String,
}

impl LabelRule {
    pub fn new(needle: &str, canonical: &str) -> Self {
        LabelRule {
            needle: needle.to_lowercase(),
            canonical: canonical.to_string(),
        }
    }

    /// Parse `needle=>Canonical;needle=>Canonical`.
    pub fn parse_list(raw: &str) -> Result<Vec<LabelRule>> {
        raw.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (needle, canonical) = entry.split_once("=>").ok_or_else(|| {
                    IngestError::Config(format!("Label rule '{entry}' is not 'needle=>Canonical'"))
                })?;
                let (needle, canonical) = (needle.trim(), canonical.trim());
                if needle.is_empty() || canonical.is_empty() {
                    return Err(IngestError::Config(format!(
                        "Label rule '{entry}' has an empty side"
                    )));
                }
                Ok(LabelRule::new(needle, canonical))
            })
            .collect()
    }

    fn matches(&self, label: &str) -> bool {
        label.to_lowercase().contains(&self.needle)
    }
}

/// The built-in correction for the bus label irregularity.
pub fn default_label_rules() -> Vec<LabelRule> {
    vec![LabelRule::new("metro bus", "Metro Bus")]
}

/// Mode id (archive folder number) to canonical mode name. Built fresh for every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportTypeMap(BTreeMap<String, String>);

impl TransportTypeMap {
    pub fn insert(&mut self, mode_id: impl Into<String>, name: impl Into<String>) {
        self.0.insert(mode_id.into(), name.into());
    }

    pub fn get(&self, mode_id: &str) -> Option<&str> {
        self.0.get(mode_id).map(String::as_str)
    }

    pub fn contains(&self, mode_id: &str) -> bool {
        self.0.contains_key(mode_id)
    }

    pub fn mode_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TransportTypeMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = TransportTypeMap::default();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

fn leading_number() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*(\d+)\s*(.*)$").ok()).as_ref()
}

fn parenthesised() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]+)\)").ok()).as_ref()
}

/// Extract `(number, label)` from one text block.
///
/// A parenthesised group wins over the bare words after the number.
pub fn parse_transport_label(text: &str, rules: &[LabelRule]) -> Option<(String, String)> {
    let captures = leading_number()?.captures(text)?;
    let number = captures.get(1)?.as_str().to_string();
    let rest = captures.get(2).map(|m| m.as_str()).unwrap_or_default();

    let label = match parenthesised()?.captures(rest) {
        Some(group) => group.get(1)?.as_str(),
        None => rest,
    };
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
    if label.is_empty() {
        return None;
    }

    let label = rules
        .iter()
        .find(|rule| rule.matches(&label))
        .map(|rule| rule.canonical.clone())
        .unwrap_or(label);

    Some((number, label))
}

/// Scan every paragraph and list item of the page for mode descriptions that mention one of
/// the filter keywords.
pub fn parse_transport_types(
    html: &str,
    filter: &[String],
    rules: &[LabelRule],
) -> TransportTypeMap {
    let document = Html::parse_document(html);
    let Ok(blocks) = Selector::parse("p, li") else {
        return TransportTypeMap::default();
    };

    let mut map = TransportTypeMap::default();
    for block in document.select(&blocks) {
        let text = block.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

        if !filter.iter().any(|keyword| text.contains(keyword.as_str())) {
            continue;
        }

        if let Some((number, label)) = parse_transport_label(&text, rules) {
            debug!(mode_id = %number, mode = %label, "Matched transport type");
            map.insert(number, label);
        }
    }

    info!(modes = ?map, "Resolved transport types");
    map
}
