//! Subscription filters: validation, canonical encoding, and matching.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{error::RelayError, event::Event};

/// Longest accepted entry in `ids` or `authors`.
pub const MAX_PREFIX_LEN: usize = 64;

/// Nostr filter. Every present field must match (AND); values within a field
/// are alternatives (OR).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event id prefixes.
    pub ids: Option<Vec<String>>,
    /// Author pubkey prefixes.
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// `#<letter>` constraints keyed by the tag letter.
    pub tags: BTreeMap<char, Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events to replay.
    pub limit: Option<usize>,
}

impl Filter {
    /// Validate a filter object field by field. Unrecognized keys are rejected.
    pub fn from_value(val: &Value) -> Result<Self, RelayError> {
        let obj = val
            .as_object()
            .ok_or_else(|| RelayError::bad_message("filter must be an object"))?;
        let mut filter = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(prefixes(key, value)?),
                "authors" => filter.authors = Some(prefixes(key, value)?),
                "kinds" => filter.kinds = Some(kinds(value)?),
                "since" => filter.since = Some(timestamp(key, value)?),
                "until" => filter.until = Some(timestamp(key, value)?),
                "limit" => {
                    let limit = timestamp(key, value)?;
                    filter.limit = Some(usize::try_from(limit).unwrap_or(usize::MAX));
                }
                _ => {
                    let letter = tag_letter(key).ok_or_else(|| {
                        RelayError::bad_message(format!("unrecognized filter field: {key}"))
                    })?;
                    filter.tags.insert(letter, strings(key, value)?);
                }
            }
        }
        Ok(filter)
    }

    /// Canonical JSON form; the inverse of [`Filter::from_value`].
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), Value::from(ids.clone()));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), Value::from(authors.clone()));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), Value::from(kinds.clone()));
        }
        for (letter, values) in &self.tags {
            obj.insert(format!("#{letter}"), Value::from(values.clone()));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), (limit as u64).into());
        }
        Value::Object(obj)
    }

    /// Whether `ev` satisfies every present constraint.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| ev.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| ev.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|s| ev.created_at < s) {
            return false;
        }
        if self.until.is_some_and(|u| ev.created_at > u) {
            return false;
        }
        self.tags.iter().all(|(letter, values)| {
            let name = letter.to_string();
            let found = ev
                .tag_values(&name)
                .any(|v| values.iter().any(|want| want == v));
            found
        })
    }
}

/// OR across filters; an empty list matches everything.
pub fn matches_any(filters: &[Filter], ev: &Event) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(ev))
}

fn tag_letter(key: &str) -> Option<char> {
    let mut chars = key.strip_prefix('#')?.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c),
        _ => None,
    }
}

fn strings(key: &str, value: &Value) -> Result<Vec<String>, RelayError> {
    let err = || RelayError::bad_message(format!("{key} must be an array of strings"));
    value
        .as_array()
        .ok_or_else(err)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(err))
        .collect()
}

fn prefixes(key: &str, value: &Value) -> Result<Vec<String>, RelayError> {
    let values = strings(key, value)?;
    if values.iter().any(|v| v.len() > MAX_PREFIX_LEN) {
        return Err(RelayError::bad_message(format!(
            "{key} entries must be at most {MAX_PREFIX_LEN} characters"
        )));
    }
    Ok(values)
}

fn kinds(value: &Value) -> Result<Vec<u32>, RelayError> {
    let err = || RelayError::bad_message("kinds must be an array of non-negative integers");
    value
        .as_array()
        .ok_or_else(err)?
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|k| u32::try_from(k).ok())
                .ok_or_else(err)
        })
        .collect()
}

fn timestamp(key: &str, value: &Value) -> Result<u64, RelayError> {
    value
        .as_u64()
        .ok_or_else(|| RelayError::bad_message(format!("{key} must be a non-negative integer")))
}
