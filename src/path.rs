//! Path helpers shared by the analysis pass and the flattening engine
//!
//! Paths are JSON-pointer-like strings (`/tender/items/0/id`). A *schema
//! path* carries no array indices, a *combined path* carries one index
//! segment after every array it crosses.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::table::Table;
use crate::types::{is_synthetic, text};

pub const SEPARATOR: char = '/';

static INDEX_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

/// True when a path segment is an array index.
pub fn is_index(segment: &str) -> bool {
    INDEX_SEGMENT.is_match(segment)
}

/// Joins a parent path and a field name.
pub fn join(path: &str, key: &str) -> String {
    format!("{}{}{}", path, SEPARATOR, key)
}

/// `path` with its array index segments removed.
pub fn schema_path(path: &str) -> String {
    path.split(SEPARATOR)
        .filter(|segment| !is_index(segment))
        .collect::<Vec<_>>()
        .join("/")
}

/// Longest run of leading segments shared by `a` and `b`.
pub fn common_prefix(a: &str, b: &str) -> String {
    let shared: Vec<&str> = a
        .split(SEPARATOR)
        .zip(b.split(SEPARATOR))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect();
    let joined = shared.join("/");
    if joined.is_empty() && a.starts_with(SEPARATOR) && b.starts_with(SEPARATOR) {
        return SEPARATOR.to_string();
    }
    joined
}

/// True when `prefix` is an ancestor of, or equal to, `path`.
pub fn is_prefix(prefix: &str, path: &str) -> bool {
    common_prefix(prefix, path) == prefix
}

/// Combined path of `path` with `index` spliced in after every array
/// registered on `root`.
pub fn combine_path(root: &Table, path: &str, index: &str) -> String {
    combine_path_from(root, "", path, index)
}

/// Like [`combine_path`], but only arrays strictly below `base` receive an
/// index segment. An empty `base` considers every array.
pub fn combine_path_from(root: &Table, base: &str, path: &str, index: &str) -> String {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    let mut combined: Vec<&str> = Vec::with_capacity(segments.len() + 2);
    let mut schema_path = String::with_capacity(path.len());

    for (i, segment) in segments.iter().enumerate() {
        combined.push(segment);
        if segment.is_empty() || is_index(segment) {
            continue;
        }
        schema_path.push(SEPARATOR);
        schema_path.push_str(segment);

        let below_base = base.is_empty() || (schema_path != base && is_prefix(base, &schema_path));
        if below_base && root.arrays.contains_key(&schema_path) {
            match segments.get(i + 1) {
                // already indexed
                Some(next) if is_index(next) => {}
                _ => combined.push(index),
            }
        }
    }
    combined.join("/")
}

/// Builds a display title from the parent's and the item's schema titles.
///
/// Words are capitalised and repeated words are dropped, keeping the first
/// occurrence: parent `"Tender"` and item `"Tender ID"` give `"Tender Id"`.
pub fn prepare_title(item: &Value, parent: &Value) -> String {
    let parent_title = parent.get("title").and_then(Value::as_str).unwrap_or("");
    let item_title = item.get("title").and_then(Value::as_str).unwrap_or("");

    let mut words: Vec<String> = Vec::new();
    for chunk in parent_title.split_whitespace().chain(item_title.split_whitespace()) {
        let word = capitalize(chunk);
        if !words.contains(&word) {
            words.push(word);
        }
    }
    words.join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Keys of every table with a path that is a prefix of `path`, the most
/// specific match first. Ties keep the iteration order of `tables`.
pub fn get_matching_tables<'t, K>(
    tables: impl IntoIterator<Item = (K, &'t Table)>,
    path: &str,
) -> Vec<K> {
    let mut candidates: Vec<(usize, K)> = tables
        .into_iter()
        .filter_map(|(key, table)| table.matched_path(path).map(|matched| (matched.len(), key)))
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().map(|(_, key)| key).collect()
}

/// Short name for a child table, safe for file and sheet names.
pub fn generate_table_name(parent_name: &str, parent_key: &str, key: &str) -> String {
    let key: String = key.chars().take(5).collect();
    if parent_name.contains(parent_key) {
        format!("{}_{}", parent_name, key)
    } else {
        let parent_key: String = parent_key.chars().take(5).collect();
        format!("{}_{}_{}", parent_name, parent_key, key)
    }
}

/// Row identifier `ocid[/top_level_id]/[parent_key:]item_id`.
pub fn generate_row_id(ocid: &str, item_id: &str, parent_key: &str, top_level_id: &str) -> String {
    let tail = if parent_key.is_empty() {
        item_id.to_string()
    } else {
        format!("{}:{}", parent_key, item_id)
    };
    if top_level_id.is_empty() {
        format!("{}/{}", ocid, tail)
    } else {
        format!("{}/{}/{}", ocid, top_level_id, tail)
    }
}

/// Identifier of the object a row starts at: its `id` field, else its
/// position (the last segment of `abs`).
pub fn item_id(object: &Value, abs: &str) -> String {
    object
        .get("id")
        .and_then(text)
        .unwrap_or_else(|| abs.rsplit(SEPARATOR).next().unwrap_or_default().to_string())
}

/// Widens `table.combined_columns` for an array at `abs_path/key` holding
/// `len` elements.
///
/// Every combined column under the array's zero index gets variants for
/// indices `1..len`, placed right after the zero-index column. Returns
/// whether any column was added.
pub fn recalculate_headers(table: &mut Table, abs_path: &str, key: &str, len: usize) -> bool {
    if len < 2 {
        return false;
    }
    let base = join(abs_path, key);
    let zero = join(&base, "0");
    let reindex = |path: &str, i: usize| format!("{}/{}{}", base, i, &path[zero.len()..]);

    let missing = table
        .combined_columns
        .keys()
        .filter(|path| !is_synthetic(path) && is_prefix(&zero, path))
        .any(|path| (1..len).any(|i| !table.combined_columns.contains_key(&reindex(path.as_str(), i))));
    if !missing {
        return false;
    }

    let previous = std::mem::take(&mut table.combined_columns);
    let mut widened = IndexMap::with_capacity(previous.len());
    for (path, column) in previous.iter() {
        if widened.contains_key(path) {
            continue;
        }
        widened.insert(path.clone(), column.clone());
        if is_synthetic(path) || !is_prefix(&zero, path) {
            continue;
        }
        for i in 1..len {
            let new_path = reindex(path.as_str(), i);
            if widened.contains_key(&new_path) {
                continue;
            }
            let column = previous
                .get(&new_path)
                .cloned()
                .unwrap_or_else(|| column.with_id(new_path.clone()));
            table
                .titles
                .entry(new_path.clone())
                .or_insert_with(|| column.title.clone());
            widened.insert(new_path, column);
        }
    }
    table.combined_columns = widened;
    true
}
