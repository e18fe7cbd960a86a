use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-table settings for one flatten run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Emit one row per element of the table's arrays into child tables
    pub split: bool,

    /// Use schema titles instead of paths as headers
    pub pretty_headers: bool,

    /// Path -> header text overrides
    pub headers: IndexMap<String, String>,

    /// Paths copied onto every row of descendant tables
    pub repeat: Vec<String>,

    /// Index-qualified paths kept in this table's rows even when split
    pub unnest: Vec<String>,

    /// Column whitelist; identifier fields are always kept
    pub only: Vec<String>,

    /// Output name override
    pub name: Option<String>,
}

impl TableOptions {
    pub fn split() -> Self {
        TableOptions {
            split: true,
            ..Default::default()
        }
    }

    /// True when `path` survives the `only` whitelist.
    pub fn keeps(&self, path: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|allowed| allowed == path)
    }
}

/// Options for one flatten run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlattenOptions {
    /// Selected tables in output order
    pub selection: IndexMap<String, TableOptions>,

    /// Emit `<array>Count` columns
    pub count: bool,

    /// Tables whose rows are never emitted
    pub exclude: Vec<String>,

    /// Child tables are split out only when their array held at least this
    /// many elements during analysis; shorter arrays stay inline in the
    /// parent row. `0` splits every child.
    pub split_threshold: usize,
}

impl FlattenOptions {
    pub fn new<N: Into<String>>(selection: impl IntoIterator<Item = (N, TableOptions)>) -> Self {
        FlattenOptions {
            selection: selection.into_iter().map(|(name, opts)| (name.into(), opts)).collect(),
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: bool) -> Self {
        self.count = count;
        self
    }

    pub fn with_exclude<N: Into<String>>(mut self, exclude: impl IntoIterator<Item = N>) -> Self {
        self.exclude = exclude.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|excluded| excluded == name)
    }
}

/// Hands out output names, appending a counter to names already taken
#[derive(Debug, Default)]
pub(crate) struct OutputNames {
    seen: HashMap<String, usize>,
}

impl OutputNames {
    pub(crate) fn claim(&mut self, name: &str) -> String {
        let mut counter = self.seen.get(name).copied().unwrap_or(0);
        let mut candidate = name.to_string();
        while self.seen.contains_key(&candidate) {
            counter += 1;
            candidate = format!("{}{}", name, counter);
        }
        self.seen.insert(name.to_string(), counter);
        self.seen.entry(candidate.clone()).or_insert(0);
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_names_are_suffixed() {
        let mut names = OutputNames::default();
        assert_eq!(names.claim("test"), "test");
        assert_eq!(names.claim("test"), "test1");
        assert_eq!(names.claim("test"), "test2");
        assert_eq!(names.claim("other"), "other");
    }

    #[test]
    fn test_output_names_skip_taken_suffix() {
        let mut names = OutputNames::default();
        assert_eq!(names.claim("test1"), "test1");
        assert_eq!(names.claim("test"), "test");
        assert_eq!(names.claim("test"), "test2");
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: FlattenOptions = serde_json::from_str(
            r#"{"selection": {"tenders": {"split": true, "repeat": ["/tender/id"]}, "parties": {}}, "count": true}"#,
        )
        .unwrap();
        assert!(options.count);
        assert_eq!(options.split_threshold, 0);
        assert!(options.selection["tenders"].split);
        assert_eq!(options.selection["tenders"].repeat, vec!["/tender/id"]);
        assert!(!options.selection["parties"].split);
        assert_eq!(options.selection.keys().collect::<Vec<_>>(), vec!["tenders", "parties"]);
    }

    #[test]
    fn test_only_whitelist() {
        let opts = TableOptions {
            only: vec!["/tender/id".to_string()],
            ..Default::default()
        };
        assert!(opts.keeps("/tender/id"));
        assert!(!opts.keeps("/tender/title"));
        assert!(TableOptions::default().keeps("/tender/title"));
    }
}
