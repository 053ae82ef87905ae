//! Processing configuration: the serde DTO loaded from YAML/JSON files and
//! the option set that callers (normally the CLI) fill in directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Key projection and value handling rules, loaded from a config file.
///
/// All fields are optional; flat paths match exactly against canonical keys,
/// regex fields go through [`prepare_pattern`] first.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlattenConfig {
    pub include_keys: Vec<String>,
    pub include_keys_regex: Vec<String>,
    pub exclude_keys: Vec<String>,
    pub exclude_keys_regex: Vec<String>,

    /// Map of flat path to literal output column name.
    pub replace_keys: BTreeMap<String, String>,

    /// Map of regex to replacement; `${n}` references capture groups and a
    /// trailing `|to_snake_case` converts the final name.
    pub replace_keys_regex: BTreeMap<String, String>,

    /// Map of flat path to chrono time format; literal `RAW` disables
    /// parsing for that key.
    pub parse_time: BTreeMap<String, String>,
    pub output_time_format: Option<String>,
    #[serde(rename = "outputTZ")]
    pub output_timezone: Option<String>,

    /// When set, values of keys renamed into one column are concatenated
    /// with this delimiter instead of first-wins.
    pub concat_delimiter: Option<String>,

    /// Map of flat-path prefix to transposed partition name.
    pub transpose: BTreeMap<String, String>,

    /// Map of regex to extractor name (`URL`, `JSON`, `GEOIP`, `NETIP`).
    pub extract_values_regex: BTreeMap<String, String>,

    /// Paths whose subtrees are emitted as raw JSON strings.
    pub keep_json: Vec<String>,
    pub keep_json_regex: Vec<String>,

    /// Regex capturing parts of the line preceding the JSON body.
    pub match_line_prefix: Option<String>,
}

impl FlattenConfig {
    /// Load configuration from a YAML or JSON file (YAML parses both).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KilnError::io(format!("read config file {}", path.display()), e))?;

        serde_yaml::from_str(&raw)
            .map_err(|e| KilnError::Config(format!("decode config file {}: {}", path.display(), e)))
    }
}

/// Runtime options with the processing defaults.
#[derive(Debug, Clone)]
pub struct Options {
    pub csv: Option<PathBuf>,
    pub raw: Option<PathBuf>,
    pub raw_delim: String,
    pub sqlite: Option<PathBuf>,
    pub pg_dump: Option<PathBuf>,
    pub sql_table: String,
    pub sql_max_cols: usize,

    pub max_lines: usize,
    pub offset_lines: usize,
    pub max_lines_keys: usize,
    pub field_limit: usize,
    pub key_limit: usize,
    pub children_limit_object: usize,
    pub children_limit_array: usize,
    pub buf_size: usize,

    pub get_key: Option<String>,
    pub replace_keys: bool,
    pub extract_strings: bool,
    pub skip_zero_cols: bool,
    pub add_sequence: bool,
    pub case_sensitive_keys: bool,
    pub match_line_prefix: Option<String>,

    pub show_keys_flat: bool,
    pub show_keys_hier: bool,
    pub show_keys_info: bool,
    pub show_json_schema: bool,

    /// Worker pool size; 0 means `2 × CPU count`.
    pub concurrency: usize,
    /// Heap in use soft limit in MB; 0 disables throttling.
    pub mem_limit_mb: usize,
    pub verbosity: u8,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            csv: None,
            raw: None,
            raw_delim: String::new(),
            sqlite: None,
            pg_dump: None,
            sql_table: "kiln".to_string(),
            sql_max_cols: 2000,
            max_lines: 0,
            offset_lines: 0,
            max_lines_keys: 0,
            field_limit: 0,
            key_limit: 0,
            children_limit_object: 100,
            children_limit_array: 10,
            buf_size: 10_000_000,
            get_key: None,
            replace_keys: false,
            extract_strings: false,
            skip_zero_cols: false,
            add_sequence: false,
            case_sensitive_keys: false,
            match_line_prefix: None,
            show_keys_flat: false,
            show_keys_hier: false,
            show_keys_info: false,
            show_json_schema: false,
            concurrency: 0,
            mem_limit_mb: 1000,
            verbosity: 1,
        }
    }
}

impl Options {
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            2 * num_cpus::get()
        }
    }

    /// Route a comma-separated `--output` list to typed outputs by suffix.
    pub fn route_outputs(&mut self, output: &str) {
        for out in output.split(',').filter(|s| !s.is_empty()) {
            let low = out.to_lowercase();

            if low.ends_with(".csv") || low.ends_with(".csv.gz") || low.ends_with(".csv.zst") {
                if self.csv.is_some() {
                    tracing::warn!(output = out, "CSV output is already enabled, skipping");
                    continue;
                }
                self.csv = Some(PathBuf::from(out));
            } else if low.ends_with(".raw") || low.ends_with(".raw.gz") || low.ends_with(".raw.zst")
            {
                if self.raw.is_some() {
                    tracing::warn!(output = out, "RAW output is already enabled, skipping");
                    continue;
                }
                self.raw = Some(PathBuf::from(out));
            } else if low.ends_with(".sqlite") {
                if self.sqlite.is_some() {
                    tracing::warn!(output = out, "SQLite output is already enabled, skipping");
                    continue;
                }
                self.sqlite = Some(PathBuf::from(out));
            } else {
                tracing::warn!(output = out, "unexpected output suffix");
            }
        }
    }
}

/// Rewrite the `*` shorthand into an anchored regex.
///
/// A pattern that starts with `.` and carries no explicit anchors is treated
/// as a flat-path template: `.`, `[`, `]`, `{`, `}` are escaped, each `*`
/// becomes a `([^.]+)` capture, and the result is wrapped in `^…$`.
pub fn prepare_pattern(pattern: &str) -> String {
    if pattern.ends_with('$') || pattern.starts_with('^') || !pattern.starts_with('.') {
        return pattern.to_string();
    }

    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');

    for c in pattern.chars() {
        match c {
            '.' | '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '*' => out.push_str("([^.]+)"),
            _ => out.push(c),
        }
    }

    out.push('$');
    out
}

/// Compile a configured pattern after `*` preprocessing.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(KilnError::Config("empty regexp".to_string()));
    }

    let prepared = prepare_pattern(pattern);

    Regex::new(&prepared).map_err(|e| KilnError::Regex { pattern: prepared, source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_pattern_star_rewrite() {
        assert_eq!(prepare_pattern(".foo.*.bar"), r"^\.foo\.([^.]+)\.bar$");
        assert_eq!(prepare_pattern(".items.[0]"), r"^\.items\.\[0\]$");
    }

    #[test]
    fn test_prepare_pattern_anchored_untouched() {
        assert_eq!(prepare_pattern("^already$"), "^already$");
        assert_eq!(prepare_pattern(".ends.with$"), ".ends.with$");
        assert_eq!(prepare_pattern("plain"), "plain");
    }

    #[test]
    fn test_compile_pattern_matches_paths() {
        let r = compile_pattern(".a.*.c").unwrap();
        assert!(r.is_match(".a.b.c"));
        assert!(!r.is_match(".a.b.b.c"));
        assert_eq!(r.captures(".a.xyz.c").unwrap().get(1).unwrap().as_str(), "xyz");
    }

    #[test]
    fn test_compile_pattern_rejects_empty() {
        assert!(compile_pattern("").is_err());
    }

    #[test]
    fn test_config_from_json() {
        let cfg: FlattenConfig = serde_yaml::from_str(
            r#"{"includeKeys": [".a"], "transpose": {".items": "items"}, "concatDelimiter": "::"}"#,
        )
        .unwrap();

        assert_eq!(cfg.include_keys, vec![".a"]);
        assert_eq!(cfg.transpose.get(".items").unwrap(), "items");
        assert_eq!(cfg.concat_delimiter.as_deref(), Some("::"));
    }

    #[test]
    fn test_route_outputs() {
        let mut opts = Options::default();
        opts.route_outputs("out.csv.gz,out.sqlite,out.raw");
        assert_eq!(opts.csv.as_deref(), Some(Path::new("out.csv.gz")));
        assert_eq!(opts.sqlite.as_deref(), Some(Path::new("out.sqlite")));
        assert_eq!(opts.raw.as_deref(), Some(Path::new("out.raw")));
    }
}
