//! Projection planning: which discovered keys become output columns, in
//! what order, and under what names.
//!
//! The planner folds literal and regex include/exclude filters over the
//! discovery-order key list, applies the rename rules, de-duplicates
//! replaced names, and pulls transposed keys out into partitions at write
//! time. `const:<literal>` pseudo-keys pass through as constant columns.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{FlattenConfig, Options};
use crate::flatten::keys::{to_snake_case, FlKey, KeyRegistry};

static TRIM_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const CONST_PREFIX: &str = "const:";

/// The final column list plus lookup structures for pass 2.
#[derive(Debug, Default)]
pub struct Projection {
    /// Ordered output columns, transposed keys included.
    pub keys: Vec<FlKey>,
    /// Original flat path (or `const:` pseudo-key) to column index.
    pub include_keys: HashMap<String, usize>,
    /// Column index to injected literal.
    pub const_vals: HashMap<usize, String>,
}

impl Projection {
    /// Index of the single data column when the projection has exactly one
    /// non-const entry.
    pub fn single_key(&self) -> Option<usize> {
        let mut data = self.include_keys.iter().filter(|(k, _)| !k.starts_with(CONST_PREFIX));

        match (data.next(), data.next()) {
            (Some((_, &i)), None) => Some(i),
            _ => None,
        }
    }
}

/// Applies rename rules to one key at a time, remembering claimed names.
///
/// Shared with the writers: transposed partitions run their trimmed column
/// paths and synthetic columns through the same instance during setup.
pub struct KeyNamer {
    /// Canonical path to explicit replacement.
    replace_keys: HashMap<String, String>,
    /// Claimed output name to the key that owns it.
    replace_by_key: HashMap<String, String>,
    replace_regex: Vec<(Regex, String)>,
    global_replace: bool,
    key_limit: usize,
    case_sensitive: bool,
}

impl KeyNamer {
    pub fn new(
        replace_keys: impl Iterator<Item = (String, String)>,
        replace_regex: Vec<(Regex, String)>,
        global_replace: bool,
        key_limit: usize,
        case_sensitive: bool,
    ) -> Self {
        let mut namer = KeyNamer {
            replace_keys: HashMap::new(),
            replace_by_key: HashMap::new(),
            replace_regex,
            global_replace,
            key_limit,
            case_sensitive,
        };

        for (k, r) in replace_keys {
            let ck = namer.ck(&k);
            namer.replace_by_key.insert(r.clone(), ck.clone());
            namer.replace_keys.insert(ck, r);
        }

        namer
    }

    fn ck(&self, k: &str) -> String {
        if self.case_sensitive {
            k.to_string()
        } else {
            k.to_lowercase()
        }
    }

    /// Produce the output column name for a flat path.
    ///
    /// `idx` is the column's assigned index; it disambiguates names that the
    /// key-length limit truncates. Applying the rules to an already-renamed
    /// name yields the same name.
    pub fn prepare_key(&mut self, orig_key: &str, idx: usize) -> String {
        let ck = self.ck(orig_key);

        if let Some(rep) = self.replace_keys.get(&ck) {
            return rep.clone();
        }

        let kk = self.rename(orig_key);

        if self.key_limit > 0 && kk.chars().count() > self.key_limit {
            let index_str = idx.to_string();
            let keep = self.key_limit.saturating_sub(index_str.len());
            let mut truncated: String = kk.chars().take(keep).collect();
            truncated.push_str(&index_str);

            self.replace_keys.insert(ck, truncated.clone());
            return truncated;
        }

        kk
    }

    fn rename(&mut self, orig_key: &str) -> String {
        for (reg, rep) in &self.replace_regex {
            let mut kr = orig_key.to_string();

            if let Some(caps) = reg.captures(orig_key) {
                kr = rep.clone();

                for i in 1..caps.len() {
                    let m = caps.get(i).map_or("", |m| m.as_str());
                    let cleaned = TRIM_SPACES.replace_all(m.trim(), "_");
                    kr = kr.replace(&format!("${{{}}}", i), &cleaned);
                }
            }

            if kr != orig_key {
                if let Some(stripped) = kr.strip_suffix("|to_snake_case") {
                    kr = to_snake_case(stripped);
                }

                return kr;
            }
        }

        if !self.global_replace {
            return orig_key.to_string();
        }

        self.disambiguated_tail(orig_key)
    }

    /// Build a unique snake_case name from the path tail, prepending earlier
    /// segments until the name is unclaimed.
    fn disambiguated_tail(&mut self, orig_key: &str) -> String {
        let sk: Vec<&str> = orig_key.trim_end_matches('.').split('.').collect();
        let mut i = sk.len() - 1;
        let mut snk = trim_brackets(&to_snake_case(sk[i]));

        loop {
            if snk.is_empty() {
                return orig_key.to_string();
            }

            let claimed = self.replace_by_key.get(&snk);
            let starts_ok =
                snk.chars().next().is_some_and(|c| c == '_' || c.is_alphabetic());

            if claimed.map_or(true, |stored| stored.as_str() == orig_key) && starts_ok {
                self.replace_by_key.insert(snk.clone(), orig_key.to_string());
                return snk;
            }

            if i == 0 {
                return orig_key.to_string();
            }
            i -= 1;
            if i == 0 {
                return orig_key.to_string();
            }

            snk = format!("{}_{}", trim_brackets(&to_snake_case(sk[i])), snk);
        }
    }
}

fn trim_brackets(s: &str) -> String {
    s.trim_matches(|c| c == '[' || c == ']').to_string()
}

/// Assemble the projection from the registry and configuration.
///
/// Pass 1 must be complete (or skipped for a literal include list); the
/// registry's canonical fold happens here.
pub fn build_projection(
    registry: &KeyRegistry,
    cfg: &FlattenConfig,
    opts: &Options,
    include_regex: &[Regex],
    exclude_regex: &[Regex],
    namer: &Mutex<KeyNamer>,
) -> Projection {
    let mut include_keys: HashMap<String, usize> = HashMap::new();
    let mut next = 0usize;

    let exclude_keys: HashSet<String> =
        cfg.exclude_keys.iter().map(|k| registry.ck(k)).collect();

    let excluded = |k: &str, ck: &str| {
        exclude_keys.contains(ck) || exclude_regex.iter().any(|r| r.is_match(k))
    };

    // Literal includes come first, in configuration order.
    for k in &cfg.include_keys {
        if excluded(k, &registry.ck(k)) || include_keys.contains_key(k) {
            continue;
        }

        include_keys.insert(k.clone(), next);
        next += 1;
    }

    if registry.is_empty() && !include_keys.is_empty() {
        registry.synthesize_include_keys(cfg.include_keys.iter().map(String::as_str));
    }

    registry.fold_canonical();

    let mut canonical_includes: HashSet<String> = HashSet::new();

    for k in registry.discovered() {
        if include_keys.contains_key(&k) {
            continue;
        }

        let ck = registry.ck(&k);

        if excluded(&k, &ck) || canonical_includes.contains(&ck) {
            continue;
        }

        let included = if !include_regex.is_empty() {
            include_regex.iter().any(|r| r.is_match(&k))
        } else if cfg.include_keys.is_empty() {
            !opts.skip_zero_cols
                || !registry.canonical_key(&ck).map_or(false, |c| c.is_zero)
        } else {
            false
        };

        if included {
            canonical_includes.insert(ck);
            include_keys.insert(k, next);
            next += 1;
        }
    }

    prepare_keys(registry, namer, include_keys)
}

/// Name every included column, then fold replaced-name collisions into
/// shared column indexes.
fn prepare_keys(
    registry: &KeyRegistry,
    namer: &Mutex<KeyNamer>,
    mut include_keys: HashMap<String, usize>,
) -> Projection {
    let mut namer = namer.lock().expect("key namer poisoned");

    let mut sorted: Vec<(String, usize)> =
        include_keys.iter().map(|(k, i)| (k.clone(), *i)).collect();
    sorted.sort_by_key(|(_, i)| *i);
    // Shorter keys first claim the better names.
    sorted.sort_by_key(|(k, _)| k.len());

    let mut keys: Vec<FlKey> = vec![FlKey::default(); include_keys.len()];

    for (orig_key, idx) in &sorted {
        let mut k = match registry.canonical_key(&registry.ck(orig_key)) {
            // Meta keys like `const:x` and never-observed includes.
            None => FlKey::default(),
            Some(k) => k,
        };

        k.replaced = if k.original.is_empty() {
            namer.prepare_key(orig_key, *idx)
        } else if k.transpose_dst.is_none() {
            namer.prepare_key(&k.original.clone(), *idx)
        } else {
            namer.prepare_key(&k.transpose_trimmed.clone(), *idx)
        };

        keys[*idx] = k;
    }

    // De-duplicate: a repeated replaced name outside transposition reuses
    // the first occurrence's column and merges types into it.
    let mut deduped: Vec<FlKey> = Vec::with_capacity(keys.len());
    let mut key_exists: HashMap<String, usize> = HashMap::new();
    let mut key_map: HashMap<usize, usize> = HashMap::new();

    for (i, k) in keys.into_iter().enumerate() {
        if k.transpose_dst.is_none() {
            if let Some(&j) = key_exists.get(&k.replaced) {
                deduped[j].t = deduped[j].t.merge(k.t);
                key_map.insert(i, j);
                continue;
            }

            key_exists.insert(k.replaced.clone(), deduped.len());
        }

        key_map.insert(i, deduped.len());
        deduped.push(k);
    }

    let mut const_vals = HashMap::new();

    for (k, i) in include_keys.iter_mut() {
        if let Some(&j) = key_map.get(i) {
            *i = j;

            if let Some(lit) = k.strip_prefix(CONST_PREFIX) {
                const_vals.insert(j, lit.to_string());
            }
        }
    }

    Projection { keys: deduped, include_keys, const_vals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile_pattern;
    use crate::hash::PathHasher;
    use crate::types::Type;

    fn namer(global: bool) -> KeyNamer {
        KeyNamer::new(std::iter::empty(), Vec::new(), global, 0, false)
    }

    fn scan(reg: &KeyRegistry, key: &str, t: Type, is_zero: bool) {
        let mut h = PathHasher::new();
        let path: Vec<String> =
            key.trim_start_matches('.').split('.').map(str::to_string).collect();
        let parent_len = key.len() - (path.last().unwrap().len() + 1);
        let (pk, parent) = h.hash_parent(key.as_bytes(), parent_len);
        reg.scan_key(pk, parent, &path, t, is_zero);
    }

    fn registry() -> KeyRegistry {
        KeyRegistry::new(Vec::new(), Vec::new(), false, 100, 10)
    }

    #[test]
    fn test_prepare_key_passthrough_without_rules() {
        let mut n = namer(false);
        assert_eq!(n.prepare_key(".a.b", 0), ".a.b");
        assert_eq!(n.prepare_key(".a.b", 0), ".a.b");
    }

    #[test]
    fn test_prepare_key_explicit_replace_wins() {
        let mut n = KeyNamer::new(
            [(".A.B".to_string(), "shared".to_string())].into_iter(),
            Vec::new(),
            true,
            0,
            false,
        );
        assert_eq!(n.prepare_key(".a.b", 0), "shared");
    }

    #[test]
    fn test_prepare_key_regex_with_captures_and_snake() {
        let reg = compile_pattern(".deep.*.name").unwrap();
        let mut n = KeyNamer::new(
            std::iter::empty(),
            vec![(reg, "deep_${1}_name|to_snake_case".to_string())],
            false,
            0,
            false,
        );
        assert_eq!(n.prepare_key(".deep.First Second.name", 0), "deep_first_second_name");
    }

    #[test]
    fn test_tail_disambiguation() {
        let mut n = namer(true);
        assert_eq!(n.prepare_key(".user.Name", 0), "name");
        // Same tail on another path extends with the previous segment.
        assert_eq!(n.prepare_key(".owner.Name", 1), "owner_name");
        // Re-applying yields the same claimed name.
        assert_eq!(n.prepare_key(".user.Name", 0), "name");
    }

    #[test]
    fn test_tail_disambiguation_strips_brackets() {
        let mut n = namer(true);
        assert_eq!(n.prepare_key(".wins.[0].[1]", 0), "wins_0_1");
    }

    #[test]
    fn test_key_limit_truncates_with_index() {
        let mut n = KeyNamer::new(std::iter::empty(), Vec::new(), false, 8, false);
        let out = n.prepare_key(".averylongkeyname", 12);
        assert_eq!(out.len(), 8);
        assert!(out.ends_with("12"));
        // The truncation is cached as an explicit rename.
        assert_eq!(n.prepare_key(".averylongkeyname", 12), out);
    }

    #[test]
    fn test_projection_discovery_order_and_filters() {
        let reg = registry();
        scan(&reg, ".a", Type::Int, false);
        scan(&reg, ".b", Type::String, false);
        scan(&reg, ".skipme", Type::String, false);

        let cfg = FlattenConfig {
            exclude_keys: vec![".skipme".to_string()],
            ..FlattenConfig::default()
        };
        let opts = Options::default();
        let namer = Mutex::new(namer(false));

        let proj = build_projection(&reg, &cfg, &opts, &[], &[], &namer);

        assert_eq!(proj.keys.len(), 2);
        assert_eq!(proj.keys[0].original, ".a");
        assert_eq!(proj.keys[1].original, ".b");
        assert_eq!(proj.include_keys[".a"], 0);
    }

    #[test]
    fn test_projection_literal_includes_and_const() {
        let reg = registry();
        scan(&reg, ".a", Type::Int, false);
        scan(&reg, ".b", Type::String, false);

        let cfg = FlattenConfig {
            include_keys: vec![".b".to_string(), "const:bar".to_string()],
            ..FlattenConfig::default()
        };
        let opts = Options::default();
        let namer = Mutex::new(namer(false));

        let proj = build_projection(&reg, &cfg, &opts, &[], &[], &namer);

        // Only literal includes survive when no include regex is present.
        assert_eq!(proj.keys.len(), 2);
        assert_eq!(proj.keys[0].original, ".b");
        assert_eq!(proj.const_vals.get(&1).map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_projection_skip_zero_cols() {
        let reg = registry();
        scan(&reg, ".a", Type::Int, true);
        scan(&reg, ".b", Type::Int, false);

        let cfg = FlattenConfig::default();
        let opts = Options { skip_zero_cols: true, ..Options::default() };
        let namer = Mutex::new(namer(false));

        let proj = build_projection(&reg, &cfg, &opts, &[], &[], &namer);

        assert_eq!(proj.keys.len(), 1);
        assert_eq!(proj.keys[0].original, ".b");
    }

    #[test]
    fn test_projection_dedup_merges_types() {
        let reg = registry();
        scan(&reg, ".a", Type::Int, false);
        scan(&reg, ".b", Type::String, false);

        let cfg = FlattenConfig {
            replace_keys: [
                (".a".to_string(), "shared".to_string()),
                (".b".to_string(), "shared".to_string()),
            ]
            .into_iter()
            .collect(),
            ..FlattenConfig::default()
        };
        let opts = Options::default();
        let namer = Mutex::new(KeyNamer::new(
            cfg.replace_keys.clone().into_iter(),
            Vec::new(),
            false,
            0,
            false,
        ));

        let proj = build_projection(&reg, &cfg, &opts, &[], &[], &namer);

        assert_eq!(proj.keys.len(), 1);
        assert_eq!(proj.keys[0].replaced, "shared");
        assert_eq!(proj.keys[0].t, Type::String);
        // Both originals map to the shared column.
        assert_eq!(proj.include_keys[".a"], 0);
        assert_eq!(proj.include_keys[".b"], 0);
    }

    #[test]
    fn test_projection_include_regex() {
        let reg = registry();
        scan(&reg, ".keep.a", Type::Int, false);
        scan(&reg, ".drop.b", Type::Int, false);

        let cfg = FlattenConfig::default();
        let opts = Options::default();
        let include = vec![compile_pattern(".keep.*").unwrap()];
        let namer = Mutex::new(namer(false));

        let proj = build_projection(&reg, &cfg, &opts, &include, &[], &namer);

        assert_eq!(proj.keys.len(), 1);
        assert_eq!(proj.keys[0].original, ".keep.a");
    }

    #[test]
    fn test_single_key() {
        let mut proj = Projection::default();
        proj.include_keys.insert(".a".to_string(), 0);
        assert_eq!(proj.single_key(), Some(0));

        proj.include_keys.insert("const:x".to_string(), 1);
        assert_eq!(proj.single_key(), Some(0));

        proj.include_keys.insert(".b".to_string(), 2);
        assert_eq!(proj.single_key(), None);
    }
}
