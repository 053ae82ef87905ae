//! Key records and the concurrent discovery registry.
//!
//! Pass 1 funnels every walker callback through [`KeyRegistry::scan_key`],
//! which inserts key records keyed by the 64-bit path hash, merges observed
//! types, tracks per-parent cardinality and flags high-cardinality parents
//! for collapse. Only pass 1 inserts records; pass 2 reads them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::flatten::extract::Extract;
use crate::hash::PathHasher;
use crate::schema::KeyHierarchy;
use crate::types::{Type, Value};

/// Join path segments into a dot-separated flat key.
pub fn key_from_path(path: &[String]) -> String {
    let mut s = String::with_capacity(path.iter().map(|p| p.len() + 1).sum());
    for seg in path {
        s.push('.');
        s.push_str(seg);
    }
    s
}

/// Transposed row key: array index or object property name.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Int(i64),
    Str(String),
}

impl IndexKey {
    pub fn ty(&self) -> Type {
        match self {
            IndexKey::Int(_) => Type::Int,
            IndexKey::Str(_) => Type::String,
        }
    }

    pub fn as_value(&self) -> Value {
        match self {
            IndexKey::Int(i) => Value::number(*i as f64, i.to_string()),
            IndexKey::Str(s) => Value::string(s.clone()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            IndexKey::Int(i) => i.to_string(),
            IndexKey::Str(s) => s.clone(),
        }
    }
}

/// A discovered flat key.
#[derive(Debug, Clone, Default)]
pub struct FlKey {
    pub path: Vec<String>,
    pub original: String,
    /// Lowercased original unless case-sensitive keys are on.
    pub canonical: String,
    /// Final column name after rename rules.
    pub replaced: String,
    pub t: Type,
    /// True while every observation was the type's zero (0, "", false, null).
    pub is_zero: bool,
    /// Hash of the flat path minus the last segment.
    pub parent: u64,
    pub transpose_dst: Option<String>,
    pub transpose_key: Option<IndexKey>,
    pub transpose_trimmed: String,
    pub extractor: Option<Extract>,
}

/// Concurrent map of path hash to key record plus discovery bookkeeping.
pub struct KeyRegistry {
    keys: DashMap<u64, FlKey>,
    /// Parents flagged as high-cardinality, keyed by their own path hash.
    high_card: DashMap<u64, ()>,
    state: Mutex<RegistryState>,
    total_keys: Arc<AtomicI64>,

    transpose: Vec<(String, String)>,
    extract_regex: Vec<(Regex, Extract)>,
    case_sensitive: bool,
    children_limit_object: usize,
    children_limit_array: usize,
}

#[derive(Default)]
struct RegistryState {
    /// Original flat paths in discovery order.
    list: Vec<String>,
    /// Canonical path to folded key record.
    canonical: HashMap<String, FlKey>,
    parent_cardinality: HashMap<u64, usize>,
    /// Parent paths promoted to keep-JSON by the cardinality limit.
    keep_json: Vec<String>,
}

impl KeyRegistry {
    pub fn new(
        transpose: Vec<(String, String)>,
        extract_regex: Vec<(Regex, Extract)>,
        case_sensitive: bool,
        children_limit_object: usize,
        children_limit_array: usize,
    ) -> Self {
        KeyRegistry {
            keys: DashMap::new(),
            high_card: DashMap::new(),
            state: Mutex::new(RegistryState::default()),
            total_keys: Arc::new(AtomicI64::new(0)),
            transpose,
            extract_regex,
            case_sensitive,
            children_limit_object,
            children_limit_array,
        }
    }

    /// Canonicalize a flat key.
    pub fn ck(&self, k: &str) -> String {
        if self.case_sensitive {
            k.to_string()
        } else {
            k.to_lowercase()
        }
    }

    /// Record one observation of a key.
    ///
    /// Returns the key's cached extractor and a stop signal that prunes the
    /// subtree when the key's parent has been flagged high-cardinality.
    pub fn scan_key(
        &self,
        pk: u64,
        parent: u64,
        path: &[String],
        t: Type,
        is_zero: bool,
    ) -> (Option<Extract>, bool) {
        if self.high_card.contains_key(&parent) {
            return (None, true);
        }

        if let Some(mut k) = self.keys.get_mut(&pk) {
            let merged = k.t.merge(t);
            if merged != k.t {
                k.t = merged;
            }
            if k.is_zero && !is_zero {
                k.is_zero = false;
            }
            return (k.extractor, false);
        }

        self.insert_key(pk, parent, path, t, is_zero)
    }

    fn build_key(&self, parent: u64, path: &[String], t: Type, is_zero: bool) -> FlKey {
        let original = key_from_path(path);

        let mut k = FlKey {
            path: path.to_vec(),
            canonical: self.ck(&original),
            original,
            t,
            is_zero,
            parent,
            ..FlKey::default()
        };

        for (prefix, dst) in &self.transpose {
            if k.original.starts_with(prefix.as_str()) {
                scan_transposed_key(dst, prefix, &mut k);
                break;
            }
        }

        for (r, x) in &self.extract_regex {
            if r.is_match(&k.original) {
                k.extractor = Some(*x);
                break;
            }
        }

        k
    }

    fn insert_key(
        &self,
        pk: u64,
        parent: u64,
        path: &[String],
        t: Type,
        is_zero: bool,
    ) -> (Option<Extract>, bool) {
        let k = self.build_key(parent, path, t, is_zero);

        let mut st = self.state.lock().expect("registry state poisoned");

        // Another worker may have inserted the key while this one was
        // building the record.
        if let Some(existing) = self.keys.get(&pk) {
            return (existing.extractor, false);
        }

        let limit = if path.last().is_some_and(|s| s.starts_with('[')) {
            self.children_limit_array
        } else {
            self.children_limit_object
        };

        if limit > 0 && path.len() > 1 {
            let cardinality = st.parent_cardinality.get(&parent).copied().unwrap_or(0) + 1;

            if cardinality > limit {
                self.flag_high_cardinality(&mut st, &k, parent);
            } else {
                st.parent_cardinality.insert(parent, cardinality);
            }
        }

        if !st.canonical.contains_key(&k.canonical) {
            st.list.push(k.original.clone());
            st.canonical.insert(k.canonical.clone(), k.clone());
        }

        let extractor = k.extractor;
        self.keys.insert(pk, k);
        self.total_keys.fetch_add(1, Ordering::Relaxed);

        (extractor, false)
    }

    /// Promote the key's parent to a keep-JSON column and flag it so the
    /// walker prunes its children from here on.
    fn flag_high_cardinality(&self, st: &mut RegistryState, k: &FlKey, parent: u64) {
        let parent_path = &k.path[..k.path.len() - 1];
        let parent_key = key_from_path(parent_path);
        let grandparent_len = parent_key
            .len()
            .saturating_sub(parent_path.last().map_or(0, |s| s.len() + 1));

        let mut hasher = PathHasher::new();
        let (ppk, gpk) = hasher.hash_parent(parent_key.as_bytes(), grandparent_len);

        if let Some(mut existing) = self.keys.get_mut(&ppk) {
            existing.t = Type::Json;
            existing.is_zero = false;
        } else {
            let mut pkey = self.build_key(gpk, parent_path, Type::Json, false);
            pkey.t = Type::Json;

            if !st.canonical.contains_key(&pkey.canonical) {
                st.list.push(pkey.original.clone());
                st.canonical.insert(pkey.canonical.clone(), pkey.clone());
            }

            self.keys.insert(ppk, pkey);
            self.total_keys.fetch_add(1, Ordering::Relaxed);
        }

        st.keep_json.push(parent_key);
        self.high_card.insert(parent, ());
    }

    /// Post-pass cleanup: pin flagged parents to `json`, drop interior
    /// container records and collapsed children from the projection inputs,
    /// and register survivors in the hierarchy tree.
    pub fn prepare_scanned_keys(&self, hierarchy: &mut KeyHierarchy) {
        let mut hc_originals = Vec::new();

        for entry in self.high_card.iter() {
            if let Some(mut k) = self.keys.get_mut(entry.key()) {
                k.t = Type::Json;
                hc_originals.push(k.original.clone());
            }
        }

        let mut deleted: HashSet<String> = HashSet::new();
        let mut removed_hashes = Vec::new();

        for entry in self.keys.iter() {
            let k = entry.value();

            if k.t.is_container() {
                deleted.insert(k.original.clone());
                continue;
            }

            let collapsed = hc_originals
                .iter()
                .any(|hc| k.original.len() > hc.len() && k.original.starts_with(hc.as_str()));

            if collapsed {
                removed_hashes.push(*entry.key());
                deleted.insert(k.original.clone());
                continue;
            }

            hierarchy.add(&k.path);
        }

        for pk in removed_hashes {
            self.keys.remove(&pk);
        }

        let mut st = self.state.lock().expect("registry state poisoned");
        st.list.retain(|k| !deleted.contains(k));
    }

    /// Seed the registry from literal include keys when pass 1 was skipped.
    pub fn synthesize_include_keys<'a>(&self, includes: impl Iterator<Item = &'a str>) {
        if !self.keys.is_empty() {
            return;
        }

        let mut hasher = PathHasher::new();

        for key in includes {
            if key.starts_with("const:") {
                continue;
            }

            let path: Vec<String> =
                key.trim_start_matches('.').split('.').map(str::to_string).collect();
            let pk = hasher.hash(key.as_bytes());

            let mut k = FlKey {
                path,
                original: key.to_string(),
                canonical: self.ck(key),
                t: Type::String,
                is_zero: false,
                ..FlKey::default()
            };

            for (r, x) in &self.extract_regex {
                if r.is_match(key) {
                    k.extractor = Some(*x);
                    break;
                }
            }

            self.keys.insert(pk, k);
        }
    }

    /// Fold accumulated per-record type and zero state into the canonical
    /// map, collapsing case variants.
    pub fn fold_canonical(&self) {
        let mut st = self.state.lock().expect("registry state poisoned");

        for entry in self.keys.iter() {
            let k = entry.value();

            if self.high_card.contains_key(&k.parent) {
                continue;
            }

            match st.canonical.get(&k.canonical) {
                Some(v) => {
                    let mut folded = k.clone();
                    folded.is_zero = k.is_zero && v.is_zero;
                    folded.t = v.t.merge(k.t);
                    st.canonical.insert(folded.canonical.clone(), folded);
                }
                None => {
                    st.canonical.insert(k.canonical.clone(), k.clone());
                }
            }
        }
    }

    pub fn get(&self, pk: u64) -> Option<FlKey> {
        self.keys.get(&pk).map(|k| k.clone())
    }

    pub fn for_each(&self, mut f: impl FnMut(u64, &FlKey)) {
        for entry in self.keys.iter() {
            f(*entry.key(), entry.value());
        }
    }

    pub fn canonical_key(&self, ck: &str) -> Option<FlKey> {
        self.state.lock().expect("registry state poisoned").canonical.get(ck).cloned()
    }

    /// Discovery-order snapshot of original flat paths.
    pub fn discovered(&self) -> Vec<String> {
        self.state.lock().expect("registry state poisoned").list.clone()
    }

    /// Parent paths promoted to keep-JSON during scanning.
    pub fn flagged_keep_json(&self) -> Vec<String> {
        self.state.lock().expect("registry state poisoned").keep_json.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn total_keys(&self) -> i64 {
        self.total_keys.load(Ordering::Relaxed)
    }

    /// Shared counter handle for progress metrics.
    pub fn total_keys_counter(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.total_keys)
    }
}

/// Split a transposed key into its partition key and trimmed column path.
fn scan_transposed_key(dst: &str, prefix: &str, k: &mut FlKey) {
    let mut trimmed = &k.original[prefix.len()..];
    trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);

    if let Some(rest) = trimmed.strip_prefix('[') {
        // Array element: `[n]` supplies the integer row key.
        let pos = rest.find(']').expect("unterminated array index in flat path");
        let idx: i64 = rest[..pos].parse().expect("non-numeric array index in flat path");

        k.transpose_key = Some(IndexKey::Int(idx));
        trimmed = &rest[pos + 1..];
    } else {
        match trimmed.find('.') {
            Some(pos) if pos > 0 => {
                k.transpose_key = Some(IndexKey::Str(trimmed[..pos].to_string()));
                trimmed = &trimmed[pos..];
            }
            _ => {
                k.transpose_key = Some(IndexKey::Str(trimmed.to_string()));
                trimmed = "";
            }
        }
    }

    k.transpose_trimmed =
        if trimmed.is_empty() { "._value".to_string() } else { trimmed.to_string() };
    k.transpose_dst = Some(dst.to_string());
}

static MATCH_FIRST_CAP: Lazy<Regex> = Lazy::new(|| Regex::new("(.)([A-Z][a-z]+)").unwrap());
static MATCH_ALL_CAP: Lazy<Regex> = Lazy::new(|| Regex::new("([a-z0-9])([A-Z])").unwrap());
static MATCH_NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9A-Z\s()]+").unwrap());

/// Convert a key segment to snake_case.
pub fn to_snake_case(s: &str) -> String {
    let snake = MATCH_FIRST_CAP.replace_all(s, "${1}_${2}");
    let snake = MATCH_ALL_CAP.replace_all(&snake, "${1}_${2}");
    let snake = MATCH_NON_ALNUM.replace_all(&snake, "_");

    snake.replace("_ ", " ").trim_matches('_').to_lowercase()
}
