//! Depth-first JSON traversal with typed leaf callbacks.
//!
//! The walker owns no per-line state: the flat-path byte buffer and the
//! segment list are checked out by the calling worker and reused across
//! lines. Each child appends `.seg` (or `.[n]`) to the buffer, the walker
//! snapshots the length before recursing and truncates on return.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value as Json;

use crate::flatten::extract::Extract;

/// Receives traversal callbacks.
///
/// Arguments are uniform: the line sequence, the flat path bytes of the
/// current node, the byte length of its parent prefix inside `flat_path`,
/// and the path segments (empty unless the walker was asked for them).
/// The enter callbacks may return `true` to prune the subtree.
pub trait WalkSink {
    fn on_object(&mut self, seq: i64, flat_path: &[u8], pl: usize, path: &[String]) -> bool;
    fn on_array(&mut self, seq: i64, flat_path: &[u8], pl: usize, path: &[String]) -> bool;
    fn on_string(
        &mut self,
        seq: i64,
        flat_path: &[u8],
        pl: usize,
        path: &[String],
        value: &[u8],
    ) -> Option<Extract>;
    fn on_number(
        &mut self,
        seq: i64,
        flat_path: &[u8],
        pl: usize,
        path: &[String],
        value: f64,
        raw: &[u8],
    );
    fn on_bool(&mut self, seq: i64, flat_path: &[u8], pl: usize, path: &[String], value: bool);
    fn on_null(&mut self, seq: i64, flat_path: &[u8], pl: usize, path: &[String]);
}

/// Recursive-descent walker over a parsed JSON value.
#[derive(Default)]
pub struct Walker {
    /// Populate the segment list for callbacks; costs an allocation per
    /// segment, so pass 2 leaves it off.
    pub want_path: bool,
    /// Autodetect JSON bodies and URLs inside plain string values.
    pub extract_strings: bool,
    /// Subtrees emitted as a single marshaled-JSON string leaf.
    pub keep_json: HashSet<String>,
    pub keep_json_regex: Vec<Regex>,
}

impl Walker {
    /// Walk a single key instead of the whole document.
    ///
    /// Navigates `root` along `path` (object properties and `[n]` array
    /// indices) and walks only the subtree found there. Used by the
    /// single-column fast path.
    pub fn get_key<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &mut Vec<u8>,
        path: &[String],
        root: &Json,
        sink: &mut S,
    ) {
        let mut cur = root;

        for seg in path {
            let next = if let Some(idx) = array_index(seg) {
                cur.as_array().and_then(|a| a.get(idx))
            } else {
                cur.as_object().and_then(|o| o.get(seg.as_str()))
            };

            match next {
                Some(v) => cur = v,
                None => return,
            }
        }

        flat_path.clear();
        let mut pl = 0;
        for seg in path {
            pl = flat_path.len();
            flat_path.push(b'.');
            flat_path.extend_from_slice(seg.as_bytes());
        }

        let mut segments = path.to_vec();
        self.walk(seq, flat_path, pl, &mut segments, cur, sink);
    }

    /// Walk a parsed JSON value depth-first.
    ///
    /// `pl` is the byte length of the parent prefix of the current node
    /// inside `flat_path`; the root is walked with an empty buffer and 0.
    pub fn walk<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &mut Vec<u8>,
        pl: usize,
        path: &mut Vec<String>,
        v: &Json,
        sink: &mut S,
    ) {
        match v {
            Json::Object(_) => self.walk_object(seq, flat_path, pl, path, v, sink),
            Json::Array(_) => self.walk_array(seq, flat_path, pl, path, v, sink),
            Json::String(s) => self.walk_string(seq, flat_path, pl, path, s, sink),
            Json::Number(n) => {
                let raw = n.to_string();
                let value = n.as_f64().unwrap_or(0.0);
                sink.on_number(seq, flat_path, pl, path, value, raw.as_bytes());
            }
            Json::Bool(b) => sink.on_bool(seq, flat_path, pl, path, *b),
            Json::Null => sink.on_null(seq, flat_path, pl, path),
        }
    }

    fn walk_object<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &mut Vec<u8>,
        pl: usize,
        path: &mut Vec<String>,
        v: &Json,
        sink: &mut S,
    ) {
        if sink.on_object(seq, flat_path, pl, path) {
            return;
        }

        if self.emit_kept_json(seq, flat_path, pl, path, v, sink) {
            return;
        }

        let base = flat_path.len();
        let obj = v.as_object().expect("walk_object on non-object");

        for (key, child) in obj {
            flat_path.push(b'.');
            flat_path.extend_from_slice(key.as_bytes());
            if self.want_path {
                path.push(key.clone());
            }

            self.walk(seq, flat_path, base, path, child, sink);

            flat_path.truncate(base);
            if self.want_path {
                path.pop();
            }
        }
    }

    fn walk_array<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &mut Vec<u8>,
        pl: usize,
        path: &mut Vec<String>,
        v: &Json,
        sink: &mut S,
    ) {
        if sink.on_array(seq, flat_path, pl, path) {
            return;
        }

        if self.emit_kept_json(seq, flat_path, pl, path, v, sink) {
            return;
        }

        let base = flat_path.len();
        let arr = v.as_array().expect("walk_array on non-array");

        for (i, child) in arr.iter().enumerate() {
            let seg = format!("[{}]", i);

            flat_path.push(b'.');
            flat_path.extend_from_slice(seg.as_bytes());
            if self.want_path {
                path.push(seg);
            }

            self.walk(seq, flat_path, base, path, child, sink);

            flat_path.truncate(base);
            if self.want_path {
                path.pop();
            }
        }
    }

    fn walk_string<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &mut Vec<u8>,
        pl: usize,
        path: &mut Vec<String>,
        s: &str,
        sink: &mut S,
    ) {
        let extractor = sink.on_string(seq, flat_path, pl, path, s.as_bytes());

        if let Some(x) = extractor {
            if let Some(decoded) = x.extract(s.as_bytes()) {
                if let Ok(parsed) = serde_json::from_slice::<Json>(&decoded) {
                    self.walk_reinjected(seq, flat_path, path, x.name(), &parsed, sink);
                    return;
                }
            }
        }

        if !self.extract_strings || s.len() <= 2 {
            return;
        }

        // Plain string: sniff for embedded JSON or a URL. Parser failure is
        // silent and the leaf stays a string.
        let b = s.as_bytes();

        if b[0] == b'{' || b[0] == b'[' {
            if let Ok(parsed) = serde_json::from_str::<Json>(s) {
                self.walk_reinjected(seq, flat_path, path, Extract::Json.name(), &parsed, sink);
            }
            return;
        }

        if s.contains("://") {
            if let Some(decoded) = Extract::Url.extract(b) {
                if let Ok(parsed) = serde_json::from_slice::<Json>(&decoded) {
                    self.walk_reinjected(seq, flat_path, path, Extract::Url.name(), &parsed, sink);
                }
            }
        }
    }

    /// Append `.<name>` to the current leaf path and walk a decoded tree
    /// under it.
    fn walk_reinjected<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &mut Vec<u8>,
        path: &mut Vec<String>,
        name: &str,
        parsed: &Json,
        sink: &mut S,
    ) {
        let base = flat_path.len();

        flat_path.push(b'.');
        flat_path.extend_from_slice(name.as_bytes());
        if self.want_path {
            path.push(name.to_string());
        }

        self.walk(seq, flat_path, base, path, parsed, sink);

        flat_path.truncate(base);
        if self.want_path {
            path.pop();
        }
    }

    /// Emit the subtree as one marshaled-JSON string leaf when its path is
    /// in the keep-JSON set. Returns true when the subtree was consumed.
    fn emit_kept_json<S: WalkSink>(
        &self,
        seq: i64,
        flat_path: &[u8],
        pl: usize,
        path: &[String],
        v: &Json,
        sink: &mut S,
    ) -> bool {
        if self.keep_json.is_empty() && self.keep_json_regex.is_empty() {
            return false;
        }

        let Ok(p) = std::str::from_utf8(flat_path) else {
            return false;
        };

        let kept =
            self.keep_json.contains(p) || self.keep_json_regex.iter().any(|r| r.is_match(p));

        if kept {
            let buf = serde_json::to_vec(v).expect("marshaling parsed JSON cannot fail");
            sink.on_string(seq, flat_path, pl, path, &buf);
        }

        kept
    }
}

fn array_index(seg: &str) -> Option<usize> {
    seg.strip_prefix('[')?.strip_suffix(']')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        extractor_for: Option<(String, Extract)>,
        stop_on: Option<String>,
    }

    impl Recorder {
        fn p(flat_path: &[u8]) -> String {
            String::from_utf8(flat_path.to_vec()).unwrap()
        }
    }

    impl WalkSink for Recorder {
        fn on_object(&mut self, _seq: i64, flat_path: &[u8], _pl: usize, _path: &[String]) -> bool {
            let p = Self::p(flat_path);
            self.events.push(format!("obj {}", p));
            self.stop_on.as_deref() == Some(p.as_str())
        }

        fn on_array(&mut self, _seq: i64, flat_path: &[u8], _pl: usize, _path: &[String]) -> bool {
            self.events.push(format!("arr {}", Self::p(flat_path)));
            false
        }

        fn on_string(
            &mut self,
            _seq: i64,
            flat_path: &[u8],
            _pl: usize,
            _path: &[String],
            value: &[u8],
        ) -> Option<Extract> {
            let p = Self::p(flat_path);
            self.events.push(format!("str {}={}", p, String::from_utf8_lossy(value)));

            match &self.extractor_for {
                Some((path, x)) if *path == p => Some(*x),
                _ => None,
            }
        }

        fn on_number(
            &mut self,
            _seq: i64,
            flat_path: &[u8],
            _pl: usize,
            _path: &[String],
            _value: f64,
            raw: &[u8],
        ) {
            self.events
                .push(format!("num {}={}", Self::p(flat_path), String::from_utf8_lossy(raw)));
        }

        fn on_bool(&mut self, _seq: i64, flat_path: &[u8], _pl: usize, _path: &[String], value: bool) {
            self.events.push(format!("bool {}={}", Self::p(flat_path), value));
        }

        fn on_null(&mut self, _seq: i64, flat_path: &[u8], _pl: usize, _path: &[String]) {
            self.events.push(format!("null {}", Self::p(flat_path)));
        }
    }

    fn walk_doc(walker: &Walker, sink: &mut Recorder, v: &Json) {
        let mut flat_path = Vec::new();
        let mut path = Vec::new();
        walker.walk(1, &mut flat_path, 0, &mut path, v, sink);
    }

    #[test]
    fn test_walks_nested_paths_in_document_order() {
        let walker = Walker { want_path: true, ..Walker::default() };
        let mut sink = Recorder::default();

        walk_doc(&walker, &mut sink, &json!({"a": 1, "b": {"c": "x", "d": [true, null]}}));

        assert_eq!(
            sink.events,
            vec![
                "obj ",
                "num .a=1",
                "obj .b",
                "str .b.c=x",
                "arr .b.d",
                "bool .b.d.[0]=true",
                "null .b.d.[1]",
            ]
        );
    }

    #[test]
    fn test_stop_prunes_subtree() {
        let walker = Walker::default();
        let mut sink = Recorder { stop_on: Some(".b".to_string()), ..Recorder::default() };

        walk_doc(&walker, &mut sink, &json!({"a": 1, "b": {"c": 2}, "d": 3}));

        assert_eq!(sink.events, vec!["obj ", "num .a=1", "obj .b", "num .d=3"]);
    }

    #[test]
    fn test_keep_json_emits_marshaled_subtree() {
        let mut keep = HashSet::new();
        keep.insert(".b".to_string());
        let walker = Walker { keep_json: keep, ..Walker::default() };
        let mut sink = Recorder::default();

        walk_doc(&walker, &mut sink, &json!({"b": {"c": 2, "d": [1]}}));

        assert_eq!(sink.events, vec!["obj ", "obj .b", r#"str .b={"c":2,"d":[1]}"#]);
    }

    #[test]
    fn test_explicit_extractor_reinjects_under_name() {
        let walker = Walker::default();
        let mut sink = Recorder {
            extractor_for: Some((".u".to_string(), Extract::Url)),
            ..Recorder::default()
        };

        walk_doc(&walker, &mut sink, &json!({"u": "https://example.com/x/y#f"}));

        assert!(sink.events.contains(&"str .u=https://example.com/x/y#f".to_string()));
        assert!(sink.events.contains(&"str .u.URL.scheme=https".to_string()));
        assert!(sink.events.contains(&"str .u.URL.path.[0]=x".to_string()));
        assert!(sink.events.contains(&"str .u.URL.fragment=f".to_string()));
    }

    #[test]
    fn test_autodetect_json_in_string() {
        let walker = Walker { extract_strings: true, ..Walker::default() };
        let mut sink = Recorder::default();

        walk_doc(&walker, &mut sink, &json!({"x": "{\"inner\": 5}"}));

        assert!(sink.events.contains(&"num .x.JSON.inner=5".to_string()));
    }

    #[test]
    fn test_autodetect_failure_is_silent() {
        let walker = Walker { extract_strings: true, ..Walker::default() };
        let mut sink = Recorder::default();

        walk_doc(&walker, &mut sink, &json!({"x": "{not json at all"}));

        assert_eq!(sink.events, vec!["obj ", "str .x={not json at all"]);
    }

    #[test]
    fn test_get_key_navigates_directly() {
        let walker = Walker::default();
        let mut sink = Recorder::default();
        let doc = json!({"a": {"b": [10, {"c": "hit"}]}});

        let mut flat_path = Vec::new();
        let path = vec!["a".to_string(), "b".to_string(), "[1]".to_string(), "c".to_string()];
        walker.get_key(1, &mut flat_path, &path, &doc, &mut sink);

        assert_eq!(sink.events, vec!["str .a.b.[1].c=hit"]);
    }

    #[test]
    fn test_get_key_missing_path_is_noop() {
        let walker = Walker::default();
        let mut sink = Recorder::default();

        let mut flat_path = Vec::new();
        let path = vec!["nope".to_string()];
        walker.get_key(1, &mut flat_path, &path, &json!({"a": 1}), &mut sink);

        assert!(sink.events.is_empty());
    }
}
