//! Two-pass orchestration.
//!
//! Pass 1 streams every input through the walker into the key registry.
//! Between passes the projection is planned and the writers are set up.
//! Pass 2 streams the inputs again, staging values into pooled per-line
//! buffers that drain to the writer fan-out strictly in sequence order.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use regex::Regex;

use crate::config::{compile_pattern, FlattenConfig, Options};
use crate::error::{KilnError, Result};
use crate::flatten::extract::Extract;
use crate::flatten::keys::{key_from_path, KeyRegistry};
use crate::flatten::plan::{build_projection, KeyNamer, Projection};
use crate::flatten::reader::{LineReader, LineSink};
use crate::flatten::walker::{WalkSink, Walker};
use crate::hash::PathHasher;
use crate::progress::{MemoryThrottle, MetricKind, Progress};
use crate::schema::{JsonSchema, KeyHierarchy};
use crate::types::{Scalar, Type, Value};
use crate::writers::csv::CsvWriter;
use crate::writers::pg_dump::PgDumpWriter;
use crate::writers::raw::RawWriter;
use crate::writers::sqlite::SqliteWriter;
use crate::writers::WriterFanout;

/// Reads JSONL inputs and feeds flat rows to the configured writers.
pub struct Processor {
    opts: Options,
    cfg: FlattenConfig,
    inputs: Vec<PathBuf>,

    registry: Arc<KeyRegistry>,
    namer: Arc<Mutex<KeyNamer>>,
    include_regex: Vec<Regex>,
    exclude_regex: Vec<Regex>,
    keep_json_regex: Vec<Regex>,
    match_prefix: Option<Regex>,

    projection: Projection,
    hierarchy: KeyHierarchy,
    total_lines: i64,

    progress: Arc<Progress>,
    errors: Arc<AtomicI64>,
    throttle: MemoryThrottle,
}

impl Processor {
    pub fn new(opts: Options, mut cfg: FlattenConfig, inputs: Vec<PathBuf>) -> Result<Self> {
        if let Some(gk) = &opts.get_key {
            cfg.include_keys.push(gk.clone());
        }

        let prefix_pattern =
            opts.match_line_prefix.clone().or_else(|| cfg.match_line_prefix.clone());
        let match_prefix = prefix_pattern
            .map(|p| {
                Regex::new(&p).map_err(|e| KilnError::Regex { pattern: p, source: e })
            })
            .transpose()?;

        let include_regex = compile_all(&cfg.include_keys_regex)?;
        let exclude_regex = compile_all(&cfg.exclude_keys_regex)?;
        let keep_json_regex = compile_all(&cfg.keep_json_regex)?;

        let mut replace_regex = Vec::new();
        for (reg, rep) in &cfg.replace_keys_regex {
            replace_regex.push((compile_pattern(reg)?, rep.clone()));
        }

        let mut extract_regex = Vec::new();
        for (reg, name) in &cfg.extract_values_regex {
            extract_regex.push((compile_pattern(reg)?, Extract::from_name(name)?));
        }

        let transpose: Vec<(String, String)> =
            cfg.transpose.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let registry = Arc::new(KeyRegistry::new(
            transpose,
            extract_regex,
            opts.case_sensitive_keys,
            opts.children_limit_object,
            opts.children_limit_array,
        ));

        let namer = Arc::new(Mutex::new(KeyNamer::new(
            cfg.replace_keys.clone().into_iter(),
            replace_regex,
            opts.replace_keys,
            opts.key_limit,
            opts.case_sensitive_keys,
        )));

        let progress = Arc::new(Progress::new(Duration::from_secs(5), opts.verbosity >= 1));
        let throttle = MemoryThrottle::start(opts.mem_limit_mb);

        Ok(Processor {
            opts,
            cfg,
            inputs,
            registry,
            namer,
            include_regex,
            exclude_regex,
            keep_json_regex,
            match_prefix,
            projection: Projection::default(),
            hierarchy: KeyHierarchy::root(),
            total_lines: 0,
            progress,
            errors: Arc::new(AtomicI64::new(0)),
            throttle,
        })
    }

    /// Run both passes and the configured diagnostics.
    pub fn process(&mut self) -> Result<()> {
        self.check_inputs()?;
        self.prepare_keys()?;
        self.write_output()?;
        self.maybe_show_keys();

        Ok(())
    }

    /// Drop empty inputs: fatal for a single input, silent with several.
    fn check_inputs(&mut self) -> Result<()> {
        let single = self.inputs.len() == 1;
        let mut kept = Vec::with_capacity(self.inputs.len());

        for path in std::mem::take(&mut self.inputs) {
            let meta = std::fs::metadata(&path).map_err(|e| {
                KilnError::io(format!("stat {}", path.display()), e)
            })?;

            if meta.len() == 0 {
                if single {
                    return Err(KilnError::EmptyInput(path.display().to_string()));
                }

                tracing::debug!(input = %path.display(), "skipping empty input");
                continue;
            }

            kept.push(path);
        }

        self.inputs = kept;
        Ok(())
    }

    /// Run pass 1 when the projection cannot be derived from literal
    /// includes alone, then plan the projection.
    fn prepare_keys(&mut self) -> Result<()> {
        if !self.include_regex.is_empty() || self.cfg.include_keys.is_empty() {
            self.scan_available_keys()?;
            self.total_lines = self.progress.lines();
        }

        self.projection = build_projection(
            &self.registry,
            &self.cfg,
            &self.opts,
            &self.include_regex,
            &self.exclude_regex,
            &self.namer,
        );

        Ok(())
    }

    fn walker(&self, want_path: bool) -> Walker {
        let mut keep_json: HashSet<String> = self.cfg.keep_json.iter().cloned().collect();
        keep_json.extend(self.registry.flagged_keep_json());

        Walker {
            want_path,
            extract_strings: self.opts.extract_strings,
            keep_json,
            keep_json_regex: self.keep_json_regex.clone(),
        }
    }

    fn line_reader(&self, max_lines: i64) -> LineReader {
        LineReader {
            concurrency: self.opts.effective_concurrency(),
            add_sequence: self.opts.add_sequence,
            max_lines,
            offset_lines: self.opts.offset_lines as i64,
            buf_size: self.opts.buf_size,
            match_prefix: self.match_prefix.clone(),
            sequence: AtomicI64::new(0),
            errors: Arc::clone(&self.errors),
            throttle: Arc::clone(&self.throttle.flag),
            progress: Arc::clone(&self.progress),
        }
    }

    fn scan_available_keys(&mut self) -> Result<()> {
        tracing::info!("scanning keys...");

        let mut max_lines = self.opts.max_lines as i64;
        let keys_clamp = self.opts.max_lines_keys as i64;
        if keys_clamp > 0 && (max_lines == 0 || keys_clamp < max_lines) {
            max_lines = keys_clamp;
        }

        self.progress.reset();
        self.progress.add_metric(
            "keys approx",
            MetricKind::Gauge,
            self.registry.total_keys_counter(),
        );
        self.progress.add_metric("errors", MetricKind::Gauge, Arc::clone(&self.errors));
        self.errors.store(0, Ordering::Relaxed);

        let reader = self.line_reader(max_lines);
        let handler = ScanHandler { registry: Arc::clone(&self.registry) };

        for input in &self.inputs {
            let task = if self.inputs.len() > 1 {
                format!("scanning keys ({})", input.display())
            } else {
                "scanning keys".to_string()
            };

            // The walker is rebuilt per input so parents flagged while
            // scanning earlier files collapse in later ones.
            let walker = self.walker(true);

            let sess = match reader.session(input, &task) {
                Ok(sess) => sess,
                Err(KilnError::EmptyInput(_)) => continue,
                Err(e) => return Err(e),
            };

            reader.read(sess, &walker, &handler, None)?;
        }

        self.registry.prepare_scanned_keys(&mut self.hierarchy);

        tracing::info!(
            lines = self.progress.lines(),
            keys = self.registry.discovered().len(),
            "scanned keys"
        );

        Ok(())
    }

    fn setup_writers(&self) -> Result<WriterFanout> {
        let mut fanout = WriterFanout::new();

        if let Some(path) = &self.opts.csv {
            let w = CsvWriter::new(path.clone(), Arc::clone(&self.namer));
            fanout.add(Box::new(w), &self.progress);
        }

        if let Some(path) = &self.opts.sqlite {
            let w = SqliteWriter::new(
                path,
                &self.opts.sql_table,
                self.opts.sql_max_cols,
                Arc::clone(&self.namer),
            )?;
            fanout.add(Box::new(w), &self.progress);
        }

        if let Some(path) = &self.opts.pg_dump {
            let time_keys: HashSet<String> = self.cfg.parse_time.keys().cloned().collect();
            let w = PgDumpWriter::new(
                path.clone(),
                &self.opts.sql_table,
                self.opts.sql_max_cols,
                Arc::clone(&self.namer),
                time_keys,
                self.total_lines,
            )?;
            fanout.add(Box::new(w), &self.progress);
        }

        if let Some(path) = &self.opts.raw {
            let w = RawWriter::new(path.clone(), &self.opts.raw_delim, Arc::clone(&self.namer));
            fanout.add(Box::new(w), &self.progress);
        }

        Ok(fanout)
    }

    /// Pass 2: flatten every line into the writers, in sequence order.
    fn write_output(&mut self) -> Result<()> {
        let mut fanout = self.setup_writers()?;

        if !fanout.has_receivers() {
            return Ok(());
        }

        tracing::info!("flattening data...");

        self.progress.reset();
        self.progress.add_metric("errors", MetricKind::Gauge, Arc::clone(&self.errors));
        self.errors.store(0, Ordering::Relaxed);

        let fanout = Arc::new(Mutex::new(fanout));

        let wi = Arc::new(self.write_iterator(Arc::clone(&fanout)));
        self.progress.add_metric(
            "rows in progress",
            MetricKind::Gauge,
            Arc::clone(&wi.in_progress),
        );

        let run = || -> Result<()> {
            fanout
                .lock()
                .expect("writer fan-out poisoned")
                .setup_keys(&self.projection.keys)?;

            let single_key = self.projection.single_key().and_then(|i| {
                let path = &self.projection.keys[i].path;
                if path.is_empty() {
                    None
                } else {
                    Some(path.clone())
                }
            });

            let reader = self.line_reader(self.opts.max_lines as i64);
            let handler = RowHandler { wi: Arc::clone(&wi) };
            let walker = self.walker(false);

            for input in &self.inputs {
                let task = if self.inputs.len() > 1 {
                    format!("flattening data ({})", input.display())
                } else {
                    "flattening data".to_string()
                };

                let sess = match reader.session(input, &task) {
                    Ok(sess) => sess,
                    Err(KilnError::EmptyInput(_)) => continue,
                    Err(e) => return Err(e),
                };

                reader.read(sess, &walker, &handler, single_key.as_deref()).map_err(|e| {
                    KilnError::Process { path: input.display().to_string(), source: Box::new(e) }
                })?;
            }

            wi.wait_pending()
        };

        let res = run();
        let close_res = fanout.lock().expect("writer fan-out poisoned").close();

        res?;
        close_res?;

        tracing::info!(lines = self.progress.lines(), "flattening done");
        Ok(())
    }

    fn write_iterator(&self, fanout: Arc<Mutex<WriterFanout>>) -> WriteIterator {
        let include_ck: HashMap<String, usize> = self
            .projection
            .include_keys
            .iter()
            .map(|(k, &i)| (self.registry.ck(k), i))
            .collect();

        let mut pk_index = HashMap::new();
        let mut pk_dst = HashMap::new();
        let mut pk_time = HashMap::new();

        self.registry.for_each(|pk, k| {
            if let Some(&i) = include_ck.get(&k.canonical) {
                pk_index.insert(pk, i);

                if let Some(dst) = &k.transpose_dst {
                    pk_dst.insert(pk, dst.clone());
                }
            }

            if let Some(f) = self.cfg.parse_time.get(&k.original) {
                pk_time.insert(pk, f.clone());
            }
        });

        let single_key_hash = self
            .projection
            .single_key()
            .map(|i| {
                let path = &self.projection.keys[i].path;
                PathHasher::new().hash(key_from_path(path).as_bytes())
            })
            .unwrap_or(0);

        WriteIterator {
            pk_index,
            pk_dst,
            pk_time,
            registry: Arc::clone(&self.registry),
            fanout,
            const_vals: self.projection.const_vals.clone(),
            concat_delimiter: self.cfg.concat_delimiter.clone(),
            field_limit: self.opts.field_limit,
            time_fmt: TimeFormatter::new(
                self.cfg.output_time_format.clone(),
                self.cfg.output_timezone.as_deref(),
            ),
            columns: self.projection.keys.len(),
            single_key_hash,
            pending: DashMap::new(),
            finished: DashMap::new(),
            seq_expected: AtomicI64::new(1),
            in_progress: Arc::new(AtomicI64::new(0)),
            pool: ArrayQueue::new(self.opts.effective_concurrency() * 2 + 4),
        }
    }

    fn maybe_show_keys(&self) {
        if self.opts.show_keys_flat {
            println!("keys:");
            for k in self.registry.discovered() {
                println!("\"{}\",", k);
            }
        }

        if self.opts.show_keys_info {
            self.show_keys_info();
        }

        if self.opts.show_keys_hier {
            let tree = self.hierarchy.hierarchy();
            let inner = tree.get(".").cloned().unwrap_or(serde_json::Value::Null);
            match serde_json::to_string_pretty(&inner) {
                Ok(s) => println!("{}", s),
                Err(e) => tracing::warn!(error = %e, "failed to render key hierarchy"),
            }
        }

        if self.opts.show_json_schema {
            let mut schema = JsonSchema::default();
            self.registry.for_each(|_, k| {
                if !k.t.is_container() {
                    schema.add_key(&k.path, k.t);
                }
            });

            match serde_json::to_string_pretty(&schema.to_value()) {
                Ok(s) => println!("{}", s),
                Err(e) => tracing::warn!(error = %e, "failed to render JSON schema"),
            }
        }
    }

    fn show_keys_info(&self) {
        println!("keys info:");

        let mark_included =
            !self.cfg.include_keys.is_empty() || !self.include_regex.is_empty();

        let mut i = 0;
        for k in &self.projection.keys {
            i += 1;

            let mut line = format!("{}, TYPE {}", k.replaced, k.t);

            if k.replaced != k.original {
                line = format!("{}, REPLACED WITH {}", k.original, line);
            }

            if mark_included && self.projection.include_keys.contains_key(&k.original) {
                line.push_str(", INCLUDED");
            }

            if let Some(dst) = &k.transpose_dst {
                line.push_str(&format!(", TRANSPOSED TO {}", dst));
            }

            if let Some(x) = k.extractor {
                line.push_str(&format!(", EXTRACTED {}", x.name()));
            }

            println!("{}: {}", i, line);
        }

        if mark_included {
            for k in self.registry.discovered() {
                if !self.projection.include_keys.contains_key(&k) {
                    i += 1;
                    println!("{}: {}, SKIPPED", i, k);
                }
            }
        }
    }

    /// Number of decode errors seen by the most recent pass.
    pub fn decode_errors(&self) -> i64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// The planned output columns; available after [`Processor::process`].
    pub fn projection_keys(&self) -> &[crate::flatten::keys::FlKey] {
        &self.projection.keys
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

/// Pass-1 sink: hash every path and feed the registry.
struct ScanSink {
    registry: Arc<KeyRegistry>,
    hasher: PathHasher,
}

impl WalkSink for ScanSink {
    fn on_object(&mut self, _seq: i64, flat_path: &[u8], pl: usize, path: &[String]) -> bool {
        if flat_path.is_empty() {
            return false;
        }

        let (pk, parent) = self.hasher.hash_parent(flat_path, pl);
        self.registry.scan_key(pk, parent, path, Type::Object, false).1
    }

    fn on_array(&mut self, _seq: i64, flat_path: &[u8], pl: usize, path: &[String]) -> bool {
        if flat_path.is_empty() {
            return false;
        }

        let (pk, parent) = self.hasher.hash_parent(flat_path, pl);
        self.registry.scan_key(pk, parent, path, Type::Array, false).1
    }

    fn on_string(
        &mut self,
        _seq: i64,
        flat_path: &[u8],
        pl: usize,
        path: &[String],
        value: &[u8],
    ) -> Option<Extract> {
        let (pk, parent) = self.hasher.hash_parent(flat_path, pl);
        self.registry.scan_key(pk, parent, path, Type::String, value.is_empty()).0
    }

    fn on_number(
        &mut self,
        _seq: i64,
        flat_path: &[u8],
        pl: usize,
        path: &[String],
        value: f64,
        _raw: &[u8],
    ) {
        let (pk, parent) = self.hasher.hash_parent(flat_path, pl);
        let is_int = value.is_finite() && value.trunc() == value;
        let t = if is_int { Type::Int } else { Type::Float };

        self.registry.scan_key(pk, parent, path, t, value == 0.0);
    }

    fn on_bool(&mut self, _seq: i64, flat_path: &[u8], pl: usize, path: &[String], value: bool) {
        let (pk, parent) = self.hasher.hash_parent(flat_path, pl);
        self.registry.scan_key(pk, parent, path, Type::Bool, !value);
    }

    fn on_null(&mut self, _seq: i64, flat_path: &[u8], pl: usize, path: &[String]) {
        let (pk, parent) = self.hasher.hash_parent(flat_path, pl);
        self.registry.scan_key(pk, parent, path, Type::Null, true);
    }
}

struct ScanHandler {
    registry: Arc<KeyRegistry>,
}

impl LineSink for ScanHandler {
    type Walk = ScanSink;

    fn walk_sink(&self) -> ScanSink {
        ScanSink { registry: Arc::clone(&self.registry), hasher: PathHasher::new() }
    }
}

/// A pooled per-line value buffer with its own hasher.
struct LineBuf {
    hasher: PathHasher,
    values: Vec<Value>,
}

/// Order-preserving completion of concurrently processed lines.
pub(crate) struct WriteIterator {
    // Read-only under concurrency.
    pk_index: HashMap<u64, usize>,
    pk_dst: HashMap<u64, String>,
    pk_time: HashMap<u64, String>,
    registry: Arc<KeyRegistry>,
    fanout: Arc<Mutex<WriterFanout>>,
    const_vals: HashMap<usize, String>,
    concat_delimiter: Option<String>,
    field_limit: usize,
    time_fmt: TimeFormatter,
    columns: usize,
    single_key_hash: u64,

    // Read-write under concurrency.
    pending: DashMap<i64, LineBuf>,
    finished: DashMap<i64, LineBuf>,
    seq_expected: AtomicI64,
    in_progress: Arc<AtomicI64>,
    pool: ArrayQueue<LineBuf>,
}

impl WriteIterator {
    fn line_started(&self, seq: i64) -> Result<()> {
        self.in_progress.fetch_add(1, Ordering::Relaxed);

        let buf = self.pool.pop().unwrap_or_else(|| LineBuf {
            hasher: PathHasher::new(),
            values: vec![Value::absent(); self.columns],
        });

        self.pending.insert(seq, buf);
        Ok(())
    }

    fn line_finished(&self, seq: i64) -> Result<()> {
        let (_, buf) =
            self.pending.remove(&seq).expect("could not find pending line to finish");
        self.finished.insert(seq, buf);

        self.check_completed()
    }

    /// Stage one value into its column slot.
    ///
    /// Returns the path hash so the string callback can look up the cached
    /// extractor without hashing twice.
    fn apply(&self, seq: i64, flat_path: &[u8], v: Value) -> u64 {
        let Some(mut buf) = self.pending.get_mut(&seq) else {
            return 0;
        };

        let pk = buf.hasher.hash(flat_path);

        if self.single_key_hash != 0 && pk != self.single_key_hash {
            return pk;
        }

        let Some(&i) = self.pk_index.get(&pk) else {
            return pk;
        };

        let mut v = v;

        if let Scalar::String(s) = &v.scalar {
            if let Some(tf) = self.pk_time.get(&pk) {
                if tf != "RAW" {
                    v.scalar = Scalar::String(self.time_fmt.reformat(tf, s));
                }
            }
        }

        v.dst = self.pk_dst.get(&pk).cloned();

        let slot = &mut buf.values[i];

        if slot.is_absent() {
            *slot = v;
            return pk;
        }

        if let Some(delim) = &self.concat_delimiter {
            if !v.is_absent() {
                *slot = Value::string(format!("{}{}{}", slot.format(), delim, v.format()));
            }
        }

        pk
    }

    fn set_string(&self, seq: i64, flat_path: &[u8], value: &[u8]) -> Option<Extract> {
        let s = truncate_utf8(value, self.field_limit);
        let pk = self.apply(seq, flat_path, Value::string(s));

        self.registry.get(pk).and_then(|k| k.extractor)
    }

    /// Drain completed lines at the watermark, dispatching in order.
    fn check_completed(&self) -> Result<()> {
        loop {
            let expected = self.seq_expected.load(Ordering::Acquire);

            let Some((seq, buf)) = self.finished.remove(&expected) else {
                return Ok(());
            };

            self.complete(seq, buf)?;
        }
    }

    fn complete(&self, seq: i64, mut buf: LineBuf) -> Result<()> {
        for (&i, v) in &self.const_vals {
            buf.values[i] = Value::string(v.clone());
        }

        let res = self
            .fanout
            .lock()
            .expect("writer fan-out poisoned")
            .receive_row(seq, &buf.values);

        self.seq_expected.fetch_add(1, Ordering::Release);

        for v in &mut buf.values {
            v.clear();
        }

        let _ = self.pool.push(buf);
        self.in_progress.fetch_add(-1, Ordering::Relaxed);

        res
    }

    /// Wait for every enqueued sequence to drain, with bounded retries.
    fn wait_pending(&self) -> Result<()> {
        let mut retries = 0;

        loop {
            let mut count = 0usize;
            let mut min = -1i64;
            let mut max = -1i64;

            for entry in self.finished.iter() {
                count += 1;
                let k = *entry.key();

                if min == -1 || k < min {
                    min = k;
                }
                if max == -1 || k > max {
                    max = k;
                }
            }

            if count == 0 {
                return Ok(());
            }

            self.check_completed()?;

            tracing::info!(
                pending = count,
                reading = self.pending.len(),
                "waiting for pending lines"
            );
            std::thread::sleep(Duration::from_secs(1));

            retries += 1;
            if retries > 10 {
                return Err(KilnError::Stall {
                    count,
                    min,
                    max,
                    expected: self.seq_expected.load(Ordering::Relaxed),
                    in_progress: self.pending.len(),
                });
            }
        }
    }
}

/// Right-truncate to a byte limit without splitting a character.
fn truncate_utf8(value: &[u8], limit: usize) -> String {
    let s = String::from_utf8_lossy(value);

    if limit == 0 || s.len() <= limit {
        return s.into_owned();
    }

    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }

    s[..cut].to_string()
}

struct RowSink {
    wi: Arc<WriteIterator>,
}

impl WalkSink for RowSink {
    fn on_object(&mut self, _seq: i64, _flat_path: &[u8], _pl: usize, _path: &[String]) -> bool {
        false
    }

    fn on_array(&mut self, _seq: i64, _flat_path: &[u8], _pl: usize, _path: &[String]) -> bool {
        false
    }

    fn on_string(
        &mut self,
        seq: i64,
        flat_path: &[u8],
        _pl: usize,
        _path: &[String],
        value: &[u8],
    ) -> Option<Extract> {
        self.wi.set_string(seq, flat_path, value)
    }

    fn on_number(
        &mut self,
        seq: i64,
        flat_path: &[u8],
        _pl: usize,
        _path: &[String],
        value: f64,
        raw: &[u8],
    ) {
        let raw = String::from_utf8_lossy(raw).into_owned();
        self.wi.apply(seq, flat_path, Value::number(value, raw));
    }

    fn on_bool(&mut self, seq: i64, flat_path: &[u8], _pl: usize, _path: &[String], value: bool) {
        self.wi.apply(seq, flat_path, Value::bool(value));
    }

    fn on_null(&mut self, seq: i64, flat_path: &[u8], _pl: usize, _path: &[String]) {
        self.wi.apply(seq, flat_path, Value::null());
    }
}

struct RowHandler {
    wi: Arc<WriteIterator>,
}

impl LineSink for RowHandler {
    type Walk = RowSink;

    fn walk_sink(&self) -> RowSink {
        RowSink { wi: Arc::clone(&self.wi) }
    }

    fn line_started(&self, seq: i64, _n: i64) -> Result<()> {
        self.wi.line_started(seq)
    }

    fn line_finished(&self, seq: i64, _n: i64) -> Result<()> {
        self.wi.line_finished(seq)
    }
}

/// Reparses configured time strings and renders them in the output format
/// and timezone.
struct TimeFormatter {
    out_fmt: String,
    out_tz: Option<FixedOffset>,
}

impl TimeFormatter {
    fn new(out_fmt: Option<String>, out_tz: Option<&str>) -> Self {
        let out_fmt = out_fmt.unwrap_or_else(|| "%Y-%m-%dT%H:%M:%S%:z".to_string());

        let out_tz = out_tz.and_then(|s| match parse_timezone(s) {
            Some(tz) => Some(tz),
            None => {
                tracing::warn!(timezone = s, "failed to load timezone");
                None
            }
        });

        TimeFormatter { out_fmt, out_tz }
    }

    fn reformat(&self, fmt: &str, s: &str) -> String {
        let fallback_tz =
            self.out_tz.unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));

        let parsed: std::result::Result<DateTime<FixedOffset>, chrono::ParseError> =
            DateTime::parse_from_str(s, fmt).or_else(|zoned_err| {
                NaiveDateTime::parse_from_str(s, fmt)
                    .or_else(|_| {
                        NaiveDate::parse_from_str(s, fmt)
                            .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight"))
                    })
                    .map(|naive| {
                        fallback_tz
                            .from_local_datetime(&naive)
                            .single()
                            .expect("fixed offset is unambiguous")
                    })
                    .map_err(|_| zoned_err)
            });

        match parsed {
            Ok(dt) => {
                let dt = match self.out_tz {
                    Some(tz) => dt.with_timezone(&tz),
                    None => dt,
                };

                dt.format(&self.out_fmt).to_string()
            }
            Err(e) => format!("failed to parse time {}: {}", s, e),
        }
    }
}

fn parse_timezone(s: &str) -> Option<FixedOffset> {
    match s {
        "UTC" | "utc" => FixedOffset::east_opt(0),
        "Local" => Some(*chrono::Local::now().offset()),
        other => other.parse::<FixedOffset>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_input(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn run_csv(
        dir: &Path,
        input: &str,
        mut opts: Options,
        cfg: FlattenConfig,
    ) -> (String, PathBuf) {
        let in_path = write_input(dir, "in.jsonl", input);
        let out_path = dir.join("out.csv");
        opts.csv = Some(out_path.clone());
        opts.verbosity = 0;
        // Deterministic discovery order unless a test asks for more workers.
        if opts.concurrency == 0 {
            opts.concurrency = 1;
        }

        let mut p = Processor::new(opts, cfg, vec![in_path]).unwrap();
        p.process().unwrap();

        (std::fs::read_to_string(&out_path).unwrap(), out_path)
    }

    #[test]
    fn test_simple_flatten() {
        let dir = tempfile::tempdir().unwrap();

        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":1,\"b\":{\"c\":\"x\"}}\n{\"a\":2,\"b\":{\"c\":\"y\",\"d\":true}}\n",
            Options::default(),
            FlattenConfig::default(),
        );

        assert_eq!(csv, ".a,.b.c,.b.d\n1,x,\n2,y,true\n");
    }

    #[test]
    fn test_simple_flatten_concurrency_preserves_order() {
        let dir = tempfile::tempdir().unwrap();

        let mut input = String::new();
        for i in 1..=200 {
            input.push_str(&format!("{{\"n\":{}}}\n", i));
        }

        let opts = Options { add_sequence: true, concurrency: 8, ..Options::default() };
        let (csv, _) = run_csv(dir.path(), &input, opts, FlattenConfig::default());

        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("._sequence,.n"));

        for (i, line) in lines.enumerate() {
            let seq = i as i64 + 1;
            assert_eq!(line, format!("{},{}", seq, seq));
        }
    }

    #[test]
    fn test_transpose_array_of_objects() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            transpose: [(".items".to_string(), "items".to_string())].into_iter().collect(),
            ..FlattenConfig::default()
        };

        let (csv, out_path) = run_csv(
            dir.path(),
            "{\"id\":1,\"items\":[{\"k\":\"a\",\"v\":10},{\"k\":\"b\",\"v\":20}]}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, ".id\n1\n");

        let sibling = out_path.parent().unwrap().join("out_items.csv");
        assert_eq!(
            std::fs::read_to_string(sibling).unwrap(),
            "_sequence,_index,.k,.v\n1,0,a,10\n1,1,b,20\n"
        );
    }

    #[test]
    fn test_transpose_object_keys() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            transpose: [(".tokens".to_string(), "tokens".to_string())].into_iter().collect(),
            ..FlattenConfig::default()
        };

        let (csv, out_path) = run_csv(
            dir.path(),
            "{\"id\":1,\"tokens\":{\"foo\":{\"a\":1,\"b\":2}}}\n{\"id\":2,\"tokens\":{\"bar\":{\"a\":3,\"b\":4}}}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, ".id\n1\n2\n");

        let sibling = out_path.parent().unwrap().join("out_tokens.csv");
        assert_eq!(
            std::fs::read_to_string(sibling).unwrap(),
            "_sequence,_index,.a,.b\n1,foo,1,2\n2,bar,3,4\n"
        );
    }

    #[test]
    fn test_concat_delimiter() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            concat_delimiter: Some("::".to_string()),
            replace_keys: [
                (".a".to_string(), "shared".to_string()),
                (".b".to_string(), "shared".to_string()),
            ]
            .into_iter()
            .collect(),
            ..FlattenConfig::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":\"x\",\"b\":\"y\"}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, "shared\nx::y\n");
    }

    #[test]
    fn test_prefix_capture_with_sequence() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options {
            add_sequence: true,
            match_line_prefix: Some(r"^(\w+) (\d+) ".to_string()),
            ..Options::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "host42 7 {\"ok\":true}\n",
            opts,
            FlattenConfig::default(),
        );

        assert_eq!(
            csv,
            "._sequence,._prefix.[0],._prefix.[1],.ok\n1,host42,7,true\n"
        );
    }

    #[test]
    fn test_high_cardinality_collapse() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options {
            children_limit_object: 3,
            children_limit_array: 3,
            ..Options::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "{\"m\":{\"k1\":1,\"k2\":2,\"k3\":3,\"k4\":4}}\n",
            opts,
            FlattenConfig::default(),
        );

        assert_eq!(csv, ".m\n\"{\"\"k1\"\":1,\"\"k2\"\":2,\"\"k3\"\":3,\"\"k4\"\":4}\"\n");
    }

    #[test]
    fn test_skip_zero_cols() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options { skip_zero_cols: true, ..Options::default() };
        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":0,\"b\":1}\n{\"a\":0,\"b\":2}\n",
            opts,
            FlattenConfig::default(),
        );

        assert_eq!(csv, ".b\n1\n2\n");
    }

    #[test]
    fn test_const_columns() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            include_keys: vec![
                ".a".to_string(),
                "const:bar".to_string(),
                ".foo".to_string(),
            ],
            replace_keys: [("const:bar".to_string(), "bar_name".to_string())]
                .into_iter()
                .collect(),
            ..FlattenConfig::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":1,\"foo\":true}\n{\"a\":\"b\",\"foo\":false}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, ".a,bar_name,.foo\n1,bar,true\nb,bar,false\n");
    }

    #[test]
    fn test_case_insensitive_collapse() {
        let dir = tempfile::tempdir().unwrap();

        let (csv, _) = run_csv(
            dir.path(),
            "{\"Foo\":{\"Bar\":1}}\n{\"foo\":{\"bar\":\"x\"}}\n",
            Options::default(),
            FlattenConfig::default(),
        );

        // Both spellings land in the first-seen column.
        assert_eq!(csv, ".Foo.Bar\n1\nx\n");
    }

    #[test]
    fn test_replace_keys_snake_tail() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options { replace_keys: true, ..Options::default() };
        let (csv, _) = run_csv(
            dir.path(),
            "{\"user\":{\"FirstName\":\"a\"},\"owner\":{\"FirstName\":\"b\"}}\n",
            opts,
            FlattenConfig::default(),
        );

        assert_eq!(csv, "first_name,owner_first_name\na,b\n");
    }

    #[test]
    fn test_parse_time_reformat() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            parse_time: [(".ts".to_string(), "%d/%m/%Y %H:%M:%S".to_string())]
                .into_iter()
                .collect(),
            output_time_format: Some("%Y-%m-%d %H:%M:%S".to_string()),
            ..FlattenConfig::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "{\"ts\":\"24/06/2022 14:13:36\"}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, ".ts\n2022-06-24 14:13:36\n");
    }

    #[test]
    fn test_extract_strings_autodetect() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options { extract_strings: true, ..Options::default() };
        let (csv, _) = run_csv(
            dir.path(),
            "{\"payload\":\"{\\\"inner\\\":5}\"}\n",
            opts,
            FlattenConfig::default(),
        );

        // The raw string column stays alongside the extracted tree.
        assert_eq!(csv, ".payload,.payload.JSON.inner\n\"{\"\"inner\"\":5}\",5\n");
    }

    #[test]
    fn test_get_key_single_column() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options { get_key: Some(".b.c".to_string()), ..Options::default() };
        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":1,\"b\":{\"c\":\"x\"}}\n{\"a\":2,\"b\":{\"c\":\"y\"}}\n",
            opts,
            FlattenConfig::default(),
        );

        assert_eq!(csv, ".b.c\nx\ny\n");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();

        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":1}\ngarbage\n{\"a\":3}\n",
            Options::default(),
            FlattenConfig::default(),
        );

        assert_eq!(csv, ".a\n1\n3\n");
    }

    #[test]
    fn test_field_limit_truncates() {
        let dir = tempfile::tempdir().unwrap();

        let opts = Options { field_limit: 3, ..Options::default() };
        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":\"abcdef\"}\n",
            opts,
            FlattenConfig::default(),
        );

        assert_eq!(csv, ".a\nabc\n");
    }

    #[test]
    fn test_empty_single_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let in_path = write_input(dir.path(), "in.jsonl", "");

        let opts =
            Options { csv: Some(dir.path().join("out.csv")), verbosity: 0, ..Options::default() };
        let mut p = Processor::new(opts, FlattenConfig::default(), vec![in_path]).unwrap();

        match p.process() {
            Err(KilnError::EmptyInput(_)) => {}
            other => panic!("expected EmptyInput, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_multiple_inputs_skip_empty() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_input(dir.path(), "a.jsonl", "{\"x\":1}\n");
        let b = write_input(dir.path(), "b.jsonl", "");

        let out = dir.path().join("out.csv");
        let opts = Options { csv: Some(out.clone()), verbosity: 0, ..Options::default() };
        let mut p = Processor::new(opts, FlattenConfig::default(), vec![a, b]).unwrap();
        p.process().unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), ".x\n1\n");
    }

    #[test]
    fn test_include_only_mode_skips_scan_pass() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            include_keys: vec![".b".to_string(), ".a".to_string()],
            ..FlattenConfig::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "{\"a\":1,\"b\":2,\"c\":3}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, ".b,.a\n2,1\n");
    }

    #[test]
    fn test_keep_json_subtree() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = FlattenConfig {
            keep_json: vec![".meta".to_string()],
            ..FlattenConfig::default()
        };

        let (csv, _) = run_csv(
            dir.path(),
            "{\"meta\":{\"a\":1},\"x\":2}\n",
            Options::default(),
            cfg,
        );

        assert_eq!(csv, ".meta,.x\n\"{\"\"a\"\":1}\",2\n");
    }

    #[test]
    fn test_timeformatter_failure_text() {
        let tf = TimeFormatter::new(None, None);
        let out = tf.reformat("%Y-%m-%d", "not a date");
        assert!(out.starts_with("failed to parse time not a date"));
    }

    #[test]
    fn test_timeformatter_output_timezone() {
        let tf = TimeFormatter::new(Some("%H:%M".to_string()), Some("+02:00"));
        let out = tf.reformat("%Y-%m-%dT%H:%M:%S%z", "2022-06-24T12:00:00+0000");
        assert_eq!(out, "14:00");
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        assert_eq!(truncate_utf8("héllo".as_bytes(), 2), "h");
        assert_eq!(truncate_utf8(b"plain", 0), "plain");
        assert_eq!(truncate_utf8(b"plain", 10), "plain");
    }
}
