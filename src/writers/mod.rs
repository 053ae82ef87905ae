//! Output receivers and their shared plumbing.
//!
//! Every backend satisfies [`WriteReceiver`]; the fan-out dispatches each
//! completed row to all of them and joins their failures. The partitioning
//! base splits the projection by transpose destination the same way for
//! every backend: the main partition holds non-transposed columns, each
//! transposed partition gets the synthetic `_sequence`/`_index` columns
//! followed by its trimmed keys, and one input row expands to one output
//! row per distinct transpose key.

pub mod csv;
pub mod pg_dump;
pub mod raw;
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{KilnError, Result};
use crate::flatten::keys::FlKey;
use crate::flatten::plan::KeyNamer;
use crate::progress::{CountingWriter, Metric, MetricKind, Progress};
use crate::types::{Type, Value};

/// A row consumer.
pub trait WriteReceiver: Send {
    fn setup_keys(&mut self, keys: &[FlKey]) -> Result<()>;
    fn receive_row(&mut self, seq: i64, values: &[Value]) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Byte counters surfaced as progress metrics.
    fn metrics(&self) -> Vec<Metric> {
        Vec::new()
    }
}

/// Dispatches rows to every configured receiver.
#[derive(Default)]
pub struct WriterFanout {
    receivers: Vec<Box<dyn WriteReceiver>>,
}

impl WriterFanout {
    pub fn new() -> Self {
        WriterFanout::default()
    }

    pub fn add(&mut self, receiver: Box<dyn WriteReceiver>, progress: &Progress) {
        for m in receiver.metrics() {
            progress.add_metric(m.name, m.kind, m.value);
        }

        self.receivers.push(receiver);
    }

    pub fn has_receivers(&self) -> bool {
        !self.receivers.is_empty()
    }

    pub fn setup_keys(&mut self, keys: &[FlKey]) -> Result<()> {
        join_errors(self.receivers.iter_mut().map(|r| r.setup_keys(keys)))
    }

    pub fn receive_row(&mut self, seq: i64, values: &[Value]) -> Result<()> {
        join_errors(self.receivers.iter_mut().map(|r| r.receive_row(seq, values)))
    }

    pub fn close(&mut self) -> Result<()> {
        join_errors(self.receivers.iter_mut().map(|r| r.close()))
    }
}

fn join_errors(results: impl Iterator<Item = Result<()>>) -> Result<()> {
    let errs: Vec<String> = results.filter_map(|r| r.err().map(|e| e.to_string())).collect();

    if errs.is_empty() {
        Ok(())
    } else {
        Err(KilnError::Receivers(errs.join(", ")))
    }
}

/// One output table: the main projection or a transposed destination.
pub(crate) struct Partition {
    pub keys: Vec<FlKey>,
    /// Indexes of this partition's columns in the incoming value row.
    pub key_indexes: Vec<usize>,
    /// Reduced key list of this partition, in column order.
    pub filtered_keys: Vec<FlKey>,
    /// Type of the transpose index: int for arrays, string for objects.
    pub index_type: Type,
    pub is_transposed: bool,
    /// Trimmed column path to (column index, key record).
    trimmed_keys: HashMap<String, (usize, FlKey)>,
    /// Original key index to trimmed column index.
    transposed_mapping: HashMap<usize, usize>,
}

impl Partition {
    fn new(keys: &[FlKey], is_transposed: bool) -> Self {
        Partition {
            keys: keys.to_vec(),
            key_indexes: Vec::new(),
            filtered_keys: Vec::new(),
            index_type: Type::Int,
            is_transposed,
            trimmed_keys: HashMap::new(),
            transposed_mapping: HashMap::new(),
        }
    }

    fn init_filtered_keys(&mut self) {
        if !self.is_transposed {
            self.filtered_keys = self.key_indexes.iter().map(|&i| self.keys[i].clone()).collect();
            return;
        }

        self.filtered_keys = vec![FlKey::default(); self.trimmed_keys.len()];
        for (idx, k) in self.trimmed_keys.values() {
            self.filtered_keys[*idx] = k.clone();
        }

        self.filtered_keys[0].t = Type::Int;
        self.filtered_keys[1].t = self.index_type;

        for (&orig, &trimmed) in &self.transposed_mapping {
            let merged = self.filtered_keys[trimmed].t.merge(self.keys[orig].t);
            self.filtered_keys[trimmed].t = merged;
        }
    }

    /// Format the main-table row. The flag reports whether every cell was
    /// absent, letting writers drop rows that carry nothing.
    pub fn main_row(&self, values: &[Value]) -> (Vec<String>, bool) {
        let mut row = Vec::with_capacity(self.key_indexes.len());
        let mut all_absent = true;

        for &i in &self.key_indexes {
            let v = &values[i];

            if !v.is_absent() {
                all_absent = false;
            }

            row.push(format_cell(v));
        }

        (row, all_absent)
    }

    /// Bucket this partition's values by transpose key; one output row per
    /// bucket, led by the parent sequence and the bucket's index.
    pub fn transposed_rows(&self, seq: i64, values: &[Value]) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for &i in &self.key_indexes {
            let v = &values[i];

            if v.is_absent() {
                continue;
            }

            let k = &self.keys[i];
            let transpose_key =
                k.transpose_key.as_ref().map(|tk| tk.render()).unwrap_or_default();

            let row_idx = *by_key.entry(transpose_key.clone()).or_insert_with(|| {
                let mut row = vec![String::new(); self.trimmed_keys.len()];
                row[0] = seq.to_string();
                row[1] = transpose_key;
                rows.push(row);
                rows.len() - 1
            });

            rows[row_idx][self.transposed_mapping[&i]] = format_cell(v);
        }

        rows
    }

    /// Same bucketing with typed values, for SQL backends.
    pub fn transposed_value_rows(&self, seq: i64, values: &[Value]) -> Vec<Vec<Value>> {
        let mut rows: Vec<Vec<Value>> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for &i in &self.key_indexes {
            let v = &values[i];

            if v.is_absent() {
                continue;
            }

            let k = &self.keys[i];
            let transpose_key =
                k.transpose_key.as_ref().map(|tk| tk.render()).unwrap_or_default();

            let row_idx = *by_key.entry(transpose_key.clone()).or_insert_with(|| {
                let mut row = vec![Value::absent(); self.trimmed_keys.len()];
                row[0] = Value::number(seq as f64, seq.to_string());
                row[1] = k.transpose_key.as_ref().map(|tk| tk.as_value()).unwrap_or_default();
                rows.push(row);
                rows.len() - 1
            });

            rows[row_idx][self.transposed_mapping[&i]] = v.clone();
        }

        rows
    }

    /// Project the typed main-table row.
    pub fn main_value_row(&self, values: &[Value]) -> Vec<Value> {
        self.key_indexes.iter().map(|&i| values[i].clone()).collect()
    }
}

fn format_cell(v: &Value) -> String {
    match v.ty() {
        Type::Null | Type::Absent => String::new(),
        _ => v.format(),
    }
}

/// The projection split by transpose destination.
pub(crate) struct Partitioner {
    pub main: Partition,
    pub transposed: BTreeMap<String, Partition>,
}

impl Partitioner {
    pub fn setup(keys: &[FlKey], namer: &Mutex<KeyNamer>) -> Self {
        let mut namer = namer.lock().expect("key namer poisoned");
        let mut main = Partition::new(keys, false);
        let mut transposed: BTreeMap<String, Partition> = BTreeMap::new();

        for (i, key) in keys.iter().enumerate() {
            let Some(dst) = &key.transpose_dst else {
                main.key_indexes.push(i);
                continue;
            };

            let tw = transposed
                .entry(dst.clone())
                .or_insert_with(|| transposed_partition(keys, &mut namer));

            tw.key_indexes.push(i);
            if let Some(tk) = &key.transpose_key {
                tw.index_type = tk.ty();
            }

            let next = tw.trimmed_keys.len();
            let entry = tw.trimmed_keys.entry(key.transpose_trimmed.clone()).or_insert_with(|| {
                let mut k = key.clone();
                k.replaced = namer.prepare_key(&key.transpose_trimmed, next);
                (next, k)
            });

            tw.transposed_mapping.insert(i, entry.0);
        }

        main.init_filtered_keys();
        for tw in transposed.values_mut() {
            tw.init_filtered_keys();
        }

        Partitioner { main, transposed }
    }
}

fn transposed_partition(keys: &[FlKey], namer: &mut KeyNamer) -> Partition {
    let mut t = Partition::new(keys, true);

    t.trimmed_keys.insert(
        "._sequence".to_string(),
        (0, synthetic_key(namer, "._sequence", "_sequence", 0)),
    );
    t.trimmed_keys
        .insert("._index".to_string(), (1, synthetic_key(namer, "._index", "_index", 1)));

    t
}

/// Synthetic partition columns render as `_sequence`/`_index` unless a
/// rename rule claims them.
fn synthetic_key(namer: &mut KeyNamer, original: &str, default: &str, idx: usize) -> FlKey {
    let replaced = namer.prepare_key(original, idx);
    let replaced = if replaced == original { default.to_string() } else { replaced };

    FlKey { original: original.to_string(), replaced, ..FlKey::default() }
}

/// Derive the sibling file name for a transposed partition:
/// `out.csv` + `items` → `out_items.csv`.
pub(crate) fn transposed_file_name(base: &Path, dst: &str) -> PathBuf {
    let ext = base.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or_default();

    let mut name = format!("{}_{}", stem, dst);
    if !ext.is_empty() {
        name.push('.');
        name.push_str(ext);
    }

    base.with_file_name(name)
}

/// Output file with optional gz/zst compression chosen by suffix, counting
/// bytes before and after compression.
pub(crate) struct FileSink {
    w: Option<CountingWriter<Box<dyn Write + Send>>>,
    name: String,
    uncompressed: Arc<AtomicI64>,
    compressed: Option<Arc<AtomicI64>>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let file = std::fs::File::create(path)
            .map_err(|e| KilnError::io(format!("failed to create file {}", name), e))?;

        let low = name.to_lowercase();
        let (inner, compressed): (Box<dyn Write + Send>, Option<Arc<AtomicI64>>) =
            if low.ends_with(".gz") {
                let cw = CountingWriter::new(file);
                let bytes = cw.bytes();
                (Box::new(GzEncoder::new(cw, Compression::default())), Some(bytes))
            } else if low.ends_with(".zst") {
                let cw = CountingWriter::new(file);
                let bytes = cw.bytes();
                let enc = zstd::stream::write::Encoder::new(cw, 1)
                    .map_err(|e| KilnError::io(format!("failed to init zstd writer {}", name), e))?;
                (Box::new(enc.auto_finish()), Some(bytes))
            } else {
                (Box::new(file), None)
            };

        let outer = CountingWriter::new(inner);
        let uncompressed = outer.bytes();

        Ok(FileSink { w: Some(outer), name, uncompressed, compressed })
    }

    pub fn metrics(&self) -> Vec<Metric> {
        let base = Path::new(&self.name)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone());

        let mut out = vec![Metric {
            name: base.clone(),
            kind: MetricKind::Bytes,
            value: Arc::clone(&self.uncompressed),
        }];

        if let Some(c) = &self.compressed {
            out.push(Metric {
                name: format!("{} (comp)", base),
                kind: MetricKind::Bytes,
                value: Arc::clone(c),
            });
        }

        out
    }

    /// Flush and release the writer; compression trailers are written when
    /// the encoder drops.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut w) = self.w.take() {
            w.flush()
                .map_err(|e| KilnError::io(format!("failed to flush file {}", self.name), e))?;
        }

        Ok(())
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.w {
            Some(w) => w.write(buf),
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.w {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}
