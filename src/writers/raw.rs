//! Raw delimited writer.
//!
//! Column values are written as-is with a configurable delimiter and no
//! escaping; the caller picks a delimiter that does not occur in values.
//! Partitioning and sibling files work like the CSV writer, headers are
//! omitted.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{KilnError, Result};
use crate::flatten::keys::FlKey;
use crate::flatten::plan::KeyNamer;
use crate::progress::Metric;
use crate::types::Value;
use crate::writers::{transposed_file_name, FileSink, Partitioner, WriteReceiver};

pub struct RawWriter {
    path: PathBuf,
    delim: Vec<u8>,
    namer: Arc<Mutex<KeyNamer>>,

    main: Option<FileSink>,
    transposed: BTreeMap<String, FileSink>,
    partitioner: Option<Partitioner>,
    metrics: Vec<Metric>,
}

impl RawWriter {
    pub fn new(path: PathBuf, delimiter: &str, namer: Arc<Mutex<KeyNamer>>) -> Self {
        RawWriter {
            path,
            delim: delimiter.as_bytes().to_vec(),
            namer,
            main: None,
            transposed: BTreeMap::new(),
            partitioner: None,
            metrics: Vec::new(),
        }
    }

    fn write_row(sink: &mut FileSink, delim: &[u8], row: &[String]) -> Result<()> {
        let io = |e| KilnError::io("RAW row write failed", e);

        for (i, v) in row.iter().enumerate() {
            if i > 0 && !delim.is_empty() {
                sink.write_all(delim).map_err(io)?;
            }

            sink.write_all(v.as_bytes()).map_err(io)?;
        }

        sink.write_all(b"\n").map_err(io)?;
        Ok(())
    }
}

impl WriteReceiver for RawWriter {
    fn setup_keys(&mut self, keys: &[FlKey]) -> Result<()> {
        let partitioner = Partitioner::setup(keys, &self.namer);

        let main = FileSink::create(&self.path)?;
        self.metrics.extend(main.metrics());
        self.main = Some(main);

        for dst in partitioner.transposed.keys() {
            let sink = FileSink::create(&transposed_file_name(&self.path, dst))?;
            self.metrics.extend(sink.metrics());
            self.transposed.insert(dst.clone(), sink);
        }

        self.partitioner = Some(partitioner);
        Ok(())
    }

    fn receive_row(&mut self, seq: i64, values: &[Value]) -> Result<()> {
        let partitioner = self.partitioner.as_ref().expect("receive_row before setup_keys");

        let (row, all_absent) = partitioner.main.main_row(values);

        if !all_absent {
            let sink = self.main.as_mut().expect("receive_row before setup_keys");
            Self::write_row(sink, &self.delim, &row)?;
        }

        for (dst, part) in &partitioner.transposed {
            let sink = self.transposed.get_mut(dst).expect("missing transposed sink");

            for row in part.transposed_rows(seq, values) {
                Self::write_row(sink, &self.delim, &row)?;
            }
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut sink) = self.main.take() {
            sink.finish()?;
        }

        for (_, mut sink) in std::mem::take(&mut self.transposed) {
            sink.finish()?;
        }

        Ok(())
    }

    fn metrics(&self) -> Vec<Metric> {
        self.metrics.clone()
    }
}
