//! CSV reference writer.
//!
//! Writes the main partition to the configured file and each transposed
//! partition to a sibling `<base>_<dst><ext>` file. Headers go out on
//! setup; main rows are skipped when every cell is absent. Compression is
//! chosen by the `.gz`/`.zst` suffix.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::flatten::keys::FlKey;
use crate::flatten::plan::KeyNamer;
use crate::progress::Metric;
use crate::types::Value;
use crate::writers::{transposed_file_name, FileSink, Partitioner, WriteReceiver};

pub struct CsvWriter {
    path: PathBuf,
    namer: Arc<Mutex<KeyNamer>>,

    main: Option<csv::Writer<FileSink>>,
    transposed: BTreeMap<String, csv::Writer<FileSink>>,
    partitioner: Option<Partitioner>,
    metrics: Vec<Metric>,
}

impl CsvWriter {
    pub fn new(path: PathBuf, namer: Arc<Mutex<KeyNamer>>) -> Self {
        CsvWriter {
            path,
            namer,
            main: None,
            transposed: BTreeMap::new(),
            partitioner: None,
            metrics: Vec::new(),
        }
    }

    fn open(&mut self, path: &std::path::Path) -> Result<csv::Writer<FileSink>> {
        let sink = FileSink::create(path)?;
        self.metrics.extend(sink.metrics());

        Ok(csv::WriterBuilder::new().from_writer(sink))
    }
}

impl WriteReceiver for CsvWriter {
    fn setup_keys(&mut self, keys: &[FlKey]) -> Result<()> {
        let partitioner = Partitioner::setup(keys, &self.namer);

        let mut main = self.open(&self.path.clone())?;
        main.write_record(partitioner.main.filtered_keys.iter().map(|k| k.replaced.as_str()))?;
        self.main = Some(main);

        for (dst, part) in &partitioner.transposed {
            let path = transposed_file_name(&self.path, dst);
            let mut w = self.open(&path)?;
            w.write_record(part.filtered_keys.iter().map(|k| k.replaced.as_str()))?;
            self.transposed.insert(dst.clone(), w);
        }

        self.partitioner = Some(partitioner);
        Ok(())
    }

    fn receive_row(&mut self, seq: i64, values: &[Value]) -> Result<()> {
        let partitioner = self.partitioner.as_ref().expect("receive_row before setup_keys");

        let (row, all_absent) = partitioner.main.main_row(values);

        if !all_absent {
            self.main
                .as_mut()
                .expect("receive_row before setup_keys")
                .write_record(row.iter().map(String::as_str))?;
        }

        for (dst, part) in &partitioner.transposed {
            let w = self.transposed.get_mut(dst).expect("missing transposed writer");

            for row in part.transposed_rows(seq, values) {
                w.write_record(row.iter().map(String::as_str))?;
            }
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        use crate::error::KilnError;

        if let Some(w) = self.main.take() {
            let mut sink = w
                .into_inner()
                .map_err(|e| KilnError::io("failed to flush CSV writer", e.into_error()))?;
            sink.finish()?;
        }

        for (_, w) in std::mem::take(&mut self.transposed) {
            let mut sink = w
                .into_inner()
                .map_err(|e| KilnError::io("failed to flush CSV writer", e.into_error()))?;
            sink.finish()?;
        }

        Ok(())
    }

    fn metrics(&self) -> Vec<Metric> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::keys::IndexKey;
    use crate::types::Type;
    use crate::writers::tests::{plain_key, transposed_key};

    fn namer() -> Arc<Mutex<KeyNamer>> {
        Arc::new(Mutex::new(KeyNamer::new(std::iter::empty(), Vec::new(), false, 0, false)))
    }

    #[test]
    fn test_simple_flatten_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let keys = vec![
            plain_key(".a", Type::Int),
            plain_key(".b.c", Type::String),
            plain_key(".b.d", Type::Bool),
        ];

        let mut w = CsvWriter::new(path.clone(), namer());
        w.setup_keys(&keys).unwrap();

        w.receive_row(
            1,
            &[Value::number(1.0, "1"), Value::string("x"), Value::absent()],
        )
        .unwrap();
        w.receive_row(
            2,
            &[Value::number(2.0, "2"), Value::string("y"), Value::bool(true)],
        )
        .unwrap();
        w.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, ".a,.b.c,.b.d\n1,x,\n2,y,true\n");
    }

    #[test]
    fn test_transpose_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let keys = vec![
            plain_key(".id", Type::Int),
            transposed_key(".items.[0].k", "items", IndexKey::Int(0), ".k", Type::String),
            transposed_key(".items.[0].v", "items", IndexKey::Int(0), ".v", Type::Int),
            transposed_key(".items.[1].k", "items", IndexKey::Int(1), ".k", Type::String),
            transposed_key(".items.[1].v", "items", IndexKey::Int(1), ".v", Type::Int),
        ];

        let mut w = CsvWriter::new(path.clone(), namer());
        w.setup_keys(&keys).unwrap();
        w.receive_row(
            1,
            &[
                Value::number(1.0, "1"),
                Value::string("a"),
                Value::number(10.0, "10"),
                Value::string("b"),
                Value::number(20.0, "20"),
            ],
        )
        .unwrap();
        w.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), ".id\n1\n");

        let sibling = dir.path().join("out_items.csv");
        assert_eq!(
            std::fs::read_to_string(&sibling).unwrap(),
            "_sequence,_index,.k,.v\n1,0,a,10\n1,1,b,20\n"
        );
    }

    #[test]
    fn test_all_absent_row_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let keys = vec![plain_key(".a", Type::Int)];

        let mut w = CsvWriter::new(path.clone(), namer());
        w.setup_keys(&keys).unwrap();
        w.receive_row(1, &[Value::absent()]).unwrap();
        w.receive_row(2, &[Value::number(5.0, "5")]).unwrap();
        w.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), ".a\n5\n");
    }

    #[test]
    fn test_quoting_per_rfc4180() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let keys = vec![plain_key(".a", Type::String)];

        let mut w = CsvWriter::new(path.clone(), namer());
        w.setup_keys(&keys).unwrap();
        w.receive_row(1, &[Value::string("say \"hi\", ok")]).unwrap();
        w.close().unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            ".a\n\"say \"\"hi\"\", ok\"\n"
        );
    }

    #[test]
    fn test_gzip_output() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv.gz");

        let keys = vec![plain_key(".a", Type::Int)];

        let mut w = CsvWriter::new(path.clone(), namer());
        w.setup_keys(&keys).unwrap();
        w.receive_row(1, &[Value::number(1.0, "1")]).unwrap();
        w.close().unwrap();
        drop(w);

        let mut dec = flate2::read::GzDecoder::new(std::fs::File::open(&path).unwrap());
        let mut out = String::new();
        dec.read_to_string(&mut out).unwrap();
        assert_eq!(out, ".a\n1\n");
    }
}
