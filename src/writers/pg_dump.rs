//! PostgreSQL dump receiver.
//!
//! Emits `CREATE TABLE` statements on setup, then buffers rows as CSV and
//! flushes them in `COPY … FROM stdin WITH (FORMAT csv)` blocks every
//! 10 000 lines, each flush followed by a `SELECT '<status>' AS status;`
//! progress marker. Tables split into `_partN` siblings at the column
//! limit.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{KilnError, Result};
use crate::flatten::keys::FlKey;
use crate::flatten::plan::KeyNamer;
use crate::progress::Metric;
use crate::types::{Type, Value};
use crate::writers::{FileSink, Partitioner, WriteReceiver};

const LINES_PER_FLUSH: usize = 10_000;

pub struct PgDumpWriter {
    sink: FileSink,
    table_name: String,
    /// Data columns per table; one more slot is used by `_seq_id`.
    max_cols: usize,
    namer: Arc<Mutex<KeyNamer>>,
    /// Keys with a configured time format become TIMESTAMP columns.
    time_keys: HashSet<String>,
    /// Total line count from pass 1, for the status markers.
    total_lines: i64,

    partitioner: Option<Partitioner>,
    copiers: BTreeMap<String, Copier>,
    lines_tx: usize,
    lines_received: i64,
    metrics: Vec<Metric>,
}

struct Copier {
    stmt: String,
    w: csv::Writer<Vec<u8>>,
}

fn csv_buffer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new().from_writer(Vec::new())
}

impl PgDumpWriter {
    pub fn new(
        path: PathBuf,
        table_name: &str,
        sql_max_cols: usize,
        namer: Arc<Mutex<KeyNamer>>,
        time_keys: HashSet<String>,
        total_lines: i64,
    ) -> Result<Self> {
        let sink = FileSink::create(&path)?;
        let metrics = sink.metrics();

        Ok(PgDumpWriter {
            sink,
            table_name: table_name.to_string(),
            max_cols: sql_max_cols.saturating_sub(1).max(1),
            namer,
            time_keys,
            total_lines,
            partitioner: None,
            copiers: BTreeMap::new(),
            lines_tx: 0,
            lines_received: 0,
            metrics,
        })
    }

    fn table(&self, dst: Option<&str>) -> String {
        match dst {
            Some(dst) => format!("{}_{}", self.table_name, dst),
            None => self.table_name.clone(),
        }
    }

    fn column_type(&self, k: &FlKey) -> &'static str {
        match k.t {
            Type::Int => " INT8",
            Type::Bool => " BOOL",
            Type::Float => " FLOAT8",
            Type::String if self.time_keys.contains(&k.original) => " TIMESTAMP",
            _ => " VARCHAR",
        }
    }

    fn create_tables(&mut self, base: &str, keys: &[FlKey], is_transposed: bool) -> Result<()> {
        let chunks: Vec<&[FlKey]> = if keys.is_empty() {
            vec![&[]]
        } else {
            keys.chunks(self.max_cols).collect()
        };

        for (pi, chunk) in chunks.into_iter().enumerate() {
            let name =
                if pi == 0 { base.to_string() } else { format!("{}_part{}", base, pi + 1) };

            let seq_constraint = if is_transposed { "" } else { " primary key" };
            let mut create = format!(
                "CREATE TABLE {} (\n\t\"_seq_id\" INT8{},\n",
                quote_ansi(&name),
                seq_constraint
            );
            let mut copy_stmt = format!("COPY {} (\"_seq_id\",", quote_ansi(&name));

            for k in chunk {
                create.push_str(&format!(
                    "\t{}{},\n",
                    quote_ansi(&k.replaced),
                    self.column_type(k)
                ));
                copy_stmt.push_str(&quote_ansi(&k.replaced));
                copy_stmt.push(',');
            }

            create.truncate(create.len() - 2);
            create.push_str("\n);\n\n");
            copy_stmt.truncate(copy_stmt.len() - 1);
            copy_stmt.push_str(") FROM stdin WITH (FORMAT csv);\n");

            self.sink
                .write_all(create.as_bytes())
                .map_err(|e| KilnError::io("failed to write CREATE TABLE", e))?;

            self.copiers.insert(name, Copier { stmt: copy_stmt, w: csv_buffer() });
        }

        Ok(())
    }

    /// Append one logical row, spilling overflow columns into part tables.
    fn insert(&mut self, seq: i64, table: &str, values: &[String]) -> Result<()> {
        let mut table_name = table.to_string();
        let mut rest = values;
        let mut part = 1;

        loop {
            let take = rest.len().min(self.max_cols);
            let copier =
                self.copiers.get_mut(&table_name).expect("insert into table without copier");

            let mut record = Vec::with_capacity(take + 1);
            record.push(seq.to_string());
            record.extend_from_slice(&rest[..take]);

            copier.w.write_record(record.iter().map(String::as_str))?;

            if rest.len() <= self.max_cols {
                return Ok(());
            }

            rest = &rest[take..];
            part += 1;
            table_name = format!("{}_part{}", table, part);
        }
    }

    fn flush(&mut self) -> Result<()> {
        let io = |e| KilnError::io("failed to write COPY block", e);

        for (_, copier) in self.copiers.iter_mut() {
            let w = std::mem::replace(&mut copier.w, csv_buffer());
            let buf = w
                .into_inner()
                .map_err(|e| KilnError::io("failed to flush COPY buffer", e.into_error()))?;

            self.sink.write_all(copier.stmt.as_bytes()).map_err(io)?;
            self.sink.write_all(&buf).map_err(io)?;
            self.sink.write_all(b"\\.\n\n").map_err(io)?;
        }

        let status = if self.total_lines != 0 {
            format!(
                "{}/{} lines completed, {:.1}%",
                self.lines_received,
                self.total_lines,
                100.0 * self.lines_received as f64 / self.total_lines as f64
            )
        } else {
            format!("{} lines completed", self.lines_received)
        };

        self.sink
            .write_all(format!("SELECT '{}' AS status;\n\n", status).as_bytes())
            .map_err(io)?;

        Ok(())
    }
}

fn quote_ansi(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl WriteReceiver for PgDumpWriter {
    fn setup_keys(&mut self, keys: &[FlKey]) -> Result<()> {
        let partitioner = Partitioner::setup(keys, &self.namer);

        let main_table = self.table(None);
        self.create_tables(&main_table, &partitioner.main.filtered_keys.clone(), false)?;

        let transposed: Vec<(String, Vec<FlKey>)> = partitioner
            .transposed
            .iter()
            .map(|(dst, p)| (dst.clone(), p.filtered_keys.clone()))
            .collect();

        for (dst, filtered) in transposed {
            let table = self.table(Some(&dst));
            self.create_tables(&table, &filtered, true)?;
        }

        self.partitioner = Some(partitioner);
        Ok(())
    }

    fn receive_row(&mut self, seq: i64, values: &[Value]) -> Result<()> {
        self.lines_tx += 1;
        self.lines_received += 1;

        let partitioner = self.partitioner.take().expect("receive_row before setup_keys");

        let mut run = || -> Result<()> {
            let (row, _) = partitioner.main.main_row(values);
            self.insert(seq, &self.table(None), &row)?;

            for (dst, part) in &partitioner.transposed {
                let table = self.table(Some(dst));

                for row in part.transposed_rows(seq, values) {
                    self.insert(seq, &table, &row)?;
                }
            }

            Ok(())
        };

        let res = run();
        self.partitioner = Some(partitioner);
        res?;

        if self.lines_tx >= LINES_PER_FLUSH {
            self.lines_tx = 0;
            self.flush()?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.sink.finish()
    }

    fn metrics(&self) -> Vec<Metric> {
        self.metrics.clone()
    }
}
