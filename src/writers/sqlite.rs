//! SQLite receiver.
//!
//! One table per partition with a synthetic `_seq_id` column, split into
//! `_partN` tables joined by `_seq_id` when the projection exceeds the
//! column limit. Rows are batched into transactions of 1000 inserts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::Result;
use crate::flatten::keys::FlKey;
use crate::flatten::plan::KeyNamer;
use crate::types::{Scalar, Type, Value};
use crate::writers::{Partitioner, WriteReceiver};

const ROWS_PER_TX: usize = 1000;

pub struct SqliteWriter {
    conn: Connection,
    table_name: String,
    max_cols: usize,
    namer: Arc<Mutex<KeyNamer>>,

    partitioner: Option<Partitioner>,
    /// Table groups in partition order: main first, then destinations.
    groups: Vec<TableGroup>,
    rows_tx: usize,
    in_tx: bool,
}

struct TableGroup {
    dst: Option<String>,
    parts: Vec<TablePart>,
}

struct TablePart {
    insert_sql: String,
    /// Column range of `filtered_keys` this part covers.
    start: usize,
    end: usize,
}

impl SqliteWriter {
    pub fn new(
        path: &Path,
        table_name: &str,
        max_cols: usize,
        namer: Arc<Mutex<KeyNamer>>,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;

        Ok(SqliteWriter {
            conn,
            table_name: table_name.to_string(),
            max_cols: max_cols.max(2),
            namer,
            partitioner: None,
            groups: Vec::new(),
            rows_tx: 0,
            in_tx: false,
        })
    }

    fn table(&self, dst: Option<&str>) -> String {
        match dst {
            Some(dst) => format!("{}_{}", self.table_name, dst),
            None => self.table_name.clone(),
        }
    }

    fn create_tables(&self, base: &str, keys: &[FlKey], with_pk: bool) -> Result<Vec<TablePart>> {
        // One slot per table goes to _seq_id.
        let cols_per_table = self.max_cols - 1;
        let mut parts = Vec::new();

        let chunks: Vec<&[FlKey]> = if keys.is_empty() {
            vec![&[]]
        } else {
            keys.chunks(cols_per_table).collect()
        };

        for (pi, chunk) in chunks.into_iter().enumerate() {
            let name =
                if pi == 0 { base.to_string() } else { format!("{}_part{}", base, pi + 1) };

            let mut create = format!(
                "CREATE TABLE \"{}\" (\n_seq_id INTEGER{},\n",
                quote(&name),
                if with_pk { " PRIMARY KEY" } else { "" }
            );

            for k in chunk.iter() {
                let affinity = match k.t {
                    Type::Int | Type::Bool => " INTEGER",
                    Type::Float => " REAL",
                    _ => "",
                };

                create.push_str(&format!("\"{}\"{},\n", quote(&k.replaced), affinity));
            }

            create.truncate(create.len() - 2);
            create.push_str("\n)");

            self.conn.execute(&create, [])?;

            let placeholders: Vec<&str> = std::iter::repeat("?").take(chunk.len() + 1).collect();
            let insert_sql =
                format!("INSERT INTO \"{}\" VALUES ({})", quote(&name), placeholders.join(","));

            let start = pi * cols_per_table;
            parts.push(TablePart { insert_sql, start, end: start + chunk.len() });
        }

        Ok(parts)
    }

    fn insert_row(&mut self, group_idx: usize, seq: i64, row: &[Value]) -> Result<()> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN")?;
            self.in_tx = true;
            self.rows_tx = 0;
        }

        for part in &self.groups[group_idx].parts {
            let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(self.max_cols);
            params.push(rusqlite::types::Value::Integer(seq));

            for v in &row[part.start..part.end.min(row.len())] {
                params.push(sql_value(v));
            }

            self.conn.execute(&part.insert_sql, rusqlite::params_from_iter(params))?;
            self.rows_tx += 1;
        }

        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
            self.rows_tx = 0;
        }

        Ok(())
    }
}

fn quote(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

fn sql_value(v: &Value) -> rusqlite::types::Value {
    match &v.scalar {
        Scalar::Absent | Scalar::Null => rusqlite::types::Value::Null,
        Scalar::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Scalar::Number { value, raw } => match raw.parse::<i64>() {
            Ok(i) => rusqlite::types::Value::Integer(i),
            Err(_) => rusqlite::types::Value::Real(*value),
        },
        Scalar::String(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

impl WriteReceiver for SqliteWriter {
    fn setup_keys(&mut self, keys: &[FlKey]) -> Result<()> {
        let partitioner = Partitioner::setup(keys, &self.namer);

        let main_parts =
            self.create_tables(&self.table(None), &partitioner.main.filtered_keys, true)?;
        self.groups.push(TableGroup { dst: None, parts: main_parts });

        for (dst, part) in &partitioner.transposed {
            let parts =
                self.create_tables(&self.table(Some(dst)), &part.filtered_keys, false)?;
            self.groups.push(TableGroup { dst: Some(dst.clone()), parts });
        }

        self.partitioner = Some(partitioner);
        Ok(())
    }

    fn receive_row(&mut self, seq: i64, values: &[Value]) -> Result<()> {
        let partitioner = self.partitioner.take().expect("receive_row before setup_keys");

        let mut res = Ok(());

        'groups: for gi in 0..self.groups.len() {
            let rows = match &self.groups[gi].dst {
                None => vec![partitioner.main.main_value_row(values)],
                Some(dst) => partitioner.transposed[dst].transposed_value_rows(seq, values),
            };

            for row in rows {
                if let Err(e) = self.insert_row(gi, seq, &row) {
                    res = Err(e);
                    break 'groups;
                }
            }
        }

        self.partitioner = Some(partitioner);
        res?;

        if self.rows_tx >= ROWS_PER_TX {
            self.commit()?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::keys::IndexKey;
    use crate::writers::tests::{plain_key, transposed_key};

    fn namer() -> Arc<Mutex<KeyNamer>> {
        Arc::new(Mutex::new(KeyNamer::new(std::iter::empty(), Vec::new(), false, 0, false)))
    }

    fn query_rows(path: &Path, sql: &str) -> Vec<Vec<String>> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let cols = stmt.column_count();

        let rows = stmt
            .query_map([], |row| {
                let mut out = Vec::new();
                for i in 0..cols {
                    let v: rusqlite::types::Value = row.get(i).unwrap();
                    out.push(match v {
                        rusqlite::types::Value::Null => String::new(),
                        rusqlite::types::Value::Integer(i) => i.to_string(),
                        rusqlite::types::Value::Real(f) => f.to_string(),
                        rusqlite::types::Value::Text(s) => s,
                        rusqlite::types::Value::Blob(_) => "<blob>".to_string(),
                    });
                }
                Ok(out)
            })
            .unwrap();

        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_creates_table_and_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sqlite");

        let keys = vec![plain_key(".a", Type::Int), plain_key(".b", Type::String)];

        let mut w = SqliteWriter::new(&path, "data", 2000, namer()).unwrap();
        w.setup_keys(&keys).unwrap();
        w.receive_row(1, &[Value::number(7.0, "7"), Value::string("x")]).unwrap();
        w.receive_row(2, &[Value::absent(), Value::null()]).unwrap();
        w.close().unwrap();
        drop(w);

        let rows = query_rows(&path, "SELECT _seq_id, \".a\", \".b\" FROM \"data\" ORDER BY _seq_id");
        assert_eq!(
            rows,
            vec![
                vec!["1".to_string(), "7".to_string(), "x".to_string()],
                vec!["2".to_string(), String::new(), String::new()],
            ]
        );
    }

    #[test]
    fn test_transposed_partition_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sqlite");

        let keys = vec![
            plain_key(".id", Type::Int),
            transposed_key(".items.[0].k", "items", IndexKey::Int(0), ".k", Type::String),
            transposed_key(".items.[1].k", "items", IndexKey::Int(1), ".k", Type::String),
        ];

        let mut w = SqliteWriter::new(&path, "data", 2000, namer()).unwrap();
        w.setup_keys(&keys).unwrap();
        w.receive_row(1, &[Value::number(1.0, "1"), Value::string("a"), Value::string("b")])
            .unwrap();
        w.close().unwrap();
        drop(w);

        let rows = query_rows(
            &path,
            "SELECT _seq_id, \"_sequence\", \"_index\", \".k\" FROM \"data_items\" ORDER BY \"_index\"",
        );
        assert_eq!(
            rows,
            vec![
                vec!["1".to_string(), "1".to_string(), "0".to_string(), "a".to_string()],
                vec!["1".to_string(), "1".to_string(), "1".to_string(), "b".to_string()],
            ]
        );
    }

    #[test]
    fn test_part_table_splitting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sqlite");

        // max_cols 3 → 2 data columns per table.
        let keys: Vec<FlKey> =
            (0..5).map(|i| plain_key(&format!(".c{}", i), Type::Int)).collect();

        let mut w = SqliteWriter::new(&path, "data", 3, namer()).unwrap();
        w.setup_keys(&keys).unwrap();

        let values: Vec<Value> =
            (0..5).map(|i| Value::number(i as f64, i.to_string())).collect();
        w.receive_row(1, &values).unwrap();
        w.close().unwrap();
        drop(w);

        assert_eq!(
            query_rows(&path, "SELECT \".c0\", \".c1\" FROM \"data\""),
            vec![vec!["0".to_string(), "1".to_string()]]
        );
        assert_eq!(
            query_rows(&path, "SELECT \".c2\", \".c3\" FROM \"data_part2\""),
            vec![vec!["2".to_string(), "3".to_string()]]
        );
        assert_eq!(
            query_rows(&path, "SELECT _seq_id, \".c4\" FROM \"data_part3\""),
            vec![vec!["1".to_string(), "4".to_string()]]
        );
    }
}
