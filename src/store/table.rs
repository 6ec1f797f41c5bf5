use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use tracing::warn;

use super::error::StoreError;
use super::ivf;
use crate::util::{duration_millis, now_millis, now_utc_string};
use crate::vector::{decode_vector_blob, encode_vector_blob, is_placeholder};

pub const BACKING_FILE: &str = "data.sqlite";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Vector(Vec<f32>),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(value) => ToSqlOutput::from(*value),
            Value::Real(value) => ToSqlOutput::from(*value),
            Value::Text(value) => ToSqlOutput::from(value.as_str()),
            Value::Vector(values) => {
                ToSqlOutput::Owned(rusqlite::types::Value::Blob(encode_vector_blob(values)))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Vector,
}

impl ColumnType {
    fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Vector => "BLOB",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Vector => "vector",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "integer" => Some(Self::Integer),
            "real" => Some(Self::Real),
            "text" => Some(Self::Text),
            "vector" => Some(Self::Vector),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// Ordered column/value pairs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: Value) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: Value) {
        if let Some(slot) = self.values.iter_mut().find(|(name, _)| name == column) {
            slot.1 = value;
        } else {
            self.values.push((column.to_string(), value));
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Value::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(Value::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn vector(&self, column: &str) -> Option<&[f32]> {
        match self.get(column) {
            Some(Value::Vector(values)) => Some(values.as_slice()),
            _ => None,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub versions_removed: usize,
    pub versions_kept: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorIndexStats {
    pub rows: usize,
    pub partitions: usize,
}

/// One logical table: a directory holding a single SQLite backing file with
/// the rows, a version log, and any derived indexes.
pub struct Table {
    name: String,
    dir: PathBuf,
    connection: Connection,
    columns: Vec<Column>,
    key: String,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("columns", &self.columns)
            .field("key", &self.key)
            .finish()
    }
}

impl Table {
    /// Creates the table with column types inferred from `seed`. The seed row
    /// is written and then deleted, so the table starts out empty.
    pub fn create(
        dir: &Path,
        name: &str,
        key: &str,
        seed: &Row,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let columns = infer_columns(name, seed)?;
        if !columns.iter().any(|column| column.name == key) {
            return Err(StoreError::Fatal(format!(
                "key column {key} is not part of the {name} seed row"
            )));
        }

        fs::create_dir_all(dir)
            .map_err(|err| StoreError::from_io(err, &format!("create {}", dir.display())))?;
        let mut connection = Connection::open(dir.join(BACKING_FILE))
            .map_err(|err| StoreError::from_sqlite(err, name))?;
        configure_connection(&connection, busy_timeout, name)?;

        let column_ddl = columns
            .iter()
            .map(|column| format!("\"{}\" {}", column.name, column.ty.sql_type()))
            .collect::<Vec<String>>()
            .join(",\n  ");

        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, name))?;
        tx.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS _schema (
              position INTEGER PRIMARY KEY,
              name TEXT NOT NULL,
              type TEXT NOT NULL,
              is_key INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS _versions (
              version INTEGER PRIMARY KEY AUTOINCREMENT,
              operation TEXT NOT NULL,
              committed_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS _indexes (
              name TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              column_list TEXT NOT NULL,
              built_at TEXT NOT NULL,
              row_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS _ivf_centroids (
              part_id INTEGER PRIMARY KEY,
              centroid BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS _ivf_assignments (
              row_ref INTEGER PRIMARY KEY,
              part_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
              _row INTEGER PRIMARY KEY AUTOINCREMENT,
              {column_ddl},
              UNIQUE(\"{key}\")
            );

            CREATE INDEX IF NOT EXISTS idx_ivf_assignments_part ON _ivf_assignments(part_id);
            "
        ))
        .map_err(|err| StoreError::from_sqlite(err, name))?;

        tx.execute("DELETE FROM _schema", [])
            .map_err(|err| StoreError::from_sqlite(err, name))?;
        for (position, column) in columns.iter().enumerate() {
            tx.execute(
                "INSERT INTO _schema(position, name, type, is_key) VALUES(?1, ?2, ?3, ?4)",
                rusqlite::params![
                    position as i64,
                    column.name,
                    column.ty.tag(),
                    i64::from(column.name == key)
                ],
            )
            .map_err(|err| StoreError::from_sqlite(err, name))?;
        }
        record_version(&tx, "create").map_err(|err| StoreError::from_sqlite(err, name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, name))?;

        let mut table = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            connection,
            columns,
            key: key.to_string(),
        };

        let seed_key = seed
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::Fatal(format!("seed row for {name} has no key")))?;
        table.upsert(std::slice::from_ref(seed))?;
        table.delete_keys(&[seed_key])?;

        Ok(table)
    }

    pub fn open(dir: &Path, name: &str, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = dir.join(BACKING_FILE);
        if !path.is_file() {
            return Err(StoreError::missing_backing_file(name, BACKING_FILE));
        }

        let connection = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| StoreError::from_sqlite(err, name))?;
        configure_connection(&connection, busy_timeout, name)?;

        let metadata_tables: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('_schema', '_versions', 'records')",
                [],
                |row| row.get(0),
            )
            .map_err(|err| StoreError::from_sqlite(err, name))?;
        if metadata_tables != 3 {
            return Err(StoreError::Corrupted {
                table: Some(name.to_string()),
                detail: "table metadata is missing from the backing file".to_string(),
            });
        }

        let mut columns = Vec::new();
        let mut key = None;
        {
            let mut statement = connection
                .prepare("SELECT name, type, is_key FROM _schema ORDER BY position ASC")
                .map_err(|err| StoreError::from_sqlite(err, name))?;
            let mut rows = statement
                .query([])
                .map_err(|err| StoreError::from_sqlite(err, name))?;
            while let Some(row) = rows.next().map_err(|err| StoreError::from_sqlite(err, name))? {
                let column_name: String =
                    row.get(0).map_err(|err| StoreError::from_sqlite(err, name))?;
                let tag: String = row.get(1).map_err(|err| StoreError::from_sqlite(err, name))?;
                let is_key: i64 = row.get(2).map_err(|err| StoreError::from_sqlite(err, name))?;
                let ty = ColumnType::from_tag(&tag).ok_or_else(|| StoreError::Corrupted {
                    table: Some(name.to_string()),
                    detail: format!("unknown column type {tag} for {column_name}"),
                })?;
                if is_key != 0 {
                    key = Some(column_name.clone());
                }
                columns.push(Column {
                    name: column_name,
                    ty,
                });
            }
        }

        let key = key.ok_or_else(|| StoreError::Corrupted {
            table: Some(name.to_string()),
            detail: "schema has no key column".to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            connection,
            columns,
            key,
        })
    }

    #[cfg(test)]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns every column of the rows matching `filter` (an SQL predicate
    /// over column names), in insertion order unless `order_by` says otherwise.
    pub fn query(&self, filter: Option<&str>, order_by: Option<&str>) -> Result<Vec<Row>, StoreError> {
        let column_list = self
            .columns
            .iter()
            .map(|column| format!("\"{}\"", column.name))
            .collect::<Vec<String>>()
            .join(", ");
        let mut sql = format!("SELECT {column_list} FROM records");
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order_by.unwrap_or("_row ASC"));

        let mut statement = self
            .connection
            .prepare(&sql)
            .map_err(|err| self.sqlite_error(err))?;
        let mut rows = statement.query([]).map_err(|err| self.sqlite_error(err))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|err| self.sqlite_error(err))? {
            let mut decoded = Row::new();
            for (index, column) in self.columns.iter().enumerate() {
                let raw = row.get_ref(index).map_err(|err| self.sqlite_error(err))?;
                decoded.set(&column.name, self.decode_value(column, raw)?);
            }
            out.push(decoded);
        }

        Ok(out)
    }

    pub fn count(&self, filter: Option<&str>) -> Result<usize, StoreError> {
        let sql = match filter {
            Some(filter) => format!("SELECT COUNT(*) FROM records WHERE {filter}"),
            None => "SELECT COUNT(*) FROM records".to_string(),
        };
        let count: i64 = self
            .connection
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|err| self.sqlite_error(err))?;
        Ok(count.max(0) as usize)
    }

    /// Insert-or-update keyed on the table's key column, in one transaction.
    pub fn upsert(&mut self, rows: &[Row]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        for row in rows {
            self.validate_row(row)?;
        }

        let name = self.name.clone();
        let key = self.key.clone();
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        for row in rows {
            let names = row.columns().collect::<Vec<&str>>();
            let quoted = names
                .iter()
                .map(|column| format!("\"{column}\""))
                .collect::<Vec<String>>()
                .join(", ");
            let placeholders = (1..=names.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<String>>()
                .join(", ");
            let updates = names
                .iter()
                .filter(|column| **column != key)
                .map(|column| format!("\"{column}\"=excluded.\"{column}\""))
                .collect::<Vec<String>>()
                .join(", ");
            let conflict = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {updates}")
            };
            let sql = format!(
                "INSERT INTO records({quoted}) VALUES({placeholders}) ON CONFLICT(\"{key}\") {conflict}"
            );

            let mut statement = tx
                .prepare_cached(&sql)
                .map_err(|err| StoreError::from_sqlite(err, &name))?;
            statement
                .execute(rusqlite::params_from_iter(row.values()))
                .map_err(|err| StoreError::from_sqlite(err, &name))?;
        }

        record_version(&tx, "upsert").map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        Ok(rows.len())
    }

    pub fn delete_keys(&mut self, keys: &[Value]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let name = self.name.clone();
        let sql = format!("DELETE FROM records WHERE \"{}\" = ?1", self.key);
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        let mut removed = 0usize;
        for key in keys {
            removed += tx
                .execute(&sql, [key])
                .map_err(|err| StoreError::from_sqlite(err, &name))?;
        }
        record_version(&tx, "delete").map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        Ok(removed)
    }

    /// Builds (or replaces, when the column set changed) the full-text index
    /// and repopulates it from the current rows.
    pub fn build_fts_index(&mut self, columns: &[&str]) -> Result<usize, StoreError> {
        for column in columns {
            match self.column(column) {
                Some(found) if found.ty == ColumnType::Text => {}
                _ => {
                    return Err(StoreError::Fatal(format!(
                        "{column} is not a text column of {}",
                        self.name
                    )));
                }
            }
        }

        let name = self.name.clone();
        let column_list = columns.join(", ");
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT column_list FROM _indexes WHERE name = 'fts'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        if existing.as_deref() != Some(column_list.as_str()) {
            tx.execute_batch(&format!(
                "
                DROP TABLE IF EXISTS records_fts;
                CREATE VIRTUAL TABLE records_fts
                USING fts5({column_list}, content='records', content_rowid='_row');
                "
            ))
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        }

        tx.execute("INSERT INTO records_fts(records_fts) VALUES('rebuild')", [])
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        let indexed: i64 = tx
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        upsert_index_entry(&tx, "fts", "fts5", &column_list, indexed)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        record_version(&tx, "fts_index").map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        Ok(indexed.max(0) as usize)
    }

    #[cfg(test)]
    pub fn fts_match_count(&self, query: &str) -> Result<usize, StoreError> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM records_fts WHERE records_fts MATCH ?1",
                [query],
                |row| row.get(0),
            )
            .map_err(|err| self.sqlite_error(err))?;
        Ok(count.max(0) as usize)
    }

    /// Trains IVF partitions over every non-placeholder vector of length
    /// `dimensions`. Returns `None` without touching the old index when fewer
    /// than `min_rows` vectors qualify.
    pub fn build_vector_index(
        &mut self,
        column: &str,
        dimensions: usize,
        min_rows: usize,
    ) -> Result<Option<VectorIndexStats>, StoreError> {
        match self.column(column) {
            Some(found) if found.ty == ColumnType::Vector => {}
            _ => {
                return Err(StoreError::Fatal(format!(
                    "{column} is not a vector column of {}",
                    self.name
                )));
            }
        }

        let mut row_refs = Vec::<i64>::new();
        let mut vectors = Vec::<Vec<f32>>::new();
        {
            let sql = format!("SELECT _row, \"{column}\" FROM records ORDER BY _row ASC");
            let mut statement = self
                .connection
                .prepare(&sql)
                .map_err(|err| self.sqlite_error(err))?;
            let mut rows = statement.query([]).map_err(|err| self.sqlite_error(err))?;
            while let Some(row) = rows.next().map_err(|err| self.sqlite_error(err))? {
                let row_ref: i64 = row.get(0).map_err(|err| self.sqlite_error(err))?;
                let blob: Option<Vec<u8>> = row.get(1).map_err(|err| self.sqlite_error(err))?;
                let Some(values) = blob.as_deref().and_then(decode_vector_blob) else {
                    continue;
                };
                if values.len() != dimensions || is_placeholder(&values) {
                    continue;
                }
                row_refs.push(row_ref);
                vectors.push(values);
            }
        }

        if vectors.len() < min_rows.max(1) {
            return Ok(None);
        }

        let partitions = ivf::default_partition_count(vectors.len());
        let model = ivf::train(&vectors, partitions);

        let name = self.name.clone();
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.execute_batch("DELETE FROM _ivf_centroids; DELETE FROM _ivf_assignments;")
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        {
            let mut insert_centroid = tx
                .prepare("INSERT INTO _ivf_centroids(part_id, centroid) VALUES(?1, ?2)")
                .map_err(|err| StoreError::from_sqlite(err, &name))?;
            for (part_id, centroid) in model.centroids.iter().enumerate() {
                insert_centroid
                    .execute(rusqlite::params![part_id as i64, encode_vector_blob(centroid)])
                    .map_err(|err| StoreError::from_sqlite(err, &name))?;
            }

            let mut insert_assignment = tx
                .prepare("INSERT INTO _ivf_assignments(row_ref, part_id) VALUES(?1, ?2)")
                .map_err(|err| StoreError::from_sqlite(err, &name))?;
            for (row_ref, part_id) in row_refs.iter().zip(model.assignments.iter()) {
                insert_assignment
                    .execute(rusqlite::params![row_ref, *part_id as i64])
                    .map_err(|err| StoreError::from_sqlite(err, &name))?;
            }
        }
        upsert_index_entry(&tx, "vector", "ivf", column, vectors.len() as i64)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        record_version(&tx, "vector_index").map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        Ok(Some(VectorIndexStats {
            rows: vectors.len(),
            partitions: model.centroids.len(),
        }))
    }

    /// Folds the write-ahead log back into the backing file and rewrites it,
    /// dropping pages left behind by deleted rows.
    pub fn compact(&mut self) -> Result<CompactStats, StoreError> {
        let bytes_before = self.disk_usage();
        self.connection
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|err| self.sqlite_error(err))?;
        self.connection
            .execute_batch("VACUUM")
            .map_err(|err| self.sqlite_error(err))?;

        let name = self.name.clone();
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        record_version(&tx, "compact").map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        Ok(CompactStats {
            bytes_before,
            bytes_after: self.disk_usage(),
        })
    }

    /// Forgets versions committed before `now - grace` (always keeping the
    /// latest) and checkpoints passively, which never waits on or disturbs
    /// readers still holding an older snapshot.
    pub fn prune_versions(&mut self, grace: Duration) -> Result<PruneStats, StoreError> {
        let cutoff = i64::try_from(now_millis().saturating_sub(duration_millis(grace)))
            .unwrap_or(i64::MAX);
        let name = self.name.clone();

        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        let latest: i64 = tx
            .query_row("SELECT COALESCE(MAX(version), 0) FROM _versions", [], |row| {
                row.get(0)
            })
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        let removed = tx
            .execute(
                "DELETE FROM _versions WHERE committed_at_ms < ?1 AND version < ?2",
                rusqlite::params![cutoff, latest],
            )
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        let kept: i64 = tx
            .query_row("SELECT COUNT(*) FROM _versions", [], |row| row.get(0))
            .map_err(|err| StoreError::from_sqlite(err, &name))?;
        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, &name))?;

        self.connection
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
            .map_err(|err| self.sqlite_error(err))?;

        Ok(PruneStats {
            versions_removed: removed,
            versions_kept: kept.max(0) as usize,
        })
    }

    #[cfg(test)]
    pub fn version(&self) -> Result<u64, StoreError> {
        let version: i64 = self
            .connection
            .query_row("SELECT COALESCE(MAX(version), 0) FROM _versions", [], |row| {
                row.get(0)
            })
            .map_err(|err| self.sqlite_error(err))?;
        Ok(version.max(0) as u64)
    }

    fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    fn validate_row(&self, row: &Row) -> Result<(), StoreError> {
        match row.get(&self.key) {
            None | Some(Value::Null) => {
                return Err(StoreError::Fatal(format!(
                    "row for {} is missing key column {}",
                    self.name, self.key
                )));
            }
            Some(_) => {}
        }

        for column in row.columns() {
            if self.column(column).is_none() {
                return Err(StoreError::Fatal(format!(
                    "unknown column {column} for table {}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn decode_value(&self, column: &Column, raw: ValueRef<'_>) -> Result<Value, StoreError> {
        let value = match (column.ty, raw) {
            (_, ValueRef::Null) => Value::Null,
            // A ragged blob reads as an empty vector, which marks the row for
            // re-embedding instead of failing the whole scan.
            (ColumnType::Vector, ValueRef::Blob(blob)) => match decode_vector_blob(blob) {
                Some(vector) => Value::Vector(vector),
                None => {
                    warn!(
                        table = %self.name,
                        column = %column.name,
                        bytes = blob.len(),
                        "vector blob has a ragged length; treating it as missing"
                    );
                    Value::Vector(Vec::new())
                }
            },
            (_, ValueRef::Integer(value)) => Value::Integer(value),
            (_, ValueRef::Real(value)) => Value::Real(value),
            (_, ValueRef::Text(bytes)) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            (_, ValueRef::Blob(blob)) => Value::Text(String::from_utf8_lossy(blob).into_owned()),
        };
        Ok(value)
    }

    fn disk_usage(&self) -> u64 {
        ["data.sqlite", "data.sqlite-wal"]
            .iter()
            .filter_map(|file| fs::metadata(self.dir.join(file)).ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    fn sqlite_error(&self, err: rusqlite::Error) -> StoreError {
        StoreError::from_sqlite(err, &self.name)
    }
}

fn configure_connection(
    connection: &Connection,
    busy_timeout: Duration,
    table: &str,
) -> Result<(), StoreError> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| StoreError::from_sqlite(err, table))?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| StoreError::from_sqlite(err, table))?;
    connection
        .busy_timeout(busy_timeout)
        .map_err(|err| StoreError::from_sqlite(err, table))?;
    Ok(())
}

fn infer_columns(table: &str, seed: &Row) -> Result<Vec<Column>, StoreError> {
    let mut columns = Vec::new();
    for (name, value) in &seed.values {
        if !is_identifier(name) {
            return Err(StoreError::Fatal(format!(
                "invalid column name {name:?} for table {table}"
            )));
        }
        let ty = match value {
            Value::Integer(_) => ColumnType::Integer,
            Value::Real(_) => ColumnType::Real,
            Value::Text(_) => ColumnType::Text,
            Value::Vector(_) => ColumnType::Vector,
            Value::Null => {
                return Err(StoreError::Fatal(format!(
                    "cannot infer a type for {table}.{name} from a null value"
                )));
            }
        };
        columns.push(Column {
            name: name.clone(),
            ty,
        });
    }
    Ok(columns)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('_')
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '_')
}

fn record_version(tx: &Transaction<'_>, operation: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO _versions(operation, committed_at_ms) VALUES(?1, ?2)",
        rusqlite::params![operation, now_millis() as i64],
    )?;
    Ok(())
}

fn upsert_index_entry(
    tx: &Transaction<'_>,
    name: &str,
    kind: &str,
    column_list: &str,
    row_count: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "
        INSERT INTO _indexes(name, kind, column_list, built_at, row_count)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(name) DO UPDATE SET
          kind=excluded.kind,
          column_list=excluded.column_list,
          built_at=excluded.built_at,
          row_count=excluded.row_count
        ",
        rusqlite::params![name, kind, column_list, now_utc_string(), row_count],
    )?;
    Ok(())
}
