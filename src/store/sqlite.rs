// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational store adapter backed by SQLite.
//!
//! Translates operation records into parameterised statements built from the
//! record's field map:
//!
//! ```text
//! Insert {id, name, price}      → INSERT INTO "products" ("id", "name", "price") VALUES (?, ?, ?)
//! Update filter={id} set={qty}  → UPDATE "carts" SET "qty" = ? WHERE "id" = ? AND NOT ("qty" IS ?)
//! Delete filter={id}            → DELETE FROM "products" WHERE rowid IN (SELECT rowid ... LIMIT 1)
//! ```
//!
//! Every record applies inside one SQLite transaction, so multi-row updates and
//! deletes are all-or-nothing.
//!
//! # Schema
//!
//! With auto-schema enabled (the default) unknown tables are created on first
//! insert with an untyped `id` primary key, and unknown columns are added with
//! `ALTER TABLE`. Columns carry no declared type, so integers, reals and text
//! round-trip as written, and text always reads back as a string. Values with
//! no SQLite storage class of their own (booleans, integers above `i64::MAX`,
//! arrays, objects) are stored as a BLOB of JSON behind a one-byte tag. SQL
//! NULL reads back as an absent field.
//!
//! # SQLite Busy Handling
//!
//! Auto-commit applies retry SQLITE_BUSY/SQLITE_LOCKED with exponential
//! backoff. Inside an explicit transaction the error is returned instead.

use super::{BoxFuture, StoreAdapter, StoreTransaction};
use crate::error::ApplyError;
use crate::record::{id_key, new_id, ApplyOutcome, Document, Filter, OperationRecord, Payload, ID_FIELD};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
    SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row, Transaction, TypeInfo, ValueRef};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Leading byte of a BLOB that holds a JSON value.
const JSON_BLOB_TAG: u8 = 0x00;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Failure inside one apply: a SQL error (maybe retryable) or a rejection.
#[derive(Debug)]
enum Failure {
    Sql(sqlx::Error),
    Rejected(ApplyError),
}

impl From<sqlx::Error> for Failure {
    fn from(e: sqlx::Error) -> Self {
        Failure::Sql(e)
    }
}

impl From<ApplyError> for Failure {
    fn from(e: ApplyError) -> Self {
        Failure::Rejected(e)
    }
}

impl Failure {
    fn into_apply_error(self, store: &str) -> ApplyError {
        match self {
            Failure::Rejected(e) => e,
            Failure::Sql(e) => classify(store, e),
        }
    }
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Map a SQL error onto the store-local taxonomy.
fn classify(store: &str, e: sqlx::Error) -> ApplyError {
    match &e {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_lowercase();
            if msg.contains("no such column")
                || msg.contains("no such table")
                || msg.contains("syntax error")
                || msg.contains("has no column")
            {
                ApplyError::Malformed(db_err.message().to_string())
            } else {
                ApplyError::transaction(store, e)
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            ApplyError::Malformed(e.to_string())
        }
        _ => ApplyError::connection(store, e),
    }
}

/// Execute an operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T, Failure>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Failure>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(Failure::Sql(e)) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Relational store over a SQLite pool.
pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
    auto_schema: bool,
}

impl SqliteStore {
    /// Open (or create) a database from a URL such as `sqlite://replica.db`
    /// or `sqlite::memory:`.
    pub async fn connect(name: impl Into<String>, url: &str) -> Result<Self, ApplyError> {
        let name = name.into();
        if url.contains(":memory:") {
            return Self::in_memory(name).await;
        }

        info!(store = %name, url, "Opening SQLite store");
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ApplyError::Malformed(format!("invalid SQLite URL '{}': {}", url, e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ApplyError::connection(&name, e))?;

        Ok(Self {
            name,
            pool,
            auto_schema: true,
        })
    }

    /// Private in-memory database.
    ///
    /// Uses a single long-lived connection so every call sees the same data.
    pub async fn in_memory(name: impl Into<String>) -> Result<Self, ApplyError> {
        let name = name.into();
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ApplyError::Malformed(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| ApplyError::connection(&name, e))?;

        Ok(Self {
            name,
            pool,
            auto_schema: true,
        })
    }

    /// Enable or disable automatic table/column creation.
    #[must_use]
    pub fn with_auto_schema(mut self, enabled: bool) -> Self {
        self.auto_schema = enabled;
        self
    }

    /// Create `table` with an `id` primary key and the given columns.
    pub async fn ensure_collection(&self, table: &str, columns: &[&str]) -> Result<(), ApplyError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ApplyError::connection(&self.name, e))?;
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        ensure_columns(&mut conn, table, &columns, true)
            .await
            .map_err(|f| f.into_apply_error(&self.name))
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply_once(&self, record: &OperationRecord) -> Result<ApplyOutcome, Failure> {
        let mut tx = self.pool.begin().await?;
        let outcome = apply_record(&mut tx, record, self.auto_schema).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

impl StoreAdapter for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            record.validate()?;
            let outcome = execute_with_retry("apply", || self.apply_once(record))
                .await
                .map_err(|f| f.into_apply_error(&self.name))?;
            debug!(store = %self.name, target = %record.target, kind = %record.kind(), "Applied record");
            Ok(outcome)
        })
    }

    fn begin(&self) -> BoxFuture<'_, Box<dyn StoreTransaction>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ApplyError::transaction(&self.name, e))?;
            Ok(Box::new(SqliteTransaction {
                name: self.name.clone(),
                tx,
                auto_schema: self.auto_schema,
            }) as Box<dyn StoreTransaction>)
        })
    }

    fn find<'a>(&'a self, target: &'a str, filter: &'a Filter) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| ApplyError::connection(&self.name, e))?;
            select_documents(&mut conn, target, filter, false)
                .await
                .map_err(|f| f.into_apply_error(&self.name))
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| ApplyError::connection(&self.name, e))?;
            Ok(())
        })
    }
}

/// Open transaction on a [`SqliteStore`].
struct SqliteTransaction {
    name: String,
    tx: Transaction<'static, Sqlite>,
    auto_schema: bool,
}

impl StoreTransaction for SqliteTransaction {
    fn apply<'a>(&'a mut self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            record.validate()?;
            apply_record(&mut self.tx, record, self.auto_schema)
                .await
                .map_err(|f| f.into_apply_error(&self.name))
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let SqliteTransaction { name, tx, .. } = *self;
            tx.commit().await.map_err(|e| ApplyError::transaction(name, e))
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let SqliteTransaction { name, tx, .. } = *self;
            tx.rollback().await.map_err(|e| ApplyError::transaction(name, e))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statement building
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate and quote an identifier.
fn quote_ident(name: &str) -> Result<String, ApplyError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ApplyError::Malformed(format!("invalid identifier '{}'", name)));
    }
    Ok(format!("\"{}\"", name))
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Number(n) => match (n.as_i64(), n.is_f64()) {
            (Some(i), _) => query.bind(i),
            (None, true) => query.bind(n.as_f64().unwrap_or_default()),
            (None, false) => query.bind(json_blob(value)),
        },
        Value::String(s) => query.bind(s.clone()),
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => query.bind(json_blob(value)),
    }
}

fn json_blob(value: &Value) -> Vec<u8> {
    let mut blob = vec![JSON_BLOB_TAG];
    blob.extend_from_slice(value.to_string().as_bytes());
    blob
}

/// Tagged BLOBs decode back to JSON; any other BLOB reads as hex.
fn blob_value(blob: Vec<u8>) -> Value {
    if let Some((&JSON_BLOB_TAG, json)) = blob.split_first() {
        if let Ok(value) = serde_json::from_slice(json) {
            return value;
        }
    }
    Value::String(hex::encode(blob))
}

/// `"a" IS ? AND "b" IS ?` (null-safe equality). Empty filter matches all.
fn where_clause(filter: &Filter) -> Result<String, ApplyError> {
    if filter.is_empty() {
        return Ok("1 = 1".to_string());
    }
    let parts = filter
        .keys()
        .map(|k| quote_ident(k).map(|q| format!("{} IS ?", q)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(" AND "))
}

/// Existing column names, or `None` when the table does not exist.
async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Option<HashSet<String>>, Failure> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut columns = HashSet::with_capacity(rows.len());
    for row in rows {
        columns.insert(row.try_get::<String, _>("name")?);
    }
    Ok(Some(columns))
}

/// Make sure `table` exists with every column in `columns`.
async fn ensure_columns(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[String],
    auto_schema: bool,
) -> Result<(), Failure> {
    let quoted_table = quote_ident(table)?;
    match table_columns(conn, table).await? {
        None => {
            if !auto_schema {
                return Err(ApplyError::Malformed(format!("unknown table '{}'", table)).into());
            }
            let mut defs = vec![format!("{} PRIMARY KEY", quote_ident(ID_FIELD)?)];
            for column in columns.iter().filter(|c| c.as_str() != ID_FIELD) {
                defs.push(quote_ident(column)?);
            }
            let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quoted_table, defs.join(", "));
            sqlx::query(&sql).execute(&mut *conn).await?;
            info!(table, columns = columns.len(), "Created table");
        }
        Some(existing) => {
            for column in columns.iter().filter(|c| !existing.contains(c.as_str())) {
                if !auto_schema {
                    return Err(ApplyError::Malformed(format!(
                        "table '{}' has no column '{}'",
                        table, column
                    ))
                    .into());
                }
                let sql = format!("ALTER TABLE {} ADD COLUMN {}", quoted_table, quote_ident(column)?);
                sqlx::query(&sql).execute(&mut *conn).await?;
                debug!(table, column = %column, "Added column");
            }
        }
    }
    Ok(())
}

/// Can `filter` match anything in a table with these columns?
fn filter_applicable(columns: &Option<HashSet<String>>, filter: &Filter) -> bool {
    match columns {
        None => false,
        // A field the table has never seen is absent from every row.
        Some(cols) => filter.iter().all(|(k, v)| cols.contains(k) || v.is_null()),
    }
}

async fn select_documents(
    conn: &mut SqliteConnection,
    table: &str,
    filter: &Filter,
    first_only: bool,
) -> Result<Vec<Document>, Failure> {
    let columns = table_columns(conn, table).await?;
    if !filter_applicable(&columns, filter) {
        return Ok(Vec::new());
    }
    let present: Filter = filter
        .iter()
        .filter(|(k, _)| columns.as_ref().map_or(false, |c| c.contains(k.as_str())))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let sql = format!(
        "SELECT * FROM {} WHERE {} ORDER BY rowid{}",
        quote_ident(table)?,
        where_clause(&present)?,
        if first_only { " LIMIT 1" } else { "" }
    );
    let mut query = sqlx::query(&sql);
    for value in present.values() {
        query = bind_value(query, value);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_document).collect()
}

fn row_to_document(row: &SqliteRow) -> Result<Document, Failure> {
    let mut document = Document::new();
    for (i, column) in row.columns().iter().enumerate() {
        let (is_null, type_name) = {
            let raw = row.try_get_raw(i)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };
        if is_null {
            continue;
        }
        let value = match type_name.as_str() {
            "INTEGER" => Value::from(row.try_get::<i64, _>(i)?),
            "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(i)?)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "BLOB" => blob_value(row.try_get::<Vec<u8>, _>(i)?),
            _ => Value::String(row.try_get::<String, _>(i)?),
        };
        document.insert(column.name().to_string(), value);
    }
    Ok(document)
}

async fn insert_row(
    conn: &mut SqliteConnection,
    table: &str,
    document: &Document,
    auto_schema: bool,
) -> Result<Value, Failure> {
    let id = document.get(ID_FIELD).cloned().unwrap_or_else(new_id);
    let mut row = document.clone();
    row.insert(ID_FIELD.to_string(), id.clone());

    let columns: Vec<String> = row.keys().cloned().collect();
    ensure_columns(conn, table, &columns, auto_schema).await?;

    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>, _>>()?;
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table)?,
        quoted.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for value in row.values() {
        query = bind_value(query, value);
    }
    match query.execute(&mut *conn).await {
        Ok(_) => Ok(id),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(ApplyError::DuplicateKey {
                target: table.to_string(),
                id: id_key(&id),
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn apply_record(
    conn: &mut SqliteConnection,
    record: &OperationRecord,
    auto_schema: bool,
) -> Result<ApplyOutcome, Failure> {
    let table = record.target.as_str();

    match &record.payload {
        Payload::Insert { document } => {
            let id = insert_row(conn, table, document, auto_schema).await?;
            Ok(ApplyOutcome::inserted(id))
        }

        Payload::Update {
            filter,
            set,
            upsert,
            upsert_id,
            many,
        } => {
            let matched = select_ids(conn, table, filter, *many).await?;

            if matched.is_empty() {
                if !*upsert {
                    return Ok(ApplyOutcome::updated(0, 0));
                }
                let mut document = filter.clone();
                document.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
                let id = upsert_id
                    .clone()
                    .or_else(|| filter.get(ID_FIELD).cloned())
                    .unwrap_or_else(new_id);
                document.insert(ID_FIELD.to_string(), id);
                let id = insert_row(conn, table, &document, auto_schema).await?;
                return Ok(ApplyOutcome::upserted(id));
            }

            let columns: Vec<String> = set.keys().cloned().collect();
            ensure_columns(conn, table, &columns, auto_schema).await?;

            let assignments = columns
                .iter()
                .map(|c| quote_ident(c).map(|q| format!("{} = ?", q)))
                .collect::<Result<Vec<_>, _>>()?;
            let unchanged = columns
                .iter()
                .map(|c| quote_ident(c).map(|q| format!("{} IS ?", q)))
                .collect::<Result<Vec<_>, _>>()?;
            let sql = format!(
                "UPDATE {} SET {} WHERE {} IS ? AND NOT ({})",
                quote_ident(table)?,
                assignments.join(", "),
                quote_ident(ID_FIELD)?,
                unchanged.join(" AND ")
            );

            let mut modified = 0;
            for id in &matched {
                let mut query = sqlx::query(&sql);
                for value in set.values() {
                    query = bind_value(query, value);
                }
                query = bind_value(query, id);
                for value in set.values() {
                    query = bind_value(query, value);
                }
                modified += query.execute(&mut *conn).await?.rows_affected();
            }
            Ok(ApplyOutcome::updated(matched.len() as u64, modified))
        }

        Payload::Delete { filter, many } => {
            let matched = select_ids(conn, table, filter, *many).await?;
            if matched.is_empty() {
                return Ok(ApplyOutcome::deleted(0));
            }
            let sql = format!(
                "DELETE FROM {} WHERE {} IS ?",
                quote_ident(table)?,
                quote_ident(ID_FIELD)?
            );
            let mut deleted = 0;
            for id in &matched {
                deleted += bind_value(sqlx::query(&sql), id)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
            }
            Ok(ApplyOutcome::deleted(deleted))
        }
    }
}

/// Identifiers of matching rows, in natural order.
async fn select_ids(
    conn: &mut SqliteConnection,
    table: &str,
    filter: &Filter,
    many: bool,
) -> Result<Vec<Value>, Failure> {
    let documents = select_documents(conn, table, filter, !many).await?;
    Ok(documents
        .into_iter()
        .filter_map(|mut d| d.remove(ID_FIELD))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::id_filter;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn store() -> SqliteStore {
        SqliteStore::in_memory("relational").await.unwrap()
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("products").unwrap(), "\"products\"");
        assert_eq!(quote_ident("_user_id2").unwrap(), "\"_user_id2\"");
        assert!(quote_ident("").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("name\"; DROP TABLE x; --").is_err());
        assert!(quote_ident("has space").is_err());
    }

    #[test]
    fn test_where_clause() {
        assert_eq!(where_clause(&Filter::new()).unwrap(), "1 = 1");
        assert_eq!(
            where_clause(&doc(json!({"a": 1, "b": 2}))).unwrap(),
            "\"a\" IS ? AND \"b\" IS ?"
        );
    }

    #[test]
    fn test_blob_value() {
        assert_eq!(blob_value(json_blob(&json!([1, 2]))), json!([1, 2]));
        assert_eq!(blob_value(json_blob(&json!(true))), json!(true));
        assert_eq!(blob_value(json_blob(&json!(u64::MAX))), json!(u64::MAX));
        // Untagged bytes from elsewhere
        assert_eq!(blob_value(vec![0xDE, 0xAD]), json!("dead"));
        assert_eq!(blob_value(b"[1]".to_vec()), json!("5b315d"));
    }

    #[tokio::test]
    async fn test_insert_and_find_roundtrip_types() {
        let store = store().await;
        let outcome = store
            .apply(&OperationRecord::insert(
                "products",
                doc(json!({"id": "p1", "name": "Widget", "price": 9.99, "stock": 3, "tags": ["a"]})),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::inserted(json!("p1")));

        let row = store
            .find_one("products", &id_filter(json!("p1")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], json!("Widget"));
        assert_eq!(row["price"], json!(9.99));
        assert_eq!(row["stock"], json!(3));
        assert_eq!(row["tags"], json!(["a"]));
    }

    #[tokio::test]
    async fn test_values_keep_their_json_type() {
        let store = store().await;
        let big = u64::MAX - 7;
        store
            .apply(&OperationRecord::insert(
                "items",
                doc(json!({
                    "id": "a",
                    "label": "[1,2]",
                    "obj_text": "{\"k\":1}",
                    "word": "true",
                    "active": true,
                    "archived": false,
                    "one": 1,
                    "big": big,
                    "ratio": 0.5,
                    "nested": {"k": [1, "x", null]},
                })),
            ))
            .await
            .unwrap();

        let row = store.find_one("items", &id_filter(json!("a"))).await.unwrap().unwrap();
        assert_eq!(row["label"], json!("[1,2]"));
        assert_eq!(row["obj_text"], json!("{\"k\":1}"));
        assert_eq!(row["word"], json!("true"));
        assert_eq!(row["active"], json!(true));
        assert_eq!(row["archived"], json!(false));
        assert_eq!(row["one"], json!(1));
        assert_eq!(row["big"], json!(big));
        assert!(row["big"].is_u64());
        assert_eq!(row["ratio"], json!(0.5));
        assert_eq!(row["nested"], json!({"k": [1, "x", null]}));

        // Filters compare with the same encoding, so bools and ints stay distinct
        assert_eq!(store.find("items", &doc(json!({"active": true}))).await.unwrap().len(), 1);
        assert!(store.find("items", &doc(json!({"active": 1}))).await.unwrap().is_empty());
        assert!(store.find("items", &doc(json!({"one": true}))).await.unwrap().is_empty());
        assert_eq!(store.find("items", &doc(json!({"big": big}))).await.unwrap().len(), 1);
        assert!(store.find("items", &doc(json!({"label": [1, 2]}))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_duplicate_key() {
        let store = store().await;
        let record = OperationRecord::insert("products", doc(json!({"id": "p1", "name": "Widget"})));
        store.apply(&record).await.unwrap();

        let err = store.apply(&record).await.unwrap_err();
        assert!(err.is_duplicate_key(), "got {:?}", err);
        assert_eq!(store.find("products", &Filter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_counts_modified() {
        let store = store().await;
        for id in ["a", "b"] {
            store
                .apply(&OperationRecord::insert("items", doc(json!({"id": id, "qty": 1}))))
                .await
                .unwrap();
        }

        let outcome = store
            .apply(&OperationRecord::update("items", Filter::new(), doc(json!({"qty": 1}))).many())
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::updated(2, 0));

        let outcome = store
            .apply(&OperationRecord::update("items", Filter::new(), doc(json!({"qty": 2}))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::updated(1, 1));

        let a = store.find_one("items", &id_filter(json!("a"))).await.unwrap().unwrap();
        let b = store.find_one("items", &id_filter(json!("b"))).await.unwrap().unwrap();
        assert_eq!(a["qty"], json!(2));
        assert_eq!(b["qty"], json!(1));
    }

    #[tokio::test]
    async fn test_update_adds_new_column() {
        let store = store().await;
        store
            .apply(&OperationRecord::insert("items", doc(json!({"id": "a"}))))
            .await
            .unwrap();
        let outcome = store
            .apply(&OperationRecord::update("items", id_filter(json!("a")), doc(json!({"color": "red"}))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::updated(1, 1));
    }

    #[tokio::test]
    async fn test_upsert_inserts_row() {
        let store = store().await;
        let record = OperationRecord::update(
            "carts",
            doc(json!({"userId": "u1"})),
            doc(json!({"items": [{"productId": "p1"}]})),
        )
        .upsert()
        .assign_identity_with(|| json!("cart-1"));

        let outcome = store.apply(&record).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::upserted(json!("cart-1")));

        let cart = store
            .find_one("carts", &doc(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cart["id"], json!("cart-1"));
        assert_eq!(cart["items"], json!([{"productId": "p1"}]));
    }

    #[tokio::test]
    async fn test_delete_first_and_many() {
        let store = store().await;
        for id in ["a", "b", "c"] {
            store
                .apply(&OperationRecord::insert("items", doc(json!({"id": id, "kind": "x"}))))
                .await
                .unwrap();
        }

        let outcome = store
            .apply(&OperationRecord::delete("items", doc(json!({"kind": "x"}))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::deleted(1));
        assert!(store.find_one("items", &id_filter(json!("a"))).await.unwrap().is_none());

        let outcome = store
            .apply(&OperationRecord::delete("items", doc(json!({"kind": "x"}))).many())
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::deleted(2));
    }

    #[tokio::test]
    async fn test_missing_table_and_column_match_nothing() {
        let store = store().await;
        assert!(store.find("ghosts", &Filter::new()).await.unwrap().is_empty());

        let outcome = store
            .apply(&OperationRecord::delete("ghosts", id_filter(json!("x"))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::deleted(0));

        store
            .apply(&OperationRecord::insert("items", doc(json!({"id": "a"}))))
            .await
            .unwrap();
        assert!(store
            .find("items", &doc(json!({"nonexistent": 1})))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_strict_schema_rejects_unknown_table() {
        let store = store().await.with_auto_schema(false);
        let err = store
            .apply(&OperationRecord::insert("products", doc(json!({"id": "p1"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Malformed(_)));

        store.ensure_collection("products", &["name"]).await.unwrap();
        store
            .apply(&OperationRecord::insert("products", doc(json!({"id": "p1", "name": "W"}))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_target_is_malformed() {
        let store = store().await;
        let err = store
            .apply(&OperationRecord::insert("bad name", doc(json!({"id": "p1"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let store = store().await;
        store.ensure_collection("items", &["qty"]).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.apply(&OperationRecord::insert("items", doc(json!({"id": "a", "qty": 1}))))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.find("items", &Filter::new()).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.apply(&OperationRecord::insert("items", doc(json!({"id": "b", "qty": 1}))))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.find("items", &Filter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());

        let store = SqliteStore::connect("relational", &url).await.unwrap();
        store
            .apply(&OperationRecord::insert("products", doc(json!({"id": "p1"}))))
            .await
            .unwrap();
        store.ping().await.unwrap();
        store.close().await;

        let reopened = SqliteStore::connect("relational", &url).await.unwrap();
        assert_eq!(reopened.find("products", &Filter::new()).await.unwrap().len(), 1);
    }
}
