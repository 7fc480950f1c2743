//! The storage engine.
//!
//! A [`Database`] owns exactly one SQLite connection. Every statement runs
//! through a [`Session`], an exclusive lease on that connection handed out in
//! FIFO order, so concurrent callers queue instead of racing. A session that is
//! dropped with a transaction still open is rolled back by the next lease.

use crate::error::{Result, StoreError};
use futures::TryStreamExt;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Connection, FromRow, Sqlite, SqliteConnection};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

struct ConnState {
    conn: Option<SqliteConnection>,
    in_transaction: bool,
}

/// A SQLite database file with a single serialized connection.
pub struct Database {
    path: PathBuf,
    state: Mutex<ConnState>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Create a closed database for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(ConnState {
                conn: None,
                in_transaction: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the connection, creating the file and installing the schema if
    /// needed.
    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.conn.is_some() {
            return Err(StoreError::AlreadyOpen);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .foreign_keys(true)
            .connect()
            .await?;

        tracing::debug!(path = %self.path.display(), "Running database migrations");
        sqlx::migrate!("./migrations").run(&mut conn).await?;

        state.conn = Some(conn);
        state.in_transaction = false;
        tracing::info!(path = %self.path.display(), "Database opened");
        Ok(())
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let conn = state.conn.take().ok_or(StoreError::AlreadyClosed)?;
        state.in_transaction = false;
        conn.close().await?;
        tracing::info!(path = %self.path.display(), "Database closed");
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.conn.is_some()
    }

    /// Wait for exclusive use of the connection.
    pub async fn session(&self) -> Result<Session<'_>> {
        let mut state = self.state.lock().await;
        if state.in_transaction {
            tracing::warn!(path = %self.path.display(), "Rolling back transaction left open by a dropped session");
            let conn = state.conn.as_mut().ok_or(StoreError::NotOpen)?;
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            state.in_transaction = false;
        }
        if state.conn.is_none() {
            return Err(StoreError::NotOpen);
        }
        Ok(Session { state })
    }
}

/// Exclusive lease on the database connection.
pub struct Session<'a> {
    state: MutexGuard<'a, ConnState>,
}

impl Session<'_> {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.state.conn.as_mut().ok_or(StoreError::NotOpen)
    }

    pub fn in_transaction(&self) -> bool {
        self.state.in_transaction
    }

    /// Start an exclusive transaction.
    pub async fn begin(&mut self) -> Result<()> {
        if self.state.in_transaction {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        sqlx::query("BEGIN EXCLUSIVE").execute(self.conn()?).await?;
        self.state.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if !self.state.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        sqlx::query("COMMIT").execute(self.conn()?).await?;
        self.state.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        if !self.state.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        // The flag is cleared first so a failed ROLLBACK is not retried by
        // the next lease.
        self.state.in_transaction = false;
        sqlx::query("ROLLBACK").execute(self.conn()?).await?;
        Ok(())
    }

    /// Commit on `Ok`, roll back on `Err`, and pass `result` through.
    pub async fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Run a statement that returns no rows, without caching it.
    ///
    /// Returns the number of affected rows.
    pub async fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64> {
        check_arguments(sql, args)?;
        if is_select(sql) {
            return Err(StoreError::InvalidSql(
                "execute cannot run a SELECT, use query".into(),
            ));
        }
        let result = bind_all(sqlx::query(sql), args)
            .persistent(false)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }

    /// Like [`execute`](Self::execute), keeping the prepared statement for
    /// reuse.
    pub async fn execute_cached(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64> {
        check_arguments(sql, args)?;
        if is_select(sql) {
            return Err(StoreError::InvalidSql(
                "execute cannot run a SELECT, use query".into(),
            ));
        }
        let result = bind_all(sqlx::query(sql), args)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }

    /// Run a query and collect every row.
    pub async fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<SqliteRow>> {
        check_arguments(sql, args)?;
        Ok(bind_all(sqlx::query(sql), args)
            .fetch_all(self.conn()?)
            .await?)
    }

    /// Run a query, streaming each row through `f`.
    pub async fn query_map<T, F>(&mut self, sql: &str, args: &[SqlValue], mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&SqliteRow) -> Result<T>,
    {
        check_arguments(sql, args)?;
        let mut rows = bind_all(sqlx::query(sql), args).fetch(self.conn()?);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(f(&row)?);
        }
        Ok(out)
    }

    /// Run a query and decode every row as `T`.
    pub async fn query_as<T>(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        self.query_map(sql, args, |row| Ok(T::from_row(row)?)).await
    }

    /// Run a query and decode the first row, if any.
    pub async fn query_one_as<T>(&mut self, sql: &str, args: &[SqlValue]) -> Result<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        Ok(self.query_as(sql, args).await?.into_iter().next())
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(value) => query.bind(*value),
            SqlValue::Real(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.as_str()),
            SqlValue::Bool(value) => query.bind(*value),
        };
    }
    query
}

/// Count `?` placeholders outside quoted text.
fn placeholder_count(sql: &str) -> usize {
    let mut count = 0;
    let mut quote = None;
    for c in sql.chars() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

fn check_arguments(sql: &str, args: &[SqlValue]) -> Result<()> {
    let expected = placeholder_count(sql);
    if expected != args.len() {
        return Err(StoreError::InvalidArgumentCount {
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn is_select(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|keyword| keyword.eq_ignore_ascii_case("select"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.sqlite"));
        db.open().await.unwrap();
        (dir, db)
    }

    #[test]
    fn placeholders_ignore_quoted_text() {
        assert_eq!(placeholder_count("SELECT * FROM t WHERE a = ? AND b = '?'"), 1);
        assert_eq!(placeholder_count("INSERT INTO t VALUES (?, ?, \"?\")"), 2);
        assert!(is_select("  select 1"));
        assert!(!is_select("INSERT INTO t VALUES (1)"));
    }

    #[tokio::test]
    async fn open_and_close_contract() {
        let (_dir, db) = open_temp().await;
        assert!(db.is_open().await);
        assert!(matches!(db.open().await, Err(StoreError::AlreadyOpen)));
        db.close().await.unwrap();
        assert!(matches!(db.close().await, Err(StoreError::AlreadyClosed)));
        assert!(matches!(db.session().await, Err(StoreError::NotOpen)));
    }

    #[tokio::test]
    async fn statement_contract() {
        let (_dir, db) = open_temp().await;
        let mut session = db.session().await.unwrap();

        let err = session
            .execute("INSERT INTO pins (name, created_at) VALUES (?, ?)", &["a".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgumentCount { expected: 2, got: 1 }));

        let err = session.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSql(_)));

        let inserted = session
            .execute_cached(
                "INSERT INTO pins (name, created_at) VALUES (?, ?)",
                &["a".into(), 1i64.into()],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let names = session
            .query_map("SELECT name FROM pins", &[], |row| Ok(row.try_get::<String, _>("name")?))
            .await
            .unwrap();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn transaction_contract() {
        let (_dir, db) = open_temp().await;
        let mut session = db.session().await.unwrap();

        assert!(matches!(session.commit().await, Err(StoreError::NoTransaction)));
        session.begin().await.unwrap();
        assert!(matches!(
            session.begin().await,
            Err(StoreError::TransactionAlreadyOpen)
        ));
        session
            .execute("INSERT INTO pins (name, created_at) VALUES ('x', 0)", &[])
            .await
            .unwrap();
        let result: Result<()> = Err(StoreError::Corrupt("boom".into()));
        assert!(session.finish(result).await.is_err());

        let rows = session.query("SELECT name FROM pins", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back() {
        let (_dir, db) = open_temp().await;
        {
            let mut session = db.session().await.unwrap();
            session.begin().await.unwrap();
            session
                .execute("INSERT INTO pins (name, created_at) VALUES ('x', 0)", &[])
                .await
                .unwrap();
        }
        let mut session = db.session().await.unwrap();
        assert!(!session.in_transaction());
        let rows = session.query("SELECT name FROM pins", &[]).await.unwrap();
        assert!(rows.is_empty());
    }
}
