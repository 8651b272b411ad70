//! Insert-values client for postgres-family engines. Jobs execute fully
//! inside `start_file_load` within one transaction, so a restored job is by
//! definition complete: the transaction either committed or was rolled back
//! by the server, and only `replace` dispositions may replay a file.

use crate::client::{Capabilities, JobClient, LoadJob, StaticJob};
use crate::dialect::{
    build_insert_version_sql, build_select_version_sql, build_table_update_sql,
    build_version_table_sql, make_dataset_name, Dialect, StorageColumns,
};
use crate::LoadError;
use async_trait::async_trait;
use schema::{Column, Schema, Table, WriteDisposition};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Executor, Row};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::writers::escape_string_literal;
use storage::FileFormat;

#[derive(Serialize, Deserialize, Clone)]
pub struct PostgresCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Destination schema name; the package schema name is appended when
    /// present.
    pub schema_prefix: String,
    /// Seconds allowed for establishing a connection.
    pub connection_timeout: u64,
}

impl Default for PostgresCredentials {
    fn default() -> Self {
        PostgresCredentials {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            schema_prefix: String::new(),
            connection_timeout: 15,
        }
    }
}

impl fmt::Debug for PostgresCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("schema_prefix", &self.schema_prefix)
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

impl PostgresCredentials {
    /// Overrides fields from same-named, upper-cased environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("HOST") {
            self.host = v;
        }
        if let Some(v) = env_parse("PORT") {
            self.port = v;
        }
        if let Ok(v) = std::env::var("USER") {
            self.user = v;
        }
        if let Ok(v) = std::env::var("PASSWORD") {
            self.password = v;
        }
        if let Ok(v) = std::env::var("DATABASE") {
            self.database = v;
        }
        if let Ok(v) = std::env::var("SCHEMA_PREFIX") {
            self.schema_prefix = v;
        }
        if let Some(v) = env_parse("CONNECTION_TIMEOUT") {
            self.connection_timeout = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

pub struct PostgresClient {
    conn: PgConnection,
    dialect: Dialect,
    schema: Arc<Schema>,
    dataset: String,
}

impl PostgresClient {
    pub fn capabilities() -> Capabilities {
        Capabilities {
            preferred_loader_file_format: FileFormat::InsertValues,
            supported_loader_file_formats: vec![FileFormat::InsertValues],
        }
    }

    pub async fn connect(
        credentials: PostgresCredentials,
        schema: Arc<Schema>,
    ) -> Result<Self, LoadError> {
        let options = PgConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port)
            .username(&credentials.user)
            .password(&credentials.password)
            .database(&credentials.database);
        let connect = options.connect();
        let conn = tokio::time::timeout(
            Duration::from_secs(credentials.connection_timeout),
            connect,
        )
        .await
        .map_err(|_| LoadError::Transient {
            message: format!("connection to {} timed out", credentials.host),
        })?
        .map_err(classify_sqlx)?;

        let dataset = make_dataset_name(&credentials.schema_prefix, schema.name());
        Ok(PostgresClient {
            conn,
            dialect: Dialect::postgres(),
            schema,
            dataset,
        })
    }

    async fn execute(&mut self, sql: &str) -> Result<(), LoadError> {
        tracing::debug!(sql, "executing");
        self.conn.execute(sql).await.map_err(classify_sqlx)?;
        Ok(())
    }

    async fn has_dataset(&mut self) -> Result<bool, LoadError> {
        let sql = format!(
            "SELECT 1 FROM information_schema.schemata WHERE schema_name = {};",
            escape_string_literal(&self.dataset)
        );
        let rows = self.conn.fetch_all(sql.as_str()).await.map_err(classify_sqlx)?;
        Ok(!rows.is_empty())
    }

    /// Latest schema version recorded at the destination, 0 when none.
    async fn storage_schema_version(&mut self) -> Result<u64, LoadError> {
        let sql = build_select_version_sql(&self.dialect, &self.dataset, self.schema.name());
        let rows = self.conn.fetch_all(sql.as_str()).await.map_err(classify_sqlx)?;
        match rows.first() {
            Some(row) => {
                let version: i64 = row.try_get(0).map_err(classify_sqlx)?;
                Ok(version.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    /// Introspects a destination table, `None` when it does not exist.
    async fn storage_table(&mut self, table_name: &str) -> Result<Option<StorageColumns>, LoadError> {
        let sql = format!(
            "SELECT column_name::text, data_type::text, is_nullable::text, \
             numeric_precision::bigint, numeric_scale::bigint \
             FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position;",
            escape_string_literal(&self.dataset),
            escape_string_literal(table_name)
        );
        let rows = self.conn.fetch_all(sql.as_str()).await.map_err(classify_sqlx)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = StorageColumns::new();
        for row in rows {
            let name: String = row.try_get(0).map_err(classify_sqlx)?;
            let sql_type: String = row.try_get(1).map_err(classify_sqlx)?;
            let is_nullable: String = row.try_get(2).map_err(classify_sqlx)?;
            let precision: Option<i64> = row.try_get(3).map_err(classify_sqlx)?;
            let scale: Option<i64> = row.try_get(4).map_err(classify_sqlx)?;

            let mut column = Column::new(
                name.clone(),
                self.dialect.data_type_from_sql(&sql_type, precision, scale),
            );
            column.nullable = is_nullable == "YES";
            columns.insert(name, column);
        }
        Ok(Some(columns))
    }
}

#[async_trait]
impl JobClient for PostgresClient {
    fn capabilities(&self) -> Capabilities {
        Self::capabilities()
    }

    async fn initialize_storage(&mut self) -> Result<(), LoadError> {
        if !self.has_dataset().await? {
            let sql = format!(
                "CREATE SCHEMA {};",
                self.dialect.escape_identifier(&self.dataset)
            );
            self.execute(&sql).await?;
        }
        Ok(())
    }

    async fn update_storage_schema(&mut self) -> Result<(), LoadError> {
        self.execute(&build_version_table_sql(&self.dialect, &self.dataset))
            .await?;
        let stored_version = self.storage_schema_version().await?;
        if stored_version == self.schema.version() {
            tracing::info!(version = stored_version, "destination schema is current");
            return Ok(());
        }

        let mut statements = Vec::new();
        let schema = self.schema.clone();
        for table in schema.tables().values() {
            let storage_columns = self.storage_table(&table.name).await?;
            if let Some(sql) = build_table_update_sql(
                &self.dialect,
                &self.dataset,
                table,
                storage_columns.as_ref(),
            )? {
                statements.push(sql);
            }
        }
        statements.push(build_insert_version_sql(
            &self.dialect,
            &self.dataset,
            schema.name(),
            schema.version(),
        ));

        let sql = format!("BEGIN;\n{}\nCOMMIT;", statements.join("\n"));
        self.execute(&sql).await?;
        tracing::info!(
            version = schema.version(),
            tables = schema.tables().len(),
            "updated destination schema"
        );
        Ok(())
    }

    async fn start_file_load(
        &mut self,
        table: &Table,
        disposition: WriteDisposition,
        file_path: &Path,
    ) -> Result<Box<dyn LoadJob>, LoadError> {
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        match disposition {
            WriteDisposition::Append | WriteDisposition::Replace => {}
            other => {
                return Err(LoadError::UnsupportedWriteDisposition {
                    table: table.name.clone(),
                    disposition: other,
                    file: file_name,
                })
            }
        }

        let size = tokio::fs::metadata(file_path).await?.len() as usize;
        if size >= self.dialect.max_statement_bytes {
            return Err(LoadError::FileTooBig {
                file: file_name,
                max_bytes: self.dialect.max_statement_bytes,
            });
        }

        let contents = tokio::fs::read_to_string(file_path).await?;
        let (header, values) = contents.split_once('\n').ok_or_else(|| {
            LoadError::Terminal {
                message: format!("insert file {} has no header", file_name),
            }
        })?;
        let qualified = self
            .dialect
            .qualified_table_name(&self.dataset, &table.name);

        let mut sql = String::from("BEGIN;\n");
        if disposition == WriteDisposition::Replace {
            sql.push_str(&format!("DELETE FROM {};\n", qualified));
        }
        sql.push_str(&header.replacen("{}", &qualified, 1));
        sql.push('\n');
        sql.push_str(values);
        sql.push_str("\nCOMMIT;");

        self.execute(&sql).await.map_err(|err| match &err {
            // The destination table vanished underneath the load.
            LoadError::Terminal { message } if message.contains("42P01") => {
                LoadError::UnknownTable {
                    table: table.name.clone(),
                    file: file_name.clone(),
                }
            }
            _ => err,
        })?;
        Ok(Box::new(StaticJob::completed(file_name)))
    }

    async fn restore_file_load(
        &mut self,
        file_path: &Path,
    ) -> Result<Box<dyn LoadJob>, LoadError> {
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        Ok(Box::new(StaticJob::completed(file_name)))
    }

    async fn complete_load(&mut self, _load_id: &str) -> Result<(), LoadError> {
        Ok(())
    }
}

/// Splits sqlx failures along the transient/terminal axis. SQLSTATE class
/// 08 (connection), 40 (transaction rollback), 53/55/57/58 (resources,
/// locks, shutdown) retry; data, constraint and syntax classes are final.
fn classify_sqlx(err: sqlx::Error) -> LoadError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let class = code.get(..2).unwrap_or("");
            let message = format!("{} [{}]", db.message(), code);
            match class {
                "08" | "40" | "53" | "55" | "57" | "58" => LoadError::Transient { message },
                "22" | "23" | "42" | "54" => LoadError::Terminal { message },
                _ => LoadError::Transient { message },
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            LoadError::Transient {
                message: err.to_string(),
            }
        }
        sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => LoadError::Terminal {
            message: err.to_string(),
        },
        _ => LoadError::Transient {
            message: err.to_string(),
        },
    }
}
