//! MySQL access over `sqlx`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;

use super::{Connector, DbError, SqlParam, SqlRow, SqlSource, SqlValue};
use crate::config::ConnectionSettings;

/// Opens pools against one server; each `connect` yields an independent pool.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    max_connections: u32,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(settings: &ConnectionSettings) -> Self {
        let mut options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.username);
        if let Some(ref password) = settings.password {
            options = options.password(password);
        }
        if let Some(ref database) = settings.database {
            options = options.database(database);
        }

        Self {
            options,
            max_connections: settings.max_connections.max(1),
            connect_timeout: settings.connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Source = MySqlSource;

    async fn connect(&self, database: Option<&str>) -> Result<MySqlSource, DbError> {
        let options = match database {
            Some(db) => self.options.clone().database(db),
            None => self.options.clone(),
        };
        // Database-scoped pools serve one plan-extraction group sequentially.
        let max_connections = if database.is_some() {
            1
        } else {
            self.max_connections
        };

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connect(format_mysql_error(&e)))?;

        debug!(database = database.unwrap_or("-"), max_connections, "MySQL pool opened");
        Ok(MySqlSource { pool })
    }
}

/// [`SqlSource`] backed by a `MySqlPool`.
#[derive(Debug, Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    fn build<'q>(
        sql: &'q str,
        params: &[SqlParam],
    ) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
        let mut query = sqlx::query(sql).persistent(false);
        for param in params {
            query = match param {
                SqlParam::Str(s) => query.bind(s.clone()),
                SqlParam::Int(v) => query.bind(*v),
                SqlParam::UInt(v) => query.bind(*v),
                SqlParam::Float(v) => query.bind(*v),
            };
        }
        query
    }
}

#[async_trait]
impl SqlSource for MySqlSource {
    async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError> {
        let rows = Self::build(sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Query(format_mysql_error(&e)))?;
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        let result = Self::build(sql, params)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Query(format_mysql_error(&e)))?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn convert_row(row: &MySqlRow) -> SqlRow {
    let mut out = SqlRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.push(column.name(), decode_value(row, idx));
    }
    out
}

/// Decodes one column, trying the widest compatible Rust type first.
fn decode_value(row: &MySqlRow, idx: usize) -> SqlValue {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return SqlValue::Null,
        Ok(_) => {}
        Err(_) => return SqlValue::Null,
    }

    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return SqlValue::Int(v);
    }
    if let Ok(v) = row.try_get::<u64, _>(idx) {
        return SqlValue::UInt(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return SqlValue::Float(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return SqlValue::Text(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
        return SqlValue::Text(String::from_utf8_lossy(&v).into_owned());
    }
    // DECIMAL (SUM/AVG results) travels as text on the wire.
    if let Ok(v) = row.try_get_unchecked::<String, _>(idx) {
        return match v.parse::<f64>() {
            Ok(f) => SqlValue::Float(f),
            Err(_) => SqlValue::Text(v),
        };
    }

    let column = &row.columns()[idx];
    debug!(
        column = column.name(),
        type_name = column.type_info().name(),
        "undecodable column treated as NULL"
    );
    SqlValue::Null
}

/// Formats a `sqlx` error for logs.
pub(crate) fn format_mysql_error(e: &sqlx::Error) -> String {
    if let Some(db_error) = e.as_database_error() {
        match db_error.code() {
            Some(code) => format!("{}: {}", code, db_error.message()),
            None => db_error.message().to_string(),
        }
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if matches!(e, sqlx::Error::PoolTimedOut) {
            "timed out acquiring connection".to_string()
        } else {
            msg
        }
    }
}
