use std::time::Instant;

use discogs_config::shared::PostgresSinkConfig;
use discogs_etl::concurrency::shutdown::ShutdownRx;
use discogs_etl::error::EtlResult;
use discogs_etl::resilience::{ConnectionHealth, Connector, PoolStatus, ResilientConnection};
use discogs_etl::sink::{Sink, last_write_wins};
use discogs_etl::types::{DataType, ExtractedRecord};
use metrics::{counter, histogram};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::{
    DISCOGS_SINK_ROWS_CHANGED_TOTAL, DISCOGS_SINK_UPSERT_SECONDS, SINK_LABEL, register_metrics,
};
use crate::postgres::pg_error_to_etl_error;

/// Name of the table holding the records of `data_type`.
fn table_name(data_type: DataType) -> &'static str {
    data_type.as_str()
}

fn create_table_sql(data_type: DataType) -> String {
    let table = table_name(data_type);
    format!(
        r#"
        create table if not exists "{table}" (
            data_id text primary key,
            hash text not null,
            data jsonb not null,
            updated_at timestamptz not null default now()
        )"#
    )
}

fn create_hash_index_sql(data_type: DataType) -> String {
    let table = table_name(data_type);
    format!(r#"create index if not exists "idx_{table}_hash" on "{table}" (hash)"#)
}

/// Upserts every row of the `$1` JSON array. Rows whose stored hash already matches are left
/// untouched and not counted.
fn upsert_sql(data_type: DataType) -> String {
    let table = table_name(data_type);
    format!(
        r#"
        insert into "{table}" (data_id, hash, data)
        select r.data_id, r.hash, r.data
        from jsonb_to_recordset($1) as r(data_id text, hash text, data jsonb)
        on conflict (data_id) do update
        set hash = excluded.hash, data = excluded.data, updated_at = now()
        where "{table}".hash is distinct from excluded.hash"#
    )
}

/// Opens Postgres connection pools.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: PostgresSinkConfig,
}

impl PostgresConnector {
    pub fn new(config: PostgresSinkConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .database(&self.config.database)
            .username(&self.config.username);

        match &self.config.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        }
    }
}

impl Connector for PostgresConnector {
    type Connection = PgPool;

    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> EtlResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout())
            .connect_with(self.connect_options())
            .await
            .map_err(pg_error_to_etl_error)?;

        info!(
            host = %self.config.host,
            database = %self.config.database,
            max_connections = self.config.max_connections,
            "postgres connection pool created"
        );

        Ok(pool)
    }

    async fn probe(&self, pool: &PgPool) -> EtlResult<()> {
        sqlx::query("select 1")
            .execute(pool)
            .await
            .map_err(pg_error_to_etl_error)?;

        Ok(())
    }

    async fn close(&self, pool: PgPool) {
        pool.close().await;
    }

    fn pool_status(&self, pool: &PgPool) -> Option<PoolStatus> {
        Some(PoolStatus {
            size: pool.size(),
            idle: pool.num_idle() as u32,
            max_connections: self.config.max_connections,
        })
    }
}

/// Relational sink storing each data type in a table with a JSONB `data` column.
#[derive(Clone)]
pub struct PostgresSink {
    connection: ResilientConnection<PostgresConnector>,
    max_connections: u32,
}

impl PostgresSink {
    pub fn new(config: PostgresSinkConfig) -> Self {
        register_metrics();

        let max_connections = config.max_connections;
        let resilience = config.resilience.clone();

        Self {
            connection: ResilientConnection::new(PostgresConnector::new(config), &resilience),
            max_connections,
        }
    }

    /// Connects eagerly, so an unreachable database fails the service at startup.
    pub async fn connect(&self) -> EtlResult<()> {
        self.connection
            .execute("postgres_connect", |pool| async move {
                sqlx::query("select 1")
                    .execute(&pool)
                    .await
                    .map_err(pg_error_to_etl_error)?;
                Ok(())
            })
            .await
    }

    pub fn spawn_health_monitor(&self, shutdown_rx: ShutdownRx) -> JoinHandle<()> {
        self.connection.spawn_health_monitor(shutdown_rx)
    }
}

fn record_row(record: &ExtractedRecord) -> EtlResult<Value> {
    Ok(json!({
        "data_id": record.id,
        "hash": record.hash,
        "data": serde_json::to_value(&record.payload)?,
    }))
}

impl Sink for PostgresSink {
    fn name() -> &'static str {
        "postgres"
    }

    async fn prepare(&self, data_types: &[DataType]) -> EtlResult<()> {
        for data_type in data_types.iter().copied() {
            self.connection
                .execute("postgres_prepare", |pool| async move {
                    let mut transaction = pool.begin().await.map_err(pg_error_to_etl_error)?;
                    sqlx::query(&create_table_sql(data_type))
                        .execute(&mut *transaction)
                        .await
                        .map_err(pg_error_to_etl_error)?;
                    sqlx::query(&create_hash_index_sql(data_type))
                        .execute(&mut *transaction)
                        .await
                        .map_err(pg_error_to_etl_error)?;
                    transaction.commit().await.map_err(pg_error_to_etl_error)?;

                    Ok(())
                })
                .await?;

            debug!(%data_type, table = table_name(data_type), "postgres table ready");
        }

        Ok(())
    }

    fn max_connections(&self) -> Option<u32> {
        Some(self.max_connections)
    }

    async fn upsert_batch(&self, data_type: DataType, records: Vec<ExtractedRecord>) -> EtlResult<u64> {
        // One statement cannot update the same row twice.
        let records = last_write_wins(records);
        if records.is_empty() {
            return Ok(0);
        }

        let rows = records
            .iter()
            .map(record_row)
            .collect::<EtlResult<Vec<_>>>()?;
        let rows = Value::Array(rows);
        let sql = upsert_sql(data_type);

        let started = Instant::now();
        let changed = self
            .connection
            .execute("postgres_upsert", |pool| {
                let rows = &rows;
                let sql = &sql;
                async move {
                    let mut transaction = pool.begin().await.map_err(pg_error_to_etl_error)?;
                    let result = sqlx::query(sql)
                        .bind(Json(rows))
                        .execute(&mut *transaction)
                        .await
                        .map_err(pg_error_to_etl_error)?;
                    transaction.commit().await.map_err(pg_error_to_etl_error)?;

                    Ok(result.rows_affected())
                }
            })
            .await?;

        histogram!(DISCOGS_SINK_UPSERT_SECONDS, SINK_LABEL => "postgres")
            .record(started.elapsed().as_secs_f64());
        counter!(DISCOGS_SINK_ROWS_CHANGED_TOTAL, SINK_LABEL => "postgres").increment(changed);
        debug!(%data_type, records = records.len(), changed, "postgres batch committed");

        Ok(changed)
    }

    fn health(&self) -> Option<ConnectionHealth> {
        Some(self.connection.health())
    }

    async fn shutdown(&self) -> EtlResult<()> {
        self.connection.close().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discogs_etl::types::ArtistRecord;

    #[test]
    fn test_upsert_only_rewrites_changed_hashes() {
        let sql = upsert_sql(DataType::Artists);

        assert!(sql.contains(r#"insert into "artists" (data_id, hash, data)"#));
        assert!(sql.contains("on conflict (data_id) do update"));
        assert!(sql.contains(r#"where "artists".hash is distinct from excluded.hash"#));
    }

    #[test]
    fn test_record_row_carries_payload_as_json() {
        let record = ExtractedRecord::new(ArtistRecord::new("1", "The Persuader"))
            .unwrap()
            .with_hash("h1");

        let row = record_row(&record).unwrap();

        assert_eq!(row["data_id"], "1");
        assert_eq!(row["hash"], "h1");
        assert!(row["data"].is_object());
    }
}
