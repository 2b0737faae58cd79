use std::time::{Duration, Instant};

use discogs_config::shared::Neo4jSinkConfig;
use discogs_etl::concurrency::shutdown::ShutdownRx;
use discogs_etl::error::{ErrorKind, EtlResult};
use discogs_etl::etl_error;
use discogs_etl::resilience::{ConnectionHealth, Connector, PoolStatus, ResilientConnection};
use discogs_etl::sink::{Sink, last_write_wins};
use discogs_etl::types::{DataType, ExtractedRecord};
use metrics::{counter, histogram};
use neo4rs::{BoltMap, BoltString, BoltType, ConfigBuilder, Graph, Txn, query};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::{
    DISCOGS_SINK_ROWS_CHANGED_TOTAL, DISCOGS_SINK_UPSERT_SECONDS, SINK_LABEL, register_metrics,
};
use crate::neo4j::neo4j_error_to_etl_error;

fn create_constraint_cypher(data_type: DataType) -> String {
    let label = data_type.node_label();
    format!(
        "CREATE CONSTRAINT {}_id IF NOT EXISTS FOR (n:{label}) REQUIRE n.id IS UNIQUE",
        data_type.as_str()
    )
}

/// Merges every row of `$rows` by id and only rewrites nodes whose hash changed.
///
/// Returns the number of rewritten nodes as `changed`.
fn upsert_cypher(data_type: DataType) -> String {
    let label = data_type.node_label();
    format!(
        "UNWIND $rows AS row \
         MERGE (n:{label} {{id: row.id}}) \
         WITH n, row, coalesce(n.hash, '') <> row.hash AS changed \
         FOREACH (_ IN CASE WHEN changed THEN [1] ELSE [] END | \
             SET n.hash = row.hash, n.name = row.name, n.data = row.data) \
         RETURN count(CASE WHEN changed THEN 1 END) AS changed"
    )
}

fn record_row(record: &ExtractedRecord) -> EtlResult<BoltType> {
    let mut row = BoltMap::new();
    row.put(BoltString::from("id"), BoltType::from(record.id.clone()));
    row.put(BoltString::from("hash"), BoltType::from(record.hash.clone()));
    row.put(
        BoltString::from("name"),
        BoltType::from(record.payload.display_name().to_string()),
    );
    row.put(
        BoltString::from("data"),
        BoltType::from(serde_json::to_string(&record.payload)?),
    );

    Ok(BoltType::Map(row))
}

/// Opens Neo4j bolt drivers.
#[derive(Debug, Clone)]
pub struct Neo4jConnector {
    config: Neo4jSinkConfig,
}

impl Neo4jConnector {
    pub fn new(config: Neo4jSinkConfig) -> Self {
        Self { config }
    }
}

impl Connector for Neo4jConnector {
    type Connection = Graph;

    fn name(&self) -> &str {
        "neo4j"
    }

    async fn connect(&self) -> EtlResult<Graph> {
        let mut builder = ConfigBuilder::default()
            .uri(self.config.uri.as_str())
            .user(self.config.username.as_str())
            .password(self.config.password.expose_secret().as_str())
            .max_connections(self.config.max_connections as usize)
            .fetch_size(self.config.fetch_size);
        if let Some(database) = &self.config.database {
            builder = builder.db(database.as_str());
        }
        let config = builder.build().map_err(neo4j_error_to_etl_error)?;

        let graph = Graph::connect(config)
            .await
            .map_err(neo4j_error_to_etl_error)?;

        info!(
            uri = %self.config.uri,
            max_connections = self.config.max_connections,
            "neo4j driver created"
        );

        Ok(graph)
    }

    async fn probe(&self, graph: &Graph) -> EtlResult<()> {
        graph
            .run(query("RETURN 1"))
            .await
            .map_err(neo4j_error_to_etl_error)
    }

    fn pool_status(&self, _graph: &Graph) -> Option<PoolStatus> {
        // The driver does not expose its pool occupancy.
        None
    }
}

/// Graph sink storing each record as a node labelled by its data type.
#[derive(Clone)]
pub struct Neo4jSink {
    connection: ResilientConnection<Neo4jConnector>,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl Neo4jSink {
    pub fn new(config: Neo4jSinkConfig) -> Self {
        register_metrics();

        let max_connections = config.max_connections;
        let acquire_timeout = config.acquire_timeout();
        let resilience = config.resilience.clone();

        Self {
            connection: ResilientConnection::new(Neo4jConnector::new(config), &resilience),
            max_connections,
            acquire_timeout,
        }
    }

    /// Connects eagerly, so an unreachable graph fails the service at startup.
    pub async fn connect(&self) -> EtlResult<()> {
        self.connection
            .execute("neo4j_connect", |graph| async move {
                graph
                    .run(query("RETURN 1"))
                    .await
                    .map_err(neo4j_error_to_etl_error)
            })
            .await
    }

    pub fn spawn_health_monitor(&self, shutdown_rx: ShutdownRx) -> JoinHandle<()> {
        self.connection.spawn_health_monitor(shutdown_rx)
    }
}

/// Starts a transaction, waiting at most `acquire_timeout` for a pooled connection.
async fn start_txn(graph: &Graph, acquire_timeout: Duration) -> EtlResult<Txn> {
    match tokio::time::timeout(acquire_timeout, graph.start_txn()).await {
        Ok(result) => result.map_err(neo4j_error_to_etl_error),
        Err(_) => Err(etl_error!(
            ErrorKind::OperationTimedOut,
            "Timed out acquiring a Neo4j session",
            format!("no connection within {}ms", acquire_timeout.as_millis())
        )),
    }
}

async fn upsert_rows(
    graph: Graph,
    acquire_timeout: Duration,
    cypher: &str,
    rows: &[BoltType],
) -> EtlResult<u64> {
    let mut txn = start_txn(&graph, acquire_timeout).await?;

    let mut result = txn
        .execute(query(cypher).param("rows", rows.to_vec()))
        .await
        .map_err(neo4j_error_to_etl_error)?;

    let mut changed = 0;
    while let Some(row) = result
        .next(txn.handle())
        .await
        .map_err(neo4j_error_to_etl_error)?
    {
        let count: i64 = row.get("changed").map_err(|err| {
            etl_error!(
                ErrorKind::ConversionError,
                "Neo4j upsert did not return a change count",
                source: err
            )
        })?;
        changed += count.max(0) as u64;
    }

    txn.commit().await.map_err(neo4j_error_to_etl_error)?;

    Ok(changed)
}

impl Sink for Neo4jSink {
    fn name() -> &'static str {
        "neo4j"
    }

    async fn prepare(&self, data_types: &[DataType]) -> EtlResult<()> {
        for data_type in data_types.iter().copied() {
            self.connection
                .execute("neo4j_prepare", |graph| async move {
                    graph
                        .run(query(&create_constraint_cypher(data_type)))
                        .await
                        .map_err(neo4j_error_to_etl_error)
                })
                .await?;

            debug!(%data_type, label = data_type.node_label(), "neo4j constraint ready");
        }

        Ok(())
    }

    fn max_connections(&self) -> Option<u32> {
        Some(self.max_connections)
    }

    async fn upsert_batch(&self, data_type: DataType, records: Vec<ExtractedRecord>) -> EtlResult<u64> {
        let records = last_write_wins(records);
        if records.is_empty() {
            return Ok(0);
        }

        let rows = records
            .iter()
            .map(record_row)
            .collect::<EtlResult<Vec<_>>>()?;
        let cypher = upsert_cypher(data_type);
        let acquire_timeout = self.acquire_timeout;

        let started = Instant::now();
        let changed = self
            .connection
            .execute("neo4j_upsert", |graph| {
                upsert_rows(graph, acquire_timeout, &cypher, &rows)
            })
            .await?;

        histogram!(DISCOGS_SINK_UPSERT_SECONDS, SINK_LABEL => "neo4j")
            .record(started.elapsed().as_secs_f64());
        counter!(DISCOGS_SINK_ROWS_CHANGED_TOTAL, SINK_LABEL => "neo4j").increment(changed);
        debug!(%data_type, records = records.len(), changed, "neo4j batch committed");

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
