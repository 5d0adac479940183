//! satellite - command-line replication client
//!
//! Streams transactions from a Satellite service, or pushes a captured oplog to it.

use clap::{Parser, Subcommand};
use satellite_client::types::DEFAULT_LSN;
use satellite_client::{
    to_transactions, AckType, ConnectivityNotifier, ConnectivityState, Direction, Lsn,
    OplogEntry, Relation, RelationColumn, RelationsByTable, ReplicationStatus,
    SatelliteClient, SatelliteClientConfig, SatelliteEvent, EventReceiver, TcpSocketFactory,
    TracingNotifier,
};
use satellite_protocol::message::RelationType;
use serde::Deserialize;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

const DB_NAME: &str = "satellite-cli";

#[derive(Parser)]
#[command(name = "satellite")]
#[command(about = "Replication client for the Satellite protocol")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "SATELLITE_CONFIG")]
    config: Option<PathBuf>,

    /// Service host
    #[arg(long)]
    host: Option<String>,

    /// Service port
    #[arg(long)]
    port: Option<u16>,

    /// Application id sent on authentication
    #[arg(long)]
    app: Option<String>,

    /// Authentication token
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Use plain TCP instead of TLS
    #[arg(long)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream inbound transactions as JSON lines
    Replicate {
        /// Resume after this LSN (hex); streams from the beginning if omitted
        #[arg(long)]
        lsn: Option<String>,
    },

    /// Send a captured oplog once the service asks for it
    Push {
        /// JSON array of oplog entries
        #[arg(long)]
        oplog: PathBuf,

        /// JSON schema file describing the replicated tables
        #[arg(long)]
        schema: PathBuf,
    },
}

impl Cli {
    fn client_config(&self) -> Result<SatelliteClientConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => SatelliteClientConfig::from_file(path)?,
            None => SatelliteClientConfig::default(),
        };
        config.apply_env_overrides();

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(app) = &self.app {
            config.app = app.clone();
        }
        if let Some(token) = &self.token {
            config.token = token.clone();
        }
        if self.insecure {
            config.insecure = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Logs connectivity and wakes the command loop once the socket is gone.
struct CliNotifier {
    disconnected: Arc<Notify>,
}

impl ConnectivityNotifier for CliNotifier {
    fn connectivity_state_change(&self, db_name: &str, state: ConnectivityState) {
        TracingNotifier.connectivity_state_change(db_name, state);
        if state == ConnectivityState::Disconnected {
            self.disconnected.notify_one();
        }
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    tables: Vec<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    id: u32,
    #[serde(default = "default_schema_name")]
    schema: String,
    table: String,
    columns: Vec<RelationColumn>,
}

fn default_schema_name() -> String {
    "public".to_string()
}

impl SchemaFile {
    fn into_relations(self) -> RelationsByTable {
        self.tables
            .into_iter()
            .map(|t| {
                let relation = Relation {
                    id: t.id,
                    schema: t.schema,
                    table: t.table.clone(),
                    table_type: RelationType::Table,
                    columns: t.columns,
                };
                (t.table, relation)
            })
            .collect()
    }
}

fn parse_lsn(hex_lsn: Option<&str>) -> Result<Lsn, Box<dyn Error>> {
    match hex_lsn {
        Some(s) => Ok(Lsn::from(hex::decode(s)?)),
        None => Ok(DEFAULT_LSN),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("cannot parse {}: {}", path.display(), e).into())
}

/// Whether `lsn` is at or before `bound`, comparing numerically.
fn lsn_covered(lsn: &Lsn, bound: &Lsn) -> bool {
    match (lsn.to_u64(), bound.to_u64()) {
        (Some(a), Some(b)) => a <= b,
        _ => false,
    }
}

async fn replicate(
    client: &SatelliteClient,
    events: &mut EventReceiver,
    disconnected: &Notify,
    lsn: Lsn,
) -> Result<(), Box<dyn Error>> {
    client.start_replication(lsn).await?;
    tracing::info!("replication started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal, stopping replication...");
                break;
            }
            _ = disconnected.notified() => {
                return Err("connection lost".into());
            }
            event = events.recv() => match event {
                Some(SatelliteEvent::Transaction(event)) => {
                    println!("{}", serde_json::to_string(&event.transaction)?);
                    event.ack.ack();
                }
                Some(SatelliteEvent::MigrationNotification(n)) => {
                    tracing::info!(
                        "schema migrated from {} to {}",
                        n.old_schema_version,
                        n.new_schema_version
                    );
                }
                Some(SatelliteEvent::Error(e)) => tracing::warn!("replication error: {}", e),
                Some(_) => {}
                None => break,
            }
        }
    }

    if client.replication_status(Direction::Inbound) == ReplicationStatus::Active {
        if let Err(e) = client.stop_replication().await {
            tracing::warn!("failed to stop replication: {}", e);
        }
    }
    Ok(())
}

async fn push(
    client: &SatelliteClient,
    events: &mut EventReceiver,
    disconnected: &Notify,
    oplog: &Path,
    schema: &Path,
) -> Result<(), Box<dyn Error>> {
    let relations = read_json::<SchemaFile>(schema)?.into_relations();
    let entries: Vec<OplogEntry> = read_json(oplog)?;
    let transactions = to_transactions(&entries, &relations)?;
    let Some(last_lsn) = transactions.last().map(|tx| tx.lsn.clone()) else {
        tracing::info!("oplog is empty, nothing to push");
        return Ok(());
    };
    tracing::info!(
        "assembled {} transaction(s) from {} oplog entries",
        transactions.len(),
        entries.len()
    );

    let mut pending = Some(transactions);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                return Err("interrupted before the service acknowledged the oplog".into());
            }
            _ = disconnected.notified() => {
                return Err("connection lost".into());
            }
            event = events.recv() => match event {
                Some(SatelliteEvent::OutboundStarted { lsn }) => {
                    tracing::info!("service requested the oplog after lsn {}", lsn);
                    for tx in pending.take().into_iter().flatten() {
                        if !lsn_covered(&tx.lsn, &lsn) {
                            client.enqueue_transaction(tx)?;
                        }
                    }
                    if lsn_covered(&last_lsn, &lsn) {
                        tracing::info!("service already has lsn {}", last_lsn);
                        return Ok(());
                    }
                }
                Some(SatelliteEvent::Ack { lsn, kind: AckType::RemoteCommit }) => {
                    tracing::debug!("service acknowledged lsn {}", lsn);
                    if lsn_covered(&last_lsn, &lsn) {
                        tracing::info!("oplog pushed up to lsn {}", last_lsn);
                        return Ok(());
                    }
                }
                Some(SatelliteEvent::Error(e)) => tracing::warn!("replication error: {}", e),
                Some(_) => {}
                None => return Err("client dropped".into()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    tracing::info!("connecting to {}", config.url());

    let disconnected = Arc::new(Notify::new());
    let factory = Arc::new(TcpSocketFactory::from_config(&config));
    let notifier = Arc::new(CliNotifier {
        disconnected: disconnected.clone(),
    });
    let (client, mut events) = SatelliteClient::new(DB_NAME, config, factory, notifier);

    client.connect().await?;
    let auth = client.authenticate().await?;
    tracing::info!("authenticated with {}", auth.server_id);

    let result = match &cli.command {
        Commands::Replicate { lsn } => {
            let lsn = parse_lsn(lsn.as_deref())?;
            replicate(&client, &mut events, &disconnected, lsn).await
        }
        Commands::Push { oplog, schema } => {
            push(&client, &mut events, &disconnected, oplog, schema).await
        }
    };

    client.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_file() {
        let json = r#"{
            "tables": [
                {"id": 1, "table": "parent", "columns": [
                    {"name": "id", "type": "INTEGER"},
                    {"name": "value", "type": "TEXT"}
                ]},
                {"id": 2, "schema": "main", "table": "child", "columns": []}
            ]
        }"#;
        let relations = serde_json::from_str::<SchemaFile>(json)
            .unwrap()
            .into_relations();

        let parent = &relations["parent"];
        assert_eq!(parent.id, 1);
        assert_eq!(parent.schema, "public");
        assert_eq!(parent.columns[1], RelationColumn::new("value", "TEXT"));
        assert_eq!(relations["child"].schema, "main");
    }

    #[test]
    fn test_parse_lsn() {
        assert!(parse_lsn(None).unwrap().is_empty());
        assert_eq!(parse_lsn(Some("0000000000000002")).unwrap(), Lsn::from_u64(2));
        assert!(parse_lsn(Some("xyz")).is_err());
    }

    #[test]
    fn test_lsn_covered() {
        assert!(lsn_covered(&Lsn::from_u64(1), &Lsn::from_u64(2)));
        assert!(lsn_covered(&Lsn::from_u64(2), &Lsn::from_u64(2)));
        assert!(!lsn_covered(&Lsn::from_u64(3), &Lsn::from_u64(2)));
        assert!(!lsn_covered(&Lsn::from_u64(1), &DEFAULT_LSN));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "satellite",
            "--app",
            "app-1",
            "--host",
            "sync.local",
            "--port",
            "30002",
            "--insecure",
            "replicate",
        ]);
        let config = cli.client_config().unwrap();
        assert_eq!(config.app, "app-1");
        assert_eq!(config.url(), "tcp://sync.local:30002");
    }
}
