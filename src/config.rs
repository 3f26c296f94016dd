//! Configuration surface for the hypertable event streamer.
//!
//! Mirrors the teacher's env-var loader (`SCREAMING_SNAKE` names, one
//! `ReplicationResult<Config>` constructor with validation) but widens it to
//! the full option table: connection/slot/publication settings, sink
//! selection, offset-store backend, partition count and heartbeat cadence.
//! A TOML file, when given, is loaded first and overlaid by environment
//! variables so a deployment can keep secrets out of the file.

use crate::errors::{StreamerError, StreamerResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const DEFAULT_PUBLICATION_NAME: &str = "pg_ts_streamer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkType {
    Kafka,
    Kinesis,
    Sqs,
    Nats,
    Redis,
    Stdout,
}

impl SinkType {
    fn parse(value: &str) -> StreamerResult<Self> {
        match value.to_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "kinesis" => Ok(Self::Kinesis),
            "sqs" => Ok(Self::Sqs),
            "nats" => Ok(Self::Nats),
            "redis" => Ok(Self::Redis),
            "stdout" => Ok(Self::Stdout),
            other => Err(StreamerError::config(format!("unrecognized sink.type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStorageType {
    File,
}

impl StateStorageType {
    fn parse(value: &str) -> StreamerResult<Self> {
        match value.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            other => Err(StreamerError::config(format!("unrecognized statestorage.type '{other}'"))),
        }
    }
}

/// The full recognized configuration surface from the external-interfaces
/// table: PostgreSQL connection/slot/publication settings, sink selection,
/// offset-store backend, and the partitioning/heartbeat knobs shared by the
/// dispatcher and snapshotter.
#[derive(Debug, Clone)]
pub struct Config {
    pub postgresql_connection: String,
    pub postgresql_password: Option<String>,
    pub publication_name: String,
    pub replication_slot_name: String,
    pub replication_slot_create: bool,
    pub replication_slot_autodrop: bool,
    pub topic_prefix: String,
    pub sink_type: SinkType,
    pub sink_endpoint: Option<String>,
    pub state_storage_type: StateStorageType,
    pub state_storage_file_path: String,
    pub partition_count: u8,
    pub heartbeat_interval: Duration,
}

/// Overlay file, parsed with `serde`/`toml`. Every field is optional; a
/// present field overrides the built-in default, and is itself overridden
/// by the matching environment variable.
#[derive(Debug, Default, Deserialize)]
struct FileOverlay {
    #[serde(default)]
    postgresql: Option<PostgresqlSection>,
    #[serde(default)]
    topic: Option<TopicSection>,
    #[serde(default)]
    sink: Option<SinkSection>,
    #[serde(default)]
    statestorage: Option<StateStorageSection>,
    #[serde(default)]
    partitioncount: Option<u8>,
    #[serde(default)]
    heartbeat: Option<HeartbeatSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PostgresqlSection {
    connection: Option<String>,
    password: Option<String>,
    publication: Option<NamedSection>,
    replicationslot: Option<ReplicationSlotSection>,
}

#[derive(Debug, Default, Deserialize)]
struct NamedSection {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReplicationSlotSection {
    name: Option<String>,
    create: Option<bool>,
    autodrop: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TopicSection {
    prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SinkSection {
    #[serde(rename = "type")]
    sink_type: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StateStorageSection {
    #[serde(rename = "type")]
    storage_type: Option<String>,
    file: Option<FileSection>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSection {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatSection {
    interval: Option<u64>,
}

impl Config {
    /// Loads the TOML overlay (if a path is given), then lets every
    /// environment variable in the external-interfaces table override the
    /// matching field, the same two-step precedence the teacher's
    /// `config::load_config_from_env` follows with its env-var defaults.
    pub fn load(file_path: Option<&Path>) -> StreamerResult<Self> {
        let overlay = match file_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|err| StreamerError::config(format!("reading config file {}: {err}", path.display())))?;
                toml::from_str(&text).map_err(|err| StreamerError::config(format!("parsing config file {}: {err}", path.display())))?
            }
            None => FileOverlay::default(),
        };

        let postgresql_connection = env_or("POSTGRESQL_CONNECTION")
            .or_else(|| overlay.postgresql.as_ref().and_then(|p| p.connection.clone()))
            .ok_or_else(|| StreamerError::config("missing postgresql.connection (POSTGRESQL_CONNECTION)"))?;

        let postgresql_password =
            env_or("POSTGRESQL_PASSWORD").or_else(|| overlay.postgresql.as_ref().and_then(|p| p.password.clone()));

        let publication_name = env_or("POSTGRESQL_PUBLICATION_NAME")
            .or_else(|| overlay.postgresql.as_ref().and_then(|p| p.publication.as_ref()?.name.clone()))
            .unwrap_or_else(|| DEFAULT_PUBLICATION_NAME.to_string());

        let slot_section = overlay.postgresql.as_ref().and_then(|p| p.replicationslot.as_ref());
        let replication_slot_name = env_or("POSTGRESQL_REPLICATIONSLOT_NAME")
            .or_else(|| slot_section.and_then(|s| s.name.clone()))
            .ok_or_else(|| StreamerError::config("missing postgresql.replicationslot.name (POSTGRESQL_REPLICATIONSLOT_NAME)"))?;
        let replication_slot_create = env_bool("POSTGRESQL_REPLICATIONSLOT_CREATE")
            .or_else(|| slot_section.and_then(|s| s.create))
            .unwrap_or(false);
        let replication_slot_autodrop = env_bool("POSTGRESQL_REPLICATIONSLOT_AUTODROP")
            .or_else(|| slot_section.and_then(|s| s.autodrop))
            .unwrap_or(false);

        let topic_prefix = env_or("TOPIC_PREFIX")
            .or_else(|| overlay.topic.as_ref().and_then(|t| t.prefix.clone()))
            .unwrap_or_else(random_topic_prefix);

        let sink_section = overlay.sink.as_ref();
        let sink_type_str = env_or("SINK_TYPE")
            .or_else(|| sink_section.and_then(|s| s.sink_type.clone()))
            .unwrap_or_else(|| "stdout".to_string());
        let sink_type = SinkType::parse(&sink_type_str)?;
        let sink_endpoint = env_or("SINK_ENDPOINT").or_else(|| sink_section.and_then(|s| s.endpoint.clone()));

        let storage_section = overlay.statestorage.as_ref();
        let state_storage_type_str = env_or("STATESTORAGE_TYPE")
            .or_else(|| storage_section.and_then(|s| s.storage_type.clone()))
            .unwrap_or_else(|| "file".to_string());
        let state_storage_type = StateStorageType::parse(&state_storage_type_str)?;
        let state_storage_file_path = env_or("STATESTORAGE_FILE_PATH")
            .or_else(|| storage_section.and_then(|s| s.file.as_ref()?.path.clone()))
            .unwrap_or_else(|| "offsets.bin".to_string());

        let partition_count = env_or("PARTITIONCOUNT")
            .and_then(|v| v.parse::<u8>().ok())
            .or(overlay.partitioncount)
            .unwrap_or(8);
        if !(1..=255).contains(&partition_count) {
            return Err(StreamerError::config(format!("partitioncount must be 1..=255, got {partition_count}")));
        }

        let heartbeat_secs = env_or("HEARTBEAT_INTERVAL")
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| overlay.heartbeat.as_ref().and_then(|h| h.interval))
            .unwrap_or(10);

        let config = Config {
            postgresql_connection,
            postgresql_password,
            publication_name,
            replication_slot_name,
            replication_slot_create,
            replication_slot_autodrop,
            topic_prefix,
            sink_type,
            sink_endpoint,
            state_storage_type,
            state_storage_file_path,
            partition_count,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
        };

        info!(
            publication = %config.publication_name,
            slot = %config.replication_slot_name,
            sink = ?config.sink_type,
            partitions = config.partition_count,
            "loaded configuration"
        );

        Ok(config)
    }

    /// The libpq connection string, with `postgresql_password` spliced in
    /// when the URL doesn't already carry one.
    pub fn connection_string(&self) -> String {
        match &self.postgresql_password {
            Some(password) if !self.postgresql_connection.contains("password=") => {
                format!("{} password={}", self.postgresql_connection, password)
            }
            _ => self.postgresql_connection.clone(),
        }
    }
}

fn env_or(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_or(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// A random 20-character lowercase topic prefix, matching the default the
/// teacher's sinks fall back to when `topic.prefix` isn't configured. Built
/// from a v4 UUID's hex digits, which are already lowercase.
fn random_topic_prefix() -> String {
    Uuid::new_v4().simple().to_string().chars().take(20).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "POSTGRESQL_CONNECTION",
            "POSTGRESQL_PASSWORD",
            "POSTGRESQL_PUBLICATION_NAME",
            "POSTGRESQL_REPLICATIONSLOT_NAME",
            "POSTGRESQL_REPLICATIONSLOT_CREATE",
            "POSTGRESQL_REPLICATIONSLOT_AUTODROP",
            "TOPIC_PREFIX",
            "SINK_TYPE",
            "SINK_ENDPOINT",
            "STATESTORAGE_TYPE",
            "STATESTORAGE_FILE_PATH",
            "PARTITIONCOUNT",
            "HEARTBEAT_INTERVAL",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn missing_connection_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let err = Config::load(None).unwrap_err();
        assert!(matches!(err, StreamerError::Config { .. }));
    }

    #[test]
    fn loads_from_environment_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("POSTGRESQL_CONNECTION", "host=localhost dbname=test");
            std::env::set_var("POSTGRESQL_REPLICATIONSLOT_NAME", "streamer_slot");
        }
        let config = Config::load(None).unwrap();
        assert_eq!(config.publication_name, DEFAULT_PUBLICATION_NAME);
        assert_eq!(config.sink_type, SinkType::Stdout);
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.topic_prefix.len(), 20);
        clear_env();
    }

    #[test]
    fn rejects_out_of_range_partition_count() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("POSTGRESQL_CONNECTION", "host=localhost dbname=test");
            std::env::set_var("POSTGRESQL_REPLICATIONSLOT_NAME", "streamer_slot");
            std::env::set_var("PARTITIONCOUNT", "0");
        }
        assert!(Config::load(None).is_err());
        clear_env();
    }
}
