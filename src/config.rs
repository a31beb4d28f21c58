//! Node configuration, import files and the persisted snapshot
//!
//! This module handles:
//! - Runtime configuration with sanitizing setters
//! - Credentials and drone-label import files
//! - A versioned snapshot behind a pluggable store

use async_trait::async_trait;
use rid_relay_shared::{timing, PeerAddress};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::drone::{sanitize_label, DroneSpec};
use crate::identity::Fix;
use crate::remote::ClientConfig;

/// Current snapshot layout
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown config file type '{0}'")]
    UnknownType(String),

    #[error("Label file has no map")]
    MissingMap,

    #[error("Illegal duplicate remoteId '{rid}' at table offset {index}")]
    DuplicateRemoteId { rid: String, index: usize },

    #[error("Empty remoteId at table offset {0}")]
    EmptyRemoteId(usize),
}

/// Credentials and host for the mapping backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub team_id: String,
    pub credential_id: String,
    pub credential_secret: String,
    pub domain: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            team_id: String::new(),
            credential_id: String::new(),
            credential_secret: String::new(),
            domain: "caltopo.com".into(),
        }
    }
}

impl BackendConfig {
    pub fn is_complete(&self) -> bool {
        !self.credential_id.is_empty() && !self.credential_secret.is_empty()
    }

    /// Settings for the backend worker
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            domain: self.domain.clone(),
            credential_id: self.credential_id.clone(),
            credential_secret: self.credential_secret.clone(),
            ..Default::default()
        }
    }
}

/// Configuration for a relay node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Display name announced to peers and shown on the rendezvous marker
    pub node_name: String,
    /// Seed for the node UUID
    pub device_id: String,
    /// Peer listener bind address
    pub listen_addr: String,
    pub map_id: String,
    pub group_id: String,
    pub track_folder: String,
    /// Publish through the map session (true) or legacy position reports
    pub use_direct: bool,
    pub min_distance_feet: u64,
    pub new_track_delay_secs: u64,
    pub max_display_age_secs: u64,
    /// Kept for the host application's own track export
    pub archive_dir: Option<PathBuf>,
    pub debug_level: u8,
    /// Static position used when no receiver supplies one
    pub position: Option<Fix>,
    /// Static address list, empty to enumerate interfaces
    pub addrs: Vec<PeerAddress>,
    pub backend: BackendConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            node_name: "rid-relay".into(),
            device_id: String::new(),
            listen_addr: format!("0.0.0.0:{}", timing::PEER_PORT),
            map_id: String::new(),
            group_id: String::new(),
            track_folder: "Drone Tracks".into(),
            use_direct: true,
            min_distance_feet: timing::MIN_DISTANCE_FEET,
            new_track_delay_secs: timing::DEFAULT_NEW_TRACK_DELAY_SECS,
            max_display_age_secs: timing::DEFAULT_MAX_DISPLAY_AGE_SECS,
            archive_dir: None,
            debug_level: 0,
            position: None,
            addrs: Vec::new(),
            backend: BackendConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Map ids are alphanumeric only
    pub fn set_map_id(&mut self, raw: &str) -> bool {
        let clean = sanitize_label(raw);
        replace_if_changed(&mut self.map_id, clean)
    }

    /// Group ids are upper-case alphanumeric only
    pub fn set_group_id(&mut self, raw: &str) -> bool {
        let clean: String = raw
            .chars()
            .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            .collect();
        replace_if_changed(&mut self.group_id, clean)
    }

    pub fn set_track_folder(&mut self, raw: &str) -> bool {
        let clean = raw.trim().to_string();
        if clean.is_empty() {
            return false;
        }
        replace_if_changed(&mut self.track_folder, clean)
    }

    pub fn set_new_track_delay_secs(&mut self, secs: u64) -> bool {
        let secs = secs.max(timing::MIN_NEW_TRACK_DELAY_SECS);
        let changed = self.new_track_delay_secs != secs;
        self.new_track_delay_secs = secs;
        changed
    }

    pub fn set_min_distance_feet(&mut self, feet: u64) -> bool {
        let feet = feet.max(timing::MIN_DISTANCE_FEET);
        let changed = self.min_distance_feet != feet;
        self.min_distance_feet = feet;
        changed
    }

    /// Clamp loaded values into range
    pub fn normalize(mut self) -> Self {
        let map_id = self.map_id.clone();
        let group_id = self.group_id.clone();
        self.set_map_id(&map_id);
        self.set_group_id(&group_id);
        self.set_new_track_delay_secs(self.new_track_delay_secs);
        self.set_min_distance_feet(self.min_distance_feet);
        if self.track_folder.trim().is_empty() {
            self.track_folder = RelayConfig::default().track_folder;
        }
        self
    }

    pub fn new_track_delay(&self) -> Duration {
        Duration::from_secs(self.new_track_delay_secs)
    }

    /// Apply a credentials file; returns true if anything changed
    pub fn apply_credentials(&mut self, file: &CredentialsFile) -> bool {
        let mut changed = false;
        if !file.track_folder.is_empty() {
            changed |= self.set_track_folder(&file.track_folder);
        }
        if !file.map_id.is_empty() {
            changed |= self.set_map_id(&file.map_id);
        }
        if !file.group_id.is_empty() {
            changed |= self.set_group_id(&file.group_id);
        }
        let backend = BackendConfig {
            team_id: file.team_id.clone(),
            credential_id: file.credential_id.clone(),
            credential_secret: file.credential_secret.clone(),
            domain: self.backend.domain.clone(),
        };
        if backend != self.backend {
            self.backend = backend;
            changed = true;
        }
        if self.use_direct != file.use_direct_flag {
            self.use_direct = file.use_direct_flag;
            changed = true;
        }
        changed
    }
}

fn replace_if_changed(slot: &mut String, value: String) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Contents of a `ct_credentials` file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CredentialsFile {
    pub team_id: String,
    pub credential_id: String,
    pub credential_secret: String,
    pub track_folder: String,
    pub map_id: String,
    pub group_id: String,
    pub use_direct_flag: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RidMapEntry {
    remote_id: String,
    mapped_id: String,
    org: String,
    model: String,
    owner: String,
}

/// Contents of a `ct_ridmap` file
#[derive(Debug, Clone)]
pub struct LabelFile {
    pub specs: Vec<DroneSpec>,
    pub replace: bool,
}

/// A parsed import file
#[derive(Debug, Clone)]
pub enum ConfigFile {
    Credentials(CredentialsFile),
    Labels(LabelFile),
}

impl ConfigFile {
    /// Parse file contents, dispatching on the top-level `type`
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let json: Value = serde_json::from_str(text)?;
        let kind = json
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let version = json.get("file_version").and_then(Value::as_str).unwrap_or("?");
        debug!("Reading v{} {} config file", version, kind);

        match kind.as_str() {
            "ct_credentials" => Ok(ConfigFile::Credentials(serde_json::from_value(json)?)),
            "ct_ridmap" => parse_labels(&json).map(ConfigFile::Labels),
            _ => Err(ConfigError::UnknownType(kind)),
        }
    }

    /// Read and parse a file from disk
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }
}

fn parse_labels(json: &Value) -> Result<LabelFile, ConfigError> {
    let entries = json.get("map").ok_or(ConfigError::MissingMap)?;
    let entries: Vec<RidMapEntry> = serde_json::from_value(entries.clone())?;
    let replace = json.get("load_type").and_then(Value::as_str) == Some("replace");

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let mut spec = DroneSpec::new(&entry.remote_id).ok_or(ConfigError::EmptyRemoteId(index))?;
        if !seen.insert(entry.remote_id.clone()) {
            return Err(ConfigError::DuplicateRemoteId {
                rid: entry.remote_id,
                index,
            });
        }
        spec.set_mapped_id(&entry.mapped_id);
        spec.org = entry.org;
        spec.model = entry.model;
        spec.owner = entry.owner;
        specs.push(spec);
    }
    Ok(LabelFile { specs, replace })
}

/// Everything persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub node_uuid: String,
    pub config: RelayConfig,
    #[serde(default)]
    pub drones: Vec<DroneSpec>,
}

impl Snapshot {
    pub fn new(node_uuid: impl Into<String>, config: RelayConfig, drones: Vec<DroneSpec>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            node_uuid: node_uuid.into(),
            config,
            drones,
        }
    }
}

/// Load/save interface for the snapshot
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The stored snapshot, None if absent or unusable
    async fn load(&self) -> anyhow::Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

/// Snapshot stored as a JSON file, replaced atomically
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Io { path: self.path.clone(), source: e }.into()),
        };

        let snapshot: Snapshot = match serde_json::from_str(&text) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable snapshot {}: {}", self.path.display(), e);
                return Ok(None);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "Ignoring snapshot {} with unsupported version {}",
                self.path.display(),
                snapshot.version
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let text = serde_json::to_string_pretty(snapshot).map_err(ConfigError::Json)?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, text).await.map_err(io_err)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(io_err)?;
        debug!("Snapshot saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory store for coordinator tests
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub saved: Mutex<Vec<Snapshot>>,
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn load(&self) -> anyhow::Result<Option<Snapshot>> {
            Ok(self.saved.lock().unwrap().last().cloned())
        }

        async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[test]
    fn test_setters_sanitize() {
        let mut config = RelayConfig::default();
        assert!(config.set_map_id(" ab-12_C "));
        assert_eq!(config.map_id, "ab12C");
        assert!(!config.set_map_id("ab12C"));

        assert!(config.set_group_id("sar-Team 7A"));
        assert_eq!(config.group_id, "T7A");

        config.set_new_track_delay_secs(3);
        assert_eq!(config.new_track_delay_secs, timing::MIN_NEW_TRACK_DELAY_SECS);
        config.set_min_distance_feet(0);
        assert_eq!(config.min_distance_feet, timing::MIN_DISTANCE_FEET);
        assert!(!config.set_track_folder("   "));
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let config: RelayConfig = serde_json::from_str(r#"{"map_id": "M1", "new_track_delay_secs": 1}"#).unwrap();
        let config = config.normalize();
        assert_eq!(config.map_id, "M1");
        assert_eq!(config.track_folder, "Drone Tracks");
        assert_eq!(config.new_track_delay_secs, 15);
        assert!(config.use_direct);
        assert_eq!(config.backend.domain, "caltopo.com");
    }

    #[test]
    fn test_parse_credentials_file() {
        let text = r#"{
            "type": " CT_Credentials ", "file_version": "1.2",
            "team_id": "T1", "credential_id": "C1", "credential_secret": "c2VjcmV0",
            "map_id": "MAP9", "group_id": "GRP", "use_direct_flag": true
        }"#;
        let ConfigFile::Credentials(file) = ConfigFile::parse(text).unwrap() else {
            panic!("expected credentials");
        };
        let mut config = RelayConfig::default();
        assert!(config.apply_credentials(&file));
        assert_eq!(config.map_id, "MAP9");
        assert_eq!(config.backend.credential_id, "C1");
        assert!(config.backend.is_complete());
        assert!(!config.apply_credentials(&file));
    }

    #[test]
    fn test_parse_label_file() {
        let text = r#"{
            "type": "ct_ridmap", "load_type": "replace",
            "map": [
                {"remoteId": "1581F5", "mappedId": "Red One", "org": "SAR"},
                {"remoteId": "1581F6", "mappedId": ""}
            ]
        }"#;
        let ConfigFile::Labels(file) = ConfigFile::parse(text).unwrap() else {
            panic!("expected labels");
        };
        assert!(file.replace);
        assert_eq!(file.specs[0].mapped_id(), "RedOne");
        assert_eq!(file.specs[0].org, "SAR");
        assert_eq!(file.specs[1].mapped_id(), "1581F6");
    }

    #[test]
    fn test_label_file_rejects_duplicates() {
        let text = r#"{"type": "ct_ridmap", "map": [{"remoteId": "A"}, {"remoteId": "A"}]}"#;
        assert!(matches!(
            ConfigFile::parse(text),
            Err(ConfigError::DuplicateRemoteId { index: 1, .. })
        ));
        let text = r#"{"type": "ct_ridmap"}"#;
        assert!(matches!(ConfigFile::parse(text), Err(ConfigError::MissingMap)));
        assert!(matches!(ConfigFile::parse(r#"{"type": "x"}"#), Err(ConfigError::UnknownType(_))));
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("node.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut spec = DroneSpec::new("D1").unwrap();
        spec.set_mapped_id("Alpha");
        let snapshot = Snapshot::new("uuid-1", RelayConfig::default(), vec![spec]);
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.node_uuid, "uuid-1");
        assert_eq!(loaded.drones[0].mapped_id(), "Alpha");
        assert_eq!(loaded.config, RelayConfig::default());
    }

    #[tokio::test]
    async fn test_snapshot_with_unknown_version_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut snapshot = Snapshot::new("uuid-1", RelayConfig::default(), vec![]);
        snapshot.version = 99;
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        assert!(JsonFileStore::new(path).load().await.unwrap().is_none());
    }
}
