//! Parsing of map features returned by the backend

use chrono::NaiveDate;
use rid_relay_shared::PeerAddress;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("Sync result missing '{0}'")]
    MissingField(&'static str),

    #[error("Feature is not an object")]
    NotObject,

    #[error("Bad peer address list: {0}")]
    BadAddrs(#[from] serde_json::Error),
}

/// Feature class as stored in `properties.class`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureClass {
    Folder,
    Marker,
    LiveTrack,
    Shape,
    Other(String),
}

impl FeatureClass {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Folder" => FeatureClass::Folder,
            "Marker" => FeatureClass::Marker,
            "LiveTrack" => FeatureClass::LiveTrack,
            "Shape" => FeatureClass::Shape,
            other => FeatureClass::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FeatureClass::Folder => "Folder",
            FeatureClass::Marker => "Marker",
            FeatureClass::LiveTrack => "LiveTrack",
            FeatureClass::Shape => "Shape",
            FeatureClass::Other(other) => other,
        }
    }
}

/// One feature of the map, with the fields the session cares about pulled out
#[derive(Debug, Clone)]
pub struct MapFeature {
    pub id: String,
    pub class: FeatureClass,
    pub title: String,
    pub folder_id: Option<String>,
    pub updated_ms: u64,
    /// The feature as received
    pub raw: Value,
}

impl MapFeature {
    pub fn from_value(raw: &Value) -> Result<Self, MapError> {
        let obj = raw.as_object().ok_or(MapError::NotObject)?;
        let props = obj.get("properties").ok_or(MapError::MissingField("properties"))?;
        let text = |key: &str| props.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        // `updated` arrives as a number or as a string of digits
        let updated_ms = match props.get("updated") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
            Some(Value::String(s)) => s.parse().unwrap_or_default(),
            _ => 0,
        };

        Ok(Self {
            id: obj.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            class: FeatureClass::parse(&text("class")),
            title: text("title"),
            folder_id: Some(text("folderId")).filter(|f| !f.is_empty()),
            updated_ms,
            raw: raw.clone(),
        })
    }

    pub fn in_folder(&self, folder_id: Option<&str>) -> bool {
        folder_id.is_some() && self.folder_id.as_deref() == folder_id
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.updated_ms)
    }
}

/// Result of a `since` request
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub timestamp: u64,
    pub features: Vec<MapFeature>,
}

/// Parse `{timestamp, state: {features: [...]}}`, skipping malformed features
pub fn parse_sync(result: &Value) -> Result<SyncResult, MapError> {
    let timestamp = result.get("timestamp").and_then(Value::as_u64).unwrap_or_default();
    let features = result
        .get("state")
        .and_then(|s| s.get("features"))
        .and_then(Value::as_array)
        .ok_or(MapError::MissingField("state.features"))?;

    let features = features
        .iter()
        .filter_map(|f| match MapFeature::from_value(f) {
            Ok(feature) => Some(feature),
            Err(e) => {
                tracing::debug!("Skipping feature: {}", e);
                None
            }
        })
        .collect();
    Ok(SyncResult { timestamp, features })
}

/// A peer announced by its rendezvous marker
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMarker {
    pub uuid: String,
    pub name: String,
    pub addrs: Vec<PeerAddress>,
}

impl PeerMarker {
    /// None for markers that are not rendezvous markers
    pub fn from_feature(feature: &MapFeature) -> Result<Option<Self>, MapError> {
        if feature.class != FeatureClass::Marker || feature.id.is_empty() {
            return Ok(None);
        }
        let props = &feature.raw["properties"];
        let Some(addrs) = props.get("r2c-ipaddrs").and_then(Value::as_str).filter(|a| !a.is_empty()) else {
            return Ok(None);
        };
        let addrs: Vec<PeerAddress> = serde_json::from_str(addrs)?;

        let name = props
            .get("r2c-name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| feature.title.trim_start_matches("R2C: ").to_string());
        Ok(Some(Self {
            uuid: feature.id.clone(),
            name,
            addrs,
        }))
    }
}

/// Dated archive folder title, e.g. `Drone Tracks19Oct`
pub fn archive_folder_name(base: &str, day: NaiveDate) -> String {
    format!("{}{}", base, day.format("%d%b"))
}

/// Drone label from a track title of the form `label_timestamp`
pub fn label_from_title(title: &str) -> &str {
    let cut = title.find('_').or_else(|| title.find('-'));
    match cut {
        Some(index) if index > 0 => &title[..index],
        _ => title,
    }
}
