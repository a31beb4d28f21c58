//! Map-object API requests
//!
//! Builders only; nothing here performs IO. Every builder returns an
//! [`OpRequest`] ready for [`RemoteClient`](super::RemoteClient).

use rid_relay_shared::{now_ms, timing};
use serde_json::{json, Map, Value};

use super::op::OpRequest;
use super::signing::Method;

const API_PREFIX: &str = "/api/v1/map/";
const POSITION_REPORT_URL: &str = "https://caltopo.com/api/v1/position/report/";

/// Stroke styling for lines and live tracks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineStyle {
    pub width: u32,
    pub opacity: f64,
    pub color: &'static str,
    pub pattern: &'static str,
}

impl LineStyle {
    /// In-progress live tracks
    pub const LIVE: LineStyle = LineStyle {
        width: 2,
        opacity: 1.0,
        color: "#0000ff",
        pattern: "solid",
    };

    /// Finished tracks moved to the archive folder
    pub const ARCHIVE: LineStyle = LineStyle {
        width: 2,
        opacity: 0.5,
        color: "#ff00ff",
        pattern: "solid",
    };

    /// Apply this style to a feature's properties
    pub fn apply(&self, props: &mut Map<String, Value>) {
        props.insert("stroke-width".into(), json!(self.width));
        props.insert("stroke-opacity".into(), json!(self.opacity));
        props.insert("stroke".into(), json!(self.color));
        props.insert("pattern".into(), json!(self.pattern));
    }
}

/// Round to the seven decimals the backend stores
pub fn round7(value: f64) -> f64 {
    (value * 1e7).round() / 1e7
}

/// `[lng, lat]` pair as the backend expects
pub fn lng_lat(lat: f64, lng: f64) -> Value {
    json!([round7(lng), round7(lat)])
}

/// Stamp `updated` and `-updated-on` with the current time
pub fn touch(props: &mut Map<String, Value>) {
    let now = now_ms().to_string();
    props.insert("updated".into(), json!(now));
    props.insert("-updated-on".into(), json!(now));
}

/// Live-track device id for a drone in a tracking group
pub fn fleet_device_id(group_id: &str, remote_id: &str) -> String {
    format!("FLEET:{}-{}", group_id, remote_id)
}

/// Request builders for one map
#[derive(Debug, Clone, PartialEq)]
pub struct MapApi {
    map_id: String,
}

impl MapApi {
    pub fn new(map_id: impl Into<String>) -> Self {
        Self {
            map_id: map_id.into(),
        }
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    fn path(&self, rest: &str) -> String {
        format!("{}{}{}", API_PREFIX, self.map_id, rest)
    }

    /// Fetch features changed since `last_sync_ms` (zero for everything)
    pub fn since(&self, last_sync_ms: u64) -> OpRequest {
        let from = last_sync_ms.saturating_sub(timing::SYNC_OVERLAP_MS);
        let from = if last_sync_ms == 0 { 0 } else { from };
        OpRequest::signed(Method::Get, self.path(&format!("/since/{}", from)), None)
    }

    pub fn add_folder(&self, title: &str, visible: bool, labels_visible: bool) -> OpRequest {
        let body = json!({
            "properties": {
                "title": title,
                "visible": if visible { "true" } else { "false" },
                "labelVisible": if labels_visible { "true" } else { "false" },
            }
        });
        OpRequest::signed(Method::Post, self.path("/Folder"), Some(body))
    }

    /// Create or overwrite a marker
    ///
    /// `extra` is merged over the defaults, so it may override the colour.
    pub fn add_marker(
        &self,
        id: Option<&str>,
        lat: f64,
        lng: f64,
        title: &str,
        symbol: Option<&str>,
        folder_id: Option<&str>,
        extra: Map<String, Value>,
    ) -> OpRequest {
        let mut props = Map::new();
        props.insert("class".into(), json!("Marker"));
        props.insert("updated".into(), json!(now_ms()));
        props.insert("title".into(), json!(title));
        props.insert("marker-color".into(), json!("#FF0000"));
        props.insert("marker-symbol".into(), json!(symbol.filter(|s| !s.is_empty()).unwrap_or("point")));
        props.insert("marker-size".into(), json!("1"));
        props.insert("marker-visibility".into(), json!("visible"));
        if let Some(folder) = folder_id.filter(|f| !f.is_empty()) {
            props.insert("folderId".into(), json!(folder));
        }
        props.extend(extra);

        let mut top = json!({
            "type": "Feature",
            "properties": props,
            "geometry": { "type": "Point", "coordinates": lng_lat(lat, lng) },
        });
        let suffix = match id.filter(|i| !i.is_empty()) {
            Some(id) => {
                top["id"] = json!(id);
                format!("/Marker/{}", id)
            }
            None => "/Marker".to_string(),
        };
        OpRequest::signed(Method::Post, self.path(&suffix), Some(top))
    }

    /// Create a line, or append to an existing one when `id` is given
    pub fn add_line(
        &self,
        id: Option<&str>,
        coordinates: Vec<Value>,
        title: &str,
        description: &str,
        folder_id: Option<&str>,
        style: LineStyle,
    ) -> OpRequest {
        let mut props = Map::new();
        props.insert("class".into(), json!("Shape"));
        props.insert("updated".into(), json!(now_ms()));
        props.insert("title".into(), json!(title));
        props.insert("description".into(), json!(description));
        if let Some(folder) = folder_id.filter(|f| !f.is_empty()) {
            props.insert("folderId".into(), json!(folder));
        }
        style.apply(&mut props);

        let size = coordinates.len();
        let mut top = json!({
            "type": "Feature",
            "properties": props,
            "geometry": { "type": "LineString", "coordinates": coordinates, "size": size },
        });
        let suffix = match id.filter(|i| !i.is_empty()) {
            Some(id) => {
                top["id"] = json!(id);
                top["geometry"]["incremental"] = json!("true");
                format!("/Shape/{}", id)
            }
            None => "/Shape".to_string(),
        };
        OpRequest::signed(Method::Post, self.path(&suffix), Some(top))
    }

    /// Start a live track that the position-report endpoint feeds
    pub fn start_live_track(&self, title: &str, folder_id: Option<&str>, device_id: &str) -> OpRequest {
        let mut props = Map::new();
        props.insert("title".into(), json!(title));
        LineStyle::LIVE.apply(&mut props);
        props.insert("marker-symbol".into(), json!("icon-8T781R60-12-0.5-0.5-tf"));
        props.insert("class".into(), json!("LiveTrack"));
        if let Some(folder) = folder_id.filter(|f| !f.is_empty()) {
            props.insert("folderId".into(), json!(folder));
        }
        props.insert("deviceId".into(), json!(device_id));

        let body = json!({ "type": "Feature", "properties": props });
        OpRequest::signed(Method::Post, self.path("/LiveTrack"), Some(body))
    }

    /// Replace a feature of `class` with `feature`
    pub fn edit(&self, class: &str, id: &str, feature: Value) -> OpRequest {
        OpRequest::signed(Method::Post, self.path(&format!("/{}/{}", class, id)), Some(feature))
    }

    pub fn delete(&self, class: &str, id: &str) -> OpRequest {
        OpRequest::signed(Method::Delete, self.path(&format!("/{}/{}", class, id)), None)
    }
}

/// Convert a live-track feature into an archived shape in `archive_folder`
pub fn archived_shape(mut feature: Value, archive_folder: Option<&str>, coordinates: Option<Vec<Value>>) -> Value {
    if !feature.is_object() {
        feature = json!({});
    }
    feature["type"] = json!("Feature");
    if !feature["properties"].is_object() {
        feature["properties"] = json!({});
    }
    if let Some(props) = feature["properties"].as_object_mut() {
        LineStyle::ARCHIVE.apply(props);
        if let Some(folder) = archive_folder.filter(|f| !f.is_empty()) {
            props.insert("folderId".into(), json!(folder));
        }
        touch(props);
        props.insert("class".into(), json!("Shape"));
        props.remove("deviceId");
    }
    if let Some(coordinates) = coordinates {
        let size = coordinates.len();
        feature["geometry"] = json!({ "type": "LineString", "coordinates": coordinates, "size": size });
    }
    feature
}

/// Unsigned position report feeding a live track
pub fn position_report(group_id: &str, device_id: &str, lat: f64, lng: f64) -> OpRequest {
    OpRequest::unsigned(
        Method::Get,
        format!(
            "{}{}?id={}&lat={:.7}&lng={:.7}",
            POSITION_REPORT_URL, group_id, device_id, lat, lng
        ),
    )
}

/// Position report in the legacy fire-and-forget format
pub fn legacy_position_report(group_id: &str, remote_id: &str, lat: f64, lng: f64) -> OpRequest {
    OpRequest::unsigned(
        Method::Get,
        format!(
            "{}{}?id={}&lat={:.6}&lng={:.6}",
            POSITION_REPORT_URL, group_id, remote_id, lat, lng
        ),
    )
}
