use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
    Unknown,
}

/// ===== Root =====
///
/// Missing fields deserialize to their zero value. The raw bytes an event was
/// parsed from are what gets indexed, so nothing here is ever re-serialized
/// on the indexing path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    /// Previous state, shape owned by the upstream source
    pub before: Option<serde_json::Value>,

    #[serde(deserialize_with = "null_as_default")]
    pub after: After,

    pub op: String,

    #[serde(rename = "ts_ms")]
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct After {
    pub key: String,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Value {
    #[serde(rename = "type")]
    pub value_type: i64,
    pub object: Option<Object>,
}

/// ===== Node snapshot =====
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Object {
    pub id: String,

    #[serde(rename = "type")]
    pub object_type: String,

    #[serde(deserialize_with = "null_as_default")]
    pub labels: Labels,

    pub version: String,
    pub hostname: String,
    pub last_ping: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub config_hash: String,
    pub process_conf: Option<ProcessConf>,
    pub connection_state: Option<ConnectionState>,
    pub data_plane_cert_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Labels {
    pub region: String,
    pub provider: String,

    #[serde(rename = "managed-by")]
    pub managed_by: String,

    #[serde(rename = "network-id")]
    pub network_id: String,

    #[serde(rename = "dp-group-id")]
    pub dp_group_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConf {
    pub plugins: Vec<String>,
    pub lmdb_map_size: String,
    pub router_flavor: String,
    pub cluster_max_payload: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionState {
    pub is_connected: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Key of the entity this event describes, `None` when empty
    pub fn document_key(&self) -> Option<&str> {
        let key = self.after.key.as_str();
        (!key.is_empty()).then_some(key)
    }

    pub fn operation(&self) -> Operation {
        match self.op.as_str() {
            "c" => Operation::Create,
            "u" => Operation::Update,
            "d" => Operation::Delete,
            "r" => Operation::Read,
            _ => Operation::Unknown,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.ts_ms)
    }
}
