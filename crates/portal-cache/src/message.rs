use serde::{Deserialize, Serialize};

/// Messages published on the `data-portal` channel, JSON-encoded UTF-8.
/// The external tag is the wire format: `{"uri": {...}}`, `{"chunk": {...}}`,
/// `{"shutdown": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortalMessage {
    #[serde(rename = "uri")]
    Uri(UriMessage),
    #[serde(rename = "chunk")]
    Chunk(ChunkMessage),
    /// Stops the worker, honored only in development mode.
    #[serde(rename = "shutdown")]
    Shutdown(bool),
}

/// Ask the worker to open a dataset and cache its zarr metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UriMessage {
    /// Source path; aggregated views join member paths with `;`.
    pub path: String,
    /// The cache token the result is stored under.
    pub uuid: String,
    /// Aggregation options for multi-dataset conversions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Ask the worker to encode one chunk of a finished dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub uuid: String,
    pub chunk: String,
    pub variable: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format_is_externally_tagged() {
        let msg = PortalMessage::Uri(UriMessage {
            path: "/a.nc".to_string(),
            uuid: "tok".to_string(),
            options: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, serde_json::json!({"uri": {"path": "/a.nc", "uuid": "tok"}}));

        let chunk: PortalMessage = serde_json::from_str(
            r#"{"chunk": {"uuid": "tok", "chunk": "0.0.0", "variable": "tas"}}"#,
        )
        .unwrap();
        assert_eq!(
            chunk,
            PortalMessage::Chunk(ChunkMessage {
                uuid: "tok".to_string(),
                chunk: "0.0.0".to_string(),
                variable: "tas".to_string(),
            })
        );

        let shutdown: PortalMessage = serde_json::from_str(r#"{"shutdown": true}"#).unwrap();
        assert_eq!(shutdown, PortalMessage::Shutdown(true));
    }
}
