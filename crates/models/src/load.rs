use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State machine of a zarr load job. Cache eviction re-drives the machine
/// from `Submitted` on the next access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Finished,
    Failed,
    Submitted,
    InProgress,
    Unknown,
}

impl LoadState {
    pub fn code(&self) -> u8 {
        match self {
            LoadState::Finished => 0,
            LoadState::Failed => 1,
            LoadState::Submitted => 2,
            LoadState::InProgress => 3,
            LoadState::Unknown => 5,
        }
    }

    pub fn from_code(code: u8) -> LoadState {
        match code {
            0 => LoadState::Finished,
            1 => LoadState::Failed,
            2 => LoadState::Submitted,
            3 => LoadState::InProgress,
            _ => LoadState::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoadState::Finished => "finished, ok",
            LoadState::Failed => "finished, failed",
            LoadState::Submitted => "waiting",
            LoadState::InProgress => "processing",
            LoadState::Unknown => "unknown",
        }
    }

    /// Terminal states: only `Failed` is retriable, via resubmission.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Finished | LoadState::Failed)
    }
}

impl Serialize for LoadState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for LoadState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(LoadState::from_code(u8::deserialize(deserializer)?))
    }
}

/// The cache entry stored under a load token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStatus {
    pub status: LoadState,
    /// Public zarr endpoint path of this dataset.
    pub obj_path: String,
    /// Populated when `status == Failed`.
    pub reason: String,
    /// Consolidated zarr v2 metadata (`.zmetadata` layout).
    pub meta: Option<Value>,
    /// JSON-safe projection of `meta` (compressors as config dicts).
    pub json_meta: Option<Value>,
    /// Host that materialized the store.
    pub url: String,
}

impl LoadStatus {
    pub fn submitted(obj_path: &str) -> Self {
        Self {
            status: LoadState::Submitted,
            obj_path: obj_path.to_string(),
            reason: String::new(),
            meta: None,
            json_meta: None,
            url: String::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for state in [
            LoadState::Finished,
            LoadState::Failed,
            LoadState::Submitted,
            LoadState::InProgress,
            LoadState::Unknown,
        ] {
            assert_eq!(state, LoadState::from_code(state.code()));
        }
        // Codes without a meaning map to Unknown.
        assert_eq!(LoadState::from_code(4), LoadState::Unknown);
    }

    #[test]
    fn status_serializes_with_numeric_code() {
        let status = LoadStatus::submitted("/api/floe/data-portal/zarr/abc.zarr");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], 2);
        let back: LoadStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back.status, LoadState::Submitted);
    }
}
