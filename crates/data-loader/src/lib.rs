//! The data-loader worker: subscribes to the portal channel, opens source
//! datasets, materializes zarr metadata into the shared cache, and encodes
//! chunks on demand. It never answers HTTP; the cache is the only contract
//! with the gateway.

use data_engines::{aggregate, AggregationOptions, Dataset};
use models::{LoadState, LoadStatus};
use portal_cache::{Cache, CacheToken, ChunkMessage, PortalMessage, UriMessage};
use std::sync::Arc;
use zarr_view::{encode_chunk, get_data_chunk, ZMetadata};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] data_engines::EngineError),
    #[error(transparent)]
    Aggregation(#[from] data_engines::AggregationError),
    #[error(transparent)]
    Cache(#[from] portal_cache::CacheError),
    #[error("{0} uuid does not exist (anymore)")]
    MissingEntry(String),
    #[error("dataset is not ready: {0}")]
    NotReady(&'static str),
    #[error("{0}")]
    Chunk(String),
}

/// Open all member paths and combine them into the served store: the
/// dataset handle (group variables prefixed `groupN/`) plus its
/// consolidated metadata.
pub fn materialize(
    paths: &[String],
    options: &AggregationOptions,
) -> Result<(Dataset, ZMetadata), WorkerError> {
    let mut datasets = Vec::with_capacity(paths.len());
    for path in paths {
        datasets.push(data_engines::open_dataset(path)?);
    }

    if datasets.len() == 1 {
        let dataset = datasets.into_iter().next().expect("one dataset");
        let meta = data_engines::create_zmetadata(&dataset)?;
        return Ok((dataset, meta));
    }

    let mut groups = aggregate(&datasets, options)?;
    if groups.len() == 1 {
        let (_, dataset) = groups.pop().expect("one group");
        let meta = data_engines::create_zmetadata(&dataset)?;
        return Ok((dataset, meta));
    }

    // Grouped stores become zarr groups with prefixed metadata keys.
    let mut meta = ZMetadata::new();
    let mut handle = Dataset {
        path: paths.join(";"),
        attrs: Default::default(),
        dims: Default::default(),
        variables: Default::default(),
    };
    for (group, dataset) in groups {
        meta.absorb(Some(&group), data_engines::create_zmetadata(&dataset)?);
        for (dim, size) in &dataset.dims {
            handle.dims.entry(format!("{group}/{dim}")).or_insert(*size);
        }
        for (name, variable) in dataset.variables {
            handle.variables.insert(format!("{group}/{name}"), variable);
        }
    }
    Ok((handle, meta))
}

/// Encode one chunk of a finished dataset: read through the engine, pad the
/// edge, run filters then the compressor.
pub fn chunk_bytes(
    dataset: &Dataset,
    meta: &ZMetadata,
    variable: &str,
    chunk_id: &str,
) -> Result<Vec<u8>, WorkerError> {
    let zarray = meta
        .array_meta(variable)
        .ok_or_else(|| WorkerError::Chunk(format!("unknown variable {variable:?}")))?;
    let var = dataset.variable(variable)?;
    let data = var.read()?;
    let out_shape: Vec<usize> = zarray.chunks.iter().map(|c| *c as usize).collect();
    let chunk = get_data_chunk(&data, chunk_id, &out_shape)
        .map_err(|e| WorkerError::Chunk(e.to_string()))?;
    let filters = zarray.filters.clone().unwrap_or_default();
    Ok(encode_chunk(
        chunk.to_c_bytes(),
        &filters,
        zarray.compressor.as_ref(),
    )
    .map_err(|e| WorkerError::Chunk(e.to_string()))?)
}

/// The long-running consumer. Messages are handled one at a time off the
/// channel; dataset opens and chunk computation run on the blocking pool,
/// bounded by the worker semaphore.
pub struct ProcessQueue {
    cache: Cache,
    cache_exp: u64,
    zarr_base: String,
    dev_mode: bool,
    pool: Arc<tokio::sync::Semaphore>,
    /// Some engine backends are not thread-safe; opens are serialized.
    open_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ProcessQueue {
    pub fn new(cache: Cache, cache_exp: u64, zarr_base: String, dev_mode: bool) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(15);
        Self {
            cache,
            cache_exp,
            zarr_base,
            dev_mode,
            pool: Arc::new(tokio::sync::Semaphore::new(workers)),
            open_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Subscribe and serve until the connection closes (or, in development
    /// mode, a shutdown message arrives).
    pub async fn run_for_ever(self: Arc<Self>) -> anyhow::Result<()> {
        let mut subscription = self.cache.subscribe().await?;
        tracing::info!("broker will listen for messages now");
        while let Some(payload) = subscription.next_payload().await {
            if payload.is_empty() {
                continue;
            }
            let message: PortalMessage = match serde_json::from_slice(&payload) {
                Ok(message) => message,
                Err(_) => {
                    tracing::warn!("could not decode message");
                    continue;
                }
            };
            match message {
                PortalMessage::Shutdown(true) if self.dev_mode => {
                    tracing::info!("shutdown requested");
                    break;
                }
                PortalMessage::Shutdown(_) => {}
                PortalMessage::Uri(uri) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = this.spawn_load(uri).await {
                            tracing::error!(%error, "load job failed");
                        }
                    });
                }
                PortalMessage::Chunk(chunk) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = this.get_zarr_chunk(chunk).await {
                            tracing::error!(%error, "chunk job failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    fn obj_path(&self, token: &CacheToken) -> String {
        format!("{}/{}.zarr", self.zarr_base, token)
    }

    /// Execute one load job: decide from the cached state, mark
    /// IN_PROGRESS, open and describe the dataset, cache the outcome.
    pub async fn spawn_load(&self, message: UriMessage) -> Result<(), WorkerError> {
        let token = CacheToken::from_string(message.uuid.clone());
        tracing::debug!(path = %message.path, uuid = %message.uuid, "assigning for processing");

        let mut status = match self.cache.get_status(&token).await? {
            None => LoadStatus::submitted(&self.obj_path(&token)),
            Some(status) if status.status == LoadState::Finished => return Ok(()),
            Some(status) => status,
        };

        status.status = LoadState::InProgress;
        status.reason = String::new();
        self.cache
            .set_status(&token, &status, self.cache_exp)
            .await?;

        let options: AggregationOptions = message
            .options
            .as_ref()
            .and_then(|opts| serde_json::from_value(opts.clone()).ok())
            .unwrap_or_default();
        let paths: Vec<String> = message.path.split(';').map(str::to_string).collect();

        let result = {
            let _guard = self.open_lock.lock().await;
            let _permit = self.pool.acquire().await.expect("semaphore never closes");
            tokio::task::spawn_blocking(move || materialize(&paths, &options))
                .await
                .map_err(|e| WorkerError::Chunk(e.to_string()))
                .and_then(|inner| inner)
        };

        match result {
            Ok((dataset, meta)) => {
                let meta_value = serde_json::to_value(&meta).expect("metadata serializes");
                status.meta = Some(meta_value.clone());
                status.json_meta = Some(meta_value);
                status.status = LoadState::Finished;
                // The handle lives in its own entry so the gateway can poll
                // the status without deserializing engine state.
                let handle = serde_json::to_vec(&dataset).expect("handle serializes");
                self.cache
                    .set_bytes(&portal_cache::dset_key(&token), &handle, self.cache_exp)
                    .await?;
            }
            Err(error) => {
                tracing::error!(%error, path = %message.path, "could not process dataset");
                status.status = LoadState::Failed;
                status.reason = error.to_string();
            }
        }
        self.cache
            .set_status(&token, &status, self.cache_exp)
            .await?;
        Ok(())
    }

    async fn load_object(&self, token: &CacheToken) -> Result<(LoadStatus, Dataset), WorkerError> {
        let status = self
            .cache
            .get_status(token)
            .await?
            .ok_or_else(|| WorkerError::MissingEntry(token.as_str().to_string()))?;
        if status.status != LoadState::Finished {
            return Err(WorkerError::NotReady(status.status.label()));
        }
        let handle = self
            .cache
            .get_bytes(&portal_cache::dset_key(token))
            .await?
            .ok_or_else(|| WorkerError::MissingEntry(token.as_str().to_string()))?;
        let dataset: Dataset = serde_json::from_slice(&handle)
            .map_err(|e| WorkerError::Chunk(format!("corrupt dataset handle: {e}")))?;
        Ok((status, dataset))
    }

    /// Answer one chunk-encoding request and cache the bytes briefly.
    pub async fn get_zarr_chunk(&self, message: ChunkMessage) -> Result<(), WorkerError> {
        let token = CacheToken::from_string(message.uuid.clone());
        let (status, dataset) = self.load_object(&token).await?;
        let meta: ZMetadata = status
            .meta
            .clone()
            .and_then(|meta| serde_json::from_value(meta).ok())
            .ok_or(WorkerError::NotReady("metadata missing"))?;

        let variable = message.variable.clone();
        let chunk_id = message.chunk.clone();
        let bytes = {
            let _permit = self.pool.acquire().await.expect("semaphore never closes");
            tokio::task::spawn_blocking(move || chunk_bytes(&dataset, &meta, &variable, &chunk_id))
                .await
                .map_err(|e| WorkerError::Chunk(e.to_string()))
                .and_then(|inner| inner)?
        };

        let key = portal_cache::chunk_key(&token, &message.variable, &message.chunk);
        self.cache
            .set_bytes(&key, &bytes, portal_cache::CHUNK_TTL)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zarr_view::CodecConfig;

    fn write_store(dir: &std::path::Path) {
        std::fs::write(dir.join(".zgroup"), r#"{"zarr_format": 2}"#).unwrap();
        let var_dir = dir.join("tas");
        std::fs::create_dir(&var_dir).unwrap();
        std::fs::write(
            var_dir.join(".zarray"),
            serde_json::json!({
                "compressor": null,
                "filters": null,
                "chunks": [2, 2],
                "dtype": "<f8",
                "fill_value": null,
                "order": "C",
                "shape": [2, 2],
                "zarr_format": 2,
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            var_dir.join(".zattrs"),
            r#"{"_ARRAY_DIMENSIONS": ["lat", "lon"]}"#,
        )
        .unwrap();
        let raw: Vec<u8> = [1.0f64, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        std::fs::write(var_dir.join("0.0"), raw).unwrap();
    }

    #[test]
    fn materialize_builds_consolidated_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path());

        let paths = vec![dir.path().display().to_string()];
        let (dataset, meta) = materialize(&paths, &AggregationOptions::default()).unwrap();
        assert!(dataset.variables.contains_key("tas"));
        assert!(meta.get("tas/.zarray").is_some());
        assert_eq!(
            meta.get(".zgroup"),
            Some(&serde_json::json!({"zarr_format": 2}))
        );
    }

    #[test]
    fn chunk_bytes_round_trip_through_the_codec() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path());

        let paths = vec![dir.path().display().to_string()];
        let (dataset, meta) = materialize(&paths, &AggregationOptions::default()).unwrap();
        let packed = chunk_bytes(&dataset, &meta, "tas", "0.0").unwrap();

        // The served pipeline applies the zlib compressor from `.zarray`.
        let zarray = meta.array_meta("tas").unwrap();
        let codec = zarray.compressor.unwrap();
        assert_eq!(codec, CodecConfig::default_compressor());
        let raw = codec.decode(&packed).unwrap();
        let values: Vec<f64> = raw
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn unknown_variables_are_chunk_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path());
        let paths = vec![dir.path().display().to_string()];
        let (dataset, meta) = materialize(&paths, &AggregationOptions::default()).unwrap();
        assert!(matches!(
            chunk_bytes(&dataset, &meta, "nope", "0.0"),
            Err(WorkerError::Chunk(_))
        ));
    }

    #[test]
    fn open_failures_carry_a_reason() {
        let err = materialize(
            &["/definitely/not/there.nc".to_string()],
            &AggregationOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not/there.nc"));
    }
}
