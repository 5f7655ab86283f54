//! Policy checkpoints keyed by experiment id

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError};
use thiserror::Error;

use super::layout::LayoutError;
use super::policy::{Policy, PolicyConfig};

const MODEL_PREFIX: &str = "model_";
const MODEL_EXTENSION: &str = "mpk";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint record {path}: {reason}")]
    Record { path: PathBuf, reason: String },
    #[error("policy layout: {0}")]
    Layout(#[from] LayoutError),
}

/// Checkpoints of one experiment, stored as `<data_dir>/<exp_id>/model_<epoch>.mpk`
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(data_dir: impl AsRef<Path>, exp_id: &str) -> Self {
        Self {
            dir: data_dir.as_ref().join(exp_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path without the recorder's extension
    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{MODEL_PREFIX}{epoch:06}"))
    }

    pub fn save<B: Backend>(
        &self,
        policy: &Policy<B>,
        epoch: usize,
    ) -> Result<PathBuf, CheckpointError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(epoch);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        policy
            .clone()
            .save_file(path.clone(), &recorder)
            .map_err(|e| record_error(&path, e))?;

        tracing::info!("Saved checkpoint to {}", path.display());
        Ok(path)
    }

    /// Most recent checkpoint by epoch number
    pub fn latest(&self) -> Result<Option<PathBuf>, CheckpointError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let latest = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != MODEL_EXTENSION {
                    return None;
                }
                let epoch = path
                    .file_stem()?
                    .to_str()?
                    .strip_prefix(MODEL_PREFIX)?
                    .parse::<usize>()
                    .ok()?;
                Some((epoch, path.with_extension("")))
            })
            .max_by_key(|(epoch, _)| *epoch)
            .map(|(_, path)| path);

        Ok(latest)
    }
}

/// Build a policy from `config` and load weights from `path`.
///
/// `path` may name the record with or without its `.mpk` extension.
pub fn load_policy<B: Backend>(
    config: &PolicyConfig,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Policy<B>, CheckpointError> {
    let path = path.as_ref();
    let path = if path.extension().is_some_and(|ext| ext == MODEL_EXTENSION) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let policy = config
        .init::<B>(device)?
        .load_file(path.clone(), &recorder, device)
        .map_err(|e| record_error(&path, e))?;

    tracing::info!("Loaded checkpoint from {}", path.display());
    Ok(policy)
}

fn record_error(path: &Path, error: RecorderError) -> CheckpointError {
    CheckpointError::Record {
        path: path.to_path_buf(),
        reason: format!("{error:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_path_for_pads_epoch() {
        let store = CheckpointStore::new("/data", "exp");
        assert_eq!(store.path_for(42), PathBuf::from("/data/exp/model_000042"));
    }

    #[test]
    fn test_latest_on_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "nothing");
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "exp");
        let device = Default::default();
        let config = PolicyConfig::default().with_recurrent(false);
        let policy = config.init::<TestBackend>(&device).unwrap();

        store.save(&policy, 3).unwrap();
        store.save(&policy, 12).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest, store.path_for(12));

        let loaded = load_policy::<TestBackend>(&config, &latest, &device).unwrap();
        assert_eq!(loaded.observation_size(), policy.observation_size());
    }

    #[test]
    fn test_load_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let result = load_policy::<TestBackend>(
            &PolicyConfig::default(),
            dir.path().join("model_000001.mpk"),
            &device,
        );
        assert!(matches!(result, Err(CheckpointError::Record { .. })));
    }
}
