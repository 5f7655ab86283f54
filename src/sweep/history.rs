//! Persisted sweep state shared by every trial process
//!
//! Layout under the sweep directory:
//!
//! ```text
//! <sweep_dir>/<sweep_id>/sweep.json      manifest: name + parameter space
//! <sweep_dir>/<sweep_id>/history.jsonl   one record per line, append-only
//! ```
//!
//! Each record is written with a single `write_all` on a file opened in
//! append mode, so concurrent trials never interleave partial lines.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use uuid::Uuid;

use super::backend::SearchError;
use super::space::ParamSpec;

const MANIFEST_FILE: &str = "sweep.json";
const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepManifest {
    pub sweep_id: String,
    pub name: String,
    pub created_at: String,
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryRecord {
    Suggested {
        id: Uuid,
        /// Optimizer-space values, before transforms
        values: BTreeMap<String, f64>,
        resampled: bool,
        at: String,
    },
    Observed {
        id: Uuid,
        objective: f64,
        cost: f64,
        at: String,
    },
    Failed {
        id: Uuid,
        at: String,
    },
}

#[derive(Debug, Clone)]
pub struct SweepHistory {
    dir: PathBuf,
    manifest: SweepManifest,
}

impl SweepHistory {
    /// Create a new sweep with a generated id
    pub fn create(
        sweep_dir: impl AsRef<Path>,
        name: &str,
        params: Vec<ParamSpec>,
    ) -> Result<Self, SearchError> {
        let sweep_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let dir = sweep_dir.as_ref().join(&sweep_id);
        std::fs::create_dir_all(&dir).map_err(|source| SearchError::Io {
            path: dir.clone(),
            source,
        })?;

        let manifest = SweepManifest {
            sweep_id,
            name: name.to_string(),
            created_at: timestamp(),
            params,
        };
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&path, json).map_err(|source| SearchError::Io { path, source })?;

        tracing::info!("Created sweep {} ({})", manifest.sweep_id, manifest.name);
        Ok(Self { dir, manifest })
    }

    pub fn open(sweep_dir: impl AsRef<Path>, sweep_id: &str) -> Result<Self, SearchError> {
        let dir = sweep_dir.as_ref().join(sweep_id);
        let path = dir.join(MANIFEST_FILE);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SearchError::UnknownSweep(sweep_id.to_string()));
            }
            Err(source) => return Err(SearchError::Io { path, source }),
        };
        let manifest: SweepManifest = serde_json::from_str(&json)
            .map_err(|source| SearchError::Manifest { path, source })?;

        Ok(Self { dir, manifest })
    }

    pub fn sweep_id(&self) -> &str {
        &self.manifest.sweep_id
    }

    pub fn manifest(&self) -> &SweepManifest {
        &self.manifest
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn append(&self, record: &HistoryRecord) -> Result<(), SearchError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = self.history_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SearchError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| SearchError::Io { path, source })
    }

    /// Every committed record in append order. Lines that fail to parse,
    /// such as one cut short by a crashed trial, are skipped.
    pub fn records(&self) -> Result<Vec<HistoryRecord>, SearchError> {
        let path = self.history_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SearchError::Io { path, source }),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| SearchError::Io {
                path: path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    "Skipping malformed record {}:{}: {}",
                    path.display(),
                    index + 1,
                    e
                ),
            }
        }
        Ok(records)
    }
}

pub(crate) fn timestamp() -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    OffsetDateTime::now_utc().format(format).unwrap_or_default()
}
