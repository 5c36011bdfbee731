//! Snapshot/Backup Writer
//!
//! Before any destructive step the current objects are serialized to
//! `<backup_dir>/{namespace}-{name}{timestamp}.yaml`, one YAML document per
//! object separated by `---`. Files are created exclusively and never touched
//! again; the same directory holds the append-only `ops.log`.

use chrono::{DateTime, Utc};
use kube::Resource;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const OPS_LOG_FILE: &str = "ops.log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Attempts at finding a free file name within the same second
const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to create backup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write backup {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {kind} to YAML: {source}")]
    Serialize {
        kind: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no free backup file name for {namespace}/{name} at {timestamp}")]
    NameExhausted {
        namespace: String,
        name: String,
        timestamp: String,
    },
}

/// Serialize an object for a backup, dropping server-side bookkeeping
pub fn to_backup_document<K>(object: &K) -> Result<String, BackupError>
where
    K: Resource<DynamicType = ()> + Serialize + Clone,
{
    let mut object = object.clone();
    object.meta_mut().managed_fields = None;

    serde_yaml::to_string(&object).map_err(|source| BackupError::Serialize {
        kind: K::kind(&()).to_string(),
        source,
    })
}

/// Directory holding backups and the operation log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BackupStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if it does not exist yet
    pub fn ensure_dir(&self) -> Result<(), BackupError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| BackupError::CreateDir {
            path: self.dir.clone(),
            source,
        })
    }

    pub fn ops_log_path(&self) -> PathBuf {
        self.dir.join(OPS_LOG_FILE)
    }

    /// Write `documents` to a new backup file and return its path
    ///
    /// A name already taken within the same second gets a `-N` suffix, so an
    /// existing backup is never overwritten.
    pub fn write(
        &self,
        namespace: &str,
        name: &str,
        documents: &[String],
        now: DateTime<Utc>,
    ) -> Result<PathBuf, BackupError> {
        self.ensure_dir()?;

        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        let body = documents.join("---\n");

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = match attempt {
                0 => format!("{}-{}{}.yaml", namespace, name, timestamp),
                n => format!("{}-{}{}-{}.yaml", namespace, name, timestamp, n),
            };
            let path = self.dir.join(file_name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(BackupError::Write { path, source }),
            };

            file.write_all(body.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|source| BackupError::Write {
                    path: path.clone(),
                    source,
                })?;

            info!(path = %path.display(), documents = documents.len(), "Backup written");
            return Ok(path);
        }

        Err(BackupError::NameExhausted {
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp,
        })
    }
}
