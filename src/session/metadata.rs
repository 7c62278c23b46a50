//! Filesystem-backed session metadata.
//!
//! One flat `key=value` file per session under
//! `<dataDir>/<projectId>-sessions/<sessionId>`. The file format is the
//! engine's only durable state:
//!
//! - one key per line, LF-terminated, trailing LF after the last entry
//! - only the first `=` separates; values may contain `=` but never LF
//! - empty lines are ignored
//! - keys with absent values are omitted on write
//!
//! Teardown renames the live file into `archive/<sessionId>_<ISO-utc-second>`;
//! archived files are never read back by the engine.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata keys consumed by the core.
pub mod keys {
    pub const WORKTREE: &str = "worktree";
    pub const BRANCH: &str = "branch";
    pub const STATUS: &str = "status";
    pub const ISSUE: &str = "issue";
    pub const PR: &str = "pr";
    pub const SUMMARY: &str = "summary";
    pub const PROJECT: &str = "project";
    pub const CREATED_AT: &str = "createdAt";
    pub const RUNTIME_HANDLE: &str = "runtimeHandle";
}

const SESSION_DIR_SUFFIX: &str = "-sessions";
const ARCHIVE_DIR: &str = "archive";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    #[error("metadata for session '{0}' not found")]
    NotFound(String),

    #[error("value for key '{key}' contains a line feed")]
    ValueContainsNewline { key: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MetadataError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// The parsed contents of one session's metadata file.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetadataRecord {
    session_id: String,
    project_id: String,
    values: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn new(session_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let project_id = project_id.into();
        let mut values = BTreeMap::new();
        values.insert(keys::PROJECT.to_string(), project_id.clone());
        Self {
            session_id,
            project_id,
            values,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a key. Absent values are dropped from the record entirely.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn set_opt(&mut self, key: &str, value: Option<String>) -> &mut Self {
        match value {
            Some(v) => self.values.insert(key.to_string(), v),
            None => self.values.remove(key),
        };
        self
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.values.remove(key);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize into the on-disk `key=value` form.
    fn to_file_contents(&self) -> Result<String, MetadataError> {
        let mut out = String::new();
        for (key, value) in &self.values {
            if value.contains('\n') {
                return Err(MetadataError::ValueContainsNewline { key: key.clone() });
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse on-disk contents. Only the first `=` on a line separates;
    /// lines without `=` and empty lines are ignored.
    fn from_file_contents(session_id: &str, fallback_project: &str, contents: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.to_string(), value.to_string());
            }
        }
        let project_id = values
            .get(keys::PROJECT)
            .cloned()
            .unwrap_or_else(|| fallback_project.to_string());
        Self {
            session_id: session_id.to_string(),
            project_id,
            values,
        }
    }
}

/// Store of live metadata files plus the teardown archive.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    data_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn session_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir
            .join(format!("{project_id}{SESSION_DIR_SUFFIX}"))
    }

    pub fn session_file(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.session_dir(project_id).join(session_id)
    }

    /// Atomically reserve a session id by creating its metadata file with
    /// create-new semantics. Fails with [`MetadataError::AlreadyExists`]
    /// when another spawn got there first.
    pub fn reserve(&self, project_id: &str, session_id: &str) -> Result<(), MetadataError> {
        let dir = self.session_dir(project_id);
        fs::create_dir_all(&dir).map_err(|e| MetadataError::io(&dir, e))?;

        let path = self.session_file(project_id, session_id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(MetadataError::AlreadyExists(session_id.to_string()))
            }
            Err(e) => Err(MetadataError::io(path, e)),
        }
    }

    /// Drop a reservation (spawn failure unwinding). Missing files are fine.
    pub fn release(&self, project_id: &str, session_id: &str) -> Result<(), MetadataError> {
        let path = self.session_file(project_id, session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MetadataError::io(path, e)),
        }
    }

    /// Whole-file replace via a temp file rename, so readers never observe
    /// a partially written record.
    pub fn write(&self, record: &MetadataRecord) -> Result<(), MetadataError> {
        let dir = self.session_dir(&record.project_id);
        fs::create_dir_all(&dir).map_err(|e| MetadataError::io(&dir, e))?;

        let path = self.session_file(&record.project_id, &record.session_id);
        let tmp = path.with_extension("tmp");
        let contents = record.to_file_contents()?;
        {
            let mut file = fs::File::create(&tmp).map_err(|e| MetadataError::io(&tmp, e))?;
            file.write_all(contents.as_bytes())
                .map_err(|e| MetadataError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| MetadataError::io(path, e))
    }

    /// Merge-update: read the current record, apply the patches (an absent
    /// value removes the key), write back.
    pub fn update(
        &self,
        project_id: &str,
        session_id: &str,
        patches: &[(&str, Option<String>)],
    ) -> Result<(), MetadataError> {
        let mut record = self
            .read(project_id, session_id)?
            .ok_or_else(|| MetadataError::NotFound(session_id.to_string()))?;
        for (key, value) in patches {
            record.set_opt(key, value.clone());
        }
        self.write(&record)
    }

    pub fn read(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<Option<MetadataRecord>, MetadataError> {
        let path = self.session_file(project_id, session_id);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(MetadataRecord::from_file_contents(
                session_id, project_id, &contents,
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MetadataError::io(path, e)),
        }
    }

    /// Locate a session by id across all project session directories.
    pub fn find(&self, session_id: &str) -> Result<Option<MetadataRecord>, MetadataError> {
        for project_id in self.project_dirs()? {
            if let Some(record) = self.read(&project_id, session_id)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// All live records, optionally filtered to one project.
    pub fn list(&self, project_id: Option<&str>) -> Result<Vec<MetadataRecord>, MetadataError> {
        let mut records = Vec::new();
        let projects = match project_id {
            Some(p) => vec![p.to_string()],
            None => self.project_dirs()?,
        };

        for project in projects {
            let dir = self.session_dir(&project);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MetadataError::io(dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| MetadataError::io(&dir, e))?;
                let path = entry.path();
                if !path.is_file() || path.extension().is_some_and(|ext| ext == "tmp") {
                    continue;
                }
                let Some(session_id) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some(record) = self.read(&project, session_id)? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Archive a live record: rename into the project's `archive/` dir with
    /// a UTC-second ISO suffix. The rename is atomic.
    pub fn archive(&self, project_id: &str, session_id: &str) -> Result<PathBuf, MetadataError> {
        let live = self.session_file(project_id, session_id);
        if !live.exists() {
            return Err(MetadataError::NotFound(session_id.to_string()));
        }

        let archive_dir = self.session_dir(project_id).join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir).map_err(|e| MetadataError::io(&archive_dir, e))?;

        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let target = archive_dir.join(format!("{session_id}_{stamp}"));
        fs::rename(&live, &target).map_err(|e| MetadataError::io(&live, e))?;
        Ok(target)
    }

    /// Project ids derived from `<projectId>-sessions` directory names.
    fn project_dirs(&self) -> Result<Vec<String>, MetadataError> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MetadataError::io(&self.data_dir, e)),
        };

        let mut projects = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MetadataError::io(&self.data_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(project) = name.strip_suffix(SESSION_DIR_SUFFIX) {
                    projects.push(project.to_string());
                }
            }
        }
        projects.sort();
        Ok(projects)
    }
}
