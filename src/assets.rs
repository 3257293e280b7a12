//! Asset records and the store they live in.
//!
//! Records come from a loosely maintained document collection, so every field
//! has an explicit default: missing text fields become empty strings and a
//! missing `lastUpdatedAt` becomes the time the record was read.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::rooms::RoomLabel;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub last_updated_by_name: String,
    #[serde(default, rename = "lastUpdatedByUPI")]
    pub last_updated_by_upi: String,
    #[serde(default = "now_unix")]
    pub last_updated_at: u64,
}

/// The logged-in user making a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editor {
    pub name: String,
    pub upi: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpdate {
    pub room: RoomLabel,
    pub updated_at: u64,
    pub editor: Editor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetField {
    Name,
    Level,
    Room,
}

impl AssetField {
    fn value<'a>(&self, record: &'a AssetRecord) -> &'a str {
        match self {
            AssetField::Name => &record.name,
            AssetField::Level => &record.level,
            AssetField::Room => &record.room,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("refusing to move asset {0} to an undetermined room")]
    RoomUndetermined(String),
    #[error("asset store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("asset store {path}: duplicate asset id {id:?}")]
    DuplicateId { path: PathBuf, id: String },
    #[error("asset store {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub trait AssetStore {
    fn get(&self, id: &str) -> Result<Option<AssetRecord>, AssetError>;

    /// Records whose `field` equals `value` exactly.
    fn query(&self, field: AssetField, value: &str) -> Result<Vec<AssetRecord>, AssetError>;

    fn update(&mut self, id: &str, update: &AssetUpdate) -> Result<AssetRecord, AssetError>;

    /// Case-insensitive name search. An empty search matches everything.
    fn search(&self, text: &str) -> Result<Vec<AssetRecord>, AssetError>;
}

/// Resolves a scanned code: first as an asset id, then as an exact asset name.
pub fn resolve_code<S: AssetStore + ?Sized>(
    store: &S,
    code: &str,
) -> Result<Option<AssetRecord>, AssetError> {
    let code = code.trim();
    if let Some(record) = store.get(code)? {
        return Ok(Some(record));
    }
    Ok(store.query(AssetField::Name, code)?.into_iter().next())
}

/// Records that an asset now sits in `room`.
pub fn finish_move<S: AssetStore + ?Sized>(
    store: &mut S,
    id: &str,
    room: RoomLabel,
    editor: Editor,
) -> Result<AssetRecord, AssetError> {
    if !room.is_determined() {
        return Err(AssetError::RoomUndetermined(id.to_string()));
    }
    let update = AssetUpdate {
        room,
        updated_at: now_unix(),
        editor,
    };
    let record = store.update(id, &update)?;
    info!(
        "Moved {} ({}) to {} for {} / {}",
        record.name, record.id, record.room, update.editor.name, update.editor.upi
    );
    Ok(record)
}

/// Records in the order they were loaded. Records without an id are kept but
/// can only be reached through queries.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<AssetRecord>,
}

impl MemoryStore {
    pub fn new(records: impl IntoIterator<Item = AssetRecord>) -> Self {
        MemoryStore {
            records: records.into_iter().collect(),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &AssetRecord> {
        self.records.iter()
    }

    fn position(&self, id: &str) -> Option<usize> {
        if id.is_empty() {
            return None;
        }
        self.records.iter().position(|r| r.id == id)
    }
}

impl AssetStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<AssetRecord>, AssetError> {
        Ok(self.position(id).map(|i| self.records[i].clone()))
    }

    fn query(&self, field: AssetField, value: &str) -> Result<Vec<AssetRecord>, AssetError> {
        Ok(self
            .records
            .iter()
            .filter(|r| field.value(r) == value)
            .cloned()
            .collect())
    }

    fn update(&mut self, id: &str, update: &AssetUpdate) -> Result<AssetRecord, AssetError> {
        let index = self
            .position(id)
            .ok_or_else(|| AssetError::NotFound(id.to_string()))?;
        let record = &mut self.records[index];
        record.room = update.room.to_string();
        record.last_updated_at = update.updated_at;
        record.last_updated_by_name = update.editor.name.clone();
        record.last_updated_by_upi = update.editor.upi.clone();
        Ok(record.clone())
    }

    fn search(&self, text: &str) -> Result<Vec<AssetRecord>, AssetError> {
        let text = text.to_lowercase();
        Ok(self
            .records
            .iter()
            .filter(|r| text.is_empty() || r.name.to_lowercase().contains(&text))
            .cloned()
            .collect())
    }
}

/// A JSON array of asset records on disk. The whole file is rewritten after
/// every update.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AssetError> {
        let path = path.as_ref().to_path_buf();
        let records: Vec<AssetRecord> = read_json(&path)?;

        let mut seen = HashSet::new();
        for record in &records {
            if !record.id.is_empty() && !seen.insert(record.id.as_str()) {
                return Err(AssetError::DuplicateId {
                    path,
                    id: record.id.clone(),
                });
            }
        }

        Ok(JsonFileStore {
            path,
            inner: MemoryStore::new(records),
        })
    }
}

impl AssetStore for JsonFileStore {
    fn get(&self, id: &str) -> Result<Option<AssetRecord>, AssetError> {
        self.inner.get(id)
    }

    fn query(&self, field: AssetField, value: &str) -> Result<Vec<AssetRecord>, AssetError> {
        self.inner.query(field, value)
    }

    fn update(&mut self, id: &str, update: &AssetUpdate) -> Result<AssetRecord, AssetError> {
        // Only adopt the change once it is on disk.
        let mut updated = self.inner.clone();
        let record = updated.update(id, update)?;
        let records: Vec<&AssetRecord> = updated.records().collect();
        write_json(&self.path, &records)?;
        self.inner = updated;
        Ok(record)
    }

    fn search(&self, text: &str) -> Result<Vec<AssetRecord>, AssetError> {
        self.inner.search(text)
    }
}

/// One decoded QR code, as kept in the scan history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub code: String,
    pub date: u64,
}

/// Appends `code` to the JSON scan history at `path`, creating the file on
/// first use.
pub fn record_scan(path: &Path, code: &str) -> Result<ScanEntry, AssetError> {
    let mut history: Vec<ScanEntry> = if path.exists() {
        read_json(path)?
    } else {
        Vec::new()
    };
    let entry = ScanEntry {
        code: code.trim().to_string(),
        date: now_unix(),
    };
    history.push(entry.clone());
    write_json(path, &history)?;
    Ok(entry)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, AssetError> {
    let contents = std::fs::read_to_string(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| AssetError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), AssetError> {
    let contents = serde_json::to_string_pretty(value).map_err(|source| AssetError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, contents).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })
}
