use crate::error::LogbookError;
use crate::workbook::CellValue;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const BUFFER_VERSION: u32 = 1;

/// Destination cell range addressed by a pending write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub file_path: PathBuf,
    pub sheet_index: usize,
    pub target_row: u32,
}

/// Deterministic id for backfilled and derived entries: `{year}-{sheet}-{row}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotKey {
    pub file_year: i32,
    pub sheet_index: usize,
    pub row: u32,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.file_year, self.sheet_index, self.row)
    }
}

impl FromStr for SlotKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.splitn(3, '-');
        let (Some(year), Some(sheet), Some(row)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("malformed slot key {raw:?}"));
        };
        Ok(Self {
            file_year: year.parse().map_err(|_| format!("bad year in {raw:?}"))?,
            sheet_index: sheet.parse().map_err(|_| format!("bad sheet in {raw:?}"))?,
            row: row.parse().map_err(|_| format!("bad row in {raw:?}"))?,
        })
    }
}

impl TryFrom<String> for SlotKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotKey> for String {
    fn from(key: SlotKey) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntryId {
    /// Monotonic token handed out to live collectors.
    Sequence(u64),
    /// Slot-derived id used by gap backfill and outage rows.
    Slot(SlotKey),
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Sequence(seq) => write!(f, "seq:{seq}"),
            EntryId::Slot(key) => write!(f, "slot:{key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub id: EntryId,
    pub slot: Slot,
    pub values: Vec<CellValue>,
    pub target_year: i32,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BufferDocument {
    version: u32,
    #[serde(default)]
    last_sequence: u64,
    #[serde(default)]
    entries: Vec<PendingWrite>,
}

/// Crash-safe queue of pending cell writes, one JSON file per stream.
///
/// Every mutation reloads the file, applies the change and rewrites it
/// through a temp file + fsync + rename, so a crash leaves either the old or
/// the new document on disk. There is exactly one writer per file.
#[derive(Debug, Clone)]
pub struct DurableBuffer {
    path: PathBuf,
}

impl DurableBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries in insertion order. An absent file is empty; an
    /// unreadable one is moved aside and treated as empty.
    pub fn load(&self) -> Vec<PendingWrite> {
        match self.load_document() {
            Ok(doc) => doc.entries,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "buffer read failed; treating as empty");
                Vec::new()
            }
        }
    }

    pub fn upsert(&self, entry: PendingWrite) -> Result<()> {
        self.upsert_many(vec![entry])
    }

    /// Applies a batch of upserts with a single rewrite. Each entry replaces
    /// any queued entry with the same slot or the same id.
    pub fn upsert_many(&self, entries: Vec<PendingWrite>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut doc = self.load_document()?;
        for entry in entries {
            doc.entries
                .retain(|existing| existing.slot != entry.slot && existing.id != entry.id);
            doc.entries.push(entry);
        }
        self.persist(&doc)
    }

    /// Drops exactly the given ids, returning how many entries were removed.
    /// Entries queued after the caller's snapshot are kept.
    pub fn remove_committed(&self, ids: &HashSet<EntryId>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut doc = self.load_document()?;
        let before = doc.entries.len();
        doc.entries.retain(|entry| !ids.contains(&entry.id));
        let removed = before - doc.entries.len();
        if removed > 0 {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    /// Hands out the next monotonic token, surviving restarts.
    pub fn next_sequence(&self) -> Result<u64> {
        let mut doc = self.load_document()?;
        let highest_queued = doc
            .entries
            .iter()
            .filter_map(|entry| match entry.id {
                EntryId::Sequence(seq) => Some(seq),
                EntryId::Slot(_) => None,
            })
            .max()
            .unwrap_or(0);
        let next = doc.last_sequence.max(highest_queued).saturating_add(1);
        doc.last_sequence = next;
        self.persist(&doc)?;
        Ok(next)
    }

    /// I/O failures propagate so a mutation never overwrites a file it could
    /// not read; unparsable content is quarantined and reads as empty.
    fn load_document(&self) -> Result<BufferDocument> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BufferDocument::empty()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        match serde_json::from_str::<BufferDocument>(&raw) {
            Ok(doc) => Ok(doc),
            Err(err) => {
                let err = LogbookError::BufferCorrupt {
                    path: self.path.clone(),
                    reason: err.to_string(),
                };
                self.quarantine(&err);
                Ok(BufferDocument::empty())
            }
        }
    }

    fn quarantine(&self, err: &LogbookError) {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{stamp}"));
        let dest = self.path.with_file_name(name);
        match fs::rename(&self.path, &dest) {
            Ok(()) => tracing::warn!(
                error = %err,
                quarantined = %dest.display(),
                "buffer unreadable; starting empty"
            ),
            Err(rename_err) => tracing::warn!(
                error = %err,
                rename_error = %rename_err,
                "buffer unreadable and could not be moved aside; starting empty"
            ),
        }
    }

    fn persist(&self, doc: &BufferDocument) -> Result<()> {
        persist_json(&self.path, doc)
    }
}

/// Writes `value` as pretty JSON through `<path>.json.tmp`, fsync and rename.
pub(crate) fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;
    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("create {}", tmp.display()))?;
    file.write_all(json.as_bytes()).context("write tmp")?;
    file.sync_all().context("sync tmp")?;
    drop(file);
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

impl BufferDocument {
    fn empty() -> Self {
        Self {
            version: BUFFER_VERSION,
            last_sequence: 0,
            entries: Vec::new(),
        }
    }
}
