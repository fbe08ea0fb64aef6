// ABOUTME: Record sinks that durably append fetched records per resource kind
// ABOUTME: The JSON file sink keeps one array file per kind and appends in place

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ReplicationError, Result};
use crate::fetch::Record;
use crate::resource::ResourceKind;

pub const TIMESTAMP_FIELD: &str = "ModificationTimestamp";

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Durably append `records` and return the batch's max ModificationTimestamp.
    ///
    /// The batch is trusted to be ordered, so that is the last record's timestamp.
    /// Delivery is at-least-once: a batch may be appended again after a crash that
    /// happened before its cursor was saved.
    async fn append(&self, resource: ResourceKind, records: &[Record]) -> Result<String>;

    /// Remove all stored output. Reset/test use only.
    async fn clear(&self) -> Result<()>;
}

/// Check a batch before anything is written and return its max timestamp.
pub fn batch_max_timestamp(resource: ResourceKind, records: &[Record]) -> Result<String> {
    let last = records
        .last()
        .ok_or(ReplicationError::EmptyBatch { resource })?;

    let missing = |position: usize| ReplicationError::MalformedResponse {
        url: resource.to_string(),
        message: format!(
            "record {} of {} has no string {}",
            position,
            records.len(),
            TIMESTAMP_FIELD
        ),
    };

    if let Some(position) = records
        .iter()
        .position(|r| r.get(TIMESTAMP_FIELD).and_then(Value::as_str).is_none())
    {
        return Err(missing(position));
    }

    last.get(TIMESTAMP_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(records.len() - 1))
}

/// Writes each kind to `<dir>/<Kind>.json` as a pretty-printed JSON array.
///
/// Appends rewrite only the closing bracket, so cost is proportional to the batch
/// rather than the whole collection.
pub struct JsonFileSink {
    dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `<dir>/<Kind>.json`; the only place output file names are derived.
    pub fn output_path(&self, resource: ResourceKind) -> PathBuf {
        self.dir.join(format!("{}.json", resource.as_str()))
    }

    /// Load everything stored for `resource`; an absent file is an empty collection.
    pub async fn read_all(&self, resource: ResourceKind) -> Result<Vec<Record>> {
        let path = self.output_path(resource);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| ReplicationError::serialization(&path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ReplicationError::persistence(&path, e)),
        }
    }
}

#[async_trait]
impl RecordSink for JsonFileSink {
    async fn append(&self, resource: ResourceKind, records: &[Record]) -> Result<String> {
        let max_timestamp = batch_max_timestamp(resource, records)?;

        let path = self.output_path(resource);
        let mut chunk = Vec::new();
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                chunk.extend_from_slice(b",\n");
            }
            let encoded = serde_json::to_vec_pretty(record)
                .map_err(|e| ReplicationError::serialization(&path, e))?;
            chunk.extend_from_slice(&encoded);
        }

        let _guard = self.lock.lock().await;
        let target = path.clone();
        tokio::task::spawn_blocking(move || append_to_array(&target, &chunk))
            .await
            .map_err(|e| {
                ReplicationError::persistence(&path, std::io::Error::other(e.to_string()))
            })??;

        tracing::debug!(
            "Appended {} {} records to {:?}",
            records.len(),
            resource,
            path
        );
        Ok(max_timestamp)
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for resource in ResourceKind::ALL {
            let path = self.output_path(resource);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::info!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ReplicationError::persistence(&path, e)),
            }
        }
        Ok(())
    }
}

/// Append already-encoded elements to the JSON array in `path`, creating it if needed.
///
/// The old closing bracket is overwritten in place and only trimmed once the new
/// tail is written. A failed write restores the previous closing bracket.
fn append_to_array(path: &Path, elements: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ReplicationError::persistence(parent, e))?;
    }

    let io = |e| ReplicationError::persistence(path, e);
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io)?;

    let len = file.metadata().map_err(io)?.len();
    let (content_end, prefix) = if len == 0 {
        (0, b"[\n".as_slice())
    } else {
        let content_end = find_content_end(&mut file, len, path)?;
        // `content_end` sits right after "[" when the array is empty
        if is_empty_array(&mut file, content_end).map_err(io)? {
            (content_end, b"\n".as_slice())
        } else {
            (content_end, b",\n".as_slice())
        }
    };

    if let Err(e) = write_tail(&mut file, content_end, prefix, elements) {
        if let Err(restore) = restore_tail(&mut file, content_end) {
            tracing::error!(
                "Failed to restore closing bracket of {:?} after write error: {}",
                path,
                restore
            );
        }
        return Err(io(e));
    }
    Ok(())
}

fn write_tail(
    file: &mut std::fs::File,
    content_end: u64,
    prefix: &[u8],
    elements: &[u8],
) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(content_end))?;
    file.write_all(prefix)?;
    file.write_all(elements)?;
    file.write_all(b"\n]\n")?;
    let end = file.stream_position()?;
    file.set_len(end)?;
    file.sync_all()
}

/// Put the array back to how it was before a failed append.
fn restore_tail(file: &mut std::fs::File, content_end: u64) -> std::io::Result<()> {
    file.set_len(content_end)?;
    if content_end > 0 {
        file.seek(SeekFrom::Start(content_end))?;
        file.write_all(b"\n]\n")?;
    }
    file.sync_all()
}

/// Offset just past the last stored element (or the opening "[").
///
/// A file cut right after its last record or right after "[" is missing only its
/// closing bracket, so appending to it repairs it.
fn find_content_end(file: &mut std::fs::File, len: u64, path: &Path) -> Result<u64> {
    let io = |e| ReplicationError::persistence(path, e);
    let not_an_array = || {
        ReplicationError::persistence(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "output file does not hold a JSON array",
            ),
        )
    };

    let head_len = len.min(64);
    let mut head = vec![0u8; head_len as usize];
    file.seek(SeekFrom::Start(0)).map_err(io)?;
    file.read_exact(&mut head).map_err(io)?;
    let first = head.iter().position(|b| !b.is_ascii_whitespace());
    if first.map(|i| head[i]) != Some(b'[') {
        return Err(not_an_array());
    }

    let tail_len = len.min(64);
    let start = len - tail_len;
    file.seek(SeekFrom::Start(start)).map_err(io)?;
    let mut tail = vec![0u8; tail_len as usize];
    file.read_exact(&mut tail).map_err(io)?;

    let last = tail
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .ok_or_else(not_an_array)?;

    let content_end = match tail[last] {
        b']' => tail[..last]
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|i| i + 1)
            .unwrap_or(0),
        // Pretty-printed records close with "}" at the start of a line
        b'}' if last > 0 && tail[last - 1] == b'\n' => {
            tracing::warn!("{:?} lost its closing bracket, repairing on append", path);
            last + 1
        }
        b'[' if start + last as u64 == first.unwrap_or(0) as u64 => {
            tracing::warn!("{:?} lost its closing bracket, repairing on append", path);
            last + 1
        }
        _ => return Err(not_an_array()),
    };
    Ok(start + content_end as u64)
}

fn is_empty_array(file: &mut std::fs::File, content_end: u64) -> std::io::Result<bool> {
    if content_end == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(content_end - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'[')
}

/// In-memory sink, mostly for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: StdMutex<HashMap<ResourceKind, Vec<Record>>>,
    appends: StdMutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, resource: ResourceKind) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of successful `append` calls.
    pub fn append_count(&self) -> usize {
        *self.appends.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&self, resource: ResourceKind, records: &[Record]) -> Result<String> {
        let max_timestamp = batch_max_timestamp(resource, records)?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(resource)
            .or_default()
            .extend(records.iter().cloned());
        *self.appends.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(max_timestamp)
    }

    async fn clear(&self) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
