use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use anyhow::{Context, Result};
use async_trait::async_trait;
use super::{QueueService, ReceivedMessage, DEFAULT_VISIBILITY};

const MESSAGE_EXT: &str = "msg";
const LEASE_EXT: &str = "lease";

/// Directory-backed queues: one directory per queue, one file per message.
///
/// Files are written under a temporary name and renamed into place, so a
/// receiver never reads a partial message. Names sort by send time.
///
/// Receiving renames `<name>.msg` to `<name>.<deadline>.lease`, with the
/// deadline in epoch milliseconds. A lease past its deadline is visible
/// again. The rename is the claim, so two receivers never hold the same
/// lease.
pub struct SpoolBroker {
    root: PathBuf,
    seq: AtomicU64,
    visibility: Duration,
}

/// A message file found in a queue directory
struct Entry {
    name: String,
    path: PathBuf,
    /// `None` for a message nobody has received yet
    deadline: Option<u128>,
}

impl Entry {
    fn parse(path: PathBuf) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let (stem, ext) = file_name.rsplit_once('.')?;
        let (name, deadline) = match ext {
            MESSAGE_EXT => (stem.to_string(), None),
            LEASE_EXT => {
                let (name, deadline) = stem.rsplit_once('.')?;
                (name.to_string(), Some(deadline.parse().ok()?))
            }
            _ => return None,
        };

        Some(Self { name, path, deadline })
    }

    fn visible(&self, now: u128) -> bool {
        self.deadline.map_or(true, |deadline| deadline <= now)
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

impl SpoolBroker {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create spool directory: {}", root.display()))?;

        Ok(Self {
            root: root.to_path_buf(),
            seq: AtomicU64::new(0),
            visibility: DEFAULT_VISIBILITY,
        })
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        let name: String = queue
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(name)
    }

    /// Every message on `queue`, leased or not, oldest first
    async fn entries(&self, queue: &str) -> Result<Vec<Entry>> {
        let dir = self.queue_dir(queue);
        let mut dir_entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list queue: {}", dir.display()))
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir_entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list queue: {}", dir.display()))?
        {
            if let Some(entry) = Entry::parse(entry.path()) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[async_trait]
impl QueueService for SpoolBroker {
    async fn send(&self, destination: &str, body: Vec<u8>) -> Result<()> {
        let dir = self.queue_dir(destination);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create queue: {}", dir.display()))?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{:024}-{:08}-{}", nanos, seq, std::process::id());

        let tmp = dir.join(format!(".{}.tmp", name));
        let path = dir.join(format!("{}.{}", name, MESSAGE_EXT));
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write message: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to publish message: {}", path.display()))?;
        Ok(())
    }

    async fn receive_batch(&self, queue: &str, max: usize) -> Result<Vec<ReceivedMessage>> {
        let dir = self.queue_dir(queue);
        let now = epoch_millis();
        let deadline = now.saturating_add(self.visibility.as_millis());

        let mut batch = Vec::new();
        for entry in self.entries(queue).await?.into_iter().filter(|e| e.visible(now)) {
            if batch.len() >= max {
                break;
            }

            let leased = dir.join(format!("{}.{}.{}", entry.name, deadline, LEASE_EXT));
            match tokio::fs::rename(&entry.path, &leased).await {
                Ok(()) => {}
                // claimed or deleted by a concurrent consumer
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to lease message: {}", entry.path.display()))
                }
            }

            let body = tokio::fs::read(&leased)
                .await
                .with_context(|| format!("Failed to read message: {}", leased.display()))?;
            batch.push(ReceivedMessage {
                handle: leased.to_string_lossy().to_string(),
                body,
            });
        }
        Ok(batch)
    }

    async fn delete(&self, queue: &str, handle: &str) -> Result<()> {
        let path = PathBuf::from(handle);
        if path.parent() != Some(self.queue_dir(queue).as_path()) {
            anyhow::bail!("handle {} does not belong to queue {}", handle, queue);
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete message: {}", path.display())),
        }
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        Ok(self.entries(queue).await?.len())
    }
}
