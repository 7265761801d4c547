//! Screenshot queues and their on-disk blobs.
//!
//! Two bounded FIFO queues, primary and supplementary, each own the files
//! their images were written to. Pushing past capacity evicts the oldest
//! entry and deletes its file. Deletion failures are logged and otherwise
//! ignored: the in-memory queue decides what gets sent next.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Local};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::guard::CaptureGuard;

pub const MAX_SCREENSHOTS: usize = 2;

/// Selects one of the two queues. The store's active mode uses the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Primary,
    Supplementary,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Supplementary => write!(f, "supplementary"),
        }
    }
}

/// Opaque handle to persisted image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageRef(PathBuf);

impl StorageRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Blob storage for captured images.
pub trait BlobStorage: Send + Sync {
    fn persist(&self, queue: QueueKind, bytes: &[u8]) -> Result<StorageRef, StorageError>;

    fn read(&self, storage_ref: &StorageRef) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, storage_ref: &StorageRef) -> std::io::Result<()>;

    /// Data URI for display. Not used when building payloads.
    fn encode_preview(&self, storage_ref: &StorageRef) -> Result<String, StorageError> {
        let bytes = self.read(storage_ref)?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(bytes)))
    }
}

/// Files under `<root>/screenshots` and `<root>/extra_screenshots`.
#[derive(Debug)]
pub struct FsStorage {
    primary_dir: PathBuf,
    supplementary_dir: PathBuf,
}

impl FsStorage {
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        let primary_dir = root.join("screenshots");
        let supplementary_dir = root.join("extra_screenshots");
        for dir in [&primary_dir, &supplementary_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::Init {
                path: dir.clone(),
                source,
            })?;
        }
        info!(
            primary = %primary_dir.display(),
            supplementary = %supplementary_dir.display(),
            "Screenshot directories initialized"
        );
        Ok(Self {
            primary_dir,
            supplementary_dir,
        })
    }

    fn dir(&self, queue: QueueKind) -> &Path {
        match queue {
            QueueKind::Primary => &self.primary_dir,
            QueueKind::Supplementary => &self.supplementary_dir,
        }
    }
}

impl BlobStorage for FsStorage {
    fn persist(&self, queue: QueueKind, bytes: &[u8]) -> Result<StorageRef, StorageError> {
        let path = self.dir(queue).join(format!("{}.png", uuid::Uuid::new_v4()));
        std::fs::write(&path, bytes).map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(StorageRef(path))
    }

    fn read(&self, storage_ref: &StorageRef) -> Result<Vec<u8>, StorageError> {
        std::fs::read(storage_ref.path()).map_err(|source| StorageError::Read {
            path: storage_ref.0.clone(),
            source,
        })
    }

    fn delete(&self, storage_ref: &StorageRef) -> std::io::Result<()> {
        std::fs::remove_file(storage_ref.path())
    }
}

/// Monotonic per-store identifier; later captures compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(pub u64);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct CapturedImage {
    id: ImageId,
    storage_ref: StorageRef,
    captured_at: DateTime<Local>,
    encoded: OnceCell<String>,
}

impl CapturedImage {
    pub fn new(id: ImageId, storage_ref: StorageRef) -> Self {
        Self {
            id,
            storage_ref,
            captured_at: Local::now(),
            encoded: OnceCell::new(),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn storage_ref(&self) -> &StorageRef {
        &self.storage_ref
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// Base64 of the stored bytes, read on first use and cached.
    pub fn encoded_data(&self, storage: &dyn BlobStorage) -> Result<&str, StorageError> {
        self.encoded
            .get_or_try_init(|| storage.read(&self.storage_ref).map(|b| STANDARD.encode(b)))
            .map(String::as_str)
    }
}

/// A queued image with its display preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub id: ImageId,
    pub path: PathBuf,
    pub preview: String,
}

pub struct ScreenshotStore {
    storage: Arc<dyn BlobStorage>,
    guard: CaptureGuard,
    primary: VecDeque<Arc<CapturedImage>>,
    supplementary: VecDeque<Arc<CapturedImage>>,
    mode: QueueKind,
    capacity: usize,
    next_id: u64,
}

impl ScreenshotStore {
    pub fn new(storage: Arc<dyn BlobStorage>, guard: CaptureGuard, capacity: usize) -> Self {
        Self {
            storage,
            guard,
            primary: VecDeque::with_capacity(capacity + 1),
            supplementary: VecDeque::with_capacity(capacity + 1),
            mode: QueueKind::Primary,
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    pub fn storage(&self) -> Arc<dyn BlobStorage> {
        Arc::clone(&self.storage)
    }

    /// The queue new captures land in.
    pub fn mode(&self) -> QueueKind {
        self.mode
    }

    pub fn len(&self, queue: QueueKind) -> usize {
        self.queue(queue).len()
    }

    pub fn is_empty(&self, queue: QueueKind) -> bool {
        self.queue(queue).is_empty()
    }

    fn queue(&self, queue: QueueKind) -> &VecDeque<Arc<CapturedImage>> {
        match queue {
            QueueKind::Primary => &self.primary,
            QueueKind::Supplementary => &self.supplementary,
        }
    }

    fn queue_mut(&mut self, queue: QueueKind) -> &mut VecDeque<Arc<CapturedImage>> {
        match queue {
            QueueKind::Primary => &mut self.primary,
            QueueKind::Supplementary => &mut self.supplementary,
        }
    }

    /// Write `bytes` to storage and queue the result in `target`.
    pub fn store_capture(
        &mut self,
        target: QueueKind,
        bytes: &[u8],
    ) -> Result<Arc<CapturedImage>, StorageError> {
        let storage_ref = self.storage.persist(target, bytes)?;
        self.next_id += 1;
        let image = Arc::new(CapturedImage::new(ImageId(self.next_id), storage_ref));
        self.push(Arc::clone(&image), target);
        Ok(image)
    }

    /// Append `image`, evicting and deleting the oldest entries past capacity.
    /// Returns the evicted images.
    pub fn push(
        &mut self,
        image: Arc<CapturedImage>,
        target: QueueKind,
    ) -> Vec<Arc<CapturedImage>> {
        let capacity = self.capacity;
        let queue = self.queue_mut(target);
        queue.push_back(image);

        let mut evicted = Vec::new();
        while queue.len() > capacity {
            if let Some(old) = queue.pop_front() {
                evicted.push(old);
            }
        }
        for old in &evicted {
            self.release(old);
            info!(
                id = %old.id(),
                queue = %target,
                "Evicted oldest screenshot to maintain size limit"
            );
        }
        evicted
    }

    pub fn clear(&mut self, target: QueueKind) {
        let drained: Vec<_> = self.queue_mut(target).drain(..).collect();
        if drained.is_empty() {
            return;
        }
        for image in &drained {
            self.release(image);
        }
        info!(count = drained.len(), queue = %target, "Screenshot queue cleared");
    }

    /// Clear both queues and reset the capture guard.
    pub fn clear_all(&mut self) {
        self.clear(QueueKind::Primary);
        self.clear(QueueKind::Supplementary);
        self.guard.reset();
        info!("All queues cleared and spam protection state reset");
    }

    /// Switching to primary starts a new problem, so supplementary images
    /// are dropped.
    pub fn switch_mode(&mut self, mode: QueueKind) {
        self.mode = mode;
        if mode == QueueKind::Primary {
            self.clear(QueueKind::Supplementary);
        }
    }

    pub fn snapshot(&self, target: QueueKind) -> Vec<Arc<CapturedImage>> {
        self.queue(target).iter().cloned().collect()
    }

    /// Previews for `target` in queue order. Unreadable entries are skipped.
    pub fn previews(&self, target: QueueKind) -> Vec<Preview> {
        self.queue(target)
            .iter()
            .filter_map(|image| match self.storage.encode_preview(image.storage_ref()) {
                Ok(preview) => Some(Preview {
                    id: image.id(),
                    path: image.storage_ref().path().to_path_buf(),
                    preview,
                }),
                Err(e) => {
                    warn!("Error reading screenshot preview: {e}");
                    None
                }
            })
            .collect()
    }

    fn release(&self, image: &CapturedImage) {
        if let Err(e) = self.storage.delete(image.storage_ref()) {
            warn!(
                "Error deleting screenshot at {}: {e}",
                image.storage_ref().path().display()
            );
        }
    }
}
