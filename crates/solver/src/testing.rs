//! In-memory doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::api::{EventStream, ModelRequest, ModelTransport, TransportEvent};
use crate::capture::ScreenCapture;
use crate::compress::{CompressError, CompressionTier, EncodedImage, ImageCompressor};
use crate::error::{CaptureError, StorageError, TransportError};
use crate::store::{BlobStorage, QueueKind, StorageRef};

#[derive(Default)]
pub(crate) struct MemoryStorage {
    blobs: Mutex<HashMap<PathBuf, Vec<u8>>>,
    deleted: Mutex<Vec<StorageRef>>,
    next: AtomicUsize,
    reads: AtomicUsize,
    fail_deletes: AtomicBool,
}

impl MemoryStorage {
    pub(crate) fn deleted(&self) -> Vec<StorageRef> {
        self.deleted.lock().clone()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.blobs.lock().len()
    }

    pub(crate) fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

impl BlobStorage for MemoryStorage {
    fn persist(&self, queue: QueueKind, bytes: &[u8]) -> Result<StorageRef, StorageError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let path = PathBuf::from(format!("mem/{queue}/{n}.png"));
        self.blobs.lock().insert(path.clone(), bytes.to_vec());
        Ok(StorageRef::new(path))
    }

    fn read(&self, storage_ref: &StorageRef) -> Result<Vec<u8>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .get(storage_ref.path())
            .cloned()
            .ok_or_else(|| StorageError::Read {
                path: storage_ref.path().to_path_buf(),
                source: std::io::ErrorKind::NotFound.into(),
            })
    }

    fn delete(&self, storage_ref: &StorageRef) -> std::io::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("delete refused"));
        }
        self.blobs.lock().remove(storage_ref.path());
        self.deleted.lock().push(storage_ref.clone());
        Ok(())
    }
}

/// What a [`ScriptedTransport`] does on each call.
pub(crate) enum Script {
    Reply(String),
    Fail(u16),
    Events(Vec<TransportEvent>),
    /// Yields the events, then never finishes.
    EventsThenHang(Vec<TransportEvent>),
    Hang,
}

pub(crate) struct ScriptedTransport {
    script: Script,
    calls: AtomicUsize,
    last_request: Mutex<Option<ModelRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<ModelRequest> {
        self.last_request.lock().clone()
    }

    fn record(&self, request: &ModelRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn generate(&self, request: &ModelRequest) -> Result<String, TransportError> {
        self.record(request);
        match &self.script {
            Script::Reply(text) => Ok(text.clone()),
            Script::Fail(code) => Err(TransportError::from_status(*code, "")),
            Script::Events(events) | Script::EventsThenHang(events) => Ok(events
                .iter()
                .filter_map(|e| match e {
                    TransportEvent::Data(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect()),
            Script::Hang => std::future::pending().await,
        }
    }

    async fn stream(&self, request: &ModelRequest) -> Result<EventStream, TransportError> {
        self.record(request);
        match &self.script {
            Script::Reply(text) => Ok(stream::iter([
                TransportEvent::Data(text.clone()),
                TransportEvent::End,
            ])
            .boxed()),
            Script::Fail(code) => Err(TransportError::from_status(*code, "")),
            Script::Events(events) => Ok(stream::iter(events.clone()).boxed()),
            Script::EventsThenHang(events) => Ok(stream::iter(events.clone())
                .chain(stream::pending())
                .boxed()),
            Script::Hang => Ok(stream::pending().boxed()),
        }
    }
}

/// Hands out queued results, then a fixed PNG once the queue is empty.
#[derive(Default)]
pub(crate) struct ScriptedCapture {
    results: Mutex<VecDeque<Result<Vec<u8>, CaptureError>>>,
    calls: AtomicUsize,
}

impl ScriptedCapture {
    pub(crate) fn push(&self, result: Result<Vec<u8>, CaptureError>) {
        self.results.lock().push_back(result);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScreenCapture for ScriptedCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(b"\x89PNG\r\n\x1a\nstub".to_vec()))
    }
}

/// Returns images unchanged and counts how often it was asked.
#[derive(Default)]
pub(crate) struct PassthroughCompressor {
    calls: AtomicUsize,
}

impl PassthroughCompressor {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageCompressor for PassthroughCompressor {
    async fn compress(
        &self,
        image: &EncodedImage,
        _tier: CompressionTier,
    ) -> Result<EncodedImage, CompressError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(image.clone())
    }
}
