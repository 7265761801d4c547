//! The solver context: one per running session. Owns the queues, the capture
//! guard and the exchange driver, and reports progress to the display layer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::api::{build_transport, ModelTransport};
use crate::capture::{ScreenCapture, SystemCapture};
use crate::compress::{
    fit_to_limit, CompressionLimits, EncodedImage, FitOutcome, ImageCompressor, RasterCompressor,
};
use crate::config::Config;
use crate::error::{CaptureError, ExchangeError, StorageError};
use crate::events::{ProgressEvent, ProgressSender};
use crate::exchange::{ExchangeDriver, ExchangeKind, ExchangeTicket};
use crate::guard::{CaptureGuard, GuardPolicy, GuardStatus};
use crate::logging::SessionLog;
use crate::parse::{parse_response, ParsedResponse};
use crate::preferences::{language_preference, model_credential};
use crate::store::{BlobStorage, CapturedImage, FsStorage, Preview, QueueKind, ScreenshotStore};

/// A finished exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub kind: ExchangeKind,
    pub language: &'static str,
    pub response: ParsedResponse,
    pub partial: bool,
    /// Compression rounds needed to fit the payload; 0 when none were.
    pub compression_attempts: usize,
}

pub struct Solver {
    config: Config,
    guard: CaptureGuard,
    store: Mutex<ScreenshotStore>,
    capturer: Arc<dyn ScreenCapture>,
    compressor: Arc<dyn ImageCompressor>,
    driver: ExchangeDriver,
    progress: ProgressSender,
    transcript: SessionLog,
}

impl Solver {
    /// Production wiring: screenshots on disk under the storage root, system
    /// screen capture, raster compression and the configured model backend.
    pub fn new(config: Config, progress: ProgressSender) -> Result<Self, StorageError> {
        let storage = Arc::new(FsStorage::new(&config.storage.root())?);
        let transport = build_transport(&config.api, model_credential(&config.api));
        if transport.is_none() {
            warn!("No API key configured; exchanges will fail until one is set");
        }
        let transcript = SessionLog::from_config(&config.logging);

        Ok(Self::with_parts(
            config,
            storage,
            Arc::new(SystemCapture::default()),
            Arc::new(RasterCompressor),
            transport,
            progress,
        )
        .with_transcript(transcript))
    }

    pub fn with_parts(
        config: Config,
        storage: Arc<dyn BlobStorage>,
        capturer: Arc<dyn ScreenCapture>,
        compressor: Arc<dyn ImageCompressor>,
        transport: Option<Arc<dyn ModelTransport>>,
        progress: ProgressSender,
    ) -> Self {
        let guard = CaptureGuard::new(GuardPolicy::from(&config.capture));
        let store = ScreenshotStore::new(storage, guard.clone(), config.capture.queue_capacity);
        let driver = ExchangeDriver::new(
            transport,
            config.api.stream,
            Duration::from_secs(config.api.stream_timeout_secs),
        );

        Self {
            config,
            guard,
            store: Mutex::new(store),
            capturer,
            compressor,
            driver,
            progress,
            transcript: SessionLog::disabled(),
        }
    }

    pub fn with_capturer(mut self, capturer: Arc<dyn ScreenCapture>) -> Self {
        self.capturer = capturer;
        self
    }

    pub fn with_transcript(mut self, transcript: SessionLog) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the model credential. Takes effect for the next exchange.
    pub fn set_credential(&self, credential: Option<String>) {
        let credential = credential.filter(|k| !k.trim().is_empty());
        self.driver
            .set_transport(build_transport(&self.config.api, credential));
    }

    pub fn is_configured(&self) -> bool {
        self.driver.is_configured()
    }

    // --- Capture & queues ---

    /// Capture the screen into the queue for the current mode.
    pub async fn capture(&self) -> Result<Arc<CapturedImage>, CaptureError> {
        match self.capture_inner().await {
            Ok(image) => Ok(image),
            Err(e) => {
                warn!("Screenshot capture failed: {e}");
                self.progress.emit(ProgressEvent::CaptureFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn capture_inner(&self) -> Result<Arc<CapturedImage>, CaptureError> {
        let permit = self.guard.request_capture()?;
        let bytes = self.capturer.capture().await?;

        let (image, queue, len) = {
            let mut store = self.store.lock();
            let queue = store.mode();
            let image = store.store_capture(queue, &bytes)?;
            (image, queue, store.len(queue))
        };
        permit.succeed();

        info!(id = %image.id(), %queue, "Screenshot captured");
        self.progress.emit(ProgressEvent::CaptureSucceeded {
            id: image.id(),
            queue,
        });
        self.progress.emit(ProgressEvent::QueueChanged { queue, len });
        Ok(image)
    }

    pub fn mode(&self) -> QueueKind {
        self.store.lock().mode()
    }

    pub fn switch_mode(&self, mode: QueueKind) {
        let cleared = {
            let mut store = self.store.lock();
            let before = store.len(QueueKind::Supplementary);
            store.switch_mode(mode);
            before != store.len(QueueKind::Supplementary)
        };
        if cleared {
            self.emit_queue(QueueKind::Supplementary);
        }
    }

    pub fn queue_len(&self, queue: QueueKind) -> usize {
        self.store.lock().len(queue)
    }

    pub fn previews(&self, queue: QueueKind) -> Vec<Preview> {
        self.store.lock().previews(queue)
    }

    pub fn protection_status(&self) -> GuardStatus {
        self.guard.status()
    }

    /// Abort the in-flight exchange. Its caller sees `Cancelled` and no
    /// completion event is emitted.
    pub fn cancel(&self) -> bool {
        self.driver.cancel()
    }

    /// Cancel any exchange, empty both queues and reset spam protection.
    pub fn clear_all(&self) {
        self.driver.cancel();
        self.store.lock().clear_all();
        self.emit_queue(QueueKind::Primary);
        self.emit_queue(QueueKind::Supplementary);
    }

    /// Back to a blank slate in primary mode.
    pub fn start_over(&self) {
        self.clear_all();
        self.store.lock().switch_mode(QueueKind::Primary);
        info!("Session reset to primary mode");
    }

    fn emit_queue(&self, queue: QueueKind) {
        let len = self.queue_len(queue);
        self.progress.emit(ProgressEvent::QueueChanged { queue, len });
    }

    // --- Exchanges ---

    /// Send the primary queue for a fresh solution.
    pub async fn solve(&self, language: Option<&str>) -> Result<Solution, ExchangeError> {
        self.solve_from(QueueKind::Primary, language).await
    }

    /// Solve using the screenshots in `queue` alone.
    pub async fn solve_from(
        &self,
        queue: QueueKind,
        language: Option<&str>,
    ) -> Result<Solution, ExchangeError> {
        self.run_exchange(ExchangeKind::Solve, queue, language).await
    }

    /// Send primary plus supplementary screenshots to debug the last solution.
    pub async fn refine(&self, language: Option<&str>) -> Result<Solution, ExchangeError> {
        self.run_exchange(ExchangeKind::Refine, QueueKind::Primary, language)
            .await
    }

    async fn run_exchange(
        &self,
        kind: ExchangeKind,
        queue: QueueKind,
        language: Option<&str>,
    ) -> Result<Solution, ExchangeError> {
        let language = language_preference(language.or(Some(self.config.language.as_str())));
        let ticket = self.driver.begin()?;
        self.progress.emit(ProgressEvent::ExchangeStarted { kind });

        let result = self.exchange(&ticket, kind, queue, language).await;

        if ticket.is_cancelled() {
            info!(%kind, "Exchange cancelled; result discarded");
            return Err(ExchangeError::Cancelled);
        }

        let title = format!("{} ({language})", title_for(kind));
        match result {
            Ok(solution) => {
                match kind {
                    ExchangeKind::Solve => self.switch_mode(QueueKind::Supplementary),
                    ExchangeKind::Refine => {
                        self.store.lock().clear(QueueKind::Supplementary);
                        self.emit_queue(QueueKind::Supplementary);
                    }
                }
                self.progress.emit(ProgressEvent::ExchangeSucceeded {
                    kind,
                    response: solution.response.clone(),
                    partial: solution.partial,
                });
                info!(%kind, partial = solution.partial, "Exchange succeeded");
                Ok(solution)
            }
            Err(ExchangeError::Cancelled) => Err(ExchangeError::Cancelled),
            Err(e) => {
                error!(%kind, "Exchange failed: {e}");
                // Switching to primary clears supplementary, which may be the source.
                if kind == ExchangeKind::Solve && queue == QueueKind::Primary {
                    self.switch_mode(QueueKind::Primary);
                }
                self.transcript.log_failure(&title, &e.to_string());
                self.progress.emit(ProgressEvent::ExchangeFailed {
                    kind,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        ticket: &ExchangeTicket,
        kind: ExchangeKind,
        queue: QueueKind,
        language: &'static str,
    ) -> Result<Solution, ExchangeError> {
        if !self.driver.is_configured() {
            return Err(ExchangeError::NotConfigured);
        }

        let images = self.load_images(kind, queue).await?;
        let count = images.len();

        let limits = CompressionLimits::from(&self.config.compression);
        let (images, compression_attempts) =
            match fit_to_limit(images, limits, self.compressor.as_ref()).await {
                FitOutcome::Fitted {
                    images, attempts, ..
                } => (images, attempts),
                FitOutcome::TooLarge { .. } => {
                    return Err(ExchangeError::PayloadTooLarge(
                        FitOutcome::TOO_LARGE_MESSAGE.to_string(),
                    ))
                }
            };
        if ticket.is_cancelled() {
            return Err(ExchangeError::Cancelled);
        }

        let progress = self.progress.clone();
        let reply = self
            .driver
            .invoke(ticket, images, kind, language, move |chunk| {
                progress.emit(ProgressEvent::ExchangeChunk {
                    kind,
                    text: chunk.to_string(),
                })
            })
            .await?;

        self.transcript.log_exchange(
            &format!("{} ({language})", title_for(kind)),
            count,
            &reply.text,
        );

        Ok(Solution {
            kind,
            language,
            response: parse_response(&reply.text),
            partial: reply.partial,
            compression_attempts,
        })
    }

    /// Base64 payloads in send order. A refine always sends primary then
    /// supplementary.
    async fn load_images(
        &self,
        kind: ExchangeKind,
        queue: QueueKind,
    ) -> Result<Vec<EncodedImage>, ExchangeError> {
        let first = match kind {
            ExchangeKind::Solve => queue,
            ExchangeKind::Refine => QueueKind::Primary,
        };
        let (storage, mut queued) = {
            let store = self.store.lock();
            (store.storage(), store.snapshot(first))
        };
        if queued.is_empty() {
            return Err(ExchangeError::NoScreenshots);
        }
        if kind == ExchangeKind::Refine {
            let extra = self.store.lock().snapshot(QueueKind::Supplementary);
            if extra.is_empty() {
                return Err(ExchangeError::NoScreenshots);
            }
            queued.extend(extra);
        }

        // Storage reads are blocking file IO.
        let encoded = tokio::task::spawn_blocking(move || {
            queued
                .iter()
                .map(|image| {
                    let data = image.encoded_data(storage.as_ref())?;
                    Ok(EncodedImage::png(image.id(), data.to_string()))
                })
                .collect::<Result<Vec<_>, StorageError>>()
        })
        .await
        .map_err(|e| ExchangeError::Task(e.to_string()))?;
        Ok(encoded?)
    }
}

fn title_for(kind: ExchangeKind) -> &'static str {
    match kind {
        ExchangeKind::Solve => "Solve",
        ExchangeKind::Refine => "Refine",
    }
}
