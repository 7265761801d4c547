//! Model invocation: prompt assembly, single-flight, cancellation and the
//! streaming state machine.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ModelRequest, ModelTransport, TransportEvent};
use crate::compress::EncodedImage;
use crate::error::{ExchangeError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Primary queue, produce a solution.
    Solve,
    /// Primary plus supplementary queues, debug the previous solution.
    Refine,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Solve => write!(f, "solve"),
            Self::Refine => write!(f, "refine"),
        }
    }
}

pub fn build_prompt(kind: ExchangeKind, language: &str) -> String {
    match kind {
        ExchangeKind::Solve => format!(
            "You are an expert coding interviewer. The screenshot(s) show a coding problem. \
             Solve it in {language}.\n\n\
             Provide:\n\
             1. Problem analysis\n\
             2. Solution approach\n\
             3. Complete code solution\n\
             4. Time and space complexity\n\n\
             Respond with a single raw JSON object with the keys \"analysis\", \"approach\", \
             \"code\" and \"complexity\". \"complexity\" is itself an object with the keys \
             \"time_complexity\" and \"space_complexity\".\n\
             Output only the JSON object: no Markdown, no code fences, no text around it."
        ),
        ExchangeKind::Refine => format!(
            "You are debugging a coding solution. The first screenshot(s) show the problem; the \
             later ones show new information such as failing tests or error output. Suggest \
             fixes or improvements to the existing solution in {language}.\n\n\
             Provide:\n\
             1. Analysis of the new screenshots\n\
             2. Debugging suggestions\n\
             3. Improved code if applicable\n\
             4. Further recommendations\n\n\
             Respond with a single raw JSON object with the keys \"analysis\", \"debugging\", \
             \"improved_code\" and \"recommendations\"."
        ),
    }
}

// --- Streaming state machine ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Active,
    Completed,
    Failed,
    TimedOut,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// Ended or closed before any text arrived.
    NoData,
    /// The deadline passed before any text arrived.
    TimedOut,
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { text: String, partial: bool },
    Failed(StreamFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The event arrived after a terminal state, or before `start`.
    Ignored,
    Chunk(String),
    Finished(StreamOutcome),
}

/// `Idle -> Active -> {Completed, Failed, TimedOut}`. Exactly one call
/// returns a terminal outcome; everything after it is ignored.
#[derive(Debug)]
pub struct StreamMachine {
    phase: StreamPhase,
    buffer: String,
}

impl Default for StreamMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMachine {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Idle,
            buffer: String::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn start(&mut self) {
        if self.phase == StreamPhase::Idle {
            self.phase = StreamPhase::Active;
        }
    }

    pub fn on_event(&mut self, event: TransportEvent) -> Step {
        if self.phase != StreamPhase::Active {
            return Step::Ignored;
        }

        match event {
            TransportEvent::Data(text) if text.is_empty() => Step::Ignored,
            TransportEvent::Data(text) => {
                self.buffer.push_str(&text);
                Step::Chunk(text)
            }
            TransportEvent::End => {
                if self.has_data() {
                    self.complete(false)
                } else {
                    self.fail(StreamFailure::NoData)
                }
            }
            TransportEvent::Error(message) => self.fail(StreamFailure::Transport(message)),
            TransportEvent::Close => {
                warn!("Stream closed unexpectedly");
                if self.has_data() {
                    self.complete(true)
                } else {
                    self.fail(StreamFailure::NoData)
                }
            }
        }
    }

    /// Deadline reached. Accumulated text, if any, becomes the result.
    pub fn on_timeout(&mut self) -> Option<StreamOutcome> {
        if self.phase != StreamPhase::Active {
            return None;
        }
        let received = self.has_data();
        info!(received, "Stream processing timeout");
        self.phase = StreamPhase::TimedOut;
        Some(if received {
            StreamOutcome::Completed {
                text: std::mem::take(&mut self.buffer),
                partial: true,
            }
        } else {
            StreamOutcome::Failed(StreamFailure::TimedOut)
        })
    }

    /// Whitespace alone does not count as a reply.
    fn has_data(&self) -> bool {
        !self.buffer.trim().is_empty()
    }

    fn complete(&mut self, partial: bool) -> Step {
        self.phase = StreamPhase::Completed;
        Step::Finished(StreamOutcome::Completed {
            text: std::mem::take(&mut self.buffer),
            partial,
        })
    }

    fn fail(&mut self, failure: StreamFailure) -> Step {
        self.phase = StreamPhase::Failed;
        Step::Finished(StreamOutcome::Failed(failure))
    }
}

// --- Single-flight slot ---

#[derive(Debug, Default)]
struct SlotState {
    in_flight: Option<CancellationToken>,
    generation: u64,
}

/// Held for the duration of one exchange. Dropping it frees the slot unless a
/// cancellation already did.
#[derive(Debug)]
pub struct ExchangeTicket {
    slot: Arc<Mutex<SlotState>>,
    generation: u64,
    token: CancellationToken,
}

impl ExchangeTicket {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ExchangeTicket {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.generation == self.generation {
            slot.in_flight = None;
        }
    }
}

/// Text returned by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReply {
    pub text: String,
    /// Streaming stopped early; `text` is what had arrived.
    pub partial: bool,
}

pub struct ExchangeDriver {
    transport: RwLock<Option<Arc<dyn ModelTransport>>>,
    stream: bool,
    stream_timeout: Duration,
    slot: Arc<Mutex<SlotState>>,
}

impl ExchangeDriver {
    pub fn new(
        transport: Option<Arc<dyn ModelTransport>>,
        stream: bool,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            transport: RwLock::new(transport),
            stream,
            stream_timeout,
            slot: Arc::new(Mutex::new(SlotState::default())),
        }
    }

    /// Replace the transport, e.g. after the credential changes. `None`
    /// leaves the driver unconfigured.
    pub fn set_transport(&self, transport: Option<Arc<dyn ModelTransport>>) {
        if transport.is_none() {
            warn!("Model transport cleared");
        }
        *self.transport.write() = transport;
    }

    pub fn is_configured(&self) -> bool {
        self.transport.read().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().in_flight.is_some()
    }

    /// Claim the single exchange slot.
    pub fn begin(&self) -> Result<ExchangeTicket, ExchangeError> {
        let mut slot = self.slot.lock();
        if slot.in_flight.is_some() {
            return Err(ExchangeError::Busy);
        }
        slot.generation += 1;
        let token = CancellationToken::new();
        slot.in_flight = Some(token.clone());
        Ok(ExchangeTicket {
            slot: Arc::clone(&self.slot),
            generation: slot.generation,
            token,
        })
    }

    /// Abort the in-flight exchange, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        match slot.in_flight.take() {
            Some(token) => {
                token.cancel();
                info!("In-flight exchange cancelled");
                true
            }
            None => false,
        }
    }

    /// Run one exchange. `on_chunk` sees each streamed fragment in arrival
    /// order; it is never called for one-shot requests.
    pub async fn invoke<F>(
        &self,
        ticket: &ExchangeTicket,
        images: Vec<EncodedImage>,
        kind: ExchangeKind,
        language: &str,
        on_chunk: F,
    ) -> Result<ExchangeReply, ExchangeError>
    where
        F: FnMut(&str) + Send,
    {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(ExchangeError::NotConfigured)?;

        let request = ModelRequest {
            prompt: build_prompt(kind, language),
            images,
        };
        debug!(
            %kind,
            language,
            images = request.images.len(),
            stream = self.stream,
            "Invoking model"
        );

        if self.stream {
            self.invoke_streaming(ticket, transport.as_ref(), &request, on_chunk)
                .await
        } else {
            tokio::select! {
                biased;
                _ = ticket.token.cancelled() => Err(ExchangeError::Cancelled),
                result = transport.generate(&request) => result
                    .map(|text| ExchangeReply { text, partial: false })
                    .map_err(ExchangeError::from),
            }
        }
    }

    async fn invoke_streaming<F>(
        &self,
        ticket: &ExchangeTicket,
        transport: &dyn ModelTransport,
        request: &ModelRequest,
        mut on_chunk: F,
    ) -> Result<ExchangeReply, ExchangeError>
    where
        F: FnMut(&str) + Send,
    {
        let deadline = tokio::time::sleep(self.stream_timeout);
        tokio::pin!(deadline);

        let mut events = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Err(ExchangeError::Cancelled),
            _ = &mut deadline => return Err(ExchangeError::StreamTimedOut),
            result = transport.stream(request) => result?,
        };

        let mut machine = StreamMachine::new();
        machine.start();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = ticket.token.cancelled() => return Err(ExchangeError::Cancelled),
                _ = &mut deadline => {
                    if let Some(outcome) = machine.on_timeout() {
                        break outcome;
                    }
                }
                event = events.next() => {
                    // A transport that just stops yielding has closed on us.
                    let event = event.unwrap_or(TransportEvent::Close);
                    match machine.on_event(event) {
                        Step::Chunk(text) => on_chunk(&text),
                        Step::Finished(outcome) => break outcome,
                        Step::Ignored => {}
                    }
                }
            }
        };
        drop(events);

        match outcome {
            StreamOutcome::Completed { text, partial } => Ok(ExchangeReply { text, partial }),
            StreamOutcome::Failed(StreamFailure::NoData) => Err(ExchangeError::EmptyStream),
            StreamOutcome::Failed(StreamFailure::TimedOut) => Err(ExchangeError::StreamTimedOut),
            StreamOutcome::Failed(StreamFailure::Transport(message)) => {
                Err(TransportError::Stream(message).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ImageId;
    use crate::testing::{Script, ScriptedTransport};

    fn image() -> Vec<EncodedImage> {
        vec![EncodedImage::png(ImageId(1), "QUJD".into())]
    }

    fn driver(transport: &Arc<ScriptedTransport>, stream: bool) -> ExchangeDriver {
        ExchangeDriver::new(
            Some(transport.clone() as Arc<dyn ModelTransport>),
            stream,
            Duration::from_secs(300),
        )
    }

    #[test]
    fn prompts_name_the_language_and_fields() {
        let solve = build_prompt(ExchangeKind::Solve, "rust");
        assert!(solve.contains("in rust"));
        assert!(solve.contains("\"time_complexity\""));

        let refine = build_prompt(ExchangeKind::Refine, "go");
        assert!(refine.contains("in go"));
        assert!(refine.contains("\"improved_code\""));
    }

    #[test]
    fn machine_ignores_events_before_start_and_after_terminal() {
        let mut machine = StreamMachine::new();
        assert_eq!(machine.on_event(TransportEvent::Data("x".into())), Step::Ignored);

        machine.start();
        assert_eq!(
            machine.on_event(TransportEvent::Data("abc".into())),
            Step::Chunk("abc".into())
        );
        assert_eq!(
            machine.on_event(TransportEvent::Close),
            Step::Finished(StreamOutcome::Completed {
                text: "abc".into(),
                partial: true
            })
        );
        assert_eq!(machine.phase(), StreamPhase::Completed);
        assert_eq!(machine.on_event(TransportEvent::End), Step::Ignored);
        assert_eq!(machine.on_event(TransportEvent::Error("late".into())), Step::Ignored);
        assert_eq!(machine.on_timeout(), None);
    }

    #[test]
    fn machine_end_without_data_fails() {
        let mut machine = StreamMachine::new();
        machine.start();
        machine.on_event(TransportEvent::Data("  ".into()));
        assert_eq!(
            machine.on_event(TransportEvent::End),
            Step::Finished(StreamOutcome::Failed(StreamFailure::NoData))
        );
        assert_eq!(machine.phase(), StreamPhase::Failed);
    }

    #[test]
    fn machine_whitespace_only_stream_has_no_data() {
        let mut closed = StreamMachine::new();
        closed.start();
        assert_eq!(closed.on_event(TransportEvent::Data(String::new())), Step::Ignored);
        assert_eq!(
            closed.on_event(TransportEvent::Data("  \n".into())),
            Step::Chunk("  \n".into())
        );
        assert_eq!(
            closed.on_event(TransportEvent::Close),
            Step::Finished(StreamOutcome::Failed(StreamFailure::NoData))
        );

        let mut timed_out = StreamMachine::new();
        timed_out.start();
        timed_out.on_event(TransportEvent::Data(" ".into()));
        assert_eq!(
            timed_out.on_timeout(),
            Some(StreamOutcome::Failed(StreamFailure::TimedOut))
        );
    }

    #[test]
    fn machine_timeout_with_and_without_data() {
        let mut empty = StreamMachine::new();
        empty.start();
        assert_eq!(
            empty.on_timeout(),
            Some(StreamOutcome::Failed(StreamFailure::TimedOut))
        );
        assert_eq!(empty.phase(), StreamPhase::TimedOut);

        let mut partial = StreamMachine::new();
        partial.start();
        partial.on_event(TransportEvent::Data("half".into()));
        assert_eq!(
            partial.on_timeout(),
            Some(StreamOutcome::Completed {
                text: "half".into(),
                partial: true
            })
        );
        assert!(partial.phase().is_terminal());
    }

    #[tokio::test]
    async fn unconfigured_driver_fails_before_any_call() {
        let driver = ExchangeDriver::new(None, false, Duration::from_secs(300));
        let ticket = driver.begin().unwrap();
        let err = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NotConfigured));
    }

    #[tokio::test]
    async fn one_shot_returns_raw_text() {
        let transport = Arc::new(ScriptedTransport::new(Script::Reply("{\"code\":\"x\"}".into())));
        let driver = driver(&transport, false);
        let ticket = driver.begin().unwrap();

        let reply = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "java", |_| panic!("no chunks"))
            .await
            .unwrap();

        assert_eq!(reply.text, "{\"code\":\"x\"}");
        assert!(!reply.partial);
        let request = transport.last_request().unwrap();
        assert!(request.prompt.contains("in java"));
        assert_eq!(request.images.len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_keep_their_cause() {
        let transport = Arc::new(ScriptedTransport::new(Script::Fail(429)));
        let driver = driver(&transport, false);
        let ticket = driver.begin().unwrap();

        let err = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Transport(TransportError::Status { code: 429, .. })
        ));
    }

    #[tokio::test]
    async fn data_then_close_is_a_partial_success() {
        let transport = Arc::new(ScriptedTransport::new(Script::Events(vec![
            TransportEvent::Data("{\"code\":".into()),
            TransportEvent::Close,
            TransportEvent::Data("ignored".into()),
            TransportEvent::End,
        ])));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let mut chunks = Vec::new();
        let reply = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |c| {
                chunks.push(c.to_string())
            })
            .await
            .unwrap();

        assert_eq!(reply.text, "{\"code\":");
        assert!(reply.partial);
        assert_eq!(chunks, vec!["{\"code\":".to_string()]);
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_and_concatenate() {
        let transport = Arc::new(ScriptedTransport::new(Script::Events(vec![
            TransportEvent::Data("a".into()),
            TransportEvent::Data("b".into()),
            TransportEvent::Data("c".into()),
            TransportEvent::End,
        ])));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let mut chunks = String::new();
        let reply = driver
            .invoke(&ticket, image(), ExchangeKind::Refine, "python", |c| chunks.push_str(c))
            .await
            .unwrap();

        assert_eq!(reply.text, "abc");
        assert_eq!(chunks, "abc");
        assert!(!reply.partial);
    }

    #[tokio::test]
    async fn stream_that_just_stops_counts_as_close() {
        let transport = Arc::new(ScriptedTransport::new(Script::Events(vec![
            TransportEvent::Data("tail".into()),
        ])));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let reply = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {})
            .await
            .unwrap();
        assert_eq!(reply.text, "tail");
        assert!(reply.partial);
    }

    #[tokio::test]
    async fn stream_error_is_a_failure() {
        let transport = Arc::new(ScriptedTransport::new(Script::Events(vec![
            TransportEvent::Data("x".into()),
            TransportEvent::Error("connection reset".into()),
        ])));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let err = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Transport(TransportError::Stream(ref m)) if m == "connection reset"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_partial_data() {
        let transport = Arc::new(ScriptedTransport::new(Script::EventsThenHang(vec![
            TransportEvent::Data("partial".into()),
        ])));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let reply = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {})
            .await
            .unwrap();
        assert_eq!(reply.text, "partial");
        assert!(reply.partial);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_data_fails() {
        let transport = Arc::new(ScriptedTransport::new(Script::EventsThenHang(Vec::new())));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let err = driver
            .invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::StreamTimedOut));
    }

    #[tokio::test]
    async fn cancel_aborts_a_hanging_call() {
        let transport = Arc::new(ScriptedTransport::new(Script::Hang));
        let driver = driver(&transport, false);
        let ticket = driver.begin().unwrap();

        let (result, cancelled) = tokio::join!(
            driver.invoke(&ticket, image(), ExchangeKind::Solve, "python", |_| {}),
            async {
                tokio::task::yield_now().await;
                driver.cancel()
            }
        );

        assert!(cancelled);
        assert!(matches!(result, Err(ExchangeError::Cancelled)));
        assert!(ticket.is_cancelled());
        assert!(!driver.is_busy());
    }

    #[tokio::test]
    async fn cancel_aborts_a_hanging_stream_after_chunks() {
        let transport = Arc::new(ScriptedTransport::new(Script::EventsThenHang(vec![
            TransportEvent::Data("partial".into()),
        ])));
        let driver = driver(&transport, true);
        let ticket = driver.begin().unwrap();

        let mut chunks = Vec::new();
        let (result, cancelled) = tokio::join!(
            driver.invoke(&ticket, image(), ExchangeKind::Solve, "python", |c| {
                chunks.push(c.to_string())
            }),
            async {
                tokio::task::yield_now().await;
                driver.cancel()
            }
        );

        assert!(cancelled);
        assert!(matches!(result, Err(ExchangeError::Cancelled)));
        assert_eq!(chunks, vec!["partial".to_string()]);
        assert!(!driver.is_busy());
    }

    #[test]
    fn slot_is_single_flight() {
        let driver = ExchangeDriver::new(None, false, Duration::from_secs(1));
        let first = driver.begin().unwrap();
        assert!(matches!(driver.begin(), Err(ExchangeError::Busy)));
        drop(first);
        assert!(driver.begin().is_ok());
    }

    #[test]
    fn stale_ticket_does_not_free_a_newer_exchange() {
        let driver = ExchangeDriver::new(None, false, Duration::from_secs(1));
        let stale = driver.begin().unwrap();
        driver.cancel();
        let fresh = driver.begin().unwrap();

        drop(stale);
        assert!(driver.is_busy());
        drop(fresh);
        assert!(!driver.is_busy());
    }
}
