//! Screenshot-driven coding assistant core.
//!
//! Screenshots are captured under spam protection into two bounded queues,
//! compressed to fit a payload limit, sent to a vision model in one shot or
//! as a stream, and the reply is parsed into display sections. [`Solver`]
//! ties the pieces together; the CLI and any other front end only talk to it.

pub mod api;
pub mod capture;
pub mod compress;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod guard;
pub mod local;
pub mod logging;
pub mod parse;
pub mod preferences;
pub mod session;
pub mod sse;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{CaptureError, ExchangeError, GuardError, StorageError, TransportError};
pub use events::{ProgressEvent, ProgressSender};
pub use exchange::ExchangeKind;
pub use parse::{parse_response, Complexity, ParsedResponse, Section};
pub use session::{Solution, Solver};
pub use store::QueueKind;
