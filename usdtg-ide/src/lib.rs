//! IDE session core for USDTgScript projects.
//!
//! Clients exchange newline-delimited JSON messages with a
//! [`MessageBroker`], which routes them to the single
//! [`SessionCoordinator`] and broadcasts every response to all connected
//! clients:
//!
//!   client line
//!     -> protocol  (decode envelope)
//!     -> broker    (per-client queue, broadcast with sequence numbers)
//!     -> session   (state machine: idle / compiling / running / debugging)
//!     -> loader | usdtg-core pipeline | sandbox

// ---------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------

pub mod config;
pub mod error;

// ---------------------------------------------------------------------
// Services the session dispatches to
// ---------------------------------------------------------------------

pub mod loader;
pub mod sandbox;

// ---------------------------------------------------------------------
// Session, protocol and transport
// ---------------------------------------------------------------------

pub mod session;
pub mod protocol;
pub mod broker;
pub mod server;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use broker::{ClientHandle, MessageBroker};
pub use config::{CommandSpec, IdeConfig};
pub use error::{ErrorKind, ErrorStage, IdeError};
pub use loader::SourceLoader;
pub use protocol::{Event, EventBody, Request};
pub use sandbox::{OsSandbox, ProcessOutput, ProcessSandbox, SpawnRequest};
pub use server::serve;
pub use session::{Session, SessionCoordinator, SessionState};
