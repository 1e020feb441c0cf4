//! JsWorker
//!
//! Embeds isolated JavaScript workers in a host program. Each [`Worker`] owns
//! its own engine runtime and talks to the host over a single binary channel:
//! the guest calls `send`/`recv`, the host supplies a callback and calls
//! [`Worker::send_bytes`].
//!
//! # Architecture
//!
//! - Engine flags are process-wide and freeze when the first worker is created
//! - Classic scripts see a `JsWorker` global; modules import the same
//!   primitives from `core:worker.js`
//! - Imports the worker does not know are handed to a host resolver, which
//!   may reenter `load_module` on the same worker
//! - A [`TerminationHandle`] interrupts running code from any thread
//! - [`spawn_worker`] runs a worker on its own thread behind an async
//!   [`WorkerHandle`]

mod channel;
mod command;
mod config;
mod engine;
mod error;
mod exception;
mod handle;
mod modules;
mod ops;
mod spawn;
mod worker;

pub use channel::RecvCallback;
pub use command::SendResolveFn;
pub use config::WorkerConfig;
pub use engine::{flags, flags_frozen, set_flags, version, EngineFlags, DEFAULT_MAX_NESTING_DEPTH};
pub use error::{ConfigError, Diagnostic, HandleError, Location, ScriptError};
pub use handle::TerminationHandle;
pub use modules::{ResolveFn, RESOLVED};
pub use ops::WORKER_MODULE;
pub use spawn::{spawn_worker, WorkerHandle};
pub use worker::Worker;
