//! Commands sent to a spawned worker thread.

use tokio::sync::oneshot;

use crate::error::ScriptError;
use crate::worker::Worker;

/// Resolver that can be shipped to the worker thread.
pub type SendResolveFn = Box<dyn FnMut(&mut Worker, &str, &str) -> i32 + Send>;

pub(crate) type Reply = oneshot::Sender<Result<(), ScriptError>>;

pub(crate) enum WorkerCommand {
    /// Run a classic script.
    Load {
        name: String,
        source: String,
        reply: Reply,
    },

    /// Load and evaluate an ES module.
    LoadModule {
        name: String,
        source: String,
        resolver: SendResolveFn,
        reply: Reply,
    },

    /// Deliver a payload to the guest's recv handler.
    SendBytes { payload: Vec<u8>, reply: Reply },

    /// Add a source module to the built-in table.
    RegisterBuiltin {
        specifier: String,
        source: String,
        reply: Reply,
    },
}

impl WorkerCommand {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            WorkerCommand::Load { .. } => "load",
            WorkerCommand::LoadModule { .. } => "load_module",
            WorkerCommand::SendBytes { .. } => "send_bytes",
            WorkerCommand::RegisterBuiltin { .. } => "register_builtin",
        }
    }

    /// Runs the command against `worker` and answers the caller.
    pub(crate) fn run(self, worker: &mut Worker) {
        match self {
            WorkerCommand::Load {
                name,
                source,
                reply,
            } => {
                let _ = reply.send(worker.load(&name, &source));
            }
            WorkerCommand::LoadModule {
                name,
                source,
                resolver,
                reply,
            } => {
                let _ = reply.send(worker.load_module(&name, &source, resolver));
            }
            WorkerCommand::SendBytes { payload, reply } => {
                let _ = reply.send(worker.send_bytes(&payload));
            }
            WorkerCommand::RegisterBuiltin {
                specifier,
                source,
                reply,
            } => {
                let _ = reply.send(worker.register_builtin(&specifier, &source));
            }
        }
    }
}
