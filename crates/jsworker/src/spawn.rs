//! Workers on their own threads.
//!
//! [`spawn_worker`] creates a [`Worker`] on a dedicated thread and returns a
//! [`WorkerHandle`] that drives it from async code. Commands are processed one
//! at a time, in order. The handle is `Send + Sync`; the worker never leaves
//! its thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::{Reply, WorkerCommand};
use crate::config::WorkerConfig;
use crate::error::{HandleError, ScriptError};
use crate::handle::TerminationHandle;
use crate::worker::Worker;

/// Handle to a worker running on its own thread.
pub struct WorkerHandle {
    name: String,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: Arc<AtomicBool>,
    terminator: TerminationHandle,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Spawns a worker thread named after `config.name`.
///
/// Returns once the worker is ready, or with the error that prevented it from
/// starting. `callback` runs on the worker thread for every guest `send`.
pub fn spawn_worker<F>(config: WorkerConfig, callback: F) -> Result<WorkerHandle, HandleError>
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let name = config.name.clone();
    tracing::debug!("[spawn_worker] Starting {}", name);

    let shut_down = Arc::new(AtomicBool::new(false));
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) =
        std::sync::mpsc::sync_channel::<Result<TerminationHandle, HandleError>>(1);

    let thread_name = name.clone();
    let thread_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            tracing::debug!("[spawn_worker:{}] Thread started", thread_name);

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = init_tx.send(Err(HandleError::SpawnFailed(e)));
                    return;
                }
            };

            let worker = match Worker::with_config(config, callback) {
                Ok(worker) => worker,
                Err(e) => {
                    let _ = init_tx.send(Err(e.into()));
                    return;
                }
            };
            let _ = init_tx.send(Ok(worker.terminator()));

            rt.block_on(run_worker(worker, cmd_rx, shutdown_rx));
            rt.shutdown_background();
            tracing::debug!("[spawn_worker:{}] Thread exiting", thread_name);
        })?;

    let terminator = match init_rx.recv() {
        Ok(Ok(terminator)) => terminator,
        Ok(Err(e)) => {
            let _ = thread_handle.join();
            return Err(e);
        }
        Err(_) => {
            return Err(match thread_handle.join() {
                Err(_) => HandleError::ThreadPanic,
                Ok(()) => HandleError::ChannelClosed,
            });
        }
    };

    tracing::debug!("[spawn_worker] {} is ready", name);

    Ok(WorkerHandle {
        name,
        cmd_tx,
        shutdown_tx,
        shut_down,
        terminator,
        thread_handle: Mutex::new(Some(thread_handle)),
    })
}

async fn run_worker(
    mut worker: Worker,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let name = worker.name().to_string();
    loop {
        if *shutdown_rx.borrow() {
            tracing::debug!("[run_worker:{}] Shutdown signal received", name);
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("[run_worker:{}] Received shutdown signal", name);
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("[run_worker:{}] Command channel closed", name);
                    break;
                };
                tracing::trace!("[run_worker:{}] {}", name, cmd.label());
                cmd.run(&mut worker);
            }
        }
    }
}

impl WorkerHandle {
    async fn send_command<F>(&self, make_cmd: F) -> Result<(), HandleError>
    where
        F: FnOnce(Reply) -> WorkerCommand,
    {
        if self.is_shut_down() {
            return Err(HandleError::ShutDown);
        }

        let (reply_tx, reply_rx) = oneshot::channel::<Result<(), ScriptError>>();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| HandleError::ChannelClosed)?;

        reply_rx
            .await
            .map_err(|_| HandleError::ChannelClosed)?
            .map_err(HandleError::Script)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs a classic script on the worker.
    pub async fn load(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), HandleError> {
        let (name, source) = (name.into(), source.into());
        self.send_command(|reply| WorkerCommand::Load {
            name,
            source,
            reply,
        })
        .await
    }

    /// Loads an ES module; `resolver` runs on the worker thread.
    pub async fn load_module<R>(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
        resolver: R,
    ) -> Result<(), HandleError>
    where
        R: FnMut(&mut Worker, &str, &str) -> i32 + Send + 'static,
    {
        let (name, source) = (name.into(), source.into());
        self.send_command(|reply| WorkerCommand::LoadModule {
            name,
            source,
            resolver: Box::new(resolver),
            reply,
        })
        .await
    }

    pub async fn send_bytes(&self, payload: impl Into<Vec<u8>>) -> Result<(), HandleError> {
        let payload = payload.into();
        self.send_command(|reply| WorkerCommand::SendBytes { payload, reply })
            .await
    }

    pub async fn register_builtin(
        &self,
        specifier: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), HandleError> {
        let (specifier, source) = (specifier.into(), source.into());
        self.send_command(|reply| WorkerCommand::RegisterBuiltin {
            specifier,
            source,
            reply,
        })
        .await
    }

    /// Interrupts whatever the worker is executing right now.
    pub fn terminate_execution(&self) -> bool {
        self.terminator.terminate_execution()
    }

    pub fn terminator(&self) -> TerminationHandle {
        self.terminator.clone()
    }

    pub fn is_executing(&self) -> bool {
        self.terminator.is_executing()
    }

    /// Stops the worker thread, interrupting a running script.
    ///
    /// Commands already queued are dropped and their callers see
    /// [`HandleError::ChannelClosed`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("[WorkerHandle::shutdown] {}", self.name);
        let _ = self.shutdown_tx.send(true);
        self.terminator.terminate_execution();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Waits for the worker thread to exit. Call [`shutdown`](Self::shutdown) first.
    pub fn join(self) -> Result<(), HandleError> {
        if let Some(handle) = self.thread_handle.lock().take() {
            handle.join().map_err(|_| HandleError::ThreadPanic)?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::modules::RESOLVED;

    fn counting() -> (Arc<AtomicUsize>, impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        let total = Arc::new(AtomicUsize::new(0));
        let sink = total.clone();
        (total, move |msg: &[u8]| {
            sink.fetch_add(msg.len(), Ordering::SeqCst);
            None
        })
    }

    #[tokio::test]
    async fn test_load_and_send() {
        let (total, callback) = counting();
        let handle = spawn_worker(WorkerConfig::default().with_name("spawned"), callback).unwrap();
        assert_eq!(handle.name(), "spawned");

        handle
            .load("send.js", "JsWorker.send(new ArrayBuffer(7));")
            .await
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_recv_roundtrip() {
        let (total, callback) = counting();
        let handle = spawn_worker(WorkerConfig::default(), callback).unwrap();
        handle
            .load("echo.js", "JsWorker.recv((msg) => JsWorker.send(msg));")
            .await
            .unwrap();
        handle.send_bytes(b"hello".to_vec()).await.unwrap();
        handle.send_bytes(vec![1, 2, 3]).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_script_error_is_reported() {
        let handle = spawn_worker(WorkerConfig::default(), |_: &[u8]| None).unwrap();
        let err = handle.load("bad.js", "throw new Error('bad');").await.unwrap_err();
        match err {
            HandleError::Script(e) => {
                assert_eq!(e.script(), "bad.js");
                assert!(e.to_string().contains("bad"));
            }
            other => panic!("unexpected error: {}", other),
        }
        handle.load("good.js", "var ok = 1;").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_module_with_resolver() {
        let (total, callback) = counting();
        let handle = spawn_worker(WorkerConfig::default(), callback).unwrap();
        handle
            .load_module(
                "main.js",
                r#"
                import { size } from "dep.js";
                import { send } from "core:worker.js";
                send(new ArrayBuffer(size));
                "#,
                |worker: &mut Worker, specifier: &str, _: &str| {
                    worker
                        .load_module(specifier, "export const size = 6;", |_, _, _| 1)
                        .map_or(1, |_| RESOLVED)
                },
            )
            .await
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_terminate_running_script() {
        let handle = spawn_worker(WorkerConfig::default(), |_: &[u8]| None).unwrap();
        let terminator = handle.terminator();
        let killer = thread::spawn(move || {
            while !terminator.is_executing() {
                thread::sleep(Duration::from_millis(5));
            }
            thread::sleep(Duration::from_millis(50));
            terminator.terminate_execution()
        });

        let err = handle.load("spin.js", "while (true) {}").await.unwrap_err();
        assert!(killer.join().unwrap());
        assert!(matches!(err, HandleError::Script(ref e) if e.is_terminated()));
        assert!(!handle.is_executing());
        assert!(!handle.terminate_execution());

        handle.load("after.js", "var x = 1;").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown() {
        let handle = spawn_worker(WorkerConfig::default(), |_: &[u8]| None).unwrap();
        handle.load("a.js", "var a = 1;").await.unwrap();
        handle.shutdown();
        assert!(handle.is_shut_down());
        assert!(matches!(
            handle.load("b.js", "var b = 1;").await,
            Err(HandleError::ShutDown)
        ));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_register_builtin() {
        let handle = spawn_worker(WorkerConfig::default(), |_: &[u8]| None).unwrap();
        handle
            .register_builtin("core:greeting.js", "export const greeting = 'hi';")
            .await
            .unwrap();
        handle
            .load_module(
                "main.js",
                "import { greeting } from 'core:greeting.js'; if (greeting !== 'hi') throw 1;",
                |_: &mut Worker, _: &str, _: &str| 1,
            )
            .await
            .unwrap();
        assert!(handle.register_builtin("plain.js", "").await.is_err());
    }

    #[test]
    fn test_invalid_config_fails_to_spawn() {
        let config = WorkerConfig {
            global_name: "not an identifier".to_string(),
            ..WorkerConfig::default()
        };
        let err = spawn_worker(config, |_: &[u8]| None).err().unwrap();
        assert!(matches!(err, HandleError::Script(ScriptError::Engine { .. })));
    }

    #[test]
    fn test_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WorkerHandle>();
    }
}
