//! The [`Worker`]: one engine runtime with its message channel, module graph
//! and termination control.
//!
//! All calls are synchronous and run on the caller's thread. Reentrancy (a
//! resolver calling `load_module` on the same worker) is tracked with an
//! explicit frame stack bounded by `max_nesting_depth`; the engine lock is
//! never held while host code runs.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use rquickjs::context::EvalOptions;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Module, Promise, Runtime};

use crate::channel::{Channel, Realm};
use crate::config::WorkerConfig;
use crate::engine;
use crate::error::ScriptError;
use crate::exception::{capture, Sources};
use crate::handle::TerminationHandle;
use crate::modules::{
    ModuleState, Pending, ResolveFn, SharedState, WorkerLoader, WorkerResolver, RESOLVED,
};
use crate::ops::{install_global, Bridge};

/// One isolated script-execution instance.
pub struct Worker {
    config: WorkerConfig,
    script_ctx: Context,
    module_ctx: Context,
    runtime: Runtime,
    channel: Rc<Channel>,
    modules: SharedState,
    sources: Sources,
    terminator: TerminationHandle,
    /// Scripts of the calls currently on the stack, outermost first.
    stack: Vec<String>,
    current_script: Option<String>,
    /// Failure of the last nested call, reported with the resolver status.
    nested_error: Option<ScriptError>,
}

enum Step {
    Done,
    NeedsResolution { specifier: String, referrer: String },
}

fn engine_error(script: &str, err: impl std::fmt::Display) -> ScriptError {
    ScriptError::Engine {
        script: script.to_string(),
        message: err.to_string(),
    }
}

/// What the engine was doing when an exception escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Compiling the named classic script, then running it.
    Script,
    /// Declaring a module graph. No guest code runs here.
    Declare,
    /// Running code that already compiled.
    Run,
}

fn script_error(
    caught: CaughtError<'_>,
    script: &str,
    sources: &Sources,
    phase: Phase,
) -> ScriptError {
    let captured = capture(caught, script, sources);
    // Code the script compiles at run time (`eval`, `JSON.parse`) reports
    // its own input as the parser frame.
    let compile = match (phase, captured.syntax_error_in.as_deref()) {
        (Phase::Declare, Some(_)) => true,
        (Phase::Script, Some(file)) => file == script,
        _ => false,
    };
    if compile {
        ScriptError::Compile(captured.diagnostic)
    } else {
        ScriptError::Runtime(captured.diagnostic)
    }
}

/// Runs queued promise jobs until the queue is empty or termination is requested.
fn drain_jobs(ctx: &Ctx<'_>, terminator: &TerminationHandle) {
    while !terminator.is_requested() && ctx.execute_pending_job() {}
    // A job aborted by an interrupt leaves its exception behind.
    let _ = ctx.catch();
}

/// Drives the job queue until `promise` settles.
fn settle<'js>(
    ctx: &Ctx<'js>,
    promise: &Promise<'js>,
    terminator: &TerminationHandle,
) -> rquickjs::Result<()> {
    loop {
        if let Some(result) = promise.result::<()>() {
            return result;
        }
        if terminator.is_requested() || !ctx.execute_pending_job() {
            return Err(rquickjs::Error::WouldBlock);
        }
    }
}

impl Worker {
    /// Creates a worker with the default configuration.
    ///
    /// `callback` receives every payload the guest passes to `send`; its return
    /// value becomes the result of that `send` call.
    pub fn new<F>(callback: F) -> Result<Self, ScriptError>
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
    {
        let flags = engine::freeze();
        Self::with_config(WorkerConfig::from_flags(&flags), callback)
    }

    /// Creates a worker from `config`, which is validated first.
    ///
    /// `callback` is bound exactly as in [`Worker::new`].
    pub fn with_config<F>(config: WorkerConfig, callback: F) -> Result<Self, ScriptError>
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
    {
        let flags = engine::freeze();
        let name = config.name.clone();
        config.validate().map_err(|e| engine_error(&name, e))?;
        tracing::debug!("[Worker::new:{}] Creating runtime", name);

        let runtime = Runtime::new().map_err(|e| engine_error(&name, e))?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let terminator = TerminationHandle::new();
        runtime.set_interrupt_handler(Some(terminator.interrupt_handler()));

        let modules: SharedState = Rc::new(RefCell::new(ModuleState::new(
            &config.privileged_prefix,
            flags.trace_modules,
        )));
        runtime.set_loader(
            WorkerResolver {
                state: modules.clone(),
            },
            WorkerLoader {
                state: modules.clone(),
            },
        );

        let script_ctx = Context::full(&runtime).map_err(|e| engine_error(&name, e))?;
        let module_ctx = Context::full(&runtime).map_err(|e| engine_error(&name, e))?;

        let channel = Rc::new(Channel::new(Box::new(callback)));
        script_ctx
            .with(|ctx| -> rquickjs::Result<()> {
                install_global(&ctx, channel.clone(), &config.global_name)?;
                ctx.store_userdata(Bridge {
                    channel: channel.clone(),
                })
                .map_err(|_| rquickjs::Error::Unknown)?;
                Ok(())
            })
            .map_err(|e| engine_error(&name, e))?;

        Ok(Self {
            config,
            script_ctx,
            module_ctx,
            runtime,
            channel,
            modules,
            sources: Sources::new(),
            terminator,
            stack: Vec::new(),
            current_script: None,
            nested_error: None,
        })
    }

    /// Worker name from the config, used in log lines.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Settings this worker was created with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the script errors from `send_bytes` are attributed to.
    pub fn current_script(&self) -> Option<&str> {
        self.current_script.as_deref()
    }

    pub fn is_executing(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Number of worker calls currently on the stack.
    pub fn nesting_depth(&self) -> usize {
        self.stack.len()
    }

    /// Handle for terminating this worker's execution from another thread.
    pub fn terminator(&self) -> TerminationHandle {
        self.terminator.clone()
    }

    /// Interrupts the running script. A no-op when nothing is executing.
    pub fn terminate_execution(&self) -> bool {
        self.terminator.terminate_execution()
    }

    /// Specifiers served from the built-in module table.
    pub fn builtin_modules(&self) -> Vec<String> {
        self.modules.borrow().builtin_names()
    }

    /// Adds a source module to the built-in table.
    ///
    /// The specifier must carry the privileged prefix. Built-in modules are
    /// loaded without consulting the resolver passed to [`Worker::load_module`].
    pub fn register_builtin(&mut self, specifier: &str, source: &str) -> Result<(), ScriptError> {
        let mut modules = self.modules.borrow_mut();
        if !modules.is_privileged(specifier) {
            return Err(ScriptError::Resolution {
                specifier: specifier.to_string(),
                referrer: self.config.name.clone(),
                reason: format!(
                    "built-in modules must start with {:?}",
                    self.config.privileged_prefix
                ),
            });
        }
        let source: Rc<str> = Rc::from(source);
        self.sources.insert(specifier.to_string(), source.clone());
        modules.register_builtin(specifier.to_string(), source);
        tracing::debug!("[register_builtin:{}] {}", self.config.name, specifier);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Call frames
    // ─────────────────────────────────────────────────────────────────────────

    fn framed<T, F>(&mut self, script: &str, f: F) -> Result<T, ScriptError>
    where
        F: FnOnce(&mut Self) -> Result<T, ScriptError>,
    {
        let limit = self.config.max_nesting_depth;
        if self.stack.len() >= limit {
            let err = ScriptError::NestingTooDeep {
                script: script.to_string(),
                depth: self.stack.len() + 1,
                limit,
            };
            self.nested_error = Some(err.clone());
            return Err(err);
        }

        self.stack.push(script.to_string());
        self.current_script = Some(script.to_string());
        let guard = self.terminator.enter();

        let result = f(self);

        self.stack.pop();
        self.current_script = Some(script.to_string());
        let result = result.map_err(|err| {
            if self.terminator.is_requested() && !err.is_terminated() {
                ScriptError::Terminated {
                    script: script.to_string(),
                }
            } else {
                err
            }
        });
        drop(guard);

        if let Err(err) = &result {
            if self.stack.is_empty() {
                tracing::debug!("[{}] {}", script, err);
            } else {
                self.nested_error = Some(err.clone());
            }
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scripts
    // ─────────────────────────────────────────────────────────────────────────

    /// Compiles and runs a classic script under diagnostic name `name`.
    pub fn load(&mut self, name: &str, source: &str) -> Result<(), ScriptError> {
        tracing::debug!("[load:{}] Evaluating {} bytes", name, source.len());
        self.sources.insert(name.to_string(), Rc::from(source));
        self.framed(name, |worker| worker.eval_script(name, source))
    }

    fn eval_script(&self, name: &str, source: &str) -> Result<(), ScriptError> {
        let strict = self.config.strict;
        self.script_ctx.with(|ctx| {
            let mut options = EvalOptions::default();
            options.global = true;
            options.strict = strict;
            options.filename = Some(name.to_string());

            let result = ctx
                .eval_with_options::<(), _>(source, options)
                .catch(&ctx)
                .map_err(|caught| script_error(caught, name, &self.sources, Phase::Script));
            drain_jobs(&ctx, &self.terminator);
            result
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Modules
    // ─────────────────────────────────────────────────────────────────────────

    /// Loads and evaluates an ES module named `name`.
    ///
    /// Imports the worker has not registered yet are handed to `resolve`
    /// together with the importing module's name. The resolver registers them
    /// (usually with a nested `load_module`) and returns [`RESOLVED`]; anything
    /// else aborts the load before the module runs. Privileged specifiers
    /// never reach the resolver.
    pub fn load_module<F>(&mut self, name: &str, source: &str, mut resolve: F) -> Result<(), ScriptError>
    where
        F: FnMut(&mut Worker, &str, &str) -> i32,
    {
        self.load_module_dyn(name, source, &mut resolve)
    }

    fn load_module_dyn(
        &mut self,
        name: &str,
        source: &str,
        resolve: &mut ResolveFn<'_>,
    ) -> Result<(), ScriptError> {
        tracing::debug!("[load_module:{}] Declaring {} bytes", name, source.len());
        self.sources.insert(name.to_string(), Rc::from(source));

        self.framed(name, |worker| {
            let mut attempted = HashSet::new();
            loop {
                let (specifier, referrer) = match worker.declare_and_eval(name, source)? {
                    Step::Done => return Ok(()),
                    Step::NeedsResolution {
                        specifier,
                        referrer,
                    } => (specifier, referrer),
                };

                if !attempted.insert(specifier.clone()) {
                    return Err(ScriptError::Resolution {
                        specifier,
                        referrer,
                        reason: "resolver reported success without registering the module"
                            .to_string(),
                    });
                }

                tracing::debug!(
                    "[load_module:{}] Resolving {:?} from {:?}",
                    name,
                    specifier,
                    referrer
                );
                worker.nested_error = None;
                let status = resolve(worker, &specifier, &referrer);
                let nested = worker.nested_error.take();
                if status != RESOLVED {
                    let reason = match nested {
                        Some(err) => format!("resolver returned {}: {}", status, err),
                        None => format!("resolver returned {}", status),
                    };
                    return Err(ScriptError::Resolution {
                        specifier,
                        referrer,
                        reason,
                    });
                }
            }
        })
    }

    fn declare_and_eval(&self, name: &str, source: &str) -> Result<Step, ScriptError> {
        self.modules.borrow_mut().clear_pending();

        self.module_ctx.with(|ctx| {
            let module = match Module::declare(ctx.clone(), name, source).catch(&ctx) {
                Ok(module) => module,
                Err(caught) => {
                    // The loader records why an import failed before throwing.
                    let pending = self.modules.borrow_mut().take_pending();
                    return match pending {
                        Some(Pending::Unresolved {
                            specifier,
                            referrer,
                        }) => Ok(Step::NeedsResolution {
                            specifier,
                            referrer,
                        }),
                        Some(Pending::Failed(err)) => Err(err),
                        None => Err(script_error(caught, name, &self.sources, Phase::Declare)),
                    };
                }
            };

            let (_module, promise) = module
                .eval()
                .catch(&ctx)
                .map_err(|caught| script_error(caught, name, &self.sources, Phase::Run))?;

            let result = match settle(&ctx, &promise, &self.terminator).catch(&ctx) {
                Ok(()) => Ok(Step::Done),
                Err(CaughtError::Error(rquickjs::Error::WouldBlock)) => Err(engine_error(
                    name,
                    "module evaluation did not settle",
                )),
                Err(caught) => Err(script_error(caught, name, &self.sources, Phase::Run)),
            };
            drain_jobs(&ctx, &self.terminator);
            result
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Delivers `payload` to the guest's `recv` handler.
    ///
    /// A no-op when the guest has not registered a handler. An exception thrown
    /// by the handler is returned, attributed to the current script.
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<(), ScriptError> {
        let Some(realm) = self.channel.handler_realm() else {
            tracing::debug!(
                "[send_bytes:{}] No recv handler; dropping {} bytes",
                self.config.name,
                payload.len()
            );
            return Ok(());
        };
        let script = self
            .current_script
            .clone()
            .unwrap_or_else(|| self.config.name.clone());
        self.framed(&script, |worker| worker.deliver(realm, &script, payload))
    }

    fn deliver(&self, realm: Realm, script: &str, payload: &[u8]) -> Result<(), ScriptError> {
        let context = match realm {
            Realm::Script => &self.script_ctx,
            Realm::Module => &self.module_ctx,
        };
        context.with(|ctx| {
            let result = self
                .channel
                .deliver(&ctx, payload)
                .catch(&ctx)
                .map(|_| ())
                .map_err(|caught| script_error(caught, script, &self.sources, Phase::Run));
            drain_jobs(&ctx, &self.terminator);
            result
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Persistent handles and userdata must not outlive the runtime.
        self.channel.clear_handler();
        self.script_ctx.with(|ctx| {
            let _ = ctx.remove_userdata::<Bridge>();
        });
        self.runtime.set_interrupt_handler(None);
        tracing::debug!("[Worker::drop:{}] Runtime released", self.config.name);
    }
}
