//! Module resolution for workers.
//!
//! The engine asks the installed [`WorkerResolver`] to normalize each import
//! and the [`WorkerLoader`] to produce any module it has not registered yet.
//! Privileged specifiers are served from the built-in table right there.
//! Everything else is recorded as pending and fails the current declaration;
//! the worker then calls the host resolver with the engine unlocked (so it
//! may reenter `load_module`) and retries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Error, Module};

use crate::error::ScriptError;
use crate::ops::WorkerModule;

/// Host resolver callback: `(worker, specifier, referrer) -> status`.
///
/// Return [`RESOLVED`] after registering `specifier` (normally with a nested
/// `load_module` call); any other value aborts the load.
pub type ResolveFn<'a> = dyn FnMut(&mut crate::Worker, &str, &str) -> i32 + 'a;

/// Status a resolver returns once the specifier is registered.
pub const RESOLVED: i32 = 0;

pub(crate) enum Builtin {
    Native,
    Source(Rc<str>),
}

/// Why the last declaration stopped at an import.
#[derive(Debug)]
pub(crate) enum Pending {
    /// The host resolver has to provide this specifier.
    Unresolved { specifier: String, referrer: String },
    /// The import can never succeed.
    Failed(ScriptError),
}

pub(crate) struct ModuleState {
    prefix: String,
    builtins: HashMap<String, Builtin>,
    /// Module that most recently imported each specifier.
    referrers: HashMap<String, String>,
    pending: Option<Pending>,
    trace: bool,
}

impl ModuleState {
    pub(crate) fn new(prefix: &str, trace: bool) -> Self {
        let mut builtins = HashMap::new();
        builtins.insert(format!("{}{}", prefix, crate::ops::WORKER_MODULE), Builtin::Native);
        Self {
            prefix: prefix.to_string(),
            builtins,
            referrers: HashMap::new(),
            pending: None,
            trace,
        }
    }

    pub(crate) fn is_privileged(&self, specifier: &str) -> bool {
        specifier.starts_with(&self.prefix)
    }

    pub(crate) fn register_builtin(&mut self, specifier: String, source: Rc<str>) {
        self.builtins.insert(specifier, Builtin::Source(source));
    }

    pub(crate) fn builtin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtins.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn take_pending(&mut self) -> Option<Pending> {
        self.pending.take()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = None;
    }

    fn log(&self, message: std::fmt::Arguments<'_>) {
        if self.trace {
            tracing::debug!("[modules] {}", message);
        } else {
            tracing::trace!("[modules] {}", message);
        }
    }
}

pub(crate) type SharedState = Rc<RefCell<ModuleState>>;

/// Specifiers are opaque: they resolve to themselves.
pub(crate) struct WorkerResolver {
    pub state: SharedState,
}

impl Resolver for WorkerResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let mut state = self.state.borrow_mut();
        state.log(format_args!("resolve {:?} from {:?}", name, base));
        state.referrers.insert(name.to_string(), base.to_string());
        Ok(name.to_string())
    }
}

pub(crate) struct WorkerLoader {
    pub state: SharedState,
}

enum Lookup {
    Native,
    Source(Rc<str>),
    Missing,
    Host,
}

impl Loader for WorkerLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let (lookup, referrer) = {
            let state = self.state.borrow();
            let lookup = match state.builtins.get(name) {
                Some(Builtin::Native) => Lookup::Native,
                Some(Builtin::Source(src)) => Lookup::Source(src.clone()),
                None if state.is_privileged(name) => Lookup::Missing,
                None => Lookup::Host,
            };
            let referrer = state.referrers.get(name).cloned().unwrap_or_default();
            (lookup, referrer)
        };

        match lookup {
            Lookup::Native => {
                self.state.borrow().log(format_args!("load built-in {:?}", name));
                Module::declare_def::<WorkerModule, _>(ctx.clone(), name)
            }
            // The state borrow is released: declaring may load further imports.
            Lookup::Source(source) => {
                self.state.borrow().log(format_args!("load built-in source {:?}", name));
                Module::declare(ctx.clone(), name, source.as_bytes())
            }
            Lookup::Missing => {
                let reason = "no such built-in module";
                self.state.borrow_mut().pending = Some(Pending::Failed(ScriptError::Resolution {
                    specifier: name.to_string(),
                    referrer,
                    reason: reason.to_string(),
                }));
                Err(Error::new_loading_message(name, reason))
            }
            Lookup::Host => {
                let mut state = self.state.borrow_mut();
                state.log(format_args!("defer {:?} to the host resolver", name));
                state.pending = Some(Pending::Unresolved {
                    specifier: name.to_string(),
                    referrer,
                });
                Err(Error::new_loading_message(name, "not registered"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{CatchResultExt, Context, Runtime};

    fn runtime_with_loader(state: &SharedState) -> Runtime {
        let rt = Runtime::new().unwrap();
        rt.set_loader(
            WorkerResolver {
                state: state.clone(),
            },
            WorkerLoader {
                state: state.clone(),
            },
        );
        rt
    }

    #[test]
    fn test_privileged_prefix() {
        let state = ModuleState::new("core:", false);
        assert!(state.is_privileged("core:worker.js"));
        assert!(!state.is_privileged("worker.js"));
        assert_eq!(state.builtin_names(), vec!["core:worker.js".to_string()]);
    }

    #[test]
    fn test_unregistered_import_is_pending() {
        let state: SharedState = Rc::new(RefCell::new(ModuleState::new("core:", false)));
        let rt = runtime_with_loader(&state);
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let result = Module::declare(ctx.clone(), "main.js", "import { x } from 'dep.js';");
            assert!(result.catch(&ctx).is_err());
        });
        match state.borrow_mut().take_pending() {
            Some(Pending::Unresolved {
                specifier,
                referrer,
            }) => {
                assert_eq!(specifier, "dep.js");
                assert_eq!(referrer, "main.js");
            }
            other => panic!("unexpected pending state: {:?}", other),
        }
    }

    #[test]
    fn test_missing_builtin_fails() {
        let state: SharedState = Rc::new(RefCell::new(ModuleState::new("core:", false)));
        let rt = runtime_with_loader(&state);
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let result = Module::declare(
                ctx.clone(),
                "main.js",
                "import { x } from 'core:internal.js';",
            );
            assert!(result.catch(&ctx).is_err());
        });
        match state.borrow_mut().take_pending() {
            Some(Pending::Failed(err)) => assert!(err.to_string().contains("core:internal.js")),
            other => panic!("unexpected pending state: {:?}", other),
        }
    }

    #[test]
    fn test_registered_source_builtin_loads() {
        let state: SharedState = Rc::new(RefCell::new(ModuleState::new("core:", false)));
        state
            .borrow_mut()
            .register_builtin("core:answer.js".to_string(), Rc::from("export const answer = 42;"));
        let rt = runtime_with_loader(&state);
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let module = Module::declare(
                ctx.clone(),
                "main.js",
                "import { answer } from 'core:answer.js'; globalThis.answer = answer;",
            )
            .unwrap();
            let (_module, promise) = module.eval().unwrap();
            promise.finish::<()>().unwrap();
            let answer: i32 = ctx.globals().get("answer").unwrap();
            assert_eq!(answer, 42);
        });
        assert!(state.borrow_mut().take_pending().is_none());
    }
}
