//! Process-wide engine configuration.
//!
//! Engine flags are one-time initialization state. They can be adjusted with
//! [`set_flags`] until the first [`Worker`](crate::Worker) is created; from then
//! on they are frozen and every worker in the process sees the same values.

use std::ffi::CStr;

use parking_lot::Mutex;

/// Default bound on nested `load`/`load_module`/`send_bytes` frames.
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 32;

/// Engine-level settings shared by every worker in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFlags {
    /// Heap limit in bytes for each runtime. `None` leaves the engine default.
    pub memory_limit: Option<usize>,
    /// Native stack budget in bytes for each runtime.
    pub max_stack_size: Option<usize>,
    /// Allocation threshold in bytes that triggers a GC cycle.
    pub gc_threshold: Option<usize>,
    /// Deepest allowed nesting of reentrant worker calls.
    pub max_nesting_depth: usize,
    /// Evaluate classic scripts in strict mode.
    pub strict: bool,
    /// Log module resolution at debug level instead of trace.
    pub trace_modules: bool,
}

impl EngineFlags {
    const DEFAULT: EngineFlags = EngineFlags {
        memory_limit: None,
        max_stack_size: None,
        gc_threshold: None,
        max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        strict: false,
        trace_modules: false,
    };

    fn apply(&mut self, setting: &Setting) {
        match *setting {
            Setting::MemoryLimit(v) => self.memory_limit = Some(v),
            Setting::MaxStackSize(v) => self.max_stack_size = Some(v),
            Setting::GcThreshold(v) => self.gc_threshold = Some(v),
            Setting::MaxNestingDepth(v) => self.max_nesting_depth = v,
            Setting::Strict(v) => self.strict = v,
            Setting::TraceModules(v) => self.trace_modules = v,
        }
    }
}

impl Default for EngineFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

struct FlagState {
    flags: EngineFlags,
    frozen: bool,
}

static FLAGS: Mutex<FlagState> = parking_lot::const_mutex(FlagState {
    flags: EngineFlags::DEFAULT,
    frozen: false,
});

// ─────────────────────────────────────────────────────────────────────────────
// Flag parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Value,
    Switch,
}

const KNOWN_FLAGS: &[(&str, Kind)] = &[
    ("memory-limit", Kind::Value),
    ("max-stack-size", Kind::Value),
    ("gc-threshold", Kind::Value),
    ("max-nesting-depth", Kind::Value),
    ("strict", Kind::Switch),
    ("trace-modules", Kind::Switch),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Setting {
    MemoryLimit(usize),
    MaxStackSize(usize),
    GcThreshold(usize),
    MaxNestingDepth(usize),
    Strict(bool),
    TraceModules(bool),
}

fn lookup(name: &str) -> Option<Kind> {
    KNOWN_FLAGS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, kind)| *kind)
}

fn value_setting(name: &str, raw: &str) -> Option<Setting> {
    let value: usize = match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!("[set_flags] Ignoring --{} with invalid value {:?}", name, raw);
            return None;
        }
    };
    match name {
        "memory-limit" => Some(Setting::MemoryLimit(value)),
        "max-stack-size" => Some(Setting::MaxStackSize(value)),
        "gc-threshold" => Some(Setting::GcThreshold(value)),
        "max-nesting-depth" if value > 0 => Some(Setting::MaxNestingDepth(value)),
        _ => {
            tracing::warn!("[set_flags] Ignoring --{}={}", name, value);
            None
        }
    }
}

fn switch_setting(name: &str, on: bool) -> Setting {
    match name {
        "strict" => Setting::Strict(on),
        _ => Setting::TraceModules(on),
    }
}

/// Splits `args` into recognized engine settings and the untouched remainder.
///
/// Recognized forms are `--name=value`, `--name value`, `--name` and
/// `--no-name` (the last two for switches). Underscores in names are treated as
/// dashes. Everything after a bare `--` is left alone.
fn parse_flags<I>(args: I) -> (Vec<Setting>, Vec<String>)
where
    I: IntoIterator<Item = String>,
{
    let mut settings = Vec::new();
    let mut rest = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--" {
            rest.push(arg);
            rest.extend(args.by_ref());
            break;
        }
        let Some(body) = arg.strip_prefix("--") else {
            rest.push(arg);
            continue;
        };
        let (name, inline) = match body.split_once('=') {
            Some((name, value)) => (name.replace('_', "-"), Some(value.to_string())),
            None => (body.replace('_', "-"), None),
        };

        match (lookup(&name), inline) {
            (Some(Kind::Value), Some(value)) => settings.extend(value_setting(&name, &value)),
            (Some(Kind::Value), None) => match args.next() {
                Some(value) => settings.extend(value_setting(&name, &value)),
                None => tracing::warn!("[set_flags] --{} expects a value", name),
            },
            (Some(Kind::Switch), None) => settings.push(switch_setting(&name, true)),
            (Some(Kind::Switch), Some(value)) => match value.as_str() {
                "true" | "1" => settings.push(switch_setting(&name, true)),
                "false" | "0" => settings.push(switch_setting(&name, false)),
                _ => tracing::warn!("[set_flags] Ignoring --{}={}", name, value),
            },
            (None, inline) => {
                let negated = name
                    .strip_prefix("no-")
                    .filter(|n| lookup(n) == Some(Kind::Switch));
                match (negated, inline) {
                    (Some(n), None) => settings.push(switch_setting(n, false)),
                    _ => rest.push(arg),
                }
            }
        }
    }

    (settings, rest)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Strips every recognized engine flag from `args` and returns the rest, in order.
///
/// Recognized flags update the process-wide [`EngineFlags`] unless a worker has
/// already been created, in which case they are stripped but ignored.
pub fn set_flags<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let (settings, rest) = parse_flags(args.into_iter().map(Into::into));
    if settings.is_empty() {
        return rest;
    }

    let mut state = FLAGS.lock();
    if state.frozen {
        tracing::warn!(
            "[set_flags] Engine flags are frozen after the first worker; ignoring {:?}",
            settings
        );
    } else {
        for setting in &settings {
            state.flags.apply(setting);
        }
        tracing::debug!("[set_flags] Engine flags now {:?}", state.flags);
    }
    rest
}

/// Current engine flags.
pub fn flags() -> EngineFlags {
    FLAGS.lock().flags.clone()
}

/// Whether a worker has been created and the flags can no longer change.
pub fn flags_frozen() -> bool {
    FLAGS.lock().frozen
}

/// Freezes the engine flags and returns the values every worker will use.
pub(crate) fn freeze() -> EngineFlags {
    let mut state = FLAGS.lock();
    if !state.frozen {
        state.frozen = true;
        tracing::debug!("[engine] Flags frozen: {:?}", state.flags);
    }
    state.flags.clone()
}

/// Version string of the embedded engine.
pub fn version() -> String {
    // SAFETY: JS_GetVersion returns a pointer to a static NUL-terminated string.
    let raw = unsafe { CStr::from_ptr(rquickjs::qjs::JS_GetVersion()) };
    format!("QuickJS-ng {}", raw.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_version() {
        let v = version();
        assert!(v.starts_with("QuickJS-ng "));
        assert!(v.len() > "QuickJS-ng ".len());
    }

    #[test]
    fn test_set_flags_strips_known_flag() {
        let rest = set_flags(["hello", "--trace-modules", "foobar"]);
        assert_eq!(rest, vec!["hello", "foobar"]);
    }

    #[test]
    fn test_parse_value_forms() {
        let (settings, rest) = parse_flags(strings(&[
            "--memory-limit=1024",
            "a",
            "--max_stack_size",
            "2048",
            "b",
        ]));
        assert_eq!(
            settings,
            vec![Setting::MemoryLimit(1024), Setting::MaxStackSize(2048)]
        );
        assert_eq!(rest, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_switches() {
        let (settings, rest) =
            parse_flags(strings(&["--strict", "--no-trace-modules", "--no-such-thing"]));
        assert_eq!(
            settings,
            vec![Setting::Strict(true), Setting::TraceModules(false)]
        );
        assert_eq!(rest, vec!["--no-such-thing"]);
    }

    #[test]
    fn test_parse_preserves_unknown_and_order() {
        let (settings, rest) = parse_flags(strings(&["x", "--lazy", "-v", "y", "--gc-threshold=0x"]));
        assert!(settings.is_empty());
        assert_eq!(rest, vec!["x", "--lazy", "-v", "y"]);
    }

    #[test]
    fn test_parse_stops_at_double_dash() {
        let (settings, rest) = parse_flags(strings(&["--strict", "--", "--strict"]));
        assert_eq!(settings, vec![Setting::Strict(true)]);
        assert_eq!(rest, vec!["--", "--strict"]);
    }

    #[test]
    fn test_zero_nesting_depth_rejected() {
        let (settings, rest) = parse_flags(strings(&["--max-nesting-depth=0"]));
        assert!(settings.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_apply() {
        let mut flags = EngineFlags::default();
        flags.apply(&Setting::MaxNestingDepth(4));
        flags.apply(&Setting::Strict(true));
        assert_eq!(flags.max_nesting_depth, 4);
        assert!(flags.strict);
        assert_eq!(flags.memory_limit, None);
    }
}
