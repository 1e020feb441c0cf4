//! Turns engine exceptions into attributed [`Diagnostic`]s.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rquickjs::{CaughtError, Coerced};

use crate::channel::format_value;
use crate::error::{Diagnostic, Location};

/// Number of source texts a worker keeps for rendering source lines.
pub(crate) const RETAINED_SOURCES: usize = 64;

/// Source text of the scripts and modules a worker loaded most recently, by name.
///
/// Only used to quote the offending line in diagnostics. Once more than
/// [`RETAINED_SOURCES`] names have been loaded the oldest text is dropped and
/// its diagnostics go without a source line.
#[derive(Debug, Default)]
pub(crate) struct Sources {
    texts: HashMap<String, Rc<str>>,
    order: VecDeque<String>,
}

impl Sources {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `text` under `name`, replacing and refreshing an earlier entry.
    pub(crate) fn insert(&mut self, name: String, text: Rc<str>) {
        if self.texts.insert(name.clone(), text).is_some() {
            self.order.retain(|n| n != &name);
        }
        self.order.push_back(name);
        while self.order.len() > RETAINED_SOURCES {
            if let Some(oldest) = self.order.pop_front() {
                self.texts.remove(&oldest);
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Rc<str>> {
        self.texts.get(name)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.texts.len()
    }
}

/// A caught exception and, for parser errors, the source they point into.
pub(crate) struct Captured {
    pub diagnostic: Diagnostic,
    /// File of the parser frame when the exception is a `SyntaxError` raised
    /// by the compiler. `eval` and `JSON.parse` report their own input here,
    /// not the script that called them.
    pub syntax_error_in: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct Frame {
    file: String,
    line: u32,
    column: u32,
    /// Parser frames carry no function name: `at file:line:col`.
    bare: bool,
}

fn parse_frame(text: &str) -> Option<Frame> {
    let rest = text.trim().strip_prefix("at ")?;
    let (location, bare) = match rest.rfind(" (") {
        Some(i) if rest.ends_with(')') => (&rest[i + 2..rest.len() - 1], false),
        _ => (rest, true),
    };
    let mut parts = location.rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    let file = parts.next()?.to_string();
    Some(Frame {
        file,
        line,
        column,
        bare,
    })
}

fn first_frame(stack: &str) -> Option<Frame> {
    stack.lines().find_map(parse_frame)
}

fn source_line(sources: &Sources, frame: &Frame) -> Option<String> {
    let source = sources.get(&frame.file)?;
    let index = (frame.line as usize).checked_sub(1)?;
    source.lines().nth(index).map(|l| l.trim_end().to_string())
}

/// Builds a diagnostic for `caught`, attributed to `script`.
pub(crate) fn capture(caught: CaughtError<'_>, script: &str, sources: &Sources) -> Captured {
    match caught {
        CaughtError::Exception(ex) => {
            let kind = ex
                .get::<_, Coerced<String>>("name")
                .map(|name| name.0)
                .unwrap_or_else(|_| "Error".to_string());
            let message = ex.message().unwrap_or_default();
            let frame = ex.stack().as_deref().and_then(first_frame);
            let syntax_error_in = frame
                .as_ref()
                .filter(|f| kind == "SyntaxError" && f.bare)
                .map(|f| f.file.clone());
            let source_line = frame.as_ref().and_then(|f| source_line(sources, f));
            let location = frame.map(|f| Location {
                file: f.file,
                line: f.line,
                column: f.column,
            });

            Captured {
                diagnostic: Diagnostic {
                    script: script.to_string(),
                    kind,
                    message,
                    location,
                    source_line,
                },
                syntax_error_in,
            }
        }
        CaughtError::Value(value) => {
            let message = format_value(value.ctx(), &value)
                .unwrap_or_else(|_| value.type_name().to_string());
            Captured {
                diagnostic: Diagnostic {
                    script: script.to_string(),
                    kind: "Uncaught".to_string(),
                    message,
                    location: None,
                    source_line: None,
                },
                syntax_error_in: None,
            }
        }
        CaughtError::Error(err) => Captured {
            diagnostic: Diagnostic {
                script: script.to_string(),
                kind: "Error".to_string(),
                message: err.to_string(),
                location: None,
                source_line: None,
            },
            syntax_error_in: None,
        },
    }
}
