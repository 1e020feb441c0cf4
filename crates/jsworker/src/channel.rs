//! Byte message channel between host and guest.
//!
//! Guest-to-host traffic goes through `send`, which calls the host's
//! [`RecvCallback`] synchronously and hands its reply back to the guest.
//! Host-to-guest traffic goes through the single handler the guest registered
//! with `recv`.

use std::cell::RefCell;

use rquickjs::{ArrayBuffer, Coerced, Ctx, Exception, Function, Object, Persistent, Value};

/// Host side of the channel: receives every `send` payload and may reply.
pub type RecvCallback = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>;

/// Bytes shown by `print` for a buffer before it is elided.
const PRINT_PREVIEW: usize = 32;

/// Which of the worker's contexts a guest function belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Realm {
    /// Classic scripts, with the privileged global installed.
    Script,
    /// Module graphs, without it.
    Module,
}

struct Handler {
    realm: Realm,
    func: Persistent<Function<'static>>,
}

pub(crate) struct Channel {
    callback: RefCell<RecvCallback>,
    handler: RefCell<Option<Handler>>,
}

impl Channel {
    pub(crate) fn new(callback: RecvCallback) -> Self {
        Self {
            callback: RefCell::new(callback),
            handler: RefCell::new(None),
        }
    }

    /// Guest `send(buffer)`: forwards a copy of the bytes to the host callback.
    pub(crate) fn send<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Value<'js>> {
        let payload = bytes_from_value(ctx, &value)?;
        let reply = {
            let mut callback = self.callback.try_borrow_mut().map_err(|_| {
                Exception::throw_internal(ctx, "send called while the host callback is running")
            })?;
            callback(&payload)
        };

        tracing::trace!(
            "[send] {} bytes out, {} bytes back",
            payload.len(),
            reply.as_ref().map_or(0, Vec::len)
        );

        match reply {
            Some(bytes) => Ok(ArrayBuffer::new_copy(ctx.clone(), bytes)?.into_value()),
            None => Ok(Value::new_undefined(ctx.clone())),
        }
    }

    /// Guest `recv(handler)`: replaces the host-to-guest handler.
    pub(crate) fn set_handler<'js>(
        &self,
        ctx: &Ctx<'js>,
        realm: Realm,
        value: Value<'js>,
    ) -> rquickjs::Result<()> {
        let Some(func) = value.into_function() else {
            return Err(Exception::throw_type(ctx, "recv expects a function"));
        };
        let func = Persistent::save(ctx, func);
        *self.handler.borrow_mut() = Some(Handler { realm, func });
        Ok(())
    }

    /// Realm of the registered handler, if any.
    pub(crate) fn handler_realm(&self) -> Option<Realm> {
        self.handler.borrow().as_ref().map(|h| h.realm)
    }

    /// Calls the registered handler with a fresh buffer holding `payload`.
    ///
    /// Returns `Ok(false)` when no handler is registered.
    pub(crate) fn deliver<'js>(&self, ctx: &Ctx<'js>, payload: &[u8]) -> rquickjs::Result<bool> {
        let func = match self.handler.borrow().as_ref() {
            Some(handler) => handler.func.clone(),
            None => return Ok(false),
        };
        let func = func.restore(ctx)?;
        let buffer = ArrayBuffer::new_copy(ctx.clone(), payload)?;
        func.call::<_, Value>((buffer,))?;
        Ok(true)
    }

    /// Drops the registered handler. Must run before the runtime is freed.
    pub(crate) fn clear_handler(&self) {
        self.handler.borrow_mut().take();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffer helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Probes `obj` as an `ArrayBuffer` without leaving an exception behind.
fn as_array_buffer<'js>(ctx: &Ctx<'js>, obj: &Object<'js>) -> Option<ArrayBuffer<'js>> {
    match ArrayBuffer::from_object(obj.clone()) {
        Some(buffer) => Some(buffer),
        None => {
            // A failed probe throws a TypeError inside the engine.
            let _ = ctx.catch();
            None
        }
    }
}

fn is_view<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<bool> {
    let ctor: Object = ctx.globals().get("ArrayBuffer")?;
    let is_view: Function = ctor.get("isView")?;
    is_view.call((value.clone(),))
}

/// Copies the bytes of a view, honouring its offset and length.
fn view_bytes<'js>(ctx: &Ctx<'js>, view: &Object<'js>) -> rquickjs::Result<Vec<u8>> {
    let buffer: Object = view.get("buffer")?;
    let offset: usize = view.get("byteOffset")?;
    let length: usize = view.get("byteLength")?;
    let bytes = as_array_buffer(ctx, &buffer)
        .and_then(|b| b.as_bytes().map(<[u8]>::to_vec))
        .ok_or_else(|| Exception::throw_type(ctx, "view is backed by a detached buffer"))?;
    bytes
        .get(offset..offset + length)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Exception::throw_range(ctx, "view is out of bounds"))
}

/// Copies the bytes out of an `ArrayBuffer` or any `ArrayBuffer` view.
pub(crate) fn bytes_from_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Vec<u8>> {
    if let Some(obj) = value.as_object() {
        if let Some(buffer) = as_array_buffer(ctx, obj) {
            return buffer
                .as_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Exception::throw_type(ctx, "ArrayBuffer is detached"));
        }
        if is_view(ctx, value)? {
            return view_bytes(ctx, obj);
        }
    }
    Err(Exception::throw_type(
        ctx,
        &format!(
            "expected an ArrayBuffer or ArrayBuffer view, got {}",
            value.type_name()
        ),
    ))
}

fn preview<T: ToString>(items: impl Iterator<Item = T>, total: usize) -> String {
    let mut parts: Vec<String> = items.take(PRINT_PREVIEW).map(|i| i.to_string()).collect();
    if total > PRINT_PREVIEW {
        parts.push("...".to_string());
    }
    format!("[{}]", parts.join(", "))
}

fn constructor_name<'js>(obj: &Object<'js>) -> Option<String> {
    let ctor: Object = obj.get("constructor").ok()?;
    ctor.get("name").ok()
}

/// Formats one `print` argument.
pub(crate) fn format_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<String> {
    if let Some(obj) = value.as_object() {
        if let Some(buffer) = as_array_buffer(ctx, obj) {
            let bytes = buffer.as_bytes().unwrap_or_default();
            return Ok(format!(
                "ArrayBuffer({}) {}",
                bytes.len(),
                preview(bytes.iter(), bytes.len())
            ));
        }
        if is_view(ctx, value)? {
            let name = constructor_name(obj).unwrap_or_else(|| "ArrayBufferView".to_string());
            return match obj.get::<_, Option<usize>>("length")? {
                Some(len) => {
                    let mut items = Vec::with_capacity(len.min(PRINT_PREVIEW));
                    for i in 0..len.min(PRINT_PREVIEW) {
                        let item: Coerced<String> = obj.get(i as u32)?;
                        items.push(item.0);
                    }
                    Ok(format!("{}({}) {}", name, len, preview(items.into_iter(), len)))
                }
                None => {
                    let bytes = view_bytes(ctx, obj)?;
                    Ok(format!(
                        "{}({}) {}",
                        name,
                        bytes.len(),
                        preview(bytes.iter(), bytes.len())
                    ))
                }
            };
        }
    }

    if let Some(symbol) = value.as_symbol() {
        let description: Option<String> = symbol.description()?.get()?;
        return Ok(format!("Symbol({})", description.unwrap_or_default()));
    }

    match value.get::<Coerced<String>>() {
        Ok(text) => Ok(text.0),
        Err(rquickjs::Error::Exception) => {
            let _ = ctx.catch();
            Ok(format!("[{}]", value.type_name()))
        }
        Err(err) => Err(err),
    }
}

/// Joins `print` arguments the way the guest sees them.
pub(crate) fn format_line<'js>(ctx: &Ctx<'js>, values: &[Value<'js>]) -> rquickjs::Result<String> {
    let parts = values
        .iter()
        .map(|v| format_value(ctx, v))
        .collect::<rquickjs::Result<Vec<_>>>()?;
    Ok(parts.join(" "))
}
