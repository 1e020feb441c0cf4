//! Guest-facing primitives: `print`, `send` and `recv`.
//!
//! Classic scripts reach them through a global namespace object (`JsWorker`
//! by default). Modules never see that global; they import the same functions
//! from the privileged `core:worker.js` module instead.

use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::module::{Declarations, Exports, ModuleDef};
use rquickjs::{Ctx, Exception, Function, JsLifetime, Object, Value};

use crate::channel::{format_line, Channel, Realm};

/// Name of the built-in module that exports the primitives.
pub const WORKER_MODULE: &str = "worker.js";

/// Runtime userdata that lets native modules find the worker's channel.
pub(crate) struct Bridge {
    pub channel: Rc<Channel>,
}

// SAFETY: Bridge holds no JS values, so it is valid for any lifetime.
unsafe impl<'js> JsLifetime<'js> for Bridge {
    type Changed<'to> = Bridge;
}

fn print_fn<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
    let func = Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let line = format_line(&ctx, &args.0)?;
            tracing::info!(target: "jsworker::guest", "{}", line);
            println!("{}", line);
            Ok(())
        },
    )?;
    func.set_name("print")?;
    Ok(func)
}

fn send_fn<'js>(ctx: &Ctx<'js>, channel: Rc<Channel>) -> rquickjs::Result<Function<'js>> {
    let func = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, payload: Value<'js>| channel.send(&ctx, payload),
    )?;
    func.set_name("send")?;
    Ok(func)
}

fn recv_fn<'js>(ctx: &Ctx<'js>, channel: Rc<Channel>, realm: Realm) -> rquickjs::Result<Function<'js>> {
    let func = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, handler: Value<'js>| channel.set_handler(&ctx, realm, handler),
    )?;
    func.set_name("recv")?;
    Ok(func)
}

/// Installs the namespace object as a global of the script context.
pub(crate) fn install_global(
    ctx: &Ctx<'_>,
    channel: Rc<Channel>,
    global_name: &str,
) -> rquickjs::Result<()> {
    let ns = Object::new(ctx.clone())?;
    ns.set("print", print_fn(ctx)?)?;
    ns.set("send", send_fn(ctx, channel.clone())?)?;
    ns.set("recv", recv_fn(ctx, channel, Realm::Script)?)?;
    ctx.globals().set(global_name, ns)?;
    Ok(())
}

/// Native `core:worker.js` module.
pub(crate) struct WorkerModule;

impl ModuleDef for WorkerModule {
    fn declare<'js>(decl: &Declarations<'js>) -> rquickjs::Result<()> {
        decl.declare("print")?;
        decl.declare("send")?;
        decl.declare("recv")?;
        Ok(())
    }

    fn evaluate<'js>(ctx: &Ctx<'js>, exports: &Exports<'js>) -> rquickjs::Result<()> {
        let channel = ctx
            .userdata::<Bridge>()
            .map(|bridge| bridge.channel.clone())
            .ok_or_else(|| Exception::throw_internal(ctx, "worker channel is not attached"))?;

        exports.export("print", print_fn(ctx)?)?;
        exports.export("send", send_fn(ctx, channel.clone())?)?;
        exports.export("recv", recv_fn(ctx, channel, Realm::Module)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use std::cell::Cell;

    #[test]
    fn test_global_namespace() {
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let channel = Rc::new(Channel::new(Box::new(move |msg: &[u8]| {
            seen.set(seen.get() + msg.len());
            None
        })));

        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            install_global(&ctx, channel.clone(), "Host").unwrap();
            let kind: String = ctx.eval("typeof Host.send").unwrap();
            assert_eq!(kind, "function");
            let ret: bool = ctx
                .eval("Host.send(new ArrayBuffer(4)) === undefined")
                .unwrap();
            assert!(ret);
            let name: String = ctx.eval("Host.recv.name").unwrap();
            assert_eq!(name, "recv");
            ctx.eval::<(), _>("Host.print('from', 'test', new Uint8Array(2))")
                .unwrap();
        });
        assert_eq!(count.get(), 4);
        channel.clear_handler();
    }

    #[test]
    fn test_recv_rejects_non_function() {
        let channel = Rc::new(Channel::new(Box::new(|_: &[u8]| None)));
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            install_global(&ctx, channel.clone(), "JsWorker").unwrap();
            let msg: String = ctx
                .eval("try { JsWorker.recv(3); 'ok' } catch (e) { e.message }")
                .unwrap();
            assert_eq!(msg, "recv expects a function");
        });
        assert!(channel.handler_realm().is_none());
    }
}
