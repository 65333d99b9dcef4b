//! The engine handle.
//!
//! [`QuickJs`] owns one QuickJS runtime and its global context. Channels
//! derived from it hold only weak references, so closing (or dropping) the
//! handle invalidates them all at once.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::rc::Rc;

use rquickjs::{qjs, Context, Ctx, Runtime, Value};
use serde::Serialize;

use crate::channel::{self, CallChannel, InboundCallChannel, OutboundCallChannel};
use crate::config::EngineConfig;
use crate::error::{BridgeError, Result};
use crate::exception::{self, HostErrorStash, Outcome};
use crate::marshal::{self, JsValue};

/// Global set to the id of the module being loaded, removed once loading finishes.
pub const CURRENT_MODULE_ID_GLOBAL: &str = "tether_currentModuleId";

/// Decides whether running JavaScript should be interrupted.
///
/// Polled periodically by the engine while it executes. Returning `true`
/// aborts execution with an uncatchable `interrupted` error.
pub trait InterruptHandler {
    fn poll(&mut self) -> bool;
}

impl<F> InterruptHandler for F
where
    F: FnMut() -> bool,
{
    fn poll(&mut self) -> bool {
        self()
    }
}

/// Script bytecode produced by [`QuickJs::compile`].
#[derive(Clone, PartialEq, Eq)]
pub struct Bytecode(Vec<u8>);

impl Bytecode {
    /// Wraps bytes previously obtained from [`Bytecode::into_bytes`].
    ///
    /// # Safety
    ///
    /// QuickJS does not validate bytecode. The bytes must come from
    /// [`QuickJs::compile`] of the same engine build, unmodified.
    pub unsafe fn from_trusted_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Bytecode").field(&self.0.len()).finish()
    }
}

/// Engine allocation statistics, as reported by QuickJS.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryUsage {
    pub malloc_size: i64,
    pub malloc_limit: i64,
    pub memory_used_size: i64,
    pub malloc_count: i64,
    pub memory_used_count: i64,
    pub atom_count: i64,
    pub atom_size: i64,
    pub str_count: i64,
    pub str_size: i64,
    pub obj_count: i64,
    pub obj_size: i64,
    pub prop_count: i64,
    pub prop_size: i64,
    pub shape_count: i64,
    pub shape_size: i64,
    pub js_func_count: i64,
    pub js_func_size: i64,
    pub js_func_code_size: i64,
    pub js_func_pc2line_count: i64,
    pub js_func_pc2line_size: i64,
    pub c_func_count: i64,
    pub array_count: i64,
    pub fast_array_count: i64,
    pub fast_array_elements: i64,
    pub binary_object_count: i64,
    pub binary_object_size: i64,
}

impl From<rquickjs::qjs::JSMemoryUsage> for MemoryUsage {
    fn from(usage: rquickjs::qjs::JSMemoryUsage) -> Self {
        Self {
            malloc_size: usage.malloc_size,
            malloc_limit: usage.malloc_limit,
            memory_used_size: usage.memory_used_size,
            malloc_count: usage.malloc_count,
            memory_used_count: usage.memory_used_count,
            atom_count: usage.atom_count,
            atom_size: usage.atom_size,
            str_count: usage.str_count,
            str_size: usage.str_size,
            obj_count: usage.obj_count,
            obj_size: usage.obj_size,
            prop_count: usage.prop_count,
            prop_size: usage.prop_size,
            shape_count: usage.shape_count,
            shape_size: usage.shape_size,
            js_func_count: usage.js_func_count,
            js_func_size: usage.js_func_size,
            js_func_code_size: usage.js_func_code_size,
            js_func_pc2line_count: usage.js_func_pc2line_count,
            js_func_pc2line_size: usage.js_func_pc2line_size,
            c_func_count: usage.c_func_count,
            array_count: usage.array_count,
            fast_array_count: usage.fast_array_count,
            fast_array_elements: usage.fast_array_elements,
            binary_object_count: usage.binary_object_count,
            binary_object_size: usage.binary_object_size,
        }
    }
}

/// Shared engine state. Channels reach it through `Weak` references.
pub(crate) struct EngineState {
    // Contexts are declared before the runtime so they drop first.
    context: Context,
    compile_context: Context,
    runtime: Runtime,
    busy: Cell<bool>,
    stash: Rc<HostErrorStash>,
    outbound: RefCell<HashMap<String, Rc<dyn CallChannel>>>,
}

/// Marks the engine busy until dropped.
struct BusyGuard<'a> {
    state: &'a EngineState,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.stash.clear();
        self.state.busy.set(false);
    }
}

impl EngineState {
    fn enter(&self) -> Result<BusyGuard<'_>> {
        if self.busy.replace(true) {
            return Err(BridgeError::Reentrant);
        }
        Ok(BusyGuard { state: self })
    }

    /// Runs `f` inside the global context, rejecting re-entrant calls.
    pub(crate) fn with<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(Ctx<'js>, &EngineState) -> Result<R>,
    {
        let _guard = self.enter()?;
        self.context.with(|ctx| {
            f(ctx.clone(), self).map_err(|err| exception::settle(&ctx, self.stash(), err))
        })
    }

    fn with_runtime<R>(&self, f: impl FnOnce(&Runtime) -> R) -> Result<R> {
        let _guard = self.enter()?;
        Ok(f(&self.runtime))
    }

    pub(crate) fn stash(&self) -> &HostErrorStash {
        &self.stash
    }

    pub(crate) fn outbound(&self, name: &str) -> Option<Rc<dyn CallChannel>> {
        self.outbound.borrow().get(name).cloned()
    }
}

/// An embedded QuickJS engine.
///
/// Single threaded and not re-entrant: a host service called from JavaScript
/// cannot call back into the same engine before it returns
/// ([`BridgeError::Reentrant`]).
pub struct QuickJs {
    state: Rc<EngineState>,
}

impl QuickJs {
    /// Creates an engine with QuickJS default limits.
    pub fn create() -> Result<Self> {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        let compile_context = Context::full(&runtime)?;
        let engine = Self {
            state: Rc::new(EngineState {
                context,
                compile_context,
                runtime,
                busy: Cell::new(false),
                stash: Rc::new(HostErrorStash::default()),
                outbound: RefCell::new(HashMap::new()),
            }),
        };
        config.apply(&engine)?;
        tracing::debug!(?config, "Created QuickJs engine");
        Ok(engine)
    }

    /// Evaluates `code` as a script and returns its completion value.
    pub fn evaluate(&self, code: &str, source_name: &str) -> Result<JsValue> {
        let _span = tracing::debug_span!("evaluate", source = source_name).entered();
        self.state.with(|ctx, state| {
            let result = eval_script(&ctx, code, source_name, 0);
            let value = Outcome::decode(&ctx, result)?.returned(state.stash())?;
            marshal::to_host_value(&value)
        })
    }

    /// Compiles `code` as a global script without running it.
    pub fn compile(&self, code: &str, source_name: &str) -> Result<Bytecode> {
        let _span = tracing::debug_span!("compile", source = source_name).entered();
        let state = &self.state;
        let _guard = state.enter()?;
        // Compiling in a second context leaves the global one untouched.
        state.compile_context.with(|ctx| {
            let compile_only = qjs::JS_EVAL_FLAG_COMPILE_ONLY as i32;
            let bytes = eval_script(&ctx, code, source_name, compile_only)
                .and_then(|function| write_bytecode(&ctx, &function))
                .map_err(|err| exception::catch(&ctx, state.stash(), err))?;
            tracing::debug!(bytes = bytes.len(), "Compiled script");
            Ok(Bytecode(bytes))
        })
    }

    /// Runs bytecode produced by [`QuickJs::compile`] and returns its completion value.
    ///
    /// Top-level declarations land in the global scope, as with [`QuickJs::evaluate`].
    pub fn execute(&self, bytecode: &Bytecode) -> Result<JsValue> {
        self.state.with(|ctx, state| {
            let result = run_bytecode(&ctx, bytecode);
            let value = Outcome::decode(&ctx, result)?.returned(state.stash())?;
            marshal::to_host_value(&value)
        })
    }

    /// Runs `source` as module `id`, with [`CURRENT_MODULE_ID_GLOBAL`] set while it runs.
    pub fn load_module(&self, source: &str, id: &str) -> Result<()> {
        let _span = tracing::debug_span!("load_module", id).entered();
        self.state.with(|ctx, state| {
            with_current_module(&ctx, state, id, || {
                let result = eval_script(&ctx, source, id, 0);
                Outcome::decode(&ctx, result)?.returned(state.stash())?;
                Ok(())
            })
        })
    }

    /// Runs precompiled bytecode as module `id`.
    pub fn load_module_bytecode(&self, bytecode: &Bytecode, id: &str) -> Result<()> {
        let _span = tracing::debug_span!("load_module_bytecode", id).entered();
        self.state.with(|ctx, state| {
            with_current_module(&ctx, state, id, || {
                let result = run_bytecode(&ctx, bytecode);
                Outcome::decode(&ctx, result)?.returned(state.stash())?;
                Ok(())
            })
        })
    }

    /// Installs or clears the interrupt handler.
    pub fn set_interrupt_handler(&self, handler: Option<Box<dyn InterruptHandler>>) -> Result<()> {
        self.state.with_runtime(|runtime| match handler {
            Some(mut handler) => {
                runtime.set_interrupt_handler(Some(Box::new(move || handler.poll())))
            }
            None => runtime.set_interrupt_handler(None),
        })
    }

    pub fn set_memory_limit(&self, bytes: usize) -> Result<()> {
        self.state.with_runtime(|runtime| runtime.set_memory_limit(bytes))
    }

    pub fn set_gc_threshold(&self, bytes: usize) -> Result<()> {
        self.state.with_runtime(|runtime| runtime.set_gc_threshold(bytes))
    }

    pub fn set_max_stack_size(&self, bytes: usize) -> Result<()> {
        self.state.with_runtime(|runtime| runtime.set_max_stack_size(bytes))
    }

    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        self.state
            .with_runtime(|runtime| MemoryUsage::from(runtime.memory_usage()))
    }

    /// Runs a full garbage collection cycle.
    pub fn gc(&self) -> Result<()> {
        self.state.with_runtime(|runtime| runtime.run_gc())
    }

    /// Handle to JavaScript global `name`, which must exist and be an object.
    pub fn inbound_channel(&self, name: &str) -> Result<InboundCallChannel> {
        self.state.with(|ctx, state| {
            channel::resolve_global(&ctx, state.stash(), name)?;
            Ok(())
        })?;
        tracing::debug!(channel = %name, "Resolved inbound channel");
        Ok(InboundCallChannel::new(Rc::downgrade(&self.state), name))
    }

    /// Handle to JavaScript global `name` without checking it exists yet.
    ///
    /// Useful when the script defining the object runs after the handle is
    /// created. Resolution errors surface on the first call instead.
    pub fn deferred_inbound_channel(&self, name: &str) -> InboundCallChannel {
        InboundCallChannel::new(Rc::downgrade(&self.state), name)
    }

    /// Exposes `channel` to JavaScript as global object `name`.
    pub fn set_outbound_channel(
        &self,
        name: &str,
        channel: Rc<dyn CallChannel>,
    ) -> Result<OutboundCallChannel> {
        self.state.with(|ctx, state| {
            if ctx.globals().contains_key(name)? {
                return Err(BridgeError::GlobalExists(name.to_string()));
            }
            channel::install(&ctx, name, channel.clone(), state.stash.clone())?;
            Ok(())
        })?;
        self.state
            .outbound
            .borrow_mut()
            .insert(name.to_string(), channel);
        tracing::debug!(channel = %name, "Installed outbound channel");
        Ok(OutboundCallChannel::new(Rc::downgrade(&self.state), name))
    }

    /// Host handle to an outbound channel installed earlier.
    pub fn outbound_channel(&self, name: &str) -> Result<OutboundCallChannel> {
        if self.state.outbound(name).is_none() {
            return Err(BridgeError::MissingGlobal(name.to_string()));
        }
        Ok(OutboundCallChannel::new(Rc::downgrade(&self.state), name))
    }

    /// Destroys the engine. Every channel derived from it reports [`BridgeError::Closed`] afterwards.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for QuickJs {
    fn drop(&mut self) {
        tracing::debug!("Closing QuickJs engine");
    }
}

/// Evaluates `code` as a global script named `source_name`.
///
/// With `JS_EVAL_FLAG_COMPILE_ONLY` in `flags` the result is the compiled
/// function rather than its completion value.
fn eval_script<'js>(
    ctx: &Ctx<'js>,
    code: &str,
    source_name: &str,
    flags: i32,
) -> rquickjs::Result<Value<'js>> {
    // QuickJS expects a NUL byte just past the end of the input.
    let mut input = Vec::with_capacity(code.len() + 1);
    input.extend_from_slice(code.as_bytes());
    input.push(0);
    let file_name = CString::new(source_name.replace('\0', "")).unwrap_or_default();
    // SAFETY: both buffers are NUL terminated and outlive the call.
    let value = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            input.as_ptr().cast(),
            code.len() as _,
            file_name.as_ptr(),
            qjs::JS_EVAL_TYPE_GLOBAL as i32 | flags,
        )
    };
    owned_value(ctx, value)
}

fn write_bytecode(ctx: &Ctx<'_>, function: &Value<'_>) -> rquickjs::Result<Vec<u8>> {
    let raw = ctx.as_raw().as_ptr();
    let mut len = 0;
    // SAFETY: `function` is alive for the call and the buffer is freed once copied.
    unsafe {
        let buffer = qjs::JS_WriteObject(
            raw,
            &mut len,
            function.as_raw(),
            qjs::JS_WRITE_OBJ_BYTECODE as i32,
        );
        if buffer.is_null() {
            return Err(rquickjs::Error::Exception);
        }
        let bytes = std::slice::from_raw_parts(buffer, len as usize).to_vec();
        qjs::js_free(raw, buffer.cast());
        Ok(bytes)
    }
}

fn run_bytecode<'js>(ctx: &Ctx<'js>, bytecode: &Bytecode) -> rquickjs::Result<Value<'js>> {
    let raw = ctx.as_raw().as_ptr();
    let bytes = bytecode.as_bytes();
    // SAFETY: `Bytecode` is only built by `compile` or `from_trusted_bytes`.
    let function = unsafe {
        qjs::JS_ReadObject(
            raw,
            bytes.as_ptr(),
            bytes.len() as _,
            qjs::JS_READ_OBJ_BYTECODE as i32,
        )
    };
    if is_exception(function) {
        return Err(rquickjs::Error::Exception);
    }
    // SAFETY: `JS_EvalFunction` takes over the reference to `function`.
    let value = unsafe { qjs::JS_EvalFunction(raw, function) };
    owned_value(ctx, value)
}

fn is_exception(value: qjs::JSValue) -> bool {
    // SAFETY: inspects the tag only.
    unsafe { qjs::JS_IsException(value) }
}

/// Wraps a reference returned by the engine, or reports the pending exception.
fn owned_value<'js>(ctx: &Ctx<'js>, value: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    if is_exception(value) {
        return Err(rquickjs::Error::Exception);
    }
    // SAFETY: the engine handed this reference to the caller.
    Ok(unsafe { Value::from_raw(ctx.clone(), value) })
}

fn with_current_module<'js, R>(
    ctx: &Ctx<'js>,
    state: &EngineState,
    id: &str,
    load: impl FnOnce() -> Result<R>,
) -> Result<R> {
    let globals = ctx.globals();
    globals
        .set(CURRENT_MODULE_ID_GLOBAL, id)
        .map_err(|err| exception::catch(ctx, state.stash(), err))?;
    let result = load();
    globals
        .remove(CURRENT_MODULE_ID_GLOBAL)
        .map_err(|err| exception::catch(ctx, state.stash(), err))?;
    result
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn evaluate_maps_results() {
        let engine = QuickJs::create().unwrap();
        assert_eq!(engine.evaluate("1 + 2", "sum.js").unwrap(), JsValue::Int(3));
        assert_eq!(engine.evaluate("undefined", "u.js").unwrap(), JsValue::Null);
        assert_eq!(
            engine.evaluate("['a', 1.5, false]", "arr.js").unwrap(),
            JsValue::Array(vec![
                JsValue::String("a".to_string()),
                JsValue::Float(1.5),
                JsValue::Bool(false),
            ])
        );
    }

    #[test]
    fn evaluate_reports_syntax_errors() {
        let engine = QuickJs::create().unwrap();
        let err = engine.evaluate("let = ;", "bad.js").unwrap_err();
        assert!(err.as_js().is_some(), "expected JS exception, got {err:?}");
    }

    #[test]
    fn state_persists_between_evaluations() {
        let engine = QuickJs::create().unwrap();
        engine.evaluate("var counter = 41;", "a.js").unwrap();
        assert_eq!(engine.evaluate("++counter", "b.js").unwrap(), JsValue::Int(42));
    }

    #[test]
    fn compile_then_execute() {
        let engine = QuickJs::create().unwrap();
        let bytecode = engine
            .compile("globalThis.answer = 6 * 7;", "answer.js")
            .unwrap();
        assert!(!bytecode.as_bytes().is_empty());
        assert_eq!(engine.evaluate("typeof answer", "check.js").unwrap(), JsValue::String("undefined".to_string()));

        assert_eq!(engine.execute(&bytecode).unwrap(), JsValue::Int(42));
        assert_eq!(engine.evaluate("answer", "check.js").unwrap(), JsValue::Int(42));
    }

    #[test]
    fn executed_script_declares_globals() {
        let engine = QuickJs::create().unwrap();
        let bytecode = engine
            .compile("var declared = 5; function helper() { return 1; } 1 + 2", "decl.js")
            .unwrap();
        assert_eq!(engine.execute(&bytecode).unwrap(), JsValue::Int(3));
        assert_eq!(
            engine.evaluate("typeof declared", "check.js").unwrap(),
            JsValue::String("number".to_string())
        );
        assert_eq!(
            engine.evaluate("typeof helper", "check.js").unwrap(),
            JsValue::String("function".to_string())
        );
    }

    #[test]
    fn executed_throw_is_translated() {
        let engine = QuickJs::create().unwrap();
        let bytecode = engine
            .compile("throw new Error('bytecode failed');", "throws.js")
            .unwrap();
        let err = engine.execute(&bytecode).unwrap_err();
        assert_eq!(err.to_string(), "bytecode failed");
        assert!(err.as_js().and_then(|e| e.stack()).is_some_and(|s| s.contains("throws.js")));
    }

    #[test]
    fn compile_rejects_syntax_errors() {
        let engine = QuickJs::create().unwrap();
        let err = engine.compile("let = ;", "bad.js").unwrap_err();
        assert!(err.as_js().is_some(), "expected JS exception, got {err:?}");
        assert_eq!(engine.evaluate("'alive'", "after.js").unwrap(), JsValue::String("alive".to_string()));
    }

    #[test]
    fn module_throw_is_translated() {
        let engine = QuickJs::create().unwrap();
        let err = engine
            .load_module("throw new Error('module failed');", "failing")
            .unwrap_err();
        assert_eq!(err.to_string(), "module failed");
    }

    #[test]
    fn current_module_id_is_visible_while_loading() {
        let engine = QuickJs::create().unwrap();
        engine
            .load_module("globalThis.seenId = globalThis.tether_currentModuleId;", "app/main")
            .unwrap();
        assert_eq!(engine.evaluate("seenId", "check.js").unwrap(), JsValue::String("app/main".to_string()));
        assert_eq!(
            engine.evaluate("typeof tether_currentModuleId", "check.js").unwrap(),
            JsValue::String("undefined".to_string())
        );

        let bytecode = engine
            .compile("globalThis.seenId = globalThis.tether_currentModuleId;", "compiled")
            .unwrap();
        engine.load_module_bytecode(&bytecode, "app/compiled").unwrap();
        assert_eq!(
            engine.evaluate("seenId", "check.js").unwrap(),
            JsValue::String("app/compiled".to_string())
        );
    }

    #[test]
    fn interrupt_handler_stops_busy_loop() {
        let engine = QuickJs::create().unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        engine
            .set_interrupt_handler(Some(Box::new(move || Instant::now() > deadline)))
            .unwrap();
        let err = engine.evaluate("while (true) {}", "spin.js").unwrap_err();
        assert!(err.to_string().contains("interrupted"), "unexpected error: {err}");

        engine.set_interrupt_handler(None).unwrap();
        assert_eq!(engine.evaluate("'alive'", "after.js").unwrap(), JsValue::String("alive".to_string()));
    }

    #[test]
    fn memory_usage_reports_allocations() {
        let engine = QuickJs::create().unwrap();
        engine.evaluate("globalThis.big = new Array(1000).fill('x');", "alloc.js").unwrap();
        let usage = engine.memory_usage().unwrap();
        assert!(usage.malloc_size > 0);
        assert!(usage.obj_count > 0);
        engine.gc().unwrap();
    }

    #[test]
    fn memory_limit_is_enforced() {
        let engine = QuickJs::create().unwrap();
        engine.set_memory_limit(4 * 1024 * 1024).unwrap();
        let result = engine.evaluate(
            "var chunks = []; while (true) { chunks.push(new Array(100000).fill(1)); }",
            "oom.js",
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_and_non_object_globals_are_rejected() {
        let engine = QuickJs::create().unwrap();
        engine.evaluate("globalThis.count = 3;", "setup.js").unwrap();

        let err = engine.inbound_channel("nothing_here").unwrap_err();
        insta::assert_snapshot!(err, @"A global JavaScript object called nothing_here was not found");

        let err = engine.inbound_channel("count").unwrap_err();
        insta::assert_snapshot!(err, @"JavaScript global called count is not an object");

        let deferred = engine.deferred_inbound_channel("later");
        assert!(matches!(
            deferred.service_names_array(),
            Err(BridgeError::MissingGlobal(_))
        ));
        engine
            .evaluate("globalThis.later = { serviceNamesArray() { return ['x']; } };", "late.js")
            .unwrap();
        assert_eq!(deferred.service_names_array().unwrap(), vec!["x"]);
    }

    /// Calls back into the engine from inside a host service.
    struct Reentering {
        channel: InboundCallChannel,
    }

    impl CallChannel for Reentering {
        fn service_names_array(&self) -> Result<Vec<String>> {
            self.channel.service_names_array()
        }

        fn invoke(&self, _: &str, _: &str, _: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn invoke_suspending(&self, _: &str, _: &str, _: &[String], _: &str) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn reentrant_call_is_rejected() {
        let engine = QuickJs::create().unwrap();
        let channel = engine.deferred_inbound_channel("js");
        engine
            .set_outbound_channel("host", Rc::new(Reentering { channel }))
            .unwrap();
        engine
            .evaluate("globalThis.js = { serviceNamesArray() { return host.serviceNamesArray(); } };", "setup.js")
            .unwrap();

        let err = engine.evaluate("host.serviceNamesArray()", "reenter.js").unwrap_err();
        assert_eq!(err.to_string(), "QuickJs instance is already executing a call");
        assert!(matches!(err.as_js().and_then(|e| e.cause()), Some(BridgeError::Reentrant)));

        // The engine is usable again once the outer call has returned.
        assert_eq!(engine.evaluate("1", "after.js").unwrap(), JsValue::Int(1));
    }
}
