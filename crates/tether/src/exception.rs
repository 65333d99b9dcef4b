//! Exception translation across the engine boundary.
//!
//! Every invocation result is decoded into [`Outcome`] the moment it leaves
//! the engine. A thrown value becomes a [`JsException`]; when the thrown
//! value is an error that the bridge itself raised on behalf of a failing
//! host service, the original host error is recovered as the cause.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Function, Object, Value};

use crate::error::BridgeError;

/// Property that tags engine errors raised for a failing host service.
const HOST_ERROR_KEY: &str = "__tetherHostError";

/// A value thrown by JavaScript, captured and removed from the engine.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct JsException {
    message: String,
    stack: Option<String>,
    #[source]
    cause: Option<Box<BridgeError>>,
}

impl JsException {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The JavaScript stack, when the thrown value carried one.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// The host error this exception wraps, if JavaScript let a host failure propagate.
    pub fn cause(&self) -> Option<&BridgeError> {
        self.cause.as_deref()
    }

    pub fn into_cause(self) -> Option<BridgeError> {
        self.cause.map(|cause| *cause)
    }
}

/// Result of invoking into the engine, decoded at the boundary.
pub(crate) enum Outcome<'js> {
    Returned(Value<'js>),
    Thrown(Value<'js>),
}

impl<'js> Outcome<'js> {
    pub(crate) fn decode(
        ctx: &Ctx<'js>,
        result: rquickjs::Result<Value<'js>>,
    ) -> crate::Result<Self> {
        match result {
            Ok(value) => Ok(Self::Returned(value)),
            Err(rquickjs::Error::Exception) => Ok(Self::Thrown(ctx.catch())),
            Err(other) => Err(BridgeError::Engine(other)),
        }
    }

    /// The returned value, or the translated exception.
    pub(crate) fn returned(self, stash: &HostErrorStash) -> crate::Result<Value<'js>> {
        match self {
            Self::Returned(value) => Ok(value),
            Self::Thrown(thrown) => Err(BridgeError::Js(translate(&thrown, stash))),
        }
    }
}

/// Converts an engine error into a host error, draining the pending exception if there is one.
pub(crate) fn catch(ctx: &Ctx<'_>, stash: &HostErrorStash, error: rquickjs::Error) -> BridgeError {
    match error {
        rquickjs::Error::Exception => BridgeError::Js(translate(&ctx.catch(), stash)),
        other => BridgeError::Engine(other),
    }
}

/// Drains an exception left pending behind an engine error that is already a [`BridgeError`].
pub(crate) fn settle(ctx: &Ctx<'_>, stash: &HostErrorStash, error: BridgeError) -> BridgeError {
    match error {
        BridgeError::Engine(rquickjs::Error::Exception) => {
            BridgeError::Js(translate(&ctx.catch(), stash))
        }
        other => other,
    }
}

pub(crate) fn translate(thrown: &Value<'_>, stash: &HostErrorStash) -> JsException {
    let Some(object) = thrown.as_object() else {
        // `throw 2` and friends: no message property, use the value itself.
        return JsException::new(coerce_to_string(thrown));
    };

    let message = match property(object, "message") {
        Some(message) if !message.is_undefined() => coerce_to_string(&message),
        _ => coerce_to_string(thrown),
    };
    let stack = property(object, "stack")
        .and_then(|stack| stack.as_string().and_then(|s| s.to_string().ok()));
    let cause = property(object, HOST_ERROR_KEY)
        .and_then(|id| id.as_int())
        .and_then(|id| stash.take(id))
        .map(Box::new);

    JsException {
        message,
        stack,
        cause,
    }
}

/// Reads a property, swallowing (and draining) anything a getter throws.
fn property<'js>(object: &Object<'js>, key: &str) -> Option<Value<'js>> {
    match object.get::<_, Value>(key) {
        Ok(value) => Some(value),
        Err(rquickjs::Error::Exception) => {
            let _ = object.ctx().catch();
            None
        }
        Err(_) => None,
    }
}

fn coerce_to_string(value: &Value<'_>) -> String {
    match value.get::<Coerced<String>>() {
        Ok(Coerced(s)) => s,
        Err(err) => {
            if matches!(err, rquickjs::Error::Exception) {
                let _ = value.ctx().catch();
            }
            "<unprintable exception>".to_string()
        }
    }
}

/// Throws `error` into the engine as a JavaScript `Error` carrying the host message.
///
/// The error is tagged so [`translate`] can recover the original host error if
/// JavaScript lets it escape back to the host.
pub(crate) fn throw_host_error<'js>(
    ctx: &Ctx<'js>,
    stash: &HostErrorStash,
    error: BridgeError,
) -> rquickjs::Error {
    let message = error.to_string();
    let id = stash.put(error);
    match new_error(ctx, "Error", &message) {
        Ok(object) => {
            if let Err(err) = object.set(HOST_ERROR_KEY, id) {
                return err;
            }
            ctx.throw(object.into_value())
        }
        Err(err) => err,
    }
}

/// Throws a `TypeError`, the same class QuickJS raises for bad arguments.
pub(crate) fn throw_type_error(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    match new_error(ctx, "TypeError", message) {
        Ok(object) => ctx.throw(object.into_value()),
        Err(err) => err,
    }
}

fn new_error<'js>(
    ctx: &Ctx<'js>,
    constructor: &str,
    message: &str,
) -> rquickjs::Result<Object<'js>> {
    // Calling an error constructor without `new` still builds an instance.
    let constructor: Function = ctx.globals().get(constructor)?;
    constructor.call((message,))
}

/// A counterpart returned a shape outside what the protocol promises.
///
/// Engine state cannot be trusted beyond this point, so this never returns.
pub(crate) fn protocol_violation(channel: &str, method: &str, expected: &str, found: &str) -> ! {
    tracing::error!(
        channel,
        method,
        expected,
        found,
        "Protocol violation: unexpected result shape"
    );
    panic!("protocol violation: {channel}.{method} returned {found}, expected {expected}");
}

/// Host errors thrown into the engine, keyed by the id stored on the thrown value.
///
/// Cleared whenever the outermost call leaves the engine.
#[derive(Default)]
pub(crate) struct HostErrorStash {
    next_id: Cell<i32>,
    pending: RefCell<HashMap<i32, BridgeError>>,
}

impl HostErrorStash {
    fn put(&self, error: BridgeError) -> i32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1) & i32::MAX);
        self.pending.borrow_mut().insert(id, error);
        id
    }

    fn take(&self, id: i32) -> Option<BridgeError> {
        self.pending.borrow_mut().remove(&id)
    }

    pub(crate) fn clear(&self) {
        let mut pending = self.pending.borrow_mut();
        if !pending.is_empty() {
            tracing::trace!(count = pending.len(), "Discarding host errors caught by JavaScript");
            pending.clear();
        }
    }
}
