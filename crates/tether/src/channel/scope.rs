use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Function, Object, Value};

use crate::error::{BridgeError, Result};
use crate::exception::{self, HostErrorStash, Outcome};

/// Engine handles held for the duration of one invocation.
///
/// Everything resolved for a call lives here and is released together when
/// the scope drops, whichever way the call exits.
pub(crate) struct CallScope<'a, 'js> {
    ctx: Ctx<'js>,
    channel: &'a str,
    method: &'static str,
    target: Object<'js>,
    function: Function<'js>,
}

impl<'a, 'js> CallScope<'a, 'js> {
    /// Looks up global `channel` and its `method`.
    pub(crate) fn resolve(
        ctx: &Ctx<'js>,
        stash: &HostErrorStash,
        channel: &'a str,
        method: &'static str,
    ) -> Result<Self> {
        let target = resolve_global(ctx, stash, channel)?;

        let property: Value = target
            .get(method)
            .map_err(|err| exception::catch(ctx, stash, err))?;
        let Some(function) = property.into_function() else {
            let message = format!("{channel}.{method} is not a function");
            let err = exception::throw_type_error(ctx, &message);
            return Err(exception::catch(ctx, stash, err));
        };

        tracing::trace!(channel, method, "Resolved call scope");
        Ok(Self {
            ctx: ctx.clone(),
            channel,
            method,
            target,
            function,
        })
    }

    pub(crate) fn channel(&self) -> &'a str {
        self.channel
    }

    pub(crate) fn method(&self) -> &'static str {
        self.method
    }

    /// Calls the method with `args`, `this` bound to the channel object.
    pub(crate) fn invoke(&self, args: Vec<Value<'js>>) -> Result<Outcome<'js>> {
        let result = self
            .function
            .call::<_, Value>((This(self.target.clone()), Rest(args)));
        Outcome::decode(&self.ctx, result)
    }
}

impl Drop for CallScope<'_, '_> {
    fn drop(&mut self) {
        tracing::trace!(channel = self.channel, method = self.method, "Released call scope");
    }
}

/// Global object `name`, or the handle error describing why there is none.
pub(crate) fn resolve_global<'js>(
    ctx: &Ctx<'js>,
    stash: &HostErrorStash,
    name: &str,
) -> Result<Object<'js>> {
    let value: Value = ctx
        .globals()
        .get(name)
        .map_err(|err| exception::catch(ctx, stash, err))?;
    if value.is_undefined() {
        return Err(BridgeError::MissingGlobal(name.to_string()));
    }
    value
        .into_object()
        .ok_or_else(|| BridgeError::NotAnObject(name.to_string()))
}
