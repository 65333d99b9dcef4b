use std::rc::{Rc, Weak};

use rquickjs::{Ctx, Function, Object, Value};

use super::methods;
use super::CallChannel;
use crate::engine::EngineState;
use crate::error::{BridgeError, Result};
use crate::exception::{self, HostErrorStash};
use crate::marshal;

/// Installs `channel` as global object `name`, exposing the four protocol methods to JavaScript.
///
/// The caller guarantees `name` is not already a global.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    channel: Rc<dyn CallChannel>,
    stash: Rc<HostErrorStash>,
) -> rquickjs::Result<()> {
    let object = Object::new(ctx.clone())?;

    {
        let (channel, stash) = (channel.clone(), stash.clone());
        object.set(
            methods::SERVICE_NAMES_ARRAY,
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
                let names = channel
                    .service_names_array()
                    .map_err(|err| exception::throw_host_error(&ctx, &stash, err))?;
                marshal::to_js_string_array(&ctx, &names)
            })?,
        )?;
    }

    {
        let (channel, stash) = (channel.clone(), stash.clone());
        object.set(
            methods::INVOKE,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      instance: Value<'js>,
                      function: Value<'js>,
                      args: Value<'js>|
                      -> rquickjs::Result<Value<'js>> {
                    let instance = argument(&ctx, marshal::from_js_string(&instance))?;
                    let function = argument(&ctx, marshal::from_js_string(&function))?;
                    let args = argument(&ctx, marshal::from_js_string_array(&args))?;
                    let result = channel
                        .invoke(&instance, &function, &args)
                        .map_err(|err| exception::throw_host_error(&ctx, &stash, err))?;
                    marshal::to_js_string_array(&ctx, &result)
                },
            )?,
        )?;
    }

    {
        let (channel, stash) = (channel.clone(), stash.clone());
        object.set(
            methods::INVOKE_SUSPENDING,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      instance: Value<'js>,
                      function: Value<'js>,
                      args: Value<'js>,
                      callback: Value<'js>|
                      -> rquickjs::Result<()> {
                    let instance = argument(&ctx, marshal::from_js_string(&instance))?;
                    let function = argument(&ctx, marshal::from_js_string(&function))?;
                    let args = argument(&ctx, marshal::from_js_string_array(&args))?;
                    let callback = argument(&ctx, marshal::from_js_string(&callback))?;
                    channel
                        .invoke_suspending(&instance, &function, &args, &callback)
                        .map_err(|err| exception::throw_host_error(&ctx, &stash, err))
                },
            )?,
        )?;
    }

    object.set(
        methods::DISCONNECT,
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, instance: Value<'js>| -> rquickjs::Result<Value<'js>> {
                let instance = argument(&ctx, marshal::from_js_string(&instance))?;
                let disconnected = channel
                    .disconnect(&instance)
                    .map_err(|err| exception::throw_host_error(&ctx, &stash, err))?;
                Ok(marshal::to_js_bool(&ctx, disconnected))
            },
        )?,
    )?;

    ctx.globals().set(name, object)
}

/// Bad arguments from JavaScript surface as a `TypeError` there.
fn argument<T>(ctx: &Ctx<'_>, converted: Result<T>) -> rquickjs::Result<T> {
    converted.map_err(|err| match err {
        // Whatever JavaScript threw while the argument was read stays pending.
        BridgeError::Engine(err) => err,
        other => exception::throw_type_error(ctx, &other.to_string()),
    })
}

/// Host handle to a channel installed with [`crate::QuickJs::set_outbound_channel`].
///
/// Calls go straight to the host implementation without entering the engine.
#[derive(Clone)]
pub struct OutboundCallChannel {
    engine: Weak<EngineState>,
    name: String,
}

impl OutboundCallChannel {
    pub(crate) fn new(engine: Weak<EngineState>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Result<Rc<dyn CallChannel>> {
        let engine = self.engine.upgrade().ok_or(BridgeError::Closed)?;
        engine
            .outbound(&self.name)
            .ok_or_else(|| BridgeError::MissingGlobal(self.name.clone()))
    }
}

impl std::fmt::Debug for OutboundCallChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundCallChannel")
            .field("name", &self.name)
            .field("closed", &(self.engine.strong_count() == 0))
            .finish()
    }
}

impl CallChannel for OutboundCallChannel {
    fn service_names_array(&self) -> Result<Vec<String>> {
        self.target()?.service_names_array()
    }

    fn invoke(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> Result<Vec<String>> {
        self.target()?
            .invoke(instance_name, function_name, encoded_arguments)
    }

    fn invoke_suspending(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
        callback_name: &str,
    ) -> Result<()> {
        self.target()?
            .invoke_suspending(instance_name, function_name, encoded_arguments, callback_name)
    }

    fn disconnect(&self, instance_name: &str) -> Result<bool> {
        self.target()?.disconnect(instance_name)
    }
}
