use std::rc::{Rc, Weak};

use rquickjs::Value;

use super::methods;
use super::scope::CallScope;
use super::CallChannel;
use crate::engine::EngineState;
use crate::error::{BridgeError, Result};
use crate::exception::protocol_violation;
use crate::marshal::{self, describe};

/// Host handle to a service object that lives in JavaScript.
///
/// Holds the engine weakly: once the engine is closed every call reports
/// [`BridgeError::Closed`].
#[derive(Clone)]
pub struct InboundCallChannel {
    engine: Weak<EngineState>,
    name: String,
}

impl InboundCallChannel {
    pub(crate) fn new(engine: Weak<EngineState>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
        }
    }

    /// Global property this channel resolves on each call.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Result<Rc<EngineState>> {
        self.engine.upgrade().ok_or(BridgeError::Closed)
    }
}

impl std::fmt::Debug for InboundCallChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCallChannel")
            .field("name", &self.name)
            .field("closed", &(self.engine.strong_count() == 0))
            .finish()
    }
}

impl CallChannel for InboundCallChannel {
    fn service_names_array(&self) -> Result<Vec<String>> {
        let engine = self.engine()?;
        engine.with(|ctx, state| {
            let scope = CallScope::resolve(
                &ctx,
                state.stash(),
                &self.name,
                methods::SERVICE_NAMES_ARRAY,
            )?;
            let value = scope.invoke(Vec::new())?.returned(state.stash())?;
            expect_string_array(&scope, &value)
        })
    }

    fn invoke(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> Result<Vec<String>> {
        let engine = self.engine()?;
        engine.with(|ctx, state| {
            let scope = CallScope::resolve(&ctx, state.stash(), &self.name, methods::INVOKE)?;
            let args = vec![
                marshal::to_js_string(&ctx, instance_name)?,
                marshal::to_js_string(&ctx, function_name)?,
                marshal::to_js_string_array(&ctx, encoded_arguments)?,
            ];
            let value = scope.invoke(args)?.returned(state.stash())?;
            expect_string_array(&scope, &value)
        })
    }

    fn invoke_suspending(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
        callback_name: &str,
    ) -> Result<()> {
        let engine = self.engine()?;
        engine.with(|ctx, state| {
            let scope = CallScope::resolve(
                &ctx,
                state.stash(),
                &self.name,
                methods::INVOKE_SUSPENDING,
            )?;
            let args = vec![
                marshal::to_js_string(&ctx, instance_name)?,
                marshal::to_js_string(&ctx, function_name)?,
                marshal::to_js_string_array(&ctx, encoded_arguments)?,
                marshal::to_js_string(&ctx, callback_name)?,
            ];
            let value = scope.invoke(args)?.returned(state.stash())?;
            if !value.is_undefined() {
                protocol_violation(scope.channel(), scope.method(), "undefined", describe(&value));
            }
            Ok(())
        })
    }

    fn disconnect(&self, instance_name: &str) -> Result<bool> {
        let engine = self.engine()?;
        engine.with(|ctx, state| {
            let scope = CallScope::resolve(&ctx, state.stash(), &self.name, methods::DISCONNECT)?;
            let args = vec![marshal::to_js_string(&ctx, instance_name)?];
            let value = scope.invoke(args)?.returned(state.stash())?;
            if !value.is_bool() {
                protocol_violation(scope.channel(), scope.method(), "boolean", describe(&value));
            }
            marshal::from_js_bool(&value)
        })
    }
}

fn expect_string_array(scope: &CallScope<'_, '_>, value: &Value<'_>) -> Result<Vec<String>> {
    if !value.is_array() {
        protocol_violation(scope.channel(), scope.method(), "array", describe(value));
    }
    marshal::from_js_string_array(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuickJs;

    const CALC: &str = r#"
        var registry = {
            calc: {
                add: function (a, b) { return [String(Number(a) + Number(b))]; },
                div: function (a, b) {
                    if (Number(b) === 0) throw new Error("division by zero");
                    return [String(Number(a) / Number(b))];
                },
                echo: function () { return Array.prototype.slice.call(arguments); },
            },
        };
        var pending = [];
        globalThis.app = {
            serviceNamesArray: function () { return Object.keys(registry); },
            invoke: function (instance, fun, args) {
                var service = registry[instance];
                if (!service) throw new Error("no service " + instance);
                return service[fun].apply(service, args);
            },
            invokeSuspending: function (instance, fun, args, callback) {
                pending.push([instance, fun, args.length, callback]);
            },
            disconnect: function (instance) {
                if (!(instance in registry)) return false;
                delete registry[instance];
                return true;
            },
        };
    "#;

    fn calc_engine() -> (QuickJs, InboundCallChannel) {
        let engine = QuickJs::create().unwrap();
        engine.evaluate(CALC, "calc.js").unwrap();
        let channel = engine.inbound_channel("app").unwrap();
        (engine, channel)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn invoke_returns_callee_result() {
        let (_engine, channel) = calc_engine();
        let result = channel.invoke("calc", "add", &strings(&["2", "3"])).unwrap();
        assert_eq!(result, vec!["5"]);
    }

    #[test]
    fn invoke_preserves_order_and_count() {
        let (_engine, channel) = calc_engine();
        let args = strings(&["c", "a", "b", ""]);
        assert_eq!(channel.invoke("calc", "echo", &args).unwrap(), args);
        assert!(channel.invoke("calc", "echo", &[]).unwrap().is_empty());
    }

    #[test]
    fn thrown_message_is_preserved() {
        let (_engine, channel) = calc_engine();
        let err = channel.invoke("calc", "div", &strings(&["1", "0"])).unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
        assert!(err.as_js().and_then(|e| e.stack()).is_some());
    }

    #[test]
    fn service_names_lists_registry() {
        let (_engine, channel) = calc_engine();
        assert_eq!(channel.service_names_array().unwrap(), vec!["calc"]);
    }

    #[test]
    fn empty_registry_lists_nothing() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate(
                "globalThis.empty = { serviceNamesArray: function () { return []; } };",
                "empty.js",
            )
            .unwrap();
        let channel = engine.inbound_channel("empty").unwrap();
        assert!(channel.service_names_array().unwrap().is_empty());
    }

    #[test]
    fn disconnect_succeeds_once() {
        let (_engine, channel) = calc_engine();
        assert!(channel.disconnect("calc").unwrap());
        assert!(!channel.disconnect("calc").unwrap());
        assert!(channel.service_names_array().unwrap().is_empty());
    }

    #[test]
    fn invoke_suspending_returns_immediately() {
        let (engine, channel) = calc_engine();
        channel
            .invoke_suspending("calc", "add", &[], "tether/host-0")
            .unwrap();
        let recorded = engine.evaluate("JSON.stringify(pending)", "check.js").unwrap();
        assert_eq!(
            recorded,
            crate::JsValue::String(r#"[["calc","add",0,"tether/host-0"]]"#.to_string())
        );
    }

    #[test]
    fn every_method_propagates_throws() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate(
                r#"
                function fail(what) { return function () { throw new Error(what + " failed"); }; }
                globalThis.broken = {
                    serviceNamesArray: fail("list"),
                    invoke: fail("invoke"),
                    invokeSuspending: fail("suspend"),
                    disconnect: fail("disconnect"),
                };
                "#,
                "broken.js",
            )
            .unwrap();
        let channel = engine.inbound_channel("broken").unwrap();

        assert_eq!(channel.service_names_array().unwrap_err().to_string(), "list failed");
        assert_eq!(channel.invoke("a", "b", &[]).unwrap_err().to_string(), "invoke failed");
        assert_eq!(
            channel.invoke_suspending("a", "b", &[], "cb").unwrap_err().to_string(),
            "suspend failed"
        );
        assert_eq!(channel.disconnect("a").unwrap_err().to_string(), "disconnect failed");
    }

    #[test]
    fn missing_method_is_a_type_error() {
        let engine = QuickJs::create().unwrap();
        engine.evaluate("globalThis.partial = {};", "partial.js").unwrap();
        let channel = engine.inbound_channel("partial").unwrap();
        let err = channel.invoke("a", "b", &[]).unwrap_err();
        assert_eq!(err.to_string(), "partial.invoke is not a function");
    }

    #[test]
    fn global_removed_after_lookup_is_reported() {
        let (engine, channel) = calc_engine();
        engine.evaluate("delete globalThis.app;", "remove.js").unwrap();
        let err = channel.service_names_array().unwrap_err();
        assert!(matches!(err, BridgeError::MissingGlobal(ref name) if name == "app"));
    }

    #[test]
    fn closed_engine_reports_closed() {
        let (engine, channel) = calc_engine();
        engine.close();
        assert!(matches!(channel.service_names_array(), Err(BridgeError::Closed)));
        assert!(matches!(channel.invoke("calc", "add", &[]), Err(BridgeError::Closed)));
        assert!(matches!(
            channel.invoke_suspending("calc", "add", &[], "cb"),
            Err(BridgeError::Closed)
        ));
        assert!(matches!(channel.disconnect("calc"), Err(BridgeError::Closed)));
        insta::assert_snapshot!(
            channel.disconnect("calc").unwrap_err(),
            @"QuickJs instance was closed"
        );
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn non_array_result_is_a_protocol_violation() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate("globalThis.odd = { invoke: function () { return 'five'; } };", "odd.js")
            .unwrap();
        let channel = engine.inbound_channel("odd").unwrap();
        let _ = channel.invoke("calc", "add", &[]);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn non_boolean_disconnect_is_a_protocol_violation() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate("globalThis.odd = { disconnect: function () { return 1; } };", "odd.js")
            .unwrap();
        let channel = engine.inbound_channel("odd").unwrap();
        let _ = channel.disconnect("calc");
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn non_undefined_suspending_result_is_a_protocol_violation() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate("globalThis.odd = { invokeSuspending: function () { return 'done'; } };", "odd.js")
            .unwrap();
        let channel = engine.inbound_channel("odd").unwrap();
        let _ = channel.invoke_suspending("calc", "add", &[], "cb");
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn non_array_service_names_is_a_protocol_violation() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate("globalThis.odd = { serviceNamesArray: function () { return 'calc'; } };", "odd.js")
            .unwrap();
        let channel = engine.inbound_channel("odd").unwrap();
        let _ = channel.service_names_array();
    }

    #[test]
    fn throwing_result_element_is_translated() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate(
                r#"
                globalThis.odd = {
                    invoke: function () {
                        var result = ['x'];
                        Object.defineProperty(result, 0, {
                            get: function () { throw new Error("element boom"); },
                        });
                        return result;
                    },
                };
                "#,
                "odd.js",
            )
            .unwrap();
        let channel = engine.inbound_channel("odd").unwrap();
        let err = channel.invoke("calc", "add", &[]).unwrap_err();
        assert_eq!(err.to_string(), "element boom");
        assert!(err.as_js().is_some(), "expected JS exception, got {err:?}");

        // Nothing is left pending for the next call.
        assert_eq!(engine.evaluate("'alive'", "after.js").unwrap(), crate::JsValue::String("alive".to_string()));
    }

    #[test]
    fn non_string_element_is_a_marshal_error() {
        let engine = QuickJs::create().unwrap();
        engine
            .evaluate("globalThis.odd = { invoke: function () { return ['ok', 5]; } };", "odd.js")
            .unwrap();
        let channel = engine.inbound_channel("odd").unwrap();
        let err = channel.invoke("calc", "add", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::Marshal(_)));
    }
}
