//! Observational hooks for an [`Endpoint`](crate::Endpoint).

use crate::error::BridgeError;

/// A host service call, as seen by an [`EventListener`].
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    pub instance_name: &'a str,
    pub function_name: &'a str,
    pub encoded_arguments: &'a [String],
    pub suspending: bool,
}

/// Receives endpoint events. Every method defaults to doing nothing.
///
/// Listeners observe; they cannot change the outcome of a call.
pub trait EventListener {
    /// A host service was bound under `name`.
    fn bind_service(&self, _name: &str) {}

    /// A host service was removed, either by the host or by a disconnect from the engine.
    fn remove_service(&self, _name: &str) {}

    fn call_start(&self, _call: &Call<'_>) {}

    /// `result` is empty for a suspending call that started successfully.
    fn call_end(&self, _call: &Call<'_>, _result: Result<&[String], &BridgeError>) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn bind_service(&self, name: &str) {
        tracing::debug!(service = %name, "Bound host service");
    }

    fn remove_service(&self, name: &str) {
        tracing::debug!(service = %name, "Removed host service");
    }

    fn call_start(&self, call: &Call<'_>) {
        tracing::debug!(
            service = %call.instance_name,
            function = %call.function_name,
            args = call.encoded_arguments.len(),
            suspending = call.suspending,
            "Call started"
        );
    }

    fn call_end(&self, call: &Call<'_>, result: Result<&[String], &BridgeError>) {
        match result {
            Ok(values) => tracing::debug!(
                service = %call.instance_name,
                function = %call.function_name,
                results = values.len(),
                "Call finished"
            ),
            Err(err) => tracing::debug!(
                service = %call.instance_name,
                function = %call.function_name,
                error = %err,
                "Call failed"
            ),
        }
    }
}
