use std::rc::Rc;

use crate::channel::CallChannel;
use crate::error::BridgeError;

/// Function a suspending call's callback service exposes for delivering the result.
pub const SUCCESS_FUNCTION: &str = "success";

/// Completion handle for a suspending call arriving from the other side.
///
/// Consumed on completion, so a result is delivered at most once.
pub struct SuspendCallback {
    callback_name: String,
    peer: Rc<dyn CallChannel>,
}

impl SuspendCallback {
    pub(crate) fn new(callback_name: impl Into<String>, peer: Rc<dyn CallChannel>) -> Self {
        Self {
            callback_name: callback_name.into(),
            peer,
        }
    }

    pub fn callback_name(&self) -> &str {
        &self.callback_name
    }

    /// Delivers `encoded_result` by invoking the caller's callback service.
    ///
    /// A closed engine drops the result. So does a busy one: completion must
    /// happen after the suspending call has returned.
    pub fn complete(self, encoded_result: Vec<String>) {
        match self
            .peer
            .invoke(&self.callback_name, SUCCESS_FUNCTION, &encoded_result)
        {
            Ok(_) => {
                tracing::trace!(callback = %self.callback_name, "Completed suspending call");
            }
            Err(BridgeError::Closed) => {
                tracing::debug!(callback = %self.callback_name, "Engine closed before completion");
            }
            Err(BridgeError::Reentrant) => {
                tracing::warn!(
                    callback = %self.callback_name,
                    "Dropping completion delivered while the engine is executing"
                );
            }
            Err(err) => {
                tracing::warn!(
                    callback = %self.callback_name,
                    error = %err,
                    "Completion callback failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for SuspendCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendCallback")
            .field("callback_name", &self.callback_name)
            .finish_non_exhaustive()
    }
}
