//! Error types for bridge calls.

use crate::exception::JsException;
use crate::marshal::MarshalError;

/// Errors surfaced to host callers of the bridge.
///
/// Protocol violations (a counterpart returning a shape the protocol never
/// promises) are deliberately absent: those panic.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The engine behind a channel was closed.
    #[error("QuickJs instance was closed")]
    Closed,

    /// A call tried to enter the engine while another call was still running on it.
    #[error("QuickJs instance is already executing a call")]
    Reentrant,

    #[error("A global JavaScript object called {0} was not found")]
    MissingGlobal(String),

    #[error("JavaScript global called {0} is not an object")]
    NotAnObject(String),

    #[error("A global object called {0} already exists")]
    GlobalExists(String),

    /// No host service is bound under this instance name.
    #[error("no service bound as {0}")]
    UnknownService(String),

    /// JavaScript threw while handling the call. Displays exactly the thrown message.
    #[error(transparent)]
    Js(#[from] JsException),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// A host service failed.
    #[error(transparent)]
    Service(#[from] anyhow::Error),

    /// Engine failure that is not a thrown JavaScript value (allocation, bytecode, etc).
    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),
}

impl BridgeError {
    /// Returns the translated JavaScript exception, if this is one.
    pub fn as_js(&self) -> Option<&JsException> {
        match self {
            Self::Js(exception) => Some(exception),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
