//! tether: a bidirectional call bridge between a Rust host and an embedded QuickJS engine.
//!
//! Both sides expose named services through a [`CallChannel`], a global
//! object with four methods (`serviceNamesArray`, `invoke`,
//! `invokeSuspending`, `disconnect`). Arguments and results are arrays of
//! opaque encoded strings; JavaScript exceptions come back as
//! [`BridgeError::Js`].
//!
//! ```no_run
//! use std::rc::Rc;
//! use tether::{Endpoint, QuickJs, INBOUND_CHANNEL_NAME, OUTBOUND_CHANNEL_NAME};
//!
//! # fn main() -> tether::Result<()> {
//! let engine = QuickJs::create()?;
//! let endpoint = Rc::new(Endpoint::new(Rc::new(
//!     engine.deferred_inbound_channel(INBOUND_CHANNEL_NAME),
//! )));
//! engine.set_outbound_channel(OUTBOUND_CHANNEL_NAME, endpoint.clone())?;
//! engine.evaluate("/* define tether_inboundChannel */", "app.js")?;
//! let _names = endpoint.client_names()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod exception;
pub mod listener;
pub mod marshal;
pub mod suspend;

pub use channel::{
    CallChannel, InboundCallChannel, OutboundCallChannel, INBOUND_CHANNEL_NAME,
    OUTBOUND_CHANNEL_NAME,
};
pub use config::{ConfigError, EngineConfig};
pub use endpoint::{Endpoint, HostService};
pub use engine::{Bytecode, InterruptHandler, MemoryUsage, QuickJs};
pub use error::{BridgeError, Result};
pub use exception::JsException;
pub use listener::{Call, EventListener, TracingListener};
pub use marshal::{JsValue, MarshalError};
pub use suspend::SuspendCallback;
