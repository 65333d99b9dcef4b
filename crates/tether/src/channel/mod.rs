//! Call channels between the host and the engine.
//!
//! A channel is a named global object that exposes four methods. The same
//! [`CallChannel`] contract is implemented in both directions:
//!
//! - [`InboundCallChannel`]: the object lives in JavaScript and the host calls it.
//! - Outbound: the object lives in the host ([`crate::QuickJs::set_outbound_channel`])
//!   and JavaScript calls it. [`OutboundCallChannel`] is the host-side handle.
//!
//! Every argument and result element is an opaque encoded string.

mod inbound;
mod outbound;
mod scope;

pub use inbound::InboundCallChannel;
pub use outbound::OutboundCallChannel;

pub(crate) use outbound::install;
pub(crate) use scope::resolve_global;

use crate::error::Result;

/// Conventional global name for the JavaScript side of a host/engine pair.
pub const INBOUND_CHANNEL_NAME: &str = "tether_inboundChannel";

/// Conventional global name for the host side of a host/engine pair.
pub const OUTBOUND_CHANNEL_NAME: &str = "tether_outboundChannel";

/// JavaScript method names, fixed by the protocol.
pub mod methods {
    pub const SERVICE_NAMES_ARRAY: &str = "serviceNamesArray";
    pub const INVOKE: &str = "invoke";
    pub const INVOKE_SUSPENDING: &str = "invokeSuspending";
    pub const DISCONNECT: &str = "disconnect";
}

/// The four operations a channel carries, in either direction.
pub trait CallChannel {
    /// Names of the services registered behind this channel.
    fn service_names_array(&self) -> Result<Vec<String>>;

    /// Calls `function_name` on `instance_name` and returns its encoded result.
    fn invoke(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> Result<Vec<String>>;

    /// Starts a suspending call. Returns immediately; the result is delivered
    /// later by invoking `callback_name`'s `success` function on the caller side.
    fn invoke_suspending(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
        callback_name: &str,
    ) -> Result<()>;

    /// Unregisters `instance_name`. Returns false if nothing was registered.
    fn disconnect(&self, instance_name: &str) -> Result<bool>;
}
