//! The host side of a host/engine service pair.
//!
//! An [`Endpoint`] holds named host services and implements [`CallChannel`]
//! for calls arriving from the engine. Calls the host makes into the engine go
//! through its peer channel, normally an [`InboundCallChannel`](crate::InboundCallChannel).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::channel::CallChannel;
use crate::error::{BridgeError, Result};
use crate::listener::{Call, EventListener};
use crate::suspend::{SuspendCallback, SUCCESS_FUNCTION};

/// Prefix of callback services generated for suspending calls made by the host.
pub const CALLBACK_PREFIX: &str = "tether/host-";

/// A named service the engine can call.
pub trait HostService {
    fn call(
        &self,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> anyhow::Result<Vec<String>>;

    /// Starts a suspending call. Exactly one of returning an error or eventually
    /// completing `callback` should happen.
    fn call_suspending(
        &self,
        function_name: &str,
        encoded_arguments: &[String],
        callback: SuspendCallback,
    ) -> anyhow::Result<()> {
        let _ = (encoded_arguments, callback);
        anyhow::bail!("function {function_name} is not suspending")
    }
}

type Registry = RefCell<IndexMap<String, Rc<dyn HostService>>>;

pub struct Endpoint {
    services: Rc<Registry>,
    peer: Rc<dyn CallChannel>,
    listener: Option<Rc<dyn EventListener>>,
    next_callback_id: Cell<u64>,
}

impl Endpoint {
    pub fn new(peer: Rc<dyn CallChannel>) -> Self {
        Self {
            services: Rc::new(RefCell::new(IndexMap::new())),
            peer,
            listener: None,
            next_callback_id: Cell::new(0),
        }
    }

    pub fn with_listener(mut self, listener: Rc<dyn EventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Registers `service` under `name`, replacing any service already bound there.
    pub fn bind(&self, name: impl Into<String>, service: Rc<dyn HostService>) {
        let name = name.into();
        if let Some(listener) = &self.listener {
            listener.bind_service(&name);
        }
        self.services.borrow_mut().insert(name, service);
    }

    pub fn remove(&self, name: &str) -> Option<Rc<dyn HostService>> {
        let removed = self.services.borrow_mut().shift_remove(name);
        if removed.is_some()
            && let Some(listener) = &self.listener
        {
            listener.remove_service(name);
        }
        removed
    }

    /// Host services, in registration order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.borrow().keys().cloned().collect()
    }

    /// Services registered on the engine side.
    pub fn client_names(&self) -> Result<Vec<String>> {
        self.peer.service_names_array()
    }

    /// Calls an engine-side service.
    pub fn call(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> Result<Vec<String>> {
        self.peer.invoke(instance_name, function_name, encoded_arguments)
    }

    /// Starts a suspending call on an engine-side service.
    ///
    /// Returns once the call has started. `on_complete` runs when the engine
    /// invokes the generated callback service, and never more than once.
    pub fn call_suspending(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
        on_complete: impl FnOnce(Vec<String>) + 'static,
    ) -> Result<()> {
        let callback_name = self.next_callback_name();
        let completion = Completion {
            name: callback_name.clone(),
            services: Rc::downgrade(&self.services),
            on_complete: RefCell::new(Some(Box::new(on_complete))),
        };
        self.services
            .borrow_mut()
            .insert(callback_name.clone(), Rc::new(completion));

        let started = self.peer.invoke_suspending(
            instance_name,
            function_name,
            encoded_arguments,
            &callback_name,
        );
        if started.is_err() {
            self.services.borrow_mut().shift_remove(&callback_name);
        }
        started
    }

    /// Asks the engine side to unregister `instance_name`.
    pub fn disconnect_client(&self, instance_name: &str) -> Result<bool> {
        self.peer.disconnect(instance_name)
    }

    fn next_callback_name(&self) -> String {
        let id = self.next_callback_id.get();
        self.next_callback_id.set(id + 1);
        format!("{CALLBACK_PREFIX}{id}")
    }

    fn service(&self, instance_name: &str) -> Result<Rc<dyn HostService>> {
        // Cloned out so services may bind or remove while running.
        self.services
            .borrow()
            .get(instance_name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownService(instance_name.to_string()))
    }

    fn observe<R>(
        &self,
        call: Call<'_>,
        run: impl FnOnce() -> Result<R>,
        output: impl Fn(&R) -> &[String],
    ) -> Result<R> {
        let Some(listener) = &self.listener else {
            return run();
        };
        listener.call_start(&call);
        let result = run();
        listener.call_end(&call, result.as_ref().map(|value| output(value)));
        result
    }
}

impl CallChannel for Endpoint {
    fn service_names_array(&self) -> Result<Vec<String>> {
        Ok(self.service_names())
    }

    fn invoke(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> Result<Vec<String>> {
        let service = self.service(instance_name)?;
        let call = Call {
            instance_name,
            function_name,
            encoded_arguments,
            suspending: false,
        };
        self.observe(
            call,
            || Ok(service.call(function_name, encoded_arguments)?),
            |values| values.as_slice(),
        )
    }

    fn invoke_suspending(
        &self,
        instance_name: &str,
        function_name: &str,
        encoded_arguments: &[String],
        callback_name: &str,
    ) -> Result<()> {
        let service = self.service(instance_name)?;
        let callback = SuspendCallback::new(callback_name, self.peer.clone());
        let call = Call {
            instance_name,
            function_name,
            encoded_arguments,
            suspending: true,
        };
        self.observe(
            call,
            || Ok(service.call_suspending(function_name, encoded_arguments, callback)?),
            |_| &[],
        )
    }

    fn disconnect(&self, instance_name: &str) -> Result<bool> {
        Ok(self.remove(instance_name).is_some())
    }
}

/// One-shot service receiving the result of a host-initiated suspending call.
struct Completion {
    name: String,
    services: Weak<Registry>,
    on_complete: RefCell<Option<Box<dyn FnOnce(Vec<String>)>>>,
}

impl HostService for Completion {
    fn call(
        &self,
        function_name: &str,
        encoded_arguments: &[String],
    ) -> anyhow::Result<Vec<String>> {
        if function_name != SUCCESS_FUNCTION {
            anyhow::bail!("unexpected callback function {function_name}");
        }
        if let Some(services) = self.services.upgrade() {
            services.borrow_mut().shift_remove(&self.name);
        }
        let on_complete = self
            .on_complete
            .borrow_mut()
            .take()
            .ok_or_else(|| anyhow::anyhow!("callback {} already completed", self.name))?;
        on_complete(encoded_arguments.to_vec());
        Ok(Vec::new())
    }
}
