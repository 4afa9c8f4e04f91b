//! The RPC engine over one pair of transport directions.
//!
//! The owner creates both directions, the guest attaches to them. Incoming
//! messages are decoded on the inbound reader thread; method invocations run
//! on the tokio runtime the channel was opened with, and every failure there
//! travels back to the caller as an exception reply.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use fastipc_frame::{decode_message, Domain, Message, MethodRef, ProxyRef, TypeRef, WireValue};
use fastipc_transport::{InboundTransport, Lifecycle, OutboundTransport, TransportError};
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::directory::Directory;
use crate::error::{ChannelError, Fault, Result};
use crate::ids::{MessageNumbers, ObjectIdAllocator};
use crate::pending::{Pending, Reply};
use crate::proxy::{DisconnectCallback, ProxyCore, RemoteHandle};
use crate::registry::{Instance, MethodKey, Outcome, Param, Registry, TypeKey};
use crate::serializer::{JsonSerializer, ValueSerializer};
use crate::value::{Args, Value};

/// A connection to the peer process sharing base name `name`.
///
/// Dropping the channel disposes it.
pub struct Channel {
    shared: Arc<ChannelShared>,
}

/// Options for opening a [`Channel`].
pub struct ChannelBuilder {
    name: String,
    domain: Domain,
    registry: Arc<Registry>,
    config: ChannelConfig,
    runtime: Option<Handle>,
    object_ids: Option<Arc<ObjectIdAllocator>>,
    serializer: Option<Arc<dyn ValueSerializer>>,
}

impl ChannelBuilder {
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Specialize the channel for `module`.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.config.module = Some(module.into());
        self
    }

    /// Dispatch incoming calls on `runtime` instead of the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Share an object-id allocator with other channels of this process.
    pub fn with_object_ids(mut self, object_ids: Arc<ObjectIdAllocator>) -> Self {
        self.object_ids = Some(object_ids);
        self
    }

    /// Replace the JSON serializer used for generic values and faults.
    pub fn with_serializer(mut self, serializer: Arc<dyn ValueSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Create (owner) or attach to (guest) both directions and start reading.
    pub fn open(self) -> Result<Channel> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ChannelError::NoRuntime)?,
        };
        let transport = self.config.transport.clone();
        let outbound_name = format!("{}{}", self.name, self.domain.outbound_suffix());
        let inbound_name = format!("{}{}", self.name, self.domain.inbound_suffix());

        let outbound = if self.domain.is_owner() {
            OutboundTransport::create(&outbound_name, transport.clone())?
        } else {
            OutboundTransport::open(&outbound_name, transport.clone())?
        };

        let shared = Arc::new_cyclic(|me| ChannelShared {
            name: self.name,
            domain: self.domain,
            registry: self.registry,
            config: self.config,
            runtime,
            serializer: self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer)),
            object_ids: self.object_ids.unwrap_or_else(ObjectIdAllocator::global),
            numbers: MessageNumbers::new(),
            outbound,
            inbound: OnceLock::new(),
            lifecycle: Lifecycle::new(),
            directory: Directory::new(),
            pending: Pending::new(),
            received: AtomicU64::new(0),
            me: Weak::clone(me),
        });

        let weak = Arc::downgrade(&shared);
        let on_failure = Arc::downgrade(&shared);
        let inbound = InboundTransport::spawn_with_failure(
            &inbound_name,
            shared.domain.is_owner(),
            transport,
            move |frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_frame(frame);
                }
            },
            move |err| {
                if let Some(shared) = on_failure.upgrade() {
                    shared.on_transport_failure(&err);
                }
            },
        )?;
        // Only ever set here.
        let _ = shared.inbound.set(inbound);

        info!(channel = %shared.name, domain = %shared.domain, "channel open");
        Ok(Channel { shared })
    }
}

impl Channel {
    /// Open a channel that dispatches on the current tokio runtime.
    pub fn open(
        name: &str,
        domain: Domain,
        registry: Arc<Registry>,
        config: ChannelConfig,
    ) -> Result<Self> {
        Self::builder(name, domain, registry)
            .with_config(config)
            .open()
    }

    pub fn builder(name: &str, domain: Domain, registry: Arc<Registry>) -> ChannelBuilder {
        ChannelBuilder {
            name: name.to_string(),
            domain,
            registry,
            config: ChannelConfig::default(),
            runtime: None,
            object_ids: None,
            serializer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn domain(&self) -> Domain {
        self.shared.domain
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Ask the peer to create an instance of `ty` and return a handle to it.
    pub async fn activate(&self, ty: TypeKey) -> Result<RemoteHandle> {
        self.shared.activate(ty).await
    }

    /// Call `method` on the peer-hosted object `object_id`.
    pub async fn call(&self, object_id: i32, method: MethodKey, args: Vec<Value>) -> Result<Value> {
        self.shared.call(object_id, method, args, None).await
    }

    /// Like [`call`](Self::call) with an explicit deadline.
    pub async fn call_with_deadline(
        &self,
        object_id: i32,
        method: MethodKey,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        self.shared
            .call(object_id, method, args, Some(deadline))
            .await
    }

    /// Object id `handle` is known by on this channel, registering a local
    /// object if needed.
    pub fn register(&self, handle: &RemoteHandle) -> Result<i32> {
        self.shared.identify(handle).map(|(_, object_id, _)| object_id)
    }

    /// Messages received so far, including undecodable ones.
    pub fn messages_received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Local objects currently reachable by the peer.
    pub fn hosted_objects(&self) -> usize {
        self.shared.directory.hosted()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lifecycle.is_released()
    }

    /// Stop both directions, abandon waiting calls and release every hosted
    /// object. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("domain", &self.shared.domain)
            .field("module", &self.shared.config.module)
            .field("disposed", &self.is_disposed())
            .field("pending_calls", &self.pending_calls())
            .field("hosted_objects", &self.hosted_objects())
            .finish()
    }
}

pub(crate) struct ChannelShared {
    name: String,
    domain: Domain,
    registry: Arc<Registry>,
    config: ChannelConfig,
    runtime: Handle,
    serializer: Arc<dyn ValueSerializer>,
    object_ids: Arc<ObjectIdAllocator>,
    numbers: MessageNumbers,
    outbound: OutboundTransport,
    inbound: OnceLock<InboundTransport>,
    lifecycle: Lifecycle,
    directory: Directory,
    pending: Pending,
    received: AtomicU64,
    me: Weak<ChannelShared>,
}

impl ChannelShared {
    fn module(&self) -> Option<&str> {
        self.config.module.as_deref()
    }

    async fn activate(&self, ty: TypeKey) -> Result<RemoteHandle> {
        let type_ref = self.registry.encode_type_ref(ty, self.module())?;
        let number = self.numbers.next();
        let reply = self.pending.insert(number, Param::Any);
        let message = Message::Activation { number, type_ref };
        if let Err(err) = self.send(&message) {
            self.pending.remove(number);
            return Err(err);
        }
        let value = self.await_reply(number, reply, self.config.call_timeout).await?;
        value.into_handle().ok_or_else(|| {
            ChannelError::Activation(format!(
                "peer did not return a reference to {}",
                self.registry.type_name(ty).unwrap_or("an unregistered type")
            ))
        })
    }

    pub(crate) async fn call(
        &self,
        object_id: i32,
        method: MethodKey,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let info = self.registry.method(method)?;
        let method_ref = self.registry.encode_method_ref(method, self.module())?;
        let args = args
            .into_iter()
            .map(|value| self.encode_value(value))
            .collect::<Result<Vec<_>>>()?;

        let number = self.numbers.next();
        let reply = self.pending.insert(number, info.returns());
        let message = Message::MethodCall {
            number,
            object_id,
            await_result: info.is_async(),
            method: method_ref,
            args,
        };
        if let Err(err) = self.send(&message) {
            self.pending.remove(number);
            return Err(err);
        }
        trace!(
            channel = %self.name,
            message_number = number,
            object_id,
            method = info.name(),
            "call sent"
        );
        self.await_reply(number, reply, deadline.or(self.config.call_timeout))
            .await
    }

    async fn await_reply(
        &self,
        number: i32,
        reply: Reply,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(number);
                    debug!(channel = %self.name, message_number = number, "call timed out");
                    return Err(ChannelError::Timeout(limit));
                }
            },
            None => reply.await,
        };
        received.unwrap_or(Err(ChannelError::ChannelClosed))
    }

    pub(crate) fn send_deactivation(&self, object_id: i32) -> Result<()> {
        debug!(channel = %self.name, object_id, "releasing remote object");
        self.send(&Message::Deactivation { object_id })
    }

    pub(crate) fn forget_remote(&self, object_id: i32, core: &ProxyCore) {
        self.directory.forget_remote(object_id, core);
    }

    fn send(&self, message: &Message) -> Result<()> {
        let _guard = self
            .lifecycle
            .enter()
            .ok_or(ChannelError::ChannelClosed)?;
        let frame = message.to_bytes()?;
        self.outbound.write(&frame).map_err(|err| match err {
            TransportError::Disposed => ChannelError::ChannelClosed,
            other => other.into(),
        })
    }

    fn on_frame(self: &Arc<Self>, frame: Bytes) {
        let Some(_guard) = self.lifecycle.enter() else {
            return;
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        let message = match decode_message(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(channel = %self.name, size = frame.len(), error = %err, "dropping undecodable message");
                return;
            }
        };
        trace!(channel = %self.name, kind = ?message.kind(), message_number = ?message.number(), "message received");

        match message {
            Message::Activation { number, type_ref } => {
                let shared = Arc::clone(self);
                self.runtime.spawn(async move {
                    let reply = shared.serve_activation(&type_ref);
                    shared.reply(number, reply);
                });
            }
            Message::Deactivation { object_id } => self.serve_deactivation(object_id),
            Message::MethodCall {
                number,
                object_id,
                await_result,
                method,
                args,
            } => self.serve_call(number, object_id, await_result, &method, args),
            Message::ReturnValue { number, value } => {
                self.pending
                    .complete(number, |expects| self.decode_value(value, expects));
            }
            Message::ReturnException { number, fault } => {
                let err = self.decode_fault(&fault);
                self.pending.complete(number, |_| Err(err));
            }
        }
    }

    fn serve_activation(&self, type_ref: &TypeRef) -> Result<WireValue> {
        let ty = self.registry.decode_type_ref(type_ref, self.module())?;
        let instance = self.registry.activate(ty)?;
        let core = ProxyCore::local(Arc::clone(&self.registry), Arc::clone(&instance), ty);
        let object_id = self.register_core(&core, &instance);
        let proxy = self.proxy_ref(ty, ty, object_id, self.domain)?;
        debug!(channel = %self.name, object_id, type_name = self.registry.type_name(ty)?, "activated");
        Ok(WireValue::Proxy(proxy))
    }

    fn serve_deactivation(&self, object_id: i32) {
        match self.directory.unregister(object_id) {
            Some(core) => {
                debug!(channel = %self.name, object_id, "peer released object");
                core.disconnect();
            }
            None => debug!(channel = %self.name, object_id, "release of unknown object"),
        }
    }

    fn serve_call(
        self: &Arc<Self>,
        number: i32,
        object_id: i32,
        await_result: bool,
        method: &MethodRef,
        args: Vec<WireValue>,
    ) {
        let prepared = self.prepare_call(object_id, method, args);
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = match prepared {
                Ok((instance, method, args)) => {
                    shared.invoke(instance, method, args, await_result).await
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(value) => {
                    // References in `value` stay alive until their reply
                    // is written.
                    let reply = shared.encode_value(value.clone());
                    shared.reply(number, reply);
                    drop(value);
                }
                Err(err) => shared.reply(number, Err(err)),
            }
        });
    }

    /// Resolve target, method and arguments while still on the reader thread
    /// so references are decoded in message order.
    fn prepare_call(
        &self,
        object_id: i32,
        method: &MethodRef,
        args: Vec<WireValue>,
    ) -> Result<(Instance, MethodKey, Args)> {
        let (instance, actual) = self
            .directory
            .lookup(object_id)
            .and_then(|core| core.local_target())
            .ok_or_else(|| ChannelError::DisposedObject(format!("object {object_id}")))?;

        let method = self.registry.decode_method_ref(method, self.module())?;
        let info = self.registry.method(method)?;
        if !self.registry.is_assignable(actual, info.declaring_type()) {
            return Err(ChannelError::UnknownMethod(format!(
                "{} is not a member of {}",
                info.name(),
                self.registry.type_name(actual)?
            )));
        }
        if args.len() != info.params().len() {
            return Err(ChannelError::InvalidArgument(format!(
                "{} expects {} arguments, got {}",
                info.name(),
                info.params().len(),
                args.len()
            )));
        }

        let args = args
            .into_iter()
            .zip(info.params())
            .map(|(value, param)| self.decode_value(value, *param))
            .collect::<Result<Args>>()?;
        Ok((instance, method, args))
    }

    async fn invoke(
        &self,
        instance: Instance,
        method: MethodKey,
        args: Args,
        await_result: bool,
    ) -> Result<Value> {
        let registry = Arc::clone(&self.registry);
        let run = async move {
            match registry.invoke(method, &instance, args) {
                Ok(Outcome::Ready(value)) => Ok(value),
                Ok(Outcome::Pending(future)) => {
                    if !await_result {
                        if let Ok(info) = registry.method(method) {
                            debug!(method = info.name(), "awaiting asynchronous result");
                        }
                    }
                    future.await
                }
                Err(err) => Err(err),
            }
        };
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "method panicked".to_string());
                warn!(channel = %self.name, error = %message, "method panicked");
                Err(ChannelError::Application(message))
            }
        }
    }

    fn reply(&self, number: i32, result: Result<WireValue>) {
        let message = match result {
            Ok(value) => Message::ReturnValue { number, value },
            Err(err) => {
                debug!(channel = %self.name, message_number = number, error = %err, "call failed");
                match self.encode_fault(&err) {
                    Ok(fault) => Message::ReturnException { number, fault },
                    Err(err) => {
                        warn!(channel = %self.name, message_number = number, error = %err, "fault not serializable");
                        return;
                    }
                }
            }
        };
        if let Err(err) = self.send(&message) {
            debug!(channel = %self.name, message_number = number, error = %err, "reply not delivered");
        }
    }

    fn encode_fault(&self, err: &ChannelError) -> Result<Bytes> {
        let json = serde_json::to_value(Fault::from(err))?;
        Ok(Bytes::from(self.serializer.serialize(&json)?))
    }

    fn decode_fault(&self, payload: &[u8]) -> ChannelError {
        let fault = self
            .serializer
            .deserialize(payload)
            .and_then(|json| Ok(serde_json::from_value::<Fault>(json)?));
        match fault {
            Ok(fault) => ChannelError::Remote(fault),
            Err(err) => ChannelError::Serialization(format!("undecodable fault: {err}")),
        }
    }

    fn encode_value(&self, value: Value) -> Result<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(b),
            Value::Byte(b) => WireValue::Byte(b),
            Value::Char(c) => WireValue::Char(c),
            Value::String(s) => WireValue::String(s),
            Value::Int32(i) => WireValue::Int32(i),
            Value::Handle(handle) => self.encode_handle(&handle)?,
            Value::Instance(instance) => {
                self.encode_handle(&RemoteHandle::new(&self.registry, instance)?)?
            }
            Value::Other(json) => WireValue::Other(Bytes::from(self.serializer.serialize(&json)?)),
        })
    }

    fn encode_handle(&self, handle: &RemoteHandle) -> Result<WireValue> {
        let (actual, object_id, domain) = self.identify(handle)?;
        Ok(WireValue::Proxy(self.proxy_ref(
            handle.declared_type(),
            actual,
            object_id,
            domain,
        )?))
    }

    /// Actual type, object id and owning domain of `handle` on this channel.
    fn identify(&self, handle: &RemoteHandle) -> Result<(TypeKey, i32, Domain)> {
        let core = handle.core();
        if let Some((instance, actual)) = core.local_target() {
            let object_id = self.register_core(core, &instance);
            return Ok((actual, object_id, self.domain));
        }
        if let Some((channel, object_id, domain, actual)) = core.remote_target() {
            if !std::ptr::eq(channel.as_ptr(), self.me.as_ptr()) {
                return Err(ChannelError::Serialization(format!(
                    "object {object_id} belongs to another channel"
                )));
            }
            return Ok((actual, object_id, domain));
        }
        Err(ChannelError::Disconnected)
    }

    /// Register a locally hosted object, coalescing by instance.
    fn register_core(&self, core: &Arc<ProxyCore>, instance: &Instance) -> i32 {
        let (object_id, fresh) =
            self.directory
                .register(core, instance, || self.object_ids.allocate());
        let callback = fresh.then(|| {
            let channel = Weak::clone(&self.me);
            let callback: DisconnectCallback = Box::new(move || {
                if let Some(channel) = channel.upgrade() {
                    drop(channel.directory.unregister(object_id));
                }
            });
            callback
        });
        if fresh {
            debug!(channel = %self.name, object_id, "registered local object");
        }
        core.bind(object_id, self.domain, callback);
        object_id
    }

    fn proxy_ref(
        &self,
        declared: TypeKey,
        actual: TypeKey,
        object_id: i32,
        domain: Domain,
    ) -> Result<ProxyRef> {
        Ok(ProxyRef {
            declared: self.registry.encode_type_ref(declared, self.module())?,
            actual: self.registry.encode_type_ref(actual, self.module())?,
            object_id,
            domain,
        })
    }

    fn decode_value(&self, value: WireValue, expects: Param) -> Result<Value> {
        Ok(match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Byte(b) => Value::Byte(b),
            WireValue::Char(c) => Value::Char(c),
            WireValue::String(s) => Value::String(s),
            WireValue::Int32(i) => Value::Int32(i),
            WireValue::Proxy(proxy) => self.resolve_proxy(&proxy, expects)?,
            WireValue::Other(payload) => Value::Other(self.serializer.deserialize(&payload)?),
        })
    }

    fn resolve_proxy(&self, proxy: &ProxyRef, expects: Param) -> Result<Value> {
        let declared = self.registry.decode_type_ref(&proxy.declared, self.module())?;
        let actual = self.registry.decode_type_ref(&proxy.actual, self.module())?;

        if proxy.domain == self.domain {
            let core = self
                .directory
                .lookup(proxy.object_id)
                .ok_or_else(|| ChannelError::DisposedObject(format!("object {}", proxy.object_id)))?;
            if let Param::Object(expected) = expects {
                if let Some((instance, actual)) = core.local_target() {
                    if self.registry.is_assignable(actual, expected) {
                        return Ok(Value::Instance(instance));
                    }
                }
            }
            return Ok(Value::Handle(RemoteHandle::from_core(core, declared)));
        }

        let core = self.directory.remote(proxy.object_id, || {
            ProxyCore::remote(
                Arc::clone(&self.registry),
                Weak::clone(&self.me),
                proxy.object_id,
                proxy.domain,
                actual,
            )
        });
        Ok(Value::Handle(RemoteHandle::from_core(core, declared)))
    }

    /// Reading stopped for good: no reply can arrive, so fail the waiting
    /// calls and close the channel.
    fn on_transport_failure(&self, err: &TransportError) {
        let reason = err.to_string();
        let failed = self
            .pending
            .fail_all(|| ChannelError::TransportFailed(reason.clone()));
        error!(channel = %self.name, error = %reason, failed, "inbound transport failed");
        self.dispose();
    }

    fn dispose(&self) {
        if !self.lifecycle.release() {
            return;
        }
        if let Some(inbound) = self.inbound.get() {
            inbound.dispose();
        }
        self.outbound.dispose();

        let abandoned = self.pending.clear();
        let hosted = self.directory.drain();
        let released = hosted.len();
        for core in hosted {
            core.disconnect();
        }
        info!(
            channel = %self.name,
            domain = %self.domain,
            abandoned,
            released,
            received = self.received.load(Ordering::Relaxed),
            "channel disposed"
        );
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        self.dispose();
    }
}
