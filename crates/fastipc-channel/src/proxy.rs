//! Handles to objects that may live in either process.
//!
//! A [`RemoteHandle`] is a cheap clone of a shared identity (`ProxyCore`).
//! The identity is either a local instance, possibly registered on one or
//! more channels, or a reference to an object the peer hosts. When the last
//! clone of a remote identity goes away the peer is told to release the
//! object.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use fastipc_frame::Domain;
use tracing::debug;

use crate::channel::ChannelShared;
use crate::error::{ChannelError, Result};
use crate::registry::{Instance, MethodKey, MethodKind, Outcome, Param, Registry, TypeKey};
use crate::value::{Args, Value};

pub(crate) type DisconnectCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy)]
struct Binding {
    object_id: i32,
    domain: Domain,
}

enum Target {
    Local {
        instance: Instance,
        actual: TypeKey,
        /// Latest channel registration, if any.
        binding: Option<Binding>,
    },
    Remote {
        channel: Weak<ChannelShared>,
        object_id: i32,
        domain: Domain,
        actual: TypeKey,
    },
    Disconnected,
}

pub(crate) struct ProxyCore {
    registry: Arc<Registry>,
    target: Mutex<Target>,
    on_disconnect: Mutex<Vec<DisconnectCallback>>,
}

/// Where a call on a handle goes.
pub(crate) enum Route {
    Local(Instance, TypeKey),
    Remote(Weak<ChannelShared>, i32),
}

impl ProxyCore {
    pub(crate) fn local(registry: Arc<Registry>, instance: Instance, actual: TypeKey) -> Arc<Self> {
        Arc::new(Self {
            registry,
            target: Mutex::new(Target::Local {
                instance,
                actual,
                binding: None,
            }),
            on_disconnect: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn remote(
        registry: Arc<Registry>,
        channel: Weak<ChannelShared>,
        object_id: i32,
        domain: Domain,
        actual: TypeKey,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            target: Mutex::new(Target::Remote {
                channel,
                object_id,
                domain,
                actual,
            }),
            on_disconnect: Mutex::new(Vec::new()),
        })
    }

    /// Record a channel registration, replacing any earlier one, and, for
    /// the registering core, the callback undoing it.
    pub(crate) fn bind(
        &self,
        object_id: i32,
        domain: Domain,
        on_disconnect: Option<DisconnectCallback>,
    ) {
        if let Target::Local { binding, .. } = &mut *self.lock_target() {
            *binding = Some(Binding { object_id, domain });
        }
        if let Some(callback) = on_disconnect {
            self.on_disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(callback);
        }
    }

    pub(crate) fn route(&self) -> Result<Route> {
        match &*self.lock_target() {
            Target::Local {
                instance, actual, ..
            } => Ok(Route::Local(Arc::clone(instance), *actual)),
            Target::Remote {
                channel, object_id, ..
            } => Ok(Route::Remote(Weak::clone(channel), *object_id)),
            Target::Disconnected => Err(ChannelError::Disconnected),
        }
    }

    /// Local instance and its type, if this identity is hosted here.
    pub(crate) fn local_target(&self) -> Option<(Instance, TypeKey)> {
        match &*self.lock_target() {
            Target::Local {
                instance, actual, ..
            } => Some((Arc::clone(instance), *actual)),
            _ => None,
        }
    }

    /// Peer-side identity of a remote object.
    pub(crate) fn remote_target(&self) -> Option<(Weak<ChannelShared>, i32, Domain, TypeKey)> {
        match &*self.lock_target() {
            Target::Remote {
                channel,
                object_id,
                domain,
                actual,
            } => Some((Weak::clone(channel), *object_id, *domain, *actual)),
            _ => None,
        }
    }

    fn actual_type(&self) -> Option<TypeKey> {
        match &*self.lock_target() {
            Target::Local { actual, .. } | Target::Remote { actual, .. } => Some(*actual),
            Target::Disconnected => None,
        }
    }

    fn is_disconnected(&self) -> bool {
        matches!(*self.lock_target(), Target::Disconnected)
    }

    /// Enter the terminal state. Only the first call has any effect.
    pub(crate) fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.lock_target(), Target::Disconnected);
        if matches!(previous, Target::Disconnected) {
            return;
        }

        let callbacks = std::mem::take(
            &mut *self
                .on_disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback();
        }

        if let Target::Remote {
            channel, object_id, ..
        } = &previous
        {
            if let Some(channel) = channel.upgrade() {
                channel.forget_remote(*object_id, self);
                if let Err(err) = channel.send_deactivation(*object_id) {
                    debug!(object_id, error = %err, "deactivation not delivered");
                }
            }
        }
    }

    fn lock_target(&self) -> MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A call against a handle: one method invocation or one property read,
/// with arguments already evaluated.
#[derive(Debug, Clone)]
pub enum CallSpec {
    Method { method: MethodKey, args: Vec<Value> },
    Property { method: MethodKey },
}

impl CallSpec {
    pub fn method(method: MethodKey, args: impl IntoIterator<Item = Value>) -> Self {
        Self::Method {
            method,
            args: args.into_iter().collect(),
        }
    }

    pub fn property(method: MethodKey) -> Self {
        Self::Property { method }
    }

    /// Check the shape against the registered member.
    pub(crate) fn resolve(self, registry: &Registry) -> Result<(MethodKey, Vec<Value>)> {
        let (method, args, expected) = match self {
            Self::Method { method, args } => (method, args, MethodKind::Method),
            Self::Property { method } => (method, Vec::new(), MethodKind::Property),
        };
        let info = registry.method(method)?;
        if info.kind() != expected {
            return Err(ChannelError::Serialization(format!(
                "unsupported call shape: {} is a {:?}, not a {:?}",
                info.name(),
                info.kind(),
                expected
            )));
        }
        Ok((method, args))
    }
}

/// A reference to an object that may be hosted by this process or the peer.
#[derive(Clone)]
pub struct RemoteHandle {
    core: Arc<ProxyCore>,
    declared: TypeKey,
}

impl RemoteHandle {
    /// Wrap a local instance. It is registered with a channel the first time
    /// it is sent across one.
    pub fn new(registry: &Arc<Registry>, instance: Instance) -> Result<Self> {
        let actual = registry.type_of_instance(&instance).ok_or_else(|| {
            ChannelError::UnknownType("instance of an unregistered type".to_string())
        })?;
        Ok(Self {
            core: ProxyCore::local(Arc::clone(registry), instance, actual),
            declared: actual,
        })
    }

    /// Wrap a new local object.
    pub fn from_value<T: Any + Send + Sync>(registry: &Arc<Registry>, value: T) -> Result<Self> {
        Self::new(registry, Arc::new(value))
    }

    pub(crate) fn from_core(core: Arc<ProxyCore>, declared: TypeKey) -> Self {
        Self { core, declared }
    }

    pub(crate) fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.core.registry
    }

    pub fn is_local(&self) -> bool {
        self.core.local_target().is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.core.is_disconnected()
    }

    /// Object id on the owning side, once the object has crossed a channel.
    pub fn object_id(&self) -> Option<i32> {
        match &*self.core.lock_target() {
            Target::Local { binding, .. } => binding.map(|b| b.object_id),
            Target::Remote { object_id, .. } => Some(*object_id),
            Target::Disconnected => None,
        }
    }

    /// Domain hosting the real instance, once known.
    pub fn domain(&self) -> Option<Domain> {
        match &*self.core.lock_target() {
            Target::Local { binding, .. } => binding.map(|b| b.domain),
            Target::Remote { domain, .. } => Some(*domain),
            Target::Disconnected => None,
        }
    }

    pub fn declared_type(&self) -> TypeKey {
        self.declared
    }

    /// Runtime type of the instance; `None` once disconnected.
    pub fn actual_type(&self) -> Option<TypeKey> {
        self.core.actual_type()
    }

    /// The instance itself, if it is hosted here and is a `T`.
    pub fn local_instance<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let (instance, _) = self.core.local_target()?;
        instance.downcast::<T>().ok()
    }

    /// Whether both handles share one identity.
    pub fn same_identity(&self, other: &RemoteHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// A handle with the same identity and a narrower declared type.
    pub fn cast_to(&self, target: TypeKey) -> Result<RemoteHandle> {
        let actual = self.actual_type().ok_or(ChannelError::Disconnected)?;
        let registry = self.registry();
        if !registry.is_assignable(actual, target) {
            return Err(ChannelError::Cast {
                from: registry.type_name(actual)?.to_string(),
                to: registry.type_name(target)?.to_string(),
            });
        }
        Ok(Self {
            core: Arc::clone(&self.core),
            declared: target,
        })
    }

    /// Run a call for its side effects.
    pub async fn run(&self, call: CallSpec) -> Result<()> {
        self.eval(call).await.map(drop)
    }

    /// Run a call and return its result.
    pub async fn eval(&self, call: CallSpec) -> Result<Value> {
        self.dispatch(call, None).await
    }

    /// Like [`eval`](Self::eval), failing with [`ChannelError::Timeout`] if a
    /// remote reply takes longer than `deadline`.
    pub async fn eval_with_deadline(&self, call: CallSpec, deadline: Duration) -> Result<Value> {
        self.dispatch(call, Some(deadline)).await
    }

    /// Release this identity. Idempotent; a remote object is released on the
    /// peer as well.
    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    async fn dispatch(&self, call: CallSpec, deadline: Option<Duration>) -> Result<Value> {
        let registry = Arc::clone(self.registry());
        let (method, args) = call.resolve(&registry)?;

        match self.core.route()? {
            Route::Local(instance, actual) => {
                let info = registry.method(method)?;
                if !registry.is_assignable(actual, info.declaring_type()) {
                    return Err(ChannelError::InvalidArgument(format!(
                        "{} is not a member of {}",
                        info.name(),
                        registry.type_name(actual)?
                    )));
                }
                let args = unwrap_local_args(&registry, info.params(), args);
                match registry.invoke(method, &instance, args)? {
                    Outcome::Ready(value) => Ok(value),
                    Outcome::Pending(future) => future.await,
                }
            }
            Route::Remote(channel, object_id) => {
                let channel = channel.upgrade().ok_or(ChannelError::ChannelClosed)?;
                channel.call(object_id, method, args, deadline).await
            }
        }
    }
}

/// Hand local objects to an in-process call the way the receiving side of a
/// channel would: handles to instances of the expected type become the
/// instances themselves.
fn unwrap_local_args(registry: &Registry, params: &[Param], args: Vec<Value>) -> Args {
    args.into_iter()
        .zip(params.iter().copied().chain(std::iter::repeat(Param::Any)))
        .map(|(value, param)| match (value, param) {
            (Value::Handle(handle), Param::Object(expected)) => match handle.core.local_target() {
                Some((instance, actual)) if registry.is_assignable(actual, expected) => {
                    Value::Instance(instance)
                }
                _ => Value::Handle(handle),
            },
            (value, _) => value,
        })
        .collect()
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("declared", &self.registry().type_name(self.declared).ok())
            .field("local", &self.is_local())
            .field("object_id", &self.object_id())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
    }

    struct Doubler;

    struct Fixture {
        registry: Arc<Registry>,
        shape: TypeKey,
        counter: TypeKey,
        doubler: TypeKey,
        bump: MethodKey,
        hits: MethodKey,
        double_hits: MethodKey,
        slow_double: MethodKey,
    }

    fn fixture() -> Fixture {
        let mut builder = Registry::builder();
        let shape = builder.add_abstract_type("test", "test::Countable");
        let counter = builder.add_type::<Counter>("test", "test::Counter");
        let doubler = builder.add_type::<Doubler>("test", "test::Doubler");
        builder.supertype(counter, shape);

        let bump = builder.method::<Counter, _>(counter, "bump", &[], Param::Any, |c, _| {
            Ok(Value::Int32(c.hits.fetch_add(1, Ordering::SeqCst) as i32 + 1))
        });
        let hits = builder.property::<Counter, _>(counter, "hits", Param::Any, |c| {
            Ok(Value::Int32(c.hits.load(Ordering::SeqCst) as i32))
        });
        let double_hits = builder.method::<Doubler, _>(
            doubler,
            "double_hits",
            &[Param::Object(counter)],
            Param::Any,
            |_, args| {
                let counter = args.instance::<Counter>(0)?;
                Ok(Value::Int32(counter.hits.load(Ordering::SeqCst) as i32 * 2))
            },
        );
        let slow_double = builder.async_method::<Doubler, _, _>(
            doubler,
            "slow_double",
            &[Param::Any],
            Param::Any,
            |_, args| async move { Ok(Value::Int32(args.int32(0)? * 2)) },
        );

        Fixture {
            registry: builder.build().unwrap(),
            shape,
            counter,
            doubler,
            bump,
            hits,
            double_hits,
            slow_double,
        }
    }

    fn new_counter(f: &Fixture) -> RemoteHandle {
        RemoteHandle::from_value(
            &f.registry,
            Counter {
                hits: AtomicUsize::new(0),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn local_calls_invoke_directly() {
        let f = fixture();
        let counter = new_counter(&f);
        assert!(counter.is_local());
        assert_eq!(counter.object_id(), None);

        counter.run(CallSpec::method(f.bump, [])).await.unwrap();
        let hits = counter.eval(CallSpec::property(f.hits)).await.unwrap();
        assert_eq!(hits.as_i32(), Some(1));
    }

    #[tokio::test]
    async fn local_handle_arguments_unwrap_to_instances() {
        let f = fixture();
        let counter = new_counter(&f);
        counter.run(CallSpec::method(f.bump, [])).await.unwrap();
        let doubler = RemoteHandle::from_value(&f.registry, Doubler).unwrap();

        let doubled = doubler
            .eval(CallSpec::method(f.double_hits, [Value::Handle(counter.clone())]))
            .await
            .unwrap();
        assert_eq!(doubled.as_i32(), Some(2));

        let slow = doubler
            .eval(CallSpec::method(f.slow_double, [Value::Int32(21)]))
            .await
            .unwrap();
        assert_eq!(slow.as_i32(), Some(42));
    }

    #[tokio::test]
    async fn wrong_call_shape_is_a_serialization_error() {
        let f = fixture();
        let counter = new_counter(&f);
        let err = counter.eval(CallSpec::property(f.bump)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Serialization(_)));

        let doubler = RemoteHandle::from_value(&f.registry, Doubler).unwrap();
        let err = doubler.eval(CallSpec::property(f.hits)).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));
    }

    #[test]
    fn cast_checks_assignability() {
        let f = fixture();
        let counter = new_counter(&f);

        let narrowed = counter.cast_to(f.shape).unwrap();
        assert_eq!(narrowed.declared_type(), f.shape);
        assert_eq!(narrowed.actual_type(), Some(f.counter));
        assert!(narrowed.same_identity(&counter));

        let err = counter.cast_to(f.doubler).unwrap_err();
        assert!(
            matches!(err, ChannelError::Cast { ref from, ref to } if from == "test::Counter" && to == "test::Doubler")
        );
    }

    #[tokio::test]
    async fn keys_from_a_larger_registry_are_rejected() {
        let f = fixture();
        let mut builder = Registry::builder();
        builder.add_type::<Counter>("small", "small::Counter");
        let small = builder.build().unwrap();
        let counter = RemoteHandle::from_value(
            &small,
            Counter {
                hits: AtomicUsize::new(0),
            },
        )
        .unwrap();

        let err = counter.eval(CallSpec::method(f.bump, [])).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownMethod(_)));
        let err = counter.cast_to(f.doubler).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownType(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_terminal() {
        let f = fixture();
        let counter = new_counter(&f);
        let clone = counter.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            counter.core().bind(
                1,
                Domain::Owner,
                Some(Box::new(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }

        counter.disconnect();
        counter.disconnect();
        clone.disconnect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clone.is_disconnected());
        assert_eq!(clone.actual_type(), None);
        assert!(counter.local_instance::<Counter>().is_none());
        assert!(matches!(
            clone.eval(CallSpec::method(f.bump, [])).await,
            Err(ChannelError::Disconnected)
        ));
        assert!(matches!(
            clone.cast_to(f.shape),
            Err(ChannelError::Disconnected)
        ));
    }

    #[test]
    fn unregistered_instance_is_rejected() {
        let f = fixture();
        assert!(matches!(
            RemoteHandle::from_value(&f.registry, 5u64),
            Err(ChannelError::UnknownType(_))
        ));
    }
}
