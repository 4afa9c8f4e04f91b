//! Per-process registry of remotely callable types and methods.
//!
//! Both processes build their registry in the same order so that types and
//! methods receive the same per-module tokens on either side. Tokens only
//! travel for the module a channel is specialized for; everything else is
//! resolved by qualified type name.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use fastipc_frame::{MethodRef, TypeRef};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::{ChannelError, Result};
use crate::value::{Args, Value};

/// A registered, shareable object.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Index of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(usize);

/// Index of a registered method or property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Method,
    Property,
}

/// What a parameter or return slot expects.
///
/// An object slot lets a reference to an object hosted by the receiving
/// process be unwrapped straight to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Any,
    Object(TypeKey),
}

/// Result of invoking a method: a value, or a future still producing one.
pub enum Outcome {
    Ready(Value),
    Pending(BoxFuture<'static, Result<Value>>),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

type Activator = Arc<dyn Fn() -> Result<Instance> + Send + Sync>;
type Invoker = Arc<dyn Fn(&Instance, Args) -> Result<Outcome> + Send + Sync>;

struct TypeEntry {
    name: String,
    module: String,
    token: u32,
    activator: Option<Activator>,
    supertypes: Vec<TypeKey>,
}

/// Metadata of one registered method.
pub struct MethodInfo {
    name: String,
    declaring: TypeKey,
    token: u32,
    kind: MethodKind,
    is_async: bool,
    params: Vec<Param>,
    returns: Param,
    invoker: Invoker,
}

impl MethodInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaring_type(&self) -> TypeKey {
        self.declaring
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Asynchronous methods are awaited before their reply is sent.
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn returns(&self) -> Param {
        self.returns
    }
}

impl std::fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInfo")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("is_async", &self.is_async)
            .finish()
    }
}

#[derive(Default)]
struct ModuleTokens {
    next_type: u32,
    next_method: u32,
}

/// Frozen registry shared by channels and handles.
#[derive(Default)]
pub struct Registry {
    types: Vec<TypeEntry>,
    methods: Vec<MethodInfo>,
    types_by_name: HashMap<String, TypeKey>,
    types_by_token: HashMap<(String, u32), TypeKey>,
    methods_by_token: HashMap<(String, u32), MethodKey>,
    types_by_rust: HashMap<TypeId, TypeKey>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    fn entry(&self, ty: TypeKey) -> Result<&TypeEntry> {
        self.types
            .get(ty.0)
            .ok_or_else(|| ChannelError::UnknownType(format!("type key {}", ty.0)))
    }

    pub fn type_name(&self, ty: TypeKey) -> Result<&str> {
        self.entry(ty).map(|entry| entry.name.as_str())
    }

    pub fn module_of(&self, ty: TypeKey) -> Result<&str> {
        self.entry(ty).map(|entry| entry.module.as_str())
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeKey> {
        self.types_by_name.get(name).copied()
    }

    /// Keys issued by another registry are [`ChannelError::UnknownMethod`].
    pub fn method(&self, method: MethodKey) -> Result<&MethodInfo> {
        self.methods
            .get(method.0)
            .ok_or_else(|| ChannelError::UnknownMethod(format!("method key {}", method.0)))
    }

    /// Look up a method or property declared by `ty` or one of its supertypes.
    pub fn find_method(&self, ty: TypeKey, name: &str) -> Option<MethodKey> {
        self.methods
            .iter()
            .position(|m| m.name == name && self.is_assignable(ty, m.declaring))
            .map(MethodKey)
    }

    /// Registered type of a live instance.
    pub fn type_of_instance(&self, instance: &Instance) -> Option<TypeKey> {
        self.types_by_rust
            .get(&Any::type_id(&**instance))
            .copied()
    }

    /// Whether a `from` instance can be used where `to` is expected. Keys this
    /// registry did not issue are never assignable.
    pub fn is_assignable(&self, from: TypeKey, to: TypeKey) -> bool {
        let Ok(entry) = self.entry(from) else {
            return false;
        };
        if from == to {
            return true;
        }
        let mut stack = entry.supertypes.clone();
        let mut seen = vec![from];
        while let Some(next) = stack.pop() {
            if next == to {
                return true;
            }
            if !seen.contains(&next) {
                seen.push(next);
                if let Ok(parent) = self.entry(next) {
                    stack.extend(parent.supertypes.iter().copied());
                }
            }
        }
        false
    }

    /// Compact token for `module`'s own types, qualified name otherwise.
    pub fn encode_type_ref(&self, ty: TypeKey, module: Option<&str>) -> Result<TypeRef> {
        let entry = self.entry(ty)?;
        Ok(if module == Some(entry.module.as_str()) {
            TypeRef::Token(entry.token)
        } else {
            TypeRef::Named(entry.name.clone())
        })
    }

    pub fn decode_type_ref(&self, type_ref: &TypeRef, module: Option<&str>) -> Result<TypeKey> {
        match type_ref {
            TypeRef::Token(token) => module
                .and_then(|module| self.types_by_token.get(&(module.to_string(), *token)))
                .copied()
                .ok_or_else(|| ChannelError::UnknownType(format!("type token {token}"))),
            TypeRef::Named(name) => self
                .type_by_name(name)
                .ok_or_else(|| ChannelError::UnknownType(name.clone())),
        }
    }

    pub fn encode_method_ref(&self, method: MethodKey, module: Option<&str>) -> Result<MethodRef> {
        let info = self.method(method)?;
        let declaring = self.entry(info.declaring)?;
        Ok(if module == Some(declaring.module.as_str()) {
            MethodRef::Token(info.token)
        } else {
            MethodRef::Named {
                type_name: declaring.name.clone(),
                token: info.token,
            }
        })
    }

    pub fn decode_method_ref(
        &self,
        method_ref: &MethodRef,
        module: Option<&str>,
    ) -> Result<MethodKey> {
        let (module, token) = match method_ref {
            MethodRef::Token(token) => {
                let module = module.ok_or_else(|| {
                    ChannelError::UnknownMethod(format!("method token {token} without a module"))
                })?;
                (module.to_string(), *token)
            }
            MethodRef::Named { type_name, token } => {
                let ty = self
                    .type_by_name(type_name)
                    .ok_or_else(|| ChannelError::UnknownType(type_name.clone()))?;
                (self.entry(ty)?.module.clone(), *token)
            }
        };
        self.methods_by_token
            .get(&(module, token))
            .copied()
            .ok_or_else(|| ChannelError::UnknownMethod(format!("method token {token}")))
    }

    /// Create a new instance of `ty` with its activator.
    pub fn activate(&self, ty: TypeKey) -> Result<Instance> {
        let entry = self.entry(ty)?;
        let activator = entry.activator.as_ref().ok_or_else(|| {
            ChannelError::Activation(format!("{} has no activator", entry.name))
        })?;
        activator()
    }

    /// Invoke `method` on `instance`.
    pub fn invoke(&self, method: MethodKey, instance: &Instance, args: Args) -> Result<Outcome> {
        let info = self.method(method)?;
        if args.len() != info.params.len() {
            return Err(ChannelError::InvalidArgument(format!(
                "{} expects {} arguments, got {}",
                info.name,
                info.params.len(),
                args.len()
            )));
        }
        (info.invoker)(instance, args)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.types.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Builds a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
    tokens: HashMap<String, ModuleTokens>,
    invalid: Option<ChannelError>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `ty`, remembering a key this builder never issued so that
    /// [`build`](Self::build) can report it.
    fn entry_mut(&mut self, ty: TypeKey) -> Option<&mut TypeEntry> {
        if ty.0 >= self.registry.types.len() {
            self.invalid
                .get_or_insert_with(|| ChannelError::UnknownType(format!("type key {}", ty.0)));
        }
        self.registry.types.get_mut(ty.0)
    }

    fn type_name_of(&mut self, ty: TypeKey) -> String {
        self.entry_mut(ty)
            .map(|entry| entry.name.clone())
            .unwrap_or_default()
    }

    /// Register Rust type `T` as `name` in `module`.
    ///
    /// Registering a name twice returns the existing key.
    pub fn add_type<T: Any + Send + Sync>(&mut self, module: &str, name: &str) -> TypeKey {
        let ty = self.add_abstract_type(module, name);
        self.registry.types_by_rust.insert(TypeId::of::<T>(), ty);
        ty
    }

    /// Register a type with no Rust counterpart, such as an interface other
    /// types declare as a supertype.
    pub fn add_abstract_type(&mut self, module: &str, name: &str) -> TypeKey {
        if let Some(existing) = self.registry.type_by_name(name) {
            return existing;
        }
        let tokens = self.tokens.entry(module.to_string()).or_default();
        tokens.next_type += 1;
        let token = tokens.next_type;

        let ty = TypeKey(self.registry.types.len());
        self.registry.types.push(TypeEntry {
            name: name.to_string(),
            module: module.to_string(),
            token,
            activator: None,
            supertypes: Vec::new(),
        });
        self.registry.types_by_name.insert(name.to_string(), ty);
        self.registry
            .types_by_token
            .insert((module.to_string(), token), ty);
        ty
    }

    /// Let the peer create instances of `ty`.
    pub fn activator<T, F>(&mut self, ty: TypeKey, create: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let activator: Activator =
            Arc::new(move || -> Result<Instance> { Ok(Arc::new(create())) });
        if let Some(entry) = self.entry_mut(ty) {
            entry.activator = Some(activator);
        }
        self
    }

    /// Declare `parent` as a supertype of `ty`.
    pub fn supertype(&mut self, ty: TypeKey, parent: TypeKey) -> &mut Self {
        if self.entry_mut(parent).is_some() {
            if let Some(entry) = self.entry_mut(ty) {
                entry.supertypes.push(parent);
            }
        }
        self
    }

    /// Register a synchronous method of `ty` implemented on `T`.
    pub fn method<T, F>(
        &mut self,
        ty: TypeKey,
        name: &str,
        params: &[Param],
        returns: Param,
        body: F,
    ) -> MethodKey
    where
        T: Any + Send + Sync,
        F: Fn(&T, &Args) -> Result<Value> + Send + Sync + 'static,
    {
        let type_name = self.type_name_of(ty);
        let invoker: Invoker = Arc::new(move |instance: &Instance, args: Args| -> Result<Outcome> {
            let target = instance
                .downcast_ref::<T>()
                .ok_or_else(|| not_an_instance_of(&type_name))?;
            body(target, &args).map(Outcome::Ready)
        });
        self.push_method(ty, name, MethodKind::Method, false, params, returns, invoker)
    }

    /// Register an asynchronous method. Its reply is sent once the returned
    /// future resolves.
    pub fn async_method<T, F, Fut>(
        &mut self,
        ty: TypeKey,
        name: &str,
        params: &[Param],
        returns: Param,
        body: F,
    ) -> MethodKey
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let type_name = self.type_name_of(ty);
        let invoker: Invoker = Arc::new(move |instance: &Instance, args: Args| -> Result<Outcome> {
            let target = Arc::clone(instance)
                .downcast::<T>()
                .map_err(|_| not_an_instance_of(&type_name))?;
            Ok(Outcome::Pending(body(target, args).boxed()))
        });
        self.push_method(ty, name, MethodKind::Method, true, params, returns, invoker)
    }

    /// Register a read-only property of `ty`.
    pub fn property<T, F>(&mut self, ty: TypeKey, name: &str, returns: Param, read: F) -> MethodKey
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Result<Value> + Send + Sync + 'static,
    {
        let type_name = self.type_name_of(ty);
        let invoker: Invoker = Arc::new(move |instance: &Instance, _args: Args| -> Result<Outcome> {
            let target = instance
                .downcast_ref::<T>()
                .ok_or_else(|| not_an_instance_of(&type_name))?;
            read(target).map(Outcome::Ready)
        });
        self.push_method(ty, name, MethodKind::Property, false, &[], returns, invoker)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_method(
        &mut self,
        ty: TypeKey,
        name: &str,
        kind: MethodKind,
        is_async: bool,
        params: &[Param],
        returns: Param,
        invoker: Invoker,
    ) -> MethodKey {
        let module = self
            .entry_mut(ty)
            .map(|entry| entry.module.clone())
            .unwrap_or_default();
        let tokens = self.tokens.entry(module.clone()).or_default();
        tokens.next_method += 1;
        let token = tokens.next_method;

        let method = MethodKey(self.registry.methods.len());
        self.registry.methods.push(MethodInfo {
            name: name.to_string(),
            declaring: ty,
            token,
            kind,
            is_async,
            params: params.to_vec(),
            returns,
            invoker,
        });
        self.registry.methods_by_token.insert((module, token), method);
        method
    }

    /// Freeze the registry. Fails if any registration named a type key
    /// this builder did not issue.
    pub fn build(self) -> Result<Arc<Registry>> {
        match self.invalid {
            Some(err) => Err(err),
            None => Ok(Arc::new(self.registry)),
        }
    }
}

fn not_an_instance_of(type_name: &str) -> ChannelError {
    ChannelError::InvalidArgument(format!("target is not an instance of {type_name}"))
}
