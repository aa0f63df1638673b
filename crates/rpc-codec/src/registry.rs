//! Method registry consulted by server codecs.

use crate::call::{Call, Value, ValueShape};
use crate::error::{Error, Result};
use crate::protocol::{InputBuffer, Protocol};

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

type NewArgumentFn = dyn Fn() -> Value + Send + Sync;

/// Produces calls for one method: fresh arguments, argument decoding and the
/// shape of the reply.
pub struct CallFactory<P> {
    method: Arc<str>,
    new_argument: Box<NewArgumentFn>,
    argument: ValueShape<P>,
    reply: Arc<ValueShape<P>>,
}

impl<P> CallFactory<P> {
    /// Name of the method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Shape of the argument.
    #[must_use]
    pub const fn argument_shape(&self) -> &ValueShape<P> {
        &self.argument
    }

    /// Shape of the reply.
    #[must_use]
    pub fn reply_shape(&self) -> &ValueShape<P> {
        &self.reply
    }

    pub(crate) const fn method_name(&self) -> &Arc<str> {
        &self.method
    }

    pub(crate) const fn reply_shape_arc(&self) -> &Arc<ValueShape<P>> {
        &self.reply
    }
}

impl<P: Protocol> CallFactory<P> {
    /// Factory for method `method` taking an `A` (fresh arguments are
    /// `A::default()`) and answering with an `R`.
    pub fn new<A, R>(method: impl Into<Arc<str>>) -> Self
    where
        A: Default + Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self::with_argument::<A, R, _>(method, A::default)
    }

    /// Factory whose fresh arguments come from `make_argument`.
    pub fn with_argument<A, R, F>(method: impl Into<Arc<str>>, make_argument: F) -> Self
    where
        A: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self {
            method: method.into(),
            new_argument: Box::new(move || Box::new(make_argument()) as Value),
            argument: ValueShape::of::<A>(),
            reply: Arc::new(ValueShape::of::<R>()),
        }
    }

    /// A call carrying a fresh argument.
    #[must_use]
    pub fn new_call(self: &Arc<Self>) -> Call<P> {
        Call::new(Arc::clone(self), (self.new_argument)())
    }

    /// A call carrying `argument`.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedPayload` if `argument` does not have the argument
    /// shape of this method.
    pub fn call<A: Any + Send + Sync>(self: &Arc<Self>, argument: A) -> Result<Call<P>> {
        let argument: Value = Box::new(argument);
        if !self.argument.accepts(&*argument) {
            return Err(Error::UnrecognizedPayload(format!(
                "Argument of {} must be a {}, got a {}",
                self.method,
                self.argument.type_name(),
                type_name::<A>()
            )));
        }
        Ok(Call::new(Arc::clone(self), argument))
    }

    /// Decode the argument payload of a received call.
    pub(crate) fn read_call(
        self: &Arc<Self>,
        protocol: &P,
        src: &mut InputBuffer<'_>,
        seq_id: i32,
    ) -> Result<Call<P>> {
        let argument = self.argument.read(protocol, src)?;
        Ok(Call::new(Arc::clone(self), argument).with_seq_id(seq_id))
    }
}

impl<P> fmt::Debug for CallFactory<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFactory")
            .field("method", &self.method)
            .field("argument", &self.argument)
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

/// Maps method names to call factories.
///
/// Populated while wiring the application and shared by every connection
/// through an `Arc`. Registering a method twice replaces the first factory.
pub struct Registry<P> {
    factories: DashMap<String, Arc<CallFactory<P>>>,
}

impl<P: Protocol> Registry<P> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Register `factory`, returning `self` for chaining.
    #[must_use]
    pub fn with(self, factory: impl Into<Arc<CallFactory<P>>>) -> Self {
        self.register(factory);
        self
    }

    /// Register `factory` under its method name.
    ///
    /// Returns the factory previously registered for that name, if any.
    pub fn register(
        &self,
        factory: impl Into<Arc<CallFactory<P>>>,
    ) -> Option<Arc<CallFactory<P>>> {
        let factory = factory.into();
        let previous = self
            .factories
            .insert(factory.method().to_string(), Arc::clone(&factory));
        if previous.is_some() {
            debug!("Replaced factory for method {}", factory.method());
        }
        previous
    }

    /// Find the factory for `method`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMethod` if nothing is registered under that name.
    pub fn lookup(&self, method: &str) -> Result<Arc<CallFactory<P>>> {
        self.factories
            .get(method)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no method is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        methods.sort();
        methods
    }
}

impl<P: Protocol> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BinaryProtocol;

    type Factory = CallFactory<BinaryProtocol>;

    #[test]
    fn test_lookup_returns_matching_factory() {
        let registry = Registry::new()
            .with(Factory::new::<String, String>("echo"))
            .with(Factory::new::<u64, u64>("double"));

        for method in ["echo", "double"] {
            let factory = registry.lookup(method).unwrap();
            assert_eq!(factory.method(), method);
            assert_eq!(factory.new_call().method(), method);
        }

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.methods(), vec!["double", "echo"]);
    }

    #[test]
    fn test_lookup_unknown_method() {
        let registry = Registry::<BinaryProtocol>::new();
        assert!(registry.is_empty());

        match registry.lookup("missing") {
            Err(Error::UnknownMethod(method)) => assert_eq!(method, "missing"),
            other => panic!("unexpected lookup result: {other:?}"),
        }
    }

    #[test]
    fn test_register_overwrites() {
        let registry = Registry::new();
        assert!(registry.register(Factory::new::<String, String>("echo")).is_none());

        let replaced = registry.register(Factory::new::<u64, u64>("echo"));
        assert_eq!(
            replaced.map(|factory| factory.argument_shape().type_name()),
            Some(type_name::<String>())
        );

        let factory = registry.lookup("echo").unwrap();
        assert_eq!(factory.argument_shape().type_name(), type_name::<u64>());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fresh_arguments() {
        let factory = Arc::new(Factory::with_argument::<String, u64, _>("greet", || {
            "hello".to_string()
        }));
        let call = factory.new_call();
        assert_eq!(call.argument::<String>().map(String::as_str), Some("hello"));
        assert_eq!(call.seq_id(), None);

        let defaulted = Arc::new(Factory::new::<u64, u64>("count"));
        assert_eq!(defaulted.new_call().argument::<u64>(), Some(&0));
    }

    #[test]
    fn test_call_checks_argument_type() {
        let factory = Arc::new(Factory::new::<u64, u64>("count"));
        assert!(factory.call(3u64).is_ok());
        assert!(matches!(
            factory.call("three"),
            Err(Error::UnrecognizedPayload(_))
        ));
    }
}
