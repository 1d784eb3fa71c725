//! Method descriptors and the registry that freezes them into a service.
//!
//! A [`MethodRegistry`] collects descriptors during service definition; an
//! explicit [`MethodRegistry::build`] turns it into an immutable
//! [`ServiceDescriptor`] before the first call is served, so lookups never
//! take a lock.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};

/// Cardinality and direction shape of a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::ServerStreaming => "server-streaming",
            CallKind::ClientStreaming => "client-streaming",
            CallKind::BidiStreaming => "bidi-streaming",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one remote procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: Cow<'static, str>,
    kind: CallKind,
    request_codec: SerializationFormat,
    response_codec: SerializationFormat,
}

impl MethodDescriptor {
    /// Descriptor using bincode in both directions
    pub const fn new(name: &'static str, kind: CallKind) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind,
            request_codec: SerializationFormat::Bincode,
            response_codec: SerializationFormat::Bincode,
        }
    }

    /// Descriptor for a name only known at runtime
    pub fn named(name: impl Into<String>, kind: CallKind) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            kind,
            request_codec: SerializationFormat::Bincode,
            response_codec: SerializationFormat::Bincode,
        }
    }

    pub const fn with_codecs(
        mut self,
        request_codec: SerializationFormat,
        response_codec: SerializationFormat,
    ) -> Self {
        self.request_codec = request_codec;
        self.response_codec = response_codec;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn request_codec(&self) -> SerializationFormat {
        self.request_codec
    }

    pub fn response_codec(&self) -> SerializationFormat {
        self.response_codec
    }
}

/// Collects descriptors while a service is being defined
#[derive(Debug, Default)]
pub struct MethodRegistry {
    service: String,
    methods: Vec<MethodDescriptor>,
    index: HashMap<String, usize>,
}

impl MethodRegistry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add a descriptor; names must be unique within the service
    pub fn register(&mut self, descriptor: MethodDescriptor) -> Result<()> {
        if self.index.contains_key(descriptor.name()) {
            return Err(ProtocolError::DuplicateMethod(descriptor.name().to_string()));
        }
        self.index
            .insert(descriptor.name().to_string(), self.methods.len());
        self.methods.push(descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&MethodDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.methods[i])
            .ok_or_else(|| ProtocolError::MethodNotFound(name.to_string()))
    }

    /// Freeze the registry
    pub fn build(self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.service,
            methods: self.methods,
            index: self.index,
        }
    }
}

/// Frozen, ordered set of method descriptors keyed by name
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
    index: HashMap<String, usize>,
}

impl ServiceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, name: &str) -> Result<&MethodDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.methods[i])
            .ok_or_else(|| ProtocolError::MethodNotFound(name.to_string()))
    }

    /// Position of `name` in registration order
    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Descriptors in registration order
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ECHO: MethodDescriptor = MethodDescriptor::new("test.Echo/Echo", CallKind::Unary);
    const TAIL: MethodDescriptor = MethodDescriptor::new("test.Echo/Tail", CallKind::ServerStreaming)
        .with_codecs(SerializationFormat::Json, SerializationFormat::MessagePack);

    #[test]
    fn lookup_finds_registered_methods() {
        let mut registry = MethodRegistry::new("test.Echo");
        registry.register(ECHO).unwrap();
        registry.register(TAIL).unwrap();
        let service = registry.build();

        let tail = service.lookup("test.Echo/Tail").unwrap();
        assert_eq!(tail.kind(), CallKind::ServerStreaming);
        assert_eq!(tail.request_codec(), SerializationFormat::Json);
        assert_eq!(tail.response_codec(), SerializationFormat::MessagePack);
        assert_eq!(service.position("test.Echo/Echo"), Some(0));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = MethodRegistry::new("test.Echo");
        registry.register(ECHO).unwrap();
        let err = registry
            .register(MethodDescriptor::named("test.Echo/Echo", CallKind::BidiStreaming))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateMethod(name) if name == "test.Echo/Echo"));
    }

    #[test]
    fn unknown_method_is_not_found() {
        let service = MethodRegistry::new("test.Echo").build();
        assert!(service.is_empty());
        assert!(matches!(
            service.lookup("test.Echo/Missing"),
            Err(ProtocolError::MethodNotFound(_))
        ));
    }

    #[test]
    fn registration_order_is_kept() {
        let mut registry = MethodRegistry::new("svc");
        for name in ["svc/C", "svc/A", "svc/B"] {
            registry
                .register(MethodDescriptor::named(name, CallKind::Unary))
                .unwrap();
        }
        let names: Vec<_> = registry.build().methods().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["svc/C", "svc/A", "svc/B"]);
    }
}
