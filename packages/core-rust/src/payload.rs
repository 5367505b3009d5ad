//! Type-erased immutable payloads for message bodies and exchange properties.
//!
//! A [`Payload`] wraps any `Send + Sync + 'static` value behind an `Arc`, so
//! copying a message shares the body instead of cloning it. The runtime type
//! is captured at construction as a [`TypeKey`], which is what the type
//! conversion registry dispatches on.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::value::Value;

/// Runtime type identity plus a human-readable name for diagnostics.
///
/// Equality and hashing use only the `TypeId`.
#[derive(Debug, Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Formatting capability captured for payloads built from `Display` types.
type RenderFn = fn(&(dyn Any + Send + Sync)) -> Option<String>;

fn render_display<T: fmt::Display + Any>(value: &(dyn Any + Send + Sync)) -> Option<String> {
    value.downcast_ref::<T>().map(ToString::to_string)
}

/// Immutable, cheaply cloneable, type-erased value.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    key: TypeKey,
    render: Option<RenderFn>,
}

impl Payload {
    /// Wraps an arbitrary value. No formatting capability is recorded, so the
    /// generic to-string fallback does not apply to it.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            key: TypeKey::of::<T>(),
            render: None,
        }
    }

    /// Wraps a value and records its `Display` implementation as a formatting
    /// capability, which the to-string fallback converter uses.
    pub fn displayable<T: fmt::Display + Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            key: TypeKey::of::<T>(),
            render: Some(render_display::<T>),
        }
    }

    /// The empty body (`()`).
    #[must_use]
    pub fn empty() -> Self {
        Self::new(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is::<()>()
    }

    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.key.id() == TypeId::of::<T>()
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Returns an owned copy of the inner value if it is a `T`.
    #[must_use]
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Borrow of the erased value, for converters.
    #[must_use]
    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        &*self.value
    }

    /// Renders the payload through its formatting capability, if it has one.
    #[must_use]
    pub fn render_text(&self) -> Option<String> {
        self.render.and_then(|render| render(&*self.value))
    }

    #[must_use]
    pub fn has_text_capability(&self) -> bool {
        self.render.is_some()
    }

    /// Whether both payloads share the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render_text() {
            Some(text) => write!(f, "Payload<{}>({text:?})", self.type_name()),
            None => write!(f, "Payload<{}>", self.type_name()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::displayable(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::displayable(s.to_string())
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Self::displayable(i)
    }
}

impl From<i32> for Payload {
    fn from(i: i32) -> Self {
        Self::displayable(i)
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Self::displayable(f)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Self::displayable(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::new(b)
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Self::displayable(v)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::displayable(v)
    }
}
