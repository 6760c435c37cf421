//! Value type held by the keyspace.
//!
//! Every value is an [`Object`] behind a reference-counted handle
//! ([`ObjectRef`]). Releasing the last handle frees the object and, for
//! container variants, recursively releases everything it holds.
//!
//! Only strings have a command surface. Lists and sets exist so the
//! keyspace can hold them and so `get` can report a type mismatch.

use bytes::Bytes;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

/// Shared handle to an object. The event loop is single-threaded, so the
/// count does not need to be atomic.
pub type ObjectRef = Rc<Object>;

/// Tag of an object, independent of its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    List,
    Set,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::String => write!(f, "string"),
            ObjectKind::List => write!(f, "list"),
            ObjectKind::Set => write!(f, "set"),
        }
    }
}

/// A stored value.
#[derive(Debug)]
pub enum Object {
    /// Binary-safe byte string.
    String(Bytes),
    /// Ordered sequence of objects.
    #[allow(dead_code)] // no list commands yet
    List(List),
    /// Reserved; carries no members yet.
    #[allow(dead_code)]
    Set,
}

impl Object {
    /// Wrap a byte buffer in a new string object with a reference count of one.
    ///
    /// The buffer is adopted, not copied.
    pub fn string(value: Bytes) -> ObjectRef {
        Rc::new(Object::String(value))
    }

    /// Wrap a list in a new object.
    #[allow(dead_code)] // no list commands yet
    pub fn list(list: List) -> ObjectRef {
        Rc::new(Object::List(list))
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::String(_) => ObjectKind::String,
            Object::List(_) => ObjectKind::List,
            Object::Set => ObjectKind::Set,
        }
    }

    /// String payload, or `None` for any other variant.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Object::String(value) => Some(value),
            _ => None,
        }
    }
}

/// Ordered list of objects. Each slot owns one reference to its element.
#[derive(Debug, Default)]
pub struct List {
    items: Vec<ObjectRef>,
}

#[allow(dead_code)] // no list commands yet
impl List {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element, taking over the caller's reference.
    pub fn push(&mut self, item: ObjectRef) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRef> {
        self.items.iter()
    }
}

/// Give up one reference to `object`.
///
/// When this was the last reference the object is freed along with
/// everything it contains.
pub fn release(object: ObjectRef) {
    let remaining = Rc::strong_count(&object) - 1;
    trace!(kind = %object.kind(), remaining, "Releasing object");
    drop(object);
}
