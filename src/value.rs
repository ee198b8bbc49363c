//! Structured application values: primitives, sequences, mappings, and
//! procedure references, with support for shared subgraphs and cycles.
//!
//! Sequences and mappings are reference-counted containers
//! (`Arc<RwLock<_>>`) so that two [`Value`]s can alias the same node —
//! that aliasing, tracked by pointer identity, is exactly what
//! [`crate::wire::freeze`] turns into back-references on the wire.

use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A callable procedure: either an application-published procedure, a
/// locally stored single-shot callback, or a proxy for one of those on the
/// far side of a [`crate::peer::Peer`].
///
/// Procedures never return a value directly — results are delivered by
/// invoking a callback supplied as one of `args`, per §3 of the protocol
/// this crate implements.
pub trait Procedure: Send + Sync {
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, ()>;
}

impl fmt::Debug for dyn Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Procedure@{:p}", self)
    }
}

/// A reference-counted handle to a [`Procedure`]. Two `ProcedureRef`s are
/// the "same" procedure, for identity-tracking purposes, iff
/// [`Arc::ptr_eq`] holds.
pub type ProcedureRef = Arc<dyn Procedure>;

/// Build a [`ProcedureRef`] out of a closure returning a boxed future —
/// the common case for both application procedures and ad-hoc callbacks.
pub fn procedure<F, Fut>(f: F) -> ProcedureRef
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    struct FnProcedure<F>(F);
    impl<F, Fut> Procedure for FnProcedure<F>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        fn call(&self, args: Vec<Value>) -> BoxFuture<'static, ()> {
            Box::pin((self.0)(args))
        }
    }
    Arc::new(FnProcedure(f))
}

pub type Sequence = Arc<RwLock<Vec<Value>>>;
pub type Mapping = Arc<RwLock<IndexMap<String, Value>>>;

/// A structured application value: recursively a primitive, an ordered
/// sequence, a string-keyed mapping, or a procedure reference. Sequences
/// and mappings permitted to participate in cycles via shared `Arc`s.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Sequence),
    Map(Mapping),
    Procedure(ProcedureRef),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Self {
        Value::Map(Arc::new(RwLock::new(entries)))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Identity used by [`crate::wire::freeze`] to detect shared subgraphs
    /// and cycles. Only containers and procedures have a meaningful
    /// identity; primitives always compare as distinct nodes.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(Arc::as_ptr(a) as usize),
            Value::Map(m) => Some(Arc::as_ptr(m) as usize),
            Value::Procedure(p) => Some(Arc::as_ptr(p) as *const () as usize),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Array(a) => write!(f, "Array(len={})", a.read().unwrap().len()),
            Value::Map(m) => write!(f, "Map(len={})", m.read().unwrap().len()),
            Value::Procedure(p) => write!(f, "Procedure@{:p}", Arc::as_ptr(p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_distinguishes_distinct_containers() {
        let a = Value::array(vec![]);
        let b = Value::array(vec![]);
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn identity_shared_on_clone() {
        let a = Value::array(vec![]);
        let b = a.clone();
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn primitives_have_no_identity() {
        assert_eq!(Value::Int(1).identity(), None);
        assert_eq!(Value::Null.identity(), None);
    }
}
