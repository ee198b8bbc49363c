//! Freeze / liven: the marshaling pair that translates between live
//! structured [`Value`]s (which may hold procedures and cycles) and
//! wire-safe [`WireValue`]s (which may not), per spec §4.4.
//!
//! `freeze` is a pre-order depth-first traversal that records each
//! container/procedure node's identity before descending into its
//! children, so a self-cycle is detected at the node that creates it.
//! `liven` mirrors that shape: containers are allocated empty before being
//! populated, so a back-reference pointing into a not-yet-populated
//! container still resolves to the right (shared) node.

use crate::error::{Error, Result};
use crate::value::{ProcedureRef, Value};
use crate::wire::{Path, PathComponent, WireValue};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Registers an outbound [`ProcedureRef`] and returns the integer key the
/// far side will use to invoke it. Implemented by [`crate::peer::Peer`].
///
/// Fallible: the callback handle space is a finite 32-bit range, and
/// exhausting it is fatal to the Peer (spec §4.3).
pub trait StoreFunction {
    fn store(&mut self, proc: ProcedureRef) -> Result<u32>;
}

/// Resolves an inbound handle `key` (as named by the sender) into a local
/// proxy [`ProcedureRef`]. Implemented by [`crate::peer::Peer`].
pub trait GetFunction {
    fn get(&mut self, key: u32) -> ProcedureRef;
}

/// Encode a live value as a wire value, registering any procedures found
/// along the way via `store` and collapsing shared subgraphs/cycles into
/// back-references.
pub fn freeze(value: &Value, store: &mut impl StoreFunction) -> Result<WireValue> {
    let mut seen: HashMap<usize, Path> = HashMap::new();
    freeze_rec(value, &[], &mut seen, store)
}

fn freeze_rec(
    value: &Value,
    path: &[PathComponent],
    seen: &mut HashMap<usize, Path>,
    store: &mut impl StoreFunction,
) -> Result<WireValue> {
    if let Some(id) = value.identity() {
        if let Some(first_path) = seen.get(&id) {
            return Ok(WireValue::BackRef(first_path.clone()));
        }
        seen.insert(id, path.to_vec());
    }

    Ok(match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => WireValue::Int(*i),
        Value::Float(x) => WireValue::Float(*x),
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::Bytes(b) => WireValue::Bytes(b.clone()),
        Value::Procedure(p) => WireValue::Handle(store.store(p.clone())?),
        Value::Array(items) => {
            let items = items.read().unwrap();
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(PathComponent::Index(i));
                out.push(freeze_rec(item, &child_path, seen, store)?);
            }
            WireValue::Array(out)
        }
        Value::Map(entries) => {
            let entries = entries.read().unwrap();
            let mut out = IndexMap::with_capacity(entries.len());
            for (k, v) in entries.iter() {
                let mut child_path = path.to_vec();
                child_path.push(PathComponent::Key(k.clone()));
                out.insert(k.clone(), freeze_rec(v, &child_path, seen, store)?);
            }
            WireValue::Map(out)
        }
    })
}

/// Decode a wire value back into a live value, resolving handles into
/// local proxy procedures via `get` and rewiring back-references into
/// shared/cyclic structure.
///
/// Fallible: a back-reference whose path doesn't resolve to an
/// already-visited node is a protocol violation, not a bug in this
/// traversal — the wire bytes decoded fine, they just don't describe a
/// coherent message (see spec §7's taxonomy). Callers driving this off
/// inbound peer traffic must treat that as input to reject, never as
/// something to panic on.
pub fn liven(wire: &WireValue, get: &mut impl GetFunction) -> Result<Value> {
    let mut nodes: HashMap<Path, Value> = HashMap::new();
    liven_rec(wire, &[], &mut nodes, get)
}

fn liven_rec(
    wire: &WireValue,
    path: &[PathComponent],
    nodes: &mut HashMap<Path, Value>,
    get: &mut impl GetFunction,
) -> Result<Value> {
    Ok(match wire {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Int(i) => Value::Int(*i),
        WireValue::Float(x) => Value::Float(*x),
        WireValue::Str(s) => Value::Str(s.clone()),
        WireValue::Bytes(b) => Value::Bytes(b.clone()),
        WireValue::BackRef(target) => nodes.get(target.as_slice()).cloned().ok_or_else(|| {
            Error::Protocol(format!("unresolved back-reference: {target:?}"))
        })?,
        WireValue::Handle(key) => {
            let value = Value::Procedure(get.get(*key));
            nodes.insert(path.to_vec(), value.clone());
            value
        }
        WireValue::Array(items) => {
            let container = Arc::new(RwLock::new(Vec::with_capacity(items.len())));
            let value = Value::Array(container.clone());
            nodes.insert(path.to_vec(), value.clone());

            let mut built = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(PathComponent::Index(i));
                built.push(liven_rec(item, &child_path, nodes, get)?);
            }
            *container.write().unwrap() = built;
            value
        }
        WireValue::Map(entries) => {
            let container = Arc::new(RwLock::new(IndexMap::with_capacity(entries.len())));
            let value = Value::Map(container.clone());
            nodes.insert(path.to_vec(), value.clone());

            let mut built = IndexMap::with_capacity(entries.len());
            for (k, v) in entries.iter() {
                let mut child_path = path.to_vec();
                child_path.push(PathComponent::Key(k.clone()));
                built.insert(k.clone(), liven_rec(v, &child_path, nodes, get)?);
            }
            *container.write().unwrap() = built;
            value
        }
    })
}
