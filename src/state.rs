//! Persistent, immutable, append-only state: a most-recent-first linked
//! list of typed named slots.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::name::Name;

/// An immutable `(name, type-tag, value)` triple.
///
/// The type tag is the value's `TypeId`, discriminating same-name entries
/// of different types without reflection.
pub struct Slot<T> {
    name: Name,
    value: Arc<T>,
}

impl<T> Slot<T> {
    pub fn new(name: Name, value: T) -> Self {
        Self {
            name,
            value: Arc::new(value),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("value", &*self.value)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Slot<T> {
    fn erase(&self) -> SlotErased {
        SlotErased {
            name: self.name.clone(),
            type_id: TypeId::of::<T>(),
            value: self.value.clone() as Arc<dyn Any + Send + Sync>,
        }
    }
}

#[derive(Clone)]
struct SlotErased {
    name: Name,
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

fn identity_eq(a: &SlotErased, b: &SlotErased) -> bool {
    a.type_id == b.type_id && Arc::as_ptr(&a.value) as *const () == Arc::as_ptr(&b.value) as *const ()
}

struct StateNode {
    slot: SlotErased,
    next: Option<Arc<StateNode>>,
}

/// Persistent, immutable, append-only list of slots, most-recent-first.
#[derive(Clone, Default)]
pub struct State(Option<Arc<StateNode>>);

impl State {
    pub fn empty() -> Self {
        State(None)
    }

    /// Prepends `slot`, returning a new state. If `slot` is already
    /// (identity-)the head slot, returns `self` unchanged.
    pub fn state<T: Send + Sync + 'static>(&self, slot: &Slot<T>) -> State {
        let erased = slot.erase();
        if let Some(node) = &self.0 {
            if identity_eq(&node.slot, &erased) {
                return self.clone();
            }
        }
        State(Some(Arc::new(StateNode {
            slot: erased,
            next: self.0.clone(),
        })))
    }

    /// Returns the value of the first slot matching `template`'s
    /// `(name-identity, type-tag)`, or the template's own value if none
    /// match.
    pub fn value<T: Clone + Send + Sync + 'static>(&self, template: &Slot<T>) -> T {
        let tid = TypeId::of::<T>();
        for node in self.iter_nodes() {
            if node.slot.type_id == tid && node.slot.name == *template.name() {
                if let Ok(value) = node.slot.value.clone().downcast::<T>() {
                    return (*value).clone();
                }
            }
        }
        template.value().clone()
    }

    /// Collapses duplicate `(name, type-tag)` entries, retaining the
    /// most-recent assignment. Resulting iteration order is otherwise
    /// unspecified (callers must not depend on it beyond "most-recent
    /// survivor per key").
    pub fn compact(&self) -> State {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        for node in self.iter_nodes() {
            let key = (node.slot.name.clone(), node.slot.type_id);
            if seen.insert(key) {
                kept.push(node.slot.clone());
            }
        }
        let mut tail: Option<Arc<StateNode>> = None;
        for slot in kept.into_iter().rev() {
            tail = Some(Arc::new(StateNode { slot, next: tail }));
        }
        State(tail)
    }

    fn iter_nodes(&self) -> StateNodeIter {
        StateNodeIter(self.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

struct StateNodeIter(Option<Arc<StateNode>>);

impl Iterator for StateNodeIter {
    type Item = Arc<StateNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.0.take()?;
        self.0 = node.next.clone();
        Some(node)
    }
}
