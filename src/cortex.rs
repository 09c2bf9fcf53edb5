//! Cortex: the process-wide entry point into the runtime. Obtained
//! lazily on first request; provider resolution (environment/property
//! configured, falling back to service discovery) is out of scope here —
//! this crate supplies the provider directly as a lazily initialized
//! singleton.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::circuit::Circuit;
use crate::name::Name;
use crate::scope::Scope;
use crate::state::{Slot, State};

/// The runtime's bootstrap entry point: circuit and scope factories, plus
/// convenience constructors for names, slots, and state.
pub struct Cortex {
    circuits: RwLock<HashMap<Name, Circuit>>,
}

impl Cortex {
    fn new() -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide singleton, created on first access.
    pub fn get() -> &'static Cortex {
        static INSTANCE: OnceCell<Cortex> = OnceCell::new();
        INSTANCE.get_or_init(Cortex::new)
    }

    /// Returns an unnamed circuit (named `"circuit"`).
    pub fn circuit(&self) -> Circuit {
        self.circuit_named(Name::from_part("circuit").expect("literal name segment is never empty"))
    }

    /// Returns the circuit registered under `name`, creating (and
    /// starting its worker) on first request.
    pub fn circuit_named(&self, name: Name) -> Circuit {
        if let Some(circuit) = self.circuits.read().get(&name) {
            return circuit.clone();
        }
        let mut circuits = self.circuits.write();
        if let Some(circuit) = circuits.get(&name) {
            return circuit.clone();
        }
        let circuit = Circuit::new(name.clone());
        circuits.insert(name, circuit.clone());
        circuit
    }

    /// Parses a dotted path into a `Name`, panicking on malformed input —
    /// convenience for literal, known-good paths; use `Name::from_path`
    /// directly to handle malformed input gracefully.
    pub fn name_from_str(&self, path: &str) -> Name {
        Name::from_path(path)
            .or_else(|_| Name::from_part(path))
            .expect("malformed name path")
    }

    /// Derives a name from a displayable value (typically an enum
    /// variant), for the percept-facade convention of naming channels
    /// after enum constants.
    pub fn name_from_display(&self, value: &dyn std::fmt::Display) -> Name {
        Name::from_part(&value.to_string()).expect("displayed value must not render to an empty string")
    }

    /// Returns a new unnamed root scope.
    pub fn scope(&self) -> Arc<Scope> {
        self.scope_named(Name::from_part("scope").expect("literal name segment is never empty"))
    }

    /// Returns a new named root scope.
    pub fn scope_named(&self, name: Name) -> Arc<Scope> {
        Scope::new(name)
    }

    pub fn slot<T>(&self, name: Name, value: T) -> Slot<T> {
        Slot::new(name, value)
    }

    pub fn state_empty(&self) -> State {
        State::empty()
    }

    pub fn state_with<T: Clone + Send + Sync + 'static>(&self, name: Name, value: T) -> State {
        State::empty().state(&Slot::new(name, value))
    }
}
