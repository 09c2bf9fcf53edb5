//! Cell: a hierarchical ingress/egress hub. Upward flow from a child to
//! its parent is mediated by a hub channel whose subscription forwards
//! by re-enqueueing through the circuit — not by a direct call — so an
//! arbitrarily deep or cyclic tree of cells never grows the call stack.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Composer, Conduit, FunctionSubscriber, Registrar};
use crate::circuit::Circuit;
use crate::error::{SubstratesError, SubstratesResult};
use crate::name::Name;
use crate::pipe::Pipe;
use crate::subject::{Resource, Subject, SubjectType, Substrate};

/// `(Subject, outlet) → Pipe<I>`: wraps a cell's outward-facing input
/// pipe around its aggregating outlet.
pub trait IngressComposer<I, E>: Send + Sync {
    fn compose(&self, subject: &Subject, outlet: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<I>>;
}

impl<I, E, F> IngressComposer<I, E> for F
where
    F: Fn(&Subject, Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<I>> + Send + Sync,
{
    fn compose(&self, subject: &Subject, outlet: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<I>> {
        self(subject, outlet)
    }
}

/// `(Subject, outlet) → Pipe<E>`: wraps a cell's own emission path
/// around the same aggregating outlet, used for the hub's forwarding
/// pipe into the parent's outlet.
pub trait EgressComposer<E>: Send + Sync {
    fn compose(&self, subject: &Subject, outlet: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>>;
}

impl<E, F> EgressComposer<E> for F
where
    F: Fn(&Subject, Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> + Send + Sync,
{
    fn compose(&self, subject: &Subject, outlet: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        self(subject, outlet)
    }
}

struct IdentityEgress;

impl<E: Send + Sync + 'static> EgressComposer<E> for IdentityEgress {
    fn compose(&self, _subject: &Subject, outlet: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        outlet
    }
}

struct HubForwardComposer<E> {
    _marker: std::marker::PhantomData<fn(E)>,
}

impl<E: Send + Sync + Clone + 'static> Composer<Arc<dyn Pipe<E>>, E> for HubForwardComposer<E> {
    fn compose(&self, channel: Arc<crate::channel::Channel<E>>) -> SubstratesResult<Arc<dyn Pipe<E>>> {
        Ok(channel.pipe())
    }
}

struct CellState<I, E> {
    children: HashMap<Name, Arc<Cell<I, E>>>,
}

/// A hierarchical hub: a `Pipe<I>` on the way in, a lookup of children
/// by name, a `Source<E>`-like observable on the way out, and an
/// `Extent` in the parent/child tree.
pub struct Cell<I, E> {
    subject: Subject,
    circuit: Circuit,
    ingress_composer: Arc<dyn IngressComposer<I, E>>,
    egress_composer: Arc<dyn EgressComposer<E>>,
    parent_outlet: Arc<dyn Pipe<E>>,
    hub: Arc<Conduit<Arc<dyn Pipe<E>>, E>>,
    own_egress: Arc<dyn Pipe<E>>,
    ingress: Arc<dyn Pipe<I>>,
    state: Mutex<CellState<I, E>>,
}

impl<I, E> Cell<I, E>
where
    I: Send + Sync + 'static,
    E: Send + Sync + Clone + 'static,
{
    /// Builds a root cell. `parent_outlet` is the aggregating pipe that
    /// receives this cell's (and transitively, its descendants') egress.
    pub fn root(
        name: Name,
        circuit: Circuit,
        parent_outlet: Arc<dyn Pipe<E>>,
        ingress_composer: Arc<dyn IngressComposer<I, E>>,
        egress_composer: Arc<dyn EgressComposer<E>>,
    ) -> Arc<Self> {
        let subject = Subject::new(name, SubjectType::Cell);
        Self::build(subject, circuit, parent_outlet, ingress_composer, egress_composer)
    }

    fn build(
        subject: Subject,
        circuit: Circuit,
        parent_outlet: Arc<dyn Pipe<E>>,
        ingress_composer: Arc<dyn IngressComposer<I, E>>,
        egress_composer: Arc<dyn EgressComposer<E>>,
    ) -> Arc<Self> {
        let hub_subject = Subject::new(subject.name().child("hub").unwrap_or_else(|_| subject.name().clone()), SubjectType::Conduit)
            .enclosed_by(subject.clone());
        let hub = Conduit::new(
            hub_subject,
            circuit.clone(),
            Arc::new(HubForwardComposer::<E> {
                _marker: std::marker::PhantomData,
            }),
        );

        // The hub's single subscriber forwards every value it sees to the
        // parent's outlet by re-enqueueing through the circuit — breaking
        // the synchronous call chain regardless of tree depth.
        let parent_outlet_for_sub = parent_outlet.clone();
        let circuit_for_sub = circuit.clone();
        let subscriber = FunctionSubscriber::new(move |_subject: &Subject, registrar: &mut dyn Registrar<E>| {
            let target = parent_outlet_for_sub.clone();
            let dispatched = circuit_for_sub.pipe(target);
            registrar.register(dispatched)
        });
        let _subscription = hub
            .subscribe(Arc::new(subscriber))
            .expect("hub subscription on a freshly created conduit cannot fail");

        let hub_percept = hub
            .percept(Name::from_part("egress").expect("literal name segment is never empty"))
            .expect("hub percept composition cannot fail for an identity-like composer");

        let own_egress = egress_composer.compose(&subject, hub_percept);
        let ingress = ingress_composer.compose(&subject, own_egress.clone());

        Arc::new(Self {
            subject,
            circuit,
            ingress_composer,
            egress_composer,
            parent_outlet,
            hub,
            own_egress,
            ingress,
            state: Mutex::new(CellState {
                children: HashMap::new(),
            }),
        })
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// The circuit this cell (and all its children) runs on.
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// This cell's outward-facing input pipe.
    pub fn ingress(&self) -> Arc<dyn Pipe<I>> {
        self.ingress.clone()
    }

    /// This cell's own aggregating egress pipe, the one child cells feed
    /// into as their `parent_outlet`.
    pub fn outlet(&self) -> Arc<dyn Pipe<E>> {
        self.own_egress.clone()
    }

    /// Returns the child named `name`, creating it (inheriting this
    /// cell's circuit, ingress/egress composers) on first request.
    pub fn child(self: &Arc<Self>, name: Name) -> Arc<Cell<I, E>> {
        {
            let state = self.state.lock();
            if let Some(c) = state.children.get(&name) {
                return c.clone();
            }
        }
        let mut state = self.state.lock();
        if let Some(c) = state.children.get(&name) {
            return c.clone();
        }
        let child_subject = Subject::new(name.clone(), SubjectType::Cell).enclosed_by(self.subject.clone());
        let child = Cell::build(
            child_subject,
            self.circuit.clone(),
            self.outlet(),
            self.ingress_composer.clone(),
            self.egress_composer.clone(),
        );
        state.children.insert(name, child.clone());
        child
    }

    /// The parent's aggregating outlet this cell feeds into; `None` for
    /// a root cell whose `parent_outlet` is an external target rather
    /// than another cell.
    pub fn enclosure(&self) -> Option<&Subject> {
        self.subject.enclosure()
    }
}

impl<I, E> Substrate for Cell<I, E> {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl<I: Send + Sync + 'static, E: Send + Sync + 'static> Resource for Cell<I, E> {
    fn close(&self) -> SubstratesResult<()> {
        self.hub.close()?;
        for (_, child) in self.state.lock().children.drain() {
            if let Err(e) = child.close() {
                let failure = SubstratesError::callback_failure(e.to_string());
                tracing::warn!(error = %failure, "child cell close failed");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }
}

/// A same-typed ingress/egress cell whose ingress pipe is simply its
/// outlet: input and aggregated output share one type. Covers the common
/// case where the spec's distinct `I`/`E` composer slots collapse to the
/// identity.
pub fn identity_egress<E: Send + Sync + 'static>() -> Arc<dyn EgressComposer<E>> {
    Arc::new(IdentityEgress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::sink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passthrough_ingress<E: Send + Sync + Clone + 'static>() -> Arc<dyn IngressComposer<E, E>> {
        Arc::new(|_subject: &Subject, outlet: Arc<dyn Pipe<E>>| outlet)
    }

    #[test]
    fn deep_chain_of_cells_does_not_overflow_the_stack() {
        let circuit = Circuit::new(Name::from_part("cell-root").unwrap());
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        let root_outlet: Arc<dyn Pipe<i32>> = sink(move |v| {
            received2.fetch_add(v as usize, Ordering::SeqCst);
            Ok(())
        });

        let mut current = Cell::<i32, i32>::root(
            Name::from_part("cell-0").unwrap(),
            circuit.clone(),
            root_outlet,
            passthrough_ingress(),
            identity_egress(),
        );
        for i in 1..500 {
            current = current.child(Name::from_part(&format!("cell-{i}")).unwrap());
        }

        current.ingress().emit(7).unwrap();
        circuit.await_quiescence().unwrap();
        // Each of the 500 hub re-enqueues runs to completion before the
        // sentinel completes, so the value has fully propagated by now.
        assert_eq!(received.load(Ordering::SeqCst), 7);
        circuit.close();
    }

    #[test]
    fn child_lookup_by_name_is_stable() {
        let circuit = Circuit::new(Name::from_part("cell-lookup").unwrap());
        let root_outlet: Arc<dyn Pipe<i32>> = sink(|_| Ok(()));
        let root = Cell::<i32, i32>::root(
            Name::from_part("root").unwrap(),
            circuit.clone(),
            root_outlet,
            passthrough_ingress(),
            identity_egress(),
        );
        let a = root.child(Name::from_part("a").unwrap());
        let b = root.child(Name::from_part("a").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        circuit.close();
    }
}
