//! Integration tests against the literal scenarios and universal invariants
//! of the emission fabric: deterministic ordering, cascading priority,
//! lazy subscriber callbacks, cell stack safety, diff+guard composition,
//! and scope LIFO teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use substrates::{
    cell::{identity_egress, Cell, IngressComposer},
    channel::{Composer, Conduit, FunctionSubscriber, IdentityComposer, PipeComposer, Registrar},
    circuit::Circuit,
    flow::Flow,
    name::Name,
    pipe::{sink, Pipe},
    reservoir::Reservoir,
    scope::Scope,
    subject::{Subject, SubjectType},
};

fn new_conduit<P, E>(circuit: &Circuit, name: &str, composer: impl Composer<P, E> + 'static) -> Arc<Conduit<P, E>>
where
    P: Clone + Send + Sync + 'static,
    E: Send + Sync + Clone + 'static,
{
    let subject = Subject::new(Name::from_part(name).unwrap(), SubjectType::Conduit)
        .enclosed_by(circuit.subject().clone());
    Conduit::new(subject, circuit.clone(), Arc::new(composer))
}

/// Scenario 1: two conduits on one circuit, two producer threads, a
/// reservoir observing a total order consistent with each producer's own
/// per-channel ordering.
#[test]
fn deterministic_ordering_across_producer_threads() {
    let circuit = Circuit::new(Name::from_part("ordering").unwrap());
    let conduit = new_conduit::<Arc<dyn Pipe<i32>>, i32>(&circuit, "c", PipeComposer::new());
    let reservoir = Reservoir::new(Name::from_part("res").unwrap(), &conduit).unwrap();

    let ch1 = conduit.percept(Name::from_part("ch1").unwrap()).unwrap();
    let ch2 = conduit.percept(Name::from_part("ch2").unwrap()).unwrap();

    let ch1_for_a = ch1.clone();
    let thread_a = thread::spawn(move || {
        ch1_for_a.emit(1).unwrap();
        ch1_for_a.emit(2).unwrap();
    });
    let thread_b = thread::spawn(move || {
        ch2.emit(9).unwrap();
    });
    thread_a.join().unwrap();
    thread_b.join().unwrap();

    circuit.await_quiescence().unwrap();

    let captures = reservoir.drain();
    let ch1_values: Vec<i32> = captures
        .iter()
        .filter(|c| c.subject().name().to_path() == "ch1")
        .map(|c| *c.emission())
        .collect();
    assert_eq!(ch1_values, vec![1, 2]);

    let ch2_values: Vec<i32> = captures
        .iter()
        .filter(|c| c.subject().name().to_path() == "ch2")
        .map(|c| *c.emission())
        .collect();
    assert_eq!(ch2_values, vec![9]);

    circuit.close();
}

/// Scenario 2: a subscriber on channel A forwards to channel B; a
/// subscriber on B appends to a log. Cascading priority means the full
/// A=1 reaction (including its B append) completes before A=2 is even
/// observed.
#[test]
fn cascading_priority_orders_full_reactions_before_the_next_ingress_item() {
    let circuit = Circuit::new(Name::from_part("cascade").unwrap());
    let conduit = new_conduit::<Arc<dyn Pipe<i32>>, i32>(&circuit, "c", PipeComposer::new());

    let log = Arc::new(Mutex::new(Vec::new()));

    let a = conduit.percept(Name::from_part("A").unwrap()).unwrap();
    let b = conduit.percept(Name::from_part("B").unwrap()).unwrap();

    let b_for_sub = b.clone();
    let a_subscriber = FunctionSubscriber::new(move |_subject: &Subject, registrar: &mut dyn Registrar<i32>| {
        let b_for_emit = b_for_sub.clone();
        registrar.register(sink(move |v: i32| b_for_emit.emit(v)))
    });
    let _sub_a = conduit.subscribe(Arc::new(a_subscriber)).unwrap();

    let log_for_sub = log.clone();
    let b_subscriber = FunctionSubscriber::new(move |_subject: &Subject, registrar: &mut dyn Registrar<i32>| {
        let log_for_emit = log_for_sub.clone();
        registrar.register(sink(move |v: i32| {
            log_for_emit.lock().unwrap().push(format!("B(from {v})"));
            Ok(())
        }))
    });
    let _sub_b = conduit.subscribe(Arc::new(b_subscriber)).unwrap();

    a.emit(1).unwrap();
    a.emit(2).unwrap();
    circuit.await_quiescence().unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["B(from 1)".to_string(), "B(from 2)".to_string()]);
    circuit.close();
}

/// Scenario 3: `percept("X")` then `subscribe(sub)` then emit 7; the
/// subscriber's callback fires exactly once, during delivery of 7, and the
/// registered pipe receives 7.
#[test]
fn lazy_subscriber_callback_fires_on_first_post_registration_emission() {
    let circuit = Circuit::new(Name::from_part("lazy").unwrap());
    let conduit = new_conduit::<Arc<dyn Pipe<i32>>, i32>(&circuit, "c", PipeComposer::new());

    let x = conduit.percept(Name::from_part("X").unwrap()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_sub = calls.clone();
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_sub = received.clone();
    let subscriber = FunctionSubscriber::new(move |subject: &Subject, registrar: &mut dyn Registrar<i32>| {
        assert_eq!(subject.name().to_path(), "X");
        calls_for_sub.fetch_add(1, Ordering::SeqCst);
        let received_for_emit = received_for_sub.clone();
        registrar.register(sink(move |v: i32| {
            received_for_emit.lock().unwrap().push(v);
            Ok(())
        }))
    });
    let _subscription = conduit.subscribe(Arc::new(subscriber)).unwrap();

    x.emit(7).unwrap();
    circuit.await_quiescence().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*received.lock().unwrap(), vec![7]);
    circuit.close();
}

/// Scenario 4: a 500-deep chain of cells, each forwarding its input
/// upward; emitting once at the leaf must reach the root with no stack
/// overflow, because upward propagation re-enqueues through the circuit
/// instead of recursing synchronously.
#[test]
fn five_hundred_deep_cell_chain_is_stack_safe() {
    let circuit = Circuit::new(Name::from_part("cells").unwrap());
    let received = Arc::new(AtomicUsize::new(0));
    let received_for_root = received.clone();
    let root_outlet: Arc<dyn Pipe<i32>> = sink(move |v| {
        received_for_root.fetch_add(v as usize, Ordering::SeqCst);
        Ok(())
    });

    let passthrough: Arc<dyn IngressComposer<i32, i32>> =
        Arc::new(|_subject: &Subject, outlet: Arc<dyn Pipe<i32>>| outlet);

    let mut current = Cell::<i32, i32>::root(
        Name::from_part("cell-0").unwrap(),
        circuit.clone(),
        root_outlet,
        passthrough.clone(),
        identity_egress(),
    );
    for i in 1..500 {
        current = current.child(Name::from_part(&format!("cell-{i}")).unwrap());
    }

    current.ingress().emit(7).unwrap();
    circuit.await_quiescence().unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 7);
    circuit.close();
}

/// Scenario 5: `diff().guard(v > 0)` on `[1,1,2,2,-1,-1,3]` emits
/// `[1,2,3]`.
#[test]
fn diff_then_guard_matches_the_reference_scenario() {
    let out = Arc::new(Mutex::new(Vec::new()));
    let out_for_sink = out.clone();
    let downstream: Arc<dyn Pipe<i64>> = sink(move |v| {
        out_for_sink.lock().unwrap().push(v);
        Ok(())
    });

    let mut flow = Flow::<i64>::new();
    flow.diff().unwrap().guard(|v| *v > 0).unwrap();
    flow.seal();
    let entry = flow.materialize(downstream);

    for v in [1, 1, 2, 2, -1, -1, 3] {
        entry.emit(v).unwrap();
    }
    assert_eq!(*out.lock().unwrap(), vec![1, 2, 3]);
}

/// Scenario 6: registering R1, R2, R3 then closing the scope closes in
/// order R3, R2, R1; a failure in R2's close does not prevent R1 from
/// closing.
#[test]
fn scope_close_is_lifo_and_survives_individual_resource_failure() {
    use substrates::error::SubstratesError;
    use substrates::subject::{Resource, Substrate};

    struct TrackedResource {
        subject: Subject,
        id: usize,
        order: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl Substrate for TrackedResource {
        fn subject(&self) -> &Subject {
            &self.subject
        }
    }

    impl Resource for TrackedResource {
        fn close(&self) -> substrates::error::SubstratesResult<()> {
            self.order.lock().unwrap().push(self.id);
            if self.fail {
                Err(SubstratesError::internal("close failed"))
            } else {
                Ok(())
            }
        }
    }

    let scope = Scope::new(Name::from_part("s").unwrap());
    let order = Arc::new(Mutex::new(Vec::new()));
    for (id, fail) in [(1, false), (2, true), (3, false)] {
        scope
            .register(Arc::new(TrackedResource {
                subject: Subject::new(Name::from_part(&format!("r{id}")).unwrap(), SubjectType::Scope),
                id,
                order: order.clone(),
                fail,
            }))
            .unwrap();
    }

    scope.close();
    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
}

/// Percept lookups for the same `(conduit, name)` always return the
/// identical object (universal invariant, spec.md §8).
#[test]
fn percept_lookups_are_identity_stable() {
    let circuit = Circuit::new(Name::from_part("percept-identity").unwrap());
    let conduit = new_conduit::<Arc<substrates::channel::Channel<i32>>, i32>(
        &circuit,
        "c",
        IdentityComposer::new(),
    );
    let a = conduit.percept(Name::from_part("x").unwrap()).unwrap();
    let b = conduit.percept(Name::from_part("x").unwrap()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    circuit.close();
}
