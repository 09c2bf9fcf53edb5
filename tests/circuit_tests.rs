use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use substrates::{Circuit, Name, Pipe};

#[test]
fn circuit_subject_carries_its_name() {
    let circuit = Circuit::new(Name::from_part("test-circuit").unwrap());
    assert_eq!(circuit.subject().name().to_path(), "test-circuit");
    circuit.close();
}

#[test]
fn dispatched_pipe_preserves_acceptance_order() {
    let circuit = Circuit::new(Name::from_part("ordering-circuit").unwrap());
    let out = Arc::new(std::sync::Mutex::new(Vec::new()));
    let out2 = out.clone();
    let target = substrates::sink::<i32, _>(move |v| {
        out2.lock().unwrap().push(v);
        Ok(())
    });
    let entry = circuit.pipe(target);
    for v in 0..20 {
        entry.emit(v).unwrap();
    }
    circuit.await_quiescence().unwrap();
    assert_eq!(*out.lock().unwrap(), (0..20).collect::<Vec<_>>());
    circuit.close();
}

#[test]
fn await_quiescence_observes_all_prior_state_updates() {
    let circuit = Circuit::new(Name::from_part("visibility-circuit").unwrap());
    let total = Arc::new(AtomicI64::new(0));
    let total2 = total.clone();
    let target = substrates::sink::<i64, _>(move |v| {
        total2.fetch_add(v, Ordering::SeqCst);
        Ok(())
    });
    let entry = circuit.pipe(target);
    for v in 1..=100 {
        entry.emit(v).unwrap();
    }
    circuit.await_quiescence().unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 5050);
    circuit.close();
}

#[test]
fn close_rejects_further_emissions() {
    let circuit = Circuit::new(Name::from_part("closing-circuit").unwrap());
    let target = substrates::discard::<i32>();
    let entry = circuit.pipe(target);
    circuit.close();
    assert!(entry.emit(1).is_err());
}
