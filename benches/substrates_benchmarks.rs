use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use substrates::cell::{identity_egress, Cell, IngressComposer};
use substrates::channel::{Conduit, IdentityComposer};
use substrates::circuit::Circuit;
use substrates::flow::Flow;
use substrates::name::Name;
use substrates::pipe::{discard, sink, Pipe};
use substrates::subject::{Subject, SubjectType};

fn bench_channel_emission_throughput(c: &mut Criterion) {
    let circuit = Circuit::new(Name::from_part("bench-channel").unwrap());
    let subject = Subject::new(Name::from_part("conduit").unwrap(), SubjectType::Conduit)
        .enclosed_by(circuit.subject().clone());
    let conduit = Conduit::<Arc<substrates::channel::Channel<i64>>, i64>::new(
        subject,
        circuit.clone(),
        Arc::new(IdentityComposer::new()),
    );
    let channel = conduit.percept(Name::from_part("x").unwrap()).unwrap();
    let entry = channel.pipe();

    c.bench_function("channel_emission_accept", |b| {
        b.iter(|| entry.emit(1).unwrap());
    });

    circuit.await_quiescence().unwrap();
    circuit.close();
}

fn bench_flow_materialization(c: &mut Criterion) {
    let downstream: Arc<dyn Pipe<i64>> = discard();

    c.bench_function("flow_diff_guard_limit_materialize_and_emit", |b| {
        b.iter(|| {
            let mut flow = Flow::<i64>::new();
            flow.diff().unwrap().guard(|v| *v > 0).unwrap().limit(1000).unwrap();
            flow.seal();
            let entry = flow.materialize(downstream.clone());
            for v in 0..100 {
                entry.emit(v).unwrap();
            }
        });
    });
}

fn bench_cell_hub_reenqueue_depth(c: &mut Criterion) {
    let circuit = Circuit::new(Name::from_part("bench-cells").unwrap());
    let root_outlet: Arc<dyn Pipe<i32>> = sink(|_| Ok(()));
    let passthrough: Arc<dyn IngressComposer<i32, i32>> =
        Arc::new(|_subject: &Subject, outlet: Arc<dyn Pipe<i32>>| outlet);

    let mut leaf = Cell::<i32, i32>::root(
        Name::from_part("cell-0").unwrap(),
        circuit.clone(),
        root_outlet,
        passthrough.clone(),
        identity_egress(),
    );
    for i in 1..50 {
        leaf = leaf.child(Name::from_part(&format!("cell-{i}")).unwrap());
    }

    c.bench_function("cell_50_deep_hub_reenqueue", |b| {
        b.iter(|| {
            leaf.ingress().emit(1).unwrap();
            circuit.await_quiescence().unwrap();
        });
    });

    circuit.close();
}

criterion_group!(
    substrates_benches,
    bench_channel_emission_throughput,
    bench_flow_materialization,
    bench_cell_hub_reenqueue_depth
);
criterion_main!(substrates_benches);
