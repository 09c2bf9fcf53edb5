//! Circuit: the dual-queue, single-worker execution engine.
//!
//! The worker is a dedicated `std::thread`, not a task on a shared
//! executor: flow-operator state, channel sink lists, and conduit/cell
//! maps must be confined to one thread, never synchronized, and the
//! worker must never suspend mid-item. An async-task-pool model cannot
//! give those guarantees, so the engine is built directly on
//! `std::thread` plus a `crossbeam_channel` ingress queue and a
//! thread-local transit queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{SubstratesError, SubstratesResult};
use crate::name::Name;
use crate::pipe::Pipe;
use crate::subject::{Id, Resource, Subject, SubjectType, Substrate};

/// A unit of work accepted by a circuit: an emission delivery, a
/// subscription (de)registration, a rebuild, or an `await()` sentinel.
/// Heterogeneous work is type-erased into a boxed closure, the standard
/// technique for a single queue carrying many unrelated payload types.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static TRANSIT: RefCell<VecDeque<Job>> = RefCell::new(VecDeque::new());
    static WORKER_OF: RefCell<Option<Id>> = RefCell::new(None);
}

struct CircuitInner {
    subject: Subject,
    ingress_tx: crossbeam_channel::Sender<Job>,
    closed: AtomicBool,
    resources: Mutex<Vec<Arc<dyn Resource + Send + Sync>>>,
}

/// A circuit: one dedicated worker thread, an MPMC ingress queue, and a
/// worker-private transit queue that fully drains before the next
/// ingress item is dequeued (cascading priority, §4.8).
#[derive(Clone)]
pub struct Circuit(Arc<CircuitInner>);

impl Circuit {
    /// Creates a circuit and starts its dedicated worker thread.
    pub fn new(name: Name) -> Self {
        let subject = Subject::new(name, SubjectType::Circuit);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let inner = Arc::new(CircuitInner {
            subject: subject.clone(),
            ingress_tx: tx,
            closed: AtomicBool::new(false),
            resources: Mutex::new(Vec::new()),
        });

        let worker_id = subject.id();
        let worker_inner = inner.clone();
        let thread_name = format!("circuit-{}", subject.name());
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                WORKER_OF.with(|w| *w.borrow_mut() = Some(worker_id));
                Self::run_worker(worker_inner, rx);
            })
            .expect("failed to spawn circuit worker thread");

        Circuit(inner)
    }

    fn run_worker(inner: Arc<CircuitInner>, ingress_rx: crossbeam_channel::Receiver<Job>) {
        tracing::debug!(circuit = %inner.subject.name(), "circuit worker started");
        loop {
            let transit_job = TRANSIT.with(|t| t.borrow_mut().pop_front());
            let job = match transit_job {
                Some(job) => job,
                None => match ingress_rx.recv() {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            job();

            let transit_empty = TRANSIT.with(|t| t.borrow().is_empty());
            if inner.closed.load(Ordering::Acquire) && transit_empty && ingress_rx.is_empty() {
                break;
            }
        }
        tracing::debug!(circuit = %inner.subject.name(), "circuit worker stopped");
    }

    pub fn subject(&self) -> &Subject {
        &self.0.subject
    }

    fn is_on_worker(&self) -> bool {
        WORKER_OF.with(|w| *w.borrow() == Some(self.0.subject.id()))
    }

    /// Accepts a job: onto the transit queue if called from this
    /// circuit's own worker thread, otherwise onto the ingress queue.
    pub(crate) fn accept(&self, job: Job) -> SubstratesResult<()> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(SubstratesError::closed("circuit is closed"));
        }
        if self.is_on_worker() {
            TRANSIT.with(|t| t.borrow_mut().push_back(job));
            Ok(())
        } else {
            self.0
                .ingress_tx
                .send(job)
                .map_err(|_| SubstratesError::closed("circuit is closed"))
        }
    }

    /// Registers a resource (conduit, cell) to be closed transitively
    /// when this circuit closes.
    pub(crate) fn register_resource(&self, resource: Arc<dyn Resource + Send + Sync>) {
        self.0.resources.lock().push(resource);
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Blocks the caller until the worker has processed every item
    /// accepted before this call. Illegal to call from the circuit's own
    /// worker thread (it would deadlock). Returns immediately if the
    /// circuit is already closed.
    pub fn await_quiescence(&self) -> SubstratesResult<()> {
        if self.is_on_worker() {
            return Err(SubstratesError::illegal_state(
                "await() called from the circuit's own worker thread",
            ));
        }
        if self.is_closed() {
            return Ok(());
        }
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        if self.0.ingress_tx.send(Box::new(move || { let _ = tx.send(()); })).is_err() {
            return Ok(());
        }
        let _ = rx.recv();
        Ok(())
    }

    /// Non-blocking, idempotent. Sets the closed flag; the worker
    /// terminates once both queues are drained. Subsequent `conduit()` /
    /// `cell()` calls fail with a closed error.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for resource in self.0.resources.lock().drain(..) {
            if let Err(e) = resource.close() {
                tracing::warn!(error = %e, "resource close failed during circuit shutdown");
            }
        }
        // Wake a worker blocked on `recv()` so it observes the closed flag.
        let _ = self.0.ingress_tx.send(Box::new(|| {}));
    }

    /// Returns a pipe that, on `emit`, enqueues an item invoking
    /// `target.emit(value)` on the worker.
    pub fn pipe<E>(&self, target: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>>
    where
        E: Send + Sync + 'static,
    {
        Arc::new(CircuitDispatchedPipe {
            circuit: self.clone(),
            target,
        })
    }

    /// Starts a repeating tick against `target`, stopped automatically
    /// when this circuit closes (or when the returned `Clock` is
    /// stopped). Not part of the distilled spec; carried over from the
    /// donor crate's `Clock`/`ClockCycle` as an additive, non-load-bearing
    /// convenience.
    pub fn clock(&self, name: Name, period: Duration, target: Arc<dyn Pipe<()>>) -> Clock {
        Clock::start(self.clone(), name, period, target)
    }
}

struct CircuitDispatchedPipe<E> {
    circuit: Circuit,
    target: Arc<dyn Pipe<E>>,
}

impl<E: Send + Sync + 'static> Pipe<E> for CircuitDispatchedPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let target = self.target.clone();
        self.circuit.accept(Box::new(move || {
            if let Err(e) = target.emit(value) {
                tracing::warn!(error = %e, "pipe emit failed on circuit worker");
            }
        }))
    }
}

/// A periodic tick scheduled onto a circuit's ingress queue from a
/// background timer thread.
pub struct Clock {
    subject: Subject,
    stop: Arc<AtomicBool>,
}

impl Clock {
    fn start(circuit: Circuit, name: Name, period: Duration, target: Arc<dyn Pipe<()>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let subject = Subject::new(name, SubjectType::Clock).enclosed_by(circuit.subject().clone());
        thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) && !circuit.is_closed() {
                thread::sleep(period);
                if stop_flag.load(Ordering::Acquire) || circuit.is_closed() {
                    break;
                }
                let target = target.clone();
                let _ = circuit.accept(Box::new(move || {
                    if let Err(e) = target.emit(()) {
                        tracing::warn!(error = %e, "clock tick failed");
                    }
                }));
            }
        });
        Clock { subject, stop }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Substrate for Clock {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::sink;
    use std::sync::atomic::AtomicI64;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    #[test]
    fn accepted_emissions_are_delivered_in_acceptance_order() {
        let circuit = Circuit::new(Name::from_part("c1").unwrap());
        let out = Arc::new(StdMutex::new(Vec::new()));
        let out2 = out.clone();
        let target = sink::<i32, _>(move |v| {
            out2.lock().unwrap().push(v);
            Ok(())
        });
        let entry = circuit.pipe(target);
        entry.emit(1).unwrap();
        entry.emit(2).unwrap();
        entry.emit(3).unwrap();
        circuit.await_quiescence().unwrap();
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3]);
        circuit.close();
    }

    #[test]
    fn await_from_worker_thread_is_illegal_state() {
        let circuit = Circuit::new(Name::from_part("c2").unwrap());
        let circuit2 = circuit.clone();
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        let target = sink::<(), _>(move |_| {
            *result2.lock().unwrap() = Some(circuit2.await_quiescence());
            Ok(())
        });
        let entry = circuit.pipe(target);
        entry.emit(()).unwrap();
        circuit.await_quiescence().unwrap();
        assert!(result.lock().unwrap().take().unwrap().is_err());
        circuit.close();
    }

    #[test]
    fn close_is_idempotent_and_drains_pending_work() {
        let circuit = Circuit::new(Name::from_part("c3").unwrap());
        let count = Arc::new(AtomicI64::new(0));
        let count2 = count.clone();
        let target = sink::<i32, _>(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let entry = circuit.pipe(target);
        for v in 0..5 {
            entry.emit(v).unwrap();
        }
        circuit.close();
        circuit.close();
        thread::sleep(StdDuration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(entry.emit(99).is_err());
    }
}
