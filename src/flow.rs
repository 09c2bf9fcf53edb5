//! Flow: a builder of stateful pipeline operators, materialized once per
//! call into a linear pipe chain.
//!
//! A `Flow<E>` is only valid within its configuration callback — the
//! "temporal" contract from the component design: builder methods after
//! materialization are rejected with an illegal-state error so a retained
//! reference cannot silently keep mutating a chain that has already been
//! wired into a channel.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{SubstratesError, SubstratesResult};
use crate::pipe::Pipe;

/// Values usable in a `Flow` must be comparable and cheap to duplicate;
/// every stateful operator in the contract table (`diff`, `guard`,
/// `sift`) needs at least one of these bounds.
pub trait FlowValue: Clone + PartialEq + PartialOrd + Send + Sync + 'static {}
impl<T: Clone + PartialEq + PartialOrd + Send + Sync + 'static> FlowValue for T {}

trait StageFactory<E>: Send + Sync {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>>;
}

/// Builder of an ordered operator chain. Obtain one via a channel's
/// configuring `pipe(|flow| ...)` call; do not retain it afterward.
pub struct Flow<E> {
    stages: Vec<Box<dyn StageFactory<E>>>,
    active: AtomicBool,
}

impl<E: FlowValue> Flow<E> {
    pub(crate) fn new() -> Self {
        Flow {
            stages: Vec::new(),
            active: AtomicBool::new(true),
        }
    }

    fn check_active(&self) -> SubstratesResult<()> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SubstratesError::illegal_state(
                "Flow used outside its configuration callback",
            ))
        }
    }

    /// Seals the builder; called once the configuration callback returns.
    pub(crate) fn seal(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Materializes the declared stages, in declaration order, into a
    /// chain that terminates at `downstream`.
    pub(crate) fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        let mut current = downstream;
        for stage in self.stages.iter().rev() {
            current = stage.materialize(current);
        }
        current
    }

    /// Emits iff `value != previous`; the first emission always passes.
    pub fn diff(&mut self) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        self.stages.push(Box::new(DiffFactory { initial: None }));
        Ok(self)
    }

    /// Like `diff`, but the first comparison is made against `initial`.
    pub fn diff_with(&mut self, initial: E) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        self.stages.push(Box::new(DiffFactory {
            initial: Some(initial),
        }));
        Ok(self)
    }

    /// Emits iff `pred(value)`.
    pub fn guard<F>(&mut self, pred: F) -> SubstratesResult<&mut Self>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.check_active()?;
        self.stages.push(Box::new(GuardFactory {
            pred: Arc::new(pred),
        }));
        Ok(self)
    }

    /// Emits iff `bipred(previous, value)`; `previous` becomes `value` on
    /// every pass.
    pub fn guard_with<F>(&mut self, initial: E, bipred: F) -> SubstratesResult<&mut Self>
    where
        F: Fn(&E, &E) -> bool + Send + Sync + 'static,
    {
        self.check_active()?;
        self.stages.push(Box::new(GuardWithFactory {
            initial,
            bipred: Arc::new(bipred),
        }));
        Ok(self)
    }

    /// Passes the first `n` emissions, drops the rest.
    pub fn limit(&mut self, n: u64) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        self.stages.push(Box::new(LimitFactory { n }));
        Ok(self)
    }

    /// Drops the first `n` emissions, passes the rest.
    pub fn skip(&mut self, n: u64) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        self.stages.push(Box::new(SkipFactory { n }));
        Ok(self)
    }

    /// Passes every `k`th emission (the 1st, `k+1`th, `2k+1`th, ...).
    pub fn sample_count(&mut self, k: u64) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        if k == 0 {
            return Err(SubstratesError::validation("sample count must be >= 1"));
        }
        self.stages.push(Box::new(SampleCountFactory { k }));
        Ok(self)
    }

    /// Passes each emission independently with probability `p`.
    pub fn sample_rate(&mut self, p: f64) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        if !(0.0..=1.0).contains(&p) {
            return Err(SubstratesError::validation(
                "sample rate must be within [0, 1]",
            ));
        }
        self.stages.push(Box::new(SampleRateFactory { p }));
        Ok(self)
    }

    /// Invokes `consumer(value)` then forwards the value unchanged.
    pub fn peek<F>(&mut self, consumer: F) -> SubstratesResult<&mut Self>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.check_active()?;
        self.stages.push(Box::new(PeekFactory {
            consumer: Arc::new(consumer),
        }));
        Ok(self)
    }

    /// Tees the emission to `side` before forwarding it downstream.
    pub fn forward(&mut self, side: Arc<dyn Pipe<E>>) -> SubstratesResult<&mut Self> {
        self.check_active()?;
        self.stages.push(Box::new(ForwardFactory { side }));
        Ok(self)
    }

    /// Forwards `op(value)` instead of `value`.
    pub fn replace<F>(&mut self, op: F) -> SubstratesResult<&mut Self>
    where
        F: Fn(E) -> E + Send + Sync + 'static,
    {
        self.check_active()?;
        self.stages.push(Box::new(ReplaceFactory { op: Arc::new(op) }));
        Ok(self)
    }

    /// Emits `acc := op(acc, value)`, starting from `init`.
    pub fn reduce<F>(&mut self, init: E, op: F) -> SubstratesResult<&mut Self>
    where
        F: Fn(E, E) -> E + Send + Sync + 'static,
    {
        self.check_active()?;
        self.stages.push(Box::new(ReduceFactory {
            init,
            op: Arc::new(op),
        }));
        Ok(self)
    }

    /// Begins a comparison-based filtering sub-builder.
    pub fn sift(&mut self) -> SubstratesResult<SiftBuilder<'_, E>> {
        self.check_active()?;
        Ok(SiftBuilder { flow: self })
    }
}

/// Sub-builder for comparison-based filtering, reached via `Flow::sift`.
pub struct SiftBuilder<'a, E> {
    flow: &'a mut Flow<E>,
}

impl<'a, E: FlowValue> SiftBuilder<'a, E> {
    /// Passes values strictly above `lower`.
    pub fn above(self, lower: E) -> &'a mut Flow<E> {
        self.flow.stages.push(Box::new(SiftAboveFactory { lower }));
        self.flow
    }

    /// Passes values strictly below `upper`.
    pub fn below(self, upper: E) -> &'a mut Flow<E> {
        self.flow.stages.push(Box::new(SiftBelowFactory { upper }));
        self.flow
    }

    /// Passes values no greater than `max`.
    pub fn max(self, max: E) -> &'a mut Flow<E> {
        self.flow.stages.push(Box::new(SiftMaxFactory { max }));
        self.flow
    }

    /// Passes values no less than `min`.
    pub fn min(self, min: E) -> &'a mut Flow<E> {
        self.flow.stages.push(Box::new(SiftMinFactory { min }));
        self.flow
    }

    /// Passes values within `[lower, upper]`.
    pub fn range(self, lower: E, upper: E) -> &'a mut Flow<E> {
        self.flow
            .stages
            .push(Box::new(SiftRangeFactory { lower, upper }));
        self.flow
    }

    /// Passes values that represent a new running maximum.
    pub fn high(self) -> &'a mut Flow<E> {
        self.flow.stages.push(Box::new(SiftHighFactory));
        self.flow
    }

    /// Passes values that represent a new running minimum.
    pub fn low(self) -> &'a mut Flow<E> {
        self.flow.stages.push(Box::new(SiftLowFactory));
        self.flow
    }
}

// --- diff ---------------------------------------------------------------

struct DiffFactory<E> {
    initial: Option<E>,
}

impl<E: FlowValue> StageFactory<E> for DiffFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(DiffPipe {
            previous: Mutex::new(self.initial.clone()),
            downstream,
        })
    }
}

struct DiffPipe<E> {
    previous: Mutex<Option<E>>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for DiffPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let mut previous = self.previous.lock();
        let pass = match &*previous {
            None => true,
            Some(p) => *p != value,
        };
        if pass {
            *previous = Some(value.clone());
            drop(previous);
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

// --- guard ---------------------------------------------------------------

struct GuardFactory<E> {
    pred: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E: FlowValue> StageFactory<E> for GuardFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(GuardPipe {
            pred: self.pred.clone(),
            downstream,
        })
    }
}

struct GuardPipe<E> {
    pred: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for GuardPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        if (self.pred)(&value) {
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

struct GuardWithFactory<E> {
    initial: E,
    bipred: Arc<dyn Fn(&E, &E) -> bool + Send + Sync>,
}

impl<E: FlowValue> StageFactory<E> for GuardWithFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(GuardWithPipe {
            previous: Mutex::new(self.initial.clone()),
            bipred: self.bipred.clone(),
            downstream,
        })
    }
}

struct GuardWithPipe<E> {
    previous: Mutex<E>,
    bipred: Arc<dyn Fn(&E, &E) -> bool + Send + Sync>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for GuardWithPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let mut previous = self.previous.lock();
        if (self.bipred)(&previous, &value) {
            *previous = value.clone();
            drop(previous);
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

// --- limit / skip ---------------------------------------------------------

struct LimitFactory {
    n: u64,
}

impl<E: FlowValue> StageFactory<E> for LimitFactory {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(LimitPipe {
            remaining: AtomicU64::new(self.n),
            downstream,
        })
    }
}

struct LimitPipe<E> {
    remaining: AtomicU64,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for LimitPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let prev = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
            if r > 0 {
                Some(r - 1)
            } else {
                None
            }
        });
        if prev.is_ok() {
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

struct SkipFactory {
    n: u64,
}

impl<E: FlowValue> StageFactory<E> for SkipFactory {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(SkipPipe {
            remaining: AtomicU64::new(self.n),
            downstream,
        })
    }
}

struct SkipPipe<E> {
    remaining: AtomicU64,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for SkipPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let dropped = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
            if r > 0 {
                Some(r - 1)
            } else {
                None
            }
        });
        if dropped.is_ok() {
            Ok(())
        } else {
            self.downstream.emit(value)
        }
    }
}

// --- sample ---------------------------------------------------------------

struct SampleCountFactory {
    k: u64,
}

impl<E: FlowValue> StageFactory<E> for SampleCountFactory {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(SampleCountPipe {
            k: self.k,
            seen: AtomicU64::new(0),
            downstream,
        })
    }
}

struct SampleCountPipe<E> {
    k: u64,
    seen: AtomicU64,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for SampleCountPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let index = self.seen.fetch_add(1, Ordering::SeqCst);
        if index % self.k == 0 {
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

struct SampleRateFactory {
    p: f64,
}

impl<E: FlowValue> StageFactory<E> for SampleRateFactory {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(SampleRatePipe {
            p: self.p,
            downstream,
        })
    }
}

struct SampleRatePipe<E> {
    p: f64,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for SampleRatePipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        if rand::thread_rng().gen::<f64>() < self.p {
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

// --- peek / forward / replace / reduce ------------------------------------

struct PeekFactory<E> {
    consumer: Arc<dyn Fn(&E) + Send + Sync>,
}

impl<E: FlowValue> StageFactory<E> for PeekFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(PeekPipe {
            consumer: self.consumer.clone(),
            downstream,
        })
    }
}

struct PeekPipe<E> {
    consumer: Arc<dyn Fn(&E) + Send + Sync>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for PeekPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        (self.consumer)(&value);
        self.downstream.emit(value)
    }
}

struct ForwardFactory<E> {
    side: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> StageFactory<E> for ForwardFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(ForwardPipe {
            side: self.side.clone(),
            downstream,
        })
    }
}

struct ForwardPipe<E> {
    side: Arc<dyn Pipe<E>>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for ForwardPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        self.side.emit(value.clone())?;
        self.downstream.emit(value)
    }
}

struct ReplaceFactory<E> {
    op: Arc<dyn Fn(E) -> E + Send + Sync>,
}

impl<E: FlowValue> StageFactory<E> for ReplaceFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(ReplacePipe {
            op: self.op.clone(),
            downstream,
        })
    }
}

struct ReplacePipe<E> {
    op: Arc<dyn Fn(E) -> E + Send + Sync>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for ReplacePipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        self.downstream.emit((self.op)(value))
    }
}

struct ReduceFactory<E> {
    init: E,
    op: Arc<dyn Fn(E, E) -> E + Send + Sync>,
}

impl<E: FlowValue> StageFactory<E> for ReduceFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(ReducePipe {
            acc: Mutex::new(self.init.clone()),
            op: self.op.clone(),
            downstream,
        })
    }
}

struct ReducePipe<E> {
    acc: Mutex<E>,
    op: Arc<dyn Fn(E, E) -> E + Send + Sync>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for ReducePipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let mut acc = self.acc.lock();
        let next = (self.op)(acc.clone(), value);
        *acc = next.clone();
        drop(acc);
        self.downstream.emit(next)
    }
}

// --- sift ------------------------------------------------------------------

macro_rules! stateless_sift {
    ($factory:ident, $pipe:ident, $field:ident : $field_ty:ty, $test:expr) => {
        struct $factory<E> {
            $field: $field_ty,
        }

        impl<E: FlowValue> StageFactory<E> for $factory<E> {
            fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
                Arc::new($pipe {
                    $field: self.$field.clone(),
                    downstream,
                })
            }
        }

        struct $pipe<E> {
            $field: $field_ty,
            downstream: Arc<dyn Pipe<E>>,
        }

        impl<E: FlowValue> Pipe<E> for $pipe<E> {
            fn emit(&self, value: E) -> SubstratesResult<()> {
                let test: fn(&E, &$field_ty) -> bool = $test;
                if test(&value, &self.$field) {
                    self.downstream.emit(value)
                } else {
                    Ok(())
                }
            }
        }
    };
}

stateless_sift!(SiftAboveFactory, SiftAbovePipe, lower: E, |v, lower| v > lower);
stateless_sift!(SiftBelowFactory, SiftBelowPipe, upper: E, |v, upper| v < upper);
stateless_sift!(SiftMaxFactory, SiftMaxPipe, max: E, |v, max| v <= max);
stateless_sift!(SiftMinFactory, SiftMinPipe, min: E, |v, min| v >= min);

struct SiftRangeFactory<E> {
    lower: E,
    upper: E,
}

impl<E: FlowValue> StageFactory<E> for SiftRangeFactory<E> {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(SiftRangePipe {
            lower: self.lower.clone(),
            upper: self.upper.clone(),
            downstream,
        })
    }
}

struct SiftRangePipe<E> {
    lower: E,
    upper: E,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for SiftRangePipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        if value >= self.lower && value <= self.upper {
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

struct SiftHighFactory;

impl<E: FlowValue> StageFactory<E> for SiftHighFactory {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(SiftHighPipe {
            running: Mutex::new(None),
            downstream,
        })
    }
}

struct SiftHighPipe<E> {
    running: Mutex<Option<E>>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for SiftHighPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let mut running = self.running.lock();
        let pass = match &*running {
            None => true,
            Some(r) => value > *r,
        };
        if pass {
            *running = Some(value.clone());
            drop(running);
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}

struct SiftLowFactory;

impl<E: FlowValue> StageFactory<E> for SiftLowFactory {
    fn materialize(&self, downstream: Arc<dyn Pipe<E>>) -> Arc<dyn Pipe<E>> {
        Arc::new(SiftLowPipe {
            running: Mutex::new(None),
            downstream,
        })
    }
}

struct SiftLowPipe<E> {
    running: Mutex<Option<E>>,
    downstream: Arc<dyn Pipe<E>>,
}

impl<E: FlowValue> Pipe<E> for SiftLowPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let mut running = self.running.lock();
        let pass = match &*running {
            None => true,
            Some(r) => value < *r,
        };
        if pass {
            *running = Some(value.clone());
            drop(running);
            self.downstream.emit(value)
        } else {
            Ok(())
        }
    }
}
