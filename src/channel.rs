//! Channel / Conduit / Subscriber / Registrar: the dynamic-wiring
//! subsystem. A channel is pooled by name within a conduit; delivery
//! lazily rebuilds the channel's sink list against the conduit's
//! subscription bus, invoking each newly registered subscriber's
//! callback exactly once per (subscription, channel) pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::circuit::Circuit;
use crate::error::{SubstratesError, SubstratesResult};
use crate::flow::Flow;
use crate::name::Name;
use crate::pipe::Pipe;
use crate::subject::{Resource, Subject, SubjectType, Substrate};

/// A callback-scoped handle for attaching sink pipes to a channel during
/// a subscriber's callback. Valid only for the duration of that call —
/// enforced structurally, since a fresh instance is created per rebuild
/// and dropped when the callback returns.
pub trait Registrar<E> {
    fn register(&mut self, pipe: Arc<dyn Pipe<E>>) -> SubstratesResult<()>;
}

struct RegistrarImpl<E> {
    pipes: Vec<Arc<dyn Pipe<E>>>,
}

impl<E> Registrar<E> for RegistrarImpl<E> {
    fn register(&mut self, pipe: Arc<dyn Pipe<E>>) -> SubstratesResult<()> {
        self.pipes.push(pipe);
        Ok(())
    }
}

/// Invoked on a channel's first post-registration emission; wires sink
/// pipes onto that channel via the supplied `Registrar`.
pub trait Subscriber<E>: Send + Sync {
    fn accept(&self, subject: &Subject, registrar: &mut dyn Registrar<E>) -> SubstratesResult<()>;
}

/// A `Subscriber` built from a plain closure.
pub struct FunctionSubscriber<E, F> {
    func: F,
    _marker: std::marker::PhantomData<fn(E)>,
}

impl<E, F> FunctionSubscriber<E, F>
where
    F: Fn(&Subject, &mut dyn Registrar<E>) -> SubstratesResult<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E, F> Subscriber<E> for FunctionSubscriber<E, F>
where
    E: Send + Sync,
    F: Fn(&Subject, &mut dyn Registrar<E>) -> SubstratesResult<()> + Send + Sync,
{
    fn accept(&self, subject: &Subject, registrar: &mut dyn Registrar<E>) -> SubstratesResult<()> {
        (self.func)(subject, registrar)
    }
}

/// A live registration on a source's subscription bus. `close` schedules
/// removal; the removal becomes effective on each channel's next
/// emission ("lazy rebuild" for teardown).
pub trait Subscription: Resource {}

enum BusEvent<E> {
    Added(u64, Arc<dyn Subscriber<E>>),
    Removed(u64),
}

impl<E> Clone for BusEvent<E> {
    fn clone(&self) -> Self {
        match self {
            BusEvent::Added(id, s) => BusEvent::Added(*id, s.clone()),
            BusEvent::Removed(id) => BusEvent::Removed(*id),
        }
    }
}

/// Per-source subscriber set, version counter, lazy-rebuild trigger.
///
/// The event log doubles as the version counter (`log.len()`); each
/// channel tracks how far into the log it has processed, so a subscriber
/// is invoked on a given channel exactly once no matter how many times
/// the bus's version advances afterward.
pub(crate) struct SubscriptionBus<E> {
    log: Mutex<Vec<BusEvent<E>>>,
    next_id: AtomicU64,
}

impl<E> SubscriptionBus<E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn add(&self, subscriber: Arc<dyn Subscriber<E>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(BusEvent::Added(id, subscriber));
        id
    }

    fn remove(&self, id: u64) {
        self.log.lock().push(BusEvent::Removed(id));
    }

    fn events_since(&self, cursor: usize) -> (Vec<BusEvent<E>>, usize) {
        let log = self.log.lock();
        (log[cursor.min(log.len())..].to_vec(), log.len())
    }
}

struct SubscriptionHandle<E> {
    subject: Subject,
    bus: Arc<SubscriptionBus<E>>,
    id: u64,
    circuit: Circuit,
    closed: AtomicBool,
}

impl<E> Substrate for SubscriptionHandle<E> {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl<E: Send + Sync + 'static> Resource for SubscriptionHandle<E> {
    fn close(&self) -> SubstratesResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let bus = self.bus.clone();
        let id = self.id;
        // Best-effort: a closed circuit means the registration never
        // became visible to any channel in the first place.
        let _ = self.circuit.accept(Box::new(move || bus.remove(id)));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<E: Send + Sync + 'static> Subscription for SubscriptionHandle<E> {}

struct ChannelState<E> {
    sinks: Vec<(u64, Arc<dyn Pipe<E>>)>,
    cursor: usize,
}

/// Named emission port within a conduit: subject, sink pipe list, and the
/// lazy-rebuild bookkeeping against its owning conduit's subscription
/// bus. Pooled by name — two `percept()` calls for the same name return
/// handles over the identical `Channel`.
pub struct Channel<E> {
    subject: Subject,
    circuit: Circuit,
    bus: Arc<SubscriptionBus<E>>,
    state: Mutex<ChannelState<E>>,
}

impl<E: Send + Sync + Clone + 'static> Channel<E> {
    fn new(subject: Subject, circuit: Circuit, bus: Arc<SubscriptionBus<E>>) -> Arc<Self> {
        Arc::new(Self {
            subject,
            circuit,
            bus,
            state: Mutex::new(ChannelState {
                sinks: Vec::new(),
                cursor: 0,
            }),
        })
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// An emission handle with no per-call flow.
    pub fn pipe(self: &Arc<Self>) -> Arc<dyn Pipe<E>> {
        Arc::new(ChannelEmissionHandle {
            channel: self.clone(),
            entry: self.delivery_pipe(),
        })
    }

    /// An emission handle with a per-call flow, configured by `configure`.
    /// The flow is materialized once, here, and its operator state is
    /// private to this handle.
    pub fn pipe_with<F>(self: &Arc<Self>, configure: F) -> SubstratesResult<Arc<dyn Pipe<E>>>
    where
        E: crate::flow::FlowValue,
        F: FnOnce(&mut Flow<E>) -> SubstratesResult<()>,
    {
        let mut flow = Flow::<E>::new();
        configure(&mut flow)?;
        flow.seal();
        let entry = flow.materialize(self.delivery_pipe());
        Ok(Arc::new(ChannelEmissionHandle {
            channel: self.clone(),
            entry,
        }))
    }

    fn delivery_pipe(self: &Arc<Self>) -> Arc<dyn Pipe<E>> {
        Arc::new(ChannelDeliveryPipe {
            channel: self.clone(),
        })
    }

    /// Invoked on the circuit worker: rebuild sinks against new bus
    /// activity if the local cursor is behind, then forward through the
    /// current sink list in registration order.
    fn deliver(&self, value: E) -> SubstratesResult<()> {
        self.rebuild();
        self.forward(value)
    }

    fn rebuild(&self) {
        let mut state = self.state.lock();
        let (events, new_cursor) = self.bus.events_since(state.cursor);
        for event in events {
            match event {
                BusEvent::Added(id, subscriber) => {
                    let mut registrar = RegistrarImpl { pipes: Vec::new() };
                    match subscriber.accept(&self.subject, &mut registrar) {
                        Ok(()) => {
                            for pipe in registrar.pipes {
                                state.sinks.push((id, pipe));
                            }
                        }
                        Err(e) => {
                            let failure = SubstratesError::callback_failure(e.to_string());
                            tracing::warn!(error = %failure, channel = %self.subject.name(), "subscriber callback failed");
                        }
                    }
                }
                BusEvent::Removed(id) => {
                    state.sinks.retain(|(sid, _)| *sid != id);
                }
            }
        }
        state.cursor = new_cursor;
    }

    fn forward(&self, value: E) -> SubstratesResult<()> {
        let sinks: Vec<Arc<dyn Pipe<E>>> = {
            let state = self.state.lock();
            state.sinks.iter().map(|(_, p)| p.clone()).collect()
        };
        for sink in sinks {
            sink.emit(value.clone())?;
        }
        Ok(())
    }
}

struct ChannelDeliveryPipe<E: Send + Sync + Clone + 'static> {
    channel: Arc<Channel<E>>,
}

impl<E: Send + Sync + Clone + 'static> Pipe<E> for ChannelDeliveryPipe<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        self.channel.deliver(value)
    }
}

struct ChannelEmissionHandle<E: Send + Sync + Clone + 'static> {
    channel: Arc<Channel<E>>,
    entry: Arc<dyn Pipe<E>>,
}

impl<E: Send + Sync + Clone + 'static> Pipe<E> for ChannelEmissionHandle<E> {
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let entry = self.entry.clone();
        self.channel.circuit.accept(Box::new(move || {
            if let Err(e) = entry.emit(value) {
                let failure = SubstratesError::callback_failure(e.to_string());
                tracing::warn!(error = %failure, "channel delivery failed");
            }
        }))
    }
}

/// Pure function `Channel → Percept`, invoked at most once per name.
pub trait Composer<P, E>: Send + Sync {
    fn compose(&self, channel: Arc<Channel<E>>) -> SubstratesResult<P>;
}

/// Returns the channel itself as the percept.
pub struct IdentityComposer<E>(std::marker::PhantomData<fn(E)>);

impl<E> IdentityComposer<E> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<E> Default for IdentityComposer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync + Clone + 'static> Composer<Arc<Channel<E>>, E> for IdentityComposer<E> {
    fn compose(&self, channel: Arc<Channel<E>>) -> SubstratesResult<Arc<Channel<E>>> {
        Ok(channel)
    }
}

/// Returns a plain (no per-call flow) emission pipe over the channel.
pub struct PipeComposer<E>(std::marker::PhantomData<fn(E)>);

impl<E> PipeComposer<E> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<E> Default for PipeComposer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync + Clone + 'static> Composer<Arc<dyn Pipe<E>>, E> for PipeComposer<E> {
    fn compose(&self, channel: Arc<Channel<E>>) -> SubstratesResult<Arc<dyn Pipe<E>>> {
        Ok(channel.pipe())
    }
}

struct ConduitState<P, E> {
    percepts: HashMap<Name, P>,
    channels: HashMap<Name, Arc<Channel<E>>>,
}

/// Composer-driven percept pool bridging channels and subscribers.
pub struct Conduit<P, E> {
    subject: Subject,
    circuit: Circuit,
    composer: Arc<dyn Composer<P, E>>,
    bus: Arc<SubscriptionBus<E>>,
    state: Mutex<ConduitState<P, E>>,
    closed: AtomicBool,
}

impl<P: Clone + Send + Sync + 'static, E: Send + Sync + Clone + 'static> Conduit<P, E> {
    pub(crate) fn new(subject: Subject, circuit: Circuit, composer: Arc<dyn Composer<P, E>>) -> Arc<Self> {
        Arc::new(Self {
            subject,
            circuit,
            composer,
            bus: SubscriptionBus::new(),
            state: Mutex::new(ConduitState {
                percepts: HashMap::new(),
                channels: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Returns the cached percept for `name`, constructing it (and its
    /// backing channel) on first request. A composer failure does not
    /// cache.
    ///
    /// The composer runs with no lock held: `compose` is arbitrary caller
    /// code and may itself call back into `percept` (including on this
    /// same conduit), which a lock held across the call would deadlock on.
    pub fn percept(&self, name: Name) -> SubstratesResult<P> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubstratesError::closed("conduit is closed"));
        }
        if let Some(p) = self.state.lock().percepts.get(&name) {
            return Ok(p.clone());
        }

        let channel = {
            let mut state = self.state.lock();
            if let Some(p) = state.percepts.get(&name) {
                return Ok(p.clone());
            }
            let channel_subject = Subject::new(name.clone(), SubjectType::Channel).enclosed_by(self.subject.clone());
            state
                .channels
                .entry(name.clone())
                .or_insert_with(|| Channel::new(channel_subject, self.circuit.clone(), self.bus.clone()))
                .clone()
        };

        let percept = self.composer.compose(channel)?;

        let mut state = self.state.lock();
        if let Some(existing) = state.percepts.get(&name) {
            return Ok(existing.clone());
        }
        state.percepts.insert(name, percept.clone());
        Ok(percept)
    }

    /// Enqueues a registration job onto the owning circuit and returns a
    /// handle immediately; closing the handle enqueues an
    /// unregistration job.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<E>>) -> SubstratesResult<Arc<dyn Subscription>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubstratesError::closed("conduit is closed"));
        }
        let id = self.bus.next_id.fetch_add(1, Ordering::SeqCst);
        let bus = self.bus.clone();
        let subscriber_for_job = subscriber;
        self.circuit.accept(Box::new(move || {
            bus.log.lock().push(BusEvent::Added(id, subscriber_for_job));
        }))?;
        let subscription_subject = Subject::new(
            self.subject.name().child("subscription").unwrap_or_else(|_| self.subject.name().clone()),
            SubjectType::Subscription,
        )
        .enclosed_by(self.subject.clone());
        Ok(Arc::new(SubscriptionHandle {
            subject: subscription_subject,
            bus: self.bus.clone(),
            id,
            circuit: self.circuit.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

impl<P, E> Substrate for Conduit<P, E> {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl<P: Send + Sync + 'static, E: Send + Sync + 'static> Resource for Conduit<P, E> {
    fn close(&self) -> SubstratesResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
