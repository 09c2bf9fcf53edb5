//! Reservoir: an in-memory capture buffer. Subscribes to a source at
//! construction; every emission delivered on the worker is appended with
//! its channel subject. `drain()` atomically swaps the buffer and hands
//! back a restartable snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Conduit, FunctionSubscriber, Registrar, Subscription};
use crate::error::SubstratesResult;
use crate::name::Name;
use crate::pipe::{sink, Capture};
use crate::subject::{Resource, Subject, SubjectType, Substrate};

/// A restartable, already-materialized sequence of captures — "restartable"
/// meaning it can be iterated more than once, since a drained snapshot is
/// consumed out of the live buffer exactly once but may be replayed freely.
#[derive(Clone)]
pub struct Drained<E>(Arc<Vec<Capture<E>>>);

impl<E> Drained<E> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Capture<E>> {
        self.0.iter()
    }
}

impl<E> IntoIterator for Drained<E> {
    type Item = Capture<E>;
    type IntoIter = std::vec::IntoIter<Capture<E>>;

    fn into_iter(self) -> Self::IntoIter {
        match Arc::try_unwrap(self.0) {
            Ok(v) => v.into_iter(),
            Err(shared) => (*shared).clone().into_iter(),
        }
    }
}

impl<E: Clone> Clone for Capture<E> {
    fn clone(&self) -> Self {
        Capture::new(self.emission().clone(), self.subject().clone())
    }
}

/// Captures every `(subject, emission)` pair delivered through a
/// conduit's channels while subscribed.
pub struct Reservoir<E> {
    subject: Subject,
    buffer: Arc<Mutex<Vec<Capture<E>>>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    closed: AtomicBool,
}

impl<E: Send + Sync + Clone + 'static> Reservoir<E> {
    /// Subscribes to `conduit` immediately; every subsequent emission on
    /// any of its channels is appended to this reservoir's buffer.
    pub fn new<P: Clone + Send + Sync + 'static>(name: Name, conduit: &Arc<Conduit<P, E>>) -> SubstratesResult<Arc<Self>> {
        let subject = Subject::new(name, SubjectType::Reservoir).enclosed_by(conduit.subject().clone());
        let buffer: Arc<Mutex<Vec<Capture<E>>>> = Arc::new(Mutex::new(Vec::new()));
        let buffer_for_sub = buffer.clone();

        let subscriber = FunctionSubscriber::new(move |channel_subject: &Subject, registrar: &mut dyn Registrar<E>| {
            let buffer = buffer_for_sub.clone();
            let channel_subject = channel_subject.clone();
            registrar.register(sink(move |value: E| {
                buffer.lock().push(Capture::new(value, channel_subject.clone()));
                Ok(())
            }))
        });

        let subscription = conduit.subscribe(Arc::new(subscriber))?;

        Ok(Arc::new(Self {
            subject,
            buffer,
            subscription: Mutex::new(Some(subscription)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Atomically swaps out the buffer and returns a restartable snapshot
    /// of everything captured since the previous `drain()`.
    pub fn drain(&self) -> Drained<E> {
        let taken = std::mem::take(&mut *self.buffer.lock());
        Drained(Arc::new(taken))
    }
}

impl<E> Substrate for Reservoir<E> {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl<E: Send + Sync + 'static> Resource for Reservoir<E> {
    fn close(&self) -> SubstratesResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.close()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
