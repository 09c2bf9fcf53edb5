//! Pipe: the base abstraction for consuming typed emissions, plus the
//! built-in constructors (`sink`, `transform`, `discard`) and the
//! `Capture` value recorded by reservoirs.
//!
//! None of these are thread-safe by construction; thread safety for
//! cross-thread emission is provided by the circuit-dispatched wrapper in
//! `circuit.rs`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SubstratesResult;
use crate::subject::Subject;

/// A consumer of typed emissions.
pub trait Pipe<E>: Send + Sync {
    /// Passes a value along the pipeline.
    fn emit(&self, value: E) -> SubstratesResult<()>;

    /// Flushes any buffered output. Default is a no-op.
    fn flush(&self) -> SubstratesResult<()> {
        Ok(())
    }
}

struct SinkPipe<E, F> {
    receptor: F,
    _marker: PhantomData<fn(E)>,
}

impl<E, F> Pipe<E> for SinkPipe<E, F>
where
    E: Send + Sync,
    F: Fn(E) -> SubstratesResult<()> + Send + Sync,
{
    fn emit(&self, value: E) -> SubstratesResult<()> {
        (self.receptor)(value)
    }
}

/// A pipe that synchronously invokes `receptor` for every emission.
pub fn sink<E, F>(receptor: F) -> Arc<dyn Pipe<E>>
where
    E: Send + Sync + 'static,
    F: Fn(E) -> SubstratesResult<()> + Send + Sync + 'static,
{
    Arc::new(SinkPipe {
        receptor,
        _marker: PhantomData,
    })
}

struct TransformPipe<E, E2, F> {
    transformer: F,
    target: Arc<dyn Pipe<E2>>,
    _marker: PhantomData<fn(E)>,
}

impl<E, E2, F> Pipe<E> for TransformPipe<E, E2, F>
where
    E: Send + Sync,
    E2: Send + Sync,
    F: Fn(E) -> SubstratesResult<E2> + Send + Sync,
{
    fn emit(&self, value: E) -> SubstratesResult<()> {
        let transformed = (self.transformer)(value)?;
        self.target.emit(transformed)
    }
}

/// A pipe that applies `transformer` synchronously, then forwards the
/// result to `target`. Because the transform runs before the emission is
/// accepted by any circuit queue, it can be used to shift work onto the
/// caller's own thread.
pub fn transform<E, E2, F>(transformer: F, target: Arc<dyn Pipe<E2>>) -> Arc<dyn Pipe<E>>
where
    E: Send + Sync + 'static,
    E2: Send + Sync + 'static,
    F: Fn(E) -> SubstratesResult<E2> + Send + Sync + 'static,
{
    Arc::new(TransformPipe {
        transformer,
        target,
        _marker: PhantomData,
    })
}

struct DiscardPipe<E>(PhantomData<fn(E)>);

impl<E: Send + Sync> Pipe<E> for DiscardPipe<E> {
    fn emit(&self, _value: E) -> SubstratesResult<()> {
        Ok(())
    }
}

/// A pipe that ignores every emission.
pub fn discard<E: Send + Sync + 'static>() -> Arc<dyn Pipe<E>> {
    Arc::new(DiscardPipe(PhantomData))
}

/// An emitted value paired with the subject that produced it, as captured
/// by a `Reservoir`.
#[derive(Clone)]
pub struct Capture<E> {
    emission: E,
    subject: Subject,
    captured_at: DateTime<Utc>,
}

impl<E> Capture<E> {
    pub fn new(emission: E, subject: Subject) -> Self {
        Self {
            emission,
            subject,
            captured_at: Utc::now(),
        }
    }

    pub fn emission(&self) -> &E {
        &self.emission
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn into_emission(self) -> E {
        self.emission
    }
}

impl<E: fmt::Debug> fmt::Debug for Capture<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("subject", &self.subject)
            .field("emission", &self.emission)
            .finish()
    }
}
