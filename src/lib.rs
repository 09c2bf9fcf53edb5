//! # Substrates
//!
//! A deterministic, single-threaded emission and event-routing fabric for
//! composing neural-like computational networks out of circuits,
//! conduits, channels, pipes, cells, and scopes.
//!
//! ## Key components
//!
//! - **Circuit** — the dedicated-worker execution engine; all delivery,
//!   flow-operator bodies, and subscriber callbacks run confined to it.
//! - **Conduit** / **Channel** — named, pooled emission ports with
//!   lazy subscriber rebuild.
//! - **Flow** — a builder of stateful pipeline operators (diff, guard,
//!   limit, sift, reduce, ...) materialized once per call.
//! - **Pipe** — the base consumer abstraction threaded through all of
//!   the above.
//! - **Cell** — hierarchical ingress/egress hub with stack-safe,
//!   re-enqueue-mediated upward aggregation.
//! - **Scope** / **Closure** — LIFO block-scoped resource disposal.
//! - **Reservoir** — capture buffering of emissions for later draining.
//! - **Cortex** — the process-wide bootstrap entry point.

pub mod cell;
pub mod channel;
pub mod circuit;
pub mod cortex;
pub mod error;
pub mod flow;
pub mod name;
pub mod pipe;
pub mod reservoir;
pub mod scope;
pub mod state;
pub mod subject;

pub use cell::{Cell, EgressComposer, IngressComposer};
pub use channel::{
    Channel, Composer, Conduit, FunctionSubscriber, IdentityComposer, PipeComposer, Registrar,
    Subscriber, Subscription,
};
pub use circuit::{Circuit, Clock};
pub use cortex::Cortex;
pub use error::{SubstratesError, SubstratesResult};
pub use flow::{Flow, FlowValue};
pub use name::Name;
pub use pipe::{discard, sink, transform, Capture, Pipe};
pub use reservoir::{Drained, Reservoir};
pub use scope::{Closure, Scope};
pub use state::{Slot, State};
pub use subject::{Id, Resource, Subject, SubjectType, Substrate};
