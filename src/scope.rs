//! Scope: ordered, hierarchical resource disposal. A scope owns a LIFO
//! stack of registered resources and a list of child scopes; closing it
//! closes resources most-recently-registered first, then child scopes,
//! suppressing individual close failures (best-effort cleanup).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{SubstratesError, SubstratesResult};
use crate::name::Name;
use crate::subject::{Resource, Subject, SubjectType, Substrate};

struct ScopeState {
    resources: Vec<Arc<dyn Resource + Send + Sync>>,
    children: Vec<Arc<Scope>>,
    closed: bool,
}

/// A block-scoped container of closeable resources, disposed in reverse
/// registration order.
pub struct Scope {
    subject: Subject,
    state: Mutex<ScopeState>,
}

impl Scope {
    /// Creates a root scope with no parent.
    pub fn new(name: Name) -> Arc<Self> {
        Self::new_internal(Subject::new(name, SubjectType::Scope))
    }

    fn new_internal(subject: Subject) -> Arc<Self> {
        Arc::new(Self {
            subject,
            state: Mutex::new(ScopeState {
                resources: Vec::new(),
                children: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    fn check_open(&self) -> SubstratesResult<()> {
        if self.state.lock().closed {
            Err(SubstratesError::illegal_state("scope is closed"))
        } else {
            Ok(())
        }
    }

    /// Pushes `resource` onto the LIFO disposal stack and returns it.
    pub fn register<R: Resource + Send + Sync + 'static>(&self, resource: Arc<R>) -> SubstratesResult<Arc<R>> {
        self.check_open()?;
        self.state.lock().resources.push(resource.clone());
        Ok(resource)
    }

    /// Creates a child scope auto-closed when this scope closes.
    pub fn scope(self: &Arc<Self>) -> SubstratesResult<Arc<Scope>> {
        self.scope_named(Name::from_part("scope")?)
    }

    /// Creates a named child scope auto-closed when this scope closes.
    pub fn scope_named(self: &Arc<Self>, name: Name) -> SubstratesResult<Arc<Scope>> {
        self.check_open()?;
        let child = Self::new_internal(Subject::new(name, SubjectType::Scope).enclosed_by(self.subject.clone()));
        self.state.lock().children.push(child.clone());
        Ok(child)
    }

    /// Wraps `resource` in a single-use handle guaranteeing it is closed
    /// after `consume`'s callback returns or errors.
    pub fn closure<R: Resource + Send + Sync + 'static>(&self, resource: Arc<R>) -> SubstratesResult<Closure<R>> {
        self.check_open()?;
        Ok(Closure::new(resource))
    }

    /// Idempotent: pops and closes resources LIFO (suppressing
    /// individual failures), then closes child scopes, then transitions
    /// to closed.
    pub fn close(&self) {
        let (resources, children) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.resources),
                std::mem::take(&mut state.children),
            )
        };
        for resource in resources.into_iter().rev() {
            if let Err(e) = resource.close() {
                let failure = SubstratesError::callback_failure(e.to_string());
                tracing::warn!(error = %failure, scope = %self.subject.name(), "resource close failed during scope teardown");
            }
        }
        for child in children {
            child.close();
        }
    }
}

impl Substrate for Scope {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl Resource for Scope {
    fn close(&self) -> SubstratesResult<()> {
        Scope::close(self);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A single-use handle guaranteeing its resource is closed once
/// `consume` returns. Reentering `consume` is not supported — the first
/// call takes the resource out, so a second call has none to offer.
pub struct Closure<R> {
    resource: Mutex<Option<Arc<R>>>,
}

impl<R: Resource + Send + Sync + 'static> Closure<R> {
    fn new(resource: Arc<R>) -> Self {
        Closure {
            resource: Mutex::new(Some(resource)),
        }
    }

    /// Runs `f` over the held resource, closing it afterward regardless
    /// of whether `f` returns `Ok` or `Err`.
    pub fn consume<T, F>(&self, f: F) -> SubstratesResult<T>
    where
        F: FnOnce(&Arc<R>) -> SubstratesResult<T>,
    {
        let resource = self
            .resource
            .lock()
            .take()
            .ok_or_else(|| SubstratesError::illegal_state("closure already consumed"))?;
        let result = f(&resource);
        if let Err(e) = resource.close() {
            let failure = SubstratesError::callback_failure(e.to_string());
            tracing::warn!(error = %failure, "resource close failed after closure consume");
        }
        result
    }
}
