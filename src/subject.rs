//! Subject: identity + hierarchical naming + state snapshot for every
//! substrate instance (circuits, conduits, channels, cells, scopes, ...).

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::SubstratesResult;
use crate::name::Name;
use crate::state::State;

/// Opaque per-instance identity. Lifetime is bound to the owning
/// substrate; two instances never share an `Id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(Uuid);

impl Id {
    pub fn new() -> Self {
        Id(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed enumeration of the substrate kinds a `Subject` may tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectType {
    Cell,
    Channel,
    Circuit,
    Clock,
    Conduit,
    Reservoir,
    Scope,
    Source,
    Subscriber,
    Subscription,
}

struct SubjectInner {
    id: Id,
    name: Name,
    subject_type: SubjectType,
    state: State,
    enclosure: Option<Subject>,
}

/// `(id, name, state, substrate-class-tag, enclosure?)`. Cheap to clone
/// (`Arc` bump).
#[derive(Clone)]
pub struct Subject(Arc<SubjectInner>);

impl Subject {
    pub fn new(name: Name, subject_type: SubjectType) -> Self {
        Self::with_state(name, subject_type, State::empty())
    }

    pub fn with_state(name: Name, subject_type: SubjectType, state: State) -> Self {
        Subject(Arc::new(SubjectInner {
            id: Id::new(),
            name,
            subject_type,
            state,
            enclosure: None,
        }))
    }

    /// Returns a new subject identical to this one but enclosed within
    /// `parent` for the purposes of path construction and ancestry.
    pub fn enclosed_by(&self, parent: Subject) -> Subject {
        Subject(Arc::new(SubjectInner {
            id: self.0.id,
            name: self.0.name.clone(),
            subject_type: self.0.subject_type,
            state: self.0.state.clone(),
            enclosure: Some(parent),
        }))
    }

    pub fn id(&self) -> Id {
        self.0.id
    }

    pub fn name(&self) -> &Name {
        &self.0.name
    }

    pub fn subject_type(&self) -> SubjectType {
        self.0.subject_type
    }

    pub fn state(&self) -> &State {
        &self.0.state
    }

    pub fn enclosure(&self) -> Option<&Subject> {
        self.0.enclosure.as_ref()
    }

    /// Ancestors from the immediate enclosure up to (and including) the
    /// extremity (root).
    pub fn ancestors(&self) -> Vec<Subject> {
        let mut out = Vec::new();
        let mut cur = self.0.enclosure.clone();
        while let Some(s) = cur {
            out.push(s.clone());
            cur = s.0.enclosure.clone();
        }
        out
    }

    /// The root-most ancestor, or `self` if this subject has no enclosure.
    pub fn extremity(&self) -> Subject {
        self.ancestors().pop().unwrap_or_else(|| self.clone())
    }

    /// Number of enclosures above this subject (0 if it has none).
    pub fn depth(&self) -> usize {
        self.ancestors().len()
    }

    /// `true` if `other` appears in this subject's ancestor chain.
    pub fn within(&self, other: &Subject) -> bool {
        self.ancestors().iter().any(|a| a.id() == other.id())
    }

    /// Full path from root to this subject, `/`-separated by name segment.
    pub fn path(&self) -> String {
        let mut names: Vec<String> = self
            .ancestors()
            .into_iter()
            .rev()
            .map(|s| s.0.name.to_path())
            .collect();
        names.push(self.0.name.to_path());
        names.join("/")
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("subject_type", &self.0.subject_type)
            .finish()
    }
}

/// Shared surface of every substrate: access to its identifying subject.
pub trait Substrate {
    fn subject(&self) -> &Subject;
}

/// A substrate that owns a closeable resource.
///
/// `close` takes `&self`, not `&mut self`: resource handles are shared
/// behind `Arc` (a subscription handle returned to one caller, a conduit
/// reachable from both its circuit and its subscribers), so idempotent
/// closing is implemented with interior mutability rather than requiring
/// unique ownership to call `close`. Default `close` is a no-op so plain
/// emission consumers need not implement it.
pub trait Resource: Substrate {
    fn close(&self) -> SubstratesResult<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_and_path_reflect_enclosure_chain() {
        let root = Subject::new(Name::from_part("root").unwrap(), SubjectType::Circuit);
        let mid = Subject::new(Name::from_part("mid").unwrap(), SubjectType::Conduit).enclosed_by(root.clone());
        let leaf = Subject::new(Name::from_part("leaf").unwrap(), SubjectType::Channel).enclosed_by(mid.clone());

        assert_eq!(leaf.depth(), 2);
        assert!(leaf.within(&root));
        assert!(leaf.within(&mid));
        assert_eq!(leaf.extremity().id(), root.id());
        assert_eq!(leaf.path(), "root/mid/leaf");
    }

    #[test]
    fn ids_are_unique_per_instance() {
        let a = Subject::new(Name::from_part("a").unwrap(), SubjectType::Scope);
        let b = Subject::new(Name::from_part("a").unwrap(), SubjectType::Scope);
        assert_ne!(a.id(), b.id());
    }
}
