//! Name interning: a process-lifetime prefix tree of dotted path segments.
//!
//! Two `Name`s are equal iff they are the same interned node (pointer
//! identity); this lets every other component that keys off a `Name` use
//! plain hashing/equality and get O(1) identity comparison for free.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{SubstratesError, SubstratesResult};

struct NameNode {
    parent: Option<Name>,
    segment: String,
}

/// An interned, hierarchical, dot-separated identifier.
///
/// Clone is cheap (`Arc` bump). Equality and hashing are by identity, not
/// by segment content — two `Name`s built from the same path string are
/// always the same object.
#[derive(Clone)]
pub struct Name(Arc<NameNode>);

impl Name {
    /// Interns a single root-level segment.
    pub fn from_part(segment: &str) -> SubstratesResult<Name> {
        Self::validate_segment(segment)?;
        Ok(intern(None, segment))
    }

    /// Parses a dotted path into a chain of interned segments.
    ///
    /// Rejects empty input, and leading, trailing, or consecutive `.`
    /// separators.
    pub fn from_path(path: &str) -> SubstratesResult<Name> {
        if path.is_empty() {
            return Err(SubstratesError::validation("name path must not be empty"));
        }
        if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
            return Err(SubstratesError::validation(format!(
                "malformed name path: {path:?}"
            )));
        }
        let mut current: Option<Name> = None;
        for segment in path.split('.') {
            Self::validate_segment(segment)?;
            current = Some(intern(current, segment));
        }
        current.ok_or_else(|| SubstratesError::validation("empty name path"))
    }

    /// Extends this name with a child segment.
    pub fn child(&self, segment: &str) -> SubstratesResult<Name> {
        Self::validate_segment(segment)?;
        Ok(intern(Some(self.clone()), segment))
    }

    /// Extends this name with each segment of `parts`, in order.
    pub fn extend<'a, I: IntoIterator<Item = &'a str>>(&self, parts: I) -> SubstratesResult<Name> {
        let mut current = self.clone();
        for part in parts {
            current = current.child(part)?;
        }
        Ok(current)
    }

    /// Derives a name from a Rust type's canonical path, falling back to
    /// its unqualified name when the type has no module path worth using.
    pub fn from_type<T: ?Sized>() -> SubstratesResult<Name> {
        let full = std::any::type_name::<T>();
        let simple = full.rsplit("::").next().unwrap_or(full);
        match Name::from_path(&sanitize(full)) {
            Ok(n) => Ok(n),
            Err(_) => Name::from_part(&sanitize(simple)),
        }
    }

    fn validate_segment(segment: &str) -> SubstratesResult<()> {
        if segment.is_empty() {
            return Err(SubstratesError::validation("name segment must not be empty"));
        }
        Ok(())
    }

    /// The segment local to this node (not the full path).
    pub fn segment(&self) -> &str {
        &self.0.segment
    }

    /// The enclosing name, if any.
    pub fn parent(&self) -> Option<&Name> {
        self.0.parent.as_ref()
    }

    /// Number of segments from the root to this name, inclusive.
    pub fn depth(&self) -> usize {
        match &self.0.parent {
            Some(p) => p.depth() + 1,
            None => 1,
        }
    }

    /// Renders the full path using `sep` as the separator, applying
    /// `mapper` to each segment before joining.
    pub fn path_with<F: Fn(&str) -> String>(&self, sep: char, mapper: F) -> String {
        let mut segments = Vec::with_capacity(self.depth());
        let mut cur = Some(self.clone());
        while let Some(n) = cur {
            segments.push(mapper(&n.0.segment));
            cur = n.0.parent.clone();
        }
        segments.reverse();
        segments.join(&sep.to_string())
    }

    /// Renders the full dotted path.
    pub fn to_path(&self) -> String {
        self.path_with('.', |s| s.to_string())
    }

    fn segments(&self) -> Vec<String> {
        let mut segments = Vec::with_capacity(self.depth());
        let mut cur = Some(self.clone());
        while let Some(n) = cur {
            segments.push(n.0.segment.clone());
            cur = n.0.parent.clone();
        }
        segments.reverse();
        segments
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

fn sanitize(s: &str) -> String {
    s.replace("::", ".").replace(['<', '>', ' '], "_")
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// Names compare lexicographically over their segment chain, independent
/// of interning identity.
impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.segments().cmp(&other.segments())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.to_path())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

#[derive(Hash, PartialEq, Eq)]
struct InternKey {
    parent: Option<usize>,
    segment: String,
}

static REGISTRY: Lazy<RwLock<HashMap<InternKey, Name>>> = Lazy::new(|| RwLock::new(HashMap::new()));

fn intern(parent: Option<Name>, segment: &str) -> Name {
    let key = InternKey {
        parent: parent.as_ref().map(|p| p.identity()),
        segment: segment.to_string(),
    };

    if let Some(existing) = REGISTRY.read().get(&key) {
        return existing.clone();
    }

    let mut registry = REGISTRY.write();
    if let Some(existing) = registry.get(&key) {
        return existing.clone();
    }

    let name = Name(Arc::new(NameNode {
        parent,
        segment: segment.to_string(),
    }));
    registry.insert(key, name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_implies_path_equality_and_vice_versa() {
        let a = Name::from_path("alpha.beta.gamma").unwrap();
        let b = Name::from_path("alpha.beta.gamma").unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
        assert_eq!(a.to_path(), "alpha.beta.gamma");

        let c = Name::from_path("alpha.beta.delta").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(Name::from_path("").is_err());
        assert!(Name::from_path(".alpha").is_err());
        assert!(Name::from_path("alpha.").is_err());
        assert!(Name::from_path("alpha..beta").is_err());
    }

    #[test]
    fn lexicographic_ordering_is_independent_of_identity() {
        let a = Name::from_path("a.b").unwrap();
        let b = Name::from_path("a.c").unwrap();
        assert!(a < b);
    }

    #[test]
    fn child_extends_and_reuses_interned_prefix() {
        let root = Name::from_part("svc").unwrap();
        let leaf1 = root.child("metrics").unwrap();
        let leaf2 = root.child("metrics").unwrap();
        assert_eq!(leaf1, leaf2);
        assert_eq!(leaf1.depth(), 2);
    }
}
