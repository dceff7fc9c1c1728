use std::fmt;
use std::sync::Arc;

use ahash::AHashSet as HashSet;

use crate::persister::{Cache, Persister, UpdateCountHolder};
use crate::twopc::ResourceManager;

/// One persisted class bound to its persister and resource manager.
///
/// Portals are compared by name. Parent/child relations are declared on the
/// parent and drive the ordering rules of consolidation.
pub struct Portal {
    name: String,
    persister: Arc<dyn Persister>,
    resource: Option<Arc<dyn ResourceManager>>,
    cache: Option<Arc<dyn Cache>>,
    update_counter: Option<Arc<dyn UpdateCountHolder>>,
    children: HashSet<String>,
    independent: bool,
    dated: bool,
    optimistic_locking: bool,
}

impl Portal {
    pub fn builder(name: impl Into<String>, persister: Arc<dyn Persister>) -> PortalBuilder {
        PortalBuilder {
            portal: Portal {
                name: name.into(),
                persister,
                resource: None,
                cache: None,
                update_counter: None,
                children: HashSet::new(),
                independent: false,
                dated: false,
                optimistic_locking: false,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn persister(&self) -> &Arc<dyn Persister> {
        &self.persister
    }

    pub fn resource(&self) -> Option<&Arc<dyn ResourceManager>> {
        self.resource.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn update_counter(&self) -> Option<&Arc<dyn UpdateCountHolder>> {
        self.update_counter.as_ref()
    }

    /// Cache-isolated classes get their own operation buffer.
    pub fn is_independent(&self) -> bool {
        self.independent
    }

    /// Bitemporal classes carry as-of attributes.
    pub fn is_dated(&self) -> bool {
        self.dated
    }

    pub fn uses_optimistic_locking(&self) -> bool {
        self.optimistic_locking
    }

    pub fn is_parent_of(&self, other: &Portal) -> bool {
        self.children.contains(&other.name)
    }

    pub fn same_as(&self, other: &Portal) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("name", &self.name)
            .field("independent", &self.independent)
            .field("dated", &self.dated)
            .finish()
    }
}

pub struct PortalBuilder {
    portal: Portal,
}

impl PortalBuilder {
    pub fn resource(mut self, resource: Arc<dyn ResourceManager>) -> Self {
        self.portal.resource = Some(resource);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.portal.cache = Some(cache);
        self
    }

    pub fn update_counter(mut self, counter: Arc<dyn UpdateCountHolder>) -> Self {
        self.portal.update_counter = Some(counter);
        self
    }

    /// Declares `child` as a dependent (foreign-key holding) portal.
    pub fn parent_of(mut self, child: impl Into<String>) -> Self {
        self.portal.children.insert(child.into());
        self
    }

    pub fn independent(mut self, independent: bool) -> Self {
        self.portal.independent = independent;
        self
    }

    pub fn dated(mut self, dated: bool) -> Self {
        self.portal.dated = dated;
        self
    }

    pub fn optimistic_locking(mut self, enabled: bool) -> Self {
        self.portal.optimistic_locking = enabled;
        self
    }

    pub fn build(self) -> Arc<Portal> {
        Arc::new(self.portal)
    }
}

/// Opaque selection used by delete-by-predicate operations.
#[derive(Clone)]
pub struct Predicate {
    target: Arc<Portal>,
    expression: String,
    depends_on: Vec<Arc<Portal>>,
}

impl Predicate {
    /// A predicate over `target` that only depends on `target` itself.
    pub fn new(target: Arc<Portal>, expression: impl Into<String>) -> Self {
        Self {
            depends_on: vec![Arc::clone(&target)],
            target,
            expression: expression.into(),
        }
    }

    /// Adds a portal whose pending writes must be flushed before the predicate is evaluated.
    pub fn depending_on(mut self, portal: Arc<Portal>) -> Self {
        if !self.depends_on.iter().any(|p| p.same_as(&portal)) {
            self.depends_on.push(portal);
        }
        self
    }

    pub fn target(&self) -> &Arc<Portal> {
        &self.target
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn depends_on(&self) -> &[Arc<Portal>] {
        &self.depends_on
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} where {}", self.target.name(), self.expression)
    }
}
