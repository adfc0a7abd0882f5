//! Module views: containers merged in classpath order.
//!
//! The view is a flat name-keyed table pointing into shared container
//! indexes. Hierarchy questions are answered by walking names through that
//! table with a visited set, so cyclic or dangling supertype references never
//! need special structure. Closures are memoized per view and a new view
//! starts with an empty memo.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::container::{ContainerSpec, ScanPolicy};
use crate::identity::ContainerIdentity;
use crate::index::PerContainerIndex;
use crate::record::ClassRecord;

#[derive(Debug, Clone)]
pub struct ViewContainer {
    pub spec: ContainerSpec,
    pub index: Arc<PerContainerIndex>,
}

impl ViewContainer {
    pub fn name(&self) -> String {
        self.spec.location.logical_path()
    }

    pub fn policy(&self) -> ScanPolicy {
        self.spec.policy
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.index.identity
    }

    pub fn incomplete(&self) -> bool {
        self.index.incomplete
    }
}

/// A class definition hidden by an earlier container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shadowed {
    pub class_name: String,
    pub winner: String,
    pub shadowed: String,
}

pub struct ModuleView {
    containers: Vec<ViewContainer>,
    lookup: BTreeMap<String, usize>,
    shadowed: Vec<Shadowed>,
    inherited: RwLock<HashMap<String, Arc<BTreeSet<String>>>>,
    supertypes: RwLock<HashMap<String, Arc<BTreeSet<String>>>>,
}

impl ModuleView {
    /// Merges `containers` in order; the first definition of a class name
    /// wins and later ones are recorded as shadowed.
    pub fn build(containers: Vec<(ContainerSpec, Arc<PerContainerIndex>)>) -> Self {
        let containers: Vec<ViewContainer> = containers
            .into_iter()
            .map(|(spec, index)| ViewContainer { spec, index })
            .collect();

        let mut lookup = BTreeMap::new();
        let mut shadowed = Vec::new();
        for (position, container) in containers.iter().enumerate() {
            for name in container.index.class_names() {
                match lookup.get(name) {
                    None => {
                        lookup.insert(name.to_string(), position);
                    }
                    Some(&winner) => shadowed.push(Shadowed {
                        class_name: name.to_string(),
                        winner: containers[winner].name(),
                        shadowed: container.name(),
                    }),
                }
            }
        }

        Self {
            containers,
            lookup,
            shadowed,
            inherited: RwLock::new(HashMap::new()),
            supertypes: RwLock::new(HashMap::new()),
        }
    }

    pub fn containers(&self) -> &[ViewContainer] {
        &self.containers
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// The winning record for `name`.
    pub fn class(&self, name: &str) -> Option<&ClassRecord> {
        let position = *self.lookup.get(name)?;
        self.containers[position].index.get(name)
    }

    pub fn container_of(&self, name: &str) -> Option<&ViewContainer> {
        self.lookup.get(name).map(|&p| &self.containers[p])
    }

    /// Winning records in class-name order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassRecord> {
        self.lookup
            .iter()
            .filter_map(|(name, &p)| self.containers[p].index.get(name))
    }

    /// Winning records whose container policy is in `policies`.
    pub fn classes_with_policy<'a>(
        &'a self,
        policies: &'a [ScanPolicy],
    ) -> impl Iterator<Item = &'a ClassRecord> + 'a {
        self.lookup.iter().filter_map(move |(name, &p)| {
            let container = &self.containers[p];
            if policies.contains(&container.policy()) {
                container.index.get(name)
            } else {
                None
            }
        })
    }

    pub fn shadowed(&self) -> &[Shadowed] {
        &self.shadowed
    }

    pub fn incomplete_containers(&self) -> Vec<&ViewContainer> {
        self.containers.iter().filter(|c| c.incomplete()).collect()
    }

    /// `name` followed by its superclasses. The walk ends after the first
    /// name not defined in the view (kept as the boundary element), at the
    /// root, or when a name repeats.
    pub fn super_chain(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_string()];
        let mut seen: HashSet<&str> = HashSet::from([name]);
        let mut current = self.class(name);
        while let Some(record) = current {
            let Some(parent) = record.superclass.as_deref() else {
                break;
            };
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent.to_string());
            current = self.class(parent);
        }
        chain
    }

    /// Annotation type names declared on `name` or on any superclass or
    /// transitively implemented interface defined in the view. Undefined
    /// ancestors contribute nothing.
    pub fn inherited_annotations(&self, name: &str) -> Arc<BTreeSet<String>> {
        if let Some(hit) = self.inherited.read().get(name) {
            return Arc::clone(hit);
        }

        let mut annotations = BTreeSet::new();
        self.walk_ancestry(name, |record| {
            annotations.extend(record.class_annotation_names().map(str::to_string));
        });

        let annotations = Arc::new(annotations);
        self.inherited
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&annotations));
        annotations
    }

    /// Every superclass and interface name reachable from `name`, including
    /// boundary names not defined in the view. Excludes `name` itself unless
    /// the hierarchy loops back to it.
    pub fn supertypes(&self, name: &str) -> Arc<BTreeSet<String>> {
        if let Some(hit) = self.supertypes.read().get(name) {
            return Arc::clone(hit);
        }

        let mut names = BTreeSet::new();
        self.walk_ancestry(name, |record| {
            names.extend(record.direct_supertypes().map(str::to_string));
        });

        let names = Arc::new(names);
        self.supertypes
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&names));
        names
    }

    /// Ancestor names the view does not define, i.e. where hierarchy
    /// knowledge stops.
    pub fn boundary_types(&self, name: &str) -> BTreeSet<String> {
        self.supertypes(name)
            .iter()
            .filter(|n| !self.contains(n))
            .cloned()
            .collect()
    }

    /// Breadth-first over `name` and its supertypes, visiting each defined
    /// record once.
    fn walk_ancestry<'a>(&'a self, name: &str, mut visit: impl FnMut(&'a ClassRecord)) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(record) = self.class(&current) else {
                continue;
            };
            visit(record);
            for parent in record.direct_supertypes() {
                if !seen.contains(parent) {
                    queue.push_back(parent.to_string());
                }
            }
        }
    }

    pub fn memo_len(&self) -> usize {
        self.inherited.read().len() + self.supertypes.read().len()
    }

    pub fn clear_memo(&self) {
        self.inherited.write().clear();
        self.supertypes.write().clear();
    }

    pub fn container_table(&self) -> ContainerTable {
        ContainerTable(
            self.containers
                .iter()
                .map(|c| ContainerRow {
                    name: c.name(),
                    signature: c.identity().stamp(),
                    policy: c.policy(),
                })
                .collect(),
        )
    }
}

impl PartialEq for ModuleView {
    fn eq(&self, other: &Self) -> bool {
        self.container_table() == other.container_table()
            && self.lookup.len() == other.lookup.len()
            && self.classes().eq(other.classes())
    }
}

impl fmt::Debug for ModuleView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleView")
            .field("containers", &self.container_table())
            .field("classes", &self.lookup.len())
            .field("shadowed", &self.shadowed.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRow {
    pub name: String,
    pub signature: String,
    pub policy: ScanPolicy,
}

/// Ordered `(name, signature, policy)` rows describing a view's containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerTable(pub Vec<ContainerRow>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableChange {
    Count { before: usize, after: usize },
    Name { position: usize, before: String, after: String },
    Signature { name: String, before: String, after: String },
    Policy { name: String, before: ScanPolicy, after: ScanPolicy },
}

impl fmt::Display for TableChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count { before, after } => {
                write!(f, "container count changed from {before} to {after}")
            }
            Self::Name {
                position,
                before,
                after,
            } => write!(f, "container {position} changed from {before} to {after}"),
            Self::Signature {
                name,
                before,
                after,
            } => write!(f, "{name} changed signature from {before} to {after}"),
            Self::Policy {
                name,
                before,
                after,
            } => write!(f, "{name} changed policy from {before} to {after}"),
        }
    }
}

impl ContainerTable {
    pub fn rows(&self) -> &[ContainerRow] {
        &self.0
    }

    /// First difference between `self` (earlier) and `other` (later).
    pub fn diff(&self, other: &ContainerTable) -> Option<TableChange> {
        if self.0.len() != other.0.len() {
            return Some(TableChange::Count {
                before: self.0.len(),
                after: other.0.len(),
            });
        }
        for (position, (before, after)) in self.0.iter().zip(&other.0).enumerate() {
            if before.name != after.name {
                return Some(TableChange::Name {
                    position,
                    before: before.name.clone(),
                    after: after.name.clone(),
                });
            }
            if before.signature != after.signature {
                return Some(TableChange::Signature {
                    name: after.name.clone(),
                    before: before.signature.clone(),
                    after: after.signature.clone(),
                });
            }
            if before.policy != after.policy {
                return Some(TableChange::Policy {
                    name: after.name.clone(),
                    before: before.policy,
                    after: after.policy,
                });
            }
        }
        None
    }
}
