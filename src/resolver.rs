//! Explicit handler registration and deterministic target resolution.
//!
//! Owners declare which result types they handle by mounting
//! [`HandlerSet`]s onto nodes of a per-owner tree in the
//! [`HandlerRegistry`]. When a task finishes, the engine resolves the one
//! handler that should receive the value; resolution is a single
//! deterministic pass, so the same tree and the same query always pick
//! the same handler.
//!
//! # Resolution order
//!
//! 1. Depth-first over the owner's node tree: a node's own bindings are
//!    considered before its descendants, the root before everything, and
//!    siblings in mount order.
//! 2. A binding is a candidate when its routing id equals the requested
//!    one (both unset counts as equal; set never matches unset) and its
//!    type accepts the result (exact [`TypeId`] equality, or catch-all).
//! 3. Within a node, exact-type bindings outrank catch-all bindings;
//!    among equal ranks the first declared wins and a conflict warning is
//!    logged.
//! 4. A node-path hint limits non-root nodes to the hinted path; the root
//!    stays eligible as the fallback recipient and traversal still
//!    descends through non-matching nodes.
//!
//! # Examples
//!
//! ```
//! use std::any::TypeId;
//! use taskgate::{HandlerRegistry, HandlerSet, OwnerId};
//!
//! let registry = HandlerRegistry::new();
//! let owner = OwnerId::from("settings-screen");
//!
//! registry.mount(
//!     &owner,
//!     HandlerSet::new()
//!         .on(|text: &String| println!("loaded: {text}"))
//!         .on_routed("avatar", |bytes: &Vec<u8>| println!("{} bytes", bytes.len())),
//! );
//!
//! let target = registry.resolve(&owner, TypeId::of::<String>(), "String", None, None);
//! assert_eq!(target.map(|t| t.node_path().to_owned()), Some(String::new()));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::owner::OwnerId;
use crate::task::TaskSnapshot;

type HandlerFn = Arc<dyn Fn(&(dyn Any + Send + Sync), &TaskSnapshot) + Send + Sync>;

#[derive(Clone, Copy)]
enum TypeMatch {
    Exact { id: TypeId },
    Any,
}

#[derive(Clone)]
struct HandlerBinding {
    ty: TypeMatch,
    routing_id: Option<String>,
    handler: HandlerFn,
}

/// An ordered collection of result handlers, built by an owner and
/// mounted onto one node of its tree.
///
/// Declaration order matters: when several bindings of the same rank
/// match a result, the first declared wins.
#[derive(Default, Clone)]
pub struct HandlerSet {
    bindings: Vec<HandlerBinding>,
}

impl HandlerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exact-type handler for unrouted results of type `T`.
    ///
    /// ```
    /// use taskgate::HandlerSet;
    ///
    /// let set = HandlerSet::new().on(|value: &u64| {
    ///     println!("finished with {value}");
    /// });
    /// assert_eq!(set.len(), 1);
    /// ```
    #[must_use]
    pub fn on<T, F>(self, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_with_task(move |value: &T, _task: &TaskSnapshot| handler(value))
    }

    /// Like [`on`](HandlerSet::on), but the handler also receives the
    /// snapshot of the task that produced the value.
    #[must_use]
    pub fn on_with_task<T, F>(mut self, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &TaskSnapshot) + Send + Sync + 'static,
    {
        let wrapped: HandlerFn =
            Arc::new(move |value: &(dyn Any + Send + Sync), task: &TaskSnapshot| {
                if let Some(typed) = value.downcast_ref::<T>() {
                    handler(typed, task);
                }
            });
        self.bindings.push(HandlerBinding {
            ty: TypeMatch::Exact {
                id: TypeId::of::<T>(),
            },
            routing_id: None,
            handler: wrapped,
        });
        self
    }

    /// Adds an exact-type handler bound to a routing id.
    ///
    /// Only results submitted with the same routing id reach it; unrouted
    /// results never do.
    #[must_use]
    pub fn on_routed<T, F>(self, routing_id: impl Into<String>, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_routed_with_task(routing_id, move |value: &T, _task: &TaskSnapshot| {
            handler(value);
        })
    }

    /// Routed variant of [`on_with_task`](HandlerSet::on_with_task).
    #[must_use]
    pub fn on_routed_with_task<T, F>(mut self, routing_id: impl Into<String>, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &TaskSnapshot) + Send + Sync + 'static,
    {
        let wrapped: HandlerFn =
            Arc::new(move |value: &(dyn Any + Send + Sync), task: &TaskSnapshot| {
                if let Some(typed) = value.downcast_ref::<T>() {
                    handler(typed, task);
                }
            });
        self.bindings.push(HandlerBinding {
            ty: TypeMatch::Exact {
                id: TypeId::of::<T>(),
            },
            routing_id: Some(routing_id.into()),
            handler: wrapped,
        });
        self
    }

    /// Adds a catch-all handler receiving any unrouted result type.
    ///
    /// Ranks below exact-type handlers at the same node.
    #[must_use]
    pub fn on_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(&(dyn Any + Send + Sync), &TaskSnapshot) + Send + Sync + 'static,
    {
        self.bindings.push(HandlerBinding {
            ty: TypeMatch::Any,
            routing_id: None,
            handler: Arc::new(handler),
        });
        self
    }

    /// Routed variant of [`on_any`](HandlerSet::on_any).
    #[must_use]
    pub fn on_any_routed<F>(mut self, routing_id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&(dyn Any + Send + Sync), &TaskSnapshot) + Send + Sync + 'static,
    {
        self.bindings.push(HandlerBinding {
            ty: TypeMatch::Any,
            routing_id: Some(routing_id.into()),
            handler: Arc::new(handler),
        });
        self
    }

    /// Number of bindings in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the set has no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

/// The handler picked for one delivery, together with the path of the
/// node it was mounted on.
///
/// Targets are recomputed per delivery attempt and never cached, so
/// handler identity is always taken from the current incarnation's
/// mounts.
pub struct ResolvedTarget {
    handler: HandlerFn,
    node_path: String,
}

impl ResolvedTarget {
    /// Path of the node the winning binding was mounted on; empty for the
    /// root.
    #[must_use]
    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    /// Invokes the handler with a type-erased value and the originating
    /// task's snapshot.
    pub fn invoke(&self, value: &(dyn Any + Send + Sync), task: &TaskSnapshot) {
        (self.handler)(value, task);
    }
}

impl fmt::Debug for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTarget")
            .field("node_path", &self.node_path)
            .finish_non_exhaustive()
    }
}

struct OwnerNode {
    path: String,
    children: Vec<usize>,
    bindings: Vec<HandlerBinding>,
}

/// Arena of nodes; index 0 is always the root with the empty path.
struct OwnerTree {
    nodes: Vec<OwnerNode>,
}

impl OwnerTree {
    fn new() -> Self {
        Self {
            nodes: vec![OwnerNode {
                path: String::new(),
                children: Vec::new(),
                bindings: Vec::new(),
            }],
        }
    }

    fn find(&self, path: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.path == path)
    }

    /// Walks `path` segment by segment from the root, creating missing
    /// nodes with empty binding lists. Returns the final node's index.
    fn ensure(&mut self, path: &str) -> usize {
        let mut current = 0;
        let mut walked = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(segment);
            let existing = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|&child| self.nodes[child].path == walked);
            current = match existing {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(OwnerNode {
                        path: walked.clone(),
                        children: Vec::new(),
                        bindings: Vec::new(),
                    });
                    self.nodes[current].children.push(child);
                    child
                }
            };
        }
        current
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Per-owner trees of mounted handler sets.
///
/// Nodes get stable string paths at mount time (`""` for the root,
/// `"list/detail"` for a grandchild); re-mounting a path replaces that
/// node's handlers without disturbing the node's position among its
/// siblings.
#[derive(Default)]
pub struct HandlerRegistry {
    trees: DashMap<OwnerId, OwnerTree>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts (or replaces) `owner`'s root handlers.
    pub fn mount(&self, owner: &OwnerId, set: HandlerSet) {
        self.mount_at(owner, "", set);
    }

    /// Mounts (or replaces) the handlers at `path` under `owner`.
    ///
    /// Missing ancestors are created with empty handler lists, so a child
    /// can be mounted before its parent declares anything. Sibling order
    /// is mount order.
    pub fn mount_at(&self, owner: &OwnerId, path: &str, set: HandlerSet) {
        let mut tree = self.trees.entry(owner.clone()).or_insert_with(OwnerTree::new);
        let idx = tree.ensure(path);
        tree.nodes[idx].bindings = set.bindings;
        debug!(
            owner = %owner,
            path = %tree.nodes[idx].path,
            handlers = tree.nodes[idx].bindings.len(),
            "handler set mounted"
        );
    }

    /// Removes the handlers at `path`, keeping the node so sibling order
    /// and descendants are undisturbed. Returns `false` if the owner or
    /// node is unknown.
    pub fn unmount(&self, owner: &OwnerId, path: &str) -> bool {
        let Some(mut tree) = self.trees.get_mut(owner) else {
            return false;
        };
        let Some(idx) = tree.find(&normalize(path)) else {
            return false;
        };
        tree.nodes[idx].bindings.clear();
        true
    }

    /// Drops `owner`'s entire tree. Returns `false` if nothing was
    /// mounted.
    pub fn clear_owner(&self, owner: &OwnerId) -> bool {
        self.trees.remove(owner).is_some()
    }

    /// Whether `owner` currently has a tree.
    #[must_use]
    pub fn is_mounted(&self, owner: &OwnerId) -> bool {
        self.trees.contains_key(owner)
    }

    /// Finds the handler for a result of `type_id` under `owner`.
    ///
    /// `routing_id` and `node_hint` come from the submission; see the
    /// module docs for the full resolution order. Returns `None` when no
    /// binding matches, in which case the caller discards the delivery.
    #[must_use]
    pub fn resolve(
        &self,
        owner: &OwnerId,
        type_id: TypeId,
        type_name: &str,
        routing_id: Option<&str>,
        node_hint: Option<&str>,
    ) -> Option<ResolvedTarget> {
        let tree = self.trees.get(owner)?;
        let hint = node_hint.map(normalize);
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let node = &tree.nodes[idx];
            let eligible = match hint.as_deref() {
                None => true,
                Some(hinted) => idx == 0 || node.path == hinted,
            };
            if eligible {
                if let Some(binding) = select_binding(owner, node, type_id, type_name, routing_id)
                {
                    trace!(owner = %owner, path = %node.path, type_name, "handler resolved");
                    return Some(ResolvedTarget {
                        handler: Arc::clone(&binding.handler),
                        node_path: node.path.clone(),
                    });
                }
            }
            for &child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        None
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("owners", &self.trees.len())
            .finish_non_exhaustive()
    }
}

/// Picks the winning binding within one node, or `None`. Exact-type
/// candidates outrank catch-alls; ties go to the first declared, with a
/// warning naming the node.
fn select_binding<'a>(
    owner: &OwnerId,
    node: &'a OwnerNode,
    type_id: TypeId,
    type_name: &str,
    routing_id: Option<&str>,
) -> Option<&'a HandlerBinding> {
    let mut exact: Option<&HandlerBinding> = None;
    let mut exact_count = 0usize;
    let mut catch_all: Option<&HandlerBinding> = None;
    let mut catch_all_count = 0usize;

    for binding in &node.bindings {
        if binding.routing_id.as_deref() != routing_id {
            continue;
        }
        match binding.ty {
            TypeMatch::Exact { id } if id == type_id => {
                exact_count += 1;
                exact.get_or_insert(binding);
            }
            TypeMatch::Exact { .. } => {}
            TypeMatch::Any => {
                catch_all_count += 1;
                catch_all.get_or_insert(binding);
            }
        }
    }

    if let Some(binding) = exact {
        if exact_count > 1 {
            warn!(
                owner = %owner,
                path = %node.path,
                type_name,
                candidates = exact_count,
                "multiple exact handlers match; using first declared"
            );
        }
        return Some(binding);
    }
    if let Some(binding) = catch_all {
        if catch_all_count > 1 {
            warn!(
                owner = %owner,
                path = %node.path,
                type_name,
                candidates = catch_all_count,
                "multiple catch-all handlers match; using first declared"
            );
        }
        return Some(binding);
    }
    None
}
