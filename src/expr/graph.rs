//! Arena storage for expression graphs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;

use super::node::{Node, NodeId, OpKind};
use super::shape::Shape;
use crate::error::{DiffError, DiffResult};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a node of a specific graph.
///
/// `Expr` is `Copy`; it stays valid as long as its graph is alive because
/// nodes are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expr {
    pub(crate) graph: u64,
    pub(crate) node: NodeId,
}

impl Expr {
    /// Arena index of the node.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Id of the owning graph.
    pub fn graph_id(&self) -> u64 {
        self.graph
    }
}

/// Append-only node storage with a hash-consing cache.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    nodes: Vec<Node>,
    interner: FxHashMap<Node, NodeId>,
}

impl Arena {
    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Add a node, returning the existing id when an equal node is already stored.
    /// Symbols are never merged.
    fn add(&mut self, node: Node) -> NodeId {
        let interning = !node.op.is_symbol();
        if interning {
            if let Some(&id) = self.interner.get(&node) {
                return id;
            }
        }
        let id = NodeId(self.nodes.len());
        if interning {
            self.interner.insert(node.clone(), id);
        }
        self.nodes.push(node);
        id
    }
}

struct GraphInner {
    id: u64,
    arena: RwLock<Arena>,
}

/// A shared, immutable-once-built expression DAG.
///
/// Cloning a `Graph` clones the handle; all clones see the same nodes.
/// Nodes are only ever appended, so Functions built on a graph keep
/// working while further expressions are added to it.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GraphInner {
                id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
                arena: RwLock::new(Arena::default()),
            }),
        }
    }

    /// Process-unique graph id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Arena> {
        self.inner.arena.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena> {
        self.inner.arena.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn expr(&self, node: NodeId) -> Expr {
        Expr {
            graph: self.inner.id,
            node,
        }
    }

    /// Check that `e` belongs to this graph and return its node id and shape.
    pub(crate) fn resolve(&self, e: Expr, context: &str) -> DiffResult<(NodeId, Shape)> {
        if e.graph != self.inner.id {
            return Err(DiffError::ForeignExpression {
                context: format!(
                    "{} (graph {} used with graph {})",
                    context, e.graph, self.inner.id
                ),
            });
        }
        let arena = self.read();
        let node = arena.get(e.node).ok_or_else(|| DiffError::InvalidArgument {
            context: format!("{}: node {} out of range", context, e.node.0),
        })?;
        Ok((e.node, node.shape))
    }

    /// Shape of an expression.
    pub fn shape(&self, e: Expr) -> DiffResult<Shape> {
        self.resolve(e, "shape").map(|(_, shape)| shape)
    }

    /// A copy of the node behind `e`.
    pub fn node(&self, e: Expr) -> DiffResult<Node> {
        let (id, _) = self.resolve(e, "node")?;
        let arena = self.read();
        arena.get(id).cloned().ok_or_else(|| DiffError::InvalidArgument {
            context: format!("node {} out of range", id.0),
        })
    }

    /// True when `e` is a Symbol of this graph.
    pub fn is_symbol(&self, e: Expr) -> bool {
        self.node(e).map(|n| n.op.is_symbol()).unwrap_or(false)
    }

    /// Name of a Symbol expression.
    pub fn symbol_name(&self, e: Expr) -> Option<String> {
        match self.node(e).ok()?.op {
            OpKind::Symbol(name) => Some(name.to_string()),
            _ => None,
        }
    }

    /// Append a node (or find an equal one) and return its handle.
    ///
    /// Callers validate operands before pushing; a failed construction
    /// therefore never touches the arena.
    pub(crate) fn push(&self, op: OpKind, operands: Vec<NodeId>, shape: Shape) -> Expr {
        let id = self.write().add(Node::new(op, operands, shape));
        self.expr(id)
    }

    /// True when both handles refer to the same graph.
    pub fn same_graph(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("nodes", &self.len())
            .finish()
    }
}
