//! Ordering of pending changes
//!
//! The change feed only reports the latest revision of each record, in the
//! order of their last write. That order says nothing about the order in
//! which the changes must reach the other side: a folder must exist before
//! its content is added, its content must be gone before it is deleted, and
//! a path must be freed before another document moves onto it.
//!
//! Each change is classified once into an [`Operation`], then inserted into
//! a [`DependencyGraph`] whose edges come from [`compare`]. Edges that would
//! close a cycle are dropped, so flattening always terminates.

use std::cmp::Ordering;
use std::fmt;

use tracing::{trace, warn};

use tandem_core::domain::{ChangeRecord, RecordId, Side};
use tandem_core::ports::{Change, IIgnoreMatcher, IMetadataStore};

// ============================================================================
// Operation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Add,
    Edit,
    Delete,
    MoveSource,
    MoveDestination,
    Null,
    Skip,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Add => "ADD",
            OperationKind::Edit => "EDIT",
            OperationKind::Delete => "DEL",
            OperationKind::MoveSource => "MOVE_SRC",
            OperationKind::MoveDestination => "MOVE_DST",
            OperationKind::Null => "NULL",
            OperationKind::Skip => "SKIP",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What propagating a change to its outdated side amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add,
    /// The previous revision is looked up when the change is applied
    Edit,
    Delete,
    /// Tombstone left behind by a move; its destination carries the work
    MoveSource,
    Move {
        /// Source revision the destination was moved from
        from: Box<ChangeRecord>,
    },
    /// Both sides are up to date
    Null,
    Skip,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add => OperationKind::Add,
            Operation::Edit => OperationKind::Edit,
            Operation::Delete => OperationKind::Delete,
            Operation::MoveSource => OperationKind::MoveSource,
            Operation::Move { .. } => OperationKind::MoveDestination,
            Operation::Null => OperationKind::Null,
            Operation::Skip => OperationKind::Skip,
        }
    }
}

/// A change from the feed with its operation
#[derive(Debug, Clone)]
pub struct Classified {
    pub change: Change,
    /// Side the change must be propagated to
    pub side: Option<Side>,
    pub operation: Operation,
}

impl Classified {
    pub fn record(&self) -> &ChangeRecord {
        &self.change.record
    }

    pub fn seq(&self) -> u64 {
        self.change.seq
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    fn id(&self) -> &RecordId {
        &self.change.record.id
    }

    fn is_addition(&self) -> bool {
        matches!(self.kind(), OperationKind::Add | OperationKind::MoveDestination)
    }

    fn is_deletion(&self) -> bool {
        self.kind() == OperationKind::Delete
    }

    fn move_source(&self) -> Option<&ChangeRecord> {
        match &self.operation {
            Operation::Move { from } => Some(from),
            _ => None,
        }
    }
}

/// Computes the operation of `change`
///
/// # Errors
///
/// Fails only when the store cannot be read.
pub async fn classify(
    store: &dyn IMetadataStore,
    ignore: &dyn IIgnoreMatcher,
    change: Change,
) -> anyhow::Result<Classified> {
    let record = &change.record;
    let side = record.sides.outdated_side();

    let operation = if ignore.should_ignore(&record.path, record.doc_type) {
        Operation::Skip
    } else if record.deleted && !record.was_synced() {
        Operation::Skip
    } else if side.is_none() {
        Operation::Null
    } else if record.deleted && record.move_to.is_some() {
        Operation::MoveSource
    } else {
        classify_pending(store, record, side).await?
    };

    trace!(path = %record.path, seq = change.seq, operation = %operation.kind(), "Change classified");
    Ok(Classified {
        change,
        side,
        operation,
    })
}

async fn classify_pending(
    store: &dyn IMetadataStore,
    record: &ChangeRecord,
    side: Option<Side>,
) -> anyhow::Result<Operation> {
    if let Some(move_from) = &record.move_from {
        match store.get_revision(move_from).await? {
            Some(from) => {
                return Ok(Operation::Move {
                    from: Box::new(from),
                })
            }
            None => {
                warn!(
                    path = %record.path,
                    source = %move_from.id,
                    target = move_from.target,
                    "Move source revision is missing, handling as a plain change"
                );
            }
        }
    }

    if record.deleted {
        return Ok(Operation::Delete);
    }

    let counter = side.map_or(0, |s| record.sides.get(s));
    Ok(if counter == 0 {
        Operation::Add
    } else {
        Operation::Edit
    })
}

// ============================================================================
// Ordering rules
// ============================================================================

/// Returns `Less` when `a` must be propagated before `b`
pub fn compare(a: &Classified, b: &Classified) -> Ordering {
    let rules: [fn(&Classified, &Classified) -> bool; 5] = [
        parent_added_first,
        child_deleted_first,
        move_out_before_folder_deletion,
        deletion_frees_identity,
        move_frees_destination,
    ];

    for rule in rules {
        if rule(a, b) {
            return Ordering::Less;
        }
        if rule(b, a) {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

fn parent_added_first(a: &Classified, b: &Classified) -> bool {
    a.is_addition() && b.is_addition() && a.id().is_ancestor_of(b.id())
}

fn child_deleted_first(a: &Classified, b: &Classified) -> bool {
    a.is_deletion() && b.is_deletion() && b.id().is_ancestor_of(a.id())
}

fn move_out_before_folder_deletion(a: &Classified, b: &Classified) -> bool {
    let Some(from) = a.move_source() else {
        return false;
    };
    b.is_deletion()
        && b.record().is_folder()
        && b.id().is_ancestor_of(&from.id)
        && !b.id().is_ancestor_of(a.id())
}

fn deletion_frees_identity(a: &Classified, b: &Classified) -> bool {
    a.is_deletion() && b.is_addition() && a.id() == b.id()
}

fn move_frees_destination(a: &Classified, b: &Classified) -> bool {
    match (a.move_source(), b.kind()) {
        (Some(from), OperationKind::MoveDestination) => from.id == *b.id() && a.id() != b.id(),
        _ => false,
    }
}

// ============================================================================
// DependencyGraph
// ============================================================================

type CompareFn<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

struct Node<T> {
    item: T,
    /// Nodes to propagate before this one
    dependent_on: Vec<usize>,
}

/// Acyclic graph of items to propagate, with edges given by a comparator
pub struct DependencyGraph<T> {
    nodes: Vec<Node<T>>,
    compare: CompareFn<T>,
}

impl DependencyGraph<Classified> {
    /// Graph of classified changes ordered by [`compare`]
    pub fn of_changes(changes: impl IntoIterator<Item = Classified>) -> Self {
        let mut graph = Self::new(compare);
        for change in changes {
            graph.insert(change);
        }
        graph
    }
}

impl<T> DependencyGraph<T> {
    pub fn new(compare: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            nodes: Vec::new(),
            compare: Box::new(compare),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds `item`, linking it to every comparable node already inserted
    pub fn insert(&mut self, item: T) {
        let new = self.nodes.len();
        self.nodes.push(Node {
            item,
            dependent_on: Vec::new(),
        });

        for existing in 0..new {
            let order = (self.compare)(&self.nodes[existing].item, &self.nodes[new].item);
            let (dependent, dependency) = match order {
                Ordering::Less => (new, existing),
                Ordering::Greater => (existing, new),
                Ordering::Equal => continue,
            };

            self.nodes[dependent].dependent_on.push(dependency);
            if self.has_cycle_from(new) {
                trace!(dependent, dependency, "Dropping dependency closing a cycle");
                self.nodes[dependent].dependent_on.pop();
            }
        }
    }

    /// Depth-first search for a cycle reachable from `start`
    fn has_cycle_from(&self, start: usize) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut exploring = vec![false; self.nodes.len()];
        let mut stack = vec![(start, 0usize)];
        exploring[start] = true;

        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            match self.nodes[node].dependent_on.get(next) {
                Some(&dep) => {
                    top.1 += 1;
                    if exploring[dep] {
                        return true;
                    }
                    if !visited[dep] {
                        exploring[dep] = true;
                        stack.push((dep, 0));
                    }
                }
                None => {
                    exploring[node] = false;
                    visited[node] = true;
                    stack.pop();
                }
            }
        }
        false
    }

    /// Flattens the graph, dependencies first, otherwise in insertion order
    pub fn into_ordered(self) -> Vec<T> {
        let count = self.nodes.len();
        let mut visited = vec![false; count];
        let mut order = Vec::with_capacity(count);

        for root in 0..count {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut stack = vec![(root, 0usize)];

            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                match self.nodes[node].dependent_on.get(next) {
                    Some(&dep) => {
                        top.1 += 1;
                        if !visited[dep] {
                            visited[dep] = true;
                            stack.push((dep, 0));
                        }
                    }
                    None => {
                        stack.pop();
                        order.push(node);
                    }
                }
            }
        }

        let mut items: Vec<Option<T>> = self.nodes.into_iter().map(|n| Some(n.item)).collect();
        order
            .into_iter()
            .filter_map(|idx| items[idx].take())
            .collect()
    }
}
