//! The dependency operator DSL.
//!
//! `a >> b` declares "b depends on a" by appending a pending edge to the
//! right-hand operand's buffer and returning that operand, so chains like
//! `a >> b >> c` read left to right. `a << b` is the inversion. Lists fan
//! the edge over every element:
//!
//! - `a >> vec![b, c]` -- both b and c depend on a (returns the vector);
//! - `vec![a, b] >> c` -- c depends on both (returns c);
//! - the `<<` forms are symmetric.
//!
//! Single-operand sides are generic over any [`EdgeTarget`]/[`IntoNodes`];
//! the `Vec` left-hand sides need one concrete impl per operand pairing,
//! since a blanket impl of a std operator for `Vec<_>` is not ours to write.

use std::ops::{Shl, Shr};

use super::{Group, Node, Task};

/// Anything usable as the source side of dependency edges.
pub trait IntoNodes {
    fn nodes(&self) -> Vec<Node>;
}

/// Anything usable as the target side of dependency edges: records the
/// given predecessors into its pending-edge buffer.
pub trait EdgeTarget {
    fn record_prev_nodes(&self, prevs: &[Node]);
}

impl IntoNodes for Task {
    fn nodes(&self) -> Vec<Node> {
        vec![self.node()]
    }
}

impl IntoNodes for Group {
    fn nodes(&self) -> Vec<Node> {
        vec![self.node()]
    }
}

impl IntoNodes for Node {
    fn nodes(&self) -> Vec<Node> {
        vec![self.clone()]
    }
}

impl IntoNodes for Vec<Task> {
    fn nodes(&self) -> Vec<Node> {
        self.iter().map(Task::node).collect()
    }
}

impl IntoNodes for Vec<Group> {
    fn nodes(&self) -> Vec<Node> {
        self.iter().map(Group::node).collect()
    }
}

impl IntoNodes for Vec<Node> {
    fn nodes(&self) -> Vec<Node> {
        self.clone()
    }
}

impl EdgeTarget for Task {
    fn record_prev_nodes(&self, prevs: &[Node]) {
        self.lock().pending_prev.extend_from_slice(prevs);
    }
}

impl EdgeTarget for Group {
    fn record_prev_nodes(&self, prevs: &[Node]) {
        self.lock().pending_prev.extend_from_slice(prevs);
    }
}

impl EdgeTarget for Node {
    fn record_prev_nodes(&self, prevs: &[Node]) {
        match self {
            Node::Task(task) => task.record_prev_nodes(prevs),
            Node::Group(group) => group.record_prev_nodes(prevs),
        }
    }
}

impl EdgeTarget for Vec<Task> {
    fn record_prev_nodes(&self, prevs: &[Node]) {
        for task in self {
            task.record_prev_nodes(prevs);
        }
    }
}

impl EdgeTarget for Vec<Group> {
    fn record_prev_nodes(&self, prevs: &[Node]) {
        for group in self {
            group.record_prev_nodes(prevs);
        }
    }
}

impl EdgeTarget for Vec<Node> {
    fn record_prev_nodes(&self, prevs: &[Node]) {
        for node in self {
            node.record_prev_nodes(prevs);
        }
    }
}

// ---------------------------------------------------------------------------
// `>>`: left side is the predecessor.
// ---------------------------------------------------------------------------

impl<R: EdgeTarget> Shr<R> for Task {
    type Output = R;

    fn shr(self, rhs: R) -> R {
        rhs.record_prev_nodes(&[Node::Task(self)]);
        rhs
    }
}

impl<R: EdgeTarget> Shr<R> for Group {
    type Output = R;

    fn shr(self, rhs: R) -> R {
        rhs.record_prev_nodes(&[Node::Group(self)]);
        rhs
    }
}

impl<R: EdgeTarget> Shr<R> for Node {
    type Output = R;

    fn shr(self, rhs: R) -> R {
        rhs.record_prev_nodes(&[self]);
        rhs
    }
}

macro_rules! impl_shr_for_vec {
    ($lhs:ty) => {
        impl Shr<Task> for $lhs {
            type Output = Task;

            fn shr(self, rhs: Task) -> Task {
                rhs.record_prev_nodes(&self.nodes());
                rhs
            }
        }

        impl Shr<Group> for $lhs {
            type Output = Group;

            fn shr(self, rhs: Group) -> Group {
                rhs.record_prev_nodes(&self.nodes());
                rhs
            }
        }

        impl Shr<Node> for $lhs {
            type Output = Node;

            fn shr(self, rhs: Node) -> Node {
                rhs.record_prev_nodes(&self.nodes());
                rhs
            }
        }
    };
}

impl_shr_for_vec!(Vec<Task>);
impl_shr_for_vec!(Vec<Group>);
impl_shr_for_vec!(Vec<Node>);

// ---------------------------------------------------------------------------
// `<<`: left side is the dependent.
// ---------------------------------------------------------------------------

impl<R: IntoNodes> Shl<R> for Task {
    type Output = R;

    fn shl(self, rhs: R) -> R {
        self.record_prev_nodes(&rhs.nodes());
        rhs
    }
}

impl<R: IntoNodes> Shl<R> for Group {
    type Output = R;

    fn shl(self, rhs: R) -> R {
        self.record_prev_nodes(&rhs.nodes());
        rhs
    }
}

impl<R: IntoNodes> Shl<R> for Node {
    type Output = R;

    fn shl(self, rhs: R) -> R {
        self.record_prev_nodes(&rhs.nodes());
        rhs
    }
}

macro_rules! impl_shl_for_vec {
    ($lhs:ty) => {
        impl Shl<Task> for $lhs {
            type Output = Task;

            fn shl(self, rhs: Task) -> Task {
                self.record_prev_nodes(&[Node::Task(rhs.clone())]);
                rhs
            }
        }

        impl Shl<Group> for $lhs {
            type Output = Group;

            fn shl(self, rhs: Group) -> Group {
                self.record_prev_nodes(&[Node::Group(rhs.clone())]);
                rhs
            }
        }

        impl Shl<Node> for $lhs {
            type Output = Node;

            fn shl(self, rhs: Node) -> Node {
                self.record_prev_nodes(&[rhs.clone()]);
                rhs
            }
        }
    };
}

impl_shl_for_vec!(Vec<Task>);
impl_shl_for_vec!(Vec<Group>);
impl_shl_for_vec!(Vec<Node>);
