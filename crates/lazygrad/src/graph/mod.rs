//! Deferred node graphs and their lowering into backend programs.
//!
//! Operators record nodes in an arena-backed DAG without executing anything. When results are
//! requested, [`GraphBuilder`] orders the reachable nodes and lowers each one into SSA
//! instructions through the [`OpKind`] dispatch table.
mod arena;
mod builder;
mod lowering;
mod node;
mod order;
mod state;

pub use arena::GraphArena;
pub use builder::{GraphBuilder, LoweredGraph};
pub use lowering::{Arity, OpKind, PoolKind, ReduceOp, UnaryKind};
pub use node::Node;
pub use order::topological_order;
pub use state::{NodeId, NodeKind};
