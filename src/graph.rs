/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The interfaces through which the back end consumes its input: a
//! scheduled control-flow graph of high-level operations and a provider
//! of method metadata.

use crate::constant::Constant;
use crate::result::Assumption;
use crate::target::MemoryBarriers;
use crate::value::Kind;
use crate::{Block, MethodId, NodeId};

/// Comparison conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned less-than.
    Below,
    /// Unsigned greater-or-equal.
    AboveEqual,
}

impl Condition {
    pub fn negate(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Le => Condition::Gt,
            Condition::Gt => Condition::Le,
            Condition::Below => Condition::AboveEqual,
            Condition::AboveEqual => Condition::Below,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        !matches!(self, BinaryOp::Sub)
    }
}

/// Interpreter state at a node, in terms of other nodes. `None` locals
/// are dead.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct FrameStateNode {
    pub method: MethodId,
    pub bci: i32,
    pub rethrow_exception: bool,
    pub during_call: bool,
    pub locals: Vec<Option<NodeId>>,
    pub stack: Vec<NodeId>,
    /// Owners of the held monitors, outermost first.
    pub locks: Vec<NodeId>,
    pub outer: Option<Box<FrameStateNode>>,
}

impl FrameStateNode {
    pub fn new(method: MethodId, bci: i32) -> Self {
        FrameStateNode {
            method,
            bci,
            rethrow_exception: false,
            during_call: false,
            locals: vec![],
            stack: vec![],
            locks: vec![],
            outer: None,
        }
    }
}

/// High-level operations.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum NodeOp {
    Parameter(u32),
    Constant(Constant),
    Binary(BinaryOp, NodeId, NodeId),
    /// One input per predecessor of the node's block, in predecessor
    /// order. Phis come first in their block.
    Phi(Vec<NodeId>),
    /// Ends a block with two successors: the first is taken when the
    /// condition holds.
    If {
        condition: Condition,
        x: NodeId,
        y: NodeId,
        true_probability: f64,
    },
    /// Ends a block with one successor.
    Goto,
    Return(Option<NodeId>),
    /// With `exception_edge`, ends a block whose successors are the
    /// normal continuation and the exception handler, in that order.
    Invoke {
        target: MethodId,
        arguments: Vec<NodeId>,
        state: FrameStateNode,
        exception_edge: bool,
    },
    LoadField {
        object: NodeId,
        offset: i32,
        state: Option<FrameStateNode>,
    },
    StoreField {
        object: NodeId,
        offset: i32,
        value: NodeId,
        state: Option<FrameStateNode>,
    },
    NullCheck {
        object: NodeId,
        state: FrameStateNode,
    },
    Safepoint(FrameStateNode),
    /// Ends a block without successors.
    Deoptimize {
        reason: u32,
        state: FrameStateNode,
    },
    /// The exception delivered to a handler block; first in its block.
    ExceptionObject,
    MemoryBarrier(MemoryBarriers),
    /// Ends a block; successors are the targets for keys `low..` in
    /// order followed by the default successor.
    Switch { value: NodeId, low: i32 },
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Node {
    pub id: NodeId,
    pub kind: Kind,
    pub op: NodeOp,
}

/// A scheduled control-flow graph.
pub trait ScheduledGraph {
    fn method(&self) -> MethodId;
    fn num_blocks(&self) -> usize;
    fn entry_block(&self) -> Block;
    fn block_succs(&self, block: Block) -> &[Block];
    fn block_preds(&self, block: Block) -> &[Block];
    /// Nodes of the block in schedule order.
    fn block_nodes(&self, block: Block) -> &[Node];
    /// Upper bound of node ids.
    fn num_nodes(&self) -> usize;

    /// Relative execution frequency of the block.
    fn block_probability(&self, _block: Block) -> f64 {
        1.0
    }

    fn is_exception_entry(&self, _block: Block) -> bool {
        false
    }

    fn parameter_kinds(&self) -> &[Kind];
    fn return_kind(&self) -> Kind;

    /// Bytecode index of an on-stack-replacement entry, if any.
    fn entry_bci(&self) -> Option<i32> {
        None
    }

    fn assumptions(&self) -> Vec<Assumption> {
        vec![]
    }
}

/// Immutable properties of a method.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct MethodInfo {
    pub name: String,
    pub parameter_kinds: Vec<Kind>,
    pub return_kind: Kind,
    pub flags: u32,
}

impl MethodInfo {
    pub const ACC_STATIC: u32 = 0x0008;
    pub const ACC_SYNCHRONIZED: u32 = 0x0020;
    pub const ACC_NATIVE: u32 = 0x0100;

    pub fn is_static(&self) -> bool {
        self.flags & Self::ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.flags & Self::ACC_NATIVE != 0
    }
}

/// Resolves method identities.
pub trait MetaAccessProvider {
    fn method(&self, id: MethodId) -> Option<MethodInfo>;
}
