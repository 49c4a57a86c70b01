/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Interpreter state snapshots attached to LIR instructions.

use crate::bitvec::BitVec;
use crate::frame_map::FrameMap;
use crate::target::Register;
use crate::value::{CompositeValue, Value};
use crate::{Block, MethodId};
use smallvec::SmallVec;

/// One interpreter frame: values laid out as locals, then operand
/// stack, then held locks. Inlined frames link to their caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytecodeFrame {
    pub caller: Option<Box<BytecodeFrame>>,
    pub method: MethodId,
    pub bci: i32,
    /// Execution resumes by rethrowing the exception on top of the stack.
    pub rethrow_exception: bool,
    pub during_call: bool,
    pub values: Vec<Value>,
    pub num_locals: u32,
    pub num_stack: u32,
    pub num_locks: u32,
}

impl BytecodeFrame {
    /// The bci of a method's synchronization entry.
    pub const BEFORE_BCI: i32 = -1;
    /// State after the method returned.
    pub const AFTER_BCI: i32 = -2;
    /// State after an exception left the method.
    pub const AFTER_EXCEPTION_BCI: i32 = -4;

    pub fn new(
        caller: Option<Box<BytecodeFrame>>,
        method: MethodId,
        bci: i32,
        rethrow_exception: bool,
        during_call: bool,
        values: Vec<Value>,
        num_locals: u32,
        num_stack: u32,
        num_locks: u32,
    ) -> Self {
        assert_eq!(
            values.len(),
            (num_locals + num_stack + num_locks) as usize,
            "frame value count does not match locals + stack + locks"
        );
        assert!(
            !rethrow_exception || num_stack == 1,
            "rethrow_exception frame must have exactly one stack value, got {}",
            num_stack
        );
        BytecodeFrame {
            caller,
            method,
            bci,
            rethrow_exception,
            during_call,
            values,
            num_locals,
            num_stack,
            num_locks,
        }
    }

    pub fn local_at(&self, i: usize) -> &Value {
        debug_assert!(i < self.num_locals as usize);
        &self.values[i]
    }

    pub fn stack_at(&self, i: usize) -> &Value {
        debug_assert!(i < self.num_stack as usize);
        &self.values[self.num_locals as usize + i]
    }

    pub fn lock_at(&self, i: usize) -> &Value {
        debug_assert!(i < self.num_locks as usize);
        &self.values[(self.num_locals + self.num_stack) as usize + i]
    }

    /// This frame and its callers, innermost first.
    pub fn frames(&self) -> impl Iterator<Item = &BytecodeFrame> {
        let mut next = Some(self);
        core::iter::from_fn(move || {
            let frame = next?;
            next = frame.caller.as_deref();
            Some(frame)
        })
    }

    /// Visits every value of every frame in the chain.
    pub fn for_each_value_mut<F: FnMut(&mut Value)>(&mut self, f: &mut F) {
        for value in self.values.iter_mut() {
            f(value);
        }
        if let Some(caller) = self.caller.as_mut() {
            caller.for_each_value_mut(f);
        }
    }

    pub fn for_each_value<F: FnMut(&Value)>(&self, f: &mut F) {
        for frame in self.frames() {
            for value in &frame.values {
                f(value);
            }
        }
    }
}

/// Locations that hold live references at a frame state's instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    pub registers: SmallVec<[Register; 4]>,
    /// Stack slots, still virtual until the frame is finalized.
    pub slots: SmallVec<[Value; 4]>,
}

/// Register and frame bitmaps of live references, in final form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugInfo {
    pub frame: BytecodeFrame,
    /// Indexed by `Register::index()`.
    pub register_ref_map: BitVec,
    /// Indexed by stack-pointer-relative word.
    pub frame_ref_map: BitVec,
}

/// A frame state as carried by a LIR instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct LirFrameState {
    pub top_frame: BytecodeFrame,
    /// Handler block entered if the instruction throws.
    pub exception_edge: Option<Block>,
    reference_map: Option<ReferenceMap>,
}

impl LirFrameState {
    pub fn new(top_frame: BytecodeFrame, exception_edge: Option<Block>) -> Self {
        LirFrameState {
            top_frame,
            exception_edge,
            reference_map: None,
        }
    }

    pub fn set_reference_map(&mut self, map: ReferenceMap) {
        self.reference_map = Some(map);
    }

    pub fn reference_map(&self) -> Option<&ReferenceMap> {
        self.reference_map.as_ref()
    }

    /// Final debug information for this state. The frame must be
    /// finalized and register allocation must have filled in the
    /// reference map.
    pub fn debug_info(&self, frame_map: &FrameMap) -> DebugInfo {
        let reference_map = match &self.reference_map {
            Some(map) => map,
            None => panic!("frame state at bci {} requested before allocation", self.top_frame.bci),
        };
        let mut frame = self.top_frame.clone();
        frame.for_each_value_mut(&mut |value| resolve_slots(value, frame_map));

        let mut register_ref_map = BitVec::new();
        for reg in &reference_map.registers {
            register_ref_map.set(reg.index(), true);
        }
        let mut frame_ref_map = BitVec::new();
        for slot in &reference_map.slots {
            frame_ref_map.set(frame_map.reference_map_index(slot), true);
        }
        DebugInfo {
            frame,
            register_ref_map,
            frame_ref_map,
        }
    }
}

fn resolve_slots(value: &mut Value, frame_map: &FrameMap) {
    match value {
        Value::VirtualStackSlot(_) => *value = frame_map.to_stack_slot(value),
        Value::Variable(v) => panic!("unallocated variable {} in frame state", v),
        Value::Composite(composite) => {
            let composite: &mut CompositeValue = composite;
            for component in composite.components_mut() {
                resolve_slots(component, frame_map);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::Constant;

    fn frame(rethrow: bool, stack: Vec<Value>) -> BytecodeFrame {
        let num_stack = stack.len() as u32;
        let mut values = vec![Value::Constant(Constant::Int(1))];
        values.extend(stack);
        BytecodeFrame::new(None, MethodId::new(0), 3, rethrow, false, values, 1, num_stack, 0)
    }

    #[test]
    fn rethrow_with_one_stack_value() {
        let f = frame(true, vec![Value::Constant(Constant::Null)]);
        assert!(f.rethrow_exception);
        assert_eq!(f.stack_at(0), &Value::Constant(Constant::Null));
    }

    #[test]
    #[should_panic(expected = "exactly one stack value")]
    fn rethrow_with_empty_stack() {
        frame(true, vec![]);
    }

    #[test]
    #[should_panic(expected = "exactly one stack value")]
    fn rethrow_with_two_stack_values() {
        frame(
            true,
            vec![Value::Constant(Constant::Null), Value::Constant(Constant::Int(2))],
        );
    }

    #[test]
    fn caller_chain_is_visited() {
        let outer = frame(false, vec![]);
        let mut inner = BytecodeFrame::new(
            Some(Box::new(outer)),
            MethodId::new(1),
            0,
            false,
            true,
            vec![Value::Constant(Constant::Int(5))],
            1,
            0,
            0,
        );
        assert_eq!(inner.frames().count(), 2);
        let mut seen = 0;
        inner.for_each_value_mut(&mut |_| seen += 1);
        assert_eq!(seen, 2);
    }
}
