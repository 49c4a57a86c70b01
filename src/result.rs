/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The compilation result: machine code plus the metadata the runtime
//! needs to install and execute it.

use crate::constant::Constant;
use crate::lir::DebugInfo;
use crate::{MethodId, TypeId};
use core::fmt;
use smallvec::SmallVec;

/// Why an infopoint was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InfopointReason {
    Call,
    Safepoint,
    ImplicitException,
    Other,
}

/// Runtime entry points called by generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum RuntimeCall {
    Deoptimize,
    HandleException,
    CreateNullPointerException,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallTarget {
    Method(MethodId),
    Runtime(RuntimeCall),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub target: CallTarget,
    /// Size of the call instruction; the return address is
    /// `pc_offset + size`.
    pub size: u32,
    pub direct: bool,
}

/// A code position annotated with debug information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Infopoint {
    pub pc_offset: u32,
    pub debug_info: Option<DebugInfo>,
    pub reason: InfopointReason,
    /// Set for call sites.
    pub call: Option<CallSite>,
}

/// A reference from code to a constant, either embedded in the
/// instruction (`inlined`) or placed in the data section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPatch {
    pub pc_offset: u32,
    pub constant: Constant,
    pub alignment: u32,
    pub inlined: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Return address of the call, or the faulting instruction.
    pub pc_offset: u32,
    pub handler_pos: u32,
}

/// Mark ids understood by the installer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MarkId(pub u32);

impl MarkId {
    pub const VERIFIED_ENTRY: MarkId = MarkId(1);
    pub const FRAME_COMPLETE: MarkId = MarkId(2);
    pub const EXCEPTION_HANDLER_ENTRY: MarkId = MarkId(3);
    pub const DEOPT_HANDLER_ENTRY: MarkId = MarkId(4);
    pub const POLL_NEAR: MarkId = MarkId(5);
}

define_index!(MarkIndex);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mark {
    pub pc_offset: u32,
    pub id: MarkId,
    pub references: SmallVec<[MarkIndex; 2]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeAnnotation {
    Comment {
        position: u32,
        text: String,
    },
    /// A table of `high - low + 1` entries of `entry_size` bytes at
    /// `position`.
    JumpTable {
        position: u32,
        low: i32,
        high: i32,
        entry_size: u32,
    },
}

/// Facts the code relies on that the runtime must watch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Assumption {
    ConcreteSubtype { context: TypeId, subtype: TypeId },
    ConcreteMethod { context: TypeId, method: MethodId, implementation: MethodId },
    NoFinalizableSubclass(TypeId),
    MethodContents(MethodId),
}

/// Any metadata site, for installers that process all of them uniformly.
#[derive(Clone, Copy, Debug)]
pub enum Site<'a> {
    Infopoint(&'a Infopoint),
    Call(&'a Infopoint),
    DataPatch(&'a DataPatch),
    ExceptionHandler(&'a ExceptionHandler),
    Mark(&'a Mark),
}

impl<'a> Site<'a> {
    pub fn pc_offset(&self) -> u32 {
        match self {
            Site::Infopoint(i) | Site::Call(i) => i.pc_offset,
            Site::DataPatch(d) => d.pc_offset,
            Site::ExceptionHandler(e) => e.pc_offset,
            Site::Mark(m) => m.pc_offset,
        }
    }
}

const UNSET: i32 = -1;

#[derive(Clone, Debug)]
pub struct CompilationResult {
    name: String,
    target_code: Vec<u8>,
    infopoints: Vec<Infopoint>,
    data_patches: Vec<DataPatch>,
    exception_handlers: Vec<ExceptionHandler>,
    marks: Vec<Mark>,
    annotations: Vec<CodeAnnotation>,
    assumptions: Vec<Assumption>,
    data_section: Vec<u8>,
    data_section_alignment: u32,
    data_section_offset: u32,
    frame_size: i32,
    custom_stack_area_offset: i32,
    register_restore_epilogue_offset: i32,
    frame_finalized: bool,
}

impl CompilationResult {
    pub fn new(name: impl Into<String>) -> Self {
        CompilationResult {
            name: name.into(),
            target_code: vec![],
            infopoints: vec![],
            data_patches: vec![],
            exception_handlers: vec![],
            marks: vec![],
            annotations: vec![],
            assumptions: vec![],
            data_section: vec![],
            data_section_alignment: 1,
            data_section_offset: 0,
            frame_size: UNSET,
            custom_stack_area_offset: UNSET,
            register_restore_epilogue_offset: UNSET,
            frame_finalized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn add_infopoint(&mut self, infopoint: Infopoint) {
        let out_of_order = self
            .infopoints
            .last()
            .map_or(false, |last| last.pc_offset > infopoint.pc_offset);
        self.infopoints.push(infopoint);
        if out_of_order {
            self.infopoints
                .sort_by(|a, b| (a.pc_offset, a.reason).cmp(&(b.pc_offset, b.reason)));
        }
    }

    /// Records a call whose first byte is at `pc_offset`.
    pub fn record_call(
        &mut self,
        pc_offset: u32,
        size: u32,
        target: CallTarget,
        debug_info: Option<DebugInfo>,
        direct: bool,
    ) {
        trace!("result: call {:?} at {} size {}", target, pc_offset, size);
        self.add_infopoint(Infopoint {
            pc_offset,
            debug_info,
            reason: InfopointReason::Call,
            call: Some(CallSite {
                target,
                size,
                direct,
            }),
        });
    }

    pub fn record_infopoint(
        &mut self,
        pc_offset: u32,
        debug_info: Option<DebugInfo>,
        reason: InfopointReason,
    ) {
        debug_assert!(reason != InfopointReason::Call, "use record_call for calls");
        trace!("result: infopoint {:?} at {}", reason, pc_offset);
        self.add_infopoint(Infopoint {
            pc_offset,
            debug_info,
            reason,
            call: None,
        });
    }

    pub fn record_data_patch(
        &mut self,
        pc_offset: u32,
        constant: Constant,
        alignment: u32,
        inlined: bool,
    ) {
        self.data_patches.push(DataPatch {
            pc_offset,
            constant,
            alignment,
            inlined,
        });
    }

    pub fn record_exception_handler(&mut self, pc_offset: u32, handler_pos: u32) {
        self.exception_handlers.push(ExceptionHandler {
            pc_offset,
            handler_pos,
        });
    }

    pub fn record_mark(&mut self, pc_offset: u32, id: MarkId, references: &[MarkIndex]) -> MarkIndex {
        for r in references {
            assert!(r.index() < self.marks.len(), "mark references unknown mark {:?}", r);
        }
        let index = MarkIndex::new(self.marks.len());
        self.marks.push(Mark {
            pc_offset,
            id,
            references: references.iter().copied().collect(),
        });
        index
    }

    pub fn add_annotation(&mut self, annotation: CodeAnnotation) {
        self.annotations.push(annotation);
    }

    pub fn set_assumptions(&mut self, assumptions: Vec<Assumption>) {
        self.assumptions = assumptions;
    }

    pub fn set_target_code(&mut self, code: Vec<u8>) {
        self.target_code = code;
    }

    /// Installs the data section, to be placed `offset` bytes after the
    /// start of the code.
    pub fn set_data_section(&mut self, bytes: Vec<u8>, alignment: u32, offset: u32) {
        debug_assert_eq!(offset % alignment, 0);
        self.data_section = bytes;
        self.data_section_alignment = alignment;
        self.data_section_offset = offset;
    }

    /// Fixes the frame size and custom stack area offset. One-shot.
    pub fn finalize_frame(&mut self, frame_size: u32, custom_stack_area_offset: Option<u32>) {
        assert!(!self.frame_finalized, "frame of {} finalized twice", self.name);
        self.frame_size = frame_size as i32;
        self.custom_stack_area_offset = custom_stack_area_offset.map_or(UNSET, |o| o as i32);
        self.frame_finalized = true;
    }

    pub fn set_register_restore_epilogue_offset(&mut self, offset: u32) {
        assert_eq!(
            self.register_restore_epilogue_offset, UNSET,
            "register restore epilogue offset already set"
        );
        self.register_restore_epilogue_offset = offset as i32;
    }

    fn check_finalized(&self, what: &str) {
        assert!(
            self.frame_finalized,
            "{} of {} read before frame finalization",
            what, self.name
        );
    }

    pub fn frame_size(&self) -> i32 {
        self.check_finalized("frame size");
        self.frame_size
    }

    /// -1 when no custom area was requested.
    pub fn custom_stack_area_offset(&self) -> i32 {
        self.check_finalized("custom stack area offset");
        self.custom_stack_area_offset
    }

    /// -1 when the epilogue restores no registers.
    pub fn register_restore_epilogue_offset(&self) -> i32 {
        self.check_finalized("register restore epilogue offset");
        self.register_restore_epilogue_offset
    }

    pub fn target_code(&self) -> &[u8] {
        &self.target_code
    }

    pub fn target_code_size(&self) -> usize {
        self.target_code.len()
    }

    pub fn infopoints(&self) -> &[Infopoint] {
        &self.infopoints
    }

    pub fn data_patches(&self) -> &[DataPatch] {
        &self.data_patches
    }

    pub fn exception_handlers(&self) -> &[ExceptionHandler] {
        &self.exception_handlers
    }

    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    pub fn annotations(&self) -> &[CodeAnnotation] {
        &self.annotations
    }

    pub fn assumptions(&self) -> &[Assumption] {
        &self.assumptions
    }

    pub fn data_section(&self) -> &[u8] {
        &self.data_section
    }

    pub fn data_section_alignment(&self) -> u32 {
        self.data_section_alignment
    }

    pub fn data_section_offset(&self) -> u32 {
        self.data_section_offset
    }

    /// All sites sorted by pc offset.
    pub fn sites(&self) -> Vec<Site<'_>> {
        let mut sites: Vec<Site<'_>> = self
            .infopoints
            .iter()
            .map(|i| {
                if i.call.is_some() {
                    Site::Call(i)
                } else {
                    Site::Infopoint(i)
                }
            })
            .chain(self.data_patches.iter().map(Site::DataPatch))
            .chain(self.exception_handlers.iter().map(Site::ExceptionHandler))
            .chain(self.marks.iter().map(Site::Mark))
            .collect();
        sites.sort_by_key(|s| s.pc_offset());
        sites
    }
}

impl fmt::Display for CompilationResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {} bytes", self.name, self.target_code.len())?;
        if self.frame_finalized {
            writeln!(f, "  frame size: {}", self.frame_size)?;
        }
        for site in self.sites() {
            match site {
                Site::Infopoint(i) => writeln!(f, "  {:>5}: infopoint {:?}", i.pc_offset, i.reason)?,
                Site::Call(i) => {
                    let call = i.call.as_ref().map(|c| c.target);
                    writeln!(f, "  {:>5}: call {:?}", i.pc_offset, call)?
                }
                Site::DataPatch(d) => writeln!(
                    f,
                    "  {:>5}: data {} (align {}, {})",
                    d.pc_offset,
                    d.constant,
                    d.alignment,
                    if d.inlined { "inline" } else { "section" }
                )?,
                Site::ExceptionHandler(e) => {
                    writeln!(f, "  {:>5}: exception handler -> {}", e.pc_offset, e.handler_pos)?
                }
                Site::Mark(m) => writeln!(f, "  {:>5}: mark {}", m.pc_offset, m.id.0)?,
            }
        }
        Ok(())
    }
}
