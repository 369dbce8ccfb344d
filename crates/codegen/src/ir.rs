//! Instruction sequences and compilation units.
//!
//! Code generation appends into an [`InstructionSeq`]: a flat, append-only
//! list of located instructions plus a table of jump labels. When a scope
//! is finished, [`CodeUnit::finalize_code`] assembles the sequence into a
//! [`CodeObject`]: labels become instruction indices, per-instruction
//! handler annotations become the exception table, unreferenced constants
//! are dropped, and the maximum stack depth is computed.

use crate::{IndexMap, IndexSet, error::InternalError};

use krait_compiler_core::{
    SourceRange,
    bytecode::{CodeFlags, CodeObject, ConstantData, ExceptionTableEntry, Instruction, Label},
};

/// The innermost exception handler covering an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerInfo {
    /// Handler entry point; resolved to an instruction index on assembly.
    pub target: Label,
    /// Value-stack depth to unwind to before the exception is pushed.
    pub depth: u32,
    /// Whether the resume offset is pushed below the exception.
    pub preserve_lasti: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct InstructionInfo {
    pub instr: Instruction,
    pub location: SourceRange,
    pub handler: Option<HandlerInfo>,
}

/// An append-only ordered list of instructions with label bookkeeping.
#[derive(Debug, Default)]
pub struct InstructionSeq {
    instructions: Vec<InstructionInfo>,
    /// Placement of each allocated label: the index of the instruction the
    /// label precedes, or `None` while unplaced.
    labels: Vec<Option<u32>>,
    /// Pre-assembly child sequences, retained only in debug-capture mode.
    nested: Vec<InstructionSeq>,
}

impl InstructionSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unplaced label. Label ids are dense per sequence.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind `label` to the next instruction appended.
    pub fn place_label(&mut self, label: Label) -> Result<(), InternalError> {
        let slot = &mut self.labels[label.idx()];
        if slot.is_some() {
            return Err(InternalError::LabelAlreadyPlaced(label.0));
        }
        *slot = Some(self.instructions.len() as u32);
        Ok(())
    }

    pub fn emit(
        &mut self,
        instr: Instruction,
        location: SourceRange,
        handler: Option<HandlerInfo>,
    ) {
        self.instructions.push(InstructionInfo {
            instr,
            location,
            handler,
        });
    }

    /// O(n) prepend, shifting every placed label. Used once per generator
    /// or coroutine unit to install the creation prologue at offset 0.
    pub fn insert_front(&mut self, prologue: &[Instruction], location: SourceRange) {
        let shift = prologue.len() as u32;
        for slot in self.labels.iter_mut().flatten() {
            *slot += shift;
        }
        self.instructions.splice(
            0..0,
            prologue.iter().map(|&instr| InstructionInfo {
                instr,
                location,
                handler: None,
            }),
        );
    }

    /// Append a finished child sequence verbatim for inspection. Only the
    /// debug-capture driver calls this; the child plays no role in the
    /// assembled output.
    pub fn attach_nested(&mut self, child: InstructionSeq) {
        self.nested.push(child);
    }

    pub fn nested(&self) -> &[InstructionSeq] {
        &self.nested
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &[InstructionInfo] {
        &self.instructions
    }

    pub fn last_mut(&mut self) -> Option<&mut InstructionInfo> {
        self.instructions.last_mut()
    }

    /// True when a label is placed at the current end of the sequence, i.e.
    /// an already-emitted jump may target the next instruction.
    pub fn is_jump_target_here(&self) -> bool {
        let here = self.instructions.len() as u32;
        self.labels.iter().any(|slot| *slot == Some(here))
    }

    fn resolve_label(&self, label: Label) -> Result<u32, InternalError> {
        self.labels[label.idx()].ok_or(InternalError::UnplacedLabel(label.0))
    }
}

/// Metadata for a code unit.
#[derive(Clone, Debug)]
pub struct CodeUnitMetadata {
    pub name: String,
    pub qualname: Option<String>,
    pub consts: IndexSet<ConstantData>,
    pub names: IndexSet<String>,
    pub varnames: IndexSet<String>,
    pub cellvars: IndexSet<String>,
    pub freevars: IndexSet<String>,
    pub fast_hidden: IndexMap<String, bool>,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub firstlineno: u32,
}

/// One lexical scope being compiled: the live half of a future code object.
pub struct CodeUnit {
    pub flags: CodeFlags,
    pub source_path: String,
    /// Current class name for private-name mangling.
    pub private: Option<String>,

    pub seq: InstructionSeq,
    pub metadata: CodeUnitMetadata,

    /// For class scopes: attributes assigned via `self.X` in methods.
    pub static_attributes: Option<IndexSet<String>>,

    /// True while emitting an inlined comprehension into this unit.
    pub in_inlined_comp: bool,

    /// Frame-block stack for tracking nested control structures.
    pub fblocks: Vec<crate::compile::FBlockInfo>,

    /// Index of this scope's entry on the symbol-table stack.
    pub symbol_table_index: usize,

    /// Annotations postponed to an `__annotate__` scope: mangled target
    /// name paired with the annotation expression.
    pub deferred_annotations: Vec<(String, krait_ast::Expr)>,
}

impl CodeUnit {
    /// Assemble the finished sequence into a code object.
    pub fn finalize_code(mut self) -> Result<CodeObject, InternalError> {
        // Generators and coroutines create their generator object before
        // the first RESUME.
        if self
            .flags
            .intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR)
        {
            self.seq.insert_front(
                &[Instruction::ReturnGenerator, Instruction::PopTop],
                SourceRange::NONE,
            );
        }

        self.remove_unused_consts();

        let Self {
            flags,
            source_path,
            seq,
            metadata,
            ..
        } = self;

        let mut instructions = Vec::with_capacity(seq.len());
        let mut locations = Vec::with_capacity(seq.len());
        let mut handlers = Vec::with_capacity(seq.len());

        for info in &seq.instructions {
            let mut instr = info.instr;
            if let Some(target) = instr.label_arg_mut() {
                *target = Label(seq.resolve_label(*target)?);
            }
            let handler = match info.handler {
                Some(h) => Some((seq.resolve_label(h.target)?, h.depth, h.preserve_lasti)),
                None => None,
            };
            instructions.push(instr);
            locations.push(info.location);
            handlers.push(handler);
        }

        let max_stackdepth = max_stackdepth(&instructions, &handlers)?;
        let exception_table = build_exception_table(&handlers);
        let cell2arg = cell2arg(&metadata, flags);

        let CodeUnitMetadata {
            name: obj_name,
            qualname,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            fast_hidden: _,
            argcount,
            posonlyargcount,
            kwonlyargcount,
            firstlineno,
        } = metadata;

        Ok(CodeObject {
            instructions: instructions.into_boxed_slice(),
            locations: locations.into_boxed_slice(),
            exception_table,
            flags,
            posonlyarg_count: posonlyargcount,
            arg_count: argcount,
            kwonlyarg_count: kwonlyargcount,
            source_path,
            first_line_number: firstlineno,
            max_stackdepth,
            qualname: qualname.unwrap_or_else(|| obj_name.clone()),
            obj_name,
            constants: consts.into_iter().collect(),
            names: names.into_iter().collect(),
            varnames: varnames.into_iter().collect(),
            cellvars: cellvars.into_iter().collect(),
            freevars: freevars.into_iter().collect(),
            cell2arg,
        })
    }

    /// Drop constants no `LoadConst`/`ReturnConst` refers to and re-index
    /// the survivors.
    fn remove_unused_consts(&mut self) {
        let nconsts = self.metadata.consts.len();
        if nconsts == 0 {
            return;
        }

        let mut used = vec![false; nconsts];
        for info in self.seq.instructions() {
            if let Instruction::LoadConst { idx } | Instruction::ReturnConst { idx } = info.instr
            {
                used[idx as usize] = true;
            }
        }
        if used.iter().all(|&u| u) {
            return;
        }

        let mut old_to_new = vec![0u32; nconsts];
        let mut next = 0u32;
        for (old, &is_used) in used.iter().enumerate() {
            if is_used {
                old_to_new[old] = next;
                next += 1;
            }
        }

        let old_consts = std::mem::take(&mut self.metadata.consts);
        for (old, constant) in old_consts.into_iter().enumerate() {
            if used[old] {
                self.metadata.consts.insert(constant);
            }
        }

        for info in &mut self.seq.instructions {
            match &mut info.instr {
                Instruction::LoadConst { idx } | Instruction::ReturnConst { idx } => {
                    *idx = old_to_new[*idx as usize];
                }
                _ => {}
            }
        }
    }
}

fn cell2arg(metadata: &CodeUnitMetadata, flags: CodeFlags) -> Option<Box<[i32]>> {
    if metadata.cellvars.is_empty() {
        return None;
    }

    let total_args = metadata.argcount
        + metadata.kwonlyargcount
        + flags.contains(CodeFlags::VARARGS) as u32
        + flags.contains(CodeFlags::VARKEYWORDS) as u32;

    let mut found_cellarg = false;
    let cell2arg = metadata
        .cellvars
        .iter()
        .map(|var| {
            metadata
                .varnames
                .get_index_of(var)
                .filter(|i| *i < total_args as usize)
                .map_or(-1, |i| {
                    found_cellarg = true;
                    i as i32
                })
        })
        .collect::<Box<[_]>>();

    if found_cellarg { Some(cell2arg) } else { None }
}

type ResolvedHandler = Option<(u32, u32, bool)>;

/// Worklist simulation of the value stack over the resolved instruction
/// stream. Every reachable instruction is visited with the maximum entry
/// depth seen so far; handler entries start at the recorded unwind depth
/// plus the pushed exception (and resume offset when preserved).
fn max_stackdepth(
    instructions: &[Instruction],
    handlers: &[ResolvedHandler],
) -> Result<u32, InternalError> {
    if instructions.is_empty() {
        return Ok(0);
    }

    const UNVISITED: i64 = -1;
    let mut start_depths = vec![UNVISITED; instructions.len()];
    let mut maxdepth: i64 = 0;
    let mut worklist = vec![0usize];
    start_depths[0] = 0;

    while let Some(mut idx) = worklist.pop() {
        let mut depth = start_depths[idx];
        loop {
            let instr = &instructions[idx];
            let new_depth = depth + i64::from(instr.stack_effect());
            if new_depth < 0 {
                return Err(InternalError::StackUnderflow);
            }
            if new_depth > u32::MAX as i64 {
                return Err(InternalError::StackOverflow);
            }
            maxdepth = maxdepth.max(new_depth);

            if let Some(target) = instr.label_arg() {
                schedule(&mut worklist, &mut start_depths, target.idx(), new_depth);
            }
            if let Some((target, unwind_depth, preserve_lasti)) = handlers[idx] {
                let handler_depth =
                    i64::from(unwind_depth) + 1 + i64::from(preserve_lasti as u32);
                maxdepth = maxdepth.max(handler_depth);
                schedule(
                    &mut worklist,
                    &mut start_depths,
                    target as usize,
                    handler_depth,
                );
            }

            if instr.is_scope_exit() || instr.is_unconditional_jump() {
                break;
            }
            idx += 1;
            if idx >= instructions.len() {
                break;
            }
            depth = new_depth;
            // fall-through into an already better-visited instruction
            if start_depths[idx] >= depth {
                break;
            }
            start_depths[idx] = depth;
        }
    }

    Ok(maxdepth as u32)
}

fn schedule(worklist: &mut Vec<usize>, start_depths: &mut [i64], target: usize, depth: i64) {
    if start_depths[target] < depth {
        start_depths[target] = depth;
        worklist.push(target);
    }
}

/// Coalesce runs of instructions annotated with the same handler into
/// exception-table entries.
fn build_exception_table(handlers: &[ResolvedHandler]) -> Box<[ExceptionTableEntry]> {
    let mut entries = Vec::new();
    let mut current: Option<((u32, u32, bool), u32)> = None;

    for (idx, handler) in handlers.iter().enumerate() {
        let idx = idx as u32;
        match (current, *handler) {
            (None, None) => {}
            (None, Some(h)) => current = Some((h, idx)),
            (Some((h, _)), Some(nh)) if h == nh => {}
            (Some((h, start)), next) => {
                entries.push(ExceptionTableEntry {
                    start,
                    end: idx,
                    target: h.0,
                    depth: h.1,
                    preserve_lasti: h.2,
                });
                current = next.map(|nh| (nh, idx));
            }
        }
    }
    if let Some((h, start)) = current {
        entries.push(ExceptionTableEntry {
            start,
            end: handlers.len() as u32,
            target: h.0,
            depth: h.1,
            preserve_lasti: h.2,
        });
    }

    entries.into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_compiler_core::bytecode::ResumeType;

    fn unit_with(seq: InstructionSeq) -> CodeUnit {
        CodeUnit {
            flags: CodeFlags::NEWLOCALS,
            source_path: "<test>".to_owned(),
            private: None,
            seq,
            metadata: CodeUnitMetadata {
                name: "<test>".to_owned(),
                qualname: None,
                consts: IndexSet::default(),
                names: IndexSet::default(),
                varnames: IndexSet::default(),
                cellvars: IndexSet::default(),
                freevars: IndexSet::default(),
                fast_hidden: IndexMap::default(),
                argcount: 0,
                posonlyargcount: 0,
                kwonlyargcount: 0,
                firstlineno: 1,
            },
            static_attributes: None,
            in_inlined_comp: false,
            fblocks: Vec::new(),
            symbol_table_index: 0,
            deferred_annotations: Vec::new(),
        }
    }

    fn emit(seq: &mut InstructionSeq, instr: Instruction) {
        seq.emit(instr, SourceRange::NONE, None);
    }

    #[test]
    fn labels_are_dense_and_placed_once() {
        let mut seq = InstructionSeq::new();
        let a = seq.new_label();
        let b = seq.new_label();
        assert_eq!(a, Label(0));
        assert_eq!(b, Label(1));
        seq.place_label(a).unwrap();
        assert_eq!(seq.place_label(a), Err(InternalError::LabelAlreadyPlaced(0)));
    }

    #[test]
    fn unplaced_label_is_rejected_at_assembly() {
        let mut seq = InstructionSeq::new();
        let end = seq.new_label();
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PopTop);
        seq.emit(Instruction::Jump { target: end }, SourceRange::NONE, None);
        let err = unit_with(seq).finalize_code().unwrap_err();
        assert_eq!(err, InternalError::UnplacedLabel(0));
    }

    #[test]
    fn jump_targets_resolve_to_instruction_indices() {
        let mut seq = InstructionSeq::new();
        let end = seq.new_label();
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PopJumpIfFalse { target: end });
        emit(&mut seq, Instruction::Nop);
        seq.place_label(end).unwrap();
        emit(&mut seq, Instruction::ReturnValue);
        let code = unit_with(seq).finalize_code().unwrap();
        assert_eq!(
            code.instructions[2],
            Instruction::PopJumpIfFalse { target: Label(4) }
        );
    }

    #[test]
    fn insert_front_shifts_placed_labels() {
        let mut seq = InstructionSeq::new();
        emit(&mut seq, Instruction::PushNull);
        let back = seq.new_label();
        seq.place_label(back).unwrap();
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PopTop);
        seq.emit(Instruction::Jump { target: back }, SourceRange::NONE, None);
        seq.insert_front(
            &[Instruction::ReturnGenerator, Instruction::PopTop],
            SourceRange::NONE,
        );
        assert_eq!(seq.resolve_label(back).unwrap(), 3);
    }

    #[test]
    fn stack_depth_follows_the_deeper_path() {
        let mut seq = InstructionSeq::new();
        let end = seq.new_label();
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PopJumpIfFalse { target: end });
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::PopTop);
        emit(&mut seq, Instruction::PopTop);
        emit(&mut seq, Instruction::PopTop);
        seq.place_label(end).unwrap();
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::ReturnValue);
        let code = unit_with(seq).finalize_code().unwrap();
        assert_eq!(code.max_stackdepth, 3);
    }

    #[test]
    fn stack_underflow_is_an_internal_error() {
        let mut seq = InstructionSeq::new();
        emit(&mut seq, Instruction::PopTop);
        let err = unit_with(seq).finalize_code().unwrap_err();
        assert_eq!(err, InternalError::StackUnderflow);
    }

    #[test]
    fn handler_runs_coalesce_into_one_entry() {
        let mut seq = InstructionSeq::new();
        let handler = seq.new_label();
        let info = HandlerInfo {
            target: handler,
            depth: 0,
            preserve_lasti: false,
        };
        emit(&mut seq, Instruction::PushNull);
        seq.emit(Instruction::PushNull, SourceRange::NONE, Some(info));
        seq.emit(Instruction::PopTop, SourceRange::NONE, Some(info));
        emit(&mut seq, Instruction::ReturnValue);
        seq.place_label(handler).unwrap();
        emit(&mut seq, Instruction::PopTop);
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::ReturnValue);
        let code = unit_with(seq).finalize_code().unwrap();
        assert_eq!(
            code.exception_table.as_ref(),
            &[ExceptionTableEntry {
                start: 1,
                end: 3,
                target: 4,
                depth: 0,
                preserve_lasti: false
            }]
        );
    }

    #[test]
    fn unused_constants_are_dropped() {
        let mut seq = InstructionSeq::new();
        emit(&mut seq, Instruction::LoadConst { idx: 1 });
        emit(&mut seq, Instruction::ReturnValue);
        let mut unit = unit_with(seq);
        unit.metadata.consts.insert(ConstantData::None);
        unit.metadata
            .consts
            .insert(ConstantData::Boolean { value: true });
        let code = unit.finalize_code().unwrap();
        assert_eq!(code.constants.len(), 1);
        assert_eq!(code.instructions[0], Instruction::LoadConst { idx: 0 });
    }

    #[test]
    fn generator_units_get_a_creation_prologue() {
        let mut seq = InstructionSeq::new();
        seq.emit(
            Instruction::Resume {
                arg: ResumeType::AtFuncStart,
            },
            SourceRange::NONE,
            None,
        );
        emit(&mut seq, Instruction::PushNull);
        emit(&mut seq, Instruction::ReturnValue);
        let mut unit = unit_with(seq);
        unit.flags |= CodeFlags::GENERATOR;
        let code = unit.finalize_code().unwrap();
        assert_eq!(code.instructions[0], Instruction::ReturnGenerator);
        assert_eq!(code.instructions[1], Instruction::PopTop);
        assert_eq!(
            code.instructions[2],
            Instruction::Resume {
                arg: ResumeType::AtFuncStart
            }
        );
    }
}
