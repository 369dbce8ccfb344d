//! Bytecode structure for the Krait virtual machine: instructions,
//! constants, and assembled code objects.
//!
//! The numeric on-disk encoding of opcodes is deliberately unspecified;
//! code objects store the decoded instruction enum together with parallel
//! location and exception tables.

use crate::SourceRange;
use bitflags::bitflags;
use core::{fmt, hash, mem};
use num_bigint::BigInt;
use num_complex::Complex64;

pub type NameIdx = u32;

/// A jump target inside one instruction sequence.
///
/// During code generation the value is a dense per-sequence label id; the
/// assembler rewrites it to the index of the labelled instruction, so in a
/// finished [`CodeObject`] every label is an instruction offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Label(pub u32);

impl Label {
    pub const fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Whether an identity/membership test is negated (`is not`, `not in`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Invert {
    No,
    Yes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        };
        f.write_str(op)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    MatrixMultiply,
    TrueDivide,
    FloorDivide,
    Remainder,
    Power,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
    InplaceAdd,
    InplaceSubtract,
    InplaceMultiply,
    InplaceMatrixMultiply,
    InplaceTrueDivide,
    InplaceFloorDivide,
    InplaceRemainder,
    InplacePower,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,
}

impl BinaryOperator {
    /// The in-place counterpart used by augmented assignment.
    pub const fn as_inplace(self) -> Self {
        match self {
            Self::Add => Self::InplaceAdd,
            Self::Subtract => Self::InplaceSubtract,
            Self::Multiply => Self::InplaceMultiply,
            Self::MatrixMultiply => Self::InplaceMatrixMultiply,
            Self::TrueDivide => Self::InplaceTrueDivide,
            Self::FloorDivide => Self::InplaceFloorDivide,
            Self::Remainder => Self::InplaceRemainder,
            Self::Power => Self::InplacePower,
            Self::Lshift => Self::InplaceLshift,
            Self::Rshift => Self::InplaceRshift,
            Self::And => Self::InplaceAnd,
            Self::Xor => Self::InplaceXor,
            Self::Or => Self::InplaceOr,
            inplace => inplace,
        }
    }
}

/// Raise statement shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RaiseKind {
    /// `raise` with no operands: re-raise the active exception.
    BareRaise,
    /// `raise exc`
    Raise,
    /// `raise exc from cause`
    RaiseCause,
}

/// Why execution is resuming at this point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResumeType {
    AtFuncStart,
    AfterYield,
    AfterYieldFrom,
    AfterAwait,
}

/// `!s` / `!r` / `!a` conversion applied to an f-string interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConversionKind {
    Str,
    Repr,
    Ascii,
}

/// Dunder protocols loadable with a single instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialMethod {
    Enter,
    Exit,
    AEnter,
    AExit,
}

impl SpecialMethod {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Enter => "__enter__",
            Self::Exit => "__exit__",
            Self::AEnter => "__aenter__",
            Self::AExit => "__aexit__",
        }
    }
}

/// Singleton exception types the interpreter exposes without a name-table
/// lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommonConstant {
    AssertionError,
    NotImplementedError,
}

/// One-operand intrinsic calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntrinsicFunction1 {
    Print,
    ImportStar,
    StopIterationError,
    ListToTuple,
    UnaryPositive,
    TypeVar,
    ParamSpec,
    TypeVarTuple,
    SubscriptGeneric,
    TypeAlias,
}

/// Two-operand intrinsic calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntrinsicFunction2 {
    PrepReraiseStar,
    TypeVarWithBound,
    TypeVarWithConstraint,
    SetFunctionTypeParams,
    SetTypeparamDefault,
}

bitflags! {
    /// Attributes attached to a freshly made function, also the operand of
    /// `SetFunctionAttribute`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MakeFunctionFlags: u8 {
        const DEFAULTS = 0x01;
        const KW_ONLY_DEFAULTS = 0x02;
        const ANNOTATIONS = 0x04;
        const CLOSURE = 0x08;
        const TYPE_PARAMS = 0x10;
        /// PEP 649 `__annotate__` callable.
        const ANNOTATE = 0x20;
    }
}

/// Operand of `BuildSlice`: slices have either two or three components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildSliceArgCount {
    Two,
    Three,
}

impl BuildSliceArgCount {
    pub const fn count(self) -> u32 {
        match self {
            Self::Two => 2,
            Self::Three => 3,
        }
    }
}

/// Operand of `UnpackEx`: element counts before and after the starred
/// target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnpackExArgs {
    pub before: u8,
    pub after: u8,
}

impl fmt::Display for UnpackExArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.before, self.after)
    }
}

/// A single instruction. Operands are embedded as typed payloads; the
/// assembler resolves `Label` operands to instruction indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    PopTop,
    PushNull,
    Copy { index: u32 },
    Swap { index: u32 },

    LoadConst { idx: u32 },
    ReturnConst { idx: u32 },
    LoadCommonConstant { constant: CommonConstant },

    LoadName(NameIdx),
    StoreName(NameIdx),
    DeleteName(NameIdx),
    LoadGlobal(NameIdx),
    StoreGlobal(NameIdx),
    DeleteGlobal(NameIdx),
    LoadFast(NameIdx),
    StoreFast(NameIdx),
    DeleteFast(NameIdx),
    /// Push the current value of a fast local (or NULL) and clear the slot;
    /// used to stash shadowed locals around inlined comprehensions.
    LoadFastAndClear(NameIdx),
    /// Store the stashed value back; a NULL restores the unbound state.
    StoreFastMaybeNull(NameIdx),
    LoadDeref(NameIdx),
    StoreDeref(NameIdx),
    DeleteDeref(NameIdx),
    /// Load a cell object itself (for closure tuples); the index addresses
    /// the concatenated cell + free table.
    LoadClosure(NameIdx),
    MakeCell(NameIdx),
    /// Class-body load of a name that is both free and class-local: check
    /// the mapping pushed by `LoadLocals` first, fall back to the cell.
    LoadFromDictOrDeref(NameIdx),
    /// Like `LoadName` but against an explicit mapping (the class dict
    /// cell) before globals and builtins.
    LoadFromDictOrGlobals(NameIdx),
    LoadLocals,

    LoadAttr { idx: NameIdx },
    StoreAttr { idx: NameIdx },
    DeleteAttr { idx: NameIdx },
    /// Attribute load for an immediate call: pushes the method and a
    /// self-or-null slot.
    LoadMethod { idx: NameIdx },
    LoadSuperAttr { idx: NameIdx, load_method: bool },

    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,
    /// Fused `obj[a:b]` load without building a slice object.
    BinarySlice,
    /// Fused `obj[a:b] = v` store.
    StoreSlice,
    BuildSlice { argc: BuildSliceArgCount },

    BinaryOp { op: BinaryOperator },
    CompareOp { op: ComparisonOperator },
    IsOp(Invert),
    ContainsOp(Invert),
    UnaryNegative,
    UnaryInvert,
    UnaryNot,
    ToBool,
    GetLen,

    Call { nargs: u32 },
    CallKw { nargs: u32 },
    CallFunctionEx { has_kwargs: bool },
    CallIntrinsic1 { func: IntrinsicFunction1 },
    CallIntrinsic2 { func: IntrinsicFunction2 },

    Jump { target: Label },
    PopJumpIfFalse { target: Label },
    PopJumpIfTrue { target: Label },
    ForIter { target: Label },
    EndFor,
    Send { target: Label },

    PushExcInfo,
    PopExcept,
    CheckExcMatch,
    CheckEgMatch,
    Reraise { depth: u32 },
    RaiseVarargs { kind: RaiseKind },
    WithExceptStart,
    CleanupThrow,
    EndAsyncFor,
    EndSend,

    MatchSequence,
    MatchMapping,
    MatchKeys,
    MatchClass { nargs: u32 },

    Resume { arg: ResumeType },
    YieldValue { in_yield_from: bool },
    ReturnValue,
    ReturnGenerator,
    GetAwaitable,
    GetYieldFromIter,
    GetIter,
    GetAIter,
    GetANext,

    BuildTuple { size: u32 },
    BuildList { size: u32 },
    BuildSet { size: u32 },
    BuildMap { size: u32 },
    BuildString { size: u32 },
    ListAppend { i: u32 },
    ListExtend { i: u32 },
    SetAdd { i: u32 },
    SetUpdate { i: u32 },
    MapAdd { i: u32 },
    DictUpdate { i: u32 },
    DictMerge { i: u32 },
    UnpackSequence { size: u32 },
    UnpackEx { args: UnpackExArgs },

    MakeFunction,
    SetFunctionAttribute { attr: MakeFunctionFlags },

    FormatSimple,
    FormatWithSpec,
    ConvertValue { conversion: ConversionKind },

    LoadSpecial { method: SpecialMethod },
    LoadBuildClass,

    ImportName { idx: NameIdx },
    ImportFrom { idx: NameIdx },
}

impl Instruction {
    /// The label operand, if this instruction can jump.
    pub const fn label_arg(&self) -> Option<Label> {
        match self {
            Self::Jump { target }
            | Self::PopJumpIfFalse { target }
            | Self::PopJumpIfTrue { target }
            | Self::ForIter { target }
            | Self::Send { target } => Some(*target),
            _ => None,
        }
    }

    pub fn label_arg_mut(&mut self) -> Option<&mut Label> {
        match self {
            Self::Jump { target }
            | Self::PopJumpIfFalse { target }
            | Self::PopJumpIfTrue { target }
            | Self::ForIter { target }
            | Self::Send { target } => Some(target),
            _ => None,
        }
    }

    pub const fn is_unconditional_jump(&self) -> bool {
        matches!(self, Self::Jump { .. })
    }

    /// True if control never falls through to the next instruction.
    pub const fn is_scope_exit(&self) -> bool {
        matches!(
            self,
            Self::ReturnValue
                | Self::ReturnConst { .. }
                | Self::RaiseVarargs { .. }
                | Self::Reraise { .. }
        )
    }

    /// Net change to the value stack. Peeking instructions report only the
    /// values they push.
    pub fn stack_effect(&self) -> i32 {
        let (pushed, popped): (i32, i32) = match *self {
            Self::Nop | Self::Resume { .. } | Self::MakeCell(_) => (0, 0),
            Self::PopTop => (0, 1),
            Self::PushNull => (1, 0),
            Self::Copy { .. } => (1, 0),
            Self::Swap { .. } => (0, 0),

            Self::LoadConst { .. } | Self::LoadCommonConstant { .. } => (1, 0),
            Self::ReturnConst { .. } => (0, 0),

            Self::LoadName(_)
            | Self::LoadGlobal(_)
            | Self::LoadFast(_)
            | Self::LoadFastAndClear(_)
            | Self::LoadDeref(_)
            | Self::LoadClosure(_)
            | Self::LoadLocals => (1, 0),
            Self::StoreName(_)
            | Self::StoreGlobal(_)
            | Self::StoreFast(_)
            | Self::StoreFastMaybeNull(_)
            | Self::StoreDeref(_) => (0, 1),
            Self::DeleteName(_)
            | Self::DeleteGlobal(_)
            | Self::DeleteFast(_)
            | Self::DeleteDeref(_) => (0, 0),
            Self::LoadFromDictOrDeref(_) | Self::LoadFromDictOrGlobals(_) => (1, 1),

            Self::LoadAttr { .. } => (1, 1),
            Self::LoadMethod { .. } => (2, 1),
            Self::LoadSuperAttr { load_method, .. } => {
                (if load_method { 2 } else { 1 }, 3)
            }
            Self::StoreAttr { .. } => (0, 2),
            Self::DeleteAttr { .. } => (0, 1),

            Self::BinarySubscr => (1, 2),
            Self::StoreSubscr => (0, 3),
            Self::DeleteSubscr => (0, 2),
            Self::BinarySlice => (1, 3),
            Self::StoreSlice => (0, 4),
            Self::BuildSlice { argc } => (1, argc.count() as i32),

            Self::BinaryOp { .. }
            | Self::CompareOp { .. }
            | Self::IsOp(_)
            | Self::ContainsOp(_) => (1, 2),
            Self::UnaryNegative | Self::UnaryInvert | Self::UnaryNot | Self::ToBool => {
                (1, 1)
            }
            Self::GetLen => (2, 1),

            Self::Call { nargs } => (1, 2 + nargs as i32),
            Self::CallKw { nargs } => (1, 3 + nargs as i32),
            Self::CallFunctionEx { has_kwargs } => (1, 3 + has_kwargs as i32),
            Self::CallIntrinsic1 { .. } => (1, 1),
            Self::CallIntrinsic2 { .. } => (1, 2),

            Self::Jump { .. } => (0, 0),
            Self::PopJumpIfFalse { .. } | Self::PopJumpIfTrue { .. } => (0, 1),
            Self::ForIter { .. } => (2, 1),
            Self::EndFor => (0, 1),
            Self::Send { .. } => (2, 2),

            Self::PushExcInfo => (2, 1),
            Self::PopExcept => (0, 1),
            Self::CheckExcMatch => (2, 2),
            Self::CheckEgMatch => (2, 2),
            Self::Reraise { depth } => (depth as i32, 1 + depth as i32),
            Self::RaiseVarargs { kind } => (
                0,
                match kind {
                    RaiseKind::BareRaise => 0,
                    RaiseKind::Raise => 1,
                    RaiseKind::RaiseCause => 2,
                },
            ),
            Self::WithExceptStart => (1, 0),
            Self::CleanupThrow => (2, 3),
            Self::EndAsyncFor => (0, 2),
            Self::EndSend => (1, 2),

            Self::MatchSequence | Self::MatchMapping => (2, 1),
            Self::MatchKeys => (3, 2),
            Self::MatchClass { .. } => (1, 3),

            Self::YieldValue { .. } => (1, 1),
            Self::ReturnValue => (0, 1),
            Self::ReturnGenerator => (1, 0),
            Self::GetAwaitable
            | Self::GetYieldFromIter
            | Self::GetIter
            | Self::GetAIter => (1, 1),
            Self::GetANext => (2, 1),

            Self::BuildTuple { size }
            | Self::BuildList { size }
            | Self::BuildSet { size }
            | Self::BuildString { size } => (1, size as i32),
            Self::BuildMap { size } => (1, 2 * size as i32),
            Self::ListAppend { .. }
            | Self::ListExtend { .. }
            | Self::SetAdd { .. }
            | Self::SetUpdate { .. }
            | Self::DictUpdate { .. }
            | Self::DictMerge { .. } => (0, 1),
            Self::MapAdd { .. } => (0, 2),
            Self::UnpackSequence { size } => (size as i32, 1),
            Self::UnpackEx { args } => {
                (1 + args.before as i32 + args.after as i32, 1)
            }

            Self::MakeFunction => (1, 1),
            Self::SetFunctionAttribute { .. } => (1, 2),

            Self::FormatSimple => (1, 1),
            Self::FormatWithSpec => (1, 2),
            Self::ConvertValue { .. } => (1, 1),

            Self::LoadSpecial { .. } => (1, 1),
            Self::LoadBuildClass => (1, 0),

            Self::ImportName { .. } => (1, 2),
            Self::ImportFrom { .. } => (2, 1),
        };
        pushed - popped
    }
}

/// A compile-time constant. Structural equality deduplicates constants in
/// the cache: floats compare by bit pattern (so `0.0` and `-0.0` stay
/// distinct), and the variant tag keeps `True` apart from `1` and `1`
/// apart from `1.0`.
#[derive(Clone, Debug)]
pub enum ConstantData {
    None,
    Ellipsis,
    Boolean { value: bool },
    Integer { value: BigInt },
    Float { value: f64 },
    Complex { value: Complex64 },
    Str { value: String },
    Bytes { value: Vec<u8> },
    Tuple { elements: Vec<ConstantData> },
    FrozenSet { elements: Vec<ConstantData> },
    Code { code: Box<CodeObject> },
}

impl PartialEq for ConstantData {
    fn eq(&self, other: &Self) -> bool {
        use ConstantData::*;
        match (self, other) {
            (None, None) => true,
            (Ellipsis, Ellipsis) => true,
            (Boolean { value: a }, Boolean { value: b }) => a == b,
            (Integer { value: a }, Integer { value: b }) => a == b,
            (Float { value: a }, Float { value: b }) => a.to_bits() == b.to_bits(),
            (Complex { value: a }, Complex { value: b }) => {
                a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits()
            }
            (Str { value: a }, Str { value: b }) => a == b,
            (Bytes { value: a }, Bytes { value: b }) => a == b,
            (Tuple { elements: a }, Tuple { elements: b }) => a == b,
            (FrozenSet { elements: a }, FrozenSet { elements: b }) => a == b,
            // code objects are never merged
            (Code { code: a }, Code { code: b }) => core::ptr::eq(a.as_ref(), b.as_ref()),
            _ => false,
        }
    }
}

impl Eq for ConstantData {}

impl hash::Hash for ConstantData {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        use ConstantData::*;
        mem::discriminant(self).hash(state);
        match self {
            None | Ellipsis => {}
            Boolean { value } => value.hash(state),
            Integer { value } => value.hash(state),
            Float { value } => value.to_bits().hash(state),
            Complex { value } => {
                value.re.to_bits().hash(state);
                value.im.to_bits().hash(state);
            }
            Str { value } => value.hash(state),
            Bytes { value } => value.hash(state),
            Tuple { elements } | FrozenSet { elements } => elements.hash(state),
            Code { code } => core::ptr::hash(code.as_ref(), state),
        }
    }
}

impl fmt::Display for ConstantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Ellipsis => write!(f, "..."),
            Self::Boolean { value } => {
                write!(f, "{}", if *value { "True" } else { "False" })
            }
            Self::Integer { value } => write!(f, "{value}"),
            Self::Float { value } => write!(f, "{value:?}"),
            Self::Complex { value } => write!(f, "{value}"),
            Self::Str { value } => write!(f, "{value:?}"),
            Self::Bytes { value } => write!(f, "b\"{}\"", value.escape_ascii()),
            Self::Tuple { elements } => {
                write!(f, "(")?;
                for (i, elt) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elt}")?;
                }
                if elements.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::FrozenSet { elements } => {
                write!(f, "frozenset({{")?;
                for (i, elt) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elt}")?;
                }
                write!(f, "}})")
            }
            Self::Code { code } => write!(f, "<code object {}>", code.obj_name),
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct CodeFlags: u16 {
        const OPTIMIZED = 0x0001;
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const NESTED = 0x0010;
        const GENERATOR = 0x0020;
        const COROUTINE = 0x0080;
        const ASYNC_GENERATOR = 0x0200;
    }
}

impl CodeFlags {
    /// Flags a nested code object may inherit from its compile invocation.
    pub const INHERITABLE: Self = Self::COROUTINE;
}

/// One contiguous region of instructions covered by an exception handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    /// First covered instruction index (inclusive).
    pub start: u32,
    /// Past-the-end instruction index (exclusive).
    pub end: u32,
    /// Handler entry point (instruction index).
    pub target: u32,
    /// Value-stack depth to unwind to before pushing the exception.
    pub depth: u32,
    /// Whether the resume offset is pushed below the exception.
    pub preserve_lasti: bool,
}

/// The finished output of compiling one scope.
#[derive(Clone)]
pub struct CodeObject {
    pub instructions: Box<[Instruction]>,
    /// Parallel to `instructions`; the line table.
    pub locations: Box<[SourceRange]>,
    pub exception_table: Box<[ExceptionTableEntry]>,
    pub flags: CodeFlags,
    pub posonlyarg_count: u32,
    pub arg_count: u32,
    pub kwonlyarg_count: u32,
    pub source_path: String,
    pub first_line_number: u32,
    pub max_stackdepth: u32,
    pub obj_name: String,
    pub qualname: String,
    pub constants: Box<[ConstantData]>,
    pub names: Box<[String]>,
    pub varnames: Box<[String]>,
    pub cellvars: Box<[String]>,
    pub freevars: Box<[String]>,
    /// For each cell variable, the argument slot it shadows, or -1.
    pub cell2arg: Option<Box<[i32]>>,
}

impl CodeObject {
    /// Iterate the code objects stored in this one's constant pool.
    pub fn nested_code_objects(&self) -> impl Iterator<Item = &CodeObject> {
        self.constants.iter().filter_map(|c| match c {
            ConstantData::Code { code } => Some(code.as_ref()),
            _ => None,
        })
    }

    /// Line-oriented disassembly used by tests and debugging.
    pub fn display(&self, expand_code_objects: bool) -> impl fmt::Display + '_ {
        struct Dis<'a>(&'a CodeObject, bool);
        impl fmt::Display for Dis<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt_dis(f, self.1, 0)
            }
        }
        Dis(self, expand_code_objects)
    }

    fn fmt_dis(&self, f: &mut fmt::Formatter<'_>, expand: bool, level: usize) -> fmt::Result {
        let indent = "  ".repeat(level);
        writeln!(
            f,
            "{indent}Disassembly of {} ({}):",
            self.obj_name, self.qualname
        )?;
        let mut last_row = u32::MAX;
        for (offset, instr) in self.instructions.iter().enumerate() {
            let loc = self.locations[offset];
            let row = loc.first_row();
            if row != last_row && !loc.is_none() {
                last_row = row;
                write!(f, "{indent}{row:>4} ")?;
            } else {
                write!(f, "{indent}     ")?;
            }
            writeln!(f, "{offset:>5} {}", self.fmt_instruction(instr))?;
        }
        if expand {
            for code in self.nested_code_objects() {
                code.fmt_dis(f, expand, level + 1)?;
            }
        }
        Ok(())
    }

    fn fmt_instruction(&self, instr: &Instruction) -> String {
        use Instruction::*;
        let name = |i: NameIdx| self.names.get(i as usize).map_or("?", |s| s.as_str());
        let varname = |i: NameIdx| self.varnames.get(i as usize).map_or("?", |s| s.as_str());
        let cellname = |i: NameIdx| {
            let i = i as usize;
            self.cellvars
                .get(i)
                .or_else(|| self.freevars.get(i.wrapping_sub(self.cellvars.len())))
                .map_or("?", |s| s.as_str())
        };
        match *instr {
            LoadConst { idx } => format!("LOAD_CONST ({})", self.constants[idx as usize]),
            ReturnConst { idx } => {
                format!("RETURN_CONST ({})", self.constants[idx as usize])
            }
            LoadName(i) => format!("LOAD_NAME ({})", name(i)),
            StoreName(i) => format!("STORE_NAME ({})", name(i)),
            DeleteName(i) => format!("DELETE_NAME ({})", name(i)),
            LoadGlobal(i) => format!("LOAD_GLOBAL ({})", name(i)),
            StoreGlobal(i) => format!("STORE_GLOBAL ({})", name(i)),
            DeleteGlobal(i) => format!("DELETE_GLOBAL ({})", name(i)),
            LoadFast(i) => format!("LOAD_FAST ({})", varname(i)),
            StoreFast(i) => format!("STORE_FAST ({})", varname(i)),
            DeleteFast(i) => format!("DELETE_FAST ({})", varname(i)),
            LoadFastAndClear(i) => format!("LOAD_FAST_AND_CLEAR ({})", varname(i)),
            StoreFastMaybeNull(i) => format!("STORE_FAST_MAYBE_NULL ({})", varname(i)),
            LoadDeref(i) => format!("LOAD_DEREF ({})", cellname(i)),
            StoreDeref(i) => format!("STORE_DEREF ({})", cellname(i)),
            DeleteDeref(i) => format!("DELETE_DEREF ({})", cellname(i)),
            LoadClosure(i) => format!("LOAD_CLOSURE ({})", cellname(i)),
            MakeCell(i) => format!("MAKE_CELL ({})", cellname(i)),
            LoadFromDictOrDeref(i) => format!("LOAD_FROM_DICT_OR_DEREF ({})", cellname(i)),
            LoadFromDictOrGlobals(i) => {
                format!("LOAD_FROM_DICT_OR_GLOBALS ({})", name(i))
            }
            LoadAttr { idx } => format!("LOAD_ATTR ({})", name(idx)),
            StoreAttr { idx } => format!("STORE_ATTR ({})", name(idx)),
            DeleteAttr { idx } => format!("DELETE_ATTR ({})", name(idx)),
            LoadMethod { idx } => format!("LOAD_METHOD ({})", name(idx)),
            LoadSuperAttr { idx, load_method } => {
                format!("LOAD_SUPER_ATTR ({}, method={load_method})", name(idx))
            }
            ImportName { idx } => format!("IMPORT_NAME ({})", name(idx)),
            ImportFrom { idx } => format!("IMPORT_FROM ({})", name(idx)),
            ref other => {
                // mechanical SCREAMING_SNAKE rendering of the variant name
                let dbg = format!("{other:?}");
                let head_end = dbg
                    .find(|c: char| c == ' ' || c == '(')
                    .unwrap_or(dbg.len());
                let (head, tail) = dbg.split_at(head_end);
                let mut out = String::with_capacity(dbg.len() + 8);
                for (i, ch) in head.char_indices() {
                    if ch.is_ascii_uppercase() && i > 0 {
                        out.push('_');
                    }
                    out.push(ch.to_ascii_uppercase());
                }
                if !tail.is_empty() {
                    out.push(' ');
                    out.push_str(tail.trim_start());
                }
                out
            }
        }
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at {:?} file {:?}, line {}>",
            self.obj_name, self.qualname, self.source_path, self.first_line_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_type_tags_do_not_collide() {
        let one = ConstantData::Integer {
            value: BigInt::from(1),
        };
        let tru = ConstantData::Boolean { value: true };
        let onef = ConstantData::Float { value: 1.0 };
        assert_ne!(one, tru);
        assert_ne!(one, onef);
        assert_ne!(tru, onef);
    }

    #[test]
    fn negative_zero_is_a_distinct_float_constant() {
        let pz = ConstantData::Float { value: 0.0 };
        let nz = ConstantData::Float { value: -0.0 };
        assert_ne!(pz, nz);
    }

    #[test]
    fn tuples_compare_recursively() {
        let nested = || ConstantData::Tuple {
            elements: vec![
                ConstantData::Integer {
                    value: BigInt::from(1),
                },
                ConstantData::Tuple {
                    elements: vec![ConstantData::Str {
                        value: "x".to_owned(),
                    }],
                },
            ],
        };
        assert_eq!(nested(), nested());
    }

    #[test]
    fn stack_effects() {
        assert_eq!(Instruction::PopTop.stack_effect(), -1);
        assert_eq!(Instruction::Call { nargs: 2 }.stack_effect(), -3);
        assert_eq!(Instruction::BuildMap { size: 2 }.stack_effect(), -3);
        assert_eq!(
            Instruction::UnpackEx {
                args: UnpackExArgs { before: 1, after: 2 }
            }
            .stack_effect(),
            3
        );
        assert_eq!(Instruction::Copy { index: 3 }.stack_effect(), 1);
        assert_eq!(Instruction::Swap { index: 2 }.stack_effect(), 0);
    }

    #[test]
    fn inplace_operator_mapping() {
        assert_eq!(BinaryOperator::Add.as_inplace(), BinaryOperator::InplaceAdd);
        assert_eq!(
            BinaryOperator::InplaceAdd.as_inplace(),
            BinaryOperator::InplaceAdd
        );
    }
}
