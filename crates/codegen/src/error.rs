use krait_compiler_core::SourceRange;
use std::fmt::{self, Display};
use thiserror::Error;

#[derive(Debug, PartialEq, Eq)]
pub enum PatternUnreachableReason {
    NameCapture,
    Wildcard,
}

impl Display for PatternUnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameCapture => write!(f, "name capture"),
            Self::Wildcard => write!(f, "wildcard"),
        }
    }
}

/// A user-visible compile failure: the kind, the offending range, and the
/// file it came from. The compiler never reads source text, so no source
/// line excerpt is attached.
#[derive(Error, Debug)]
pub struct CodegenError {
    pub location: Option<SourceRange>,
    #[source]
    pub error: CodegenErrorType,
    pub source_path: String,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) if !loc.is_none() => {
                write!(f, "{}:{}: {}", self.source_path, loc.start, self.error)
            }
            _ => write!(f, "{}: {}", self.source_path, self.error),
        }
    }
}

/// Invariant violations inside the code generator itself. These indicate a
/// bug, not a malformed program.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum InternalError {
    StackOverflow,
    StackUnderflow,
    MissingSymbol(String),
    UnplacedLabel(u32),
    LabelAlreadyPlaced(u32),
    MissingSymbolTable,
    UnknownScope(String),
}

impl Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::StackUnderflow => write!(f, "stack underflow"),
            Self::MissingSymbol(s) => write!(
                f,
                "the symbol '{s}' must be present in the symbol table, even when it is undefined"
            ),
            Self::UnplacedLabel(l) => {
                write!(f, "jump references label L{l} that was never placed")
            }
            Self::LabelAlreadyPlaced(l) => write!(f, "label L{l} placed twice"),
            Self::MissingSymbolTable => write!(f, "no symbol table entry for scope"),
            Self::UnknownScope(s) => write!(f, "unknown scope for name '{s}'"),
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum CodegenErrorType {
    /// Invalid assignment, cannot store value in target.
    Assign(&'static str),
    /// Invalid delete
    Delete(&'static str),
    SyntaxError(String),
    /// Multiple `*` detected
    MultipleStarArgs,
    /// Misplaced `*` expression
    InvalidStarExpr,
    /// Break statement outside of loop.
    InvalidBreak,
    /// Continue statement outside of loop.
    InvalidContinue,
    InvalidReturn,
    InvalidYield,
    InvalidYieldFrom,
    InvalidAwait,
    AsyncYieldFrom,
    AsyncReturnValue,
    InvalidAsyncFor,
    InvalidAsyncWith,
    InvalidAsyncComprehension,
    InvalidFuturePlacement,
    InvalidFutureFeature(String),
    FunctionImportStar,
    TooManyStarUnpack,
    TooManyBlocks,
    EmptyWithItems,
    EmptyWithBody,
    ForbiddenName(String),
    DuplicateStore(String),
    DuplicateKeywordArgument(String),
    UnreachablePattern(PatternUnreachableReason),
    RepeatedAttributePattern,
    ConflictingNameBindPattern,
    MappingPatternNonLiteralKey,
    MappingPatternDuplicateKey(String),
    MappingPatternForbiddenRest,
    TooManySubPatterns,
    BreakContinueReturnInExceptStar,
    NonDefaultTypeParamAfterDefault(String),
    /// A warning promoted to an error by configuration.
    PromotedWarning(CodegenWarning),
    /// Code-generator invariant failure (a bug, not a user error).
    Internal(InternalError),
}

impl From<InternalError> for CodegenErrorType {
    fn from(err: InternalError) -> Self {
        Self::Internal(err)
    }
}

impl std::error::Error for CodegenErrorType {}

impl fmt::Display for CodegenErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CodegenErrorType::*;
        match self {
            Assign(target) => write!(f, "cannot assign to {target}"),
            Delete(target) => write!(f, "cannot delete {target}"),
            SyntaxError(err) => write!(f, "{}", err.as_str()),
            MultipleStarArgs => {
                write!(f, "two starred expressions in assignment")
            }
            InvalidStarExpr => write!(f, "cannot use starred expression here"),
            InvalidBreak => write!(f, "'break' outside loop"),
            InvalidContinue => write!(f, "'continue' outside loop"),
            InvalidReturn => write!(f, "'return' outside function"),
            InvalidYield => write!(f, "'yield' outside function"),
            InvalidYieldFrom => write!(f, "'yield from' outside function"),
            InvalidAwait => write!(f, "'await' outside async function"),
            AsyncYieldFrom => write!(f, "'yield from' inside async function"),
            AsyncReturnValue => {
                write!(f, "'return' with value inside async generator")
            }
            InvalidAsyncFor => write!(f, "'async for' outside async function"),
            InvalidAsyncWith => write!(f, "'async with' outside async function"),
            InvalidAsyncComprehension => {
                write!(f, "asynchronous comprehension outside of an asynchronous function")
            }
            InvalidFuturePlacement => write!(
                f,
                "from __future__ imports must occur at the beginning of the file"
            ),
            InvalidFutureFeature(feat) => {
                write!(f, "future feature {feat} is not defined")
            }
            FunctionImportStar => {
                write!(f, "import * only allowed at module level")
            }
            TooManyStarUnpack => {
                write!(f, "too many expressions in star-unpacking assignment")
            }
            TooManyBlocks => write!(f, "too many statically nested blocks"),
            EmptyWithItems => write!(f, "empty items on with statement"),
            EmptyWithBody => write!(f, "empty body on with statement"),
            ForbiddenName(name) => write!(f, "cannot assign to {name}"),
            DuplicateStore(s) => write!(f, "multiple assignments to name '{s}' in pattern"),
            DuplicateKeywordArgument(s) => {
                write!(f, "keyword argument repeated: {s}")
            }
            UnreachablePattern(reason) => {
                write!(f, "{reason} makes remaining patterns unreachable")
            }
            RepeatedAttributePattern => {
                write!(f, "attribute name repeated in class pattern")
            }
            ConflictingNameBindPattern => {
                write!(f, "alternative patterns bind different names")
            }
            MappingPatternNonLiteralKey => write!(
                f,
                "mapping pattern keys may only match literals and attribute lookups"
            ),
            MappingPatternDuplicateKey(key) => {
                write!(f, "mapping pattern checks duplicate key ({key})")
            }
            MappingPatternForbiddenRest => {
                write!(f, "cannot use '_' as a target in a mapping pattern")
            }
            TooManySubPatterns => {
                write!(f, "too many sub-patterns in class pattern")
            }
            BreakContinueReturnInExceptStar => write!(
                f,
                "'break', 'continue' and 'return' cannot appear in an except* block"
            ),
            NonDefaultTypeParamAfterDefault(name) => write!(
                f,
                "non-default type parameter '{name}' follows default type parameter"
            ),
            PromotedWarning(warning) => warning.fmt(f),
            Internal(err) => write!(f, "internal compiler error: {err}"),
        }
    }
}

/// Suspicious-but-legal constructs. By default these are logged; the
/// `warnings_as_errors` option converts them in place to a syntax error
/// carrying the same location.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodegenWarning {
    /// `x is "literal"` style identity comparison.
    IsWithLiteral { kind: &'static str },
    /// A literal that can never be callable is called.
    NotCallable { kind: &'static str },
    /// A literal that can never be subscripted is subscripted.
    NotSubscriptable { kind: &'static str },
    /// Indexing a sequence literal with a non-integer literal.
    BadIndexType { container: &'static str, index: &'static str },
    /// `assert (a, b)` is always true.
    AssertOnTuple,
}

impl Display for CodegenWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsWithLiteral { kind } => write!(
                f,
                "\"is\" with '{kind}' literal. Did you mean \"==\"?"
            ),
            Self::NotCallable { kind } => {
                write!(f, "'{kind}' object is not callable; perhaps you missed a comma?")
            }
            Self::NotSubscriptable { kind } => {
                write!(f, "'{kind}' object is not subscriptable; perhaps you missed a comma?")
            }
            Self::BadIndexType { container, index } => write!(
                f,
                "'{container}' indices must be integers or slices, not '{index}'; perhaps you missed a comma?"
            ),
            Self::AssertOnTuple => write!(
                f,
                "assertion is always true, perhaps remove parentheses?"
            ),
        }
    }
}
