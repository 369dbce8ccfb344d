//! The abstract syntax tree the Krait code generator consumes.
//!
//! The tree arrives already parsed and validated; this crate only defines
//! the node types and a few structural helpers. Every node carries the
//! [`SourceRange`] it was parsed from. `elif` chains are represented as a
//! nested `If` statement in `orelse`.

use krait_compiler_core::SourceRange;
use num_bigint::BigInt;

/// An identifier together with its source range.
#[derive(Clone, Debug, PartialEq)]
pub struct Identifier {
    pub id: String,
    pub range: SourceRange,
}

impl Identifier {
    pub fn new(id: impl Into<String>, range: SourceRange) -> Self {
        Self { id: id.into(), range }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// How an expression is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExprContext {
    Load,
    Store,
    Del,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Invert,
    Not,
    UAdd,
    USub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Singleton {
    None,
    True,
    False,
}

/// `!s` / `!r` / `!a` conversion on an f-string interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionFlag {
    None,
    Str,
    Repr,
    Ascii,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Number {
    Int(BigInt),
    Float(f64),
    Complex { real: f64, imag: f64 },
}

// ------------------------------------------------------------------ roots

#[derive(Clone, Debug, PartialEq)]
pub enum Mod {
    Module(ModModule),
    Interactive(ModInteractive),
    Expression(ModExpression),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModModule {
    pub body: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModInteractive {
    pub body: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModExpression {
    pub body: Box<Expr>,
    pub range: SourceRange,
}

// ------------------------------------------------------------- statements

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    FunctionDef(StmtFunctionDef),
    ClassDef(StmtClassDef),
    Return(StmtReturn),
    Delete(StmtDelete),
    Assign(StmtAssign),
    AugAssign(StmtAugAssign),
    AnnAssign(StmtAnnAssign),
    TypeAlias(StmtTypeAlias),
    For(StmtFor),
    While(StmtWhile),
    If(StmtIf),
    With(StmtWith),
    Match(StmtMatch),
    Raise(StmtRaise),
    Try(StmtTry),
    Assert(StmtAssert),
    Import(StmtImport),
    ImportFrom(StmtImportFrom),
    Global(StmtGlobal),
    Nonlocal(StmtNonlocal),
    Expr(StmtExpr),
    Pass(StmtPass),
    Break(StmtBreak),
    Continue(StmtContinue),
}

impl Stmt {
    pub fn range(&self) -> SourceRange {
        match self {
            Self::FunctionDef(s) => s.range,
            Self::ClassDef(s) => s.range,
            Self::Return(s) => s.range,
            Self::Delete(s) => s.range,
            Self::Assign(s) => s.range,
            Self::AugAssign(s) => s.range,
            Self::AnnAssign(s) => s.range,
            Self::TypeAlias(s) => s.range,
            Self::For(s) => s.range,
            Self::While(s) => s.range,
            Self::If(s) => s.range,
            Self::With(s) => s.range,
            Self::Match(s) => s.range,
            Self::Raise(s) => s.range,
            Self::Try(s) => s.range,
            Self::Assert(s) => s.range,
            Self::Import(s) => s.range,
            Self::ImportFrom(s) => s.range,
            Self::Global(s) => s.range,
            Self::Nonlocal(s) => s.range,
            Self::Expr(s) => s.range,
            Self::Pass(s) => s.range,
            Self::Break(s) => s.range,
            Self::Continue(s) => s.range,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtFunctionDef {
    pub is_async: bool,
    pub name: Identifier,
    pub type_params: Option<Box<TypeParams>>,
    pub parameters: Box<Parameters>,
    pub returns: Option<Box<Expr>>,
    pub body: Vec<Stmt>,
    pub decorator_list: Vec<Decorator>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtClassDef {
    pub name: Identifier,
    pub type_params: Option<Box<TypeParams>>,
    pub arguments: Option<Box<Arguments>>,
    pub body: Vec<Stmt>,
    pub decorator_list: Vec<Decorator>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtReturn {
    pub value: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtDelete {
    pub targets: Vec<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtAssign {
    pub targets: Vec<Expr>,
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtAugAssign {
    pub target: Box<Expr>,
    pub op: Operator,
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtAnnAssign {
    pub target: Box<Expr>,
    pub annotation: Box<Expr>,
    pub value: Option<Box<Expr>>,
    /// True when the target is a plain name not in parentheses.
    pub simple: bool,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtTypeAlias {
    pub name: Box<Expr>,
    pub type_params: Option<Box<TypeParams>>,
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtFor {
    pub is_async: bool,
    pub target: Box<Expr>,
    pub iter: Box<Expr>,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtWhile {
    pub test: Box<Expr>,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtIf {
    pub test: Box<Expr>,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtWith {
    pub is_async: bool,
    pub items: Vec<WithItem>,
    pub body: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtMatch {
    pub subject: Box<Expr>,
    pub cases: Vec<MatchCase>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtRaise {
    pub exc: Option<Box<Expr>>,
    pub cause: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtTry {
    pub body: Vec<Stmt>,
    pub handlers: Vec<ExceptHandler>,
    pub orelse: Vec<Stmt>,
    pub finalbody: Vec<Stmt>,
    /// True for `try`/`except*`.
    pub is_star: bool,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtAssert {
    pub test: Box<Expr>,
    pub msg: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtImport {
    pub names: Vec<Alias>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtImportFrom {
    pub module: Option<Identifier>,
    pub names: Vec<Alias>,
    /// Number of leading dots in a relative import.
    pub level: u32,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtGlobal {
    pub names: Vec<Identifier>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtNonlocal {
    pub names: Vec<Identifier>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtExpr {
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtPass {
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtBreak {
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StmtContinue {
    pub range: SourceRange,
}

// ------------------------------------------------------------ expressions

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    BoolOp(ExprBoolOp),
    Named(ExprNamed),
    BinOp(ExprBinOp),
    UnaryOp(ExprUnaryOp),
    Lambda(ExprLambda),
    If(ExprIf),
    Dict(ExprDict),
    Set(ExprSet),
    ListComp(ExprListComp),
    SetComp(ExprSetComp),
    DictComp(ExprDictComp),
    Generator(ExprGenerator),
    Await(ExprAwait),
    Yield(ExprYield),
    YieldFrom(ExprYieldFrom),
    Compare(ExprCompare),
    Call(ExprCall),
    FString(ExprFString),
    StringLiteral(ExprStringLiteral),
    BytesLiteral(ExprBytesLiteral),
    NumberLiteral(ExprNumberLiteral),
    BooleanLiteral(ExprBooleanLiteral),
    NoneLiteral(ExprNoneLiteral),
    EllipsisLiteral(ExprEllipsisLiteral),
    Attribute(ExprAttribute),
    Subscript(ExprSubscript),
    Starred(ExprStarred),
    Name(ExprName),
    List(ExprList),
    Tuple(ExprTuple),
    Slice(ExprSlice),
}

impl Expr {
    pub fn range(&self) -> SourceRange {
        match self {
            Self::BoolOp(e) => e.range,
            Self::Named(e) => e.range,
            Self::BinOp(e) => e.range,
            Self::UnaryOp(e) => e.range,
            Self::Lambda(e) => e.range,
            Self::If(e) => e.range,
            Self::Dict(e) => e.range,
            Self::Set(e) => e.range,
            Self::ListComp(e) => e.range,
            Self::SetComp(e) => e.range,
            Self::DictComp(e) => e.range,
            Self::Generator(e) => e.range,
            Self::Await(e) => e.range,
            Self::Yield(e) => e.range,
            Self::YieldFrom(e) => e.range,
            Self::Compare(e) => e.range,
            Self::Call(e) => e.range,
            Self::FString(e) => e.range,
            Self::StringLiteral(e) => e.range,
            Self::BytesLiteral(e) => e.range,
            Self::NumberLiteral(e) => e.range,
            Self::BooleanLiteral(e) => e.range,
            Self::NoneLiteral(e) => e.range,
            Self::EllipsisLiteral(e) => e.range,
            Self::Attribute(e) => e.range,
            Self::Subscript(e) => e.range,
            Self::Starred(e) => e.range,
            Self::Name(e) => e.range,
            Self::List(e) => e.range,
            Self::Tuple(e) => e.range,
            Self::Slice(e) => e.range,
        }
    }

    pub fn as_name_expr(&self) -> Option<&ExprName> {
        match self {
            Self::Name(name) => Some(name),
            _ => None,
        }
    }

    pub const fn is_tuple_expr(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    pub const fn is_starred_expr(&self) -> bool {
        matches!(self, Self::Starred(_))
    }

    /// True for expressions whose value is known at compile time.
    pub const fn is_literal(&self) -> bool {
        matches!(
            self,
            Self::StringLiteral(_)
                | Self::BytesLiteral(_)
                | Self::NumberLiteral(_)
                | Self::BooleanLiteral(_)
                | Self::NoneLiteral(_)
                | Self::EllipsisLiteral(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprBoolOp {
    pub op: BoolOp,
    pub values: Vec<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprNamed {
    pub target: Box<Expr>,
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprBinOp {
    pub left: Box<Expr>,
    pub op: Operator,
    pub right: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprUnaryOp {
    pub op: UnaryOp,
    pub operand: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprLambda {
    pub parameters: Option<Box<Parameters>>,
    pub body: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprIf {
    pub test: Box<Expr>,
    pub body: Box<Expr>,
    pub orelse: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DictItem {
    /// `None` for a `**mapping` spread.
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprDict {
    pub items: Vec<DictItem>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprSet {
    pub elts: Vec<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprListComp {
    pub elt: Box<Expr>,
    pub generators: Vec<Comprehension>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprSetComp {
    pub elt: Box<Expr>,
    pub generators: Vec<Comprehension>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprDictComp {
    pub key: Box<Expr>,
    pub value: Box<Expr>,
    pub generators: Vec<Comprehension>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprGenerator {
    pub elt: Box<Expr>,
    pub generators: Vec<Comprehension>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprAwait {
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprYield {
    pub value: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprYieldFrom {
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprCompare {
    pub left: Box<Expr>,
    pub ops: Vec<CmpOp>,
    pub comparators: Vec<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprCall {
    pub func: Box<Expr>,
    pub arguments: Arguments,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprFString {
    pub elements: Vec<FStringElement>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FStringElement {
    Literal(FStringLiteralElement),
    Interpolation(FStringInterpolationElement),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FStringLiteralElement {
    pub value: String,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FStringInterpolationElement {
    pub expression: Box<Expr>,
    pub conversion: ConversionFlag,
    pub format_spec: Option<Vec<FStringElement>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprStringLiteral {
    pub value: String,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprBytesLiteral {
    pub value: Vec<u8>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprNumberLiteral {
    pub value: Number,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprBooleanLiteral {
    pub value: bool,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprNoneLiteral {
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprEllipsisLiteral {
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprAttribute {
    pub value: Box<Expr>,
    pub attr: Identifier,
    pub ctx: ExprContext,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprSubscript {
    pub value: Box<Expr>,
    pub slice: Box<Expr>,
    pub ctx: ExprContext,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprStarred {
    pub value: Box<Expr>,
    pub ctx: ExprContext,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprName {
    pub id: String,
    pub ctx: ExprContext,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprList {
    pub elts: Vec<Expr>,
    pub ctx: ExprContext,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprTuple {
    pub elts: Vec<Expr>,
    pub ctx: ExprContext,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprSlice {
    pub lower: Option<Box<Expr>>,
    pub upper: Option<Box<Expr>>,
    pub step: Option<Box<Expr>>,
    pub range: SourceRange,
}

// --------------------------------------------------------------- support

#[derive(Clone, Debug, PartialEq)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
    pub is_async: bool,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExceptHandler {
    pub type_: Option<Box<Expr>>,
    pub name: Option<Identifier>,
    pub body: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WithItem {
    pub context_expr: Expr,
    pub optional_vars: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub guard: Option<Box<Expr>>,
    pub body: Vec<Stmt>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decorator {
    pub expression: Expr,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Alias {
    pub name: Identifier,
    pub asname: Option<Identifier>,
    pub range: SourceRange,
}

/// Call-site arguments.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Arguments {
    pub args: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    pub range: SourceRange,
}

impl Arguments {
    pub fn len(&self) -> usize {
        self.args.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Keyword {
    /// `None` for `**mapping`.
    pub arg: Option<Identifier>,
    pub value: Expr,
    pub range: SourceRange,
}

/// A function signature.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Parameters {
    pub posonlyargs: Vec<ParameterWithDefault>,
    pub args: Vec<ParameterWithDefault>,
    pub vararg: Option<Box<Parameter>>,
    pub kwonlyargs: Vec<ParameterWithDefault>,
    pub kwarg: Option<Box<Parameter>>,
    pub range: SourceRange,
}

impl Parameters {
    /// All parameters in declaration order, variadics last.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.posonlyargs
            .iter()
            .chain(&self.args)
            .chain(&self.kwonlyargs)
            .map(|p| &p.parameter)
            .chain(self.vararg.as_deref())
            .chain(self.kwarg.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: Identifier,
    pub annotation: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterWithDefault {
    pub parameter: Parameter,
    pub default: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParams {
    pub type_params: Vec<TypeParam>,
    pub range: SourceRange,
}

impl TypeParams {
    pub fn len(&self) -> usize {
        self.type_params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.type_params.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeParam {
    TypeVar(TypeParamTypeVar),
    ParamSpec(TypeParamParamSpec),
    TypeVarTuple(TypeParamTypeVarTuple),
}

impl TypeParam {
    pub fn name(&self) -> &Identifier {
        match self {
            Self::TypeVar(p) => &p.name,
            Self::ParamSpec(p) => &p.name,
            Self::TypeVarTuple(p) => &p.name,
        }
    }

    pub fn default(&self) -> Option<&Expr> {
        match self {
            Self::TypeVar(p) => p.default.as_deref(),
            Self::ParamSpec(p) => p.default.as_deref(),
            Self::TypeVarTuple(p) => p.default.as_deref(),
        }
    }

    pub fn range(&self) -> SourceRange {
        match self {
            Self::TypeVar(p) => p.range,
            Self::ParamSpec(p) => p.range,
            Self::TypeVarTuple(p) => p.range,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParamTypeVar {
    pub name: Identifier,
    pub bound: Option<Box<Expr>>,
    pub default: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParamParamSpec {
    pub name: Identifier,
    pub default: Option<Box<Expr>>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParamTypeVarTuple {
    pub name: Identifier,
    pub default: Option<Box<Expr>>,
    pub range: SourceRange,
}

// --------------------------------------------------------------- patterns

#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    MatchValue(PatternMatchValue),
    MatchSingleton(PatternMatchSingleton),
    MatchSequence(PatternMatchSequence),
    MatchMapping(PatternMatchMapping),
    MatchClass(PatternMatchClass),
    MatchStar(PatternMatchStar),
    MatchAs(PatternMatchAs),
    MatchOr(PatternMatchOr),
}

impl Pattern {
    pub fn range(&self) -> SourceRange {
        match self {
            Self::MatchValue(p) => p.range,
            Self::MatchSingleton(p) => p.range,
            Self::MatchSequence(p) => p.range,
            Self::MatchMapping(p) => p.range,
            Self::MatchClass(p) => p.range,
            Self::MatchStar(p) => p.range,
            Self::MatchAs(p) => p.range,
            Self::MatchOr(p) => p.range,
        }
    }

    pub const fn is_match_star(&self) -> bool {
        matches!(self, Self::MatchStar(_))
    }

    pub fn as_match_star(&self) -> Option<&PatternMatchStar> {
        match self {
            Self::MatchStar(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_match_as(&self) -> Option<&PatternMatchAs> {
        match self {
            Self::MatchAs(p) => Some(p),
            _ => None,
        }
    }

    /// `_`: a capture-free, pattern-free `as` pattern.
    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            Self::MatchAs(PatternMatchAs { pattern: None, name: None, .. })
        )
    }

    /// A pattern that can never fail: a wildcard or bare capture, possibly
    /// wrapped in further irrefutable `as` patterns.
    pub fn is_irrefutable(&self) -> bool {
        match self {
            Self::MatchAs(p) => match &p.pattern {
                None => true,
                Some(inner) => inner.is_irrefutable(),
            },
            Self::MatchOr(p) => p.patterns.last().is_some_and(|p| p.is_irrefutable()),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchValue {
    pub value: Box<Expr>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchSingleton {
    pub value: Singleton,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchSequence {
    pub patterns: Vec<Pattern>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchMapping {
    pub keys: Vec<Expr>,
    pub patterns: Vec<Pattern>,
    pub rest: Option<Identifier>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchClass {
    pub cls: Box<Expr>,
    pub arguments: PatternArguments,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternArguments {
    pub patterns: Vec<Pattern>,
    pub keywords: Vec<PatternKeyword>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternKeyword {
    pub attr: Identifier,
    pub pattern: Pattern,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchStar {
    pub name: Option<Identifier>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchAs {
    pub pattern: Option<Box<Pattern>>,
    pub name: Option<Identifier>,
    pub range: SourceRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatchOr {
    pub patterns: Vec<Pattern>,
    pub range: SourceRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcard() -> Pattern {
        Pattern::MatchAs(PatternMatchAs {
            pattern: None,
            name: None,
            range: SourceRange::NONE,
        })
    }

    #[test]
    fn wildcard_is_irrefutable() {
        assert!(wildcard().is_wildcard());
        assert!(wildcard().is_irrefutable());
    }

    #[test]
    fn capture_is_irrefutable_but_not_wildcard() {
        let capture = Pattern::MatchAs(PatternMatchAs {
            pattern: None,
            name: Some(Identifier::new("x", SourceRange::NONE)),
            range: SourceRange::NONE,
        });
        assert!(!capture.is_wildcard());
        assert!(capture.is_irrefutable());
    }

    #[test]
    fn or_pattern_irrefutability_follows_last_alternative() {
        let value = Pattern::MatchSingleton(PatternMatchSingleton {
            value: Singleton::None,
            range: SourceRange::NONE,
        });
        let or = Pattern::MatchOr(PatternMatchOr {
            patterns: vec![value.clone(), wildcard()],
            range: SourceRange::NONE,
        });
        assert!(or.is_irrefutable());
        let or = Pattern::MatchOr(PatternMatchOr {
            patterns: vec![wildcard(), value],
            range: SourceRange::NONE,
        });
        assert!(!or.is_irrefutable());
    }
}
