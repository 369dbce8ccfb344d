/* Source is pre-scanned for symbols before code generation.

This ensures that global and nonlocal keywords are picked up. The code
generator then consults the symbol table to select the proper load and
store instruction family for every name.

The pass has two halves: a builder that walks the AST collecting symbols
and nested scopes, and an analyzer that resolves each symbol to a scope
(local, cell, free, implicit or explicit global).
*/

use crate::{
    IndexMap,
    error::{CodegenError, CodegenErrorType},
};
use bitflags::bitflags;
use krait_ast as ast;
use krait_compiler_core::SourceRange;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

/// Captures all symbols in one scope, and the list of sub-scopes in the
/// order the code generator will consume them.
#[derive(Clone)]
pub struct SymbolTable {
    /// The name of this symbol table. Often the name of the class or
    /// function.
    pub name: String,

    /// The type of symbol table
    pub typ: CompilerScope,

    /// The line number in the source code where this scope begins.
    pub line_number: u32,

    /// True if the block is a nested class or function.
    pub is_nested: bool,

    /// A set of symbols present on this scope level.
    pub symbols: IndexMap<String, Symbol>,

    /// Sub-scopes in AST order.
    pub sub_tables: Vec<SymbolTable>,

    /// Cursor pointing to the next sub-table to consume during compilation.
    pub next_sub_table: usize,

    /// Variable names in definition order (parameters first).
    pub varnames: Vec<String>,

    /// Whether this class scope needs an implicit `__class__` cell.
    pub needs_class_closure: bool,

    /// Whether this class scope needs an implicit `__classdict__` cell.
    pub needs_classdict: bool,

    /// Whether this synthetic scope can see the enclosing class scope.
    pub can_see_class_scope: bool,

    /// Whether this comprehension executes inline in the enclosing frame.
    pub comp_inlined: bool,

    /// Deferred-annotation scope for this block; compiled into an
    /// `__annotate__` function.
    pub annotation_block: Option<Box<SymbolTable>>,

    /// Whether `from __future__ import annotations` is active.
    pub future_annotations: bool,
}

impl SymbolTable {
    fn new(name: String, typ: CompilerScope, line_number: u32, is_nested: bool) -> Self {
        Self {
            name,
            typ,
            line_number,
            is_nested,
            symbols: IndexMap::default(),
            sub_tables: vec![],
            next_sub_table: 0,
            varnames: Vec::new(),
            needs_class_closure: false,
            needs_classdict: false,
            can_see_class_scope: false,
            comp_inlined: false,
            annotation_block: None,
            future_annotations: false,
        }
    }

    pub fn scan_module(module: &ast::ModModule) -> SymbolTableResult<Self> {
        let mut builder = SymbolTableBuilder::new();
        builder.scan_statements(&module.body)?;
        builder.finish()
    }

    pub fn scan_interactive(module: &ast::ModInteractive) -> SymbolTableResult<Self> {
        let mut builder = SymbolTableBuilder::new();
        builder.scan_statements(&module.body)?;
        builder.finish()
    }

    pub fn scan_expr(expr: &ast::ModExpression) -> SymbolTableResult<Self> {
        let mut builder = SymbolTableBuilder::new();
        builder.scan_expression(&expr.body, ExpressionContext::Load)?;
        builder.finish()
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerScope {
    Module,
    Class,
    Function,
    AsyncFunction,
    Lambda,
    Comprehension,
    TypeParams,
    TypeAlias,
    /// Deferred-annotation scope.
    Annotation,
}

impl CompilerScope {
    /// Function-like scopes use fast locals and allow `return`.
    pub const fn is_function_like(self) -> bool {
        !matches!(self, Self::Module | Self::Class)
    }
}

impl fmt::Display for CompilerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module => write!(f, "module"),
            Self::Class => write!(f, "class"),
            Self::Function => write!(f, "function"),
            Self::AsyncFunction => write!(f, "async function"),
            Self::Lambda => write!(f, "lambda"),
            Self::Comprehension => write!(f, "comprehension"),
            Self::TypeParams => write!(f, "type parameter"),
            Self::TypeAlias => write!(f, "type alias"),
            Self::Annotation => write!(f, "annotation"),
        }
    }
}

/// Indicator for a single symbol what the scope of this symbol is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Unknown,
    Local,
    GlobalExplicit,
    GlobalImplicit,
    Free,
    Cell,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct SymbolFlags: u16 {
        const REFERENCED = 0x001;
        const ASSIGNED = 0x002;
        const PARAMETER = 0x004;
        const ANNOTATED = 0x008;
        const IMPORTED = 0x010;
        const NONLOCAL = 0x020;
        // indicates if the symbol gets a value assigned by a named
        // expression in a comprehension; the analysis corrects its scope
        const ASSIGNED_IN_COMPREHENSION = 0x040;
        // the symbol is bound as an iteration variable; re-assignment by a
        // named expression is rejected
        const ITER = 0x080;
        /// the symbol is a free variable in a class method from the scope
        /// the class is defined in, e.g.:
        /// ```text
        /// def foo(x):
        ///     class A:
        ///         def method(self):
        ///             return x // is_free_class
        /// ```
        const FREE_CLASS = 0x100;
        const GLOBAL = 0x200;
        const TYPE_PARAM = 0x400;
        const BOUND = Self::ASSIGNED.bits()
            | Self::PARAMETER.bits()
            | Self::IMPORTED.bits()
            | Self::ITER.bits()
            | Self::TYPE_PARAM.bits();
    }
}

/// A single symbol in a table: its resolved scope plus usage flags.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub flags: SymbolFlags,
}

impl Symbol {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            scope: SymbolScope::Unknown,
            flags: SymbolFlags::empty(),
        }
    }

    pub const fn is_global(&self) -> bool {
        matches!(
            self.scope,
            SymbolScope::GlobalExplicit | SymbolScope::GlobalImplicit
        )
    }

    pub const fn is_local(&self) -> bool {
        matches!(self.scope, SymbolScope::Local | SymbolScope::Cell)
    }

    pub const fn is_bound(&self) -> bool {
        self.flags.intersects(SymbolFlags::BOUND)
    }
}

#[derive(Debug)]
pub struct SymbolTableError {
    error: String,
    location: Option<SourceRange>,
}

impl SymbolTableError {
    pub fn into_codegen_error(self, source_path: String) -> CodegenError {
        CodegenError {
            location: self.location,
            error: CodegenErrorType::SyntaxError(self.error),
            source_path,
        }
    }
}

pub type SymbolTableResult<T = ()> = Result<T, SymbolTableError>;

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SymbolTable({:?} symbols, {:?} sub scopes)",
            self.symbols.len(),
            self.sub_tables.len()
        )
    }
}

fn analyze_symbol_table(symbol_table: &mut SymbolTable) -> SymbolTableResult {
    let mut analyzer = SymbolTableAnalyzer::default();
    // The free set bubbling out of the top level is discarded; it only
    // matters for propagation between nested scopes.
    let _newfree = analyzer.analyze_symbol_table(symbol_table, None)?;
    Ok(())
}

/* Drop __class__ and __classdict__ from the free variables collected from
   a class scope's children and set the corresponding implicit-cell flags
   on the class entry instead. */
fn drop_class_free(symbol_table: &mut SymbolTable, newfree: &mut HashSet<String>) {
    if newfree.remove("__class__") {
        symbol_table.needs_class_closure = true;
    }
    if newfree.remove("__classdict__") {
        symbol_table.needs_classdict = true;
    }
}

type SymbolMap = IndexMap<String, Symbol>;

/// Symbol table analysis: resolve every symbol collected by the builder to
/// a concrete scope, propagating free variables upward.
#[derive(Default)]
struct SymbolTableAnalyzer {
    /// Ancestor scopes of the table currently being analyzed. Symbol maps
    /// are moved in on entry and moved back out on exit.
    tables: Vec<(SymbolMap, CompilerScope)>,
}

impl SymbolTableAnalyzer {
    /// Analyze one table and return the names free in it (to become cells
    /// in an enclosing scope).
    fn analyze_symbol_table(
        &mut self,
        symbol_table: &mut SymbolTable,
        class_entry: Option<&SymbolMap>,
    ) -> SymbolTableResult<HashSet<String>> {
        let symbols = std::mem::take(&mut symbol_table.symbols);
        let mut newfree = HashSet::new();

        let is_class = symbol_table.typ == CompilerScope::Class;
        // annotation scopes of a class see the class symbols (PEP 649)
        let class_symbols_for_ann = if is_class
            && symbol_table
                .annotation_block
                .as_ref()
                .is_some_and(|b| b.can_see_class_scope)
        {
            Some(symbols.clone())
        } else {
            None
        };

        self.tables.push((symbols, symbol_table.typ));
        let result = (|| {
            for sub_table in &mut symbol_table.sub_tables {
                // sub-scopes do not inherit the class entry
                let child_free = self.analyze_symbol_table(sub_table, None)?;
                newfree.extend(child_free);
            }
            if let Some(annotation_table) = &mut symbol_table.annotation_block {
                let ann_class_entry = class_symbols_for_ann.as_ref().or(class_entry);
                let child_free = self.analyze_symbol_table(annotation_table, ann_class_entry)?;
                newfree.extend(child_free);
            }
            Ok(())
        })();
        let (symbols, _) = self.tables.pop().expect("analyzer stack imbalance");
        symbol_table.symbols = symbols;
        result?;

        // A comprehension stays inlined only while none of its bindings
        // need cell storage; closures over iteration variables fall back
        // to the lifted form.
        for sub_table in &mut symbol_table.sub_tables {
            if sub_table.comp_inlined
                && sub_table.symbols.values().any(|s| {
                    s.scope == SymbolScope::Cell || s.flags.contains(SymbolFlags::FREE_CLASS)
                })
            {
                sub_table.comp_inlined = false;
            }
        }

        for symbol in symbol_table.symbols.values_mut() {
            self.analyze_symbol(symbol, symbol_table.typ, &symbol_table.sub_tables, class_entry)?;

            if symbol.scope == SymbolScope::Free || symbol.flags.contains(SymbolFlags::FREE_CLASS)
            {
                newfree.insert(symbol.name.clone());
            }
        }

        if symbol_table.typ == CompilerScope::Class {
            drop_class_free(symbol_table, &mut newfree);
        }

        Ok(newfree)
    }

    fn analyze_symbol(
        &mut self,
        symbol: &mut Symbol,
        st_typ: CompilerScope,
        sub_tables: &[SymbolTable],
        class_entry: Option<&SymbolMap>,
    ) -> SymbolTableResult {
        if symbol
            .flags
            .contains(SymbolFlags::ASSIGNED_IN_COMPREHENSION)
            && st_typ == CompilerScope::Comprehension
        {
            // propagate the named-expression binding to the next enclosing
            // scope that can hold it
            self.analyze_symbol_comprehension(symbol, 0)?
        } else {
            match symbol.scope {
                SymbolScope::Free => {
                    if self.tables.is_empty() {
                        return Err(SymbolTableError {
                            error: format!(
                                "nonlocal {} defined at place without an enclosing scope",
                                symbol.name
                            ),
                            location: None,
                        });
                    }
                    let scope_depth = self.tables.len();
                    if scope_depth < 2
                        || self.found_in_outer_scope(&symbol.name, st_typ)
                            != Some(SymbolScope::Free)
                    {
                        return Err(SymbolTableError {
                            error: format!("no binding for nonlocal '{}' found", symbol.name),
                            location: None,
                        });
                    }
                }
                SymbolScope::GlobalExplicit | SymbolScope::GlobalImplicit => {}
                SymbolScope::Local | SymbolScope::Cell => {}
                SymbolScope::Unknown => {
                    // names bound in an enclosing class resolve through the
                    // class namespace first (PEP 649 annotation scopes)
                    if let Some(class_symbols) = class_entry
                        && let Some(class_sym) = class_symbols.get(&symbol.name)
                        && class_sym.is_bound()
                        && class_sym.scope != SymbolScope::Free
                    {
                        symbol.scope = SymbolScope::GlobalImplicit;
                        return Ok(());
                    }

                    let scope = if symbol.is_bound() {
                        self.found_in_inner_scope(sub_tables, &symbol.name, st_typ)
                            .unwrap_or(SymbolScope::Local)
                    } else if let Some(scope) = self.found_in_outer_scope(&symbol.name, st_typ) {
                        scope
                    } else if self.tables.is_empty() {
                        // Don't make assumptions when we don't know.
                        SymbolScope::Unknown
                    } else {
                        // If there are scopes above we assume global.
                        SymbolScope::GlobalImplicit
                    };
                    symbol.scope = scope;
                }
            }
        }
        Ok(())
    }

    fn found_in_outer_scope(&mut self, name: &str, st_typ: CompilerScope) -> Option<SymbolScope> {
        let mut decl_depth = None;
        for (i, (symbols, typ)) in self.tables.iter().rev().enumerate() {
            if matches!(typ, CompilerScope::Module)
                || matches!(typ, CompilerScope::Class
                    if name != "__class__" && name != "__classdict__")
            {
                continue;
            }

            // An annotation scope is conceptually a sibling of its function,
            // not a child: skip the immediate parent when resolving.
            if st_typ == CompilerScope::Annotation
                && i == 0
                && matches!(
                    typ,
                    CompilerScope::Function | CompilerScope::AsyncFunction | CompilerScope::Lambda
                )
            {
                continue;
            }

            // __class__ and __classdict__ are implicitly declared in class
            // scope; nested scopes referencing them close over the cell
            if (name == "__class__" || name == "__classdict__")
                && matches!(typ, CompilerScope::Class)
            {
                decl_depth = Some(i);
                break;
            }

            if let Some(sym) = symbols.get(name) {
                match sym.scope {
                    SymbolScope::GlobalExplicit => return Some(SymbolScope::GlobalExplicit),
                    SymbolScope::GlobalImplicit => {}
                    _ => {
                        if sym.is_bound() {
                            decl_depth = Some(i);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(decl_depth) = decl_depth {
            // decl_depth is the number of tables between the current one
            // and the one that declares the cell var
            for (table, typ) in self.tables.iter_mut().rev().take(decl_depth) {
                if let CompilerScope::Class = typ {
                    if let Some(free_class) = table.get_mut(name) {
                        free_class.flags.insert(SymbolFlags::FREE_CLASS)
                    } else {
                        let mut symbol = Symbol::new(name);
                        symbol.flags.insert(SymbolFlags::FREE_CLASS);
                        symbol.scope = SymbolScope::Free;
                        table.insert(name.to_owned(), symbol);
                    }
                } else if !table.contains_key(name) {
                    let mut symbol = Symbol::new(name);
                    symbol.scope = SymbolScope::Free;
                    table.insert(name.to_owned(), symbol);
                }
            }
        }

        decl_depth.map(|_| SymbolScope::Free)
    }

    fn found_in_inner_scope(
        &self,
        sub_tables: &[SymbolTable],
        name: &str,
        st_typ: CompilerScope,
    ) -> Option<SymbolScope> {
        sub_tables.iter().find_map(|st| {
            let sym = st.symbols.get(name)?;
            if sym.scope == SymbolScope::Free || sym.flags.contains(SymbolFlags::FREE_CLASS) {
                if st_typ == CompilerScope::Class && name != "__class__" {
                    None
                } else {
                    Some(SymbolScope::Cell)
                }
            } else if sym.scope == SymbolScope::GlobalExplicit && self.tables.is_empty() {
                // the symbol is defined on the module level, and an inner
                // scope declares a global that points to it
                Some(SymbolScope::GlobalExplicit)
            } else {
                None
            }
        })
    }

    // Symbol analysis and scope extension for names assigned by a named
    // expression in a comprehension.
    fn analyze_symbol_comprehension(
        &mut self,
        symbol: &mut Symbol,
        parent_offset: usize,
    ) -> SymbolTableResult {
        // when this is called, we expect to be in the direct parent scope
        // of the scope that contains 'symbol'
        let last = self
            .tables
            .iter_mut()
            .rev()
            .nth(parent_offset)
            .expect("no parent scope for comprehension symbol");
        let symbols = &mut last.0;
        let table_type = last.1;

        if symbol.flags.contains(SymbolFlags::ITER) {
            return Err(SymbolTableError {
                error: format!(
                    "assignment expression cannot rebind comprehension iteration variable {}",
                    symbol.name
                ),
                location: None,
            });
        }

        match table_type {
            CompilerScope::Module => {
                symbol.scope = SymbolScope::GlobalImplicit;
            }
            CompilerScope::Class => {
                return Err(SymbolTableError {
                    error: "assignment expression within a comprehension cannot be used in a class body"
                        .to_string(),
                    location: None,
                });
            }
            CompilerScope::Function | CompilerScope::AsyncFunction | CompilerScope::Lambda => {
                if let Some(parent_symbol) = symbols.get_mut(&symbol.name) {
                    if let SymbolScope::Unknown = parent_symbol.scope {
                        // this information is new: the assignment is done
                        // in an inner scope
                        parent_symbol.flags.insert(SymbolFlags::ASSIGNED);
                    }
                    symbol.scope = if parent_symbol.is_global() {
                        parent_symbol.scope
                    } else {
                        SymbolScope::Free
                    };
                } else {
                    let mut cloned_sym = symbol.clone();
                    cloned_sym.scope = SymbolScope::Cell;
                    symbols.insert(cloned_sym.name.to_owned(), cloned_sym);
                }
            }
            CompilerScope::Comprehension => {
                match symbols.get_mut(&symbol.name) {
                    Some(parent_symbol) => {
                        if parent_symbol.flags.contains(SymbolFlags::ITER) {
                            return Err(SymbolTableError {
                                error: format!(
                                    "assignment expression cannot rebind comprehension iteration variable {}",
                                    symbol.name
                                ),
                                location: None,
                            });
                        }
                        // synthesize the assignment seen in the inner scope
                        parent_symbol.flags.insert(SymbolFlags::ASSIGNED);
                    }
                    None => {
                        // extend the scope of the inner symbol: we expect a
                        // binding to exist on a higher level
                        let mut cloned_sym = symbol.clone();
                        cloned_sym.scope = SymbolScope::Free;
                        symbols.insert(cloned_sym.name.to_owned(), cloned_sym);
                    }
                }
                self.analyze_symbol_comprehension(symbol, parent_offset + 1)?;
            }
            CompilerScope::TypeParams | CompilerScope::TypeAlias => {
                return Err(SymbolTableError {
                    error: "assignment expression within a comprehension cannot be used within the definition of a generic"
                        .to_string(),
                    location: None,
                });
            }
            CompilerScope::Annotation => {
                return Err(SymbolTableError {
                    error: "named expression cannot be used within an annotation".to_string(),
                    location: None,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum SymbolUsage {
    Global,
    Nonlocal,
    Used,
    Assigned,
    Imported,
    AnnotationAssigned,
    Parameter,
    AnnotationParameter,
    AssignedNamedExprInComprehension,
    Iter,
    TypeParam,
}

struct SymbolTableBuilder {
    class_name: Option<String>,
    /// Scope stack.
    tables: Vec<SymbolTable>,
    future_annotations: bool,
    /// Current scope's varnames being collected.
    current_varnames: Vec<String>,
    /// Parent varnames preserved while a nested scope is open.
    varnames_stack: Vec<Vec<String>>,
    /// Scanning an inner-loop iteration target (not the first generator).
    in_comp_inner_loop_target: bool,
}

/// In what mode an expression is used.
#[derive(Copy, Clone, PartialEq)]
enum ExpressionContext {
    Load,
    Store,
    Delete,
    Iter,
    IterDefinitionExp,
}

impl SymbolTableBuilder {
    fn new() -> Self {
        let mut this = Self {
            class_name: None,
            tables: vec![],
            future_annotations: false,
            current_varnames: Vec::new(),
            varnames_stack: Vec::new(),
            in_comp_inner_loop_target: false,
        };
        this.enter_scope("top", CompilerScope::Module, 0);
        this
    }

    fn finish(mut self) -> SymbolTableResult<SymbolTable> {
        assert_eq!(self.tables.len(), 1);
        let mut symbol_table = self.tables.pop().unwrap();
        symbol_table.varnames = self.current_varnames;
        symbol_table.future_annotations = self.future_annotations;
        analyze_symbol_table(&mut symbol_table)?;
        Ok(symbol_table)
    }

    fn enter_scope(&mut self, name: &str, typ: CompilerScope, line_number: u32) {
        let is_nested = self
            .tables
            .last()
            .map(|table| table.is_nested || table.typ.is_function_like())
            .unwrap_or(false);
        let table = SymbolTable::new(name.to_owned(), typ, line_number, is_nested);
        self.tables.push(table);
        self.varnames_stack
            .push(std::mem::take(&mut self.current_varnames));
    }

    fn enter_type_param_block(&mut self, name: &str, line_number: u32) -> SymbolTableResult {
        let in_class = self
            .tables
            .last()
            .is_some_and(|t| t.typ == CompilerScope::Class);

        self.enter_scope(name, CompilerScope::TypeParams, line_number);

        if let Some(table) = self.tables.last_mut() {
            table.can_see_class_scope = in_class;
            if in_class {
                self.register_name("__classdict__", SymbolUsage::Used, SourceRange::NONE)?;
            }
        }
        Ok(())
    }

    /// Pop the current table and append it to the parent's sub tables.
    fn leave_scope(&mut self) {
        let mut table = self.tables.pop().unwrap();
        table.varnames = std::mem::take(&mut self.current_varnames);
        self.tables.last_mut().unwrap().sub_tables.push(table);
        self.current_varnames = self.varnames_stack.pop().unwrap_or_default();
    }

    /// Enter (or re-enter) the deferred-annotation scope of the current
    /// block. All annotations of one scope share a single block.
    fn enter_annotation_scope(&mut self, line_number: u32) -> SymbolTableResult {
        let current = self.tables.last_mut().unwrap();
        let can_see_class_scope = current.typ == CompilerScope::Class;

        if current.annotation_block.is_none() {
            let mut annotation_table = SymbolTable::new(
                "__annotate__".to_owned(),
                CompilerScope::Annotation,
                line_number,
                true,
            );
            annotation_table.can_see_class_scope = can_see_class_scope;
            annotation_table.varnames.push(".format".to_owned());
            current.annotation_block = Some(Box::new(annotation_table));
        }

        let annotation_table = current.annotation_block.take().unwrap();
        self.tables.push(*annotation_table);
        self.varnames_stack
            .push(std::mem::take(&mut self.current_varnames));
        self.current_varnames = self.tables.last().unwrap().varnames.clone();

        if self.tables.last().unwrap().symbols.is_empty() {
            self.register_name(".format", SymbolUsage::Parameter, SourceRange::NONE)?;
        }
        if can_see_class_scope {
            self.add_classdict_freevar();
        }
        Ok(())
    }

    /// Store the annotation block back onto its owner (not `sub_tables`).
    fn leave_annotation_scope(&mut self) {
        let mut table = self.tables.pop().unwrap();
        table.varnames = std::mem::take(&mut self.current_varnames);
        let parent = self.tables.last_mut().unwrap();
        parent.annotation_block = Some(Box::new(table));
        self.current_varnames = self.varnames_stack.pop().unwrap_or_default();
    }

    fn add_classdict_freevar(&mut self) {
        let table = self.tables.last_mut().unwrap();
        let name = "__classdict__";
        let symbol = table
            .symbols
            .entry(name.to_owned())
            .or_insert_with(|| Symbol::new(name));
        symbol.scope = SymbolScope::Free;
        symbol
            .flags
            .insert(SymbolFlags::REFERENCED | SymbolFlags::FREE_CLASS);
    }

    fn scan_statements(&mut self, statements: &[ast::Stmt]) -> SymbolTableResult {
        for statement in statements {
            self.scan_statement(statement)?;
        }
        Ok(())
    }

    fn scan_parameters(&mut self, parameters: &[ast::ParameterWithDefault]) -> SymbolTableResult {
        for parameter in parameters {
            self.scan_parameter(&parameter.parameter)?;
        }
        Ok(())
    }

    fn scan_parameter(&mut self, parameter: &ast::Parameter) -> SymbolTableResult {
        self.check_name(
            parameter.name.as_str(),
            ExpressionContext::Store,
            parameter.name.range,
        )?;

        let usage = if parameter.annotation.is_some() {
            SymbolUsage::AnnotationParameter
        } else {
            SymbolUsage::Parameter
        };

        let table = self.tables.last().unwrap();
        if table.symbols.contains_key(parameter.name.as_str()) {
            return Err(SymbolTableError {
                error: format!(
                    "duplicate parameter '{}' in function definition",
                    parameter.name
                ),
                location: Some(parameter.name.range),
            });
        }

        self.register_ident(&parameter.name, usage)
    }

    /// Scan an annotation expression inside the deferred-annotation scope.
    fn scan_annotation(&mut self, annotation: &ast::Expr) -> SymbolTableResult {
        if self.future_annotations {
            // stringified at compile time, never evaluated
            return Ok(());
        }

        self.enter_annotation_scope(annotation.range().first_row())?;
        let result = self.scan_expression(annotation, ExpressionContext::Load);
        self.leave_annotation_scope();
        result
    }

    fn scan_statement(&mut self, statement: &ast::Stmt) -> SymbolTableResult {
        use ast::*;
        if let Stmt::ImportFrom(StmtImportFrom { module, names, .. }) = statement
            && module.as_ref().map(|id| id.as_str()) == Some("__future__")
        {
            self.future_annotations = self.future_annotations
                || names.iter().any(|future| future.name.as_str() == "annotations");
        }

        match statement {
            Stmt::Global(StmtGlobal { names, .. }) => {
                for name in names {
                    self.register_ident(name, SymbolUsage::Global)?;
                }
            }
            Stmt::Nonlocal(StmtNonlocal { names, .. }) => {
                for name in names {
                    self.register_ident(name, SymbolUsage::Nonlocal)?;
                }
            }
            Stmt::FunctionDef(StmtFunctionDef {
                name,
                body,
                parameters,
                decorator_list,
                type_params,
                returns,
                is_async,
                range,
            }) => {
                for decorator in decorator_list {
                    self.scan_expression(&decorator.expression, ExpressionContext::Load)?;
                }
                self.register_ident(name, SymbolUsage::Assigned)?;

                // keep the enclosing scope's annotation block out of the
                // way while this function's annotations are scanned
                let saved_annotation_block =
                    self.tables.last_mut().unwrap().annotation_block.take();

                if let Some(type_params) = type_params {
                    self.enter_type_param_block(
                        &format!("<generic parameters of {}>", name.as_str()),
                        type_params.range.first_row(),
                    )?;
                    self.scan_type_params(type_params)?;
                }
                let has_return_annotation = if let Some(expression) = returns {
                    self.scan_annotation(expression)?;
                    true
                } else {
                    false
                };
                self.enter_scope_with_parameters(
                    name.as_str(),
                    parameters,
                    range.first_row(),
                    has_return_annotation,
                    if *is_async {
                        CompilerScope::AsyncFunction
                    } else {
                        CompilerScope::Function
                    },
                )?;
                self.scan_statements(body)?;
                self.leave_scope();
                if type_params.is_some() {
                    self.leave_scope();
                }

                if let Some(block) = saved_annotation_block {
                    self.tables.last_mut().unwrap().annotation_block = Some(block);
                }
            }
            Stmt::ClassDef(StmtClassDef {
                name,
                body,
                arguments,
                decorator_list,
                type_params,
                range,
            }) => {
                if let Some(type_params) = type_params {
                    self.enter_type_param_block(
                        &format!("<generic parameters of {}>", name.as_str()),
                        type_params.range.first_row(),
                    )?;
                    self.scan_type_params(type_params)?;
                }
                self.enter_scope(name.as_str(), CompilerScope::Class, range.first_row());
                let prev_class = self.class_name.replace(name.to_string());
                self.register_name("__module__", SymbolUsage::Assigned, *range)?;
                self.register_name("__qualname__", SymbolUsage::Assigned, *range)?;
                self.register_name("__doc__", SymbolUsage::Assigned, *range)?;
                self.register_name("__class__", SymbolUsage::Assigned, *range)?;
                self.scan_statements(body)?;
                self.leave_scope();
                self.class_name = prev_class;
                if let Some(arguments) = arguments {
                    self.scan_expressions(&arguments.args, ExpressionContext::Load)?;
                    for keyword in &arguments.keywords {
                        self.scan_expression(&keyword.value, ExpressionContext::Load)?;
                    }
                }
                if type_params.is_some() {
                    self.leave_scope();
                }
                for decorator in decorator_list {
                    self.scan_expression(&decorator.expression, ExpressionContext::Load)?;
                }
                self.register_ident(name, SymbolUsage::Assigned)?;
            }
            Stmt::Expr(StmtExpr { value, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?
            }
            Stmt::If(StmtIf {
                test, body, orelse, ..
            }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                self.scan_statements(body)?;
                self.scan_statements(orelse)?;
            }
            Stmt::For(StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.scan_expression(target, ExpressionContext::Store)?;
                self.scan_expression(iter, ExpressionContext::Load)?;
                self.scan_statements(body)?;
                self.scan_statements(orelse)?;
            }
            Stmt::While(StmtWhile {
                test, body, orelse, ..
            }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                self.scan_statements(body)?;
                self.scan_statements(orelse)?;
            }
            Stmt::With(StmtWith { items, body, .. }) => {
                for item in items {
                    self.scan_expression(&item.context_expr, ExpressionContext::Load)?;
                    if let Some(expression) = &item.optional_vars {
                        self.scan_expression(expression, ExpressionContext::Store)?;
                    }
                }
                self.scan_statements(body)?;
            }
            Stmt::Match(StmtMatch { subject, cases, .. }) => {
                self.scan_expression(subject, ExpressionContext::Load)?;
                for case in cases {
                    self.scan_pattern(&case.pattern)?;
                    if let Some(guard) = &case.guard {
                        self.scan_expression(guard, ExpressionContext::Load)?;
                    }
                    self.scan_statements(&case.body)?;
                }
            }
            Stmt::Raise(StmtRaise { exc, cause, .. }) => {
                if let Some(expression) = exc {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
                if let Some(expression) = cause {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
            }
            Stmt::Try(StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.scan_statements(body)?;
                for handler in handlers {
                    if let Some(expression) = &handler.type_ {
                        self.scan_expression(expression, ExpressionContext::Load)?;
                    }
                    if let Some(name) = &handler.name {
                        self.register_ident(name, SymbolUsage::Assigned)?;
                    }
                    self.scan_statements(&handler.body)?;
                }
                self.scan_statements(orelse)?;
                self.scan_statements(finalbody)?;
            }
            Stmt::Assert(StmtAssert { test, msg, .. }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                if let Some(expression) = msg {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
            }
            Stmt::Import(StmtImport { names, .. }) => {
                for name in names {
                    if let Some(alias) = &name.asname {
                        // `import mymodule as myalias`
                        self.register_ident(alias, SymbolUsage::Imported)?;
                    } else {
                        // `import module.part`: the first component binds
                        let first_part = name.name.as_str().split('.').next().unwrap();
                        self.register_name(first_part, SymbolUsage::Imported, name.range)?;
                    }
                }
            }
            Stmt::ImportFrom(StmtImportFrom { names, .. }) => {
                for name in names {
                    if name.name.as_str() == "*" {
                        continue;
                    }
                    if let Some(alias) = &name.asname {
                        self.register_ident(alias, SymbolUsage::Imported)?;
                    } else {
                        self.register_ident(&name.name, SymbolUsage::Imported)?;
                    }
                }
            }
            Stmt::Return(StmtReturn { value, .. }) => {
                if let Some(expression) = value {
                    self.scan_expression(expression, ExpressionContext::Load)?;
                }
            }
            Stmt::Assign(StmtAssign { targets, value, .. }) => {
                self.scan_expressions(targets, ExpressionContext::Store)?;
                self.scan_expression(value, ExpressionContext::Load)?;
            }
            Stmt::AugAssign(StmtAugAssign { target, value, .. }) => {
                self.scan_expression(target, ExpressionContext::Store)?;
                self.scan_expression(value, ExpressionContext::Load)?;
            }
            Stmt::AnnAssign(StmtAnnAssign {
                target,
                annotation,
                value,
                simple,
                ..
            }) => {
                // the annotation registers a binding even without a value
                if *simple
                    && let ast::Expr::Name(name) = target.as_ref()
                {
                    self.register_name(&name.id, SymbolUsage::AnnotationAssigned, name.range)?;
                } else {
                    self.scan_expression(target, ExpressionContext::Store)?;
                }
                self.scan_annotation(annotation)?;
                if let Some(value) = value {
                    self.scan_expression(value, ExpressionContext::Load)?;
                }
            }
            Stmt::TypeAlias(StmtTypeAlias {
                name,
                type_params,
                value,
                range,
            }) => {
                let alias_name = match name.as_ref() {
                    ast::Expr::Name(n) => n.id.clone(),
                    _ => {
                        return Err(SymbolTableError {
                            error: "type alias target must be a name".to_owned(),
                            location: Some(*range),
                        });
                    }
                };
                if let Some(type_params) = type_params {
                    self.enter_type_param_block(
                        &format!("<generic parameters of {alias_name}>"),
                        type_params.range.first_row(),
                    )?;
                    self.scan_type_params(type_params)?;
                }
                self.enter_scope(&alias_name, CompilerScope::TypeAlias, range.first_row());
                self.scan_expression(value, ExpressionContext::Load)?;
                self.leave_scope();
                if type_params.is_some() {
                    self.leave_scope();
                }
                self.register_name(&alias_name, SymbolUsage::Assigned, *range)?;
            }
            Stmt::Delete(StmtDelete { targets, .. }) => {
                self.scan_expressions(targets, ExpressionContext::Delete)?;
            }
            Stmt::Pass(_) | Stmt::Break(_) | Stmt::Continue(_) => {}
        }
        Ok(())
    }

    fn scan_expressions(
        &mut self,
        expressions: &[ast::Expr],
        context: ExpressionContext,
    ) -> SymbolTableResult {
        for expression in expressions {
            self.scan_expression(expression, context)?;
        }
        Ok(())
    }

    fn scan_expression(
        &mut self,
        expression: &ast::Expr,
        context: ExpressionContext,
    ) -> SymbolTableResult {
        use ast::*;
        match expression {
            Expr::BinOp(ExprBinOp { left, right, .. }) => {
                self.scan_expression(left, context)?;
                self.scan_expression(right, context)?;
            }
            Expr::BoolOp(ExprBoolOp { values, .. }) => {
                self.scan_expressions(values, context)?;
            }
            Expr::Compare(ExprCompare {
                left, comparators, ..
            }) => {
                self.scan_expression(left, context)?;
                self.scan_expressions(comparators, context)?;
            }
            Expr::Subscript(ExprSubscript { value, slice, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?;
                self.scan_expression(slice, ExpressionContext::Load)?;
            }
            Expr::Attribute(ExprAttribute { value, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?;
            }
            Expr::Dict(ExprDict { items, .. }) => {
                for item in items {
                    if let Some(key) = &item.key {
                        self.scan_expression(key, context)?;
                    }
                    self.scan_expression(&item.value, context)?;
                }
            }
            Expr::Await(ExprAwait { value, .. }) => {
                self.scan_expression(value, context)?;
            }
            Expr::Yield(ExprYield { value, .. }) => {
                if let Some(expression) = value {
                    self.scan_expression(expression, context)?;
                }
            }
            Expr::YieldFrom(ExprYieldFrom { value, .. }) => {
                self.scan_expression(value, context)?;
            }
            Expr::UnaryOp(ExprUnaryOp { operand, .. }) => {
                self.scan_expression(operand, context)?;
            }
            Expr::Starred(ExprStarred { value, .. }) => {
                self.scan_expression(value, context)?;
            }
            Expr::Tuple(ExprTuple { elts, .. })
            | Expr::Set(ExprSet { elts, .. })
            | Expr::List(ExprList { elts, .. }) => {
                self.scan_expressions(elts, context)?;
            }
            Expr::Slice(ExprSlice {
                lower, upper, step, ..
            }) => {
                if let Some(lower) = lower {
                    self.scan_expression(lower, context)?;
                }
                if let Some(upper) = upper {
                    self.scan_expression(upper, context)?;
                }
                if let Some(step) = step {
                    self.scan_expression(step, context)?;
                }
            }
            Expr::Generator(ExprGenerator {
                elt, generators, ..
            }) => {
                self.scan_comprehension("<genexpr>", &[elt], generators, expression.range())?;
            }
            Expr::ListComp(ExprListComp {
                elt, generators, ..
            }) => {
                self.scan_comprehension("<listcomp>", &[elt], generators, expression.range())?;
            }
            Expr::SetComp(ExprSetComp {
                elt, generators, ..
            }) => {
                self.scan_comprehension("<setcomp>", &[elt], generators, expression.range())?;
            }
            Expr::DictComp(ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.scan_comprehension("<dictcomp>", &[key, value], generators, expression.range())?;
            }
            Expr::Call(ExprCall {
                func, arguments, ..
            }) => {
                match context {
                    ExpressionContext::IterDefinitionExp => {
                        self.scan_expression(func, ExpressionContext::IterDefinitionExp)?;
                    }
                    _ => {
                        self.scan_expression(func, ExpressionContext::Load)?;
                    }
                }
                self.scan_expressions(&arguments.args, ExpressionContext::Load)?;
                for keyword in &arguments.keywords {
                    self.scan_expression(&keyword.value, ExpressionContext::Load)?;
                }
            }
            Expr::FString(ExprFString { elements, .. }) => {
                self.scan_fstring_elements(elements)?;
            }
            Expr::StringLiteral(_)
            | Expr::BytesLiteral(_)
            | Expr::NumberLiteral(_)
            | Expr::BooleanLiteral(_)
            | Expr::NoneLiteral(_)
            | Expr::EllipsisLiteral(_) => {}
            Expr::Name(ExprName { id, range, .. }) => {
                let id = id.as_str();
                self.check_name(id, context, *range)?;
                match context {
                    ExpressionContext::Delete => {
                        self.register_name(id, SymbolUsage::Assigned, *range)?;
                        self.register_name(id, SymbolUsage::Used, *range)?;
                    }
                    ExpressionContext::Load | ExpressionContext::IterDefinitionExp => {
                        self.register_name(id, SymbolUsage::Used, *range)?;
                    }
                    ExpressionContext::Store => {
                        self.register_name(id, SymbolUsage::Assigned, *range)?;
                    }
                    ExpressionContext::Iter => {
                        self.register_name(id, SymbolUsage::Iter, *range)?;
                    }
                }
                // a exec() call may access undefined module-level names
                if context == ExpressionContext::Load
                    && self.tables.last().unwrap().typ == CompilerScope::Function
                    && id == "super"
                {
                    self.register_name("__class__", SymbolUsage::Used, *range)?;
                }
            }
            Expr::Lambda(ExprLambda {
                parameters, body, ..
            }) => {
                let default_params = ast::Parameters::default();
                let params = parameters.as_deref().unwrap_or(&default_params);
                self.enter_scope_with_parameters(
                    "<lambda>",
                    params,
                    expression.range().first_row(),
                    false,
                    CompilerScope::Lambda,
                )?;
                match context {
                    ExpressionContext::IterDefinitionExp => {
                        self.scan_expression(body, ExpressionContext::IterDefinitionExp)?;
                    }
                    _ => {
                        self.scan_expression(body, ExpressionContext::Load)?;
                    }
                }
                self.leave_scope();
            }
            Expr::If(ExprIf {
                test, body, orelse, ..
            }) => {
                self.scan_expression(test, ExpressionContext::Load)?;
                self.scan_expression(body, ExpressionContext::Load)?;
                self.scan_expression(orelse, ExpressionContext::Load)?;
            }
            Expr::Named(ExprNamed { target, value, .. }) => {
                // named expressions are not allowed in the definition of
                // comprehension iterators
                if context == ExpressionContext::IterDefinitionExp {
                    return Err(SymbolTableError {
                        error: "assignment expression cannot be used in a comprehension iterable expression".to_string(),
                        location: Some(target.range()),
                    });
                }

                self.scan_expression(value, ExpressionContext::Load)?;

                if let ast::Expr::Name(ExprName { id, range, .. }) = target.as_ref() {
                    let id = id.as_str();
                    let table = self.tables.last().unwrap();
                    if table.typ == CompilerScope::Comprehension {
                        self.register_name(
                            id,
                            SymbolUsage::AssignedNamedExprInComprehension,
                            *range,
                        )?;
                    } else {
                        // omit one recursion; avoids a false Used
                        self.register_name(id, SymbolUsage::Assigned, *range)?;
                    }
                } else {
                    self.scan_expression(target, ExpressionContext::Store)?;
                }
            }
        }
        Ok(())
    }

    fn scan_fstring_elements(&mut self, elements: &[ast::FStringElement]) -> SymbolTableResult {
        for element in elements {
            if let ast::FStringElement::Interpolation(interp) = element {
                self.scan_expression(&interp.expression, ExpressionContext::Load)?;
                if let Some(spec) = &interp.format_spec {
                    self.scan_fstring_elements(spec)?;
                }
            }
        }
        Ok(())
    }

    fn scan_comprehension(
        &mut self,
        scope_name: &str,
        elements: &[&ast::Expr],
        generators: &[ast::Comprehension],
        range: SourceRange,
    ) -> SymbolTableResult {
        assert!(!generators.is_empty());

        // The outermost iterable is evaluated in the enclosing scope.
        self.scan_expression(&generators[0].iter, ExpressionContext::IterDefinitionExp)?;

        self.enter_scope(scope_name, CompilerScope::Comprehension, range.first_row());

        // list/set/dict comprehensions execute inline in the enclosing
        // frame; generator expressions and async iteration always lift
        let parent_typ = self.tables[self.tables.len() - 2].typ;
        let is_async = generators.iter().any(|g| g.is_async);
        self.tables.last_mut().unwrap().comp_inlined = scope_name != "<genexpr>"
            && !is_async
            && matches!(
                parent_typ,
                CompilerScope::Module
                    | CompilerScope::Function
                    | CompilerScope::AsyncFunction
                    | CompilerScope::Lambda
            );

        // the outermost iterable arrives as the sole argument
        self.register_name(".0", SymbolUsage::Parameter, range)?;

        let mut is_first_generator = true;
        for generator in generators {
            self.in_comp_inner_loop_target = !is_first_generator;
            self.scan_expression(&generator.target, ExpressionContext::Iter)?;
            self.in_comp_inner_loop_target = false;
            if is_first_generator {
                is_first_generator = false;
            } else {
                self.scan_expression(&generator.iter, ExpressionContext::IterDefinitionExp)?;
            }

            for if_expr in &generator.ifs {
                self.scan_expression(if_expr, ExpressionContext::Load)?;
            }
        }

        for expression in elements {
            self.scan_expression(expression, ExpressionContext::Load)?;
        }

        self.leave_scope();
        Ok(())
    }

    /// Scan a type parameter bound or default in its own synthetic scope.
    fn scan_type_param_bound_or_default(
        &mut self,
        expr: &ast::Expr,
        scope_name: &str,
    ) -> SymbolTableResult {
        self.enter_scope(scope_name, CompilerScope::TypeParams, expr.range().first_row());
        let result = self.scan_expression(expr, ExpressionContext::Load);
        self.leave_scope();
        result
    }

    fn scan_type_params(&mut self, type_params: &ast::TypeParams) -> SymbolTableResult {
        let mut seen_names: HashSet<&str> = HashSet::new();
        for type_param in &type_params.type_params {
            let name = type_param.name().as_str();
            if !seen_names.insert(name) {
                return Err(SymbolTableError {
                    error: format!("duplicate type parameter '{name}'"),
                    location: Some(type_param.range()),
                });
            }
        }

        // .type_params becomes a cell variable holding the tuple
        self.register_name(".type_params", SymbolUsage::TypeParam, type_params.range)?;

        for type_param in &type_params.type_params {
            match type_param {
                ast::TypeParam::TypeVar(ast::TypeParamTypeVar {
                    name,
                    bound,
                    default,
                    range,
                }) => {
                    self.register_name(name.as_str(), SymbolUsage::TypeParam, *range)?;
                    if let Some(binding) = bound {
                        let scope_name = if binding.is_tuple_expr() {
                            format!("<TypeVar constraint of {name}>")
                        } else {
                            format!("<TypeVar bound of {name}>")
                        };
                        self.scan_type_param_bound_or_default(binding, &scope_name)?;
                    }
                    if let Some(default_value) = default {
                        let scope_name = format!("<TypeVar default of {name}>");
                        self.scan_type_param_bound_or_default(default_value, &scope_name)?;
                    }
                }
                ast::TypeParam::ParamSpec(ast::TypeParamParamSpec {
                    name,
                    default,
                    range,
                }) => {
                    self.register_name(name.as_str(), SymbolUsage::TypeParam, *range)?;
                    if let Some(default_value) = default {
                        let scope_name = format!("<ParamSpec default of {name}>");
                        self.scan_type_param_bound_or_default(default_value, &scope_name)?;
                    }
                }
                ast::TypeParam::TypeVarTuple(ast::TypeParamTypeVarTuple {
                    name,
                    default,
                    range,
                }) => {
                    self.register_name(name.as_str(), SymbolUsage::TypeParam, *range)?;
                    if let Some(default_value) = default {
                        let scope_name = format!("<TypeVarTuple default of {name}>");
                        self.scan_type_param_bound_or_default(default_value, &scope_name)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn scan_patterns(&mut self, patterns: &[ast::Pattern]) -> SymbolTableResult {
        for pattern in patterns {
            self.scan_pattern(pattern)?;
        }
        Ok(())
    }

    fn scan_pattern(&mut self, pattern: &ast::Pattern) -> SymbolTableResult {
        use ast::Pattern::*;
        match pattern {
            MatchValue(ast::PatternMatchValue { value, .. }) => {
                self.scan_expression(value, ExpressionContext::Load)?
            }
            MatchSingleton(_) => {}
            MatchSequence(ast::PatternMatchSequence { patterns, .. }) => {
                self.scan_patterns(patterns)?
            }
            MatchMapping(ast::PatternMatchMapping {
                keys,
                patterns,
                rest,
                ..
            }) => {
                self.scan_expressions(keys, ExpressionContext::Load)?;
                self.scan_patterns(patterns)?;
                if let Some(rest) = rest {
                    self.register_ident(rest, SymbolUsage::Assigned)?;
                }
            }
            MatchClass(ast::PatternMatchClass { cls, arguments, .. }) => {
                self.scan_expression(cls, ExpressionContext::Load)?;
                self.scan_patterns(&arguments.patterns)?;
                for kw in &arguments.keywords {
                    self.scan_pattern(&kw.pattern)?;
                }
            }
            MatchStar(ast::PatternMatchStar { name, .. }) => {
                if let Some(name) = name {
                    self.register_ident(name, SymbolUsage::Assigned)?;
                }
            }
            MatchAs(ast::PatternMatchAs { pattern, name, .. }) => {
                if let Some(pattern) = pattern {
                    self.scan_pattern(pattern)?;
                }
                if let Some(name) = name {
                    self.register_ident(name, SymbolUsage::Assigned)?;
                }
            }
            MatchOr(ast::PatternMatchOr { patterns, .. }) => self.scan_patterns(patterns)?,
        }
        Ok(())
    }

    fn enter_scope_with_parameters(
        &mut self,
        name: &str,
        parameters: &ast::Parameters,
        line_number: u32,
        has_return_annotation: bool,
        scope: CompilerScope,
    ) -> SymbolTableResult {
        // Default values are evaluated in the enclosing scope.
        for default in parameters
            .posonlyargs
            .iter()
            .chain(parameters.args.iter())
            .chain(parameters.kwonlyargs.iter())
            .filter_map(|arg| arg.default.as_deref())
        {
            self.scan_expression(default, ExpressionContext::Load)?;
        }

        // Annotations are scanned in the outer scope's annotation block.
        for annotation in parameters
            .iter()
            .filter_map(|param| param.annotation.as_deref())
        {
            self.scan_annotation(annotation)?;
        }

        let has_any_annotations = has_return_annotation
            || parameters.iter().any(|p| p.annotation.is_some());

        // The annotation block accumulated while scanning the signature
        // belongs to this function, not to the enclosing scope.
        let annotation_block = if has_any_annotations {
            self.tables.last_mut().unwrap().annotation_block.take()
        } else {
            None
        };

        self.enter_scope(name, scope, line_number);

        if let Some(block) = annotation_block {
            self.tables.last_mut().unwrap().annotation_block = Some(block);
        }

        self.scan_parameters(&parameters.posonlyargs)?;
        self.scan_parameters(&parameters.args)?;
        self.scan_parameters(&parameters.kwonlyargs)?;
        if let Some(name) = &parameters.vararg {
            self.scan_parameter(name)?;
        }
        if let Some(name) = &parameters.kwarg {
            self.scan_parameter(name)?;
        }
        Ok(())
    }

    fn register_ident(&mut self, ident: &ast::Identifier, role: SymbolUsage) -> SymbolTableResult {
        self.register_name(ident.as_str(), role, ident.range)
    }

    fn check_name(
        &self,
        name: &str,
        context: ExpressionContext,
        range: SourceRange,
    ) -> SymbolTableResult {
        if name == "__debug__" {
            match context {
                ExpressionContext::Store | ExpressionContext::Iter => {
                    return Err(SymbolTableError {
                        error: "cannot assign to __debug__".to_owned(),
                        location: Some(range),
                    });
                }
                ExpressionContext::Delete => {
                    return Err(SymbolTableError {
                        error: "cannot delete __debug__".to_owned(),
                        location: Some(range),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn register_name(
        &mut self,
        name: &str,
        role: SymbolUsage,
        range: SourceRange,
    ) -> SymbolTableResult {
        let location = Some(range);
        let scope_depth = self.tables.len();
        let table = self.tables.last_mut().unwrap();

        let name = mangle_name(self.class_name.as_deref(), name);

        // Checks for the symbol already present on this scope level:
        let symbol = if let Some(symbol) = table.symbols.get_mut(name.as_ref()) {
            let flags = &symbol.flags;

            // a comprehension inner loop cannot rebind a name already used
            // as a named-expression target, e.g.
            // [i for i in range(5) if (j := 0) for j in range(5)]
            if self.in_comp_inner_loop_target
                && flags.contains(SymbolFlags::ASSIGNED_IN_COMPREHENSION)
            {
                return Err(SymbolTableError {
                    error: format!(
                        "comprehension inner loop cannot rebind assignment expression target '{name}'"
                    ),
                    location,
                });
            }

            match role {
                SymbolUsage::Global if !symbol.is_global() => {
                    if flags.contains(SymbolFlags::PARAMETER) {
                        return Err(SymbolTableError {
                            error: format!("name '{name}' is parameter and global"),
                            location,
                        });
                    }
                    if flags.contains(SymbolFlags::REFERENCED) {
                        return Err(SymbolTableError {
                            error: format!("name '{name}' is used prior to global declaration"),
                            location,
                        });
                    }
                    if flags.contains(SymbolFlags::ANNOTATED) {
                        return Err(SymbolTableError {
                            error: format!("annotated name '{name}' can't be global"),
                            location,
                        });
                    }
                    if flags.contains(SymbolFlags::ASSIGNED) {
                        return Err(SymbolTableError {
                            error: format!(
                                "name '{name}' is assigned to before global declaration"
                            ),
                            location,
                        });
                    }
                }
                SymbolUsage::Nonlocal => {
                    if flags.contains(SymbolFlags::PARAMETER) {
                        return Err(SymbolTableError {
                            error: format!("name '{name}' is parameter and nonlocal"),
                            location,
                        });
                    }
                    if flags.contains(SymbolFlags::REFERENCED) {
                        return Err(SymbolTableError {
                            error: format!("name '{name}' is used prior to nonlocal declaration"),
                            location,
                        });
                    }
                    if flags.contains(SymbolFlags::ANNOTATED) {
                        return Err(SymbolTableError {
                            error: format!("annotated name '{name}' can't be nonlocal"),
                            location,
                        });
                    }
                    if flags.contains(SymbolFlags::ASSIGNED) {
                        return Err(SymbolTableError {
                            error: format!(
                                "name '{name}' is assigned to before nonlocal declaration"
                            ),
                            location,
                        });
                    }
                }
                _ => {}
            }
            symbol
        } else {
            // The symbol is not present on this scope level yet.
            match role {
                SymbolUsage::Nonlocal if scope_depth < 2 => {
                    return Err(SymbolTableError {
                        error: format!("cannot define nonlocal '{name}' at top level."),
                        location,
                    });
                }
                _ => {}
            }
            let symbol = Symbol::new(name.as_ref());
            table.symbols.entry(name.into_owned()).or_insert(symbol)
        };

        // Set the proper scope and flags on the symbol:
        let flags = &mut symbol.flags;
        match role {
            SymbolUsage::Nonlocal => {
                symbol.scope = SymbolScope::Free;
                flags.insert(SymbolFlags::NONLOCAL);
            }
            SymbolUsage::Imported => {
                flags.insert(SymbolFlags::ASSIGNED | SymbolFlags::IMPORTED);
            }
            SymbolUsage::Parameter => {
                flags.insert(SymbolFlags::PARAMETER);
                let name_str = symbol.name.clone();
                if !self.current_varnames.contains(&name_str) {
                    self.current_varnames.push(name_str);
                }
            }
            SymbolUsage::AnnotationParameter => {
                flags.insert(SymbolFlags::PARAMETER | SymbolFlags::ANNOTATED);
                let name_str = symbol.name.clone();
                if !self.current_varnames.contains(&name_str) {
                    self.current_varnames.push(name_str);
                }
            }
            SymbolUsage::AnnotationAssigned => {
                flags.insert(SymbolFlags::ASSIGNED | SymbolFlags::ANNOTATED);
            }
            SymbolUsage::Assigned => {
                flags.insert(SymbolFlags::ASSIGNED);
            }
            SymbolUsage::AssignedNamedExprInComprehension => {
                flags.insert(SymbolFlags::ASSIGNED | SymbolFlags::ASSIGNED_IN_COMPREHENSION);
            }
            SymbolUsage::Global => {
                symbol.scope = SymbolScope::GlobalExplicit;
                flags.insert(SymbolFlags::GLOBAL);
            }
            SymbolUsage::Used => {
                flags.insert(SymbolFlags::REFERENCED);
            }
            SymbolUsage::Iter => {
                flags.insert(SymbolFlags::ITER);
            }
            SymbolUsage::TypeParam => {
                flags.insert(SymbolFlags::ASSIGNED | SymbolFlags::TYPE_PARAM);
            }
        }

        // it is not allowed to assign to iterator variables by named
        // expressions
        if flags.contains(SymbolFlags::ITER)
            && flags.contains(SymbolFlags::ASSIGNED_IN_COMPREHENSION)
        {
            return Err(SymbolTableError {
                error: format!(
                    "assignment expression cannot rebind comprehension iteration variable '{}'",
                    symbol.name
                ),
                location,
            });
        }
        Ok(())
    }
}

pub(crate) fn mangle_name<'a>(class_name: Option<&str>, name: &'a str) -> Cow<'a, str> {
    let class_name = match class_name {
        Some(n) => n,
        None => return name.into(),
    };
    if !name.starts_with("__") || name.ends_with("__") || name.contains('.') {
        return name.into();
    }
    // strip leading underscores from the class name
    let class_name = class_name.trim_start_matches('_');
    let mut ret = String::with_capacity(1 + class_name.len() + name.len());
    ret.push('_');
    ret.push_str(class_name);
    ret.push_str(name);
    ret.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangling() {
        assert_eq!(mangle_name(Some("Spam"), "__eggs"), "_Spam__eggs");
        assert_eq!(mangle_name(Some("__Spam"), "__eggs"), "_Spam__eggs");
        assert_eq!(mangle_name(Some("Spam"), "__eggs__"), "__eggs__");
        assert_eq!(mangle_name(Some("Spam"), "eggs"), "eggs");
        assert_eq!(mangle_name(None, "__eggs"), "__eggs");
        assert_eq!(mangle_name(Some("Spam"), "__x.y"), "__x.y");
    }
}
