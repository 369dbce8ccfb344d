//! Render an expression back to source text.
//!
//! Used to stringify annotations under `from __future__ import annotations`
//! and to canonicalize mapping-pattern keys for duplicate detection. The
//! output is a normalized rendition, not the original text.

use core::fmt::{self, Display as _};
use krait_ast as ast;

mod precedence {
    macro_rules! precedence {
        ($($op:ident,)*) => {
            precedence!(@0, $($op,)*);
        };
        (@$i:expr, $op1:ident, $($op:ident,)*) => {
            pub const $op1: u8 = $i;
            precedence!(@$i + 1, $($op,)*);
        };
        (@$i:expr,) => {};
    }
    precedence!(
        TUPLE, TEST, OR, AND, NOT, CMP, // "EXPR" =
        BOR, BXOR, BAND, SHIFT, ARITH, TERM, FACTOR, POWER, AWAIT, ATOM,
    );
    pub const EXPR: u8 = BOR;
}

struct Unparser<'a, 'b> {
    f: &'b mut fmt::Formatter<'a>,
}

impl<'a, 'b> Unparser<'a, 'b> {
    const fn new(f: &'b mut fmt::Formatter<'a>) -> Self {
        Self { f }
    }

    fn p(&mut self, s: &str) -> fmt::Result {
        self.f.write_str(s)
    }

    fn p_id(&mut self, s: &ast::Identifier) -> fmt::Result {
        self.f.write_str(s.as_str())
    }

    fn p_if(&mut self, cond: bool, s: &str) -> fmt::Result {
        if cond {
            self.f.write_str(s)?;
        }
        Ok(())
    }

    fn p_delim(&mut self, first: &mut bool, s: &str) -> fmt::Result {
        self.p_if(!core::mem::take(first), s)
    }

    fn write_fmt(&mut self, f: fmt::Arguments<'_>) -> fmt::Result {
        self.f.write_fmt(f)
    }

    fn unparse_expr(&mut self, expr: &ast::Expr, level: u8) -> fmt::Result {
        macro_rules! group_if {
            ($lvl:expr, $body:block) => {{
                let group = level > $lvl;
                self.p_if(group, "(")?;
                let ret = $body;
                self.p_if(group, ")")?;
                ret
            }};
        }
        match expr {
            ast::Expr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let (op_str, prec) = match op {
                    ast::BoolOp::And => (" and ", precedence::AND),
                    ast::BoolOp::Or => (" or ", precedence::OR),
                };
                group_if!(prec, {
                    let mut first = true;
                    for value in values {
                        self.p_delim(&mut first, op_str)?;
                        self.unparse_expr(value, prec + 1)?;
                    }
                    Ok(())
                })
            }
            ast::Expr::Named(ast::ExprNamed { target, value, .. }) => {
                group_if!(precedence::TUPLE, {
                    self.unparse_expr(target, precedence::ATOM)?;
                    self.p(" := ")?;
                    self.unparse_expr(value, precedence::ATOM)
                })
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, op, right, .. }) => {
                let (op_str, prec, right_assoc) = match op {
                    ast::Operator::Add => (" + ", precedence::ARITH, false),
                    ast::Operator::Sub => (" - ", precedence::ARITH, false),
                    ast::Operator::Mult => (" * ", precedence::TERM, false),
                    ast::Operator::MatMult => (" @ ", precedence::TERM, false),
                    ast::Operator::Div => (" / ", precedence::TERM, false),
                    ast::Operator::Mod => (" % ", precedence::TERM, false),
                    ast::Operator::Pow => (" ** ", precedence::POWER, true),
                    ast::Operator::LShift => (" << ", precedence::SHIFT, false),
                    ast::Operator::RShift => (" >> ", precedence::SHIFT, false),
                    ast::Operator::BitOr => (" | ", precedence::BOR, false),
                    ast::Operator::BitXor => (" ^ ", precedence::BXOR, false),
                    ast::Operator::BitAnd => (" & ", precedence::BAND, false),
                    ast::Operator::FloorDiv => (" // ", precedence::TERM, false),
                };
                group_if!(prec, {
                    self.unparse_expr(left, prec + right_assoc as u8)?;
                    self.p(op_str)?;
                    self.unparse_expr(right, prec + !right_assoc as u8)
                })
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => {
                let (op_str, prec) = match op {
                    ast::UnaryOp::Invert => ("~", precedence::FACTOR),
                    ast::UnaryOp::Not => ("not ", precedence::NOT),
                    ast::UnaryOp::UAdd => ("+", precedence::FACTOR),
                    ast::UnaryOp::USub => ("-", precedence::FACTOR),
                };
                group_if!(prec, {
                    self.p(op_str)?;
                    self.unparse_expr(operand, prec)
                })
            }
            ast::Expr::Lambda(ast::ExprLambda { parameters, body, .. }) => {
                group_if!(precedence::TEST, {
                    if let Some(parameters) = parameters {
                        self.p("lambda ")?;
                        self.unparse_parameters(parameters)?;
                    } else {
                        self.p("lambda")?;
                    }
                    self.p(": ")?;
                    self.unparse_expr(body, precedence::TEST)
                })
            }
            ast::Expr::If(ast::ExprIf { test, body, orelse, .. }) => {
                group_if!(precedence::TEST, {
                    self.unparse_expr(body, precedence::TEST + 1)?;
                    self.p(" if ")?;
                    self.unparse_expr(test, precedence::TEST + 1)?;
                    self.p(" else ")?;
                    self.unparse_expr(orelse, precedence::TEST)
                })
            }
            ast::Expr::Dict(ast::ExprDict { items, .. }) => {
                self.p("{")?;
                let mut first = true;
                for item in items {
                    self.p_delim(&mut first, ", ")?;
                    if let Some(key) = &item.key {
                        self.unparse_expr(key, precedence::TEST)?;
                        self.p(": ")?;
                        self.unparse_expr(&item.value, precedence::TEST)?;
                    } else {
                        self.p("**")?;
                        self.unparse_expr(&item.value, precedence::EXPR)?;
                    }
                }
                self.p("}")
            }
            ast::Expr::Set(ast::ExprSet { elts, .. }) => {
                self.p("{")?;
                let mut first = true;
                for elt in elts {
                    self.p_delim(&mut first, ", ")?;
                    self.unparse_expr(elt, precedence::TEST)?;
                }
                self.p("}")
            }
            ast::Expr::ListComp(ast::ExprListComp { elt, generators, .. }) => {
                self.p("[")?;
                self.unparse_expr(elt, precedence::TEST)?;
                self.unparse_comp(generators)?;
                self.p("]")
            }
            ast::Expr::SetComp(ast::ExprSetComp { elt, generators, .. }) => {
                self.p("{")?;
                self.unparse_expr(elt, precedence::TEST)?;
                self.unparse_comp(generators)?;
                self.p("}")
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key, value, generators, ..
            }) => {
                self.p("{")?;
                self.unparse_expr(key, precedence::TEST)?;
                self.p(": ")?;
                self.unparse_expr(value, precedence::TEST)?;
                self.unparse_comp(generators)?;
                self.p("}")
            }
            ast::Expr::Generator(ast::ExprGenerator { elt, generators, .. }) => {
                self.p("(")?;
                self.unparse_expr(elt, precedence::TEST)?;
                self.unparse_comp(generators)?;
                self.p(")")
            }
            ast::Expr::Await(ast::ExprAwait { value, .. }) => {
                group_if!(precedence::AWAIT, {
                    self.p("await ")?;
                    self.unparse_expr(value, precedence::ATOM)
                })
            }
            ast::Expr::Yield(ast::ExprYield { value, .. }) => {
                group_if!(precedence::TUPLE, {
                    self.p("yield")?;
                    if let Some(value) = value {
                        self.p(" ")?;
                        self.unparse_expr(value, precedence::TEST)?;
                    }
                    Ok(())
                })
            }
            ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => {
                group_if!(precedence::TUPLE, {
                    self.p("yield from ")?;
                    self.unparse_expr(value, precedence::TEST)
                })
            }
            ast::Expr::Compare(ast::ExprCompare {
                left, ops, comparators, ..
            }) => {
                group_if!(precedence::CMP, {
                    self.unparse_expr(left, precedence::CMP + 1)?;
                    for (op, cmp) in ops.iter().zip(comparators) {
                        let op_str = match op {
                            ast::CmpOp::Eq => " == ",
                            ast::CmpOp::NotEq => " != ",
                            ast::CmpOp::Lt => " < ",
                            ast::CmpOp::LtE => " <= ",
                            ast::CmpOp::Gt => " > ",
                            ast::CmpOp::GtE => " >= ",
                            ast::CmpOp::Is => " is ",
                            ast::CmpOp::IsNot => " is not ",
                            ast::CmpOp::In => " in ",
                            ast::CmpOp::NotIn => " not in ",
                        };
                        self.p(op_str)?;
                        self.unparse_expr(cmp, precedence::CMP + 1)?;
                    }
                    Ok(())
                })
            }
            ast::Expr::Call(ast::ExprCall { func, arguments, .. }) => {
                self.unparse_expr(func, precedence::ATOM)?;
                self.p("(")?;
                let mut first = true;
                for arg in &arguments.args {
                    self.p_delim(&mut first, ", ")?;
                    self.unparse_expr(arg, precedence::TEST)?;
                }
                for kw in &arguments.keywords {
                    self.p_delim(&mut first, ", ")?;
                    if let Some(arg) = &kw.arg {
                        self.p_id(arg)?;
                        self.p("=")?;
                    } else {
                        self.p("**")?;
                    }
                    self.unparse_expr(&kw.value, precedence::TEST)?;
                }
                self.p(")")
            }
            ast::Expr::FString(fstring) => self.unparse_fstring(fstring),
            ast::Expr::StringLiteral(ast::ExprStringLiteral { value, .. }) => {
                write!(self, "{value:?}")
            }
            ast::Expr::BytesLiteral(ast::ExprBytesLiteral { value, .. }) => {
                write!(self, "b\"{}\"", value.escape_ascii())
            }
            ast::Expr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => match value {
                ast::Number::Int(value) => write!(self, "{value}"),
                ast::Number::Float(value) => write!(self, "{value:?}"),
                ast::Number::Complex { real, imag } => {
                    if *real == 0.0 {
                        write!(self, "{imag:?}j")
                    } else {
                        write!(self, "({real:?}{imag:+?}j)")
                    }
                }
            },
            ast::Expr::BooleanLiteral(b) => self.p(if b.value { "True" } else { "False" }),
            ast::Expr::NoneLiteral(_) => self.p("None"),
            ast::Expr::EllipsisLiteral(_) => self.p("..."),
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.unparse_expr(value, precedence::ATOM)?;
                let period = if matches!(
                    value.as_ref(),
                    ast::Expr::NumberLiteral(ast::ExprNumberLiteral {
                        value: ast::Number::Int(_),
                        ..
                    })
                ) {
                    " ."
                } else {
                    "."
                };
                self.p(period)?;
                self.p_id(attr)
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.unparse_expr(value, precedence::ATOM)?;
                self.p("[")?;
                self.unparse_expr(slice, precedence::TUPLE)?;
                self.p("]")
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => {
                self.p("*")?;
                self.unparse_expr(value, precedence::EXPR)
            }
            ast::Expr::Name(ast::ExprName { id, .. }) => self.p(id),
            ast::Expr::List(ast::ExprList { elts, .. }) => {
                self.p("[")?;
                let mut first = true;
                for elt in elts {
                    self.p_delim(&mut first, ", ")?;
                    self.unparse_expr(elt, precedence::TEST)?;
                }
                self.p("]")
            }
            ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                if elts.is_empty() {
                    self.p("()")
                } else {
                    group_if!(precedence::TUPLE, {
                        let mut first = true;
                        for elt in elts {
                            self.p_delim(&mut first, ", ")?;
                            self.unparse_expr(elt, precedence::TEST)?;
                        }
                        self.p_if(elts.len() == 1, ",")
                    })
                }
            }
            ast::Expr::Slice(ast::ExprSlice { lower, upper, step, .. }) => {
                if let Some(lower) = lower {
                    self.unparse_expr(lower, precedence::TEST)?;
                }
                self.p(":")?;
                if let Some(upper) = upper {
                    self.unparse_expr(upper, precedence::TEST)?;
                }
                if let Some(step) = step {
                    self.p(":")?;
                    self.unparse_expr(step, precedence::TEST)?;
                }
                Ok(())
            }
        }
    }

    fn unparse_comp(&mut self, generators: &[ast::Comprehension]) -> fmt::Result {
        for comp in generators {
            self.p(if comp.is_async {
                " async for "
            } else {
                " for "
            })?;
            self.unparse_expr(&comp.target, precedence::TUPLE + 1)?;
            self.p(" in ")?;
            self.unparse_expr(&comp.iter, precedence::TEST + 1)?;
            for cond in &comp.ifs {
                self.p(" if ")?;
                self.unparse_expr(cond, precedence::TEST + 1)?;
            }
        }
        Ok(())
    }

    fn unparse_parameters(&mut self, parameters: &ast::Parameters) -> fmt::Result {
        let mut first = true;
        for (i, param) in parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .enumerate()
        {
            self.p_delim(&mut first, ", ")?;
            self.unparse_parameter_with_default(param)?;
            self.p_if(i + 1 == parameters.posonlyargs.len(), ", /")?;
        }
        if parameters.vararg.is_some() || !parameters.kwonlyargs.is_empty() {
            self.p_delim(&mut first, ", ")?;
            self.p("*")?;
        }
        if let Some(vararg) = &parameters.vararg {
            self.unparse_parameter(vararg)?;
        }
        for kwarg in &parameters.kwonlyargs {
            self.p_delim(&mut first, ", ")?;
            self.unparse_parameter_with_default(kwarg)?;
        }
        if let Some(kwarg) = &parameters.kwarg {
            self.p_delim(&mut first, ", ")?;
            self.p("**")?;
            self.unparse_parameter(kwarg)?;
        }
        Ok(())
    }

    fn unparse_parameter(&mut self, parameter: &ast::Parameter) -> fmt::Result {
        self.p_id(&parameter.name)?;
        if let Some(annotation) = &parameter.annotation {
            self.p(": ")?;
            self.unparse_expr(annotation, precedence::TEST)?;
        }
        Ok(())
    }

    fn unparse_parameter_with_default(
        &mut self,
        parameter: &ast::ParameterWithDefault,
    ) -> fmt::Result {
        self.unparse_parameter(&parameter.parameter)?;
        if let Some(default) = &parameter.default {
            self.p("=")?;
            self.unparse_expr(default, precedence::TEST)?;
        }
        Ok(())
    }

    fn unparse_fstring(&mut self, fstring: &ast::ExprFString) -> fmt::Result {
        self.p("f\"")?;
        self.unparse_fstring_elements(&fstring.elements)?;
        self.p("\"")
    }

    fn unparse_fstring_elements(&mut self, elements: &[ast::FStringElement]) -> fmt::Result {
        for element in elements {
            match element {
                ast::FStringElement::Literal(lit) => self.p(&lit.value)?,
                ast::FStringElement::Interpolation(interp) => {
                    self.p("{")?;
                    self.unparse_expr(&interp.expression, precedence::TEST + 1)?;
                    match interp.conversion {
                        ast::ConversionFlag::None => {}
                        ast::ConversionFlag::Str => self.p("!s")?,
                        ast::ConversionFlag::Repr => self.p("!r")?,
                        ast::ConversionFlag::Ascii => self.p("!a")?,
                    }
                    if let Some(spec) = &interp.format_spec {
                        self.p(":")?;
                        self.unparse_fstring_elements(spec)?;
                    }
                    self.p("}")?;
                }
            }
        }
        Ok(())
    }
}

/// `Display` adapter rendering an expression as normalized source.
pub struct UnparseExpr<'a> {
    expr: &'a ast::Expr,
}

impl<'a> UnparseExpr<'a> {
    pub const fn new(expr: &'a ast::Expr) -> Self {
        Self { expr }
    }
}

impl fmt::Display for UnparseExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Unparser::new(f).unparse_expr(self.expr, precedence::TEST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_ast::*;
    use krait_compiler_core::SourceRange;

    const R: SourceRange = SourceRange::NONE;

    fn name(id: &str) -> Expr {
        Expr::Name(ExprName {
            id: id.to_owned(),
            ctx: ExprContext::Load,
            range: R,
        })
    }

    #[test]
    fn subscripted_generic() {
        let expr = Expr::Subscript(ExprSubscript {
            value: Box::new(name("dict")),
            slice: Box::new(Expr::Tuple(ExprTuple {
                elts: vec![name("str"), name("int")],
                ctx: ExprContext::Load,
                range: R,
            })),
            ctx: ExprContext::Load,
            range: R,
        });
        assert_eq!(UnparseExpr::new(&expr).to_string(), "dict[str, int]");
    }

    #[test]
    fn binary_operator_precedence() {
        let inner = Expr::BinOp(ExprBinOp {
            left: Box::new(name("a")),
            op: Operator::Add,
            right: Box::new(name("b")),
            range: R,
        });
        let expr = Expr::BinOp(ExprBinOp {
            left: Box::new(inner),
            op: Operator::Mult,
            right: Box::new(name("c")),
            range: R,
        });
        assert_eq!(UnparseExpr::new(&expr).to_string(), "(a + b) * c");
    }

    #[test]
    fn union_annotation() {
        let expr = Expr::BinOp(ExprBinOp {
            left: Box::new(name("int")),
            op: Operator::BitOr,
            right: Box::new(Expr::NoneLiteral(ExprNoneLiteral { range: R })),
            range: R,
        });
        assert_eq!(UnparseExpr::new(&expr).to_string(), "int | None");
    }
}
