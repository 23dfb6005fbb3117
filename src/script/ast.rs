//! # Script Grammar — AST Types
//!
//! Surface syntax produced by [`super::parser`] before symbol-table
//! construction. A generator rule's left-hand side is a list
//! of [`PatternElem`]; its right-hand side is a subtree handle
//! ("world"). A condition is a postfix token stream built from
//! [`CondOp`]. A driver-output rule names a backend module, its argument
//! strings, and the variable list it emits.

use serde::{Deserialize, Serialize};

use crate::value::ScriptValue;

/// One rdn fragment of a generator's left-hand pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatternElem {
    /// `attr=value` — a constant match against an rdn attribute.
    Constant { attr: String, value: ScriptValue },
    /// `attr:var` — binds `var` to the rdn attribute's value.
    Bind { attr: String, var: String },
    /// `@var` — binds `var` to the whole current dn node.
    AtNode { var: String },
    /// `DCList=var` — binds sequences of `dc=` rdns into a DNS name.
    DcList { var: String },
    /// `SkipOneLevel=var` — matches exactly one rdn of any class.
    SkipOneLevel { var: String },
    /// `SkipSubtree=var` — matches zero or more rdns of any class.
    SkipSubtree { var: String },
}

impl PatternElem {
    pub fn bound_var(&self) -> Option<&str> {
        match self {
            PatternElem::Bind { var, .. }
            | PatternElem::AtNode { var }
            | PatternElem::DcList { var }
            | PatternElem::SkipOneLevel { var }
            | PatternElem::SkipSubtree { var } => Some(var.as_str()),
            PatternElem::Constant { .. } => None,
        }
    }
}

/// A term inside a condition expression: either a variable reference or a
/// constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Var(String),
    Const(ScriptValue),
}

/// Comparison operators usable inside a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        }
    }
}

/// One token of a condition's postfix representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CondToken {
    Operand(Term),
    Cmp(CmpOp),
    Not,
    /// n-ary AND/OR pop `arity` operands off the evaluation stack.
    And(usize),
    Or(usize),
    True,
    False,
}

/// A parsed generator rule, before symbol-table registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorRule {
    pub patterns: Vec<PatternElem>,
    pub source: String,
    pub weight: f64,
    pub line: u32,
}

/// A parsed condition rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub postfix: Vec<CondToken>,
    pub weight: f64,
    pub line: u32,
}

/// A parsed driver-output rule: `module(args) <- var1, var2, ...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRule {
    pub module: String,
    pub args: Vec<String>,
    pub output_vars: Vec<String>,
    pub weight: f64,
    pub line: u32,
}

/// One top-level rule as recognized by the parser, before it is filed
/// into the appropriate symbol table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    Generator(GeneratorRule),
    Condition(ConditionRule),
    Driver(DriverRule),
}
