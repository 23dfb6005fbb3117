//! # Binding Decoder
//!
//! Compiles a generator's left-hand pattern fragments into a linear
//! bytecode program that walks a directory `dn` component by component,
//! binding named variables to attribute values along the way.
//!
//! The program is a plain `Vec<BindOp>` of a typed enum rather than a
//! packed opcode stream: there is no cross-language ABI boundary to
//! cross for this artifact (unlike the backend ABI in
//! [`crate::backend::abi`], which genuinely is byte-oriented), so a
//! typed instruction stream is the idiomatic choice.

use serde::{Deserialize, Serialize};

use super::ast::PatternElem;
use super::symbols::{SymbolTables, VarIdx, VarKind};
use crate::value::ScriptValue;

/// What a structural bytecode step acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subject {
    Attribute,
    RdnComponent,
    WholeDn,
}

/// An operand to a bytecode step: a constant, or a reference to a
/// previously- (or newly-) bound variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Var(VarIdx),
    Const(ScriptValue),
}

/// One instruction of a compiled binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BindOp {
    /// Descend one rdn.
    Down,
    /// The current node must be the generator's target object.
    Object,
    /// The subject must exist.
    Have { subject: Subject, var: Operand },
    /// The subject's value must equal `rhs` (a constant, or a variable
    /// bound on an earlier step — second encounter becomes a comparison).
    Cmp {
        subject: Subject,
        lhs: Operand,
        rhs: Operand,
    },
    /// For each value of the attribute, produce a fork binding `bind_var`.
    Bind {
        subject: Subject,
        attr: Operand,
        bind_var: VarIdx,
    },
    /// Bind zero-or-more/one/exactly-one rdn(s) as a single DN-valued
    /// variable (`DCList=`, `SkipOneLevel=`, `SkipSubtree=`).
    SkipOneLevel { var: VarIdx },
    SkipSubtree { var: VarIdx },
    DcList { var: VarIdx },
    /// Terminate: the current variable binding produces one fork.
    Done,
}

/// Result of compiling a generator's pattern list: the bytecode program,
/// plus the upstream filter expression built from constant comparisons.
pub struct CompiledBinding {
    pub bytecode: Vec<BindOp>,
    pub upstream_filter: String,
}

/// Compile a generator's pattern fragments (in declaration order, outermost
/// rdn first) into bytecode, interning any newly-seen attribute-type and
/// bind variables into `symbols`.
pub fn compile_patterns(patterns: &[PatternElem], symbols: &mut SymbolTables) -> CompiledBinding {
    let mut bytecode = Vec::new();
    let mut filter_parts = Vec::new();

    for pattern in patterns {
        bytecode.push(BindOp::Down);
        match pattern {
            PatternElem::Constant { attr, value } => {
                let attr_var = intern_attr(symbols, attr);
                bytecode.push(BindOp::Cmp {
                    subject: Subject::RdnComponent,
                    lhs: Operand::Var(attr_var),
                    rhs: Operand::Const(value.clone()),
                });
                filter_parts.push(format!("{attr}={}", strip_quotes(&value.to_string())));
            }
            PatternElem::Bind { attr, var } => {
                let attr_var = intern_attr(symbols, attr);
                let bind_var = symbols.intern_var(var);
                bytecode.push(BindOp::Bind {
                    subject: Subject::RdnComponent,
                    attr: Operand::Var(attr_var),
                    bind_var,
                });
            }
            PatternElem::AtNode { var } => {
                let bind_var = symbols.intern_var(var);
                bytecode.push(BindOp::Bind {
                    subject: Subject::WholeDn,
                    attr: Operand::Var(bind_var),
                    bind_var,
                });
            }
            PatternElem::DcList { var } => {
                let bind_var = symbols.intern_var(var);
                bytecode.pop(); // DcList consumes its own rdn sequence.
                bytecode.push(BindOp::DcList { var: bind_var });
            }
            PatternElem::SkipOneLevel { var } => {
                let bind_var = symbols.intern_var(var);
                bytecode.pop();
                bytecode.push(BindOp::SkipOneLevel { var: bind_var });
            }
            PatternElem::SkipSubtree { var } => {
                let bind_var = symbols.intern_var(var);
                bytecode.pop();
                bytecode.push(BindOp::SkipSubtree { var: bind_var });
            }
        }
    }
    bytecode.push(BindOp::Object);
    bytecode.push(BindOp::Done);

    CompiledBinding {
        bytecode,
        upstream_filter: filter_parts.join(","),
    }
}

fn intern_attr(symbols: &mut SymbolTables, attr: &str) -> VarIdx {
    let idx = symbols.intern_var(&format!("@attr:{attr}"));
    symbols.var_mut(idx).kind = VarKind::AttributeType;
    idx
}

/// Strip surrounding quotes from a quoted string constant's display form.
fn strip_quotes(s: &str) -> String {
    s.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_pattern_contributes_to_upstream_filter() {
        let mut symbols = SymbolTables::new();
        let patterns = vec![PatternElem::Constant {
            attr: "O".to_string(),
            value: ScriptValue::Str("Example Corp".to_string()),
        }];
        let compiled = compile_patterns(&patterns, &mut symbols);
        assert_eq!(compiled.upstream_filter, "O=Example Corp");
        assert!(matches!(compiled.bytecode.last(), Some(BindOp::Done)));
    }

    #[test]
    fn bind_pattern_does_not_add_to_filter() {
        let mut symbols = SymbolTables::new();
        let patterns = vec![PatternElem::Bind {
            attr: "Mail".to_string(),
            var: "x".to_string(),
        }];
        let compiled = compile_patterns(&patterns, &mut symbols);
        assert!(compiled.upstream_filter.is_empty());
        assert!(symbols.var_index.contains_key("x"));
    }
}
