//! # Semantic Analyzer
//!
//! Executes the eight analysis phases, in order, as pure transformations
//! over the already-parsed symbol tables. Each phase is a free function
//! so the fixed-point phases can be tested in isolation.
//!
//! Invariant violations are recorded as
//! diagnostics on [`SymbolTables`] rather than raised; the controller may
//! still reach *Ready* with warnings pending.

use std::collections::HashSet;

use super::ast::{CondToken, Term};
use super::symbols::{DiagnosticKind, DrvIdx, GenIdx, SymbolTables, VarIdx};

/// Run all eight analysis phases over `symbols` in place.
pub fn analyze(symbols: &mut SymbolTables) {
    partition_induction(symbols);
    // Phase 2 (materialization) falls out of the union-find structure
    // itself; nothing further to compute.
    driver_relevant_closure(symbols);
    driver_condition_attachment(symbols);
    driver_generator_attachment(symbols);
    cogeneration_flags(symbols);
    implicit_guards(symbols);
    cheapest_generators(symbols);
    check_invariants(symbols);
}

/// Phase 1: union the partitions of every variable a condition mentions.
fn partition_induction(symbols: &mut SymbolTables) {
    for cond_idx in 0..symbols.conditions.len() {
        let vars: Vec<VarIdx> = symbols.conditions[cond_idx].vars.iter().copied().collect();
        for pair in vars.windows(2) {
            symbols.partition_union(pair[0], pair[1]);
        }
        // windows(2) misses all-but-consecutive pairs when arity > 2;
        // union everything against the first variable to guarantee a
        // single partition for the whole condition.
        if let Some(&first) = vars.first() {
            for &other in &vars {
                symbols.partition_union(first, other);
            }
        }
    }
}

/// Phase 3: fixed-point closure of each driver's relevant-variable set.
fn driver_relevant_closure(symbols: &mut SymbolTables) {
    for drv_idx in 0..symbols.drivers.len() {
        let mut relevant: HashSet<VarIdx> = symbols.drivers[drv_idx]
            .output_vars
            .iter()
            .copied()
            .collect();
        relevant.extend(symbols.drivers[drv_idx].explicit_guards.iter().copied());

        loop {
            let mut grew = false;

            // Add every variable co-partitioned with an already-included
            // variable (needed for condition evaluation).
            let current: Vec<VarIdx> = relevant.iter().copied().collect();
            for v in current {
                for member in symbols.partition_members(v) {
                    if relevant.insert(member) {
                        grew = true;
                    }
                }
            }

            // Add every variable co-generated by a generator that binds
            // a variable already in the relevant set.
            let current: Vec<VarIdx> = relevant.iter().copied().collect();
            for v in &current {
                let bound_by: Vec<GenIdx> = symbols.var(*v).bound_by.iter().copied().collect();
                for gen_idx in bound_by {
                    for &co_var in &symbols.generators[gen_idx.index()].bound_vars {
                        if relevant.insert(co_var) {
                            grew = true;
                        }
                    }
                }
            }

            if !grew {
                break;
            }
        }

        symbols.drivers[drv_idx].relevant_vars = relevant;
    }
}

/// Phase 4: a driver's condition set is the union of conditions mentioned
/// by any of its relevant variables.
fn driver_condition_attachment(symbols: &mut SymbolTables) {
    for drv_idx in 0..symbols.drivers.len() {
        let mut conditions = HashSet::new();
        for &v in &symbols.drivers[drv_idx].relevant_vars {
            conditions.extend(symbols.var(v).referenced_by.iter().copied());
        }
        symbols.drivers[drv_idx].applicable_conditions = conditions;
    }
}

/// Phase 5: a generator contributes to a driver iff its variables
/// intersect the driver's relevant set; record both directions.
fn driver_generator_attachment(symbols: &mut SymbolTables) {
    for drv_idx in 0..symbols.drivers.len() {
        let relevant = symbols.drivers[drv_idx].relevant_vars.clone();
        let mut contributing = HashSet::new();
        for (gen_idx, gen) in symbols.generators.iter().enumerate() {
            if gen.bound_vars.iter().any(|v| relevant.contains(v)) {
                contributing.insert(GenIdx(gen_idx));
            }
        }
        symbols.drivers[drv_idx].contributing_generators = contributing.clone();
        for gen_idx in contributing {
            symbols.generators[gen_idx.index()]
                .feeds_drivers
                .insert(DrvIdx(drv_idx));
        }
    }
}

/// Phase 6: a generator is a cogenerator iff some driver uses two or more
/// generators and includes it.
fn cogeneration_flags(symbols: &mut SymbolTables) {
    let mut cogen = vec![false; symbols.generators.len()];
    for drv in &symbols.drivers {
        if drv.contributing_generators.len() >= 2 {
            for gen_idx in &drv.contributing_generators {
                cogen[gen_idx.index()] = true;
            }
        }
    }
    for (gen, flag) in symbols.generators.iter_mut().zip(cogen) {
        gen.cogenerator = flag;
    }
}

/// Phase 7: `implicit_guards := relevant − produced − explicit_guards`.
fn implicit_guards(symbols: &mut SymbolTables) {
    for drv_idx in 0..symbols.drivers.len() {
        let drv = &symbols.drivers[drv_idx];
        let produced: HashSet<VarIdx> = drv.output_vars.iter().copied().collect();
        let implicit: HashSet<VarIdx> = drv
            .relevant_vars
            .iter()
            .filter(|v| !produced.contains(v) && !drv.explicit_guards.contains(v))
            .copied()
            .collect();
        symbols.drivers[drv_idx].implicit_guards = implicit;
    }
}

/// Phase 8: for each variable, the minimum-weight binding generator;
/// ties broken by generator index.
fn cheapest_generators(symbols: &mut SymbolTables) {
    let mut cheapest = std::collections::HashMap::new();
    for var_idx in 0..symbols.variables.len() {
        let v = VarIdx(var_idx);
        let mut best: Option<GenIdx> = None;
        for &gen_idx in &symbols.var(v).bound_by {
            let weight = symbols.generators[gen_idx.index()].weight;
            best = Some(match best {
                None => gen_idx,
                Some(cur) => {
                    let cur_weight = symbols.generators[cur.index()].weight;
                    if weight < cur_weight || (weight == cur_weight && gen_idx.index() < cur.index()) {
                        gen_idx
                    } else {
                        cur
                    }
                }
            });
        }
        if let Some(g) = best {
            cheapest.insert(v, g);
        }
    }
    symbols.cheapest_generator = cheapest;
}

/// Soft invariant checks: emit warnings, never abort.
fn check_invariants(symbols: &mut SymbolTables) {
    for var_idx in 0..symbols.variables.len() {
        let v = VarIdx(var_idx);
        let name = symbols.var(v).name.clone();
        let bound_count = symbols.var(v).bound_by.len();
        if symbols.var(v).kind == super::symbols::VarKind::Variable {
            if bound_count == 0 {
                symbols.warn(0, DiagnosticKind::UnboundVariable, format!("variable '{name}' is never bound"));
            } else if bound_count > 1 {
                symbols.warn(
                    0,
                    DiagnosticKind::MultiplyBoundVariable,
                    format!("variable '{name}' is bound by {bound_count} generators"),
                );
            }
        }
    }

    for (idx, cond) in symbols.conditions.iter().enumerate() {
        if cond.vars.is_empty() {
            symbols.diagnostics.push(super::symbols::Diagnostic {
                line: cond.line_hash,
                kind: DiagnosticKind::ConditionWithoutVariable,
                message: format!("condition #{idx} references no variable"),
            });
        }
    }

    for (idx, drv) in symbols.drivers.iter().enumerate() {
        let has_regular = drv.relevant_vars.iter().any(|v| {
            symbols.variables[v.index()].kind == super::symbols::VarKind::Variable
        });
        if !has_regular {
            symbols.diagnostics.push(super::symbols::Diagnostic {
                line: drv.line_hash,
                kind: DiagnosticKind::DriverWithoutRelevantVariable,
                message: format!("driver-output #{idx} ('{}') has no relevant regular variable", drv.module),
            });
        }
    }
}

/// Evaluate whether a driver's attached condition holds for a row of
/// already-resolved values, used by tests and by the translator's
/// condition-compilation sanity checks. Real evaluation at runtime
/// happens inside the prepared SQL statement; this
/// helper mirrors the same postfix semantics in-process.
pub fn eval_condition_postfix(tokens: &[CondToken], resolve: impl Fn(&str) -> crate::value::ScriptValue) -> bool {
    let mut stack: Vec<Term> = Vec::new();
    let mut bools: Vec<bool> = Vec::new();

    for tok in tokens {
        match tok {
            CondToken::Operand(t) => stack.push(t.clone()),
            CondToken::True => bools.push(true),
            CondToken::False => bools.push(false),
            CondToken::Cmp(op) => {
                let rhs = stack.pop().expect("well-formed postfix");
                let lhs = stack.pop().expect("well-formed postfix");
                let lv = resolve_term(&lhs, &resolve);
                let rv = resolve_term(&rhs, &resolve);
                bools.push(compare(op, &lv, &rv));
            }
            CondToken::Not => {
                let b = bools.pop().expect("well-formed postfix");
                bools.push(!b);
            }
            CondToken::And(n) => {
                let mut result = true;
                for _ in 0..*n {
                    result &= bools.pop().expect("well-formed postfix");
                }
                bools.push(result);
            }
            CondToken::Or(n) => {
                let mut result = false;
                for _ in 0..*n {
                    result |= bools.pop().expect("well-formed postfix");
                }
                bools.push(result);
            }
        }
    }
    bools.pop().unwrap_or(true)
}

fn resolve_term(term: &Term, resolve: &impl Fn(&str) -> crate::value::ScriptValue) -> crate::value::ScriptValue {
    match term {
        Term::Var(name) => resolve(name),
        Term::Const(v) => v.clone(),
    }
}

fn compare(op: &super::ast::CmpOp, lhs: &crate::value::ScriptValue, rhs: &crate::value::ScriptValue) -> bool {
    use super::ast::CmpOp::*;
    use crate::value::ScriptValue::*;
    let ord = match (lhs, rhs) {
        (Int(a), Int(b)) => a.partial_cmp(b),
        (Float(a), Float(b)) => a.partial_cmp(b),
        (Str(a), Str(b)) => a.partial_cmp(b),
        (Bytes(a), Bytes(b)) => a.partial_cmp(b),
        _ => lhs.to_bytes().partial_cmp(&rhs.to_bytes()),
    };
    match (op, ord) {
        (Eq, Some(o)) => o == std::cmp::Ordering::Equal,
        (Ne, Some(o)) => o != std::cmp::Ordering::Equal,
        (Lt, Some(o)) => o == std::cmp::Ordering::Less,
        (Gt, Some(o)) => o == std::cmp::Ordering::Greater,
        (Le, Some(o)) => o != std::cmp::Ordering::Greater,
        (Ge, Some(o)) => o != std::cmp::Ordering::Less,
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::Parser;

    fn build(script: &str) -> SymbolTables {
        let mut p = Parser::new();
        p.parse_buffer(script).unwrap();
        let (mut symbols, _) = p.finalize();
        analyze(&mut symbols);
        symbols
    }

    #[test]
    fn condition_unites_variable_partitions() {
        let symbols = build("A:x, B:y <- world\nx = y\nout(x) <- x\n");
        let mut symbols = symbols;
        let x = *symbols.var_index.get("x").unwrap();
        let y = *symbols.var_index.get("y").unwrap();
        assert_eq!(symbols.partition_find(x), symbols.partition_find(y));
    }

    #[test]
    fn driver_relevant_set_includes_cogenerator_variables() {
        let symbols = build("Mail:x <- world\nCn:x <- world\nout(x) <- x\n");
        let drv = &symbols.drivers[0];
        assert_eq!(drv.contributing_generators.len(), 2);
        assert!(drv.relevant_vars.contains(symbols.var_index.get("x").unwrap()));
    }

    #[test]
    fn cogeneration_flag_set_when_driver_uses_two_generators() {
        let symbols = build("Mail:x <- world\nCn:x <- world\nout(x) <- x\n");
        assert!(symbols.generators[0].cogenerator);
        assert!(symbols.generators[1].cogenerator);
    }

    #[test]
    fn cheapest_generator_breaks_ties_by_index() {
        let symbols = build("Mail:x <- world\nCn:x <- world *100\nout(x) <- x\n");
        let x = *symbols.var_index.get("x").unwrap();
        let cheapest = symbols.cheapest_generator.get(&x).unwrap();
        assert_eq!(cheapest.index(), 0);
    }
}
