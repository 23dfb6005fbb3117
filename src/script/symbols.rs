//! # Symbol Tables
//!
//! The four tables the parser populates: variables,
//! generators, conditions, driver-outputs, plus the cross-reference sets
//! between them that the semantic analyzer fills in.
//!
//! Variable partitions are tracked with a union-find discipline: two
//! variables end up in the same partition when some condition mentions
//! both of them. The partition representative is always the minimum
//! member index, a deterministic tie-break.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ast::{CondToken, PatternElem};
use super::binding::BindOp;
use crate::value::ScriptValue;

macro_rules! index_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

index_type!(VarIdx);
index_type!(GenIdx);
index_type!(CondIdx);
index_type!(DrvIdx);

/// Variable kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    Variable,
    Parameter,
    Constant,
    AttributeType,
    DriverName,
    Binding,
}

/// A named slot bound by generators, referenced by conditions, emitted by
/// drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
    pub value: Option<ScriptValue>,
    pub bound_by: HashSet<GenIdx>,
    pub referenced_by: HashSet<CondIdx>,
    pub emitted_by: HashSet<DrvIdx>,
}

impl Variable {
    fn new(name: String, kind: VarKind) -> Self {
        Variable {
            name,
            kind,
            value: None,
            bound_by: HashSet::new(),
            referenced_by: HashSet::new(),
            emitted_by: HashSet::new(),
        }
    }
}

/// A generator rule after table registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generator {
    pub source: String,
    pub bound_vars: Vec<VarIdx>,
    pub feeds_drivers: HashSet<DrvIdx>,
    pub weight: f64,
    pub line_hash: u32,
    pub cogenerator: bool,
    pub patterns: Vec<PatternElem>,
    pub bytecode: Vec<BindOp>,
    pub upstream_filter: String,
}

/// A condition rule after table registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub postfix: Vec<CondToken>,
    pub weight: f64,
    pub line_hash: u32,
    pub vars: HashSet<VarIdx>,
}

/// A driver-output rule after table registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub module: String,
    pub args: Vec<String>,
    pub output_vars: Vec<VarIdx>,
    pub explicit_guards: HashSet<VarIdx>,
    pub implicit_guards: HashSet<VarIdx>,
    pub relevant_vars: HashSet<VarIdx>,
    pub contributing_generators: HashSet<GenIdx>,
    pub applicable_conditions: HashSet<CondIdx>,
    pub weight: f64,
    pub line_hash: u32,
}

/// Diagnostic raised by the parser or the analyzer's soft
/// invariant checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: u32,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    Syntax,
    UndefinedReference,
    DuplicateBinding,
    UnboundVariable,
    MultiplyBoundVariable,
    ConditionWithoutVariable,
    DriverWithoutRelevantVariable,
}

/// The four symbol tables plus the union-find partition structure over
/// variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTables {
    pub variables: Vec<Variable>,
    pub var_index: std::collections::HashMap<String, VarIdx>,
    pub generators: Vec<Generator>,
    pub conditions: Vec<Condition>,
    pub drivers: Vec<Driver>,
    /// Union-find parent pointers, one per variable.
    partition_parent: Vec<usize>,
    pub diagnostics: Vec<Diagnostic>,
    /// Cheapest (minimum-weight) generator binding each variable, filled
    /// in by the semantic analyzer.
    pub cheapest_generator: std::collections::HashMap<VarIdx, GenIdx>,
}

impl SymbolTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable by name, creating it (as a plain `Variable`) if
    /// it has not been seen before.
    pub fn intern_var(&mut self, name: &str) -> VarIdx {
        if let Some(&idx) = self.var_index.get(name) {
            return idx;
        }
        let idx = VarIdx(self.variables.len());
        self.variables.push(Variable::new(name.to_string(), VarKind::Variable));
        self.var_index.insert(name.to_string(), idx);
        self.partition_parent.push(idx.0);
        idx
    }

    pub fn var(&self, idx: VarIdx) -> &Variable {
        &self.variables[idx.0]
    }

    pub fn var_mut(&mut self, idx: VarIdx) -> &mut Variable {
        &mut self.variables[idx.0]
    }

    pub fn add_generator(&mut self, gen: Generator) -> GenIdx {
        let idx = GenIdx(self.generators.len());
        for &v in &gen.bound_vars {
            self.var_mut(v).bound_by.insert(idx);
        }
        self.generators.push(gen);
        idx
    }

    pub fn add_condition(&mut self, cond: Condition) -> CondIdx {
        let idx = CondIdx(self.conditions.len());
        for &v in &cond.vars {
            self.var_mut(v).referenced_by.insert(idx);
        }
        self.conditions.push(cond);
        idx
    }

    pub fn add_driver(&mut self, drv: Driver) -> DrvIdx {
        let idx = DrvIdx(self.drivers.len());
        for &v in &drv.output_vars {
            self.var_mut(v).emitted_by.insert(idx);
        }
        self.drivers.push(drv);
        idx
    }

    // ---- union-find over variable partitions ----

    /// Find the representative (minimum-index member) of `v`'s partition,
    /// compressing the path as it goes.
    pub fn partition_find(&mut self, v: VarIdx) -> usize {
        let mut root = v.0;
        while self.partition_parent[root] != root {
            root = self.partition_parent[root];
        }
        // Path compression.
        let mut cur = v.0;
        while self.partition_parent[cur] != root {
            let next = self.partition_parent[cur];
            self.partition_parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Union the partitions of `a` and `b`; the representative is always
    /// the smaller index.
    pub fn partition_union(&mut self, a: VarIdx, b: VarIdx) {
        let ra = self.partition_find(a);
        let rb = self.partition_find(b);
        if ra == rb {
            return;
        }
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.partition_parent[hi] = lo;
    }

    /// All variables sharing `v`'s partition, including `v` itself.
    pub fn partition_members(&mut self, v: VarIdx) -> Vec<VarIdx> {
        let root = self.partition_find(v);
        (0..self.variables.len())
            .filter(|&i| self.partition_find(VarIdx(i)) == root)
            .map(VarIdx)
            .collect()
    }

    pub fn warn(&mut self, line: u32, kind: DiagnosticKind, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            line,
            kind,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_var_is_idempotent() {
        let mut t = SymbolTables::new();
        let a = t.intern_var("x");
        let b = t.intern_var("x");
        assert_eq!(a, b);
        assert_eq!(t.variables.len(), 1);
    }

    #[test]
    fn partition_union_picks_min_index_representative() {
        let mut t = SymbolTables::new();
        let x = t.intern_var("x");
        let y = t.intern_var("y");
        let z = t.intern_var("z");
        t.partition_union(y, z);
        t.partition_union(x, z);
        let root_x = t.partition_find(x);
        let root_y = t.partition_find(y);
        let root_z = t.partition_find(z);
        assert_eq!(root_x, root_y);
        assert_eq!(root_y, root_z);
        assert_eq!(root_x, x.0.min(y.0).min(z.0));
    }
}
