//! # Change Router
//!
//! Lowers `add_entry`/`remove_entry` upstream events into generator-table
//! mutations and driver producer-statement executions.
//! `modify` is not handled here; the controller lowers it to
//! `remove_entry` then `add_entry` before it reaches this
//! module.
//!
//! Producer statements are executed once per (generator, driver) pair
//! that the changed generator feeds, scoped by `uuid = :uuid`; the
//! driving generator's own table is part of the statement's `FROM`
//! clause, so no per-fork parameter binding is
//! needed here — only `:uuid`.

use rusqlite::types::Value as SqlValue;
use rusqlite::ToSql;

use super::symbols::{DrvIdx, GenIdx, SymbolTables};
use super::translator::CompiledScript;
use crate::error::RoutingError;
use crate::value::{AttributeMap, ScriptValue};

/// Whether a produced tuple is entering or leaving the derived relation,
/// from the router's point of view (before the emitter's dedup counter
/// decides whether it actually crosses a 0↔1 boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Add,
    Del,
}

/// One row a producer statement returned, destined for the differential
/// emitter.
#[derive(Debug, Clone)]
pub struct ProducedRow {
    pub driver: DrvIdx,
    pub phase: Phase,
    /// Output columns in the driver's declared output-variable order,
    /// still opaque bytes (already length-prefixable for the emitter's
    /// fingerprint step).
    pub values: Vec<Vec<u8>>,
}

/// `add_entry(uuid, attrs)`.
pub fn add_entry(
    compiled: &CompiledScript,
    symbols: &SymbolTables,
    uuid: &str,
    attrs: &AttributeMap,
) -> Result<Vec<ProducedRow>, RoutingError> {
    let mut produced = Vec::new();
    for (gen_idx, gen) in symbols.generators.iter().enumerate() {
        if gen.bound_vars.is_empty() {
            continue;
        }
        let gen_idx = GenIdx(gen_idx);
        let tuples = cartesian_tuples(gen, attrs);
        for tuple in &tuples {
            insert_fork(compiled, uuid, gen_idx, tuple)?;
        }
        produced.extend(run_producers_for(compiled, symbols, gen_idx, uuid, Phase::Add)?);
    }
    Ok(produced)
}

/// `remove_entry(uuid)`. Producer statements run before the
/// generator rows are deleted, so the disappearing tuples are still
/// visible to the join.
pub fn remove_entry(
    compiled: &CompiledScript,
    symbols: &SymbolTables,
    uuid: &str,
) -> Result<Vec<ProducedRow>, RoutingError> {
    let mut produced = Vec::new();
    for (gen_idx, gen) in symbols.generators.iter().enumerate() {
        if gen.bound_vars.is_empty() {
            continue;
        }
        let gen_idx = GenIdx(gen_idx);
        produced.extend(run_producers_for(compiled, symbols, gen_idx, uuid, Phase::Del)?);
        delete_fork(compiled, uuid, gen_idx)?;
    }
    Ok(produced)
}

/// `modify` lowering: delete then re-add under the same
/// uuid. Both phases must complete before other uuids are processed
///, which the single-threaded core guarantees.
pub fn modify_entry(
    compiled: &CompiledScript,
    symbols: &SymbolTables,
    uuid: &str,
    new_attrs: &AttributeMap,
) -> Result<Vec<ProducedRow>, RoutingError> {
    let mut produced = remove_entry(compiled, symbols, uuid)?;
    produced.extend(add_entry(compiled, symbols, uuid, new_attrs)?);
    Ok(produced)
}

/// Cartesian-product expansion over a generator's bound attributes.
fn cartesian_tuples(gen: &super::symbols::Generator, attrs: &AttributeMap) -> Vec<Vec<Vec<u8>>> {
    let attr_names = generator_attr_names(gen);
    let value_lists: Vec<Vec<Vec<u8>>> = gen
        .bound_vars
        .iter()
        .zip(attr_names.iter())
        .map(|(_, attr_name)| match attr_name {
            Some(name) => match attrs.get(name) {
                Some(values) if !values.is_empty() => values.iter().map(ScriptValue::to_bytes).collect(),
                _ => vec![Vec::new()],
            },
            None => vec![Vec::new()],
        })
        .collect();

    cartesian_product(&value_lists)
}

/// For each of a generator's bound variables (in declaration order),
/// the rdn attribute name that feeds it, or `None` for whole-dn style
/// bindings (`@var`, `DCList=`, `SkipOneLevel=`, `SkipSubtree=`).
fn generator_attr_names(gen: &super::symbols::Generator) -> Vec<Option<String>> {
    use super::ast::PatternElem;

    let mut names = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for pattern in &gen.patterns {
        let Some(var) = pattern.bound_var() else { continue };
        if !seen.insert(var.to_string()) {
            continue;
        }
        names.push(match pattern {
            PatternElem::Bind { attr, .. } => Some(attr.clone()),
            _ => None,
        });
    }
    names
}

fn cartesian_product(lists: &[Vec<Vec<u8>>]) -> Vec<Vec<Vec<u8>>> {
    let mut result: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(result.len() * list.len().max(1));
        for prefix in &result {
            for value in list {
                let mut tuple = prefix.clone();
                tuple.push(value.clone());
                next.push(tuple);
            }
        }
        result = next;
    }
    result
}

fn insert_fork(
    compiled: &CompiledScript,
    uuid: &str,
    gen_idx: GenIdx,
    values: &[Vec<u8>],
) -> Result<(), RoutingError> {
    let table = &compiled.generator_tables[&gen_idx];
    let mut stmt = compiled
        .conn
        .prepare_cached(&table.add_tuple_sql)
        .map_err(|source| db_err(uuid, source))?;
    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(values.len() + 1);
    params.push(&uuid);
    for v in values {
        params.push(v);
    }
    stmt.execute(params.as_slice()).map_err(|source| db_err(uuid, source))?;
    Ok(())
}

fn delete_fork(compiled: &CompiledScript, uuid: &str, gen_idx: GenIdx) -> Result<(), RoutingError> {
    let table = &compiled.generator_tables[&gen_idx];
    compiled
        .conn
        .prepare_cached(&table.del_tuple_sql)
        .and_then(|mut stmt| stmt.execute([uuid]))
        .map(|_| ())
        .map_err(|source| db_err(uuid, source))
}

/// Execute every producer statement fed by `gen_idx`, tagging each
/// returned row with `phase`.
fn run_producers_for(
    compiled: &CompiledScript,
    symbols: &SymbolTables,
    gen_idx: GenIdx,
    uuid: &str,
    phase: Phase,
) -> Result<Vec<ProducedRow>, RoutingError> {
    let mut produced = Vec::new();
    for (drv_idx, drv) in symbols.drivers.iter().enumerate() {
        let drv_idx = DrvIdx(drv_idx);
        if !drv.contributing_generators.contains(&gen_idx) {
            continue;
        }
        let Some(stmt) = compiled.producers.get(&(gen_idx, drv_idx)) else {
            continue;
        };
        let mut prepared = compiled
            .conn
            .prepare_cached(&stmt.sql)
            .map_err(|source| db_err(uuid, source))?;
        let column_count = stmt.output_vars.len();

        let mut rows = prepared.query([uuid]).map_err(|source| db_err(uuid, source))?;
        while let Some(row) = rows.next().map_err(|source| db_err(uuid, source))? {
            let mut values = Vec::with_capacity(column_count);
            for col in 0..column_count {
                let v: SqlValue = row.get(col).map_err(|source| db_err(uuid, source))?;
                values.push(sql_value_to_bytes(v));
            }
            produced.push(ProducedRow {
                driver: drv_idx,
                phase,
                values,
            });
        }
    }
    Ok(produced)
}

fn sql_value_to_bytes(v: SqlValue) -> Vec<u8> {
    match v {
        SqlValue::Null => Vec::new(),
        SqlValue::Integer(i) => i.to_be_bytes().to_vec(),
        SqlValue::Real(f) => f.to_be_bytes().to_vec(),
        SqlValue::Text(s) => s.into_bytes(),
        SqlValue::Blob(b) => b,
    }
}

fn db_err(uuid: &str, source: rusqlite::Error) -> RoutingError {
    RoutingError::Database {
        uuid: uuid.to_string(),
        source,
    }
}
