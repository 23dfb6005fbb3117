//! # Differential Emitter
//!
//! Turns the router's raw produced rows into the add/del callbacks a
//! backend actually sees, deduplicating on the `drv_all` table so a
//! tuple reachable through more than one generator path still crosses
//! the backend boundary exactly once.
//!
//! A tuple's identity is its driver's line-hash folded with its output
//! columns, FNV-1a over length-prefixed column bytes so that e.g.
//! `("ab", "c")` and `("a", "bc")` never collide. `drv_all.out_repeat`
//! counts how many still-live router paths currently produce that
//! identity; only the 0→1 and 1→0 transitions reach the backend.

use rusqlite::OptionalExtension;

use super::router::{Phase, ProducedRow};
use super::symbols::SymbolTables;
use super::translator::{CompiledScript, DEC_DRV_ALL_SQL, GET_DRV_ALL_SQL, INC_DRV_ALL_SQL};
use crate::error::{BackendError, RoutingError};

/// Fold a driver's line-hash and its output columns into one fingerprint.
/// Each column is fed length-prefixed so a shift in column boundaries
/// cannot produce the same hash as a different split of the same bytes.
pub fn fingerprint(driver_line_hash: u32, values: &[Vec<u8>]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = OFFSET_BASIS ^ u64::from(driver_line_hash);
    h = h.wrapping_mul(PRIME);
    for col in values {
        for &len_byte in &(col.len() as u32).to_be_bytes() {
            h ^= u64::from(len_byte);
            h = h.wrapping_mul(PRIME);
        }
        for &byte in col {
            h ^= u64::from(byte);
            h = h.wrapping_mul(PRIME);
        }
    }
    h
}

/// A row that crossed a dedup transition and should reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `out_repeat` went 0 -> 1: first live path producing this tuple.
    Appeared,
    /// `out_repeat` went 1 -> 0: last live path stopped producing it.
    Disappeared,
}

/// Current `drv_all.out_repeat` for a fingerprint, or 0 if the row is
/// absent.
fn get_drv_all(compiled: &CompiledScript, hash: u64) -> Result<i64, rusqlite::Error> {
    compiled
        .conn
        .query_row(GET_DRV_ALL_SQL, [hash as i64], |r| r.get(0))
        .optional()
        .map(|v| v.unwrap_or(0))
}

fn inc_drv_all(compiled: &CompiledScript, hash: u64) -> Result<(), rusqlite::Error> {
    compiled.conn.execute(INC_DRV_ALL_SQL, [hash as i64]).map(|_| ())
}

fn dec_drv_all(compiled: &CompiledScript, hash: u64) -> Result<(), rusqlite::Error> {
    compiled.conn.execute(DEC_DRV_ALL_SQL, [hash as i64]).map(|_| ())
}

/// Apply the dedup counter to one produced row and report whether it
/// crossed a 0<->1 boundary the caller should forward to a backend.
/// The counter is always updated, even when the row does not cross a
/// transition, so repeat counts stay correct for the next call.
fn classify(compiled: &CompiledScript, row: &ProducedRow, driver_line_hash: u32) -> Result<Option<Transition>, RoutingError> {
    let hash = fingerprint(driver_line_hash, &row.values);
    let repeat = get_drv_all(compiled, hash).map_err(db_err)?;

    let transition = match row.phase {
        Phase::Add => {
            inc_drv_all(compiled, hash).map_err(db_err)?;
            (repeat == 0).then_some(Transition::Appeared)
        }
        Phase::Del => {
            dec_drv_all(compiled, hash).map_err(db_err)?;
            (repeat == 1).then_some(Transition::Disappeared)
        }
    };
    Ok(transition)
}

fn db_err(source: rusqlite::Error) -> RoutingError {
    RoutingError::Database {
        uuid: "<drv_all>".to_string(),
        source,
    }
}

/// Run the dedup pass over every row the router produced and dispatch
/// the ones that crossed a transition to `dispatch`, one call per row.
/// `dispatch` failures are logged and otherwise ignored: the dedup
/// counter has already been updated by the time it runs, which is what
/// keeps future transitions correct even if a backend is temporarily
/// unreachable.
pub fn emit(
    compiled: &CompiledScript,
    symbols: &SymbolTables,
    rows: &[ProducedRow],
    mut dispatch: impl FnMut(&ProducedRow) -> Result<(), BackendError>,
) -> Result<(), RoutingError> {
    for row in rows {
        let driver_line_hash = symbols.drivers[row.driver.index()].line_hash;
        let Some(_transition) = classify(compiled, row, driver_line_hash)? else {
            continue;
        };
        if let Err(err) = dispatch(row) {
            tracing::warn!(
                driver = row.driver.index(),
                phase = ?row.phase,
                error = %err,
                "backend dispatch failed; dedup counter already committed"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::analyzer::analyze;
    use crate::script::parser::Parser;
    use crate::script::router::add_entry;
    use crate::script::symbols::DrvIdx;
    use crate::script::translator::translate;
    use crate::value::{AttributeMap, ScriptValue};

    fn setup(script: &str) -> (SymbolTables, CompiledScript) {
        let mut p = Parser::new();
        p.parse_buffer(script).unwrap();
        let (mut symbols, hash) = p.finalize();
        analyze(&mut symbols);
        let compiled = translate(&symbols, hash, None).unwrap();
        (symbols, compiled)
    }

    #[test]
    fn fingerprint_distinguishes_column_boundary_shifts() {
        let a = fingerprint(1, &[b"ab".to_vec(), b"c".to_vec()]);
        let b = fingerprint(1, &[b"a".to_vec(), b"bc".to_vec()]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint(42, &[b"x".to_vec()]);
        let b = fingerprint(42, &[b"x".to_vec()]);
        assert_eq!(a, b);
    }

    #[test]
    fn single_producer_add_then_del_emits_once_each() {
        let mut m = AttributeMap::new();
        m.insert("Mail".to_string(), vec![ScriptValue::Str("a@x".to_string())]);
        let (symbols, compiled) = setup("Mail:x <- world\nout(x) <- x\n");
        let rows = add_entry(&compiled, &symbols, "uuid-1", &m).unwrap();

        let mut seen = Vec::new();
        emit(&compiled, &symbols, &rows, |row| {
            seen.push(row.phase);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![Phase::Add]);
    }

    #[test]
    fn duplicate_producer_paths_emit_only_on_transitions() {
        // Two generators producing the same tuple for the same driver:
        // the first add crosses 0->1 and is forwarded, the second does
        // not (repeat now 2); the first del leaves repeat at 1 and is
        // swallowed, the second crosses 1->0 and is forwarded.
        let (symbols, compiled) = setup("Mail:x <- world\nout(x) <- x\n");
        let driver_line_hash = symbols.drivers[0].line_hash;
        let row = ProducedRow {
            driver: DrvIdx(0),
            phase: Phase::Add,
            values: vec![b"same".to_vec()],
        };

        let first = classify(&compiled, &row, driver_line_hash).unwrap();
        let second = classify(&compiled, &row, driver_line_hash).unwrap();
        assert_eq!(first, Some(Transition::Appeared));
        assert_eq!(second, None);

        let del_row = ProducedRow {
            phase: Phase::Del,
            ..row
        };
        let first_del = classify(&compiled, &del_row, driver_line_hash).unwrap();
        let second_del = classify(&compiled, &del_row, driver_line_hash).unwrap();
        assert_eq!(first_del, None);
        assert_eq!(second_del, Some(Transition::Disappeared));
    }
}
