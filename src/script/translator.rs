//! # Relational Translator
//!
//! Turns an analyzed [`SymbolTables`] into an open SQLite database: one
//! table per generator, a `drv_all` dedup table, a `syncrepl_cookie`
//! table, and the SQL text of every prepared statement the router and
//! emitter will need.
//!
//! Statements are not held open across calls; `rusqlite`'s statement
//! cache (`Connection::prepare_cached`) does the pooling, so the
//! compiled script only needs to remember SQL text and column order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};

use super::symbols::{DrvIdx, GenIdx, SymbolTables, VarIdx};
use crate::error::TranslationError;
use crate::lexhash::hash_hex;
use crate::value::ScriptValue;

/// SQL text plus column metadata for a generator's own table and its two
/// per-row statements.
#[derive(Debug, Clone)]
pub struct GeneratorTable {
    pub table_name: String,
    /// Generator's bound variables, in declaration order (this is the
    /// `INSERT` parameter order for `add_tuple`).
    pub vars: Vec<VarIdx>,
    /// Column name for each of `vars`, in the same order. Columns are
    /// named after the *script variable*, not its position, so that two
    /// generator tables sharing a variable expose a same-named column
    /// for `NATURAL JOIN` to key on.
    pub columns: Vec<String>,
    pub add_tuple_sql: String,
    pub del_tuple_sql: String,
}

/// Column name for a script variable, shared by every generator table
/// that binds it.
fn var_column_name(symbols: &SymbolTables, v: VarIdx) -> String {
    format!("var_{}", sanitize_ident(&symbols.var(v).name))
}

/// SQL text for one (generator, driver) producer statement.
#[derive(Debug, Clone)]
pub struct ProducerStatement {
    pub sql: String,
    /// The driver's output variables, in the order the SELECT list
    /// returns them.
    pub output_vars: Vec<VarIdx>,
}

/// An analyzed script fully translated into an open database.
pub struct CompiledScript {
    pub conn: Connection,
    pub db_path: Option<PathBuf>,
    pub generator_tables: HashMap<GenIdx, GeneratorTable>,
    pub producers: HashMap<(GenIdx, DrvIdx), ProducerStatement>,
}

/// `get_drv_all` global statement: current repeat
/// count for an output hash, defaulting to 0.
pub const GET_DRV_ALL_SQL: &str = "SELECT COALESCE(MAX(out_repeat), 0) FROM drv_all WHERE out_hash = ?1";
/// `inc_drv_all`: insert-or-bump the repeat count.
pub const INC_DRV_ALL_SQL: &str =
    "INSERT INTO drv_all(out_hash, out_repeat) VALUES (?1, 1) \
     ON CONFLICT(out_hash) DO UPDATE SET out_repeat = out_repeat + 1";
/// `dec_drv_all`: decrement the repeat count; the zero-cleanup trigger
/// deletes the row once it reaches zero.
pub const DEC_DRV_ALL_SQL: &str = "UPDATE drv_all SET out_repeat = out_repeat - 1 WHERE out_hash = ?1";

/// Most recent resume token, if the upstream collaborator has ever
/// reported progress against this database.
pub const LOAD_COOKIE_SQL: &str = "SELECT cookie FROM syncrepl_cookie ORDER BY timestamp DESC LIMIT 1";
/// Append a new resume token, timestamped so `LOAD_COOKIE_SQL` always
/// picks up the most recent one.
pub const SAVE_COOKIE_SQL: &str = "INSERT INTO syncrepl_cookie(timestamp, cookie) VALUES (?1, ?2)";

/// Translate `symbols` (already analyzed) into an open, fully-prepared
/// database. `base_dir` selects an on-disk file named
/// `pulley_<hash>.sqlite3`; `None` opens an in-memory store instead.
pub fn translate(
    symbols: &SymbolTables,
    whole_script_hash: u32,
    base_dir: Option<&Path>,
) -> Result<CompiledScript, TranslationError> {
    let (conn, db_path) = open_database(whole_script_hash, base_dir)?;

    create_drv_all(&conn)?;
    create_cookie_table(&conn)?;

    let mut generator_tables = HashMap::new();
    for (gen_idx, gen) in symbols.generators.iter().enumerate() {
        if gen.bound_vars.is_empty() {
            continue;
        }
        let gen_idx = GenIdx(gen_idx);
        let table = create_generator_table(&conn, symbols, gen_idx, gen.line_hash, &gen.bound_vars)?;
        generator_tables.insert(gen_idx, table);
    }

    let mut producers = HashMap::new();
    for (drv_idx, drv) in symbols.drivers.iter().enumerate() {
        let drv_idx = DrvIdx(drv_idx);
        for &gen_idx in &drv.contributing_generators {
            let stmt = build_producer_statement(symbols, gen_idx, drv_idx, &generator_tables);
            // Validate it actually prepares before committing to it.
            conn.prepare_cached(&stmt.sql).map_err(|source| TranslationError::PrepareStatement {
                name: format!("producer_{}_{}", gen_idx.index(), drv_idx.index()),
                source,
            })?;
            producers.insert((gen_idx, drv_idx), stmt);
        }
    }

    Ok(CompiledScript {
        conn,
        db_path,
        generator_tables,
        producers,
    })
}

fn open_database(
    whole_script_hash: u32,
    base_dir: Option<&Path>,
) -> Result<(Connection, Option<PathBuf>), TranslationError> {
    match base_dir {
        Some(dir) => {
            let file_name = format!("pulley_{}.sqlite3", hash_hex(whole_script_hash));
            let path = dir.join(file_name);
            let conn = Connection::open(&path).map_err(|source| TranslationError::OpenDatabase {
                path: path.display().to_string(),
                source,
            })?;
            Ok((conn, Some(path)))
        }
        None => {
            let conn = Connection::open_in_memory().map_err(|source| TranslationError::OpenDatabase {
                path: ":memory:".to_string(),
                source,
            })?;
            Ok((conn, None))
        }
    }
}

fn create_drv_all(conn: &Connection) -> Result<(), TranslationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS drv_all (
            out_hash INTEGER PRIMARY KEY,
            out_repeat INTEGER NOT NULL DEFAULT 0
         );
         CREATE TRIGGER IF NOT EXISTS drv_all_zero_cleanup
         AFTER UPDATE OF out_repeat ON drv_all
         WHEN NEW.out_repeat <= 0
         BEGIN
            DELETE FROM drv_all WHERE out_hash = NEW.out_hash;
         END;",
    )
    .map_err(|source| TranslationError::CreateTable {
        table: "drv_all".to_string(),
        source,
    })
}

fn create_cookie_table(conn: &Connection) -> Result<(), TranslationError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS syncrepl_cookie (timestamp INTEGER PRIMARY KEY, cookie BLOB)",
        [],
    )
    .map(|_| ())
    .map_err(|source| TranslationError::CreateTable {
        table: "syncrepl_cookie".to_string(),
        source,
    })
}

/// Read the most recently saved resume token, if any.
pub fn load_cookie(conn: &Connection) -> Result<Option<Vec<u8>>, rusqlite::Error> {
    conn.query_row(LOAD_COOKIE_SQL, [], |r| r.get(0)).optional()
}

/// Persist a new resume token, timestamped with the current wall clock
/// (nanosecond resolution, so back-to-back progress reports within the
/// same second still get distinct primary keys) so restarts always
/// resume from the most recently reported one.
pub fn save_cookie(conn: &Connection, cookie: &[u8]) -> Result<(), rusqlite::Error> {
    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    conn.execute(SAVE_COOKIE_SQL, rusqlite::params![timestamp, cookie]).map(|_| ())
}

fn create_generator_table(
    conn: &Connection,
    symbols: &SymbolTables,
    gen_idx: GenIdx,
    line_hash: u32,
    bound_vars: &[VarIdx],
) -> Result<GeneratorTable, TranslationError> {
    let table_name = format!("gen_{}", hash_hex(line_hash));
    let column_names: Vec<String> = bound_vars.iter().map(|&v| var_column_name(symbols, v)).collect();

    let mut columns = vec!["uuid CHAR(36) NOT NULL".to_string()];
    for name in &column_names {
        columns.push(format!("{name} BLOB NOT NULL"));
    }
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table_name} ({});\n\
         CREATE INDEX IF NOT EXISTS idx_{table_name}_uuid ON {table_name}(uuid);",
        columns.join(", ")
    );
    conn.execute_batch(&ddl).map_err(|source| TranslationError::CreateTable {
        table: table_name.clone(),
        source,
    })?;

    let placeholders: Vec<String> = (1..=bound_vars.len()).map(|n| format!("?{:03}", n + 1)).collect();
    let add_tuple_sql = format!(
        "INSERT INTO {table_name} VALUES (:uuid{}{})",
        if placeholders.is_empty() { "" } else { ", " },
        placeholders.join(", ")
    );
    let del_tuple_sql = format!("DELETE FROM {table_name} WHERE uuid = :uuid");

    conn.prepare_cached(&add_tuple_sql)
        .map_err(|source| TranslationError::PrepareStatement {
            name: format!("add_tuple_{}", gen_idx.index()),
            source,
        })?;
    conn.prepare_cached(&del_tuple_sql)
        .map_err(|source| TranslationError::PrepareStatement {
            name: format!("del_tuple_{}", gen_idx.index()),
            source,
        })?;

    Ok(GeneratorTable {
        table_name,
        vars: bound_vars.to_vec(),
        columns: column_names,
        add_tuple_sql,
        del_tuple_sql,
    })
}

/// Build the producer SELECT for one (generator, driver) pair.
fn build_producer_statement(
    symbols: &SymbolTables,
    driving_gen: GenIdx,
    drv_idx: DrvIdx,
    tables: &HashMap<GenIdx, GeneratorTable>,
) -> ProducerStatement {
    let drv = &symbols.drivers[drv_idx.index()];
    // A contributing generator always has >=1 bound variable and
    // therefore always got a table in the loop above.
    let driving_table = tables
        .get(&driving_gen)
        .expect("contributing generator always has a table");

    let mut from_clause = driving_table.table_name.clone();
    let mut joined_vars: Vec<VarIdx> = driving_table.vars.clone();
    for &cogen in &drv.contributing_generators {
        if cogen == driving_gen {
            continue;
        }
        if let Some(t) = tables.get(&cogen) {
            from_clause.push_str(&format!(" NATURAL JOIN {}", t.table_name));
            joined_vars.extend(t.vars.iter().copied());
        }
    }

    // Columns are named after the shared script variable (see
    // `var_column_name`), so once a variable is joined in, it is
    // unambiguous to reference unqualified regardless of which table
    // actually carries it.
    let param_of = |v: VarIdx| -> Option<usize> { driving_table.vars.iter().position(|&bv| bv == v) };

    let select_list: Vec<String> = drv
        .output_vars
        .iter()
        .map(|&v| {
            if joined_vars.contains(&v) {
                var_column_name(symbols, v)
            } else {
                format!("?{:03}", param_of(v).map(|n| n + 1).unwrap_or(1))
            }
        })
        .collect();

    // `uuid` is a shared column name across every joined table, so
    // NATURAL JOIN already collapses it into a single logical column;
    // referencing it unqualified also makes the join itself key on
    // matching uuids between cogenerators, which is required.
    let mut where_clauses = vec!["uuid = :uuid".to_string()];
    for &cond_idx in &drv.applicable_conditions {
        let cond = &symbols.conditions[cond_idx.index()];
        where_clauses.push(compile_condition_sql(cond));
    }

    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_list.join(", "),
        from_clause,
        where_clauses.join(" AND ")
    );

    ProducerStatement {
        sql,
        output_vars: drv.output_vars.clone(),
    }
}

/// Lower one condition's postfix expression into a SQL boolean
/// subexpression. Every variable operand becomes a `var_<name>` column
/// reference: the driving generator's own table carries that column
/// just like every cogenerator table does (see `var_column_name`), so
/// there is no need — and no bound parameter available — to address it
/// positionally. `:uuid` is the only parameter the router binds.
fn compile_condition_sql(cond: &super::symbols::Condition) -> String {
    use super::ast::{CondToken, Term};

    let mut stack: Vec<String> = Vec::new();

    for tok in &cond.postfix {
        match tok {
            CondToken::Operand(Term::Var(name)) => {
                stack.push(format!("var_{}", sanitize_ident(name)));
            }
            CondToken::Operand(Term::Const(v)) => stack.push(v.to_sql_literal()),
            CondToken::True => stack.push("1".to_string()),
            CondToken::False => stack.push("0".to_string()),
            CondToken::Cmp(op) => {
                let rhs = stack.pop().unwrap_or_default();
                let lhs = stack.pop().unwrap_or_default();
                stack.push(format!("({lhs} {} {rhs})", op.as_sql()));
            }
            CondToken::Not => {
                let v = stack.pop().unwrap_or_default();
                stack.push(format!("(NOT {v})"));
            }
            CondToken::And(n) => {
                let mut parts = Vec::new();
                for _ in 0..*n {
                    parts.push(stack.pop().unwrap_or_default());
                }
                parts.reverse();
                stack.push(format!("({})", parts.join(" AND ")));
            }
            CondToken::Or(n) => {
                let mut parts = Vec::new();
                for _ in 0..*n {
                    parts.push(stack.pop().unwrap_or_default());
                }
                parts.reverse();
                stack.push(format!("({})", parts.join(" OR ")));
            }
        }
    }
    stack.pop().unwrap_or_else(|| "1".to_string())
}

fn sanitize_ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Encode a single variable's value for a BLOB bind parameter.
pub fn bind_bytes(value: &ScriptValue) -> Vec<u8> {
    value.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::analyzer::analyze;
    use crate::script::parser::Parser;

    fn compiled(script: &str) -> (SymbolTables, CompiledScript) {
        let mut p = Parser::new();
        p.parse_buffer(script).unwrap();
        let (mut symbols, hash) = p.finalize();
        analyze(&mut symbols);
        let compiled = translate(&symbols, hash, None).unwrap();
        (symbols, compiled)
    }

    #[test]
    fn generator_table_created_with_expected_columns() {
        let (symbols, compiled) = compiled("Mail:x <- world\nout(x) <- x\n");
        let gen_idx = GenIdx(0);
        let table = compiled.generator_tables.get(&gen_idx).unwrap();
        assert_eq!(table.vars.len(), 1);
        let _ = symbols;

        let count: i64 = compiled
            .conn
            .query_row(
                &format!("SELECT count(*) FROM pragma_table_info('{}')", table.table_name),
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2); // uuid + var_x
    }

    #[test]
    fn producer_statement_prepares_for_attached_condition() {
        let (_symbols, compiled) = compiled("A:x, B:y <- world\nx = y\nout(x) <- x\n");
        assert_eq!(compiled.producers.len(), 1);
        let stmt = compiled.producers.values().next().unwrap();
        assert!(compiled.conn.prepare(&stmt.sql).is_ok());
    }

    #[test]
    fn cookie_round_trips_and_picks_the_most_recent() {
        let (_symbols, compiled) = compiled("Mail:x <- world\nout(x) <- x\n");
        assert_eq!(load_cookie(&compiled.conn).unwrap(), None);
        save_cookie(&compiled.conn, b"first").unwrap();
        save_cookie(&compiled.conn, b"second").unwrap();
        assert_eq!(load_cookie(&compiled.conn).unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn drv_all_and_cookie_tables_exist() {
        let (_symbols, compiled) = compiled("Mail:x <- world\nout(x) <- x\n");
        let count: i64 = compiled
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN ('drv_all', 'syncrepl_cookie')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
