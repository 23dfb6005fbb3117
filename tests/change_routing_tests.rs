//! End-to-end change routing: parse → analyze → translate → route →
//! emit, against the scenarios a joined directory change stream must
//! satisfy under cartesian expansion and dedup.

mod support;

use syncbridge::script::analyzer::analyze;
use syncbridge::script::emitter::emit;
use syncbridge::script::parser::Parser;
use syncbridge::script::router::{add_entry, modify_entry, remove_entry, Phase};
use syncbridge::script::symbols::SymbolTables;
use syncbridge::script::translator::{translate, CompiledScript};
use syncbridge::value::{AttributeMap, ScriptValue};

use support::StubBackend;

fn compile(script: &str) -> (SymbolTables, CompiledScript) {
    let mut parser = Parser::new();
    parser.parse_buffer(script).unwrap();
    let (mut symbols, hash) = parser.finalize();
    analyze(&mut symbols);
    let compiled = translate(&symbols, hash, None).unwrap();
    (symbols, compiled)
}

fn attrs(pairs: &[(&str, &[&str])]) -> AttributeMap {
    let mut map = AttributeMap::new();
    for (k, values) in pairs {
        map.insert((*k).to_string(), values.iter().map(|v| ScriptValue::Str((*v).to_string())).collect());
    }
    map
}

fn dispatch_into(backend: &StubBackend) -> impl FnMut(&syncbridge::script::router::ProducedRow) -> Result<(), syncbridge::error::BackendError> + '_ {
    move |row| {
        match row.phase {
            Phase::Add => backend.add(&row.values),
            Phase::Del => backend.del(&row.values),
        }
        Ok(())
    }
}

/// Scenario 1: single generator, single driver, one add fans out across
/// every bound value.
#[test]
fn scenario_1_single_generator_fans_out_cartesian_values() {
    let (symbols, compiled) = compile("Mail:x <- world\nout(x) <- x\n");
    let backend = StubBackend::new();

    let rows = add_entry(&compiled, &symbols, "a", &attrs(&[("Mail", &["a@x", "b@x"])])).unwrap();
    emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();

    assert_eq!(backend.add_call_count(), 2);
    let mut seen: Vec<String> = backend
        .calls()
        .into_iter()
        .map(|c| match c {
            support::Call::Add(v) => String::from_utf8(v[0].clone()).unwrap(),
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["a@x".to_string(), "b@x".to_string()]);
}

/// Scenario 2: two generators joined on one variable; the second uuid's
/// contribution is deduplicated away.
#[test]
fn scenario_2_join_across_generators_dedups_second_contribution() {
    let (symbols, compiled) = compile("Mail:x <- world\nCn:x <- world\nout(x) <- x\n");
    let backend = StubBackend::new();

    let a = attrs(&[("Mail", &["u"]), ("Cn", &["u"])]);
    let rows_a = add_entry(&compiled, &symbols, "a", &a).unwrap();
    emit(&compiled, &symbols, &rows_a, dispatch_into(&backend)).unwrap();

    let b = attrs(&[("Mail", &["u"]), ("Cn", &["u"])]);
    let rows_b = add_entry(&compiled, &symbols, "b", &b).unwrap();
    emit(&compiled, &symbols, &rows_b, dispatch_into(&backend)).unwrap();

    assert_eq!(backend.add_call_count(), 1, "dedup must suppress the second uuid's identical contribution");

    let out_repeat: i64 = compiled
        .conn
        .query_row("SELECT out_repeat FROM drv_all", [], |r| r.get(0))
        .unwrap();
    assert_eq!(out_repeat, 2);
}

/// Scenario 3: delete dedup building on scenario 2 — removing the first
/// contributor produces no backend call, removing the second does.
#[test]
fn scenario_3_delete_dedup_only_last_remover_crosses_transition() {
    let (symbols, compiled) = compile("Mail:x <- world\nCn:x <- world\nout(x) <- x\n");
    let backend = StubBackend::new();

    for uuid in ["a", "b"] {
        let rows = add_entry(&compiled, &symbols, uuid, &attrs(&[("Mail", &["u"]), ("Cn", &["u"])])).unwrap();
        emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();
    }

    let rows = remove_entry(&compiled, &symbols, "a").unwrap();
    emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();
    assert_eq!(backend.del_call_count(), 0, "removing the first of two contributors must not cross 1->0");

    let out_repeat: i64 = compiled
        .conn
        .query_row("SELECT out_repeat FROM drv_all", [], |r| r.get(0))
        .unwrap();
    assert_eq!(out_repeat, 1);

    let rows = remove_entry(&compiled, &symbols, "b").unwrap();
    emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();
    assert_eq!(backend.del_call_count(), 1, "removing the last contributor must cross 1->0");

    let remaining: i64 = compiled.conn.query_row("SELECT COUNT(*) FROM drv_all", [], |r| r.get(0)).unwrap();
    assert_eq!(remaining, 0, "zero-cleanup trigger removes the row once out_repeat hits zero");
}

/// Scenario 4: a condition `x = y` restricts the cartesian product of
/// two generators' bound values to the matching pair only.
#[test]
fn scenario_4_condition_restricts_join_to_matching_pair() {
    let (symbols, compiled) = compile("A:x <- world\nB:y <- world\nx = y\nout(x) <- x\n");
    let backend = StubBackend::new();

    let rows = add_entry(&compiled, &symbols, "a", &attrs(&[("A", &["p", "q"]), ("B", &["q", "r"])])).unwrap();
    emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();

    assert_eq!(backend.add_call_count(), 1);
    let support::Call::Add(values) = &backend.calls()[0] else {
        panic!("expected an add call")
    };
    assert_eq!(values[0], b"q".to_vec());
}

/// Scenario 6: hash stability across line permutations of the same
/// script (also covered at the hasher level; re-asserted here against
/// the full parse pipeline).
#[test]
fn scenario_6_whole_script_hash_is_stable_across_line_order() {
    let mut a = Parser::new();
    a.parse_buffer("Mail:x <- world\nCn:x <- world\nout(x) <- x\n").unwrap();
    let (_, hash_a) = a.finalize();

    let mut b = Parser::new();
    b.parse_buffer("Cn:x <- world\nout(x) <- x\nMail:x <- world\n").unwrap();
    let (_, hash_b) = b.finalize();

    assert_eq!(hash_a, hash_b);
}

/// `modify(u, A')` lowers to remove-then-add: the old contribution is
/// retracted and the new one takes its place under the same uuid.
#[test]
fn modify_entry_retracts_old_value_and_adds_new_one() {
    let (symbols, compiled) = compile("Mail:x <- world\nout(x) <- x\n");
    let backend = StubBackend::new();

    let rows = add_entry(&compiled, &symbols, "a", &attrs(&[("Mail", &["old@x"])])).unwrap();
    emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();

    let rows = modify_entry(&compiled, &symbols, "a", &attrs(&[("Mail", &["new@x"])])).unwrap();
    emit(&compiled, &symbols, &rows, dispatch_into(&backend)).unwrap();

    assert_eq!(backend.del_call_count(), 1);
    assert_eq!(backend.add_call_count(), 2);
    let support::Call::Add(last_add) = backend.calls().into_iter().last().unwrap() else {
        panic!("expected the last call to be an add")
    };
    assert_eq!(last_add[0], b"new@x".to_vec());
}

/// After `remove_entry`, no generator table retains a row for that uuid.
#[test]
fn remove_entry_clears_every_generator_row_for_the_uuid() {
    let (symbols, compiled) = compile("Mail:x <- world\nCn:x <- world\nout(x) <- x\n");
    add_entry(&compiled, &symbols, "a", &attrs(&[("Mail", &["u"]), ("Cn", &["u"])])).unwrap();
    remove_entry(&compiled, &symbols, "a").unwrap();

    for table in compiled.generator_tables.values() {
        let count: i64 = compiled
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {} WHERE uuid = 'a'", table.table_name), [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "table {} retained a row for a removed uuid", table.table_name);
    }
}
