//! Verb-surface integration tests: a `Handler` driven
//! end-to-end through `script` → `dump_state` / `add_entry` /
//! `remove_entry` / `stop`, against a script file on disk.

use syncbridge::config::Config;
use syncbridge::protocol::{Handler, Status, Verb};
use syncbridge::value::AttributeMap;

fn write_script(dir: &std::path::Path, text: &str) -> String {
    let path = dir.join("directory.pulley");
    std::fs::write(&path, text).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn script_then_dump_state_reports_entity_counts_and_hash() {
    let dir = tempfile::tempdir().unwrap();
    let filename = write_script(dir.path(), "Mail:x <- world\nout(x) <- x\n");

    let handler = Handler::new(&Config::default());
    let loaded = handler.dispatch(Verb::Script {
        filename,
        base: None,
        autofollow: false,
    });
    assert_eq!(loaded.status, Status::Ok);
    let payload = loaded.payload.unwrap();
    assert_eq!(payload["generators"], 1);
    assert_eq!(payload["drivers"], 1);
    assert!(payload["whole_script_hash"].is_string());

    let dump = handler.dispatch(Verb::DumpState);
    assert_eq!(dump.status, Status::Ok);
    assert_eq!(dump.payload.unwrap()["state"], "Ready");
}

#[test]
fn add_entry_verb_routes_through_a_ready_controller() {
    let dir = tempfile::tempdir().unwrap();
    let filename = write_script(dir.path(), "Mail:x <- world\nout(x) <- x\n");

    let handler = Handler::new(&Config::default());
    let loaded = handler.dispatch(Verb::Script { filename, base: None, autofollow: false });
    assert_eq!(loaded.status, Status::Ok);

    let mut attrs = AttributeMap::new();
    attrs.insert("Mail".to_string(), vec![syncbridge::value::ScriptValue::Str("a@x".to_string())]);
    let response = handler.dispatch(Verb::AddEntry { uuid: "u1".to_string(), attrs });
    assert_eq!(response.status, Status::Ok);
}

#[test]
fn stop_verb_is_idempotent_with_dump_state_afterward() {
    let handler = Handler::new(&Config::default());
    assert_eq!(handler.dispatch(Verb::Stop).status, Status::Ok);
    let dump = handler.dispatch(Verb::DumpState);
    assert_eq!(dump.payload.unwrap()["state"], "Stopped");
}
