// src/ulf/tests.rs
use super::*;
use crate::{
    app::memory::{AppModel, MemorySessionFactory, MemoryStore, SharedStore},
    messages::Level,
    process::tests::init_test_logging,
    source::ReaderSource,
};
use std::io::Cursor;

const MODEL: &str = r#"
interactions:
  - id: customer_create
    entity: customer
    mode: create
    key_field: code
    fields: [code, name, email]
    required: [name]
  - id: customer_update
    entity: customer
    mode: update
    fields: [name, email]
  - id: note_create
    entity: note
    mode: create
  - id: order_create
    entity: order
    mode: create
    fields: [customer, note]
    sections:
      - id: lines
        entity: order_line
        add_row_field: product
        link_field: order
"#;

struct Replayed {
    report: ReplayReport,
    store: SharedStore,
    interpreter: UlfInterpreter<MemorySessionFactory>,
}

fn replay_with(config: ProcessorConfig, text: &str) -> Result<Replayed> {
    replay_bytes(config, text.as_bytes())
}

fn replay_bytes(config: ProcessorConfig, bytes: &[u8]) -> Result<Replayed> {
    init_test_logging();
    let store = MemoryStore::shared();
    let mut factory = MemorySessionFactory::new(store.clone(), AppModel::from_yaml_str(MODEL)?);
    let primary = factory.create("batch")?;
    let mut source = ReaderSource::new("test.ulf", Cursor::new(bytes.to_vec()));
    let (report, interpreter) = replay_source(factory, primary, config, &mut source);
    Ok(Replayed {
        report,
        store,
        interpreter,
    })
}

fn replay(text: &str) -> Result<Replayed> {
    replay_with(ProcessorConfig::default(), text)
}

fn field(store: &SharedStore, entity: &str, key: &str, name: &str) -> Option<String> {
    store
        .borrow()
        .row(entity, key)
        .and_then(|row| row.get(name).cloned())
}

fn has_message(report: &ReplayReport, level: Level, fragment: &str) -> bool {
    report
        .messages
        .iter()
        .any(|m| m.level == level && m.text.contains(fragment))
}

#[test]
fn saves_each_value_record_in_one_batch() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,name,page_button\n\
         V,batch,customer_create,Ann,save\n\
         V,batch,customer_create,Bob,save\n",
    )?;
    assert_eq!(r.report.lines, 3);
    assert_eq!(r.report.stop_reason, StopReason::EndOfInput);
    assert_eq!(r.report.counters.succeeded, 2);
    assert_eq!(r.report.commits, 1);
    assert_eq!(r.store.borrow().row_count("customer"), 2);
    assert_eq!(field(&r.store, "customer", "2", "name").as_deref(), Some("Bob"));
    assert_eq!(r.report.source, "test.ulf");
    Ok(())
}

#[test]
fn new_header_replaces_the_old_one_entirely() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,name,page_button\n\
         V,batch,customer_create,Ann,save\n\
         P,user_id,page_id,email,name,page_button\n\
         V,batch,customer_create,bob@example.com,Bob,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 2);
    assert_eq!(field(&r.store, "customer", "1", "email"), None);
    assert_eq!(
        field(&r.store, "customer", "2", "email").as_deref(),
        Some("bob@example.com")
    );
    assert_eq!(field(&r.store, "customer", "2", "name").as_deref(), Some("Bob"));
    Ok(())
}

#[test]
fn quoted_newline_stays_inside_one_value() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,name,page_button\n\
         V,batch,customer_create,\"Ann\nSmith\",save\n",
    )?;
    assert_eq!(r.report.lines, 2);
    assert_eq!(
        field(&r.store, "customer", "1", "name").as_deref(),
        Some("Ann\nSmith")
    );
    Ok(())
}

#[test]
fn forward_and_current_keys_resolve() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,code,name,page_button\n\
         V,batch,customer_create,K7,Ann,save\n\
         P,user_id,page_id,page_key,email,page_button\n\
         V,batch,customer_update,{key:2},{curr_page_key}@example.com,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 2);
    assert_eq!(r.report.stop_reason, StopReason::EndOfInput);
    assert_eq!(
        field(&r.store, "customer", "K7", "email").as_deref(),
        Some("K7@example.com")
    );
    Ok(())
}

#[test]
fn unresolved_forward_key_aborts_the_run() -> Result<()> {
    let r = replay_with(
        ProcessorConfig {
            stop_at_error: false,
            ..Default::default()
        },
        "P,user_id,page_id,code,name,page_button\n\
         V,batch,customer_create,K7,Ann,save\n\
         P,user_id,page_id,page_key,email,page_button\n\
         V,batch,customer_update,{key:5},x@example.com,save\n\
         V,batch,customer_update,{key:2},y@example.com,save\n",
    )?;
    assert_eq!(r.report.stop_reason, StopReason::Fatal);
    assert_eq!(r.report.lines, 4);
    assert!(has_message(&r.report, Level::Error, "Key mapping not found for: 5"));
    // The work done before the failure is still committed.
    assert_eq!(r.report.commits, 1);
    assert_eq!(field(&r.store, "customer", "K7", "email"), None);
    assert!(r.store.borrow().row("customer", "K7").is_some());
    Ok(())
}

#[test]
fn batches_commit_at_the_threshold_and_at_the_end() -> Result<()> {
    let mut text = String::from("P,user_id,page_id,name,page_button\n");
    for i in 0..11 {
        text.push_str(&format!("V,batch,customer_create,c{},save\n", i));
    }
    let r = replay_with(
        ProcessorConfig {
            batch_size: 10,
            ..Default::default()
        },
        &text,
    )?;
    assert_eq!(r.report.counters.succeeded, 11);
    assert_eq!(r.report.commits, 2);
    let store = r.store.borrow();
    assert_eq!(store.commits()[0].rows, 10);
    assert_eq!(store.commits()[1].rows, 1);
    assert_eq!(store.row_count("customer"), 11);
    Ok(())
}

const THIRD_RECORD_FAILS: &str = "P,user_id,page_id,name,page_button\n\
    V,batch,customer_create,a,save\n\
    V,batch,customer_create,b,save\n\
    V,batch,no_such_page,c,save\n\
    V,batch,customer_create,d,save\n\
    V,batch,customer_create,e,save\n";

#[test]
fn stop_at_error_ends_after_the_failing_record() -> Result<()> {
    let r = replay(THIRD_RECORD_FAILS)?;
    assert_eq!(r.report.stop_reason, StopReason::StopAtError);
    assert_eq!(r.report.lines, 4);
    assert_eq!(r.report.counters.succeeded, 2);
    assert_eq!(r.report.counters.dispatch_failed, 1);
    assert!(has_message(&r.report, Level::Error, "unknown interaction: no_such_page"));
    assert_eq!(r.report.commits, 1);
    assert_eq!(r.store.borrow().row_count("customer"), 2);
    Ok(())
}

#[test]
fn failing_record_is_isolated_without_stop_at_error() -> Result<()> {
    let r = replay_with(
        ProcessorConfig {
            stop_at_error: false,
            ..Default::default()
        },
        THIRD_RECORD_FAILS,
    )?;
    assert_eq!(r.report.stop_reason, StopReason::EndOfInput);
    assert_eq!(r.report.lines, 6);
    assert_eq!(r.report.counters.succeeded, 4);
    assert_eq!(r.report.counters.dispatch_failed, 1);
    assert_eq!(r.report.commits, 1);
    assert_eq!(r.store.borrow().row_count("customer"), 4);
    Ok(())
}

#[test]
fn unexpected_header_is_a_warning_only() -> Result<()> {
    let r = replay_with(
        ProcessorConfig {
            expected_header: Some(
                ["P", "user_id", "page_id", "name", "page_button"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            ..Default::default()
        },
        "P,user_id,page_id,nom,page_button\n\
         V,batch,customer_create,Ann,save\n",
    )?;
    assert!(has_message(
        &r.report,
        Level::Warning,
        "Unexpected column heading at position 3: nom; was expecting: name"
    ));
    assert_eq!(r.report.stop_reason, StopReason::EndOfInput);
    assert_eq!(r.report.lines, 2);
    Ok(())
}

#[test]
fn values_before_any_header_are_fatal() -> Result<()> {
    let r = replay(
        "V,batch,customer_create,Ann,save\n\
         P,user_id,page_id,name,page_button\n",
    )?;
    assert_eq!(r.report.stop_reason, StopReason::Fatal);
    assert_eq!(r.report.lines, 1);
    assert!(has_message(
        &r.report,
        Level::Error,
        "No P row supplied before first V row at line 1"
    ));
    assert_eq!(r.report.commits, 0);
    Ok(())
}

#[test]
fn other_actors_get_their_own_sessions_closed_at_the_end() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,name,page_button\n\
         V,alice,customer_create,Ann,save\n\
         V,batch,customer_create,Bob,save\n\
         V,bob,customer_create,Cy,save\n\
         V,alice,customer_create,Di,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 4);
    assert_eq!(r.report.sessions_closed, 2);
    assert_eq!(
        r.store.borrow().closed_sessions(),
        &["alice".to_string(), "bob".to_string()]
    );
    assert!(r.interpreter.primary().is_open());
    Ok(())
}

#[test]
fn records_without_actor_or_interaction_are_skipped() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,name,page_button\n\
         V,,customer_create,Ann,save\n\
         V,batch\n\
         X,anything\n",
    )?;
    assert_eq!(r.report.lines, 4);
    assert_eq!(r.report.counters, Counters::default());
    assert_eq!(r.report.commits, 0);
    Ok(())
}

#[test]
fn grid_rows_accumulate_until_save() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,customer,page_button,add_row_field_lines,{grid_id}qty\n\
         V,batch,order_create,1,list_add_lines,WIDGET,4\n\
         V,batch,order_create,1,list_add_lines,GADGET,2\n\
         P,user_id,page_id,page_button\n\
         V,batch,order_create,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 1);
    assert_eq!(r.report.counters.validation_failed, 0);
    let store = r.store.borrow();
    assert_eq!(store.row_count("order"), 1);
    assert_eq!(store.row_count("order_line"), 2);
    let first = store.row("order_line", "1").expect("first line");
    assert_eq!(first.get("product").map(String::as_str), Some("WIDGET"));
    assert_eq!(first.get("qty").map(String::as_str), Some("4"));
    assert_eq!(first.get("order").map(String::as_str), Some("1"));
    let second = store.row("order_line", "2").expect("second line");
    assert_eq!(second.get("product").map(String::as_str), Some("GADGET"));
    Ok(())
}

#[test]
fn failed_validation_is_counted_and_abandoned() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,email,page_button\n\
         V,batch,customer_create,nobody@example.com,save\n\
         P,user_id,page_id,name,page_button\n\
         V,batch,customer_create,Ann,save\n",
    )?;
    assert_eq!(r.report.counters.validation_failed, 1);
    assert_eq!(r.report.counters.succeeded, 1);
    assert_eq!(r.report.stop_reason, StopReason::EndOfInput);
    assert_eq!(r.store.borrow().row_count("customer"), 1);
    assert_eq!(field(&r.store, "customer", "1", "email"), None);
    Ok(())
}

#[test]
fn overridden_validations_let_incomplete_rows_through() -> Result<()> {
    let r = replay_with(
        ProcessorConfig {
            override_all_validations: true,
            ..Default::default()
        },
        "P,user_id,page_id,email,page_button\n\
         V,batch,customer_create,nobody@example.com,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 1);
    assert_eq!(r.store.borrow().row_count("customer"), 1);
    Ok(())
}

#[test]
fn line_limit_stops_once_exceeded() -> Result<()> {
    let r = replay_with(
        ProcessorConfig {
            line_limit: Some(2),
            ..Default::default()
        },
        "P,user_id,page_id,name,page_button\n\
         V,batch,customer_create,a,save\n\
         V,batch,customer_create,b,save\n\
         V,batch,customer_create,c,save\n",
    )?;
    assert_eq!(r.report.stop_reason, StopReason::LineLimit);
    assert_eq!(r.report.lines, 3);
    assert_eq!(r.report.counters.succeeded, 2);
    assert_eq!(r.store.borrow().row_count("customer"), 2);
    Ok(())
}

#[test]
fn failed_commit_is_reported_and_rolled_back() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,name,page_button\n\
         V,batch,customer_create,Ann,save\n\
         P,user_id,page_id,page_key,email,page_button\n\
         V,batch,customer_update,99,x@example.com,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 2);
    assert_eq!(r.report.commits, 0);
    assert_eq!(r.report.failed_commits, 1);
    assert!(has_message(&r.report, Level::Error, "no such row customer[99]"));
    assert_eq!(r.store.borrow().row_count("customer"), 0);
    Ok(())
}

#[test]
fn kind_tags_never_reach_the_application() -> Result<()> {
    let r = replay(
        "P,user_id,page_id,text,page_button\n\
         V,batch,note_create,hi,save\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 1);
    let store = r.store.borrow();
    let row = store.row("note", "1").expect("note row");
    assert_eq!(row.keys().collect::<Vec<_>>(), vec!["text"]);
    assert_eq!(row.get("text").map(String::as_str), Some("hi"));
    Ok(())
}

#[test]
fn blank_header_column_is_ignored() -> Result<()> {
    let r = replay(
        "P,user_id,,page_id,text,page_button\n\
         V,batch,dropped,note_create,hi,save,surplus\n",
    )?;
    assert_eq!(r.report.counters.succeeded, 1);
    let store = r.store.borrow();
    let row = store.row("note", "1").expect("note row");
    assert_eq!(row.len(), 1);
    assert!(!row.values().any(|v| v == "dropped" || v == "surplus"));
    Ok(())
}

#[test]
fn undecodable_bytes_do_not_end_the_run() -> Result<()> {
    let r = replay_bytes(
        ProcessorConfig {
            stop_at_error: false,
            ..Default::default()
        },
        b"P,user_id,page_id,name,page_button\n\
          V,batch,customer_create,Ann,save\n\
          V,batch,customer_create,Caf\xE9,save\n\
          V,batch,customer_create,Bob,save\n\
          V,batch,customer_create,Cy,save\n",
    )?;
    assert_eq!(r.report.stop_reason, StopReason::EndOfInput);
    assert_eq!(r.report.lines, 5);
    assert_eq!(r.report.counters.succeeded, 4);
    assert_eq!(r.store.borrow().row_count("customer"), 4);
    assert_eq!(
        field(&r.store, "customer", "2", "name").as_deref(),
        Some("Caf\u{FFFD}")
    );
    Ok(())
}

#[test]
fn report_serializes_to_json() -> Result<()> {
    let r = replay("P,user_id,page_id,name,page_button\nV,batch,customer_create,Ann,save\n")?;
    let json = serde_json::to_value(&r.report)?;
    assert_eq!(json["stop_reason"], "EndOfInput");
    assert_eq!(json["counters"]["succeeded"], 1);
    Ok(())
}
