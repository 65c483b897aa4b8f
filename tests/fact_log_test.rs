mod helpers;

use std::io::Write;

use chrono::Utc;
use helpers::{new_fact, TestProject};
use kb::fact::{FactLog, FactTable, FactType};

fn write_log(project: &TestProject, valid: usize, malformed_at: &[usize]) -> Vec<String> {
    let path = project.log_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = std::fs::File::create(&path).unwrap();
    let mut ids = Vec::new();
    let mut written = 0;
    let mut line_no = 1;
    while written < valid {
        if malformed_at.contains(&line_no) {
            writeln!(file, "{{\"id\": \"broken-{line_no}\", \"title\": ").unwrap();
        } else {
            let fact = new_fact(
                &format!("Fact number {written}"),
                "Generated for a bulk load",
                FactType::Finding,
            )
            .into_fact(Utc::now());
            ids.push(fact.id.clone());
            writeln!(file, "{}", serde_json::to_string(&fact).unwrap()).unwrap();
            written += 1;
        }
        line_no += 1;
    }
    ids
}

#[test]
fn malformed_lines_are_skipped_and_reported() {
    let project = TestProject::new();
    let ids = write_log(&project, 100, &[7, 50, 99]);

    let log = FactLog::new(project.log_path());
    let mut facts = log.read_all().unwrap();
    let loaded: Vec<_> = facts.by_ref().collect();

    assert_eq!(loaded.len(), 100);
    assert_eq!(facts.errors().len(), 3);
    let lines: Vec<usize> = facts.errors().iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![7, 50, 99]);
    assert_eq!(facts.lines_read(), 103);

    let loaded_ids: Vec<&str> = loaded.iter().map(|f| f.id.as_str()).collect();
    let expected: Vec<&str> = ids.iter().map(String::as_str).collect();
    assert_eq!(loaded_ids, expected, "facts come back in log order");
}

#[test]
fn validate_matches_read_errors() {
    let project = TestProject::new();
    write_log(&project, 10, &[2]);

    let log = FactLog::new(project.log_path());
    let errors = log.validate().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, 2);
}

#[test]
fn appended_facts_survive_reopen() {
    let project = TestProject::new();
    let log = FactLog::new(project.log_path());
    assert!(log.init().unwrap());
    assert!(!log.init().unwrap(), "second init is a no-op");

    let fact = new_fact("Use WAL mode", "SQLite WAL avoids writer stalls", FactType::Lesson)
        .into_fact(Utc::now());
    let id = log.append(&fact).unwrap();
    assert_eq!(id, fact.id);

    let reopened = FactLog::new(project.log_path());
    let (table, report) = FactTable::load(&reopened).unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(&id).unwrap().title, "Use WAL mode");
}

#[test]
fn torn_tail_does_not_swallow_next_append() {
    let project = TestProject::new();
    let log = FactLog::new(project.log_path());
    log.init().unwrap();
    log.append(&new_fact("first", "", FactType::Note).into_fact(Utc::now()))
        .unwrap();

    // Simulate a crash mid-write: a partial line without its newline.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(project.log_path())
        .unwrap();
    write!(file, "{{\"id\":\"torn\",\"ti").unwrap();
    drop(file);

    log.append(&new_fact("second", "", FactType::Note).into_fact(Utc::now()))
        .unwrap();

    let (table, report) = FactTable::load(&log).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].line, 2);
}

#[test]
fn usage_lines_fold_into_one_fact() {
    let project = TestProject::new();
    let log = FactLog::new(project.log_path());
    log.init().unwrap();

    let mut fact = new_fact("Retry with jitter", "", FactType::Pattern).into_fact(Utc::now());
    log.append(&fact).unwrap();
    fact.touch(Utc::now());
    log.append_usage(&fact).unwrap();
    fact.touch(Utc::now());
    log.append_usage(&fact).unwrap();

    let (table, _) = FactTable::load(&log).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.superseded_lines(), 2);
    assert_eq!(table.get(&fact.id).unwrap().usage_count, 2);
}

#[test]
fn unknown_fields_and_types_are_tolerated() {
    let project = TestProject::new();
    let path = project.log_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        concat!(
            r#"{"id":"a","title":"From the future","type":"hypothesis","created_at":"2026-01-01T00:00:00Z","color":"blue"}"#,
            "\n",
        ),
    )
    .unwrap();

    let log = FactLog::new(&path);
    let (table, report) = FactTable::load(&log).unwrap();
    assert!(report.errors.is_empty());
    let fact = table.get("a").unwrap();
    assert_eq!(fact.fact_type, FactType::Other);
    assert_eq!(fact.extra.get("color").unwrap(), "blue");
    assert_eq!(fact.provenance, "unknown");
}
