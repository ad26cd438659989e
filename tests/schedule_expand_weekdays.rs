use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn create_section(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    weekday1: serde_json::Value,
    weekday2: serde_json::Value,
) -> String {
    let course = request_ok(stdin, reader, "c", "courses.create", json!({ "name": "Math" }));
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    let section = request_ok(
        stdin,
        reader,
        "s",
        "sections.create",
        json!({
            "courseId": course_id,
            "name": "Math A",
            "weekday1": weekday1,
            "weekday2": weekday2
        }),
    );
    section
        .get("sectionId")
        .and_then(|v| v.as_str())
        .expect("sectionId")
        .to_string()
}

#[test]
fn expand_returns_only_configured_weekdays_in_order() {
    let workspace = temp_dir("schoolbook-schedule-expand");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // Monday and Wednesday; 2025-01-06 is a Monday.
    let section_id = create_section(&mut stdin, &mut reader, json!(1), json!(3));

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedule.expand",
        json!({
            "sectionId": section_id,
            "startDate": "2025-01-06",
            "endDate": "2025-01-17"
        }),
    );
    let dates: Vec<&str> = result
        .get("dates")
        .and_then(|v| v.as_array())
        .expect("dates")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(
        dates,
        vec!["2025-01-06", "2025-01-08", "2025-01-13", "2025-01-15"]
    );
}

#[test]
fn expand_without_weekdays_returns_every_date_in_range() {
    let workspace = temp_dir("schoolbook-schedule-expand-all");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let section_id = create_section(&mut stdin, &mut reader, json!(null), json!(null));

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedule.expand",
        json!({
            "sectionId": section_id,
            "startDate": "2025-01-06",
            "endDate": "2025-01-17"
        }),
    );
    let dates = result
        .get("dates")
        .and_then(|v| v.as_array())
        .expect("dates");
    assert_eq!(dates.len(), 12);
    assert_eq!(dates.first().and_then(|v| v.as_str()), Some("2025-01-06"));
    assert_eq!(dates.last().and_then(|v| v.as_str()), Some("2025-01-17"));
}

#[test]
fn expand_rejects_bad_ranges_and_unknown_sections() {
    let workspace = temp_dir("schoolbook-schedule-expand-errors");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let section_id = create_section(&mut stdin, &mut reader, json!(1), json!(null));

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "schedule.expand",
        json!({
            "sectionId": section_id,
            "startDate": "2025-01-17",
            "endDate": "2025-01-06"
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "schedule.expand",
        json!({
            "sectionId": section_id,
            "startDate": "2025-01-06T00:00:00Z",
            "endDate": "2025-01-17"
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "schedule.expand",
        json!({
            "sectionId": "no-such-section",
            "startDate": "2025-01-06",
            "endDate": "2025-01-17"
        }),
    );
    assert_eq!(code, "not_found");
}
