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

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {}", key))
        .to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    last: &str,
) -> String {
    let student = request_ok(
        stdin,
        reader,
        "st",
        "students.create",
        json!({ "lastName": last, "firstName": "Alex" }),
    );
    str_field(&student, "studentId")
}

#[test]
fn materialize_creates_one_row_per_student_per_matching_date() {
    let workspace = temp_dir("schoolbook-att-materialize");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Science" }),
    );
    let course_id = str_field(&course, "courseId");

    // Monday/Wednesday section; 2025-01-06..2025-01-13 holds exactly three
    // matching dates (Jan 6, 8, 13).
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sections.create",
        json!({ "courseId": course_id, "name": "Science A", "weekday1": 1, "weekday2": 3 }),
    );
    let section_id = str_field(&section, "sectionId");

    let student_a = create_student(&mut stdin, &mut reader, "Avery");
    let student_b = create_student(&mut stdin, &mut reader, "Brook");
    let student_dropped = create_student(&mut stdin, &mut reader, "Cut");

    for (i, (student_id, status)) in [
        (&student_a, "enrolled"),
        (&student_b, "enrolled"),
        (&student_dropped, "dropped"),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "enrollments.create",
            json!({
                "studentId": student_id,
                "courseId": course_id,
                "sectionId": section_id,
                "status": status
            }),
        );
    }

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.materialize",
        json!({
            "sectionId": section_id,
            "startDate": "2025-01-06",
            "endDate": "2025-01-13"
        }),
    );
    assert_eq!(first.get("created").and_then(|v| v.as_u64()), Some(6));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.list",
        json!({ "sectionId": section_id }),
    );
    let records = listing
        .get("records")
        .and_then(|v| v.as_array())
        .expect("records");
    assert_eq!(records.len(), 6);
    for record in records {
        assert_eq!(record.get("status").and_then(|v| v.as_str()), Some("present"));
        assert_eq!(record.get("note").and_then(|v| v.as_str()), Some(""));
        let date = record.get("date").and_then(|v| v.as_str()).expect("date");
        assert!(
            ["2025-01-06", "2025-01-08", "2025-01-13"].contains(&date),
            "unexpected attendance date {}",
            date
        );
        let student = record
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId");
        assert_ne!(student, student_dropped, "dropped enrollment was materialized");
    }

    // A second pass over the same range is a no-op.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.materialize",
        json!({
            "sectionId": section_id,
            "startDate": "2025-01-06",
            "endDate": "2025-01-13"
        }),
    );
    assert_eq!(second.get("created").and_then(|v| v.as_u64()), Some(0));

    let relisting = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.list",
        json!({ "sectionId": section_id }),
    );
    assert_eq!(
        relisting
            .get("records")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(6)
    );
}

#[test]
fn materialize_unknown_section_is_not_found() {
    let workspace = temp_dir("schoolbook-att-materialize-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let value = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.materialize",
        json!({
            "sectionId": "no-such-section",
            "startDate": "2025-01-06",
            "endDate": "2025-01-13"
        }),
    );
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );
}
