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

fn setup_roster(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(stdin, reader, "2", "courses.create", json!({ "name": "Math" }));
    let course_id = str_field(&course, "courseId");
    let section = request_ok(
        stdin,
        reader,
        "3",
        "sections.create",
        json!({ "courseId": course_id, "name": "Math A" }),
    );
    let section_id = str_field(&section, "sectionId");
    let student = request_ok(
        stdin,
        reader,
        "4",
        "students.create",
        json!({ "lastName": "Mori", "firstName": "Yuki" }),
    );
    let student_id = str_field(&student, "studentId");
    let _ = request_ok(
        stdin,
        reader,
        "5",
        "enrollments.create",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "sectionId": section_id
        }),
    );
    (course_id, section_id, student_id)
}

fn grade_count(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
) -> usize {
    let listing = request_ok(
        stdin,
        reader,
        "g",
        "grades.list",
        json!({ "studentId": student_id }),
    );
    listing
        .get("grades")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}

#[test]
fn homework_write_succeeds_when_catalog_has_no_homework_type() {
    let workspace = temp_dir("schoolbook-hw-soft-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_course_id, section_id, student_id) = setup_roster(&mut stdin, &mut reader, &workspace);

    // No grade types exist at all; the write must still land.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "homework.create",
        json!({
            "studentId": student_id,
            "sectionId": section_id,
            "points": 9,
            "maxPoints": 10
        }),
    );
    assert!(!str_field(&created, "homeworkId").is_empty());

    let homework = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "homework.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        homework
            .get("homework")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
    assert_eq!(grade_count(&mut stdin, &mut reader, &student_id), 0);
}

#[test]
fn stale_aggregate_heals_on_the_next_homework_write() {
    let workspace = temp_dir("schoolbook-hw-soft-inactive");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_course_id, section_id, student_id) = setup_roster(&mut stdin, &mut reader, &workspace);

    let hw_type = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "gradeTypes.create",
        json!({ "code": "HW", "name": "Homework", "weight": 1.0, "active": false }),
    );
    let hw_type_id = str_field(&hw_type, "gradeTypeId");

    // The type is inactive, so this write leaves no aggregate behind.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "homework.create",
        json!({
            "studentId": student_id,
            "sectionId": section_id,
            "points": 5,
            "maxPoints": 10
        }),
    );
    assert_eq!(grade_count(&mut stdin, &mut reader, &student_id), 0);

    // Activation alone seeds a zero row; the next homework write recomputes
    // over the full current set, catching up the item missed while inactive.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "gradeTypes.update",
        json!({ "gradeTypeId": hw_type_id, "active": true }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "homework.create",
        json!({
            "studentId": student_id,
            "sectionId": section_id,
            "points": 10,
            "maxPoints": 10
        }),
    );

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.list",
        json!({ "studentId": student_id }),
    );
    let grades = listing
        .get("grades")
        .and_then(|v| v.as_array())
        .expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].get("value").and_then(|v| v.as_f64()), Some(75.0));
}

#[test]
fn explicit_sync_is_silent_when_homework_type_is_missing() {
    let workspace = temp_dir("schoolbook-hw-soft-explicit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (course_id, _section_id, student_id) = setup_roster(&mut stdin, &mut reader, &workspace);

    let result = request(
        &mut stdin,
        &mut reader,
        "6",
        "grades.syncHomework",
        json!({ "studentId": student_id, "courseId": course_id }),
    );
    assert_eq!(result.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(grade_count(&mut stdin, &mut reader, &student_id), 0);
}
