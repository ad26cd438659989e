use crate::domain::AttendanceStatus;
use crate::ipc::error::{domain_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::materialize;
use crate::schedule;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn handle_attendance_materialize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let start_raw = match req.params.get("startDate").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing startDate", None),
    };
    let end_raw = match req.params.get("endDate").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing endDate", None),
    };

    let start = match schedule::parse_iso_date(&start_raw) {
        Ok(d) => d,
        Err(e) => return domain_err(&req.id, e),
    };
    let end = match schedule::parse_iso_date(&end_raw) {
        Ok(d) => d,
        Err(e) => return domain_err(&req.id, e),
    };

    match materialize::materialize_attendance(conn, &section_id, start, end) {
        Ok(summary) => ok(
            &req.id,
            serde_json::to_value(summary).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => domain_err(&req.id, e),
    }
}

fn attendance_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let date_raw = get_required_str(params, "date")?;
    let status_raw = get_required_str(params, "status")?;
    let note = params
        .get("note")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let date = schedule::parse_iso_date(&date_raw).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.message,
        details: e.details,
    })?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "status must be one of: present, absent, late, excused".to_string(),
            details: Some(json!({ "status": status_raw })),
        });
    };

    let section_exists = conn
        .query_row("SELECT 1 FROM sections WHERE id = ?", [&section_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !section_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }
    let student_exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !student_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    // An explicit user write takes the cell as-is, overwriting whatever the
    // materializer or a previous edit left there.
    let date_str = schedule::format_iso_date(date);
    let row_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance(id, section_id, student_id, date, status, note)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(section_id, student_id, date) DO UPDATE SET
           status = excluded.status,
           note = excluded.note",
        (
            &row_id,
            &section_id,
            &student_id,
            &date_str,
            status.as_str(),
            &note,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;

    Ok(json!({
        "sectionId": section_id,
        "studentId": student_id,
        "date": date_str,
        "status": status.as_str(),
        "note": note
    }))
}

fn attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    let start = params
        .get("startDate")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let end = params
        .get("endDate")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let section_exists = conn
        .query_row("SELECT 1 FROM sections WHERE id = ?", [&section_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !section_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT student_id, date, status, note
             FROM attendance
             WHERE section_id = ?1
               AND (?2 IS NULL OR date >= ?2)
               AND (?3 IS NULL OR date <= ?3)
             ORDER BY date, student_id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map((&section_id, &start, &end), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "note": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "records": rows }))
}

fn handle_attendance_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_set(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.materialize" => Some(handle_attendance_materialize(state, req)),
        "attendance.set" => Some(handle_attendance_set(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        _ => None,
    }
}
