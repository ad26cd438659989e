use crate::catalog::SqliteCatalog;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use crate::sync;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
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

fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn validate_points(points: f64, max_points: f64) -> Result<(), HandlerErr> {
    if points < 0.0 || max_points < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "points and maxPoints must not be negative".to_string(),
            details: Some(json!({ "points": points, "maxPoints": max_points })),
        });
    }
    Ok(())
}

/// The grade recompute rides along after the homework write. It is
/// best-effort by design: a failed sync leaves the aggregate stale until the
/// next homework write, and never fails the write that triggered it.
fn sync_best_effort(conn: &Connection, student_id: &str, course_id: &str) {
    let catalog = SqliteCatalog::new(conn);
    if let Err(e) = sync::sync_homework_grade(conn, &catalog, student_id, Some(course_id)) {
        warn!(
            student_id,
            course_id,
            code = %e.code,
            message = %e.message,
            "homework grade sync failed; aggregate is stale until the next homework write"
        );
    }
}

fn course_of_section(conn: &Connection, section_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT course_id FROM sections WHERE id = ?",
        [section_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn homework_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let points = get_required_f64(params, "points")?;
    let max_points = get_required_f64(params, "maxPoints")?;
    validate_points(points, max_points)?;

    let due_date = match params.get("dueDate").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => Some(
            schedule::parse_iso_date(raw)
                .map(schedule::format_iso_date)
                .map_err(|e| HandlerErr {
                    code: "bad_params",
                    message: e.message,
                    details: e.details,
                })?,
        ),
    };

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
    let Some(course_id) = course_of_section(conn, &section_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    };

    let homework_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO homework(id, student_id, section_id, points, max_points, due_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &homework_id,
            &student_id,
            &section_id,
            points,
            max_points,
            &due_date,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "homework" })),
    })?;

    sync_best_effort(conn, &student_id, &course_id);

    Ok(json!({ "homeworkId": homework_id }))
}

fn homework_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let homework_id = get_required_str(params, "homeworkId")?;

    let row: Option<(String, String, f64, f64)> = conn
        .query_row(
            "SELECT student_id, section_id, points, max_points FROM homework WHERE id = ?",
            [&homework_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((student_id, section_id, old_points, old_max)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "homework not found".to_string(),
            details: None,
        });
    };

    let points = params
        .get("points")
        .and_then(|v| v.as_f64())
        .unwrap_or(old_points);
    let max_points = params
        .get("maxPoints")
        .and_then(|v| v.as_f64())
        .unwrap_or(old_max);
    validate_points(points, max_points)?;

    // Parse before the first write so a bad due date rejects the whole edit.
    let due_date = match params.get("dueDate") {
        None => None,
        Some(v) if v.is_null() => Some(None),
        Some(v) => {
            let Some(raw) = v.as_str() else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "dueDate must be a string or null".to_string(),
                    details: None,
                });
            };
            let parsed = schedule::parse_iso_date(raw)
                .map(schedule::format_iso_date)
                .map_err(|e| HandlerErr {
                    code: "bad_params",
                    message: e.message,
                    details: e.details,
                })?;
            Some(Some(parsed))
        }
    };

    conn.execute(
        "UPDATE homework SET points = ?, max_points = ? WHERE id = ?",
        (points, max_points, &homework_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "homework" })),
    })?;

    if let Some(due_date) = due_date {
        conn.execute(
            "UPDATE homework SET due_date = ? WHERE id = ?",
            (&due_date, &homework_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "homework" })),
        })?;
    }

    if let Some(course_id) = course_of_section(conn, &section_id)? {
        sync_best_effort(conn, &student_id, &course_id);
    }

    Ok(json!({ "ok": true }))
}

fn homework_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let homework_id = get_required_str(params, "homeworkId")?;

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT student_id, section_id FROM homework WHERE id = ?",
            [&homework_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((student_id, section_id)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "homework not found".to_string(),
            details: None,
        });
    };

    conn.execute("DELETE FROM homework WHERE id = ?", [&homework_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "homework" })),
        })?;

    // Recompute from what remains; the deleted item must fall out of the
    // aggregate, not be subtracted from it.
    if let Some(course_id) = course_of_section(conn, &section_id)? {
        sync_best_effort(conn, &student_id, &course_id);
    }

    Ok(json!({ "ok": true }))
}

fn homework_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT h.id, h.section_id, s.course_id, h.points, h.max_points, h.due_date
             FROM homework h
             JOIN sections s ON s.id = h.section_id
             WHERE h.student_id = ?
             ORDER BY h.due_date IS NULL, h.due_date, h.rowid",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "sectionId": r.get::<_, String>(1)?,
                "courseId": r.get::<_, String>(2)?,
                "points": r.get::<_, f64>(3)?,
                "maxPoints": r.get::<_, f64>(4)?,
                "dueDate": r.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "homework": rows }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "homework.create" => Some(with_conn(state, req, homework_create)),
        "homework.update" => Some(with_conn(state, req, homework_update)),
        "homework.delete" => Some(with_conn(state, req, homework_delete)),
        "homework.list" => Some(with_conn(state, req, homework_list)),
        _ => None,
    }
}
