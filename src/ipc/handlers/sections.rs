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

/// Weekday params accept an integer 0-6, explicit null (clear), or absence.
fn parse_weekday_param(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Option<i64>>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(Some(None));
    }
    let Some(n) = v.as_i64() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be an integer or null", key),
            details: None,
        });
    };
    if !(0..=6).contains(&n) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "weekday must be between 0 (Sunday) and 6 (Saturday)".to_string(),
            details: Some(json!({ "weekday": n })),
        });
    }
    Ok(Some(Some(n)))
}

fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn sections_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let weekday1 = parse_weekday_param(params, "weekday1")?.unwrap_or(None);
    let weekday2 = parse_weekday_param(params, "weekday2")?.unwrap_or(None);

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    let section_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, course_id, name, weekday1, weekday2)
         VALUES(?, ?, ?, ?, ?)",
        (&section_id, &course_id, &name, weekday1, weekday2),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "sections" })),
    })?;

    Ok(json!({ "sectionId": section_id }))
}

fn sections_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;

    let exists = conn
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
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    // Validate everything up front so a bad weekday cannot leave a
    // half-applied edit behind.
    let name = match params.get("name").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "name must not be empty".to_string(),
                    details: None,
                });
            }
            Some(trimmed.to_string())
        }
    };
    let weekday1 = parse_weekday_param(params, "weekday1")?;
    let weekday2 = parse_weekday_param(params, "weekday2")?;

    if let Some(name) = name {
        conn.execute(
            "UPDATE sections SET name = ? WHERE id = ?",
            (&name, &section_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "sections" })),
        })?;
    }
    if let Some(weekday1) = weekday1 {
        conn.execute(
            "UPDATE sections SET weekday1 = ? WHERE id = ?",
            (weekday1, &section_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "sections" })),
        })?;
    }
    if let Some(weekday2) = weekday2 {
        conn.execute(
            "UPDATE sections SET weekday2 = ? WHERE id = ?",
            (weekday2, &section_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "sections" })),
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn sections_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.course_id, s.name, s.weekday1, s.weekday2,
               (SELECT COUNT(*) FROM enrollments e
                WHERE e.section_id = s.id AND e.status = 'enrolled') AS enrolled_count
             FROM sections s
             ORDER BY s.name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "weekday1": r.get::<_, Option<i64>>(3)?,
                "weekday2": r.get::<_, Option<i64>>(4)?,
                "enrolledCount": r.get::<_, i64>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "sections": rows }))
}

fn sections_set_grade_types(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };

    let exists = conn
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
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    struct OverrideEntry {
        grade_type_id: String,
        active: bool,
        sort_order: i64,
    }

    let mut parsed: Vec<OverrideEntry> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(grade_type_id) = entry.get("gradeTypeId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("entries[{}] missing gradeTypeId", i),
                details: None,
            });
        };
        let active = entry.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
        let sort_order = entry
            .get("sortOrder")
            .and_then(|v| v.as_i64())
            .unwrap_or(i as i64);

        let known = conn
            .query_row(
                "SELECT 1 FROM grade_types WHERE id = ?",
                [grade_type_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !known {
            return Err(HandlerErr {
                code: "not_found",
                message: "grade type not found".to_string(),
                details: Some(json!({ "gradeTypeId": grade_type_id })),
            });
        }
        parsed.push(OverrideEntry {
            grade_type_id: grade_type_id.to_string(),
            active,
            sort_order,
        });
    }

    // Replace the section's override set wholesale. Grade rows are never
    // touched here; overrides only shape what the section displays.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "DELETE FROM section_grade_types WHERE section_id = ?",
        [&section_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "section_grade_types" })),
    })?;
    for entry in &parsed {
        tx.execute(
            "INSERT INTO section_grade_types(section_id, grade_type_id, active, sort_order)
             VALUES(?, ?, ?, ?)",
            (
                &section_id,
                &entry.grade_type_id,
                entry.active as i64,
                entry.sort_order,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "section_grade_types" })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true, "entryCount": parsed.len() }))
}

fn handle_schedule_expand(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let section = match materialize::load_section(conn, &section_id) {
        Ok(s) => s,
        Err(e) => return domain_err(&req.id, e),
    };
    let start = match schedule::parse_iso_date(&start_raw) {
        Ok(d) => d,
        Err(e) => return domain_err(&req.id, e),
    };
    let end = match schedule::parse_iso_date(&end_raw) {
        Ok(d) => d,
        Err(e) => return domain_err(&req.id, e),
    };

    match schedule::expand_schedule(section.weekday1, section.weekday2, start, end) {
        Ok(dates) => {
            let rendered: Vec<String> =
                dates.into_iter().map(schedule::format_iso_date).collect();
            ok(&req.id, json!({ "dates": rendered }))
        }
        Err(e) => domain_err(&req.id, e),
    }
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
        "sections.create" => Some(with_conn(state, req, sections_create)),
        "sections.update" => Some(with_conn(state, req, sections_update)),
        "sections.list" => Some(with_conn(state, req, |conn, _| sections_list(conn))),
        "sections.setGradeTypes" => Some(with_conn(state, req, sections_set_grade_types)),
        "schedule.expand" => Some(handle_schedule_expand(state, req)),
        _ => None,
    }
}
