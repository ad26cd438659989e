use crate::backfill;
use crate::catalog::{GradeTypeCatalog, SqliteCatalog};
use crate::ipc::error::{domain_err, err, ok};
use crate::ipc::types::{AppState, Request};
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

/// Backfill is a side effect of a catalog write, not the requested
/// operation. Its failure is logged; the catalog write stays committed.
fn run_backfill_best_effort(conn: &Connection, grade_type_id: &str) {
    if let Err(e) = backfill::backfill_grades_for_type(conn, grade_type_id) {
        warn!(
            grade_type_id,
            code = %e.code,
            message = %e.message,
            "grade backfill after catalog write failed"
        );
    }
}

fn grade_types_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?.trim().to_ascii_uppercase();
    let name = get_required_str(params, "name")?.trim().to_string();
    if code.is_empty() || name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "code and name must not be empty".to_string(),
            details: None,
        });
    }
    let weight = params
        .get("weight")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing weight".to_string(),
            details: None,
        })?;
    if weight <= 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "weight must be positive".to_string(),
            details: Some(json!({ "weight": weight })),
        });
    }
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);

    let sort_order = match params.get("sortOrder").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => {
            let max: Option<i64> = conn
                .query_row("SELECT MAX(sort_order) FROM grade_types", [], |r| r.get(0))
                .optional()
                .map_err(|e| HandlerErr {
                    code: "db_query_failed",
                    message: e.to_string(),
                    details: None,
                })?
                .flatten();
            max.map(|m| m + 1).unwrap_or(0)
        }
    };

    let duplicate = conn
        .query_row("SELECT 1 FROM grade_types WHERE code = ?", [&code], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if duplicate {
        return Err(HandlerErr {
            code: "conflict",
            message: "grade type code already exists".to_string(),
            details: Some(json!({ "code": code })),
        });
    }

    let grade_type_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_types(id, code, name, weight, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &grade_type_id,
            &code,
            &name,
            weight,
            active as i64,
            sort_order,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grade_types" })),
    })?;

    if active {
        run_backfill_best_effort(conn, &grade_type_id);
    }

    Ok(json!({ "gradeTypeId": grade_type_id, "code": code }))
}

fn grade_types_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_type_id = get_required_str(params, "gradeTypeId")?;

    let was_active: Option<i64> = conn
        .query_row(
            "SELECT active FROM grade_types WHERE id = ?",
            [&grade_type_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(was_active) = was_active else {
        return Err(HandlerErr {
            code: "not_found",
            message: "grade type not found".to_string(),
            details: None,
        });
    };

    if let Some(name) = params.get("name").and_then(|v| v.as_str()) {
        let name = name.trim();
        if name.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE grade_types SET name = ? WHERE id = ?",
            (name, &grade_type_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_types" })),
        })?;
    }

    if let Some(weight) = params.get("weight").and_then(|v| v.as_f64()) {
        if weight <= 0.0 {
            return Err(HandlerErr {
                code: "bad_params",
                message: "weight must be positive".to_string(),
                details: Some(json!({ "weight": weight })),
            });
        }
        conn.execute(
            "UPDATE grade_types SET weight = ? WHERE id = ?",
            (weight, &grade_type_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_types" })),
        })?;
    }

    if let Some(sort_order) = params.get("sortOrder").and_then(|v| v.as_i64()) {
        conn.execute(
            "UPDATE grade_types SET sort_order = ? WHERE id = ?",
            (sort_order, &grade_type_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_types" })),
        })?;
    }

    let mut now_active = was_active != 0;
    if let Some(active) = params.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE grade_types SET active = ? WHERE id = ?",
            (active as i64, &grade_type_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_types" })),
        })?;
        now_active = active;
    }

    // Re-activation is the backfill trigger; active->active is not.
    if was_active == 0 && now_active {
        run_backfill_best_effort(conn, &grade_type_id);
    }

    Ok(json!({ "ok": true }))
}

fn grade_types_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_type_id = get_required_str(params, "gradeTypeId")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM grade_types WHERE id = ?",
            [&grade_type_id],
            |r| r.get::<_, i64>(0),
        )
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
            message: "grade type not found".to_string(),
            details: None,
        });
    }

    let references: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE grade_type_id = ?",
            [&grade_type_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if references > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "grade type is referenced by existing grades".to_string(),
            details: Some(json!({ "references": references })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "DELETE FROM section_grade_types WHERE grade_type_id = ?",
        [&grade_type_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "section_grade_types" })),
    })?;
    tx.execute("DELETE FROM grade_types WHERE id = ?", [&grade_type_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_types" })),
        })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

/// Explicit backfill request: unlike the create/update side effect, errors
/// here propagate to the caller.
fn handle_grade_types_backfill(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grade_type_id = match req.params.get("gradeTypeId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing gradeTypeId", None),
    };
    match backfill::backfill_grades_for_type(conn, &grade_type_id) {
        Ok(summary) => ok(
            &req.id,
            serde_json::to_value(summary).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => domain_err(&req.id, e),
    }
}

fn grade_types_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name, weight, active, sort_order
             FROM grade_types
             ORDER BY sort_order",
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
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "weight": r.get::<_, f64>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "gradeTypes": rows }))
}

fn grade_types_effective(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;

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

    let catalog = SqliteCatalog::new(conn);
    let effective = catalog
        .effective_for_section(&section_id)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.message,
            details: e.details,
        })?;
    let rows: Vec<serde_json::Value> = effective
        .iter()
        .map(|gt| serde_json::to_value(gt).unwrap_or_else(|_| json!({})))
        .collect();

    Ok(json!({ "gradeTypes": rows }))
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
        "gradeTypes.create" => Some(with_conn(state, req, grade_types_create)),
        "gradeTypes.update" => Some(with_conn(state, req, grade_types_update)),
        "gradeTypes.delete" => Some(with_conn(state, req, grade_types_delete)),
        "gradeTypes.backfill" => Some(handle_grade_types_backfill(state, req)),
        "gradeTypes.list" => Some(with_conn(state, req, |conn, _| grade_types_list(conn))),
        "gradeTypes.effective" => Some(with_conn(state, req, grade_types_effective)),
        _ => None,
    }
}
