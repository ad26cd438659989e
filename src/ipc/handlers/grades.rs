use crate::catalog::SqliteCatalog;
use crate::ipc::error::{domain_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sync;
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_grades_sync_homework(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let course_id = req
        .params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let student_exists = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !student_exists {
        return err(&req.id, "not_found", "student not found", None);
    }
    if let Some(course_id) = course_id.as_deref() {
        let course_exists = match conn
            .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
        {
            Ok(v) => v.is_some(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if !course_exists {
            return err(&req.id, "not_found", "course not found", None);
        }
    }

    let catalog = SqliteCatalog::new(conn);
    match sync::sync_homework_grade(conn, &catalog, &student_id, course_id.as_deref()) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, e),
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let course_id = req
        .params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.student_id, g.course_id, g.grade_type_id, gt.code, g.value, g.comment, g.graded_at
         FROM grades g
         JOIN grade_types gt ON gt.id = g.grade_type_id
         WHERE (?1 IS NULL OR g.student_id = ?1)
           AND (?2 IS NULL OR g.course_id = ?2)
         ORDER BY g.student_id, g.course_id, gt.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&student_id, &course_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "courseId": r.get::<_, String>(2)?,
                "gradeTypeId": r.get::<_, String>(3)?,
                "gradeTypeCode": r.get::<_, String>(4)?,
                "value": r.get::<_, f64>(5)?,
                "comment": r.get::<_, Option<String>>(6)?,
                "gradedAt": r.get::<_, Option<String>>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.syncHomework" => Some(handle_grades_sync_homework(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        _ => None,
    }
}
