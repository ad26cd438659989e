use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{DomainError, EnrollmentStatus};

/// (student, course) pairs checked per grouped lookup and inserted per
/// transaction. Bounds the IN-list size on large rosters.
const BACKFILL_CHUNK_PAIRS: usize = 250;

pub const AUTO_GENERATED_COMMENT: &str = "Auto-generated";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub created: usize,
    pub pairs: usize,
}

/// Seed a default zero-value grade row for every (student, course) pair an
/// enrolled enrollment implies and the given grade type does not cover yet.
/// Running it again creates nothing; racing it against itself is settled by
/// the (student, course, grade_type) unique key.
pub fn backfill_grades_for_type(
    conn: &Connection,
    grade_type_id: &str,
) -> Result<BackfillSummary, DomainError> {
    let active: Option<i64> = conn
        .query_row(
            "SELECT active FROM grade_types WHERE id = ?",
            [grade_type_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
    let Some(active) = active else {
        return Err(DomainError::new("not_found", "grade type not found"));
    };
    if active == 0 {
        debug!(grade_type_id, "grade type inactive; skipping backfill");
        return Ok(BackfillSummary {
            created: 0,
            pairs: 0,
        });
    }

    let mut pairs_stmt = conn
        .prepare(
            "SELECT DISTINCT student_id, course_id
             FROM enrollments
             WHERE status = ?
             ORDER BY student_id, course_id",
        )
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
    let pairs: Vec<(String, String)> = pairs_stmt
        .query_map([EnrollmentStatus::Enrolled.as_str()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;

    let mut created = 0usize;
    for chunk in pairs.chunks(BACKFILL_CHUNK_PAIRS) {
        let student_ids: Vec<&str> = chunk.iter().map(|(s, _)| s.as_str()).collect();
        let course_ids: Vec<&str> = chunk.iter().map(|(_, c)| c.as_str()).collect();

        // Grouped lookup: the IN lists overshoot to the chunk's id sets, the
        // pair filter happens in memory.
        let stud_placeholders = std::iter::repeat("?")
            .take(student_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let course_placeholders = std::iter::repeat("?")
            .take(course_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT student_id, course_id
             FROM grades
             WHERE grade_type_id = ? AND student_id IN ({}) AND course_id IN ({})",
            stud_placeholders, course_placeholders
        );
        let mut bind_values: Vec<Value> =
            Vec::with_capacity(1 + student_ids.len() + course_ids.len());
        bind_values.push(Value::Text(grade_type_id.to_string()));
        for id in &student_ids {
            bind_values.push(Value::Text((*id).to_string()));
        }
        for id in &course_ids {
            bind_values.push(Value::Text((*id).to_string()));
        }

        let mut existing_stmt = conn
            .prepare(&sql)
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
        let existing: HashSet<(String, String)> = existing_stmt
            .query_map(params_from_iter(bind_values), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| DomainError::new("db_tx_failed", e.to_string()))?;
        for (student_id, course_id) in chunk {
            if existing.contains(&(student_id.clone(), course_id.clone())) {
                continue;
            }
            let row_id = Uuid::new_v4().to_string();
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO grades(id, student_id, course_id, grade_type_id, value, comment, graded_at)
                     VALUES(?, ?, ?, ?, 0, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                    (&row_id, student_id, course_id, grade_type_id, AUTO_GENERATED_COMMENT),
                )
                .map_err(|e| {
                    DomainError::with_details(
                        "db_insert_failed",
                        e.to_string(),
                        serde_json::json!({ "table": "grades" }),
                    )
                })?;
            created += changed;
        }
        tx.commit()
            .map_err(|e| DomainError::new("db_commit_failed", e.to_string()))?;
    }

    debug!(grade_type_id, created, pairs = pairs.len(), "grade backfill done");
    Ok(BackfillSummary {
        created,
        pairs: pairs.len(),
    })
}
