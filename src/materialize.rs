use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{AttendanceStatus, DomainError, EnrollmentStatus};
use crate::schedule;

/// Rows inserted per transaction while rolling a range. A failed chunk rolls
/// back alone; chunks already committed stay committed.
const MATERIALIZE_CHUNK_ROWS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeSummary {
    pub created: usize,
    pub dates: usize,
    pub students: usize,
}

#[derive(Debug, Clone)]
pub struct SectionPattern {
    pub id: String,
    pub weekday1: Option<i64>,
    pub weekday2: Option<i64>,
}

pub fn load_section(conn: &Connection, section_id: &str) -> Result<SectionPattern, DomainError> {
    conn.query_row(
        "SELECT id, weekday1, weekday2 FROM sections WHERE id = ?",
        [section_id],
        |r| {
            Ok(SectionPattern {
                id: r.get(0)?,
                weekday1: r.get(1)?,
                weekday2: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?
    .ok_or_else(|| DomainError::new("not_found", "section not found"))
}

fn enrolled_student_ids(conn: &Connection, section_id: &str) -> Result<Vec<String>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT student_id
             FROM enrollments
             WHERE section_id = ? AND status = ?
             ORDER BY student_id",
        )
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
    stmt.query_map(
        (section_id, EnrollmentStatus::Enrolled.as_str()),
        |r| r.get::<_, String>(0),
    )
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| DomainError::new("db_query_failed", e.to_string()))
}

/// Ensure one attendance row per (enrolled student, matching date) in the
/// range. Existing rows are never touched; only the missing cells are
/// created, with default status `present` and an empty note. Races on the
/// same cell are settled by the (section, student, date) unique key, so a
/// concurrent call can only lose the insert, not overwrite anything.
pub fn materialize_attendance(
    conn: &Connection,
    section_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<MaterializeSummary, DomainError> {
    let section = load_section(conn, section_id)?;
    let dates = schedule::expand_schedule(section.weekday1, section.weekday2, start, end)?;
    let students = enrolled_student_ids(conn, section_id)?;

    if dates.is_empty() || students.is_empty() {
        return Ok(MaterializeSummary {
            created: 0,
            dates: dates.len(),
            students: students.len(),
        });
    }

    // One existence sweep over the whole range instead of a probe per cell.
    let mut existing: HashSet<(String, String)> = HashSet::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT student_id, date
                 FROM attendance
                 WHERE section_id = ? AND date >= ? AND date <= ?",
            )
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
        let rows = stmt
            .query_map(
                (
                    section_id,
                    schedule::format_iso_date(start),
                    schedule::format_iso_date(end),
                ),
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
        for pair in rows {
            existing.insert(pair);
        }
    }

    let mut pending: Vec<(String, String)> = Vec::new();
    for date in &dates {
        let date_str = schedule::format_iso_date(*date);
        for student_id in &students {
            if !existing.contains(&(student_id.clone(), date_str.clone())) {
                pending.push((student_id.clone(), date_str.clone()));
            }
        }
    }

    let mut created = 0usize;
    for chunk in pending.chunks(MATERIALIZE_CHUNK_ROWS) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| DomainError::new("db_tx_failed", e.to_string()))?;
        for (student_id, date_str) in chunk {
            let row_id = Uuid::new_v4().to_string();
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO attendance(id, section_id, student_id, date, status, note)
                     VALUES(?, ?, ?, ?, ?, '')",
                    (
                        &row_id,
                        section_id,
                        student_id,
                        date_str,
                        AttendanceStatus::Present.as_str(),
                    ),
                )
                .map_err(|e| {
                    DomainError::with_details(
                        "db_insert_failed",
                        e.to_string(),
                        serde_json::json!({ "table": "attendance" }),
                    )
                })?;
            created += changed;
        }
        tx.commit()
            .map_err(|e| DomainError::new("db_commit_failed", e.to_string()))?;
    }

    debug!(
        section_id = %section.id,
        created,
        dates = dates.len(),
        students = students.len(),
        "materialized attendance range"
    );
    Ok(MaterializeSummary {
        created,
        dates: dates.len(),
        students: students.len(),
    })
}
