use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::calc::HomeworkTotals;
use crate::catalog::{GradeTypeCatalog, GradeTypeInfo, HOMEWORK_CODE};
use crate::domain::{DomainError, EnrollmentStatus};

pub const AUTO_SYNCED_COMMENT: &str = "Auto-synced from homework";

/// Recompute a student's homework percentage and write it through to the
/// homework grade row, per course.
///
/// The aggregate is rebuilt from the full current homework set on every call;
/// a stale value left by a crash between a homework write and this sync heals
/// on the next homework write. A missing or inactive homework grade type
/// only logs; the triggering homework write must never fail over it.
pub fn sync_homework_grade(
    conn: &Connection,
    catalog: &dyn GradeTypeCatalog,
    student_id: &str,
    course_id: Option<&str>,
) -> Result<(), DomainError> {
    let Some(hw_type) = catalog.active_by_code(HOMEWORK_CODE)? else {
        warn!(
            student_id,
            code = HOMEWORK_CODE,
            "homework grade type missing or inactive; skipping grade sync"
        );
        return Ok(());
    };

    match course_id {
        Some(course_id) => {
            let totals = course_totals(conn, student_id, course_id)?;
            write_through(conn, student_id, course_id, &hw_type, totals.percent())?;
        }
        None => {
            let by_course = totals_by_course(conn, student_id)?;
            if by_course.is_empty() {
                // No homework to group by: fall back to the student's first
                // enrolled course. Ambiguous for multi-course students; the
                // warning is the acknowledgement, not a resolution.
                let Some(course_id) = first_enrolled_course(conn, student_id)? else {
                    debug!(student_id, "no homework and no enrolled course; nothing to sync");
                    return Ok(());
                };
                if enrolled_course_count(conn, student_id)? > 1 {
                    warn!(
                        student_id,
                        course_id = %course_id,
                        "multiple enrolled courses; homework grade synced to first enrollment"
                    );
                }
                write_through(conn, student_id, &course_id, &hw_type, 0.0)?;
            } else {
                for (course_id, totals) in by_course {
                    write_through(conn, student_id, &course_id, &hw_type, totals.percent())?;
                }
            }
        }
    }
    Ok(())
}

fn course_totals(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<HomeworkTotals, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT h.points, h.max_points
             FROM homework h
             JOIN sections s ON s.id = h.section_id
             WHERE h.student_id = ? AND s.course_id = ?",
        )
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((student_id, course_id), |r| {
            Ok((r.get::<_, f64>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;

    let mut totals = HomeworkTotals::default();
    for (points, max_points) in rows {
        totals.add(points, max_points);
    }
    Ok(totals)
}

fn totals_by_course(
    conn: &Connection,
    student_id: &str,
) -> Result<BTreeMap<String, HomeworkTotals>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.course_id, h.points, h.max_points
             FROM homework h
             JOIN sections s ON s.id = h.section_id
             WHERE h.student_id = ?",
        )
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;

    let mut by_course: BTreeMap<String, HomeworkTotals> = BTreeMap::new();
    for (course_id, points, max_points) in rows {
        by_course.entry(course_id).or_default().add(points, max_points);
    }
    Ok(by_course)
}

fn first_enrolled_course(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<String>, DomainError> {
    conn.query_row(
        "SELECT course_id
         FROM enrollments
         WHERE student_id = ? AND status = ?
         ORDER BY rowid
         LIMIT 1",
        (student_id, EnrollmentStatus::Enrolled.as_str()),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| DomainError::new("db_query_failed", e.to_string()))
}

fn enrolled_course_count(conn: &Connection, student_id: &str) -> Result<i64, DomainError> {
    conn.query_row(
        "SELECT COUNT(DISTINCT course_id)
         FROM enrollments
         WHERE student_id = ? AND status = ?",
        (student_id, EnrollmentStatus::Enrolled.as_str()),
        |r| r.get(0),
    )
    .map_err(|e| DomainError::new("db_query_failed", e.to_string()))
}

/// Update the grade row if it exists, else create it carrying the
/// auto-synced comment. The upsert keys on the (student, course, grade type)
/// unique constraint, so a racing create collapses into the update arm; a
/// pre-existing comment (user-written or backfill marker) is left alone.
fn write_through(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    hw_type: &GradeTypeInfo,
    value: f64,
) -> Result<(), DomainError> {
    let row_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, course_id, grade_type_id, value, comment, graded_at)
         VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(student_id, course_id, grade_type_id) DO UPDATE SET
           value = excluded.value,
           graded_at = excluded.graded_at",
        (
            &row_id,
            student_id,
            course_id,
            &hw_type.id,
            value,
            AUTO_SYNCED_COMMENT,
        ),
    )
    .map_err(|e| {
        DomainError::with_details(
            "db_insert_failed",
            e.to_string(),
            serde_json::json!({ "table": "grades" }),
        )
    })?;
    debug!(student_id, course_id, value, "homework grade synced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    struct EmptyCatalog;

    impl GradeTypeCatalog for EmptyCatalog {
        fn active_by_code(&self, _code: &str) -> Result<Option<GradeTypeInfo>, DomainError> {
            Ok(None)
        }

        fn effective_for_section(
            &self,
            _section_id: &str,
        ) -> Result<Vec<GradeTypeInfo>, DomainError> {
            Ok(Vec::new())
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::create_schema(&conn).expect("create schema");
        conn
    }

    fn seed_roster(conn: &Connection) {
        conn.execute("INSERT INTO courses(id, name) VALUES('c1', 'Math')", [])
            .expect("course");
        conn.execute(
            "INSERT INTO students(id, last_name, first_name) VALUES('st1', 'Doe', 'Jan')",
            [],
        )
        .expect("student");
        conn.execute(
            "INSERT INTO sections(id, course_id, name, weekday1, weekday2)
             VALUES('sec1', 'c1', 'Math A', 1, 3)",
            [],
        )
        .expect("section");
        conn.execute(
            "INSERT INTO enrollments(id, student_id, course_id, section_id, status)
             VALUES('e1', 'st1', 'c1', 'sec1', 'enrolled')",
            [],
        )
        .expect("enrollment");
    }

    fn grade_value(conn: &Connection) -> Option<f64> {
        conn.query_row(
            "SELECT value FROM grades WHERE student_id = 'st1' AND course_id = 'c1'",
            [],
            |r| r.get(0),
        )
        .optional()
        .expect("query grade")
    }

    #[test]
    fn missing_homework_type_is_a_soft_failure() {
        let conn = test_conn();
        seed_roster(&conn);
        conn.execute(
            "INSERT INTO homework(id, student_id, section_id, points, max_points)
             VALUES('h1', 'st1', 'sec1', 80, 100)",
            [],
        )
        .expect("homework");

        sync_homework_grade(&conn, &EmptyCatalog, "st1", None).expect("sync is a no-op");
        assert_eq!(grade_value(&conn), None);
    }

    #[test]
    fn unscoped_sync_groups_by_course_and_rounds() {
        let conn = test_conn();
        seed_roster(&conn);
        conn.execute(
            "INSERT INTO grade_types(id, code, name, weight, active, sort_order)
             VALUES('gt-hw', 'HW', 'Homework', 1.0, 1, 0)",
            [],
        )
        .expect("grade type");
        conn.execute(
            "INSERT INTO homework(id, student_id, section_id, points, max_points)
             VALUES('h1', 'st1', 'sec1', 80, 100), ('h2', 'st1', 'sec1', 60, 100)",
            [],
        )
        .expect("homework");

        let catalog = crate::catalog::SqliteCatalog::new(&conn);
        sync_homework_grade(&conn, &catalog, "st1", None).expect("sync");
        assert_eq!(grade_value(&conn), Some(70.0));

        let comment: String = conn
            .query_row(
                "SELECT comment FROM grades WHERE student_id = 'st1' AND course_id = 'c1'",
                [],
                |r| r.get(0),
            )
            .expect("comment");
        assert_eq!(comment, AUTO_SYNCED_COMMENT);
    }

    #[test]
    fn zero_homework_falls_back_to_first_enrolled_course() {
        let conn = test_conn();
        seed_roster(&conn);
        conn.execute(
            "INSERT INTO grade_types(id, code, name, weight, active, sort_order)
             VALUES('gt-hw', 'HW', 'Homework', 1.0, 1, 0)",
            [],
        )
        .expect("grade type");

        let catalog = crate::catalog::SqliteCatalog::new(&conn);
        sync_homework_grade(&conn, &catalog, "st1", None).expect("sync");
        assert_eq!(grade_value(&conn), Some(0.0));
    }

    #[test]
    fn write_through_updates_value_but_keeps_existing_comment() {
        let conn = test_conn();
        seed_roster(&conn);
        conn.execute(
            "INSERT INTO grade_types(id, code, name, weight, active, sort_order)
             VALUES('gt-hw', 'HW', 'Homework', 1.0, 1, 0)",
            [],
        )
        .expect("grade type");
        conn.execute(
            "INSERT INTO grades(id, student_id, course_id, grade_type_id, value, comment)
             VALUES('g1', 'st1', 'c1', 'gt-hw', 0, 'Auto-generated')",
            [],
        )
        .expect("seed grade");
        conn.execute(
            "INSERT INTO homework(id, student_id, section_id, points, max_points)
             VALUES('h1', 'st1', 'sec1', 45, 50)",
            [],
        )
        .expect("homework");

        let catalog = crate::catalog::SqliteCatalog::new(&conn);
        sync_homework_grade(&conn, &catalog, "st1", Some("c1")).expect("sync");
        assert_eq!(grade_value(&conn), Some(90.0));

        let comment: String = conn
            .query_row("SELECT comment FROM grades WHERE id = 'g1'", [], |r| r.get(0))
            .expect("comment");
        assert_eq!(comment, "Auto-generated");
    }
}
