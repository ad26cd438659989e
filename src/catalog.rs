use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::domain::DomainError;

/// Canonical catalog code of the homework category the aggregator writes to.
pub const HOMEWORK_CODE: &str = "HW";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeTypeInfo {
    pub id: String,
    pub code: String,
    pub name: String,
    pub weight: f64,
    pub active: bool,
    pub sort_order: i64,
}

/// Read interface over the grade-type catalog. The homework aggregator and
/// the IPC layer consume the catalog only through this trait, so the
/// "catalog has no such code" path can be driven in isolation.
pub trait GradeTypeCatalog {
    /// Look up a globally active grade type by its stable code.
    fn active_by_code(&self, code: &str) -> Result<Option<GradeTypeInfo>, DomainError>;

    /// The grade types a section shows and edits. With at least one override
    /// row the list is the section-active overrides in section order;
    /// otherwise the full globally-active catalog in global order.
    fn effective_for_section(&self, section_id: &str) -> Result<Vec<GradeTypeInfo>, DomainError>;
}

pub struct SqliteCatalog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCatalog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl GradeTypeCatalog for SqliteCatalog<'_> {
    fn active_by_code(&self, code: &str) -> Result<Option<GradeTypeInfo>, DomainError> {
        self.conn
            .query_row(
                "SELECT id, code, name, weight, active, sort_order
                 FROM grade_types
                 WHERE code = ? AND active = 1",
                [code],
                |r| {
                    Ok(GradeTypeInfo {
                        id: r.get(0)?,
                        code: r.get(1)?,
                        name: r.get(2)?,
                        weight: r.get(3)?,
                        active: r.get::<_, i64>(4)? != 0,
                        sort_order: r.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))
    }

    fn effective_for_section(&self, section_id: &str) -> Result<Vec<GradeTypeInfo>, DomainError> {
        let mut override_stmt = self
            .conn
            .prepare(
                "SELECT gt.id, gt.code, gt.name, gt.weight, sgt.active, sgt.sort_order
                 FROM section_grade_types sgt
                 JOIN grade_types gt ON gt.id = sgt.grade_type_id
                 WHERE sgt.section_id = ?
                 ORDER BY sgt.sort_order",
            )
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
        let overrides: Vec<GradeTypeInfo> = override_stmt
            .query_map([section_id], |r| {
                Ok(GradeTypeInfo {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                    weight: r.get(3)?,
                    active: r.get::<_, i64>(4)? != 0,
                    sort_order: r.get(5)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;

        if !overrides.is_empty() {
            return Ok(overrides.into_iter().filter(|gt| gt.active).collect());
        }

        let mut global_stmt = self
            .conn
            .prepare(
                "SELECT id, code, name, weight, active, sort_order
                 FROM grade_types
                 WHERE active = 1
                 ORDER BY sort_order",
            )
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))?;
        global_stmt
            .query_map([], |r| {
                Ok(GradeTypeInfo {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                    weight: r.get(3)?,
                    active: r.get::<_, i64>(4)? != 0,
                    sort_order: r.get(5)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| DomainError::new("db_query_failed", e.to_string()))
    }
}
