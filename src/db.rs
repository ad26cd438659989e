use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "schoolbook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weekday1 INTEGER,
            weekday2 INTEGER,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    // Early workspaces only carried a single meeting day.
    ensure_sections_weekday2(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_course ON sections(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            section_id TEXT,
            status TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section_status ON enrollments(section_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student_status ON enrollments(student_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(section_id, student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_section_date ON attendance(section_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_types(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            weight REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_grade_types(
            section_id TEXT NOT NULL,
            grade_type_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(section_id, grade_type_id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(grade_type_id) REFERENCES grade_types(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_section_grade_types_section ON section_grade_types(section_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            grade_type_id TEXT NOT NULL,
            value REAL NOT NULL,
            comment TEXT,
            graded_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(grade_type_id) REFERENCES grade_types(id),
            UNIQUE(student_id, course_id, grade_type_id)
        )",
        [],
    )?;
    ensure_grades_graded_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_type ON grades(grade_type_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_course ON grades(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS homework(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            points REAL NOT NULL,
            max_points REAL NOT NULL,
            due_date TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    ensure_homework_due_date(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_homework_student ON homework(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_homework_section ON homework(section_id)",
        [],
    )?;

    // Migrate older workspaces that stored single-letter attendance codes.
    migrate_attendance_statuses(conn)?;

    Ok(())
}

fn ensure_sections_weekday2(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sections", "weekday2")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE sections ADD COLUMN weekday2 INTEGER", [])?;
    Ok(())
}

fn ensure_grades_graded_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "graded_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN graded_at TEXT", [])?;
    Ok(())
}

fn ensure_homework_due_date(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "homework", "due_date")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE homework ADD COLUMN due_date TEXT", [])?;
    Ok(())
}

fn migrate_attendance_statuses(conn: &Connection) -> anyhow::Result<()> {
    // Older DBs used single-letter day codes; current statuses are full words.
    conn.execute(
        "UPDATE attendance SET status = 'present' WHERE status = 'P'",
        [],
    )?;
    conn.execute(
        "UPDATE attendance SET status = 'absent' WHERE status = 'A'",
        [],
    )?;
    conn.execute("UPDATE attendance SET status = 'late' WHERE status = 'L'", [])?;
    conn.execute(
        "UPDATE attendance SET status = 'excused' WHERE status = 'E'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
