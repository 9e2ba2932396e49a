use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "roster.sqlite3";

/// Belt ladder seeded into fresh workspaces. grade_level is the rank
/// string the UI uses for badge coloring ("1D" and up are Dan ranks).
const DEFAULT_GRADES: &[(&str, &str)] = &[
    ("White Grade", "0"),
    ("Yellow Grade", "8"),
    ("Green Grade", "6"),
    ("Blue Grade", "4"),
    ("Red Grade", "2"),
    ("Black Grade", "1D"),
];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id INTEGER PRIMARY KEY,
            grade_name TEXT NOT NULL UNIQUE,
            grade_level TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id INTEGER PRIMARY KEY,
            class_name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            tm_number TEXT NOT NULL,
            ic_number TEXT NOT NULL,
            name TEXT NOT NULL,
            current_grade_id INTEGER NOT NULL,
            class_id INTEGER NOT NULL,
            remarks TEXT,
            is_active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(current_grade_id) REFERENCES grades(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    // tm/ic numbers are unique among active students only; a soft-deleted
    // student's identifiers may be reused. The partial indexes are the
    // real enforcement point, handler pre-checks just give nicer errors.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_tm_active
         ON students(tm_number) WHERE is_active = 1",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_ic_active
         ON students(ic_number) WHERE is_active = 1",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL CHECK(month BETWEEN 0 AND 12),
            payment_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, year, month)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payment_records_student_year
         ON payment_records(student_id, year)",
        [],
    )?;

    migrate_renewal_column(&conn)?;
    seed_default_grades(&conn)?;

    Ok(conn)
}

/// Fold the abandoned dual-schema renewal representation into the
/// canonical month = 0 slot.
///
/// Older workspaces stored the annual renewal as a dedicated
/// renewal_payment date column alongside the monthly row, outside the
/// (student_id, year, month) key. Every non-null value becomes the
/// month = 0 row for that (student, year), then the legacy column is
/// blanked so it can never disagree with the slot again.
fn migrate_renewal_column(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "payment_records", "renewal_payment")? {
        return Ok(());
    }

    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT student_id, year, renewal_payment
         FROM payment_records
         WHERE renewal_payment IS NOT NULL",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (student_id, year, renewal_date) in rows {
        conn.execute(
            "INSERT INTO payment_records(id, student_id, year, month, payment_date, created_at, updated_at)
             VALUES(?, ?, ?, 0, ?, ?, ?)
             ON CONFLICT(student_id, year, month) DO UPDATE SET
               payment_date = excluded.payment_date,
               updated_at = excluded.updated_at",
            (
                uuid::Uuid::new_v4().to_string(),
                &student_id,
                year,
                &renewal_date,
                &now,
                &now,
            ),
        )?;
    }
    conn.execute(
        "UPDATE payment_records SET renewal_payment = NULL WHERE renewal_payment IS NOT NULL",
        [],
    )?;
    Ok(())
}

fn seed_default_grades(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM grades", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    let now = Utc::now().to_rfc3339();
    for (name, level) in DEFAULT_GRADES {
        conn.execute(
            "INSERT INTO grades(grade_name, grade_level, created_at) VALUES(?, ?, ?)",
            (name, level, &now),
        )?;
    }
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
