use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_ref_id, get_required_str, is_unique_violation, now_iso};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const TM_CONFLICT_MSG: &str =
    "TM Number already exists for an active student. Please use a different TM Number.";
const IC_CONFLICT_MSG: &str =
    "IC Number already exists for an active student. Please use a different IC Number.";

const STUDENT_SELECT: &str = "SELECT
    s.id, s.student_id, s.tm_number, s.ic_number, s.name, s.remarks,
    s.is_active, s.created_at, s.updated_at,
    g.id, g.grade_name, g.grade_level,
    c.id, c.class_name
  FROM students s
  JOIN grades g ON g.id = s.current_grade_id
  JOIN classes c ON c.id = s.class_id";

fn student_from_row(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "studentId": row.get::<_, String>(1)?,
        "tmNumber": row.get::<_, String>(2)?,
        "icNumber": row.get::<_, String>(3)?,
        "name": row.get::<_, String>(4)?,
        "remarks": row.get::<_, Option<String>>(5)?,
        "isActive": row.get::<_, i64>(6)? != 0,
        "createdAt": row.get::<_, String>(7)?,
        "updatedAt": row.get::<_, String>(8)?,
        "grade": {
            "id": row.get::<_, i64>(9)?,
            "gradeName": row.get::<_, String>(10)?,
            "gradeLevel": row.get::<_, String>(11)?,
        },
        "class": {
            "id": row.get::<_, i64>(12)?,
            "className": row.get::<_, String>(13)?,
        },
    }))
}

fn load_student(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE s.id = ?", STUDENT_SELECT),
        [id],
        student_from_row,
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

/// Paid payment rows for one student, optionally restricted to a year.
/// Rows whose payment_date is null mean "no payment yet" and are the
/// same as no row at all, so projections never see them.
fn paid_payments(
    conn: &Connection,
    student_id: &str,
    year: Option<i64>,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let (sql, args): (&str, Vec<Value>) = match year {
        Some(y) => (
            "SELECT id, year, month, payment_date FROM payment_records
             WHERE student_id = ? AND year = ? AND payment_date IS NOT NULL
             ORDER BY year, month",
            vec![Value::from(student_id.to_string()), Value::from(y)],
        ),
        None => (
            "SELECT id, year, month, payment_date FROM payment_records
             WHERE student_id = ? AND payment_date IS NOT NULL
             ORDER BY year, month",
            vec![Value::from(student_id.to_string())],
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    stmt.query_map(params_from_iter(args), |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "year": row.get::<_, i64>(1)?,
            "month": row.get::<_, i64>(2)?,
            "paymentDate": row.get::<_, String>(3)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

fn generate_student_code() -> String {
    let raw = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("STU-{}-{}", &raw[..8], &raw[8..13])
}

struct StudentInput {
    name: String,
    tm_number: String,
    ic_number: String,
    grade_id: i64,
    class_id: i64,
    remarks: Option<String>,
}

fn parse_student_input(params: &serde_json::Value) -> Result<StudentInput, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let tm_number = get_required_str(params, "tmNumber")?.trim().to_string();
    let ic_number = get_required_str(params, "icNumber")?.trim().to_string();
    if name.is_empty() || tm_number.is_empty() || ic_number.is_empty() {
        return Err(HandlerErr::bad_params(
            "name, tmNumber and icNumber must not be empty",
        ));
    }
    Ok(StudentInput {
        name,
        tm_number,
        ic_number,
        grade_id: get_ref_id(params, "gradeId")?,
        class_id: get_ref_id(params, "classId")?,
        remarks: get_opt_str(params, "remarks"),
    })
}

fn check_references(conn: &Connection, input: &StudentInput) -> Result<(), HandlerErr> {
    let grade: Option<i64> = conn
        .query_row("SELECT 1 FROM grades WHERE id = ?", [input.grade_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if grade.is_none() {
        return Err(HandlerErr::bad_params(format!(
            "unknown gradeId {}",
            input.grade_id
        )));
    }
    let class: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [input.class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if class.is_none() {
        return Err(HandlerErr::bad_params(format!(
            "unknown classId {}",
            input.class_id
        )));
    }
    Ok(())
}

/// Advisory duplicate check against active students. The partial unique
/// indexes remain the true constraint; a concurrent writer can still slip
/// past this and gets the identical conflict from the insert itself.
fn check_active_duplicates(
    conn: &Connection,
    input: &StudentInput,
    exclude_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let exclude = exclude_id.unwrap_or("");
    let tm_taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students
             WHERE tm_number = ? AND is_active = 1 AND id != ?",
            (&input.tm_number, exclude),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if tm_taken.is_some() {
        return Err(HandlerErr::conflict(TM_CONFLICT_MSG));
    }
    let ic_taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students
             WHERE ic_number = ? AND is_active = 1 AND id != ?",
            (&input.ic_number, exclude),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if ic_taken.is_some() {
        return Err(HandlerErr::conflict(IC_CONFLICT_MSG));
    }
    Ok(())
}

/// SQLite names the violated column in the message, e.g. "UNIQUE
/// constraint failed: students.tm_number"; that is the discriminator.
fn conflict_from_unique(e: rusqlite::Error, code: &'static str, table: &str) -> HandlerErr {
    if is_unique_violation(&e) {
        let msg = e.to_string();
        if msg.contains("tm_number") {
            return HandlerErr::conflict(TM_CONFLICT_MSG);
        }
        if msg.contains("ic_number") {
            return HandlerErr::conflict(IC_CONFLICT_MSG);
        }
    }
    HandlerErr::db(code, e, table)
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = parse_student_input(params)?;
    check_references(conn, &input)?;
    check_active_duplicates(conn, &input, None)?;

    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO students(id, student_id, tm_number, ic_number, name,
                              current_grade_id, class_id, remarks, is_active,
                              created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            generate_student_code(),
            &input.tm_number,
            &input.ic_number,
            &input.name,
            input.grade_id,
            input.class_id,
            &input.remarks,
            &now,
            &now,
        ),
    )
    .map_err(|e| conflict_from_unique(e, "db_insert_failed", "students"))?;

    Ok(json!({ "student": load_student(conn, &id)? }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }

    let input = parse_student_input(params)?;
    check_references(conn, &input)?;
    check_active_duplicates(conn, &input, Some(&student_id))?;

    conn.execute(
        "UPDATE students SET
           name = ?, tm_number = ?, ic_number = ?,
           current_grade_id = ?, class_id = ?, remarks = ?, updated_at = ?
         WHERE id = ?",
        (
            &input.name,
            &input.tm_number,
            &input.ic_number,
            input.grade_id,
            input.class_id,
            &input.remarks,
            now_iso(),
            &student_id,
        ),
    )
    .map_err(|e| conflict_from_unique(e, "db_update_failed", "students"))?;

    Ok(json!({ "student": load_student(conn, &student_id)? }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    // Logical delete only. Payment history stays attached to the row,
    // and deleting an already-inactive student is not an error.
    let changed = conn
        .execute(
            "UPDATE students SET is_active = 0, updated_at = ? WHERE id = ?",
            (now_iso(), &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e, "students"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "ok": true }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut student = load_student(conn, &student_id)?;
    student["payments"] = json!(paid_payments(conn, &student_id, None)?);
    Ok(json!({ "student": student }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let search = get_opt_str(params, "search");
    let year = params.get("year").and_then(|v| v.as_i64());
    let class_id = params.get("classId").and_then(|v| v.as_i64());
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let order_by = params
        .get("orderBy")
        .and_then(|v| v.as_str())
        .unwrap_or("created");

    let mut sql = format!("{} WHERE 1 = 1", STUDENT_SELECT);
    let mut args: Vec<Value> = Vec::new();

    if !include_inactive {
        sql.push_str(" AND s.is_active = 1");
    }
    if let Some(q) = &search {
        sql.push_str(
            " AND (s.name LIKE ? COLLATE NOCASE
               OR s.tm_number LIKE ? COLLATE NOCASE
               OR s.ic_number LIKE ? COLLATE NOCASE)",
        );
        let pattern = format!("%{}%", q);
        args.push(Value::from(pattern.clone()));
        args.push(Value::from(pattern.clone()));
        args.push(Value::from(pattern));
    }
    if let Some(cid) = class_id {
        sql.push_str(" AND s.class_id = ?");
        args.push(Value::from(cid));
    }
    match order_by {
        // Public search view reads better alphabetically.
        "name" => sql.push_str(" ORDER BY s.name COLLATE NOCASE"),
        _ => sql.push_str(" ORDER BY s.created_at DESC"),
    }

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let mut students = stmt
        .query_map(params_from_iter(args), student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    if let Some(y) = year {
        for student in &mut students {
            let id = student
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            student["payments"] = json!(paid_payments(conn, &id, Some(y))?);
        }
    }

    Ok(json!({ "students": students }))
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
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.get" => Some(with_conn(state, req, students_get)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
