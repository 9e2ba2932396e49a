use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, is_unique_violation, now_iso};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const DUPLICATE_CLASS_MSG: &str = "Class with this name already exists";

fn class_row(conn: &Connection, class_id: i64) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, class_name, created_at FROM classes WHERE id = ?",
        [class_id],
        |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "className": row.get::<_, String>(1)?,
                "createdAt": row.get::<_, String>(2)?,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("class not found"))
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Include the active-student count so the UI can show a useful
    // management view. Correlated subquery to avoid join double-counting.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.class_name,
               c.created_at,
               (SELECT COUNT(*) FROM students s
                WHERE s.class_id = c.id AND s.is_active = 1) AS student_count
             FROM classes c
             ORDER BY c.id",
        )
        .map_err(HandlerErr::db_query)?;

    let classes = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "className": row.get::<_, String>(1)?,
                "createdAt": row.get::<_, String>(2)?,
                "studentCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    // Class names are case-normalized to upper-case on every write.
    let name = name.trim().to_uppercase();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }

    let existing: Option<i64> = conn
        .query_row("SELECT id FROM classes WHERE class_name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if existing.is_some() {
        return Err(HandlerErr::conflict(DUPLICATE_CLASS_MSG));
    }

    if let Err(e) = conn.execute(
        "INSERT INTO classes(class_name, created_at) VALUES(?, ?)",
        (&name, now_iso()),
    ) {
        // The unique index is the real constraint; report its rejection
        // the same way as the pre-check.
        if is_unique_violation(&e) {
            return Err(HandlerErr::conflict(DUPLICATE_CLASS_MSG));
        }
        return Err(HandlerErr::db("db_insert_failed", e, "classes"));
    }
    let class_id = conn.last_insert_rowid();

    Ok(json!({ "class": class_row(conn, class_id)? }))
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params
        .get("classId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing classId"))?;
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_uppercase();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }

    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT id FROM classes WHERE class_name = ? AND id != ?",
            (&name, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if duplicate.is_some() {
        return Err(HandlerErr::conflict(DUPLICATE_CLASS_MSG));
    }

    let changed = conn
        .execute(
            "UPDATE classes SET class_name = ? WHERE id = ?",
            (&name, class_id),
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                HandlerErr::conflict(DUPLICATE_CLASS_MSG)
            } else {
                HandlerErr::db("db_update_failed", e, "classes")
            }
        })?;
    if changed == 0 {
        return Err(HandlerErr::not_found("class not found"));
    }

    Ok(json!({ "class": class_row(conn, class_id)? }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params
        .get("classId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing classId"))?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }

    // A class stays deletable only while no active student references it.
    // Inactive students keep their historical class_id.
    let in_use: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND is_active = 1 LIMIT 1",
            [class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if in_use.is_some() {
        return Err(HandlerErr::conflict(
            "Cannot delete class that is assigned to active students",
        ));
    }

    conn.execute("DELETE FROM classes WHERE id = ?", [class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "classes"))?;

    Ok(json!({ "ok": true }))
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
        "classes.list" => Some(with_conn(state, req, |c, _| classes_list(c))),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.update" => Some(with_conn(state, req, classes_update)),
        "classes.delete" => Some(with_conn(state, req, classes_delete)),
        _ => None,
    }
}
