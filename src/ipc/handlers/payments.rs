use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, now_iso, parse_payment_date};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const RENEWAL_MONTH: i64 = 0;

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn payment_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "studentId": row.get::<_, String>(1)?,
        "year": row.get::<_, i64>(2)?,
        "month": row.get::<_, i64>(3)?,
        "paymentDate": row.get::<_, Option<String>>(4)?,
        "createdAt": row.get::<_, String>(5)?,
        "updatedAt": row.get::<_, String>(6)?,
    }))
}

/// Date params may be absent, null, or a YYYY-MM-DD string. Absent and
/// null both mean "mark the slot unpaid".
fn parse_date_param(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be a string or null",
                    key
                )));
            };
            if s.trim().is_empty() {
                return Ok(None);
            }
            parse_payment_date(s).map(Some).ok_or_else(|| {
                HandlerErr::bad_params(format!(
                    "{} must be a YYYY-MM-DD date",
                    key
                ))
            })
        }
    }
}

/// One call is either a monthly upsert (month 1-12 with paymentDate) or a
/// renewal upsert (renewalDate, slot 0). Mixing the two is rejected so a
/// renewal can never collide with month bookkeeping by accident.
fn resolve_slot(params: &serde_json::Value) -> Result<(i64, Option<String>), HandlerErr> {
    let has_month = params.get("month").map(|v| !v.is_null()).unwrap_or(false);
    let has_renewal = params.get("renewalDate").is_some();

    if has_month && has_renewal {
        return Err(HandlerErr::bad_params(
            "pass either month/paymentDate or renewalDate, not both",
        ));
    }
    if has_month {
        let month = params
            .get("month")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr::bad_params("month must be an integer"))?;
        if !(1..=12).contains(&month) {
            return Err(HandlerErr::bad_params(
                "month must be between 1 and 12; the renewal slot is addressed by renewalDate",
            ));
        }
        return Ok((month, parse_date_param(params, "paymentDate")?));
    }
    if has_renewal {
        return Ok((RENEWAL_MONTH, parse_date_param(params, "renewalDate")?));
    }
    Err(HandlerErr::bad_params("missing month or renewalDate"))
}

fn payments_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing year"))?;
    let (month, payment_date) = resolve_slot(params)?;

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    // One row per (student, year, month). The unique key makes concurrent
    // writers last-writer-wins; there is nothing to merge.
    let now = now_iso();
    conn.execute(
        "INSERT INTO payment_records(id, student_id, year, month, payment_date, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, year, month) DO UPDATE SET
           payment_date = excluded.payment_date,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            year,
            month,
            &payment_date,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e, "payment_records"))?;

    let payment = conn
        .query_row(
            "SELECT id, student_id, year, month, payment_date, created_at, updated_at
             FROM payment_records
             WHERE student_id = ? AND year = ? AND month = ?",
            (&student_id, year, month),
            payment_json,
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "payment": payment }))
}

fn payments_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payment_id = get_required_str(params, "paymentId")?;
    // The only hard delete in the ledger: it removes payment history
    // instead of marking a slot unpaid, so callers confirm first.
    let changed = conn
        .execute("DELETE FROM payment_records WHERE id = ?", [&payment_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "payment_records"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("payment not found"));
    }
    Ok(json!({ "ok": true }))
}

fn payments_list_for_student_year(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing year"))?;

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    // Raw ledger rows, null-dated ones included: this is the editing
    // surface and record ids are needed for payments.delete.
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, year, month, payment_date, created_at, updated_at
             FROM payment_records
             WHERE student_id = ? AND year = ?
             ORDER BY month",
        )
        .map_err(HandlerErr::db_query)?;
    let payments = stmt
        .query_map((&student_id, year), payment_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "payments": payments }))
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
        "payments.upsert" => Some(with_conn(state, req, payments_upsert)),
        "payments.delete" => Some(with_conn(state, req, payments_delete)),
        "payments.listForStudentYear" => {
            Some(with_conn(state, req, payments_list_for_student_year))
        }
        _ => None,
    }
}
