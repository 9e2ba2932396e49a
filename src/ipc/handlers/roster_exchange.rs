use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{csv_quote, get_required_str, now_iso, parse_csv_record, parse_payment_date};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

/// Sheet row number of the first data row (row 1 is the header).
const FIRST_DATA_ROW: usize = 2;

const GRADE_SUFFIX: &str = " Grade";

const IDENTITY_COLUMNS: [&str; 5] = ["Student Name", "TM Number", "IC Number", "Grade", "Class"];
const SLOT_COLUMNS: [&str; 13] = [
    "Month 0 (Renewal)",
    "Month 1",
    "Month 2",
    "Month 3",
    "Month 4",
    "Month 5",
    "Month 6",
    "Month 7",
    "Month 8",
    "Month 9",
    "Month 10",
    "Month 11",
    "Month 12",
];

struct RefData {
    grade_labels: Vec<String>,
    class_labels: Vec<String>,
    grade_by_label: HashMap<String, i64>,
    class_by_label: HashMap<String, i64>,
}

fn load_reference_data(conn: &Connection) -> Result<RefData, HandlerErr> {
    let mut grade_labels = Vec::new();
    let mut grade_by_label = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT id, grade_name FROM grades ORDER BY id")
        .map_err(HandlerErr::db_query)?;
    let grades = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    for (id, name) in grades {
        grade_by_label.insert(name.to_lowercase(), id);
        grade_labels.push(name);
    }

    let mut class_labels = Vec::new();
    let mut class_by_label = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT id, class_name FROM classes ORDER BY id")
        .map_err(HandlerErr::db_query)?;
    let classes = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    for (id, name) in classes {
        class_by_label.insert(name.to_lowercase(), id);
        class_labels.push(name);
    }

    Ok(RefData {
        grade_labels,
        class_labels,
        grade_by_label,
        class_by_label,
    })
}

impl RefData {
    /// Grade labels resolve case-insensitively, with or without the
    /// decorative " Grade" suffix ("White" and "White Grade" are the
    /// same reference row).
    fn resolve_grade(&self, label: &str) -> Option<i64> {
        let key = label.to_lowercase();
        if let Some(id) = self.grade_by_label.get(&key) {
            return Some(*id);
        }
        self.grade_by_label
            .get(&format!("{}{}", key, GRADE_SUFFIX.to_lowercase()))
            .copied()
    }

    fn resolve_class(&self, label: &str) -> Option<i64> {
        self.class_by_label.get(&label.to_lowercase()).copied()
    }
}

struct StagedStudent {
    id: String,
    tm_number: String,
    ic_number: String,
    name: String,
    grade_id: i64,
    class_id: i64,
    remarks: Option<String>,
    // One optional date per slot, index 0 = renewal.
    slot_dates: [Option<String>; 13],
}

fn active_identifier_taken(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<bool, HandlerErr> {
    let sql = format!(
        "SELECT 1 FROM students WHERE {} = ? AND is_active = 1 LIMIT 1",
        column
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let mut rows = stmt.query([value]).map_err(HandlerErr::db_query)?;
    Ok(rows.next().map_err(HandlerErr::db_query)?.is_some())
}

fn generate_student_code() -> String {
    let raw = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("STU-{}-{}", &raw[..8], &raw[8..13])
}

fn import_students(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let csv = get_required_str(params, "csv")?;
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| Utc::now().year() as i64);

    let lines: Vec<&str> = csv.lines().collect();
    if lines.len() < 2 {
        return Err(HandlerErr::bad_params("no data rows found"));
    }

    let refs = load_reference_data(conn)?;

    let header: HashMap<String, usize> = parse_csv_record(lines[0])
        .into_iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_lowercase(), i))
        .collect();
    let field = |fields: &[String], col: &str| -> String {
        header
            .get(&col.to_lowercase())
            .and_then(|i| fields.get(*i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let mut errors: Vec<String> = Vec::new();
    let mut skipped = 0usize;
    let mut staged: Vec<StagedStudent> = Vec::new();

    for (i, line) in lines.iter().enumerate().skip(1) {
        let row_number = i - 1 + FIRST_DATA_ROW;
        let fields = parse_csv_record(line);
        if fields.iter().all(|f| f.trim().is_empty()) {
            skipped += 1;
            continue;
        }

        let [name, tm_number, ic_number, grade_label, class_label] =
            IDENTITY_COLUMNS.map(|c| field(&fields, c));
        let remarks = {
            let r = field(&fields, "Remarks");
            if r.is_empty() {
                None
            } else {
                Some(r)
            }
        };

        if name.is_empty()
            || tm_number.is_empty()
            || ic_number.is_empty()
            || grade_label.is_empty()
            || class_label.is_empty()
        {
            errors.push(format!("Row {}: Missing required fields", row_number));
            continue;
        }

        let Some(grade_id) = refs.resolve_grade(&grade_label) else {
            errors.push(format!(
                "Row {}: Invalid grade \"{}\". Available grades: {}",
                row_number,
                grade_label,
                refs.grade_labels.join(", ")
            ));
            continue;
        };

        let Some(class_id) = refs.resolve_class(&class_label) else {
            errors.push(format!(
                "Row {}: Invalid class \"{}\". Available classes: {}",
                row_number,
                class_label,
                refs.class_labels.join(", ")
            ));
            continue;
        };

        // Duplicate checks run per row against current store state, not
        // against other rows in the same batch: two rows sharing a tm
        // number both pass here and the batch write rejects them below.
        if active_identifier_taken(conn, "tm_number", &tm_number)? {
            errors.push(format!(
                "Row {}: TM Number \"{}\" already exists",
                row_number, tm_number
            ));
            continue;
        }
        if active_identifier_taken(conn, "ic_number", &ic_number)? {
            errors.push(format!(
                "Row {}: IC Number \"{}\" already exists",
                row_number, ic_number
            ));
            continue;
        }

        let mut slot_dates: [Option<String>; 13] = Default::default();
        let mut row_ok = true;
        for (slot, col) in SLOT_COLUMNS.iter().enumerate() {
            let raw = field(&fields, col);
            if raw.is_empty() {
                continue;
            }
            match parse_payment_date(&raw) {
                Some(date) => slot_dates[slot] = Some(date),
                None => {
                    errors.push(format!(
                        "Row {}: Invalid date \"{}\" in \"{}\" (expected YYYY-MM-DD)",
                        row_number, raw, col
                    ));
                    row_ok = false;
                }
            }
        }
        if !row_ok {
            continue;
        }

        staged.push(StagedStudent {
            id: Uuid::new_v4().to_string(),
            tm_number,
            ic_number,
            name,
            grade_id,
            class_id,
            remarks,
            slot_dates,
        });
    }

    // Students land in one transaction; if the store's unique indexes
    // reject the batch (duplicates within the batch itself), the whole
    // student write fails as a store error.
    if !staged.is_empty() {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::db("db_tx_failed", e, "students"))?;
        let now = now_iso();
        let mut insert_err: Option<rusqlite::Error> = None;
        for s in &staged {
            let insert = tx.execute(
                "INSERT INTO students(id, student_id, tm_number, ic_number, name,
                                      current_grade_id, class_id, remarks, is_active,
                                      created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
                (
                    &s.id,
                    generate_student_code(),
                    &s.tm_number,
                    &s.ic_number,
                    &s.name,
                    s.grade_id,
                    s.class_id,
                    &s.remarks,
                    &now,
                    &now,
                ),
            );
            if let Err(e) = insert {
                insert_err = Some(e);
                break;
            }
        }
        if let Some(e) = insert_err {
            let _ = tx.rollback();
            return Err(HandlerErr::db("db_insert_failed", e, "students"));
        }
        tx.commit()
            .map_err(|e| HandlerErr::db("db_commit_failed", e, "students"))?;

        // Payment rows ride behind the committed student batch. A failed
        // payment insert is logged and never unwinds the students; their
        // rows are the source of truth for the success count.
        let now = now_iso();
        for s in &staged {
            for (slot, date) in s.slot_dates.iter().enumerate() {
                let Some(date) = date else { continue };
                let insert = conn.execute(
                    "INSERT INTO payment_records(id, student_id, year, month, payment_date, created_at, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(student_id, year, month) DO UPDATE SET
                       payment_date = excluded.payment_date,
                       updated_at = excluded.updated_at",
                    (
                        Uuid::new_v4().to_string(),
                        &s.id,
                        year,
                        slot as i64,
                        date,
                        &now,
                        &now,
                    ),
                );
                if let Err(e) = insert {
                    eprintln!(
                        "import: failed to insert payment (student {}, year {}, month {}): {}",
                        s.tm_number, year, slot, e
                    );
                }
            }
        }
    }

    let success_count = staged.len();
    Ok(json!({
        "successCount": success_count,
        "skippedCount": skipped,
        "errors": errors,
        "message": format!("Import completed. {} students imported successfully.", success_count),
    }))
}

fn strip_grade_suffix(label: &str) -> String {
    label
        .strip_suffix(GRADE_SUFFIX)
        .unwrap_or(label)
        .to_string()
}

fn export_header() -> String {
    let mut cols: Vec<&str> = IDENTITY_COLUMNS.to_vec();
    cols.extend(SLOT_COLUMNS);
    cols.push("Remarks");
    cols.join(",")
}

/// One flat row per student, one column per slot: the exact inverse of
/// the import row shape, so an exported file re-imports unchanged.
fn export_students(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| Utc::now().year() as i64);
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let refs = load_reference_data(conn)?;

    let sql = format!(
        "SELECT s.id, s.tm_number, s.ic_number, s.name, s.remarks,
                g.grade_name, c.class_name
         FROM students s
         JOIN grades g ON g.id = s.current_grade_id
         JOIN classes c ON c.id = s.class_id
         {}
         ORDER BY s.name COLLATE NOCASE",
        if include_inactive {
            ""
        } else {
            "WHERE s.is_active = 1"
        }
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut date_stmt = conn
        .prepare(
            "SELECT month, payment_date FROM payment_records
             WHERE student_id = ? AND year = ? AND payment_date IS NOT NULL",
        )
        .map_err(HandlerErr::db_query)?;

    let mut csv = export_header();
    csv.push('\n');
    for (id, tm_number, ic_number, name, remarks, grade_name, class_name) in &students {
        let mut dates_by_slot: [Option<String>; 13] = Default::default();
        let rows = date_stmt
            .query_map((id, year), |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        for (month, date) in rows {
            if (0..=12).contains(&month) {
                dates_by_slot[month as usize] = Some(date);
            }
        }

        let mut fields: Vec<String> = vec![
            name.clone(),
            tm_number.clone(),
            ic_number.clone(),
            strip_grade_suffix(grade_name),
            class_name.clone(),
        ];
        for slot in &dates_by_slot {
            fields.push(slot.clone().unwrap_or_default());
        }
        fields.push(remarks.clone().unwrap_or_default());

        let line = fields
            .iter()
            .map(|f| csv_quote(f))
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }

    Ok(json!({
        "csv": csv,
        "year": year,
        "studentCount": students.len(),
        "grades": refs.grade_labels,
        "classes": refs.class_labels,
    }))
}

fn import_template(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let refs = load_reference_data(conn)?;

    let sample_rows = [
        [
            "John Doe",
            "123456",
            "123456789012",
            "White",
            "Main Class",
            "2024-01-20",
            "2024-01-15",
            "", "", "", "", "", "", "", "", "", "", "",
            "Sample student",
        ],
        [
            "Jane Smith",
            "789012",
            "987654321098",
            "Yellow",
            "Mak Mandin",
            "",
            "",
            "2024-02-20",
            "", "", "", "", "", "", "", "", "", "",
            "Another sample student",
        ],
    ];

    let mut csv = export_header();
    csv.push('\n');
    for row in &sample_rows {
        let line = row
            .iter()
            .map(|f| csv_quote(f))
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }

    // Reference lists carry the stored labels verbatim, matching
    // export.students and the import error messages.
    Ok(json!({
        "csv": csv,
        "grades": refs.grade_labels,
        "classes": refs.class_labels,
    }))
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
        "import.students" => Some(with_conn(state, req, import_students)),
        "import.template" => Some(with_conn(state, req, |c, _| import_template(c))),
        "export.students" => Some(with_conn(state, req, export_students)),
        _ => None,
    }
}
