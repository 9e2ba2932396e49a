use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "request {} failed: {}",
        id,
        value
    );
    value.get("result").cloned().expect("result")
}

#[test]
fn identifier_uniqueness_applies_to_active_students_only() {
    let workspace = temp_dir("rosterd-soft-delete-reuse");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let grades = request_ok(&mut stdin, &mut reader, "2", "grades.list", json!({}));
    let grade_id = grades["grades"][0]["id"].as_i64().expect("grade id");
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Reuse Class" }),
    );
    let class_id = class["class"]["id"].as_i64().expect("class id");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "name": "First Holder",
            "tmNumber": "200001",
            "icNumber": "800000000001",
            "gradeId": grade_id,
            "classId": class_id
        }),
    );
    let first_id = created["student"]["id"].as_str().expect("id").to_string();

    // Attach some history so we can check it survives the soft delete.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "payments.upsert",
        json!({ "studentId": first_id, "year": 2024, "month": 5, "paymentDate": "2024-05-02" }),
    );

    // Same tm number while the holder is active: conflict.
    let dup = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({
            "name": "Second Holder",
            "tmNumber": "200001",
            "icNumber": "800000000002",
            "gradeId": grade_id,
            "classId": class_id
        }),
    );
    assert_eq!(dup["ok"].as_bool(), Some(false));
    assert_eq!(dup["error"]["code"].as_str(), Some("conflict"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.delete",
        json!({ "studentId": first_id }),
    );
    // Soft delete is idempotent.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.delete",
        json!({ "studentId": first_id }),
    );

    // Identifiers of an inactive student are free for reuse.
    let reused = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({
            "name": "Second Holder",
            "tmNumber": "200001",
            "icNumber": "800000000001",
            "gradeId": grade_id,
            "classId": class_id
        }),
    );
    assert_eq!(reused["student"]["isActive"].as_bool(), Some(true));
    assert_ne!(reused["student"]["id"].as_str(), Some(first_id.as_str()));

    // The soft-deleted student and its ledger stay queryable by id.
    let old = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.get",
        json!({ "studentId": first_id }),
    );
    assert_eq!(old["student"]["isActive"].as_bool(), Some(false));
    let payments = old["student"]["payments"].as_array().expect("payments");
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0]["month"].as_i64(), Some(5));

    // The management list hides inactive students by default.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "search": "200001" }),
    );
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0]["id"].as_str(),
        reused["student"]["id"].as_str()
    );
}

#[test]
fn update_uniqueness_excludes_the_student_itself() {
    let workspace = temp_dir("rosterd-update-self");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let grades = request_ok(&mut stdin, &mut reader, "2", "grades.list", json!({}));
    let grade_id = grades["grades"][0]["id"].as_i64().expect("grade id");
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Update Class" }),
    );
    let class_id = class["class"]["id"].as_i64().expect("class id");

    let a = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "name": "Student A",
            "tmNumber": "200010",
            "icNumber": "800000000010",
            "gradeId": grade_id,
            "classId": class_id
        }),
    );
    let a_id = a["student"]["id"].as_str().expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "name": "Student B",
            "tmNumber": "200011",
            "icNumber": "800000000011",
            "gradeId": grade_id,
            "classId": class_id
        }),
    );

    // Re-saving A with its own numbers is not a conflict.
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({
            "studentId": a_id,
            "name": "Student A Renamed",
            "tmNumber": "200010",
            "icNumber": "800000000010",
            "gradeId": grade_id,
            "classId": class_id.to_string(),
            "remarks": "renamed"
        }),
    );
    assert_eq!(saved["student"]["name"].as_str(), Some("Student A Renamed"));
    assert_eq!(saved["student"]["remarks"].as_str(), Some("renamed"));

    // Taking B's ic number is.
    let conflict = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.update",
        json!({
            "studentId": a_id,
            "name": "Student A",
            "tmNumber": "200010",
            "icNumber": "800000000011",
            "gradeId": grade_id,
            "classId": class_id
        }),
    );
    assert_eq!(conflict["ok"].as_bool(), Some(false));
    assert_eq!(conflict["error"]["code"].as_str(), Some("conflict"));

    // Grade/class ids must coerce to integers; garbage is a validation
    // error rather than a silent default.
    let bad = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({
            "studentId": a_id,
            "name": "Student A",
            "tmNumber": "200010",
            "icNumber": "800000000010",
            "gradeId": "not-a-number",
            "classId": class_id
        }),
    );
    assert_eq!(bad["ok"].as_bool(), Some(false));
    assert_eq!(bad["error"]["code"].as_str(), Some("bad_params"));
}
