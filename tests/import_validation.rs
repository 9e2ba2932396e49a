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

fn request_ok(
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "request {} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

const IMPORT_HEADER: &str = "Student Name,TM Number,IC Number,Grade,Class,\
Month 0 (Renewal),Month 1,Month 2,Month 3,Month 4,Month 5,Month 6,Month 7,\
Month 8,Month 9,Month 10,Month 11,Month 12,Remarks";

fn setup_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "setup-class",
        "classes.create",
        json!({ "name": "Main Class" }),
    );
}

#[test]
fn missing_required_fields_skips_only_that_row() {
    let workspace = temp_dir("rosterd-import-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_workspace(&mut stdin, &mut reader, &workspace);

    let csv = format!(
        "{}\n{}\n{}\n",
        IMPORT_HEADER,
        "John Doe,123456,123456789012,White,Main Class,2024-01-20,,,,,,,,,,,,,",
        ",654321,210987654321,White,Main Class,,,,,,,,,,,,,,",
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.students",
        json!({ "csv": csv, "year": 2024 }),
    );

    assert_eq!(result["successCount"].as_i64(), Some(1));
    assert_eq!(result["skippedCount"].as_i64(), Some(0));
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].as_str(),
        Some("Row 3: Missing required fields"),
        "first data row is row 2, so the second is row 3"
    );

    // The valid row landed with its renewal payment under the batch year.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "search": "123456", "year": 2024 }),
    );
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["name"].as_str(), Some("John Doe"));
    let payments = students[0]["payments"].as_array().expect("payments");
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0]["month"].as_i64(), Some(0));
    assert_eq!(payments[0]["paymentDate"].as_str(), Some("2024-01-20"));
}

#[test]
fn unknown_grade_lists_valid_labels_and_creates_nothing() {
    let workspace = temp_dir("rosterd-import-badgrade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_workspace(&mut stdin, &mut reader, &workspace);

    let csv = format!(
        "{}\n{}\n",
        IMPORT_HEADER, "Jane Roe,222222,222222222222,Purple,Main Class,,,,,,,,,,,,,,",
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.students",
        json!({ "csv": csv, "year": 2024 }),
    );

    assert_eq!(result["successCount"].as_i64(), Some(0));
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    let message = errors[0].as_str().expect("error string");
    assert!(message.starts_with("Row 2: Invalid grade \"Purple\"."), "{}", message);
    assert!(message.contains("Available grades:"), "{}", message);
    assert!(message.contains("White Grade"), "{}", message);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "search": "222222" }),
    );
    assert_eq!(listed["students"].as_array().expect("students").len(), 0);
}

#[test]
fn grade_labels_resolve_with_or_without_suffix() {
    let workspace = temp_dir("rosterd-import-suffix");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_workspace(&mut stdin, &mut reader, &workspace);

    let csv = format!(
        "{}\n{}\n{}\n",
        IMPORT_HEADER,
        "Bare Label,300001,700000000001,white,MAIN CLASS,,,,,,,,,,,,,,",
        "Full Label,300002,700000000002,White Grade,main class,,,,,,,,,,,,,,",
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.students",
        json!({ "csv": csv, "year": 2024 }),
    );

    assert_eq!(result["successCount"].as_i64(), Some(2));
    assert_eq!(result["errors"].as_array().expect("errors").len(), 0);
}

#[test]
fn bad_date_names_the_column_and_rejects_the_row() {
    let workspace = temp_dir("rosterd-import-baddate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_workspace(&mut stdin, &mut reader, &workspace);

    let csv = format!(
        "{}\n{}\n",
        IMPORT_HEADER, "Date Victim,400001,600000000001,White,Main Class,,20/01/2024,,,,,,,,,,,,",
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.students",
        json!({ "csv": csv, "year": 2024 }),
    );

    assert_eq!(result["successCount"].as_i64(), Some(0));
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].as_str(),
        Some("Row 2: Invalid date \"20/01/2024\" in \"Month 1\" (expected YYYY-MM-DD)")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "search": "400001" }),
    );
    assert_eq!(listed["students"].as_array().expect("students").len(), 0);
}

#[test]
fn template_and_export_agree_on_reference_labels() {
    let workspace = temp_dir("rosterd-import-labels");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_workspace(&mut stdin, &mut reader, &workspace);

    let template = request_ok(&mut stdin, &mut reader, "1", "import.template", json!({}));
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "export.students",
        json!({ "year": 2024 }),
    );

    // Both surfaces hand back the stored labels in the same form.
    assert_eq!(template["grades"], exported["grades"]);
    assert_eq!(template["classes"], exported["classes"]);
    let grades = template["grades"].as_array().expect("grades");
    assert!(
        grades.iter().any(|g| g.as_str() == Some("White Grade")),
        "grade labels lost their stored form: {:?}",
        grades
    );
    let classes = template["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].as_str(), Some("MAIN CLASS"));
}

#[test]
fn duplicate_active_identifiers_are_reported_per_row() {
    let workspace = temp_dir("rosterd-import-dup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_workspace(&mut stdin, &mut reader, &workspace);

    let first = format!(
        "{}\n{}\n",
        IMPORT_HEADER, "Original,500001,500000000001,White,Main Class,,,,,,,,,,,,,,",
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.students",
        json!({ "csv": first, "year": 2024 }),
    );
    assert_eq!(result["successCount"].as_i64(), Some(1));

    let second = format!(
        "{}\n{}\n{}\n",
        IMPORT_HEADER,
        "Copycat TM,500001,500000000099,White,Main Class,,,,,,,,,,,,,,",
        "Copycat IC,500099,500000000001,White,Main Class,,,,,,,,,,,,,,",
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.students",
        json!({ "csv": second, "year": 2024 }),
    );
    assert_eq!(result["successCount"].as_i64(), Some(0));
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 2);
    assert_eq!(
        errors[0].as_str(),
        Some("Row 2: TM Number \"500001\" already exists")
    );
    assert_eq!(
        errors[1].as_str(),
        Some("Row 3: IC Number \"500000000001\" already exists")
    );
}
