use anyhow::{anyhow, bail, Context};
use rusqlite::Connection;
use serde_json::json;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db;
use crate::ipc::helpers::{csv_quote, now_iso};

pub const BUNDLE_FORMAT_V1: &str = "roster-workspace-v1";

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/roster.sqlite3";
const SNAPSHOT_ENTRY: &str = "snapshot/students.csv";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

/// Human-readable roster listing bundled next to the database so a
/// backup can be skimmed without opening sqlite.
fn roster_snapshot_csv(conn: &Connection) -> anyhow::Result<String> {
    let mut stmt = conn.prepare(
        "SELECT s.name, s.tm_number, s.ic_number, g.grade_name, c.class_name, s.is_active
         FROM students s
         JOIN grades g ON g.id = s.current_grade_id
         JOIN classes c ON c.id = s.class_id
         ORDER BY s.name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut csv = String::from("Student Name,TM Number,IC Number,Grade,Class,Active\n");
    for (name, tm, ic, grade, class, active) in rows {
        let active = if active != 0 { "yes" } else { "no" };
        let fields = [
            name.as_str(),
            tm.as_str(),
            ic.as_str(),
            grade.as_str(),
            class.as_str(),
            active,
        ];
        let line = fields
            .iter()
            .map(|f| csv_quote(f))
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }
    Ok(csv)
}

pub fn export_workspace_bundle(
    conn: &Connection,
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(db::DB_FILE);
    let db_bytes = fs::read(&db_path)
        .with_context(|| format!("workspace database missing at {}", db_path.display()))?;
    let snapshot = roster_snapshot_csv(conn)?;

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": now_iso(),
        "sourceWorkspace": workspace_path.to_string_lossy(),
    });

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = fs::File::create(out_path)
        .with_context(|| format!("cannot create bundle at {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST_ENTRY, opts)?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
    zip.start_file(SNAPSHOT_ENTRY, opts)?;
    zip.write_all(snapshot.as_bytes())?;
    zip.start_file(DB_ENTRY, opts)?;
    zip.write_all(&db_bytes)?;
    zip.finish()?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let bytes = fs::read(in_path)
        .with_context(|| format!("cannot read {}", in_path.display()))?;
    fs::create_dir_all(workspace_path)?;
    let dst = workspace_path.join(db::DB_FILE);

    if !bytes.starts_with(&ZIP_MAGIC) {
        // Raw sqlite file, the pre-bundle backup format.
        replace_db_file(&dst, &bytes)?;
        return Ok(ImportSummary {
            bundle_format_detected: "bare-sqlite3".to_string(),
        });
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("unreadable zip bundle")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|_| anyhow!("bundle has no {}", MANIFEST_ENTRY))?
        .read_to_string(&mut manifest_text)?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest is not valid JSON")?;
    match manifest.get("format").and_then(|v| v.as_str()) {
        Some(BUNDLE_FORMAT_V1) => {}
        other => bail!("unsupported bundle format: {:?}", other),
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .map_err(|_| anyhow!("bundle has no {}", DB_ENTRY))?
        .read_to_end(&mut db_bytes)?;
    replace_db_file(&dst, &db_bytes)?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
    })
}

/// Writes next to the target and renames over it, so a half-written
/// file never becomes the live database.
fn replace_db_file(dst: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let staging = dst.with_extension("sqlite3.restoring");
    fs::write(&staging, bytes)
        .with_context(|| format!("cannot stage database at {}", staging.display()))?;
    fs::rename(&staging, dst)
        .with_context(|| format!("cannot replace database at {}", dst.display()))?;
    Ok(())
}
