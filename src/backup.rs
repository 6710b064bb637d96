use anyhow::{bail, Context};
use thiserror::Error;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE: &str = "campus.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/campus.sqlite3";
const META_ENTRY: &str = "meta/workspace.json";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
pub const BUNDLE_FORMAT_V1: &str = "campus-workspace-v1";
pub const LEGACY_SQLITE_FORMAT: &str = "legacy-sqlite3";

/// The input file was readable but is not a usable workspace backup.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RejectedBundle(pub String);

fn reject(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(RejectedBundle(msg.into()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    version: u32,
    #[serde(default)]
    app_version: Option<String>,
    #[serde(default)]
    exported_at: Option<String>,
    #[serde(default)]
    db_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub db_sha256: String,
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

fn write_json_entry<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &impl Serialize,
    opts: FileOptions,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start {name}"))?;
    let text = serde_json::to_string_pretty(value).with_context(|| format!("failed to encode {name}"))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write {name}"))?;
    Ok(())
}

/// Zips the workspace database with a checksummed manifest.
pub fn export_workspace_bundle(workspace: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let db_path = workspace.join(DB_FILE);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.display());
    }
    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let db_sha256 = sha256_file(&db_path)?;

    let out = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = Manifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        version: 1,
        app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        exported_at: Some(chrono::Utc::now().to_rfc3339()),
        db_sha256: Some(db_sha256.clone()),
    };
    write_json_entry(&mut zip, MANIFEST_ENTRY, &manifest, opts)?;

    zip.start_file(DB_ENTRY, opts).context("failed to start database entry")?;
    let mut db = File::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    std::io::copy(&mut db, &mut zip).context("failed to write database entry")?;

    let meta = serde_json::json!({ "sourceWorkspace": workspace.to_string_lossy() });
    write_json_entry(&mut zip, META_ENTRY, &meta, opts)?;
    zip.finish().context("failed to finalize bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

/// Restores a bundle (or a bare SQLite file) into `workspace`, swapping the
/// database in only after the copy is complete and verified.
pub fn import_workspace_bundle(in_path: &Path, workspace: &Path) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let dst = workspace.join(DB_FILE);
    let staging = workspace.join(format!("{DB_FILE}.importing"));
    if staging.exists() {
        std::fs::remove_file(&staging)
            .with_context(|| format!("failed to clear {}", staging.display()))?;
    }

    if !is_zip(in_path)? {
        std::fs::copy(in_path, &staging)
            .with_context(|| format!("failed to copy legacy backup {}", in_path.display()))?;
        ensure_sqlite(&staging)?;
        let db_sha256 = sha256_file(&staging)?;
        replace_file(&staging, &dst)?;
        return Ok(ImportSummary {
            bundle_format_detected: LEGACY_SQLITE_FORMAT.to_string(),
            db_sha256,
        });
    }

    let file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(file).map_err(|e| reject(format!("invalid zip archive: {e}")))?;
    let manifest: Manifest = {
        let mut text = String::new();
        archive
            .by_name(MANIFEST_ENTRY)
            .map_err(|_| reject("bundle missing manifest.json"))?
            .read_to_string(&mut text)
            .context("failed to read manifest.json")?;
        serde_json::from_str(&text).map_err(|e| reject(format!("manifest.json is invalid: {e}")))?
    };
    if manifest.format != BUNDLE_FORMAT_V1 {
        return Err(reject(format!("unsupported bundle format: {}", manifest.format)));
    }

    {
        let mut entry = archive
            .by_name(DB_ENTRY)
            .map_err(|_| reject("bundle missing db/campus.sqlite3"))?;
        let mut out = File::create(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;
        std::io::copy(&mut entry, &mut out).context("failed to extract database")?;
        out.flush().context("failed to flush extracted database")?;
    }

    let actual = sha256_file(&staging)?;
    if let Some(expected) = manifest.db_sha256.as_deref() {
        if !expected.eq_ignore_ascii_case(&actual) {
            let _ = std::fs::remove_file(&staging);
            return Err(reject(format!(
                "database checksum mismatch: expected {expected}, got {actual}"
            )));
        }
    }
    ensure_sqlite(&staging)?;
    replace_file(&staging, &dst)?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        db_sha256: actual,
    })
}

fn replace_file(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if dst.exists() {
        std::fs::remove_file(dst)
            .with_context(|| format!("failed to remove {}", dst.display()))?;
    }
    std::fs::rename(src, dst).with_context(|| format!("failed to move database to {}", dst.display()))
}

/// Drops the staged copy unless it starts with the SQLite file header.
fn ensure_sqlite(staging: &Path) -> anyhow::Result<()> {
    let mut f = File::open(staging).with_context(|| format!("failed to open {}", staging.display()))?;
    let mut header = [0u8; 16];
    let is_db = match f.read_exact(&mut header) {
        Ok(()) => &header == SQLITE_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e).context("failed to read database header"),
    };
    drop(f);
    if is_db {
        return Ok(());
    }
    let _ = std::fs::remove_file(staging);
    Err(reject("file is not a SQLite database"))
}

fn is_zip(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut sig = [0u8; 4];
    let n = f.read(&mut sig).context("failed to read file signature")?;
    Ok(n == 4 && sig == ZIP_MAGIC)
}
