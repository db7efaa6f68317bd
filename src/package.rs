//! `.sb3` archive emission.
//!
//! The archive is a plain deflate ZIP: `project.json` (pretty-printed,
//! two-space indent) followed by one entry per asset, named by its
//! content-addressed `md5ext` key.

use crate::error::CompileError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Write the project archive, creating parent directories as needed.
pub fn write_sb3(
    project_json: &Value,
    assets: &BTreeMap<String, Vec<u8>>,
    output_path: &Path,
) -> Result<(), CompileError> {
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(output_path)?;
    let mut archive = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    archive
        .start_file("project.json", options)
        .map_err(zip_error)?;
    let json = serde_json::to_string_pretty(project_json)
        .expect("project JSON contains no non-serializable values");
    archive.write_all(json.as_bytes())?;

    for (name, bytes) in assets {
        archive.start_file(name.as_str(), options).map_err(zip_error)?;
        archive.write_all(bytes)?;
    }
    archive.finish().map_err(zip_error)?;
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> CompileError {
    CompileError::Io(std::io::Error::other(err))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
