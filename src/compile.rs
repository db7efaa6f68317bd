//! Pipeline orchestration.
//!
//! A compile is atomic: it either writes a complete archive or returns the
//! first error.  The stages run strictly in order — resolve (or parse) →
//! validate → generate → package — and no stage mutates a previous stage's
//! output.

use crate::codegen::generate_project_json;
use crate::error::CompileError;
use crate::imports::resolve_project_from_path;
use crate::package::write_sb3;
use crate::parser::parse_source;
use crate::semantic::analyze;
use std::path::Path;

/// Compile an entry file (resolving its imports) into `output_path`.
pub fn compile_file(
    input_path: &Path,
    output_path: &Path,
    scale_svgs: bool,
) -> Result<(), CompileError> {
    let project = resolve_project_from_path(input_path)?;
    analyze(&project)?;
    let source_dir = input_path.parent().unwrap_or_else(|| Path::new("."));
    let (project_json, assets) = generate_project_json(&project, source_dir, scale_svgs)?;
    write_sb3(&project_json, &assets, output_path)
}

/// Compile already-loaded source text (no import resolution) into
/// `output_path`.  Costume paths resolve against `source_dir`.
pub fn compile_source(
    source_text: &str,
    source_dir: &Path,
    output_path: &Path,
    scale_svgs: bool,
) -> Result<(), CompileError> {
    let project = parse_source(source_text)?;
    analyze(&project)?;
    let (project_json, assets) = generate_project_json(&project, source_dir, scale_svgs)?;
    write_sb3(&project_json, &assets, output_path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
