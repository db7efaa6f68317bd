//! Cross-file import resolution.
//!
//! A source file may start with any number of top-level import lines:
//!
//! ```text
//! import [Cat] from "cat.sbtext"   # optional comment
//! ```
//!
//! Each import line is replaced with a blank line before parsing so that
//! positions in diagnostics keep matching the file on disk.  Imports are
//! resolved depth-first with an explicit stack (cycles are fatal and name
//! the full cycle) and a per-run memoization cache keyed by canonical path,
//! so shared imports are parsed once.
//!
//! An imported file must define exactly one sprite and zero stages, and the
//! sprite's name must equal the import's declared name case-sensitively.
//! Imported targets precede the importing file's own targets in the merged
//! project.

use crate::ast::{Pos, Project, Target};
use crate::error::{CompileError, ImportError};
use crate::parser::parse_source;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// ── Import line shape ─────────────────────────────────────────────────────────

static IMPORT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*import\s+\[([^\]\r\n]+)\]\s+from\s+"([^"\r\n]+)"\s*(?:#.*)?$"#)
        .expect("import pattern is a valid regex")
});

#[derive(Debug)]
struct ImportSpec {
    sprite_name: String,
    relative_path: String,
    line: usize,
}

#[derive(Clone)]
struct ResolvedFile {
    /// Targets defined by the file itself.
    local_targets: Vec<Target>,
    /// Imported targets followed by the local ones.
    combined_targets: Vec<Target>,
}

// ── Public entry point ────────────────────────────────────────────────────────

/// Resolve `entry_path` and all of its imports into one merged [`Project`].
pub fn resolve_project_from_path(entry_path: &Path) -> Result<Project, CompileError> {
    if !entry_path.is_file() {
        return Err(ImportError(format!(
            "Input file not found: '{}'.",
            entry_path.display()
        ))
        .into());
    }
    let resolved_entry = fs::canonicalize(entry_path)?;
    let mut cache: HashMap<PathBuf, ResolvedFile> = HashMap::new();
    let mut stack: Vec<PathBuf> = Vec::new();
    let resolved = resolve_file(&resolved_entry, &mut stack, &mut cache)?;
    ensure_unique_sprite_names(&resolved.combined_targets)?;
    Ok(Project {
        pos: Pos::new(1, 1),
        targets: resolved.combined_targets,
    })
}

// ── Recursive resolution ──────────────────────────────────────────────────────

fn resolve_file(
    path: &Path,
    stack: &mut Vec<PathBuf>,
    cache: &mut HashMap<PathBuf, ResolvedFile>,
) -> Result<ResolvedFile, CompileError> {
    if let Some(cached) = cache.get(path) {
        return Ok(cached.clone());
    }
    if let Some(cycle_start) = stack.iter().position(|p| p == path) {
        let mut cycle: Vec<String> = stack[cycle_start..]
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        cycle.push(path.display().to_string());
        return Err(ImportError(format!(
            "Circular import detected: {}",
            cycle.join(" -> ")
        ))
        .into());
    }

    let source = fs::read_to_string(path)?;
    let (imports, stripped_source) = extract_imports(&source, path)?;
    let mut local_targets = parse_local_targets(&stripped_source)?;
    let source_dir = path.parent().unwrap_or_else(|| Path::new("."));
    normalize_target_asset_paths(&mut local_targets, source_dir)?;

    stack.push(path.to_path_buf());
    let imported = (|| -> Result<Vec<Target>, CompileError> {
        let mut imported_targets = Vec::new();
        for spec in &imports {
            let child_path = source_dir.join(&spec.relative_path);
            if !child_path.is_file() {
                return Err(ImportError(format!(
                    "Imported file does not exist: '{}' (from '{}', line {}).",
                    spec.relative_path,
                    path.display(),
                    spec.line
                ))
                .into());
            }
            let child_path = fs::canonicalize(&child_path)?;
            let child = resolve_file(&child_path, stack, cache)?;
            validate_imported_file(spec, path, &child_path, &child.local_targets)?;
            imported_targets.extend(child.combined_targets);
        }
        Ok(imported_targets)
    })();
    stack.pop();
    let imported_targets = imported?;

    let mut combined_targets = imported_targets;
    combined_targets.extend(local_targets.iter().cloned());
    let resolved = ResolvedFile {
        local_targets,
        combined_targets,
    };
    cache.insert(path.to_path_buf(), resolved.clone());
    Ok(resolved)
}

// ── Import extraction ─────────────────────────────────────────────────────────

/// Split out the import lines, replacing each with a blank line so line
/// numbers survive.  Imports after any non-blank, non-comment code are an
/// error.
fn extract_imports(source: &str, source_path: &Path) -> Result<(Vec<ImportSpec>, String), ImportError> {
    let mut imports = Vec::new();
    let mut output_lines: Vec<&str> = Vec::new();
    let mut saw_non_import_code = false;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = if line_no == 1 {
            raw_line.trim_start_matches('\u{feff}')
        } else {
            raw_line
        };
        if let Some(caps) = IMPORT_PATTERN.captures(line) {
            if saw_non_import_code {
                return Err(ImportError(format!(
                    "Imports are only allowed at the top level. Invalid import in '{}' at line {}.",
                    source_path.display(),
                    line_no
                )));
            }
            let sprite_name = caps[1].trim().to_string();
            let relative_path = caps[2].trim().to_string();
            if sprite_name.is_empty() {
                return Err(ImportError(format!(
                    "Import sprite name cannot be empty in '{}' at line {}.",
                    source_path.display(),
                    line_no
                )));
            }
            if relative_path.is_empty() {
                return Err(ImportError(format!(
                    "Import path cannot be empty in '{}' at line {}.",
                    source_path.display(),
                    line_no
                )));
            }
            imports.push(ImportSpec {
                sprite_name,
                relative_path,
                line: line_no,
            });
            output_lines.push("");
            continue;
        }
        if !is_blank_or_comment(line) {
            saw_non_import_code = true;
        }
        output_lines.push(line);
    }
    Ok((imports, output_lines.join("\n")))
}

/// Parse targets from an import-stripped source.  A file that contains only
/// blank and comment lines defines zero targets rather than being a parse
/// error.
fn parse_local_targets(source: &str) -> Result<Vec<Target>, CompileError> {
    if source.lines().all(is_blank_or_comment) {
        return Ok(Vec::new());
    }
    Ok(parse_source(source)?.targets)
}

fn is_blank_or_comment(line: &str) -> bool {
    let stripped = line.trim();
    stripped.is_empty() || stripped.starts_with('#')
}

// ── Validation ────────────────────────────────────────────────────────────────

fn validate_imported_file(
    spec: &ImportSpec,
    source_path: &Path,
    child_path: &Path,
    local_targets: &[Target],
) -> Result<(), ImportError> {
    let local_sprites: Vec<&Target> = local_targets.iter().filter(|t| !t.is_stage).collect();
    if local_sprites.is_empty() {
        return Err(ImportError(format!(
            "Imported file '{}' defines zero sprites; expected exactly one (imported from '{}', line {}).",
            child_path.display(),
            source_path.display(),
            spec.line
        )));
    }
    if local_sprites.len() > 1 {
        return Err(ImportError(format!(
            "Imported file '{}' defines more than one sprite; expected exactly one (imported from '{}', line {}).",
            child_path.display(),
            source_path.display(),
            spec.line
        )));
    }
    if local_targets.iter().any(|t| t.is_stage) {
        return Err(ImportError(format!(
            "Imported file '{}' must not define a stage (imported from '{}', line {}).",
            child_path.display(),
            source_path.display(),
            spec.line
        )));
    }
    // The declared name must match exactly, including case.
    let actual = &local_sprites[0].name;
    if *actual != spec.sprite_name {
        return Err(ImportError(format!(
            "Imported sprite name mismatch in '{}', line {}: expected '{}', file defines '{}'.",
            source_path.display(),
            spec.line,
            spec.sprite_name,
            actual
        )));
    }
    Ok(())
}

fn ensure_unique_sprite_names(targets: &[Target]) -> Result<(), ImportError> {
    let mut seen = std::collections::HashSet::new();
    for target in targets {
        if target.is_stage {
            continue;
        }
        if !seen.insert(target.name.to_lowercase()) {
            return Err(ImportError(format!(
                "Duplicate sprite name in final project: '{}'.",
                target.name
            )));
        }
    }
    Ok(())
}

// ── Costume path normalization ────────────────────────────────────────────────

/// Rewrite relative costume paths to absolute ones.  Candidate roots are
/// tried in order (`source_dir`, its parent, the working directory); when
/// none exists the first candidate is kept so the later costume-loading
/// error can name a concrete path.
fn normalize_target_asset_paths(
    targets: &mut [Target],
    source_dir: &Path,
) -> Result<(), CompileError> {
    let cwd = std::env::current_dir()?;
    for target in targets.iter_mut() {
        for costume in target.costumes.iter_mut() {
            let costume_path = PathBuf::from(&costume.path);
            if costume_path.is_absolute() {
                continue;
            }
            let candidates = [
                source_dir.join(&costume_path),
                source_dir
                    .parent()
                    .unwrap_or(source_dir)
                    .join(&costume_path),
                cwd.join(&costume_path),
            ];
            let chosen = candidates
                .iter()
                .find(|c| c.exists())
                .unwrap_or(&candidates[0]);
            let absolute = fs::canonicalize(chosen).unwrap_or_else(|_| chosen.clone());
            costume.path = absolute.to_string_lossy().into_owned();
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
