//! Costume loading and content addressing.
//!
//! Every costume becomes an asset keyed by `<md5-hex>.<ext>` — the MD5 is
//! taken over the final bytes (after SVG normalization), so identical
//! costumes across targets collapse into a single archive entry.  Targets
//! without costumes get a synthesized default so the produced project always
//! opens in the Scratch editor.

use crate::ast::Target;
use crate::codegen::svg::prepare_svg;
use crate::error::CodegenError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ── Default assets ────────────────────────────────────────────────────────────

const DEFAULT_STAGE_SVG: &[u8] = br##"<svg xmlns="http://www.w3.org/2000/svg" width="480" height="360" viewBox="0 0 480 360"><rect width="480" height="360" fill="#ffffff"/></svg>"##;
const DEFAULT_SPRITE_SVG: &[u8] = br##"<svg xmlns="http://www.w3.org/2000/svg" width="96" height="96" viewBox="0 0 96 96"><circle cx="48" cy="48" r="40" fill="#4c97ff"/></svg>"##;

// ── Costume entries ───────────────────────────────────────────────────────────

/// One entry of a target's `costumes` array in `project.json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostumeEntry {
    pub name: String,
    pub asset_id: String,
    pub md5ext: String,
    pub data_format: String,
    pub rotation_center_x: f64,
    pub rotation_center_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap_resolution: Option<u32>,
}

/// Load, normalize, and hash every costume of `target`, appending the final
/// bytes to `assets`.  Identical bytes collide on the same asset key, which
/// is exactly the deduplication the archive wants.
pub fn build_costumes(
    target: &Target,
    source_dir: &Path,
    scale_svgs: bool,
    assets: &mut BTreeMap<String, Vec<u8>>,
) -> Result<Vec<CostumeEntry>, CodegenError> {
    let mut entries = Vec::new();

    if target.costumes.is_empty() {
        let (data, name) = if target.is_stage {
            (DEFAULT_STAGE_SVG, "backdrop1")
        } else {
            (DEFAULT_SPRITE_SVG, "costume1")
        };
        let (data, cx, cy) = prepare_svg(data, name, scale_svgs)?;
        entries.push(finish_entry(name.to_string(), data, "svg", cx, cy, assets));
        return Ok(entries);
    }

    for costume in &target.costumes {
        let file_path = resolve_costume_path(&costume.path, source_dir);
        if !file_path.is_file() {
            return Err(CodegenError(format!(
                "Costume file not found for target '{}': '{}' resolved to '{}'.",
                target.name,
                costume.path,
                file_path.display()
            )));
        }
        let ext = file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if ext != "svg" && ext != "png" {
            return Err(CodegenError(format!(
                "Unsupported costume format '.{}' for '{}'. Only .svg and .png are supported.",
                ext,
                file_path.display()
            )));
        }
        let raw = std::fs::read(&file_path)
            .map_err(|e| CodegenError(format!("Failed to read '{}': {e}.", file_path.display())))?;
        let name = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("costume")
            .to_string();

        let entry = if ext == "svg" {
            let (data, cx, cy) = prepare_svg(&raw, &costume.path, scale_svgs)?;
            finish_entry(name, data, "svg", cx, cy, assets)
        } else {
            let mut entry = finish_entry(name, raw, "png", 0.0, 0.0, assets);
            entry.bitmap_resolution = Some(1);
            entry
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn finish_entry(
    name: String,
    data: Vec<u8>,
    ext: &str,
    cx: f64,
    cy: f64,
    assets: &mut BTreeMap<String, Vec<u8>>,
) -> CostumeEntry {
    let digest = format!("{:x}", md5::compute(&data));
    let md5ext = format!("{digest}.{ext}");
    assets.insert(md5ext.clone(), data);
    CostumeEntry {
        name,
        asset_id: digest,
        md5ext,
        data_format: ext.to_string(),
        rotation_center_x: cx,
        rotation_center_y: cy,
        bitmap_resolution: None,
    }
}

/// Costume paths are normally absolutized by the import resolver; anything
/// still relative is resolved against the same candidate roots it uses.
fn resolve_costume_path(path: &str, source_dir: &Path) -> PathBuf {
    let costume_path = PathBuf::from(path);
    if costume_path.is_absolute() {
        return costume_path;
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let candidates = [
        source_dir.join(&costume_path),
        source_dir
            .parent()
            .unwrap_or(source_dir)
            .join(&costume_path),
        cwd.join(&costume_path),
    ];
    candidates
        .iter()
        .find(|c| c.exists())
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
