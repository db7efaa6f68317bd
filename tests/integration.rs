use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

// ── helpers ──────────────────────────────────────────────────────────────────

fn compiler_bin() -> PathBuf {
    // CARGO_BIN_EXE_sbtextc is set by cargo test for integration tests.
    PathBuf::from(env!("CARGO_BIN_EXE_sbtextc"))
}

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().unwrap(),
        }
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn file_bytes(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Run the compiler on `input`.  Returns (stderr, exit code); the
    /// archive lands at `out.sb3` in the workspace.
    fn run(&self, input: &str, extra: &[&str]) -> (String, i32) {
        let out_path = self.dir.path().join("out.sb3");
        let output = Command::new(compiler_bin())
            .arg(self.dir.path().join(input))
            .arg(&out_path)
            .args(extra)
            .output()
            .expect("failed to run sbtextc");
        (
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
        )
    }

    /// Compile `input` expecting success and unpack the produced archive.
    fn compile(&self, input: &str) -> (Value, BTreeMap<String, Vec<u8>>) {
        let (stderr, code) = self.run(input, &[]);
        assert_eq!(code, 0, "compile failed: {stderr}");
        read_sb3(&self.dir.path().join("out.sb3"))
    }

    /// Compile `input` expecting failure; returns the diagnostic.
    fn compile_err(&self, input: &str) -> (String, i32) {
        let (stderr, code) = self.run(input, &[]);
        assert_ne!(code, 0, "expected a compile failure");
        assert!(
            !self.dir.path().join("out.sb3").exists(),
            "nothing must be emitted on error"
        );
        (stderr, code)
    }
}

fn read_sb3(path: &PathBuf) -> (Value, BTreeMap<String, Vec<u8>>) {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut assets = BTreeMap::new();
    let mut project_json = None;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        if entry.name() == "project.json" {
            project_json = Some(serde_json::from_slice(&bytes).unwrap());
        } else {
            assets.insert(entry.name().to_string(), bytes);
        }
    }
    (project_json.expect("archive contains project.json"), assets)
}

fn target<'v>(doc: &'v Value, name: &str) -> &'v Value {
    doc["targets"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == name)
        .unwrap_or_else(|| panic!("no target named {name}"))
}

fn find_block<'v>(target: &'v Value, opcode: &str) -> (&'v String, &'v Value) {
    target["blocks"]
        .as_object()
        .unwrap()
        .iter()
        .find(|(_, b)| b["opcode"] == opcode)
        .unwrap_or_else(|| panic!("no {opcode} block"))
}

/// Block-graph well-formedness: `next`/input children point at existing
/// blocks whose `parent` points back; top-level blocks have no parent.
fn assert_well_formed(doc: &Value) {
    for tgt in doc["targets"].as_array().unwrap() {
        let blocks = tgt["blocks"].as_object().unwrap();
        for (id, block) in blocks {
            if block["topLevel"] == Value::Bool(true) {
                assert!(block["parent"].is_null(), "top-level {id} has a parent");
            }
            if let Some(next) = block["next"].as_str() {
                let next_block = blocks
                    .get(next)
                    .unwrap_or_else(|| panic!("dangling next pointer {next}"));
                assert_eq!(next_block["parent"].as_str(), Some(id.as_str()));
            }
            for (_, input) in block["inputs"].as_object().unwrap() {
                if let Some(child) = input.as_array().unwrap()[1].as_str() {
                    let child_block = blocks
                        .get(child)
                        .unwrap_or_else(|| panic!("dangling input pointer {child}"));
                    assert_eq!(child_block["parent"].as_str(), Some(id.as_str()));
                }
            }
        }
    }
}

/// Content addressing: every costume's md5ext names an asset whose MD5
/// matches.
fn assert_assets_content_addressed(doc: &Value, assets: &BTreeMap<String, Vec<u8>>) {
    for tgt in doc["targets"].as_array().unwrap() {
        for costume in tgt["costumes"].as_array().unwrap() {
            let md5ext = costume["md5ext"].as_str().unwrap();
            let bytes = assets
                .get(md5ext)
                .unwrap_or_else(|| panic!("missing asset {md5ext}"));
            let digest = format!("{:x}", md5::compute(bytes));
            assert_eq!(
                md5ext,
                format!("{digest}.{}", costume["dataFormat"].as_str().unwrap())
            );
            assert_eq!(costume["assetId"].as_str(), Some(digest.as_str()));
        }
    }
}

// ── S1: minimal project ──────────────────────────────────────────────────────

const S1: &str = "stage\nwhen flag clicked\nbroadcast [start]\nend\nsprite Cat\nvar score\n\
                  when I receive [start]\nset [score] to (0)\nrepeat (3)\nchange [score] by (1)\nend\nend\nend\n";

#[test]
fn test_s1_minimal_project() {
    let ws = Workspace::new();
    ws.file("main.sbtext", S1);
    let (doc, assets) = ws.compile("main.sbtext");

    let targets = doc["targets"].as_array().unwrap();
    assert_eq!(targets[0]["isStage"], Value::Bool(true));
    assert_eq!(targets[0]["name"], "Stage");
    assert_eq!(targets[1]["name"], "Cat");

    // Exactly one variable `score` with initial value 0.
    let vars = targets[1]["variables"].as_object().unwrap();
    assert_eq!(vars.len(), 1);
    assert_eq!(vars.values().next().unwrap(), &serde_json::json!(["score", 0]));

    // One broadcast, same ID in the hat and in the menu.
    let broadcasts = targets[0]["broadcasts"].as_object().unwrap();
    assert_eq!(broadcasts.len(), 1);
    let (id, message) = broadcasts.iter().next().unwrap();
    assert_eq!(message, "start");
    let (_, hat) = find_block(target(&doc, "Cat"), "event_whenbroadcastreceived");
    assert_eq!(hat["fields"]["BROADCAST_OPTION"][1].as_str(), Some(id.as_str()));
    let (_, menu) = find_block(target(&doc, "Stage"), "event_broadcast_menu");
    assert_eq!(menu["fields"]["BROADCAST_OPTION"][1].as_str(), Some(id.as_str()));

    assert_well_formed(&doc);
    assert_assets_content_addressed(&doc, &assets);
}

// ── S2: procedure with parameter ─────────────────────────────────────────────

#[test]
fn test_s2_procedure_with_parameter() {
    let ws = Workspace::new();
    ws.file(
        "main.sbtext",
        "sprite A\ndefine greet (who)\nsay (who)\nend\nwhen flag clicked\ngreet (\"world\")\nend\nend\n",
    );
    let (doc, _) = ws.compile("main.sbtext");
    let sprite = target(&doc, "A");

    let (_, definition) = find_block(sprite, "procedures_definition");
    let prototype_id = definition["inputs"]["custom_block"][1].as_str().unwrap();
    let prototype = &sprite["blocks"][prototype_id];
    assert_eq!(prototype["mutation"]["proccode"], "greet %s");
    let arg_ids: Vec<String> =
        serde_json::from_str(prototype["mutation"]["argumentids"].as_str().unwrap()).unwrap();
    assert_eq!(arg_ids.len(), 1);

    // One argument-reporter shadow keyed by the argument ID.
    let shadow_id = prototype["inputs"][&arg_ids[0]][1].as_str().unwrap();
    let shadow = &sprite["blocks"][shadow_id];
    assert_eq!(shadow["opcode"], "argument_reporter_string_number");
    assert_eq!(shadow["shadow"], Value::Bool(true));

    // The call supplies its argument keyed by the same argument ID.
    let (_, call) = find_block(sprite, "procedures_call");
    assert_eq!(call["inputs"][&arg_ids[0]], serde_json::json!([1, [10, "world"]]));

    // `say` reads the parameter via a (non-shadow) argument reporter.
    let (_, say) = find_block(sprite, "looks_say");
    let reporter = &sprite["blocks"][say["inputs"]["MESSAGE"][1].as_str().unwrap()];
    assert_eq!(reporter["opcode"], "argument_reporter_string_number");
    assert_eq!(reporter["shadow"], Value::Bool(false));
    assert_eq!(reporter["fields"]["VALUE"], serde_json::json!(["who", null]));

    assert_well_formed(&doc);
}

// ── S3: if/else and comparison lowering ──────────────────────────────────────

#[test]
fn test_s3_if_else_condition_lowering() {
    let ws = Workspace::new();
    ws.file(
        "main.sbtext",
        "sprite A\nvar x\nwhen flag clicked\nif <(x) < (10)> then\nshow\nelse\nhide\nend\nend\nend\n",
    );
    let (doc, _) = ws.compile("main.sbtext");
    let sprite = target(&doc, "A");

    let (_, if_block) = find_block(sprite, "control_if_else");
    let condition_id = if_block["inputs"]["CONDITION"][1].as_str().unwrap();
    assert_eq!(sprite["blocks"][condition_id]["opcode"], "operator_lt");
    assert!(if_block["inputs"]["SUBSTACK"].is_array());
    assert!(if_block["inputs"]["SUBSTACK2"].is_array());
    assert_well_formed(&doc);
}

#[test]
fn test_s3_lte_lowers_to_or() {
    let ws = Workspace::new();
    ws.file(
        "main.sbtext",
        "sprite A\nvar x\nwhen flag clicked\nif <(x) <= (10)> then\nshow\nend\nend\nend\n",
    );
    let (doc, _) = ws.compile("main.sbtext");
    let sprite = target(&doc, "A");

    let (_, or) = find_block(sprite, "operator_or");
    let lt = &sprite["blocks"][or["inputs"]["OPERAND1"][1].as_str().unwrap()];
    let eq = &sprite["blocks"][or["inputs"]["OPERAND2"][1].as_str().unwrap()];
    assert_eq!(lt["opcode"], "operator_lt");
    assert_eq!(eq["opcode"], "operator_equals");
}

// ── S4: imports ──────────────────────────────────────────────────────────────

#[test]
fn test_s4_import_success() {
    let ws = Workspace::new();
    ws.file("cat.sbtext", "sprite Cat\nwhen flag clicked\nshow\nend\nend\n");
    ws.file("main.sbtext", "import [Cat] from \"cat.sbtext\"\nstage\nend\n");
    let (doc, _) = ws.compile("main.sbtext");
    let names: Vec<&str> = doc["targets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Stage", "Cat"]);
}

#[test]
fn test_s4_imported_stage_rejected() {
    let ws = Workspace::new();
    ws.file("cat.sbtext", "stage\nend\nsprite Cat\nend\n");
    ws.file("main.sbtext", "import [Cat] from \"cat.sbtext\"\nstage\nend\n");
    let (stderr, _) = ws.compile_err("main.sbtext");
    assert!(stderr.contains("must not define a stage"));
}

#[test]
fn test_s4_import_name_mismatch_rejected() {
    let ws = Workspace::new();
    ws.file("cat.sbtext", "sprite Dog\nend\n");
    ws.file("main.sbtext", "import [Cat] from \"cat.sbtext\"\nstage\nend\n");
    let (stderr, _) = ws.compile_err("main.sbtext");
    assert!(stderr.contains("name mismatch"));
}

#[test]
fn test_s4_import_two_sprites_rejected() {
    let ws = Workspace::new();
    ws.file("cat.sbtext", "sprite Cat\nend\nsprite Dog\nend\n");
    ws.file("main.sbtext", "import [Cat] from \"cat.sbtext\"\nstage\nend\n");
    let (stderr, _) = ws.compile_err("main.sbtext");
    assert!(stderr.contains("more than one sprite"));
}

#[test]
fn test_s4_import_cycle_rejected() {
    let ws = Workspace::new();
    ws.file("a.sbtext", "import [B] from \"b.sbtext\"\nsprite A\nend\n");
    ws.file("b.sbtext", "import [A] from \"a.sbtext\"\nsprite B\nend\n");
    let (stderr, _) = ws.compile_err("a.sbtext");
    assert!(stderr.contains("Circular import detected"));
    assert!(stderr.contains("a.sbtext") && stderr.contains("b.sbtext"));
}

// ── S5: forward call ─────────────────────────────────────────────────────────

#[test]
fn test_s5_forward_call_rejected() {
    let ws = Workspace::new();
    ws.file(
        "main.sbtext",
        "sprite A\nwhen flag clicked\ngreet ()\nend\ndefine greet\nsay (\"hi\")\nend\nend\n",
    );
    let (stderr, code) = ws.compile_err("main.sbtext");
    assert_eq!(code, 1);
    assert!(stderr.contains("used before it is defined"));
    assert!(stderr.contains("definition line 5"));
}

// ── S6: costume hashing ──────────────────────────────────────────────────────

#[test]
fn test_s6_shared_costume_hashes_once() {
    let ws = Workspace::new();
    ws.file(
        "ball.svg",
        "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 100 100\"><circle cx=\"50\" cy=\"50\" r=\"40\"/></svg>",
    );
    ws.file(
        "main.sbtext",
        "stage\nend\nsprite A\ncostume \"ball.svg\"\nend\nsprite B\ncostume \"ball.svg\"\nend\n",
    );
    let (doc, assets) = ws.compile("main.sbtext");

    let a_md5 = target(&doc, "A")["costumes"][0]["md5ext"].as_str().unwrap();
    let b_md5 = target(&doc, "B")["costumes"][0]["md5ext"].as_str().unwrap();
    assert_eq!(a_md5, b_md5, "identical normalized bytes share one asset");
    // Stage backdrop + the shared ball costume.
    assert_eq!(assets.len(), 2);
    assert_assets_content_addressed(&doc, &assets);
}

#[test]
fn test_png_costume_round_trips_bytes() {
    let ws = Workspace::new();
    let png = [0x89u8, b'P', b'N', b'G', 13, 10, 26, 10, 1, 2, 3];
    ws.file_bytes("dot.png", &png);
    ws.file("main.sbtext", "stage\nend\nsprite A\ncostume \"dot.png\"\nend\n");
    let (doc, assets) = ws.compile("main.sbtext");
    let entry = &target(&doc, "A")["costumes"][0];
    assert_eq!(entry["dataFormat"], "png");
    assert_eq!(entry["bitmapResolution"], 1);
    assert_eq!(assets[entry["md5ext"].as_str().unwrap()], png);
}

// ── CLI contract ─────────────────────────────────────────────────────────────

#[test]
fn test_missing_input_exits_2() {
    let ws = Workspace::new();
    let (stderr, code) = ws.run("absent.sbtext", &[]);
    assert_eq!(code, 2);
    assert!(stderr.contains("Input file not found"));
}

#[test]
fn test_parse_error_diagnostic_carries_position() {
    let ws = Workspace::new();
    ws.file("main.sbtext", "stage\nwhen flag clicked\nmove 10\nend\nend\n");
    let (stderr, code) = ws.compile_err("main.sbtext");
    assert_eq!(code, 1);
    assert!(stderr.contains("line 3"), "diagnostic: {stderr}");
}

#[test]
fn test_no_svg_scale_flag_keeps_geometry() {
    let ws = Workspace::new();
    ws.file(
        "ball.svg",
        "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 100 100\"><circle r=\"4\"/></svg>",
    );
    ws.file("main.sbtext", "stage\nend\nsprite A\ncostume \"ball.svg\"\nend\n");
    let (_, code) = ws.run("main.sbtext", &["--no-svg-scale"]);
    assert_eq!(code, 0);
    let (doc, assets) = read_sb3(&ws.dir.path().join("out.sb3"));
    let entry = &target(&doc, "A")["costumes"][0];
    assert_eq!(entry["rotationCenterX"], 50.0);
    assert_eq!(entry["rotationCenterY"], 50.0);
    let bytes = &assets[entry["md5ext"].as_str().unwrap()];
    let text = String::from_utf8_lossy(bytes);
    assert!(text.contains("viewBox=\"0 0 100 100\""));
}

#[test]
fn test_output_into_new_directory() {
    let ws = Workspace::new();
    let input = ws.file("main.sbtext", "stage\nend\n");
    let out = ws.dir.path().join("build/nested/out.sb3");
    let output = Command::new(compiler_bin())
        .arg(&input)
        .arg(&out)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(out.is_file());
}

// ── whole-program sweep ──────────────────────────────────────────────────────

#[test]
fn test_full_language_surface_compiles_well_formed() {
    let ws = Workspace::new();
    ws.file(
        "main.sbtext",
        "stage\nwhen flag clicked\nnext backdrop\nreset timer\nend\nend\n\
         sprite Robot\nvar hp\nlist moves\n\
         define attack (power) (label)\n\
         say (label)\nchange [hp] by (-(power))\n\
         end\n\
         when flag clicked\n\
         go to x (0) y (0)\npoint in direction (90)\n\
         forever\n\
         if <(hp) > (0) and not (key (\"q\") pressed?)> then\n\
         move (pick random (1) to (10)) steps\nturn right (15)\nif on edge bounce\n\
         add (timer) to [moves]\nattack (item (1) of [moves]) (\"hit\")\n\
         else\n\
         stop [this script]\n\
         end\nend\nend\n\
         when this sprite clicked\n\
         think (\"ouch\")\nwait (0.5)\nhide\nshow\nnext costume\n\
         set size to (120)\nchange size by (-(10))\nask (\"name?\") and wait\nsay (answer)\n\
         end\nend\n",
    );
    let (doc, assets) = ws.compile("main.sbtext");
    assert_well_formed(&doc);
    assert_assets_content_addressed(&doc, &assets);
    let robot = target(&doc, "Robot");
    for opcode in [
        "procedures_definition",
        "procedures_prototype",
        "procedures_call",
        "control_forever",
        "control_if_else",
        "control_stop",
        "operator_random",
        "data_itemoflist",
        "data_addtolist",
        "sensing_keypressed",
        "sensing_answer",
        "motion_ifonedgebounce",
    ] {
        find_block(robot, opcode);
    }
}
