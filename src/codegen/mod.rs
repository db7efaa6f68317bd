//! Lowering from the validated AST to Scratch's block-graph JSON.
//!
//! Every block is a record `{opcode, next, parent, inputs, fields, shadow,
//! topLevel}` stored in a per-target map keyed by a freshly minted ID.
//! IDs come from one compile-local counter with semantic prefixes
//! (`block_`, `var_`, `list_`, `arg_`, `broadcast_`), so a given parse
//! always emits the same graph.
//!
//! Broadcast IDs are interned in two passes — collect every literal message
//! across all targets, then assign IDs in lexicographic message order — so
//! ID assignment does not depend on AST traversal order.  The stage target
//! carries the full `broadcasts` map; sprites carry an empty one.

pub mod costumes;
pub mod svg;

use crate::ast::{
    BinaryOp, BuiltinReporter, EventKind, EventScript, Expr, ExprKind, Procedure, Project, Stmt,
    StmtKind, Target, UnaryOp,
};
use crate::error::CodegenError;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

// ── Public entry point ────────────────────────────────────────────────────────

/// Lower a project to `(project.json, asset bytes keyed by md5ext)`.
pub fn generate_project_json(
    project: &Project,
    source_dir: &Path,
    scale_svgs: bool,
) -> Result<(Value, BTreeMap<String, Vec<u8>>), CodegenError> {
    ProjectBuilder::new(project, source_dir, scale_svgs).build()
}

// ── Builder state ─────────────────────────────────────────────────────────────

struct ProcedureSignature {
    params: Vec<String>,
    arg_ids: Vec<String>,
    /// `"name"` or `"name %s %s …"` — the printable signature matching
    /// definitions to calls.
    proccode: String,
}

/// Per-target lookup tables shared by every emitter.
struct EmitCtx<'t> {
    variables: &'t HashMap<String, String>,
    lists: &'t HashMap<String, String>,
    signatures: &'t HashMap<String, ProcedureSignature>,
    /// Lowercased parameter names of the procedure being emitted; empty for
    /// event scripts.
    params: HashSet<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum ShadowKind {
    Number,
    Text,
    Boolean,
}

type Blocks = Map<String, Value>;

struct ProjectBuilder<'a> {
    project: &'a Project,
    source_dir: &'a Path,
    scale_svgs: bool,
    id_counter: u64,
    assets: BTreeMap<String, Vec<u8>>,
    /// message → interned broadcast ID.
    broadcast_ids: BTreeMap<String, String>,
}

impl<'a> ProjectBuilder<'a> {
    fn new(project: &'a Project, source_dir: &'a Path, scale_svgs: bool) -> Self {
        Self {
            project,
            source_dir,
            scale_svgs,
            id_counter: 0,
            assets: BTreeMap::new(),
            broadcast_ids: BTreeMap::new(),
        }
    }

    fn build(mut self) -> Result<(Value, BTreeMap<String, Vec<u8>>), CodegenError> {
        self.collect_broadcast_ids();

        let project = self.project;
        let synthesized_stage = if project.targets.iter().any(|t| t.is_stage) {
            None
        } else {
            Some(self.synthesized_stage_target())
        };
        let stage: Option<&Target> = synthesized_stage
            .as_ref()
            .or_else(|| project.targets.iter().find(|t| t.is_stage));
        let mut ordered: Vec<&Target> = Vec::new();
        if let Some(stage) = stage {
            ordered.push(stage);
        }
        ordered.extend(project.targets.iter().filter(|t| !t.is_stage));

        let mut targets_json = Vec::new();
        let mut sprite_layer = 1usize;
        for target in ordered {
            let layer = if target.is_stage {
                0
            } else {
                let layer = sprite_layer;
                sprite_layer += 1;
                layer
            };
            targets_json.push(self.build_target_json(target, layer)?);
        }

        let project_json = json!({
            "targets": targets_json,
            "monitors": [],
            "extensions": [],
            "meta": {
                "semver": "3.0.0",
                "vm": "0.2.0",
                "agent": "SBText Compiler",
            },
        });
        Ok((project_json, self.assets))
    }

    /// A stage named `Stage` (`Stage2`, `Stage3`, … when a sprite already
    /// took the name) for projects that never declared one.
    fn synthesized_stage_target(&self) -> Target {
        let existing: HashSet<String> = self
            .project
            .targets
            .iter()
            .map(|t| t.name.to_lowercase())
            .collect();
        let mut name = "Stage".to_string();
        let mut suffix = 1u32;
        while existing.contains(&name.to_lowercase()) {
            suffix += 1;
            name = format!("Stage{suffix}");
        }
        Target::new(crate::ast::Pos::new(0, 0), name, true)
    }

    // ── target serialization ────────────────────────────────────────────────

    fn build_target_json(&mut self, target: &Target, layer_order: usize) -> Result<Value, CodegenError> {
        let mut blocks: Blocks = Map::new();

        let mut variables_map = HashMap::new();
        let mut variables_json = Map::new();
        for decl in &target.variables {
            let var_id = self.new_id("var");
            variables_map.insert(decl.name.to_lowercase(), var_id.clone());
            variables_json.insert(var_id, json!([decl.name, 0]));
        }
        let mut lists_map = HashMap::new();
        let mut lists_json = Map::new();
        for decl in &target.lists {
            let list_id = self.new_id("list");
            lists_map.insert(decl.name.to_lowercase(), list_id.clone());
            lists_json.insert(list_id, json!([decl.name, []]));
        }

        let signatures = self.build_procedure_signatures(target);

        let mut y_cursor = 30i64;
        for procedure in &target.procedures {
            let ctx = EmitCtx {
                variables: &variables_map,
                lists: &lists_map,
                signatures: &signatures,
                params: procedure.params.iter().map(|p| p.to_lowercase()).collect(),
            };
            y_cursor = self.emit_procedure_definition(&mut blocks, procedure, &ctx, y_cursor)?;
            y_cursor += 40;
        }
        for script in &target.scripts {
            let ctx = EmitCtx {
                variables: &variables_map,
                lists: &lists_map,
                signatures: &signatures,
                params: HashSet::new(),
            };
            y_cursor = self.emit_event_script(&mut blocks, script, &ctx, y_cursor)?;
            y_cursor += 40;
        }

        let costumes = costumes::build_costumes(target, self.source_dir, self.scale_svgs, &mut self.assets)?;
        let costumes_json = costumes
            .iter()
            .map(|c| serde_json::to_value(c).expect("costume entries serialize infallibly"))
            .collect::<Vec<_>>();

        let broadcasts: Map<String, Value> = if target.is_stage {
            self.broadcast_ids
                .iter()
                .map(|(message, id)| (id.clone(), json!(message)))
                .collect()
        } else {
            Map::new()
        };

        let mut target_json = json!({
            "isStage": target.is_stage,
            "name": target.name,
            "variables": variables_json,
            "lists": lists_json,
            "broadcasts": broadcasts,
            "blocks": blocks,
            "comments": {},
            "currentCostume": 0,
            "costumes": costumes_json,
            "sounds": [],
            "volume": 100,
            "layerOrder": layer_order,
        });
        let extra = if target.is_stage {
            json!({
                "tempo": 60,
                "videoTransparency": 50,
                "videoState": "on",
                "textToSpeechLanguage": null,
            })
        } else {
            json!({
                "visible": true,
                "x": 0,
                "y": 0,
                "size": 100,
                "direction": 90,
                "draggable": false,
                "rotationStyle": "all around",
            })
        };
        if let (Value::Object(dst), Value::Object(src)) = (&mut target_json, extra) {
            dst.extend(src);
        }
        Ok(target_json)
    }

    // ── procedures ──────────────────────────────────────────────────────────

    fn build_procedure_signatures(&mut self, target: &Target) -> HashMap<String, ProcedureSignature> {
        let mut signatures = HashMap::new();
        for procedure in &target.procedures {
            let arg_ids: Vec<String> = procedure.params.iter().map(|_| self.new_id("arg")).collect();
            let placeholders = vec!["%s"; procedure.params.len()].join(" ");
            let proccode = if placeholders.is_empty() {
                procedure.name.clone()
            } else {
                format!("{} {}", procedure.name, placeholders)
            };
            signatures.insert(
                procedure.name.to_lowercase(),
                ProcedureSignature {
                    params: procedure.params.clone(),
                    arg_ids,
                    proccode,
                },
            );
        }
        signatures
    }

    fn emit_procedure_definition(
        &mut self,
        blocks: &mut Blocks,
        procedure: &Procedure,
        ctx: &EmitCtx<'_>,
        start_y: i64,
    ) -> Result<i64, CodegenError> {
        let signature = &ctx.signatures[&procedure.name.to_lowercase()];
        let definition_id = self.new_block_id();
        let prototype_id = self.new_block_id();

        blocks.insert(
            definition_id.clone(),
            json!({
                "opcode": "procedures_definition",
                "next": null,
                "parent": null,
                "inputs": { "custom_block": [1, prototype_id.clone()] },
                "fields": {},
                "shadow": false,
                "topLevel": true,
                "x": 30,
                "y": start_y,
            }),
        );

        let mut prototype_inputs = Map::new();
        for (param_name, arg_id) in signature.params.iter().zip(&signature.arg_ids) {
            let reporter_id = self.new_block_id();
            blocks.insert(
                reporter_id.clone(),
                json!({
                    "opcode": "argument_reporter_string_number",
                    "next": null,
                    "parent": prototype_id.clone(),
                    "inputs": {},
                    "fields": { "VALUE": [param_name, null] },
                    "shadow": true,
                    "topLevel": false,
                }),
            );
            prototype_inputs.insert(arg_id.clone(), json!([1, reporter_id]));
        }

        let defaults: Vec<&str> = signature.params.iter().map(|_| "").collect();
        blocks.insert(
            prototype_id.clone(),
            json!({
                "opcode": "procedures_prototype",
                "next": null,
                "parent": definition_id.clone(),
                "inputs": prototype_inputs,
                "fields": {},
                "shadow": true,
                "topLevel": false,
                "mutation": {
                    "tagName": "mutation",
                    "children": [],
                    "proccode": signature.proccode,
                    "argumentids": encode_json_list(&signature.arg_ids),
                    "argumentnames": encode_json_list(&signature.params),
                    "argumentdefaults": encode_json_list(&defaults),
                    "warp": "false",
                },
            }),
        );

        let (first, last) = self.emit_statement_chain(blocks, &procedure.body, &definition_id, ctx)?;
        if let Some(first) = first {
            set_block_field(blocks, &definition_id, "next", json!(first));
            return Ok(start_y + 120 + if last.is_some() { 20 } else { 0 });
        }
        Ok(start_y + 80)
    }

    // ── event scripts ───────────────────────────────────────────────────────

    fn emit_event_script(
        &mut self,
        blocks: &mut Blocks,
        script: &EventScript,
        ctx: &EmitCtx<'_>,
        start_y: i64,
    ) -> Result<i64, CodegenError> {
        let (opcode, fields) = match &script.kind {
            EventKind::FlagClicked => ("event_whenflagclicked", json!({})),
            EventKind::ThisSpriteClicked => ("event_whenthisspriteclicked", json!({})),
            EventKind::Receive(message) => {
                let broadcast_id = self.broadcast_id(message);
                (
                    "event_whenbroadcastreceived",
                    json!({ "BROADCAST_OPTION": [message, broadcast_id] }),
                )
            }
        };

        let hat_id = self.new_block_id();
        blocks.insert(
            hat_id.clone(),
            json!({
                "opcode": opcode,
                "next": null,
                "parent": null,
                "inputs": {},
                "fields": fields,
                "shadow": false,
                "topLevel": true,
                "x": 320,
                "y": start_y,
            }),
        );

        let (first, last) = self.emit_statement_chain(blocks, &script.body, &hat_id, ctx)?;
        if let Some(first) = first {
            set_block_field(blocks, &hat_id, "next", json!(first));
            return Ok(start_y + 120 + if last.is_some() { 20 } else { 0 });
        }
        Ok(start_y + 80)
    }

    // ── statement chains ────────────────────────────────────────────────────

    /// Emit `statements` as a `next`-linked chain hanging off `parent_id`.
    /// Returns the first and last emitted IDs (both `None` for an empty
    /// body).
    fn emit_statement_chain(
        &mut self,
        blocks: &mut Blocks,
        statements: &[Stmt],
        parent_id: &str,
        ctx: &EmitCtx<'_>,
    ) -> Result<(Option<String>, Option<String>), CodegenError> {
        let mut first: Option<String> = None;
        let mut prev: Option<String> = None;
        for stmt in statements {
            let stmt_parent = prev.clone().unwrap_or_else(|| parent_id.to_string());
            let stmt_id = self.emit_statement(blocks, stmt, &stmt_parent, ctx)?;
            if let Some(prev_id) = &prev {
                set_block_field(blocks, prev_id, "next", json!(stmt_id.clone()));
            }
            if first.is_none() {
                first = Some(stmt_id.clone());
            }
            prev = Some(stmt_id);
        }
        Ok((first, prev))
    }

    fn emit_statement(
        &mut self,
        blocks: &mut Blocks,
        stmt: &Stmt,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
    ) -> Result<String, CodegenError> {
        use ShadowKind::{Boolean, Number, Text};
        match &stmt.kind {
            StmtKind::Broadcast { message } => self.emit_broadcast_stmt(blocks, message, parent_id),
            StmtKind::SetVar { name, value } => {
                self.emit_variable_stmt(blocks, "data_setvariableto", name, value, parent_id, ctx)
            }
            StmtKind::ChangeVar { name, delta } => {
                self.emit_variable_stmt(blocks, "data_changevariableby", name, delta, parent_id, ctx)
            }
            StmtKind::Move { steps } => {
                self.emit_single_input_stmt(blocks, "motion_movesteps", "STEPS", steps, parent_id, ctx, Number)
            }
            StmtKind::TurnRight { degrees } => {
                self.emit_single_input_stmt(blocks, "motion_turnright", "DEGREES", degrees, parent_id, ctx, Number)
            }
            StmtKind::TurnLeft { degrees } => {
                self.emit_single_input_stmt(blocks, "motion_turnleft", "DEGREES", degrees, parent_id, ctx, Number)
            }
            StmtKind::GoToXy { x, y } => {
                let block_id = self.new_block_id();
                let x_input = self.expr_input(blocks, x, &block_id, ctx, Number)?;
                let y_input = self.expr_input(blocks, y, &block_id, ctx, Number)?;
                blocks.insert(
                    block_id.clone(),
                    block_record("motion_gotoxy", parent_id, json!({ "X": x_input, "Y": y_input }), json!({})),
                );
                Ok(block_id)
            }
            StmtKind::ChangeX { value } => {
                self.emit_single_input_stmt(blocks, "motion_changexby", "DX", value, parent_id, ctx, Number)
            }
            StmtKind::SetX { value } => {
                self.emit_single_input_stmt(blocks, "motion_setx", "X", value, parent_id, ctx, Number)
            }
            StmtKind::ChangeY { value } => {
                self.emit_single_input_stmt(blocks, "motion_changeyby", "DY", value, parent_id, ctx, Number)
            }
            StmtKind::SetY { value } => {
                self.emit_single_input_stmt(blocks, "motion_sety", "Y", value, parent_id, ctx, Number)
            }
            StmtKind::PointInDirection { direction } => self.emit_single_input_stmt(
                blocks,
                "motion_pointindirection",
                "DIRECTION",
                direction,
                parent_id,
                ctx,
                Number,
            ),
            StmtKind::IfOnEdgeBounce => Ok(self.emit_no_input_stmt(blocks, "motion_ifonedgebounce", parent_id)),
            StmtKind::Say { message } => {
                self.emit_single_input_stmt(blocks, "looks_say", "MESSAGE", message, parent_id, ctx, Text)
            }
            StmtKind::Think { message } => {
                self.emit_single_input_stmt(blocks, "looks_think", "MESSAGE", message, parent_id, ctx, Text)
            }
            StmtKind::Show => Ok(self.emit_no_input_stmt(blocks, "looks_show", parent_id)),
            StmtKind::Hide => Ok(self.emit_no_input_stmt(blocks, "looks_hide", parent_id)),
            StmtKind::NextCostume => Ok(self.emit_no_input_stmt(blocks, "looks_nextcostume", parent_id)),
            StmtKind::NextBackdrop => Ok(self.emit_no_input_stmt(blocks, "looks_nextbackdrop", parent_id)),
            StmtKind::ChangeSize { value } => {
                self.emit_single_input_stmt(blocks, "looks_changesizeby", "CHANGE", value, parent_id, ctx, Number)
            }
            StmtKind::SetSize { value } => {
                self.emit_single_input_stmt(blocks, "looks_setsizeto", "SIZE", value, parent_id, ctx, Number)
            }
            StmtKind::Wait { duration } => {
                self.emit_single_input_stmt(blocks, "control_wait", "DURATION", duration, parent_id, ctx, Number)
            }
            StmtKind::Repeat { times, body } => {
                let block_id = self.new_block_id();
                let times_input = self.expr_input(blocks, times, &block_id, ctx, Number)?;
                blocks.insert(
                    block_id.clone(),
                    block_record("control_repeat", parent_id, json!({ "TIMES": times_input }), json!({})),
                );
                let (sub_first, _) = self.emit_statement_chain(blocks, body, &block_id, ctx)?;
                if let Some(sub_first) = sub_first {
                    set_block_input(blocks, &block_id, "SUBSTACK", json!([2, sub_first]));
                }
                Ok(block_id)
            }
            StmtKind::Forever { body } => {
                let block_id = self.new_block_id();
                blocks.insert(
                    block_id.clone(),
                    block_record("control_forever", parent_id, json!({}), json!({})),
                );
                let (sub_first, _) = self.emit_statement_chain(blocks, body, &block_id, ctx)?;
                if let Some(sub_first) = sub_first {
                    set_block_input(blocks, &block_id, "SUBSTACK", json!([2, sub_first]));
                }
                Ok(block_id)
            }
            StmtKind::If {
                condition,
                then_body,
                else_body,
            } => {
                let block_id = self.new_block_id();
                let condition_input = self.expr_input(blocks, condition, &block_id, ctx, Boolean)?;
                blocks.insert(
                    block_id.clone(),
                    block_record(
                        "control_if_else",
                        parent_id,
                        json!({ "CONDITION": condition_input }),
                        json!({}),
                    ),
                );
                let (then_first, _) = self.emit_statement_chain(blocks, then_body, &block_id, ctx)?;
                let (else_first, _) = self.emit_statement_chain(blocks, else_body, &block_id, ctx)?;
                if let Some(then_first) = then_first {
                    set_block_input(blocks, &block_id, "SUBSTACK", json!([2, then_first]));
                }
                if let Some(else_first) = else_first {
                    set_block_input(blocks, &block_id, "SUBSTACK2", json!([2, else_first]));
                }
                Ok(block_id)
            }
            StmtKind::Stop { option } => {
                let block_id = self.new_block_id();
                let mut block = block_record(
                    "control_stop",
                    parent_id,
                    json!({}),
                    json!({ "STOP_OPTION": [option, null] }),
                );
                block["mutation"] = json!({
                    "tagName": "mutation",
                    "children": [],
                    "hasnext": "false",
                });
                blocks.insert(block_id.clone(), block);
                Ok(block_id)
            }
            StmtKind::Ask { question } => self.emit_single_input_stmt(
                blocks,
                "sensing_askandwait",
                "QUESTION",
                question,
                parent_id,
                ctx,
                Text,
            ),
            StmtKind::ResetTimer => Ok(self.emit_no_input_stmt(blocks, "sensing_resettimer", parent_id)),
            StmtKind::AddToList { list, item } => {
                self.emit_list_stmt(blocks, "data_addtolist", list, parent_id, ctx, &[("ITEM", item, Text)])
            }
            StmtKind::DeleteOfList { list, index } => self.emit_list_stmt(
                blocks,
                "data_deleteoflist",
                list,
                parent_id,
                ctx,
                &[("INDEX", index, Number)],
            ),
            StmtKind::DeleteAllOfList { list } => {
                self.emit_list_stmt(blocks, "data_deletealloflist", list, parent_id, ctx, &[])
            }
            StmtKind::InsertAtList { list, item, index } => self.emit_list_stmt(
                blocks,
                "data_insertatlist",
                list,
                parent_id,
                ctx,
                &[("ITEM", item, Text), ("INDEX", index, Number)],
            ),
            StmtKind::ReplaceItemOfList { list, index, item } => self.emit_list_stmt(
                blocks,
                "data_replaceitemoflist",
                list,
                parent_id,
                ctx,
                &[("INDEX", index, Number), ("ITEM", item, Text)],
            ),
            StmtKind::Call { name, args } => self.emit_call_stmt(blocks, name, args, parent_id, ctx),
        }
    }

    // ── statement emitters ──────────────────────────────────────────────────

    fn emit_broadcast_stmt(
        &mut self,
        blocks: &mut Blocks,
        message: &str,
        parent_id: &str,
    ) -> Result<String, CodegenError> {
        let block_id = self.new_block_id();
        let menu_id = self.new_block_id();
        let broadcast_id = self.broadcast_id(message);
        blocks.insert(
            block_id.clone(),
            block_record(
                "event_broadcast",
                parent_id,
                json!({ "BROADCAST_INPUT": [1, menu_id.clone()] }),
                json!({}),
            ),
        );
        blocks.insert(
            menu_id.clone(),
            json!({
                "opcode": "event_broadcast_menu",
                "next": null,
                "parent": block_id.clone(),
                "inputs": {},
                "fields": { "BROADCAST_OPTION": [message, broadcast_id] },
                "shadow": true,
                "topLevel": false,
            }),
        );
        Ok(block_id)
    }

    fn emit_variable_stmt(
        &mut self,
        blocks: &mut Blocks,
        opcode: &str,
        var_name: &str,
        value: &Expr,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
    ) -> Result<String, CodegenError> {
        let var_id = lookup_var_id(ctx.variables, var_name)?;
        let block_id = self.new_block_id();
        let value_input = self.expr_input(blocks, value, &block_id, ctx, ShadowKind::Number)?;
        blocks.insert(
            block_id.clone(),
            block_record(
                opcode,
                parent_id,
                json!({ "VALUE": value_input }),
                json!({ "VARIABLE": [var_name, var_id] }),
            ),
        );
        Ok(block_id)
    }

    fn emit_list_stmt(
        &mut self,
        blocks: &mut Blocks,
        opcode: &str,
        list_name: &str,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
        inputs: &[(&str, &Expr, ShadowKind)],
    ) -> Result<String, CodegenError> {
        let list_id = lookup_list_id(ctx.lists, list_name)?;
        let block_id = self.new_block_id();
        let mut inputs_json = Map::new();
        for (input_name, expr, kind) in inputs {
            let input = self.expr_input(blocks, expr, &block_id, ctx, *kind)?;
            inputs_json.insert((*input_name).to_string(), input);
        }
        blocks.insert(
            block_id.clone(),
            block_record(
                opcode,
                parent_id,
                Value::Object(inputs_json),
                json!({ "LIST": [list_name, list_id] }),
            ),
        );
        Ok(block_id)
    }

    fn emit_single_input_stmt(
        &mut self,
        blocks: &mut Blocks,
        opcode: &str,
        input_name: &str,
        value: &Expr,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
        kind: ShadowKind,
    ) -> Result<String, CodegenError> {
        let block_id = self.new_block_id();
        let input = self.expr_input(blocks, value, &block_id, ctx, kind)?;
        blocks.insert(
            block_id.clone(),
            block_record(opcode, parent_id, json!({ input_name: input }), json!({})),
        );
        Ok(block_id)
    }

    fn emit_no_input_stmt(&mut self, blocks: &mut Blocks, opcode: &str, parent_id: &str) -> String {
        let block_id = self.new_block_id();
        blocks.insert(
            block_id.clone(),
            block_record(opcode, parent_id, json!({}), json!({})),
        );
        block_id
    }

    fn emit_call_stmt(
        &mut self,
        blocks: &mut Blocks,
        name: &str,
        args: &[Expr],
        parent_id: &str,
        ctx: &EmitCtx<'_>,
    ) -> Result<String, CodegenError> {
        let Some(signature) = ctx.signatures.get(&name.to_lowercase()) else {
            return Err(CodegenError(format!(
                "Unknown procedure '{name}' during code generation."
            )));
        };
        let block_id = self.new_block_id();
        let mut inputs = Map::new();
        let mutation = json!({
            "tagName": "mutation",
            "children": [],
            "proccode": signature.proccode,
            "argumentids": encode_json_list(&signature.arg_ids),
            "warp": "false",
        });
        for (arg_id, arg_expr) in signature.arg_ids.iter().zip(args) {
            let input = self.expr_input(blocks, arg_expr, &block_id, ctx, ShadowKind::Text)?;
            inputs.insert(arg_id.clone(), input);
        }
        let mut block = block_record("procedures_call", parent_id, Value::Object(inputs), json!({}));
        block["mutation"] = mutation;
        blocks.insert(block_id.clone(), block);
        Ok(block_id)
    }

    // ── expression lowering ─────────────────────────────────────────────────

    /// Encode `expr` as an input slot: `[1, literal-shadow]` for literals,
    /// `[2, reporter-id]` for computed reporters.
    fn expr_input(
        &mut self,
        blocks: &mut Blocks,
        expr: &Expr,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
        default_kind: ShadowKind,
    ) -> Result<Value, CodegenError> {
        if let Some(literal) = literal_input(expr) {
            return Ok(json!([1, literal]));
        }
        match self.emit_expr_reporter(blocks, expr, parent_id, ctx)? {
            Some(reporter_id) => Ok(json!([2, reporter_id])),
            None => Ok(json!([1, default_shadow(default_kind)])),
        }
    }

    /// Emit a reporter block for a non-literal expression and return its ID.
    /// Literals return `None` (they are encoded inline by [`expr_input`]).
    fn emit_expr_reporter(
        &mut self,
        blocks: &mut Blocks,
        expr: &Expr,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
    ) -> Result<Option<String>, CodegenError> {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Str(_) => Ok(None),
            ExprKind::Builtin(builtin) => {
                let opcode = match builtin {
                    BuiltinReporter::Answer => "sensing_answer",
                    BuiltinReporter::MouseX => "sensing_mousex",
                    BuiltinReporter::MouseY => "sensing_mousey",
                    BuiltinReporter::Timer => "sensing_timer",
                };
                Ok(Some(self.emit_reporter_block(blocks, opcode, parent_id, json!({}), json!({}))))
            }
            ExprKind::Var(name) => {
                if ctx.params.contains(&name.to_lowercase()) {
                    return Ok(Some(self.emit_reporter_block(
                        blocks,
                        "argument_reporter_string_number",
                        parent_id,
                        json!({}),
                        json!({ "VALUE": [name, null] }),
                    )));
                }
                let var_id = lookup_var_id(ctx.variables, name)?;
                Ok(Some(self.emit_reporter_block(
                    blocks,
                    "data_variable",
                    parent_id,
                    json!({}),
                    json!({ "VARIABLE": [name, var_id] }),
                )))
            }
            ExprKind::PickRandom { from, to } => {
                let block_id = self.new_block_id();
                let from_input = self.expr_input(blocks, from, &block_id, ctx, ShadowKind::Number)?;
                let to_input = self.expr_input(blocks, to, &block_id, ctx, ShadowKind::Number)?;
                blocks.insert(
                    block_id.clone(),
                    block_record(
                        "operator_random",
                        parent_id,
                        json!({ "FROM": from_input, "TO": to_input }),
                        json!({}),
                    ),
                );
                Ok(Some(block_id))
            }
            ExprKind::ListItem { list, index } => {
                let list_id = lookup_list_id(ctx.lists, list)?;
                let block_id = self.new_block_id();
                let index_input = self.expr_input(blocks, index, &block_id, ctx, ShadowKind::Number)?;
                blocks.insert(
                    block_id.clone(),
                    block_record(
                        "data_itemoflist",
                        parent_id,
                        json!({ "INDEX": index_input }),
                        json!({ "LIST": [list, list_id] }),
                    ),
                );
                Ok(Some(block_id))
            }
            ExprKind::ListLength { list } => {
                let list_id = lookup_list_id(ctx.lists, list)?;
                Ok(Some(self.emit_reporter_block(
                    blocks,
                    "data_lengthoflist",
                    parent_id,
                    json!({}),
                    json!({ "LIST": [list, list_id] }),
                )))
            }
            ExprKind::ListContains { list, item } => {
                let list_id = lookup_list_id(ctx.lists, list)?;
                let block_id = self.new_block_id();
                let item_input = self.expr_input(blocks, item, &block_id, ctx, ShadowKind::Text)?;
                blocks.insert(
                    block_id.clone(),
                    block_record(
                        "data_listcontainsitem",
                        parent_id,
                        json!({ "ITEM": item_input }),
                        json!({ "LIST": [list, list_id] }),
                    ),
                );
                Ok(Some(block_id))
            }
            ExprKind::KeyPressed { key } => {
                let block_id = self.new_block_id();
                let menu_id = self.new_block_id();
                blocks.insert(
                    block_id.clone(),
                    block_record(
                        "sensing_keypressed",
                        parent_id,
                        json!({ "KEY_OPTION": [1, menu_id.clone()] }),
                        json!({}),
                    ),
                );
                // The key menu wants a literal; anything computed falls back
                // to "space".
                let key_value = match literal_input(key) {
                    Some(Value::Array(parts))
                        if parts.first() == Some(&json!(10)) =>
                    {
                        parts
                            .get(1)
                            .and_then(|v| v.as_str())
                            .unwrap_or("space")
                            .to_string()
                    }
                    _ => "space".to_string(),
                };
                blocks.insert(
                    menu_id.clone(),
                    json!({
                        "opcode": "sensing_keyoptions",
                        "next": null,
                        "parent": block_id.clone(),
                        "inputs": {},
                        "fields": { "KEY_OPTION": [key_value, null] },
                        "shadow": true,
                        "topLevel": false,
                    }),
                );
                Ok(Some(block_id))
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => {
                    let block_id = self.new_block_id();
                    let operand_input =
                        self.expr_input(blocks, operand, &block_id, ctx, ShadowKind::Number)?;
                    blocks.insert(
                        block_id.clone(),
                        block_record(
                            "operator_subtract",
                            parent_id,
                            json!({ "NUM1": [1, [4, "0"]], "NUM2": operand_input }),
                            json!({}),
                        ),
                    );
                    Ok(Some(block_id))
                }
                UnaryOp::Not => {
                    let block_id = self.new_block_id();
                    let operand_input =
                        self.expr_input(blocks, operand, &block_id, ctx, ShadowKind::Boolean)?;
                    blocks.insert(
                        block_id.clone(),
                        block_record(
                            "operator_not",
                            parent_id,
                            json!({ "OPERAND": operand_input }),
                            json!({}),
                        ),
                    );
                    Ok(Some(block_id))
                }
            },
            ExprKind::Binary { .. } => self.emit_binary_expr(blocks, expr, parent_id, ctx).map(Some),
        }
    }

    /// Binary operators, including the desugarings that must be preserved
    /// bit-for-bit: `a != b` → `not (a = b)`; `a <= b` → `(a < b) or
    /// (a = b)` and symmetrically for `>=`, built from synthetic nodes at
    /// the same source position.
    fn emit_binary_expr(
        &mut self,
        blocks: &mut Blocks,
        expr: &Expr,
        parent_id: &str,
        ctx: &EmitCtx<'_>,
    ) -> Result<String, CodegenError> {
        let ExprKind::Binary { op, left, right } = &expr.kind else {
            return Err(CodegenError("Internal error: expected a binary expression.".into()));
        };

        if matches!(op, BinaryOp::Le | BinaryOp::Ge) {
            let strict = if *op == BinaryOp::Le { BinaryOp::Lt } else { BinaryOp::Gt };
            let first = Expr::new(
                expr.pos,
                ExprKind::Binary {
                    op: strict,
                    left: left.clone(),
                    right: right.clone(),
                },
            );
            let second = Expr::new(
                expr.pos,
                ExprKind::Binary {
                    op: BinaryOp::Eq,
                    left: left.clone(),
                    right: right.clone(),
                },
            );
            let rewritten = Expr::new(
                expr.pos,
                ExprKind::Binary {
                    op: BinaryOp::Or,
                    left: Box::new(first),
                    right: Box::new(second),
                },
            );
            return self.emit_binary_expr(blocks, &rewritten, parent_id, ctx);
        }

        if *op == BinaryOp::Ne {
            let equals = Expr::new(
                expr.pos,
                ExprKind::Binary {
                    op: BinaryOp::Eq,
                    left: left.clone(),
                    right: right.clone(),
                },
            );
            let negated = Expr::new(
                expr.pos,
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(equals),
                },
            );
            return self
                .emit_expr_reporter(blocks, &negated, parent_id, ctx)?
                .ok_or_else(|| CodegenError("Failed to emit inequality expression.".into()));
        }

        let (opcode, left_key, right_key, kind) = match op {
            BinaryOp::Add => ("operator_add", "NUM1", "NUM2", ShadowKind::Number),
            BinaryOp::Sub => ("operator_subtract", "NUM1", "NUM2", ShadowKind::Number),
            BinaryOp::Mul => ("operator_multiply", "NUM1", "NUM2", ShadowKind::Number),
            BinaryOp::Div => ("operator_divide", "NUM1", "NUM2", ShadowKind::Number),
            BinaryOp::Mod => ("operator_mod", "NUM1", "NUM2", ShadowKind::Number),
            BinaryOp::Lt => ("operator_lt", "OPERAND1", "OPERAND2", ShadowKind::Number),
            BinaryOp::Gt => ("operator_gt", "OPERAND1", "OPERAND2", ShadowKind::Number),
            BinaryOp::Eq => ("operator_equals", "OPERAND1", "OPERAND2", ShadowKind::Text),
            BinaryOp::And => ("operator_and", "OPERAND1", "OPERAND2", ShadowKind::Boolean),
            BinaryOp::Or => ("operator_or", "OPERAND1", "OPERAND2", ShadowKind::Boolean),
            BinaryOp::Le | BinaryOp::Ge | BinaryOp::Ne => unreachable!("desugared above"),
        };

        let block_id = self.new_block_id();
        let left_input = self.expr_input(blocks, left, &block_id, ctx, kind)?;
        let right_input = self.expr_input(blocks, right, &block_id, ctx, kind)?;
        blocks.insert(
            block_id.clone(),
            block_record(
                opcode,
                parent_id,
                json!({ left_key: left_input, right_key: right_input }),
                json!({}),
            ),
        );
        Ok(block_id)
    }

    fn emit_reporter_block(
        &mut self,
        blocks: &mut Blocks,
        opcode: &str,
        parent_id: &str,
        inputs: Value,
        fields: Value,
    ) -> String {
        let block_id = self.new_block_id();
        blocks.insert(block_id.clone(), block_record(opcode, parent_id, inputs, fields));
        block_id
    }

    // ── broadcast interning ─────────────────────────────────────────────────

    /// Two-pass interning: gather every literal message from `when I
    /// receive` headers and `broadcast` statements (including nested
    /// bodies), then assign IDs in lexicographic message order.
    fn collect_broadcast_ids(&mut self) {
        let mut messages = BTreeSet::new();
        for target in &self.project.targets {
            for script in &target.scripts {
                if let EventKind::Receive(message) = &script.kind {
                    if !message.is_empty() {
                        messages.insert(message.clone());
                    }
                }
                collect_messages_from_statements(&script.body, &mut messages);
            }
            for procedure in &target.procedures {
                collect_messages_from_statements(&procedure.body, &mut messages);
            }
        }
        for message in messages {
            let id = self.new_id("broadcast");
            self.broadcast_ids.insert(message, id);
        }
    }

    fn broadcast_id(&mut self, message: &str) -> String {
        if let Some(id) = self.broadcast_ids.get(message) {
            return id.clone();
        }
        let id = self.new_id("broadcast");
        self.broadcast_ids.insert(message.to_string(), id.clone());
        id
    }

    // ── ID minting ──────────────────────────────────────────────────────────

    fn new_id(&mut self, prefix: &str) -> String {
        self.id_counter += 1;
        format!("{prefix}_{}", self.id_counter)
    }

    fn new_block_id(&mut self) -> String {
        self.new_id("block")
    }
}

// ── Block record shapes ───────────────────────────────────────────────────────

/// The common non-top-level block record.  Stack blocks and reporters share
/// this shape; only hats, definitions, and shadows deviate.
fn block_record(opcode: &str, parent_id: &str, inputs: Value, fields: Value) -> Value {
    json!({
        "opcode": opcode,
        "next": null,
        "parent": parent_id,
        "inputs": inputs,
        "fields": fields,
        "shadow": false,
        "topLevel": false,
    })
}

/// JSON-encode a list for a procedure mutation (`argumentids` and friends
/// are JSON strings inside the JSON document).
fn encode_json_list<T: serde::Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).expect("string lists serialize infallibly")
}

fn set_block_field(blocks: &mut Blocks, block_id: &str, field: &str, value: Value) {
    let block = blocks
        .get_mut(block_id)
        .expect("field updates target a block that was just inserted");
    block[field] = value;
}

fn set_block_input(blocks: &mut Blocks, block_id: &str, input: &str, value: Value) {
    let block = blocks
        .get_mut(block_id)
        .expect("input updates target a block that was just inserted");
    block["inputs"][input] = value;
}

// ── Literals / shadows ────────────────────────────────────────────────────────

/// The inline shadow for a literal expression: `[4, "<num>"]` for numbers,
/// `[10, "<text>"]` for strings, `None` for anything computed.
fn literal_input(expr: &Expr) -> Option<Value> {
    match &expr.kind {
        ExprKind::Number(value) => Some(json!([4, fmt_number(*value)])),
        ExprKind::Str(text) => Some(json!([10, text])),
        _ => None,
    }
}

fn default_shadow(kind: ShadowKind) -> Value {
    match kind {
        ShadowKind::Number => json!([4, "0"]),
        ShadowKind::Text | ShadowKind::Boolean => json!([10, ""]),
    }
}

/// Integer-valued numbers print without a decimal point: `[4, "3"]`, never
/// `[4, "3.0"]`.
fn fmt_number(value: f64) -> String {
    if value == value.trunc() && value.is_finite() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn lookup_var_id(variables: &HashMap<String, String>, name: &str) -> Result<String, CodegenError> {
    variables
        .get(&name.to_lowercase())
        .cloned()
        .ok_or_else(|| CodegenError(format!("Variable '{name}' is not declared.")))
}

fn lookup_list_id(lists: &HashMap<String, String>, name: &str) -> Result<String, CodegenError> {
    lists
        .get(&name.to_lowercase())
        .cloned()
        .ok_or_else(|| CodegenError(format!("List '{name}' is not declared.")))
}

fn collect_messages_from_statements(statements: &[Stmt], messages: &mut BTreeSet<String>) {
    for stmt in statements {
        match &stmt.kind {
            StmtKind::Broadcast { message } => {
                messages.insert(message.clone());
            }
            StmtKind::Repeat { body, .. } | StmtKind::Forever { body } => {
                collect_messages_from_statements(body, messages);
            }
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_messages_from_statements(then_body, messages);
                collect_messages_from_statements(else_body, messages);
            }
            _ => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
