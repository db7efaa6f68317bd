//! Semantic validation of a merged [`Project`].
//!
//! The validator only reads the AST and produces errors; it never builds a
//! new tree.  Scoping rules:
//!
//! - Variable reads resolve first against the current procedure's parameter
//!   set, then against the enclosing target's variables.  All lookups are
//!   case-insensitive.
//! - Variable *fields* (the left side of `set`/`change`) must name a
//!   declared variable — parameters are read-only and naming one there is a
//!   dedicated error.
//! - Procedure calls must target a procedure of the same target, defined at
//!   a source line ≤ the call line, with exactly matching arity.
//!
//! Nested bodies (`repeat`, `forever`, `if`) inherit the enclosing scope
//! unchanged.

use crate::ast::{Expr, ExprKind, Pos, Procedure, Project, Stmt, StmtKind, Target};
use crate::error::SemanticError;
use std::collections::{HashMap, HashSet};

// ── Public entry point ────────────────────────────────────────────────────────

pub fn analyze(project: &Project) -> Result<(), SemanticError> {
    if project.targets.is_empty() {
        return Err(SemanticError(
            "Project must define at least one target.".into(),
        ));
    }
    let stage_count = project.targets.iter().filter(|t| t.is_stage).count();
    if stage_count > 1 {
        return Err(SemanticError("Project can only define one stage.".into()));
    }
    let mut names = HashSet::new();
    for target in &project.targets {
        if !names.insert(target.name.to_lowercase()) {
            return Err(SemanticError(format!(
                "Duplicate target name '{}' at line {}.",
                target.name, target.pos.line
            )));
        }
        analyze_target(target)?;
    }
    Ok(())
}

// ── Per-target analysis ───────────────────────────────────────────────────────

struct ProcedureInfo<'a> {
    name: &'a str,
    line: u32,
    param_count: usize,
}

struct TargetScope<'a> {
    target: &'a Target,
    /// Lowercased variable name → declaration line.
    variables: HashMap<String, u32>,
    /// Lowercased list name → declaration line.
    lists: HashMap<String, u32>,
    procedures: HashMap<String, ProcedureInfo<'a>>,
}

fn analyze_target(target: &Target) -> Result<(), SemanticError> {
    let mut variables = HashMap::new();
    for decl in &target.variables {
        if variables
            .insert(decl.name.to_lowercase(), decl.pos.line)
            .is_some()
        {
            return Err(SemanticError(format!(
                "Duplicate variable '{}' in target '{}' at line {}, column {}.",
                decl.name, target.name, decl.pos.line, decl.pos.column
            )));
        }
    }

    let mut lists = HashMap::new();
    for decl in &target.lists {
        if lists
            .insert(decl.name.to_lowercase(), decl.pos.line)
            .is_some()
        {
            return Err(SemanticError(format!(
                "Duplicate list '{}' in target '{}' at line {}, column {}.",
                decl.name, target.name, decl.pos.line, decl.pos.column
            )));
        }
    }

    let mut procedures: HashMap<String, ProcedureInfo<'_>> = HashMap::new();
    for procedure in &target.procedures {
        let lowered = procedure.name.to_lowercase();
        if let Some(prev) = procedures.get(&lowered) {
            return Err(SemanticError(format!(
                "Procedure '{}' is already defined at line {} in target '{}'.",
                procedure.name, prev.line, target.name
            )));
        }
        let distinct: HashSet<String> = procedure
            .params
            .iter()
            .map(|p| p.to_lowercase())
            .collect();
        if distinct.len() != procedure.params.len() {
            return Err(SemanticError(format!(
                "Procedure '{}' has duplicate parameter names at line {}, column {}.",
                procedure.name, procedure.pos.line, procedure.pos.column
            )));
        }
        procedures.insert(
            lowered,
            ProcedureInfo {
                name: &procedure.name,
                line: procedure.pos.line,
                param_count: procedure.params.len(),
            },
        );
    }

    let scope = TargetScope {
        target,
        variables,
        lists,
        procedures,
    };

    for procedure in &target.procedures {
        let params: HashSet<String> = procedure.params.iter().map(|p| p.to_lowercase()).collect();
        analyze_statements(&scope, &procedure.body, &params, &scope_label(procedure))?;
    }

    let empty = HashSet::new();
    for script in &target.scripts {
        analyze_statements(&scope, &script.body, &empty, "event script")?;
    }
    Ok(())
}

fn scope_label(procedure: &Procedure) -> String {
    format!("procedure '{}'", procedure.name)
}

// ── Statement walking ─────────────────────────────────────────────────────────

fn analyze_statements(
    scope: &TargetScope<'_>,
    statements: &[Stmt],
    params: &HashSet<String>,
    scope_name: &str,
) -> Result<(), SemanticError> {
    for stmt in statements {
        analyze_statement(scope, stmt, params, scope_name)?;
    }
    Ok(())
}

fn analyze_statement(
    scope: &TargetScope<'_>,
    stmt: &Stmt,
    params: &HashSet<String>,
    scope_name: &str,
) -> Result<(), SemanticError> {
    match &stmt.kind {
        StmtKind::Broadcast { message } => {
            // The parser already rejects empty messages; re-checked because
            // resolved projects may merge ASTs from several files.
            if message.is_empty() {
                return Err(SemanticError(format!(
                    "Broadcast message cannot be empty at line {}, column {} in target '{}'.",
                    stmt.pos.line, stmt.pos.column, scope.target.name
                )));
            }
        }
        StmtKind::SetVar { name, value } => {
            ensure_variable_field(scope, name, params, stmt.pos)?;
            analyze_expr(scope, value, params)?;
        }
        StmtKind::ChangeVar { name, delta } => {
            ensure_variable_field(scope, name, params, stmt.pos)?;
            analyze_expr(scope, delta, params)?;
        }
        StmtKind::Move { steps } => analyze_expr(scope, steps, params)?,
        StmtKind::TurnRight { degrees } | StmtKind::TurnLeft { degrees } => {
            analyze_expr(scope, degrees, params)?
        }
        StmtKind::GoToXy { x, y } => {
            analyze_expr(scope, x, params)?;
            analyze_expr(scope, y, params)?;
        }
        StmtKind::ChangeX { value }
        | StmtKind::SetX { value }
        | StmtKind::ChangeY { value }
        | StmtKind::SetY { value }
        | StmtKind::ChangeSize { value }
        | StmtKind::SetSize { value } => analyze_expr(scope, value, params)?,
        StmtKind::PointInDirection { direction } => analyze_expr(scope, direction, params)?,
        StmtKind::IfOnEdgeBounce
        | StmtKind::Show
        | StmtKind::Hide
        | StmtKind::NextCostume
        | StmtKind::NextBackdrop
        | StmtKind::ResetTimer
        | StmtKind::Stop { .. } => {}
        StmtKind::Say { message } | StmtKind::Think { message } => {
            analyze_expr(scope, message, params)?
        }
        StmtKind::Wait { duration } => analyze_expr(scope, duration, params)?,
        StmtKind::Ask { question } => analyze_expr(scope, question, params)?,
        StmtKind::Repeat { times, body } => {
            analyze_expr(scope, times, params)?;
            analyze_statements(scope, body, params, scope_name)?;
        }
        StmtKind::Forever { body } => analyze_statements(scope, body, params, scope_name)?,
        StmtKind::If {
            condition,
            then_body,
            else_body,
        } => {
            analyze_expr(scope, condition, params)?;
            analyze_statements(scope, then_body, params, scope_name)?;
            analyze_statements(scope, else_body, params, scope_name)?;
        }
        StmtKind::AddToList { list, item } => {
            ensure_list_exists(scope, list, stmt.pos)?;
            analyze_expr(scope, item, params)?;
        }
        StmtKind::DeleteOfList { list, index } => {
            ensure_list_exists(scope, list, stmt.pos)?;
            analyze_expr(scope, index, params)?;
        }
        StmtKind::DeleteAllOfList { list } => ensure_list_exists(scope, list, stmt.pos)?,
        StmtKind::InsertAtList { list, item, index } => {
            ensure_list_exists(scope, list, stmt.pos)?;
            analyze_expr(scope, item, params)?;
            analyze_expr(scope, index, params)?;
        }
        StmtKind::ReplaceItemOfList { list, index, item } => {
            ensure_list_exists(scope, list, stmt.pos)?;
            analyze_expr(scope, index, params)?;
            analyze_expr(scope, item, params)?;
        }
        StmtKind::Call { name, args } => {
            let Some(proc) = scope.procedures.get(&name.to_lowercase()) else {
                return Err(SemanticError(format!(
                    "Unknown procedure '{}' at line {}, column {} in target '{}'.",
                    name, stmt.pos.line, stmt.pos.column, scope.target.name
                )));
            };
            if stmt.pos.line < proc.line {
                return Err(SemanticError(format!(
                    "Procedure '{}' is used before it is defined (call line {}, definition line {}) in target '{}'.",
                    name, stmt.pos.line, proc.line, scope.target.name
                )));
            }
            if args.len() != proc.param_count {
                return Err(SemanticError(format!(
                    "Procedure '{}' expects {} argument(s), got {} at line {}, column {} in {}.",
                    proc.name,
                    proc.param_count,
                    args.len(),
                    stmt.pos.line,
                    stmt.pos.column,
                    scope_name
                )));
            }
            for arg in args {
                analyze_expr(scope, arg, params)?;
            }
        }
    }
    Ok(())
}

// ── Expression walking ────────────────────────────────────────────────────────

fn analyze_expr(
    scope: &TargetScope<'_>,
    expr: &Expr,
    params: &HashSet<String>,
) -> Result<(), SemanticError> {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Builtin(_) => Ok(()),
        ExprKind::Var(name) => {
            let lowered = name.to_lowercase();
            if params.contains(&lowered) || scope.variables.contains_key(&lowered) {
                Ok(())
            } else {
                Err(SemanticError(format!(
                    "Unknown variable '{}' at line {}, column {} in target '{}'.",
                    name, expr.pos.line, expr.pos.column, scope.target.name
                )))
            }
        }
        ExprKind::Unary { operand, .. } => analyze_expr(scope, operand, params),
        ExprKind::Binary { left, right, .. } => {
            analyze_expr(scope, left, params)?;
            analyze_expr(scope, right, params)
        }
        ExprKind::PickRandom { from, to } => {
            analyze_expr(scope, from, params)?;
            analyze_expr(scope, to, params)
        }
        ExprKind::ListItem { list, index } => {
            ensure_list_exists(scope, list, expr.pos)?;
            analyze_expr(scope, index, params)
        }
        ExprKind::ListLength { list } => ensure_list_exists(scope, list, expr.pos),
        ExprKind::ListContains { list, item } => {
            ensure_list_exists(scope, list, expr.pos)?;
            analyze_expr(scope, item, params)
        }
        ExprKind::KeyPressed { key } => analyze_expr(scope, key, params),
    }
}

// ── Name resolution helpers ───────────────────────────────────────────────────

fn ensure_variable_field(
    scope: &TargetScope<'_>,
    name: &str,
    params: &HashSet<String>,
    pos: Pos,
) -> Result<(), SemanticError> {
    let lowered = name.to_lowercase();
    if params.contains(&lowered) {
        return Err(SemanticError(format!(
            "Variable field '{}' refers to a procedure parameter at line {}, column {}; \
             variable blocks must target declared variables.",
            name, pos.line, pos.column
        )));
    }
    if !scope.variables.contains_key(&lowered) {
        return Err(SemanticError(format!(
            "Unknown variable '{}' at line {}, column {} in target '{}'.",
            name, pos.line, pos.column, scope.target.name
        )));
    }
    Ok(())
}

fn ensure_list_exists(scope: &TargetScope<'_>, name: &str, pos: Pos) -> Result<(), SemanticError> {
    if !scope.lists.contains_key(&name.to_lowercase()) {
        return Err(SemanticError(format!(
            "Unknown list '{}' at line {}, column {} in target '{}'.",
            name, pos.line, pos.column, scope.target.name
        )));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
