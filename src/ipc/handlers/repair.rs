use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::repair::{RepairError, RepairReport, ReplacementRule, SchemaRepairScanner};
use rusqlite::Connection;
use serde_json::json;

fn tables_param(params: &serde_json::Value) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get("tables") {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| HandlerErr::bad_params(format!("tables must be an array of strings: {e}"))),
        _ => Ok(None),
    }
}

/// Rules and allow-list from params, falling back to the workspace config.
fn scanner_from_params(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<SchemaRepairScanner, HandlerErr> {
    let rules: Vec<ReplacementRule> = match params.get("rules") {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("rules must be [{{from, to}}]: {e}")))?,
        _ => state.config.repair.rules.clone(),
    };
    let tables = tables_param(params)?.or_else(|| state.config.repair.tables.clone());
    Ok(SchemaRepairScanner::new(rules)?.with_tables(tables))
}

type RunFn = fn(&SchemaRepairScanner, &Connection) -> Result<RepairReport, RepairError>;

fn run_repair(state: &AppState, req: &Request, run: RunFn) -> Result<serde_json::Value, HandlerErr> {
    let scanner = scanner_from_params(state, &req.params)?;
    let conn = state.db.as_ref().ok_or_else(HandlerErr::no_workspace)?;
    let report = run(&scanner, conn)?;
    let mut out = serde_json::to_value(&report)?;
    out["clean"] = json!(report.is_clean());
    Ok(out)
}

fn schema_columns(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(HandlerErr::no_workspace)?;
    let listing = SchemaRepairScanner::default()
        .with_tables(tables_param(&req.params)?)
        .text_columns(conn)?;
    Ok(serde_json::to_value(&listing)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schema.columns" => schema_columns(state, req),
        "repair.preview" => run_repair(state, req, SchemaRepairScanner::scan),
        "repair.apply" => run_repair(state, req, SchemaRepairScanner::apply),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
