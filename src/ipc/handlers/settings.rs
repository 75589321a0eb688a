use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::manifest;
use crate::settings::{ResolvedConfig, SettingsResolver};
use serde_json::json;

/// Every settings read resolves afresh; nothing is cached between requests.
fn resolve(state: &AppState) -> Result<ResolvedConfig, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(HandlerErr::no_workspace)?;
    Ok(SettingsResolver::new(state.config.settings.sources.clone()).resolve(conn))
}

fn settings_public(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let resolved = resolve(state)?;
    Ok(serde_json::to_value(&resolved)?)
}

fn settings_sources(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let resolved = resolve(state)?;
    Ok(json!({
        "values": resolved.values(),
        "provenance": resolved.provenance_map(),
        "sources": resolved.sources(),
    }))
}

fn manifest_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let resolved = resolve(state)?;
    Ok(manifest::web_manifest(&resolved, &state.config.manifest))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "settings.public" => settings_public(state),
        "settings.sources" => settings_sources(state),
        "manifest.get" => manifest_get(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
