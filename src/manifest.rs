use serde_json::{json, Value};

use crate::config::ManifestConfig;
use crate::settings::ResolvedConfig;

const ICON_SIZES: [&str; 2] = ["192x192", "512x512"];

fn icon_mime(src: &str) -> &'static str {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let ext = path
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

/// Web app manifest for the school's installable front end.
pub fn web_manifest(resolved: &ResolvedConfig, cfg: &ManifestConfig) -> Value {
    let name = resolved.get("school_name").unwrap_or_default();
    let short_name = resolved
        .get("school_short_name")
        .filter(|s| !s.is_empty())
        .unwrap_or(name);

    let icons: Vec<Value> = match resolved.get("school_logo") {
        Some(logo) => ICON_SIZES
            .iter()
            .map(|size| {
                json!({
                    "src": logo,
                    "sizes": size,
                    "type": icon_mime(logo),
                    "purpose": "any",
                })
            })
            .collect(),
        None => Vec::new(),
    };

    json!({
        "name": name,
        "short_name": short_name,
        "description": resolved.get("school_tagline").unwrap_or_default(),
        "start_url": cfg.start_url,
        "scope": cfg.scope,
        "display": cfg.display,
        "background_color": cfg.background_color,
        "theme_color": resolved.get("primary_color").unwrap_or_default(),
        "icons": icons,
    })
}
