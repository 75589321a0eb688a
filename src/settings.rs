use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::db;

/// A setting the public branding payload exposes, with its hard-coded default.
#[derive(Debug, Clone, Copy)]
pub struct KeyDef {
    pub key: &'static str,
    pub default: Option<&'static str>,
}

pub const REGISTERED_KEYS: &[KeyDef] = &[
    KeyDef {
        key: "school_name",
        default: Some("School Management System"),
    },
    KeyDef {
        key: "school_short_name",
        default: Some(""),
    },
    KeyDef {
        key: "school_logo",
        default: None,
    },
    KeyDef {
        key: "school_tagline",
        default: Some("Excellence in Education"),
    },
    KeyDef {
        key: "school_address",
        default: Some(""),
    },
    KeyDef {
        key: "school_phone",
        default: Some(""),
    },
    KeyDef {
        key: "school_email",
        default: Some(""),
    },
    KeyDef {
        key: "primary_color",
        default: Some("#1e40af"),
    },
    KeyDef {
        key: "secondary_color",
        default: Some("#f59e0b"),
    },
    KeyDef {
        key: "currency_symbol",
        default: Some("$"),
    },
    KeyDef {
        key: "academic_year",
        default: Some(""),
    },
];

pub fn key_def(key: &str) -> Option<&'static KeyDef> {
    REGISTERED_KEYS.iter().find(|d| d.key == key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLayout {
    /// One row of a structured config table; column names are keys.
    #[serde(rename_all = "camelCase")]
    Row {
        #[serde(default = "default_id_column")]
        id_column: String,
        #[serde(default = "default_row_id")]
        id: i64,
    },
    /// A generic `(key, value)` table; every row is one setting.
    #[serde(rename_all = "camelCase")]
    KeyValue {
        key_column: String,
        value_column: String,
    },
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_row_id() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    pub name: String,
    pub table: String,
    pub layout: SourceLayout,
    /// Backend-specific spelling -> canonical key.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// May overwrite a value that still equals the hard-coded default.
    #[serde(default)]
    pub replaces_defaults: bool,
}

impl ConfigSource {
    fn canonical_key(&self, raw: &str) -> Option<&'static str> {
        let name = self.aliases.get(raw).map(String::as_str).unwrap_or(raw);
        key_def(name).map(|d| d.key)
    }
}

fn aliases(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

/// The deployed storage locations, highest priority first.
pub fn default_sources() -> Vec<ConfigSource> {
    vec![
        ConfigSource {
            name: "school_settings".into(),
            table: "school_settings".into(),
            layout: SourceLayout::Row {
                id_column: default_id_column(),
                id: default_row_id(),
            },
            aliases: aliases(&[
                ("school_motto", "school_tagline"),
                ("logo", "school_logo"),
                ("logo_url", "school_logo"),
            ]),
            replaces_defaults: false,
        },
        ConfigSource {
            name: "system_settings".into(),
            table: "system_settings".into(),
            layout: SourceLayout::KeyValue {
                key_column: "setting_key".into(),
                value_column: "setting_value".into(),
            },
            aliases: aliases(&[
                ("school_motto", "school_tagline"),
                ("motto", "school_tagline"),
                ("logo", "school_logo"),
                ("logo_url", "school_logo"),
            ]),
            replaces_defaults: true,
        },
        ConfigSource {
            name: "settings".into(),
            table: "settings".into(),
            layout: SourceLayout::KeyValue {
                key_column: "key".into(),
                value_column: "value".into(),
            },
            aliases: BTreeMap::new(),
            replaces_defaults: true,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Loaded { keys: usize },
    Missing,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub name: String,
    pub table: String,
    #[serde(flatten)]
    pub status: SourceStatus,
}

/// Merged settings for one request. Serializes as the flat key -> value object.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    #[serde(flatten)]
    values: BTreeMap<String, Option<String>>,
    #[serde(skip)]
    provenance: BTreeMap<String, String>,
    #[serde(skip)]
    sources: Vec<SourceOutcome>,
}

impl ResolvedConfig {
    fn defaults() -> Self {
        let values = REGISTERED_KEYS
            .iter()
            .map(|d| (d.key.to_string(), d.default.map(str::to_string)))
            .collect();
        Self {
            values,
            provenance: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_deref())
    }

    pub fn values(&self) -> &BTreeMap<String, Option<String>> {
        &self.values
    }

    /// Name of the source that supplied `key`, or `"default"`.
    pub fn provenance(&self, key: &str) -> &str {
        self.provenance
            .get(key)
            .map(String::as_str)
            .unwrap_or("default")
    }

    pub fn sources(&self) -> &[SourceOutcome] {
        &self.sources
    }

    pub fn provenance_map(&self) -> BTreeMap<&str, &str> {
        self.values
            .keys()
            .map(|k| (k.as_str(), self.provenance(k)))
            .collect()
    }

    fn offer(&mut self, key: &'static str, raw: Option<String>, source: &ConfigSource) -> bool {
        let Some(value) = raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
            return false;
        };
        let Some(def) = key_def(key) else {
            return false;
        };
        let writable = match self.provenance.get(key) {
            None => true,
            Some(_) => {
                source.replaces_defaults && self.values.get(key).and_then(|v| v.as_deref()) == def.default
            }
        };
        if !writable {
            return false;
        }
        self.values.insert(key.to_string(), Some(value));
        self.provenance.insert(key.to_string(), source.name.clone());
        true
    }
}

type SourceRows = Vec<(&'static str, Option<String>)>;

fn read_row_source(
    conn: &Connection,
    source: &ConfigSource,
    id_column: &str,
    id: i64,
) -> rusqlite::Result<Option<SourceRows>> {
    let Some(columns) = db::describe_table(conn, &source.table)? else {
        return Ok(None);
    };
    if !columns.iter().any(|c| c.name == id_column) {
        debug!(table = %source.table, id_column, "row source has no id column");
        return Ok(Some(Vec::new()));
    }
    let wanted: Vec<(&str, &'static str)> = columns
        .iter()
        .filter_map(|c| source.canonical_key(&c.name).map(|k| (c.name.as_str(), k)))
        .collect();
    if wanted.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let select_list = wanted
        .iter()
        .map(|(col, _)| db::quote_ident(col))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ? LIMIT 1",
        select_list,
        db::quote_ident(&source.table),
        db::quote_ident(id_column)
    );
    let row = conn
        .query_row(&sql, [id], |r| {
            let mut out = Vec::with_capacity(wanted.len());
            for (i, (_, key)) in wanted.iter().enumerate() {
                out.push((*key, db::value_as_text(r.get_ref(i)?)));
            }
            Ok(out)
        })
        .optional()?;
    Ok(Some(row.unwrap_or_default()))
}

fn read_key_value_source(
    conn: &Connection,
    source: &ConfigSource,
    key_column: &str,
    value_column: &str,
) -> rusqlite::Result<Option<SourceRows>> {
    let Some(columns) = db::describe_table(conn, &source.table)? else {
        return Ok(None);
    };
    let has = |name: &str| columns.iter().any(|c| c.name == name);
    if !has(key_column) || !has(value_column) {
        debug!(table = %source.table, "key-value source lacks key/value columns");
        return Ok(Some(Vec::new()));
    }

    let sql = format!(
        "SELECT {}, {} FROM {}",
        db::quote_ident(key_column),
        db::quote_ident(value_column),
        db::quote_ident(&source.table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let Some(raw_key) = db::value_as_text(row.get_ref(0)?) else {
            continue;
        };
        if let Some(key) = source.canonical_key(raw_key.trim()) {
            out.push((key, db::value_as_text(row.get_ref(1)?)));
        }
    }
    Ok(Some(out))
}

fn read_source(conn: &Connection, source: &ConfigSource) -> rusqlite::Result<Option<SourceRows>> {
    match &source.layout {
        SourceLayout::Row { id_column, id } => read_row_source(conn, source, id_column, *id),
        SourceLayout::KeyValue {
            key_column,
            value_column,
        } => read_key_value_source(conn, source, key_column, value_column),
    }
}

/// Builds the public branding configuration from whichever sources exist.
#[derive(Debug, Clone)]
pub struct SettingsResolver {
    sources: Vec<ConfigSource>,
}

impl Default for SettingsResolver {
    fn default() -> Self {
        Self::new(default_sources())
    }
}

impl SettingsResolver {
    pub fn new(sources: Vec<ConfigSource>) -> Self {
        Self { sources }
    }

    /// Never fails: a missing or unreadable source contributes nothing.
    #[instrument(skip_all, fields(sources = self.sources.len()))]
    pub fn resolve(&self, conn: &Connection) -> ResolvedConfig {
        let mut resolved = ResolvedConfig::defaults();
        for source in &self.sources {
            let status = match read_source(conn, source) {
                Ok(None) => SourceStatus::Missing,
                Ok(Some(rows)) => {
                    let mut keys = 0;
                    for (key, value) in rows {
                        if resolved.offer(key, value, source) {
                            keys += 1;
                        }
                    }
                    SourceStatus::Loaded { keys }
                }
                Err(e) => {
                    warn!(source = %source.name, table = %source.table, error = %e, "settings source unreadable; skipping");
                    SourceStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
            debug!(source = %source.name, ?status, "settings source read");
            resolved.sources.push(SourceOutcome {
                name: source.name.clone(),
                table: source.table.clone(),
                status,
            });
        }
        resolved
    }
}
