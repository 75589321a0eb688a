use anyhow::Context;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::schema::SchemaColumn;

pub const DB_FILE: &str = "school.sqlite3";

/// Opens the school database inside a workspace directory.
///
/// No schema is created here: the engine works against whatever tables the
/// application has deployed, and an empty database is a valid (all-defaults) state.
pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    Ok(conn)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// User tables in name order. Internal `sqlite_*` tables are never listed.
pub fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Tables and views both count: a settings source may be a view.
pub fn relation_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ? COLLATE NOCASE",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Column metadata for `table`, or `None` when no such table or view exists.
pub fn describe_table(
    conn: &Connection,
    table: &str,
) -> rusqlite::Result<Option<Vec<SchemaColumn>>> {
    if !relation_exists(conn, table)? {
        return Ok(None);
    }
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let declared_type: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
        out.push(SchemaColumn {
            table: table.to_string(),
            name,
            declared_type,
        });
    }
    Ok(Some(out))
}

/// Renders a stored cell as settings text. NULL and blobs that are not UTF-8 have no
/// textual value.
pub fn value_as_text(v: ValueRef<'_>) -> Option<String> {
    match v {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(n.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => std::str::from_utf8(t).ok().map(str::to_string),
    }
}
