use serde::Serialize;

/// One column discovered by introspection. Rebuilt on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaColumn {
    #[serde(skip)]
    pub table: String,
    pub name: String,
    pub declared_type: String,
}

impl SchemaColumn {
    pub fn is_text_like(&self) -> bool {
        is_text_like(&self.declared_type)
    }
}

/// Whether a declared SQL type can hold text worth scanning.
///
/// Deliberately permissive: any type name containing `char`, `text` or `blob`
/// (case-insensitive) qualifies, so `VARCHAR(255)`, `NATIONAL CHARACTER`, `MEDIUMTEXT`
/// and `LONGBLOB` are all included.
pub fn is_text_like(declared_type: &str) -> bool {
    let t = declared_type.to_ascii_lowercase();
    t.contains("char") || t.contains("text") || t.contains("blob")
}

#[derive(Debug, Clone, Serialize)]
pub struct TableColumns {
    pub table: String,
    pub columns: Vec<SchemaColumn>,
}
