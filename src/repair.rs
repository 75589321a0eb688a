use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db;
use crate::schema::{SchemaColumn, TableColumns};

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("failed to enumerate tables: {0}")]
    Discovery(#[source] rusqlite::Error),

    #[error("invalid replacement rule #{index}: {reason}")]
    InvalidRule { index: usize, reason: String },
}

/// Literal substring replacement. No wildcard or regex semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub from: String,
    pub to: String,
}

impl ReplacementRule {
    #[cfg(test)]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairMode {
    Preview,
    Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPhase {
    Idle,
    DiscoveringTables,
    DiscoveringColumns,
    ScanningPreImage,
    Applying,
    ScanningPostImage,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitCounts {
    pub rows_found: u64,
    pub rows_changed: u64,
}

/// What the scanner needs from a database handle.
pub trait RepairTarget {
    fn table_names(&self) -> rusqlite::Result<Vec<String>>;

    /// `None` when the table vanished since enumeration.
    fn describe_table(&self, table: &str) -> rusqlite::Result<Option<Vec<SchemaColumn>>>;

    /// Rows of `column` containing `pattern`.
    fn count_matches(&self, column: &SchemaColumn, pattern: &str) -> rusqlite::Result<u64>;

    /// Count and replace as one transaction. Counts are taken against the current
    /// (possibly already rewritten) values.
    fn apply_rule(
        &self,
        column: &SchemaColumn,
        rule: &ReplacementRule,
    ) -> rusqlite::Result<UnitCounts>;
}

impl RepairTarget for Connection {
    fn table_names(&self) -> rusqlite::Result<Vec<String>> {
        db::list_tables(self)
    }

    fn describe_table(&self, table: &str) -> rusqlite::Result<Option<Vec<SchemaColumn>>> {
        db::describe_table(self, table)
    }

    fn count_matches(&self, column: &SchemaColumn, pattern: &str) -> rusqlite::Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE instr({}, ?1) > 0",
            db::quote_ident(&column.table),
            db::quote_ident(&column.name)
        );
        let n: i64 = self.query_row(&sql, [pattern], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn apply_rule(
        &self,
        column: &SchemaColumn,
        rule: &ReplacementRule,
    ) -> rusqlite::Result<UnitCounts> {
        let tx = self.unchecked_transaction()?;
        let rows_found = tx.count_matches(column, &rule.from)?;
        if rows_found == 0 {
            return Ok(UnitCounts::default());
        }
        let table = db::quote_ident(&column.table);
        let col = db::quote_ident(&column.name);
        let sql = format!(
            "UPDATE {table} SET {col} = replace({col}, ?1, ?2)
             WHERE instr({col}, ?1) > 0 AND replace({col}, ?1, ?2) IS NOT {col}"
        );
        let rows_changed = tx.execute(&sql, (&rule.from, &rule.to))? as u64;
        tx.commit()?;
        Ok(UnitCounts {
            rows_found,
            rows_changed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchEntry {
    pub table: String,
    pub column: String,
    pub rule: String,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedEntry {
    pub table: String,
    pub column: String,
    pub rule: String,
    pub rows_found: u64,
    pub rows_changed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub table: String,
    pub column: Option<String>,
    pub phase: RepairPhase,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub run_id: String,
    pub mode: RepairMode,
    pub started_at: String,
    pub finished_at: String,
    pub phases: Vec<RepairPhase>,
    pub tables_scanned: usize,
    pub columns_scanned: usize,
    pub found: Vec<MatchEntry>,
    pub applied: Vec<AppliedEntry>,
    pub remaining: Vec<MatchEntry>,
    pub skipped: Vec<SkippedEntry>,
}

impl RepairReport {
    fn start(mode: RepairMode) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            mode,
            started_at: now_rfc3339(),
            finished_at: String::new(),
            phases: vec![RepairPhase::Idle],
            tables_scanned: 0,
            columns_scanned: 0,
            found: Vec::new(),
            applied: Vec::new(),
            remaining: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn advance(&mut self, phase: RepairPhase) {
        debug!(run_id = %self.run_id, ?phase, "repair phase");
        self.phases.push(phase);
    }

    fn skip(&mut self, column: &SchemaColumn, phase: RepairPhase, e: &rusqlite::Error) {
        warn!(table = %column.table, column = %column.name, ?phase, error = %e, "skipping column");
        self.skipped.push(SkippedEntry {
            table: column.table.clone(),
            column: Some(column.name.clone()),
            phase,
            message: e.to_string(),
        });
    }

    /// Rows rewritten across all units. Units without an entry changed nothing.
    pub fn rows_changed(&self) -> u64 {
        self.applied.iter().map(|a| a.rows_changed).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct Discovery {
    tables_scanned: usize,
    columns: Vec<SchemaColumn>,
}

/// Text-like columns per table, plus the tables that could not be described.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnListing {
    pub tables: Vec<TableColumns>,
    pub skipped: Vec<SkippedEntry>,
}

/// Finds and rewrites obsolete literals in every text-like column of every table.
#[derive(Debug, Clone, Default)]
pub struct SchemaRepairScanner {
    rules: Vec<ReplacementRule>,
    tables: Option<Vec<String>>,
}

impl SchemaRepairScanner {
    /// Validates `rules` and orders them most-specific first (longest pattern first,
    /// declared order among equal lengths).
    pub fn new(rules: Vec<ReplacementRule>) -> Result<Self, RepairError> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.from.is_empty() {
                return Err(RepairError::InvalidRule {
                    index,
                    reason: "from must not be empty".into(),
                });
            }
            if rule.from == rule.to {
                return Err(RepairError::InvalidRule {
                    index,
                    reason: "from and to are identical".into(),
                });
            }
            if rule.to.contains(&rule.from) {
                warn!(from = %rule.from, to = %rule.to, "replacement contains its own pattern; matches will remain");
            }
        }
        let mut rules = rules;
        rules.sort_by(|a, b| b.from.len().cmp(&a.from.len()));
        Ok(Self {
            rules,
            tables: None,
        })
    }

    /// Restrict the scan to these tables. `None` scans everything.
    pub fn with_tables(mut self, tables: Option<Vec<String>>) -> Self {
        self.tables = tables;
        self
    }

    pub fn scan<T: RepairTarget + ?Sized>(&self, target: &T) -> Result<RepairReport, RepairError> {
        self.run(target, RepairMode::Preview)
    }

    pub fn apply<T: RepairTarget + ?Sized>(&self, target: &T) -> Result<RepairReport, RepairError> {
        self.run(target, RepairMode::Apply)
    }

    /// Text-like columns grouped per table, as the scanner would see them.
    pub fn text_columns<T: RepairTarget + ?Sized>(
        &self,
        target: &T,
    ) -> Result<ColumnListing, RepairError> {
        let mut scratch = RepairReport::start(RepairMode::Preview);
        let discovery = self.discover(target, &mut scratch)?;
        let mut tables: Vec<TableColumns> = Vec::new();
        for column in discovery.columns {
            match tables.last_mut() {
                Some(last) if last.table == column.table => last.columns.push(column),
                _ => tables.push(TableColumns {
                    table: column.table.clone(),
                    columns: vec![column],
                }),
            }
        }
        Ok(ColumnListing {
            tables,
            skipped: scratch.skipped,
        })
    }

    fn discover<T: RepairTarget + ?Sized>(
        &self,
        target: &T,
        report: &mut RepairReport,
    ) -> Result<Discovery, RepairError> {
        report.advance(RepairPhase::DiscoveringTables);
        let mut tables = target.table_names().map_err(RepairError::Discovery)?;
        if let Some(allow) = &self.tables {
            tables.retain(|t| allow.iter().any(|a| a.eq_ignore_ascii_case(t)));
        }

        report.advance(RepairPhase::DiscoveringColumns);
        let mut columns = Vec::new();
        let mut tables_scanned = 0;
        for table in tables {
            match target.describe_table(&table) {
                Ok(Some(cols)) => {
                    tables_scanned += 1;
                    columns.extend(cols.into_iter().filter(SchemaColumn::is_text_like));
                }
                Ok(None) => debug!(%table, "table disappeared during scan"),
                Err(e) => {
                    warn!(%table, error = %e, "skipping table");
                    report.skipped.push(SkippedEntry {
                        table,
                        column: None,
                        phase: RepairPhase::DiscoveringColumns,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(Discovery {
            tables_scanned,
            columns,
        })
    }

    fn count_all<T: RepairTarget + ?Sized>(
        &self,
        target: &T,
        columns: &[SchemaColumn],
        phase: RepairPhase,
        report: &mut RepairReport,
    ) -> Vec<MatchEntry> {
        let mut out = Vec::new();
        'columns: for column in columns {
            let mut entries = Vec::new();
            for rule in &self.rules {
                match target.count_matches(column, &rule.from) {
                    Ok(0) => {}
                    Ok(rows) => entries.push(MatchEntry {
                        table: column.table.clone(),
                        column: column.name.clone(),
                        rule: rule.from.clone(),
                        rows,
                    }),
                    Err(e) => {
                        // A column is either fully counted or reported skipped.
                        report.skip(column, phase, &e);
                        continue 'columns;
                    }
                }
            }
            out.extend(entries);
        }
        out
    }

    #[instrument(skip_all, fields(?mode, rules = self.rules.len()))]
    pub fn run<T: RepairTarget + ?Sized>(
        &self,
        target: &T,
        mode: RepairMode,
    ) -> Result<RepairReport, RepairError> {
        let mut report = RepairReport::start(mode);
        let discovery = self.discover(target, &mut report)?;
        report.tables_scanned = discovery.tables_scanned;
        report.columns_scanned = discovery.columns.len();

        report.advance(RepairPhase::ScanningPreImage);
        let found = self.count_all(
            target,
            &discovery.columns,
            RepairPhase::ScanningPreImage,
            &mut report,
        );
        report.found = found;

        report.advance(RepairPhase::Applying);
        if mode == RepairMode::Apply {
            for column in &discovery.columns {
                let flagged_rules: Vec<String> = report
                    .found
                    .iter()
                    .filter(|f| f.table == column.table && f.column == column.name)
                    .map(|f| f.rule.clone())
                    .collect();
                if flagged_rules.is_empty() {
                    continue;
                }
                // Every rule runs on a flagged column: earlier rules may have produced
                // text that a later rule matches.
                let mut failed = false;
                for rule in &self.rules {
                    match target.apply_rule(column, rule) {
                        Ok(counts) => {
                            if counts.rows_found == 0 && !flagged_rules.contains(&rule.from) {
                                continue;
                            }
                            report.applied.push(AppliedEntry {
                                table: column.table.clone(),
                                column: column.name.clone(),
                                rule: rule.from.clone(),
                                rows_found: counts.rows_found,
                                rows_changed: counts.rows_changed,
                            });
                        }
                        Err(e) if failed => {
                            debug!(table = %column.table, column = %column.name, rule = %rule.from, error = %e, "unit failed again");
                        }
                        Err(e) => {
                            failed = true;
                            report.skip(column, RepairPhase::Applying, &e);
                        }
                    }
                }
            }
        }

        report.advance(RepairPhase::ScanningPostImage);
        let remaining = self.count_all(
            target,
            &discovery.columns,
            RepairPhase::ScanningPostImage,
            &mut report,
        );
        report.remaining = remaining;

        report.advance(RepairPhase::Done);
        report.finished_at = now_rfc3339();
        info!(
            run_id = %report.run_id,
            tables = report.tables_scanned,
            columns = report.columns_scanned,
            found = report.found.len(),
            rows_changed = report.rows_changed(),
            remaining = report.remaining.len(),
            skipped = report.skipped.len(),
            "repair run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn conn() -> Connection {
        Connection::open_in_memory().expect("open in-memory db")
    }

    fn denied() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_PERM),
            Some("permission denied".into()),
        )
    }

    /// Delegates to a real connection but refuses to touch one table.
    struct Guarded<'a> {
        inner: &'a Connection,
        denied_table: &'a str,
        deny_describe: bool,
        deny_listing: bool,
        deny_pattern: Option<&'a str>,
    }

    impl<'a> Guarded<'a> {
        fn new(inner: &'a Connection, denied_table: &'a str) -> Self {
            Self {
                inner,
                denied_table,
                deny_describe: false,
                deny_listing: false,
                deny_pattern: None,
            }
        }
    }

    impl RepairTarget for Guarded<'_> {
        fn table_names(&self) -> rusqlite::Result<Vec<String>> {
            if self.deny_listing {
                return Err(denied());
            }
            self.inner.table_names()
        }

        fn describe_table(&self, table: &str) -> rusqlite::Result<Option<Vec<SchemaColumn>>> {
            if self.deny_describe && table == self.denied_table {
                return Err(denied());
            }
            self.inner.describe_table(table)
        }

        fn count_matches(&self, column: &SchemaColumn, pattern: &str) -> rusqlite::Result<u64> {
            if column.table == self.denied_table || self.deny_pattern == Some(pattern) {
                return Err(denied());
            }
            self.inner.count_matches(column, pattern)
        }

        fn apply_rule(
            &self,
            column: &SchemaColumn,
            rule: &ReplacementRule,
        ) -> rusqlite::Result<UnitCounts> {
            if column.table == self.denied_table {
                return Err(denied());
            }
            self.inner.apply_rule(column, rule)
        }
    }

    fn seed_users(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE users(
                id INTEGER PRIMARY KEY,
                full_name VARCHAR(120),
                profile_photo TEXT,
                login_count INTEGER
            );
            INSERT INTO users(full_name, profile_photo, login_count) VALUES
                ('Ada', 'http://127.0.0.1/old/a.png', 3),
                ('Grace', 'http://127.0.0.1/old/b.png', 5),
                ('Linus', '/static/default.png', 1);",
        )
        .expect("seed users");
    }

    fn photos(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT profile_photo FROM users ORDER BY id")
            .expect("prepare");
        stmt.query_map([], |r| r.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows")
    }

    const ALL_PHASES: [RepairPhase; 7] = [
        RepairPhase::Idle,
        RepairPhase::DiscoveringTables,
        RepairPhase::DiscoveringColumns,
        RepairPhase::ScanningPreImage,
        RepairPhase::Applying,
        RepairPhase::ScanningPostImage,
        RepairPhase::Done,
    ];

    #[test]
    fn empty_rule_set_reports_nothing() {
        let conn = conn();
        seed_users(&conn);
        let scanner = SchemaRepairScanner::new(Vec::new()).expect("scanner");
        let report = scanner.apply(&conn).expect("apply");
        assert!(report.found.is_empty());
        assert!(report.applied.is_empty());
        assert!(report.remaining.is_empty());
        assert_eq!(report.tables_scanned, 1);
        assert_eq!(report.columns_scanned, 2);
        assert_eq!(report.phases, ALL_PHASES.to_vec());
    }

    #[test]
    fn rewrites_prefix_and_is_idempotent() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE pages(id INTEGER PRIMARY KEY, link TEXT);
             INSERT INTO pages(link) VALUES('http://localhost/app/x');",
        )
        .expect("seed");
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "http://localhost/app/",
            "https://prod.example/",
        )])
        .expect("scanner");

        let first = scanner.apply(&conn).expect("first apply");
        assert_eq!(first.rows_changed(), 1);
        assert!(first.is_clean());
        let link: String = conn
            .query_row("SELECT link FROM pages", [], |r| r.get(0))
            .expect("link");
        assert_eq!(link, "https://prod.example/x");

        let second = scanner.apply(&conn).expect("second apply");
        assert_eq!(second.rows_changed(), 0);
        assert!(second.applied.is_empty());
        assert!(second.found.is_empty());
        assert!(second.is_clean());
    }

    #[test]
    fn profile_photos_changed_unrelated_row_untouched() {
        let conn = conn();
        seed_users(&conn);
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "http://127.0.0.1/old/",
            "https://cdn.example/",
        )])
        .expect("scanner");

        let report = scanner.apply(&conn).expect("apply");
        assert_eq!(
            report.found,
            vec![MatchEntry {
                table: "users".into(),
                column: "profile_photo".into(),
                rule: "http://127.0.0.1/old/".into(),
                rows: 2,
            }]
        );
        assert_eq!(
            report.applied,
            vec![AppliedEntry {
                table: "users".into(),
                column: "profile_photo".into(),
                rule: "http://127.0.0.1/old/".into(),
                rows_found: 2,
                rows_changed: 2,
            }]
        );
        assert_eq!(
            photos(&conn),
            vec![
                "https://cdn.example/a.png".to_string(),
                "https://cdn.example/b.png".to_string(),
                "/static/default.png".to_string(),
            ]
        );

        let rerun = scanner.apply(&conn).expect("rerun");
        assert_eq!(rerun.rows_changed(), 0);
    }

    #[test]
    fn inaccessible_table_is_skipped_not_fatal() {
        let conn = conn();
        seed_users(&conn);
        conn.execute_batch(
            "CREATE TABLE payroll(id INTEGER PRIMARY KEY, payslip_url TEXT);
             INSERT INTO payroll(payslip_url) VALUES('http://127.0.0.1/old/slip.pdf');",
        )
        .expect("seed payroll");
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "http://127.0.0.1/old/",
            "https://cdn.example/",
        )])
        .expect("scanner");

        let target = Guarded::new(&conn, "payroll");
        let report = scanner.scan(&target).expect("scan");
        assert_eq!(report.found.len(), 1);
        assert_eq!(report.found[0].table, "users");
        assert!(report.skipped.iter().all(|s| s.table == "payroll"));
        assert!(!report.skipped.is_empty());

        let report = scanner.apply(&target).expect("apply");
        assert_eq!(report.rows_changed(), 2);
        assert!(report.remaining.is_empty());
        let slip: String = conn
            .query_row("SELECT payslip_url FROM payroll", [], |r| r.get(0))
            .expect("slip");
        assert_eq!(slip, "http://127.0.0.1/old/slip.pdf");
    }

    #[test]
    fn describe_failure_skips_table() {
        let conn = conn();
        seed_users(&conn);
        conn.execute_batch("CREATE TABLE audit_log(entry TEXT);")
            .expect("seed");
        let mut target = Guarded::new(&conn, "audit_log");
        target.deny_describe = true;
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new("old", "new")])
            .expect("scanner");
        let report = scanner.scan(&target).expect("scan");
        assert_eq!(report.tables_scanned, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].column, None);
        assert_eq!(report.skipped[0].phase, RepairPhase::DiscoveringColumns);
    }

    #[test]
    fn listing_failure_is_fatal() {
        let conn = conn();
        let mut target = Guarded::new(&conn, "none");
        target.deny_listing = true;
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new("a", "b")])
            .expect("scanner");
        assert!(matches!(
            scanner.apply(&target),
            Err(RepairError::Discovery(_))
        ));
    }

    #[test]
    fn specific_rule_runs_before_general_one() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE notices(id INTEGER PRIMARY KEY, body TEXT);
             INSERT INTO notices(body) VALUES('see http://old.example/uploads/f.pdf');
             INSERT INTO notices(body) VALUES('home http://old.example/index');",
        )
        .expect("seed");
        let scanner = SchemaRepairScanner::new(vec![
            ReplacementRule::new("http://old.example/", "https://www.example.org/"),
            ReplacementRule::new("http://old.example/uploads/", "https://cdn.example.org/"),
        ])
        .expect("scanner");

        let report = scanner.apply(&conn).expect("apply");
        assert!(report.is_clean());
        let bodies: Vec<String> = conn
            .prepare("SELECT body FROM notices ORDER BY id")
            .expect("prepare")
            .query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(
            bodies,
            vec![
                "see https://cdn.example.org/f.pdf".to_string(),
                "home https://www.example.org/index".to_string()
            ]
        );
    }

    #[test]
    fn later_rules_see_rewritten_values() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE links(id INTEGER PRIMARY KEY, url TEXT);
             INSERT INTO links(url) VALUES('http://a.test/p');",
        )
        .expect("seed");
        let scanner = SchemaRepairScanner::new(vec![
            ReplacementRule::new("a.test", "b.test"),
            ReplacementRule::new("b.test", "c.test"),
        ])
        .expect("scanner");
        let report = scanner.apply(&conn).expect("apply");
        assert_eq!(report.found.len(), 1);
        assert_eq!(report.applied.len(), 2);
        assert!(report.is_clean());
        let url: String = conn
            .query_row("SELECT url FROM links", [], |r| r.get(0))
            .expect("url");
        assert_eq!(url, "http://c.test/p");
    }

    #[test]
    fn reintroduced_pattern_is_reported_remaining() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE hosts(id INTEGER PRIMARY KEY, host TEXT);
             INSERT INTO hosts(host) VALUES('example.com');",
        )
        .expect("seed");
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "example.com",
            "www.example.com",
        )])
        .expect("scanner");
        let report = scanner.apply(&conn).expect("apply");
        assert_eq!(report.rows_changed(), 1);
        assert_eq!(report.remaining.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn preview_never_writes() {
        let conn = conn();
        seed_users(&conn);
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "http://127.0.0.1/old/",
            "https://cdn.example/",
        )])
        .expect("scanner");
        let report = scanner.scan(&conn).expect("scan");
        assert_eq!(report.mode, RepairMode::Preview);
        assert!(report.applied.is_empty());
        assert_eq!(report.remaining, report.found);
        assert_eq!(report.phases, ALL_PHASES.to_vec());
        assert_eq!(photos(&conn)[0], "http://127.0.0.1/old/a.png");
    }

    #[test]
    fn numeric_columns_are_not_rewritten() {
        let conn = conn();
        seed_users(&conn);
        let scanner =
            SchemaRepairScanner::new(vec![ReplacementRule::new("5", "7")]).expect("scanner");
        scanner.apply(&conn).expect("apply");
        let count: i64 = conn
            .query_row("SELECT login_count FROM users WHERE full_name = 'Grace'", [], |r| {
                r.get(0)
            })
            .expect("count");
        assert_eq!(count, 5);
    }

    #[test]
    fn allow_list_restricts_tables() {
        let conn = conn();
        seed_users(&conn);
        conn.execute_batch(
            "CREATE TABLE alumni(id INTEGER PRIMARY KEY, photo TEXT);
             INSERT INTO alumni(photo) VALUES('http://127.0.0.1/old/z.png');",
        )
        .expect("seed");
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "http://127.0.0.1/old/",
            "https://cdn.example/",
        )])
        .expect("scanner")
        .with_tables(Some(vec!["alumni".into(), "no_such_table".into()]));
        let report = scanner.apply(&conn).expect("apply");
        assert_eq!(report.tables_scanned, 1);
        assert_eq!(report.rows_changed(), 1);
        assert_eq!(photos(&conn)[0], "http://127.0.0.1/old/a.png");
    }

    #[test]
    fn invalid_rules_rejected() {
        assert!(matches!(
            SchemaRepairScanner::new(vec![ReplacementRule::new("", "x")]),
            Err(RepairError::InvalidRule { index: 0, .. })
        ));
        assert!(matches!(
            SchemaRepairScanner::new(vec![
                ReplacementRule::new("a", "b"),
                ReplacementRule::new("same", "same"),
            ]),
            Err(RepairError::InvalidRule { index: 1, .. })
        ));
    }

    #[test]
    fn text_columns_groups_by_table() {
        let conn = conn();
        seed_users(&conn);
        conn.execute_batch("CREATE TABLE classes(id INTEGER PRIMARY KEY, name TEXT, notes BLOB);")
            .expect("seed");
        let listing = SchemaRepairScanner::default()
            .text_columns(&conn)
            .expect("columns");
        assert!(listing.skipped.is_empty());
        let shape: Vec<(String, Vec<String>)> = listing
            .tables
            .into_iter()
            .map(|t| (t.table, t.columns.into_iter().map(|c| c.name).collect()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("classes".to_string(), vec!["name".to_string(), "notes".to_string()]),
                (
                    "users".to_string(),
                    vec!["full_name".to_string(), "profile_photo".to_string()]
                ),
            ]
        );
    }

    #[test]
    fn text_columns_lists_undescribable_tables() {
        let conn = conn();
        seed_users(&conn);
        conn.execute_batch("CREATE TABLE audit_log(entry TEXT);")
            .expect("seed");
        let mut target = Guarded::new(&conn, "audit_log");
        target.deny_describe = true;
        let listing = SchemaRepairScanner::default()
            .text_columns(&target)
            .expect("columns");
        assert_eq!(listing.tables.len(), 1);
        assert_eq!(listing.tables[0].table, "users");
        assert_eq!(listing.skipped.len(), 1);
        assert_eq!(listing.skipped[0].table, "audit_log");
        assert_eq!(listing.skipped[0].phase, RepairPhase::DiscoveringColumns);
    }

    #[test]
    fn allow_list_ignores_table_name_case() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE Users(id INTEGER PRIMARY KEY, photo TEXT);
             INSERT INTO Users(photo) VALUES('http://127.0.0.1/old/a.png');",
        )
        .expect("seed");
        let scanner = SchemaRepairScanner::new(vec![ReplacementRule::new(
            "http://127.0.0.1/old/",
            "https://cdn.example/",
        )])
        .expect("scanner")
        .with_tables(Some(vec!["users".into()]));
        let report = scanner.apply(&conn).expect("apply");
        assert_eq!(report.tables_scanned, 1);
        assert_eq!(report.rows_changed(), 1);
    }

    fn seed_accounts(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE accounts(id INTEGER PRIMARY KEY, email TEXT UNIQUE);
             INSERT INTO accounts(email) VALUES('a@old.test'), ('a@new.test'), ('b@old.test');
             CREATE TABLE zz(id INTEGER PRIMARY KEY, note TEXT);
             INSERT INTO zz(note) VALUES('mail b@old.test');",
        )
        .expect("seed accounts");
    }

    fn emails(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT email FROM accounts ORDER BY id")
            .expect("prepare")
            .query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows")
    }

    #[test]
    fn failed_update_rolls_back_and_later_tables_still_repair() {
        let conn = conn();
        seed_accounts(&conn);
        let scanner =
            SchemaRepairScanner::new(vec![ReplacementRule::new("old.test", "new.test")])
                .expect("scanner");

        let report = scanner.apply(&conn).expect("apply");
        assert_eq!(
            emails(&conn),
            vec![
                "a@old.test".to_string(),
                "a@new.test".to_string(),
                "b@old.test".to_string()
            ]
        );
        assert_eq!(report.skipped.len(), 1);
        let skip = &report.skipped[0];
        assert_eq!(skip.table, "accounts");
        assert_eq!(skip.column.as_deref(), Some("email"));
        assert_eq!(skip.phase, RepairPhase::Applying);
        assert!(skip.message.contains("UNIQUE constraint failed"), "{}", skip.message);
        assert_eq!(
            report.remaining,
            vec![MatchEntry {
                table: "accounts".into(),
                column: "email".into(),
                rule: "old.test".into(),
                rows: 2,
            }]
        );
        assert_eq!(report.rows_changed(), 1);
        let note: String = conn
            .query_row("SELECT note FROM zz", [], |r| r.get(0))
            .expect("note");
        assert_eq!(note, "mail b@new.test");
    }

    #[test]
    fn repeatedly_failing_column_is_skipped_once() {
        let conn = conn();
        seed_accounts(&conn);
        let scanner = SchemaRepairScanner::new(vec![
            ReplacementRule::new("@old", "@new"),
            ReplacementRule::new("old.test", "new.test"),
        ])
        .expect("scanner");
        let report = scanner.apply(&conn).expect("apply");
        let applying: Vec<&SkippedEntry> = report
            .skipped
            .iter()
            .filter(|s| s.phase == RepairPhase::Applying)
            .collect();
        assert_eq!(applying.len(), 1);
        assert_eq!(applying[0].table, "accounts");
        assert_eq!(emails(&conn)[0], "a@old.test");
    }

    #[test]
    fn partially_counted_column_is_dropped_from_found() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT);
             INSERT INTO notes(body) VALUES('http://legacy.host/tmp/x');",
        )
        .expect("seed");
        let mut target = Guarded::new(&conn, "none");
        target.deny_pattern = Some("tmp");
        let scanner = SchemaRepairScanner::new(vec![
            ReplacementRule::new("legacy.host", "new.host"),
            ReplacementRule::new("tmp", "scratch"),
        ])
        .expect("scanner");
        let report = scanner.scan(&target).expect("scan");
        assert!(report.found.is_empty());
        assert!(report.remaining.is_empty());
        let phases: Vec<RepairPhase> = report.skipped.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![RepairPhase::ScanningPreImage, RepairPhase::ScanningPostImage]
        );
    }
}
