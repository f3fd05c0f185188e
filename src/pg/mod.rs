//! Purpose: Assemble PostgreSQL bulk-load scripts from a decoding session.
//! Exports: `Script`, `ScriptOptions`, `PgVersion`, identifier helpers.
//! Role: Collaborator layer over `core`; pure string assembly, no byte decoding.
//! Invariants: Output is line-oriented and emitted lazily, one statement or
//! COPY row per line; rows stream straight from the single-pass scanner.

use crate::core::error::Error;
use crate::core::table::{Column, Rows, Table};

/// PostgreSQL reserved words that cannot be used as bare column names.
/// The trailing empty entry catches columns whose stored name is blank.
const RESERVED_WORDS: &[&str] = &[
    "all",
    "analyse",
    "analyze",
    "and",
    "any",
    "array",
    "as",
    "asc",
    "asymmetric",
    "both",
    "case",
    "cast",
    "check",
    "collate",
    "column",
    "constraint",
    "create",
    "current_catalog",
    "current_date",
    "current_role",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "deferrable",
    "desc",
    "distinct",
    "do",
    "else",
    "end",
    "except",
    "false",
    "fetch",
    "for",
    "foreign",
    "from",
    "grant",
    "group",
    "having",
    "in",
    "initially",
    "intersect",
    "into",
    "leading",
    "limit",
    "localtime",
    "localtimestamp",
    "new",
    "not",
    "null",
    "off",
    "offset",
    "old",
    "on",
    "only",
    "or",
    "order",
    "placing",
    "primary",
    "references",
    "returning",
    "select",
    "session_user",
    "some",
    "symmetric",
    "table",
    "then",
    "to",
    "trailing",
    "true",
    "union",
    "unique",
    "user",
    "using",
    "variadic",
    "when",
    "where",
    "window",
    "with",
    "",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PgVersion {
    /// 8.1 and older: no `DROP TABLE IF EXISTS`.
    Legacy,
    /// 8.2 and newer.
    Modern,
}

impl PgVersion {
    fn supports_drop_if_exists(self) -> bool {
        matches!(self, PgVersion::Modern)
    }
}

#[derive(Clone, Debug)]
pub struct ScriptOptions {
    /// Destination table name; defaults to the file stem, sanitized.
    pub table_name: Option<String>,
    pub drop_table: bool,
    pub create_table: bool,
    pub truncate_table: bool,
    pub wrap_transaction: bool,
    /// Map `N`/`F` columns to TEXT instead of NUMERIC.
    pub numeric_as_text: bool,
    /// Map `L` columns to VARCHAR(1); pair with raw logical decoding.
    pub bool_as_varchar: bool,
    pub pg_version: PgVersion,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            table_name: None,
            drop_table: true,
            create_table: true,
            truncate_table: false,
            wrap_transaction: true,
            numeric_as_text: false,
            bool_as_varchar: false,
            pg_version: PgVersion::Modern,
        }
    }
}

impl ScriptOptions {
    /// Resolve flag interplay: truncating an existing table excludes
    /// dropping or recreating it, and a drop always recreates.
    fn normalized(mut self) -> Self {
        if self.truncate_table {
            self.drop_table = false;
            self.create_table = false;
        } else if self.drop_table {
            self.create_table = true;
        }
        self
    }
}

/// Replace every run of non-word characters with a single underscore.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Rename reserved words with a numeric suffix, avoiding names already taken
/// by other exported columns.
fn resolve_column_name(name: &str, taken: &[String]) -> String {
    if !RESERVED_WORDS.contains(&name.to_lowercase().as_str()) {
        return name.to_string();
    }
    let mut increment = 0usize;
    loop {
        increment += 1;
        let candidate = format!("{name}_{increment}");
        if !taken
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(&candidate))
        {
            return candidate;
        }
    }
}

/// DDL type for one column. Character columns keep their declared width;
/// decoded date/timestamp/currency/double text can exceed the stored field
/// width, so everything else non-numeric becomes TEXT.
fn pg_type(column: &Column, options: &ScriptOptions) -> String {
    match column.tag {
        'N' | 'F' => {
            if options.numeric_as_text {
                "TEXT".to_string()
            } else if column.decimal_count == 0 {
                format!("NUMERIC({})", column.length)
            } else {
                format!("NUMERIC({},{})", column.length, column.decimal_count)
            }
        }
        'L' => {
            if options.bool_as_varchar {
                "VARCHAR(1)".to_string()
            } else {
                "BOOLEAN".to_string()
            }
        }
        'M' => "TEXT".to_string(),
        'C' => format!("VARCHAR({})", column.length),
        _ => "TEXT".to_string(),
    }
}

/// Escape one decoded field for the COPY text format. NUL bytes cannot be
/// stored by PostgreSQL and are stripped.
pub fn escape_copy_text(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => {}
            _ => out.push(ch),
        }
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Begin,
    Drop,
    Create,
    Truncate,
    CopyHeader,
    Rows,
    CopyEnd,
    Commit,
    Done,
}

impl Phase {
    fn next(self) -> Self {
        match self {
            Phase::Begin => Phase::Drop,
            Phase::Drop => Phase::Create,
            Phase::Create => Phase::Truncate,
            Phase::Truncate => Phase::CopyHeader,
            Phase::CopyHeader => Phase::Rows,
            Phase::Rows => Phase::CopyEnd,
            Phase::CopyEnd => Phase::Commit,
            Phase::Commit => Phase::Done,
            Phase::Done => Phase::Done,
        }
    }
}

/// Lazy line iterator over a complete load script. Consumes the session's
/// columns and rows exactly once; errors surface in place of a line and end
/// the script.
pub struct Script {
    table_name: String,
    column_names: Vec<String>,
    columns: Vec<Column>,
    options: ScriptOptions,
    rows: Rows,
    phase: Phase,
}

impl Script {
    pub fn new(mut table: Table, options: ScriptOptions) -> Result<Self, Error> {
        let options = options.normalized();
        let table_name = match &options.table_name {
            Some(name) => sanitize_identifier(name),
            None => sanitize_identifier(
                &table
                    .path()
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        };

        let columns = table.columns()?;
        let mut column_names: Vec<String> = Vec::with_capacity(columns.len());
        let exported: Vec<String> = columns.iter().map(|column| column.name.clone()).collect();
        for column in &columns {
            column_names.push(resolve_column_name(&column.name, &exported));
        }
        let rows = table.rows()?;

        Ok(Self {
            table_name,
            column_names,
            columns,
            options,
            rows,
            phase: Phase::Begin,
        })
    }

    fn column_list(&self) -> String {
        self.column_names.join(",")
    }

    fn create_statement(&self) -> String {
        let definitions: Vec<String> = self
            .columns
            .iter()
            .zip(&self.column_names)
            .map(|(column, name)| format!("{name} {}", pg_type(column, &self.options)))
            .collect();
        format!(
            "CREATE TABLE {} ({});",
            self.table_name,
            definitions.join(",")
        )
    }

    fn drop_statement(&self) -> String {
        let if_exists = if self.options.pg_version.supports_drop_if_exists() {
            "IF EXISTS "
        } else {
            ""
        };
        format!(
            "SET statement_timeout = 60000; DROP TABLE {if_exists}{}; SET statement_timeout = 0;",
            self.table_name
        )
    }

    fn statement_for(&self, phase: Phase) -> Option<String> {
        match phase {
            Phase::Begin => self.options.wrap_transaction.then(|| "BEGIN;".to_string()),
            Phase::Drop => self.options.drop_table.then(|| self.drop_statement()),
            Phase::Create => self.options.create_table.then(|| self.create_statement()),
            Phase::Truncate => self
                .options
                .truncate_table
                .then(|| format!("TRUNCATE TABLE {};", self.table_name)),
            Phase::CopyHeader => Some(format!(
                "COPY {} ({}) FROM STDIN;",
                self.table_name,
                self.column_list()
            )),
            Phase::CopyEnd => Some("\\.".to_string()),
            Phase::Commit => self.options.wrap_transaction.then(|| "COMMIT;".to_string()),
            Phase::Rows | Phase::Done => None,
        }
    }
}

impl Iterator for Script {
    type Item = Result<String, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.phase {
                Phase::Done => return None,
                Phase::Rows => match self.rows.next() {
                    Some(Ok(row)) => {
                        let line = row
                            .iter()
                            .map(|field| escape_copy_text(field))
                            .collect::<Vec<_>>()
                            .join("\t");
                        return Some(Ok(line));
                    }
                    Some(Err(err)) => {
                        self.phase = Phase::Done;
                        return Some(Err(err));
                    }
                    None => {
                        self.phase = self.phase.next();
                    }
                },
                phase => {
                    self.phase = self.phase.next();
                    if let Some(line) = self.statement_for(phase) {
                        return Some(Ok(line));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        escape_copy_text, pg_type, resolve_column_name, sanitize_identifier, PgVersion, Script,
        ScriptOptions,
    };
    use crate::core::table::{Column, OpenOptions, Table};
    use std::path::{Path, PathBuf};

    #[test]
    fn identifiers_collapse_non_word_runs() {
        assert_eq!(sanitize_identifier("my-table.2020"), "my_table_2020");
        assert_eq!(sanitize_identifier("plain"), "plain");
        assert_eq!(sanitize_identifier("a  b!!c"), "a_b_c");
    }

    #[test]
    fn reserved_words_get_numeric_suffixes() {
        assert_eq!(resolve_column_name("PRICE", &[]), "PRICE");
        assert_eq!(resolve_column_name("user", &[]), "user_1");
        assert_eq!(resolve_column_name("ORDER", &[]), "ORDER_1");
        assert_eq!(
            resolve_column_name("user", &["user_1".to_string()]),
            "user_2"
        );
    }

    #[test]
    fn type_mapping_follows_the_column_tag() {
        let numeric = column("QTY", 'N', 8, 2);
        let options = ScriptOptions::default();
        assert_eq!(pg_type(&numeric, &options), "NUMERIC(8,2)");
        assert_eq!(pg_type(&column("ID", 'N', 4, 0), &options), "NUMERIC(4)");
        assert_eq!(pg_type(&column("NAME", 'C', 20, 0), &options), "VARCHAR(20)");
        assert_eq!(pg_type(&column("OK", 'L', 1, 0), &options), "BOOLEAN");
        assert_eq!(pg_type(&column("NOTES", 'M', 10, 0), &options), "TEXT");
        assert_eq!(pg_type(&column("WHEN", 'T', 8, 0), &options), "TEXT");

        let as_text = ScriptOptions {
            numeric_as_text: true,
            bool_as_varchar: true,
            ..ScriptOptions::default()
        };
        assert_eq!(pg_type(&numeric, &as_text), "TEXT");
        assert_eq!(pg_type(&column("OK", 'L', 1, 0), &as_text), "VARCHAR(1)");
    }

    #[test]
    fn copy_escaping_protects_the_stream_framing() {
        assert_eq!(escape_copy_text("plain"), "plain");
        assert_eq!(escape_copy_text("a\tb"), "a\\tb");
        assert_eq!(escape_copy_text("a\nb"), "a\\nb");
        assert_eq!(escape_copy_text("a\\b"), "a\\\\b");
        assert_eq!(escape_copy_text("a\0b"), "ab");
    }

    #[test]
    fn script_frames_the_copy_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_dbf(dir.path());
        let table = Table::open(&path, OpenOptions::default()).expect("open");
        let lines: Vec<String> = Script::new(table, ScriptOptions::default())
            .expect("script")
            .collect::<Result<_, _>>()
            .expect("lines");

        assert_eq!(
            lines,
            vec![
                "BEGIN;".to_string(),
                "SET statement_timeout = 60000; DROP TABLE IF EXISTS cities; \
                 SET statement_timeout = 0;"
                    .to_string(),
                "CREATE TABLE cities (NAME VARCHAR(6),POP NUMERIC(4));".to_string(),
                "COPY cities (NAME,POP) FROM STDIN;".to_string(),
                "oslo\t634".to_string(),
                "bergen\t271".to_string(),
                "\\.".to_string(),
                "COMMIT;".to_string(),
            ]
        );
    }

    #[test]
    fn truncate_mode_skips_drop_and_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_dbf(dir.path());
        let table = Table::open(&path, OpenOptions::default()).expect("open");
        let options = ScriptOptions {
            truncate_table: true,
            ..ScriptOptions::default()
        };
        let lines: Vec<String> = Script::new(table, options)
            .expect("script")
            .collect::<Result<_, _>>()
            .expect("lines");

        assert!(lines.contains(&"TRUNCATE TABLE cities;".to_string()));
        assert!(!lines.iter().any(|line| line.contains("DROP TABLE")));
        assert!(!lines.iter().any(|line| line.contains("CREATE TABLE")));
    }

    #[test]
    fn legacy_servers_get_a_plain_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_dbf(dir.path());
        let table = Table::open(&path, OpenOptions::default()).expect("open");
        let options = ScriptOptions {
            pg_version: PgVersion::Legacy,
            ..ScriptOptions::default()
        };
        let lines: Vec<String> = Script::new(table, options)
            .expect("script")
            .collect::<Result<_, _>>()
            .expect("lines");

        let drop = lines
            .iter()
            .find(|line| line.contains("DROP TABLE"))
            .expect("drop line");
        assert!(!drop.contains("IF EXISTS"));
    }

    fn column(name: &str, tag: char, length: usize, decimal_count: u8) -> Column {
        Column {
            name: name.to_string(),
            tag,
            length,
            decimal_count,
        }
    }

    fn write_dbf(dir: &Path) -> PathBuf {
        let mut bytes = vec![0u8; 32];
        bytes[0] = 0x03;
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        bytes[8..10].copy_from_slice(&(32u16 + 2 * 32 + 1).to_le_bytes());
        for (name, tag, length) in [("NAME", b'C', 6u8), ("POP", b'N', 4)] {
            let mut raw = [0u8; 32];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            raw[11] = tag;
            raw[16] = length;
            bytes.extend_from_slice(&raw);
        }
        bytes.push(0x0D);
        bytes.extend_from_slice(b" oslo   634");
        bytes.extend_from_slice(b" bergen 271");
        let path = dir.join("cities.dbf");
        std::fs::write(&path, bytes).expect("write dbf");
        path
    }
}
