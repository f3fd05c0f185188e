//! Purpose: `dbfport` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, writes script lines to stdout.
//! Invariants: Script and JSON output go to stdout; diagnostics go to stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use dbfport::api::{to_exit_code, Error, ErrorKind, OpenOptions, Table};
use dbfport::pg::{PgVersion, Script, ScriptOptions};

#[derive(Parser)]
#[command(
    name = "dbfport",
    version,
    about = "Decode dBase/xBase DBF tables into PostgreSQL bulk-load scripts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a table and print a PostgreSQL load script
    Export(ExportArgs),
    /// Print the parsed table layout as JSON
    Info(InfoArgs),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct ExportArgs {
    /// Path to the .dbf table file
    #[arg(value_hint = ValueHint::FilePath)]
    file: PathBuf,
    /// Destination table name (defaults to the file stem, sanitized)
    #[arg(long, value_name = "NAME")]
    table_name: Option<String>,
    /// Truncate the existing table instead of dropping and recreating it
    #[arg(long)]
    truncate: bool,
    /// Skip the DROP TABLE statement
    #[arg(long)]
    no_drop: bool,
    /// Skip the CREATE TABLE statement
    #[arg(long)]
    no_create: bool,
    /// Do not wrap the script in a transaction
    #[arg(long)]
    no_transaction: bool,
    /// Map numeric columns to TEXT instead of NUMERIC
    #[arg(long)]
    numeric_as_text: bool,
    /// Map logical columns to VARCHAR(1) holding the raw flag character
    #[arg(long)]
    bool_as_varchar: bool,
    /// Target servers older than PostgreSQL 8.2 (no DROP TABLE IF EXISTS)
    #[arg(long)]
    pre_82: bool,
    /// Only export the named columns (repeatable; empty means all)
    #[arg(long = "include", value_name = "COLUMN")]
    include: Vec<String>,
    /// Rename a column on export (repeatable)
    #[arg(long = "rename", value_name = "OLD=NEW")]
    rename: Vec<String>,
}

#[derive(clap::Args)]
struct InfoArgs {
    /// Path to the .dbf table file
    #[arg(value_hint = ValueHint::FilePath)]
    file: PathBuf,
}

#[derive(Serialize)]
struct FieldInfo {
    name: String,
    tag: String,
    r#type: &'static str,
    length: usize,
    offset: usize,
    decimals: u8,
    exported: bool,
}

#[derive(Serialize)]
struct TableInfo {
    path: String,
    record_count: u32,
    record_body_length: usize,
    memo: Option<&'static str>,
    fields: Vec<FieldInfo>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("dbfport: {err}");
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    match Cli::parse().command {
        Command::Export(args) => run_export(args),
        Command::Info(args) => run_info(args),
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "dbfport", &mut io::stdout());
            Ok(())
        }
    }
}

fn run_export(args: ExportArgs) -> Result<(), Error> {
    let options = OpenOptions {
        include: args.include,
        renames: parse_renames(&args.rename)?,
        logical_as_char: args.bool_as_varchar,
    };
    let table = Table::open(&args.file, options)?;

    let script_options = ScriptOptions {
        table_name: args.table_name,
        drop_table: !args.no_drop && !args.truncate,
        create_table: !args.no_create && !args.truncate,
        truncate_table: args.truncate,
        wrap_transaction: !args.no_transaction,
        numeric_as_text: args.numeric_as_text,
        bool_as_varchar: args.bool_as_varchar,
        pg_version: if args.pre_82 {
            PgVersion::Legacy
        } else {
            PgVersion::Modern
        },
    };
    let script = Script::new(table, script_options)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for line in script {
        writeln!(out, "{}", line?)?;
    }
    out.flush()?;
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), Error> {
    let table = Table::open(&args.file, OpenOptions::default())?;
    let layout = table.layout();
    let info = TableInfo {
        path: args.file.display().to_string(),
        record_count: layout.record_count,
        record_body_length: layout.record_body_len,
        memo: table.memo_variant().map(|variant| variant.extension()),
        fields: layout
            .fields
            .iter()
            .map(|field| FieldInfo {
                name: field.name.clone(),
                tag: (field.tag as char).to_string(),
                r#type: field.field_type.name(),
                length: field.length,
                offset: field.offset,
                decimals: field.decimal_count,
                exported: field.exported,
            })
            .collect(),
    };
    let rendered = serde_json::to_string_pretty(&info)
        .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
    println!("{rendered}");
    Ok(())
}

fn parse_renames(pairs: &[String]) -> Result<HashMap<String, String>, Error> {
    let mut renames = HashMap::new();
    for pair in pairs {
        let Some((old, new)) = pair.split_once('=') else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("expected OLD=NEW for --rename, got {pair:?}")));
        };
        renames.insert(old.to_string(), new.to_string());
    }
    Ok(renames)
}
