//! rowdiff CLI - diff two database tables efficiently.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rowdiff::{
    connect, parse_duration, table_segment, Algorithm, ConfigFile, Database, DiffError,
    DiffOptions, DiffRecord, RunConfig, Sign,
};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "rowdiff")]
#[command(about = "Diff two database tables: checksum bisection across databases, \
                   outer-join diffing within one")]
#[command(version)]
#[command(after_help = "TARGETS:\n  \
    DB1_URI TABLE1 DB2_URI TABLE2    cross-database diff\n  \
    DB_URI TABLE1 TABLE2             same-database diff\n\n\
    A database name from --conf can stand in for any URI.")]
struct Cli {
    /// DB1 TABLE1 DB2 TABLE2, or DB TABLE1 TABLE2, or empty with --run
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,

    /// Key column (repeatable; default: id)
    #[arg(short = 'k', long = "key-columns", value_name = "COLUMN")]
    key_columns: Vec<String>,

    /// Column that signals row updates, e.g. updated_at
    #[arg(short = 't', long, value_name = "COLUMN")]
    update_column: Option<String>,

    /// Extra columns to compare (repeatable; SQL LIKE patterns allowed)
    #[arg(short = 'c', long = "columns", value_name = "PATTERN")]
    columns: Vec<String>,

    /// Stop after this many diff records
    #[arg(short = 'l', long, value_name = "N")]
    limit: Option<u64>,

    /// Extra WHERE predicate applied to both sides
    #[arg(short = 'w', long = "where", value_name = "EXPR")]
    where_clause: Option<String>,

    /// Worker threads per database
    #[arg(short = 'j', long, value_name = "N")]
    threads: Option<usize>,

    /// Diff algorithm
    #[arg(short = 'a', long, value_name = "auto|joindiff|hashdiff")]
    algorithm: Option<String>,

    /// Rows under which a segment is downloaded instead of split
    #[arg(long, value_name = "N")]
    bisection_threshold: Option<i64>,

    /// Segments per bisection step
    #[arg(long, value_name = "N")]
    bisection_factor: Option<usize>,

    /// Ignore rows updated within this duration (e.g. 5min, 2h, 1d)
    #[arg(long, value_name = "AGE")]
    min_age: Option<String>,

    /// Ignore rows updated before this duration ago
    #[arg(long, value_name = "AGE")]
    max_age: Option<String>,

    /// Print an aggregate summary after the diff
    #[arg(short = 's', long)]
    stats: bool,

    /// Emit newline-delimited JSON instead of text
    #[arg(long)]
    json: bool,

    /// Materialize the diff into a table (%t expands to a UTC timestamp)
    #[arg(short = 'm', long, value_name = "NAME")]
    materialize: Option<String>,

    /// Materialize every row, annotated with a diff indicator
    #[arg(long)]
    materialize_all_rows: bool,

    /// Skip the key uniqueness check
    #[arg(long)]
    assume_unique_key: bool,

    /// Diff against empty tables instead of failing
    #[arg(long)]
    allow_empty_tables: bool,

    /// Sample keys from each exclusive side into the stats
    #[arg(long)]
    sample_exclusive_rows: bool,

    /// Cap rows written per materialisation
    #[arg(long, value_name = "N")]
    table_write_limit: Option<u64>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    conf: Option<PathBuf>,

    /// Named run from the configuration file
    #[arg(long, value_name = "NAME")]
    run: Option<String>,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Info logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print full error chains on failure
    #[arg(short = 'i', long)]
    interactive: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let interactive = cli.interactive;

    setup_logging(cli.debug, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if interactive {
                eprintln!("{}", err.format_detailed());
            } else {
                eprintln!("Error: {err}");
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn setup_logging(debug: bool, verbose: bool) {
    let level = if debug {
        Level::DEBUG
    } else if verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

/// The two sides of a diff, after target and config resolution.
struct Targets {
    uri1: String,
    table1: String,
    uri2: String,
    table2: String,
}

async fn run(cli: Cli) -> Result<(), DiffError> {
    let config = match &cli.conf {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let run_config = match &cli.run {
        Some(name) => config.resolve_run(name)?,
        None => RunConfig::default(),
    };

    let targets = resolve_targets(&cli, &config, &run_config)?;
    let options = build_options(&cli, &run_config)?;
    let threads = cli.threads.or(run_config.threads).unwrap_or(1);

    // One shared connection handle when both sides address the same URI,
    // so the same-database fast path applies.
    let db1 = connect(&targets.uri1, threads).await?;
    let db2: Arc<Database> = if targets.uri1 == targets.uri2 {
        Arc::clone(&db1)
    } else {
        connect(&targets.uri2, threads).await?
    };

    let key_refs: Vec<&str> = options.key_columns.iter().map(String::as_str).collect();
    let left = table_segment(db1, &targets.table1, &key_refs)?;
    let right = table_segment(db2, &targets.table2, &key_refs)?;

    let mut diff = rowdiff::diff_tables(left, right, options).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut found = 0u64;
    loop {
        tokio::select! {
            record = diff.next() => match record {
                Some(Ok(record)) => {
                    write_record(&mut out, &record, cli.json)?;
                    found += 1;
                }
                Some(Err(err)) => {
                    diff.close().await;
                    return Err(err);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted, cancelling outstanding queries");
                diff.close().await;
                return Err(DiffError::Cancelled);
            }
        }
    }
    out.flush()?;

    if cli.stats {
        let stats = diff.stats().await?;
        if cli.json {
            println!("{}", serde_json::to_string(&stats.to_json())?);
        } else {
            print!("{}", stats.summary());
        }
    } else {
        debug!("{found} diff records written");
    }

    diff.close().await;
    Ok(())
}

fn resolve_targets(
    cli: &Cli,
    config: &ConfigFile,
    run_config: &RunConfig,
) -> Result<Targets, DiffError> {
    let (db1, table1, db2, table2) = match cli.targets.as_slice() {
        [db1, table1, db2, table2] => {
            (db1.clone(), table1.clone(), db2.clone(), table2.clone())
        }
        [db, table1, table2] => (db.clone(), table1.clone(), db.clone(), table2.clone()),
        [] => {
            let side = |side: &Option<rowdiff::config::SideConfig>, which: &str| {
                let side = side.as_ref().ok_or_else(|| {
                    DiffError::config(format!("run is missing section {which}"))
                })?;
                match (&side.database, &side.table) {
                    (Some(db), Some(table)) => Ok((db.clone(), table.clone())),
                    _ => Err(DiffError::config(format!(
                        "run section {which} needs both database and table"
                    ))),
                }
            };
            let (db1, table1) = side(&run_config.side1, "1")?;
            let (db2, table2) = side(&run_config.side2, "2")?;
            (db1, table1, db2, table2)
        }
        other => {
            return Err(DiffError::config(format!(
                "expected 'DB1 TABLE1 DB2 TABLE2' or 'DB TABLE1 TABLE2' (got {} arguments)",
                other.len()
            )))
        }
    };

    Ok(Targets {
        uri1: config.resolve_database(&db1)?,
        table1,
        uri2: config.resolve_database(&db2)?,
        table2,
    })
}

fn build_options(cli: &Cli, run_config: &RunConfig) -> Result<DiffOptions, DiffError> {
    let defaults = DiffOptions::default();

    let key_columns = if !cli.key_columns.is_empty() {
        cli.key_columns.clone()
    } else {
        run_config
            .key_columns
            .clone()
            .unwrap_or_else(|| defaults.key_columns.clone())
    };
    let algorithm = match cli.algorithm.as_ref().or(run_config.algorithm.as_ref()) {
        Some(name) => name.parse::<Algorithm>()?,
        None => Algorithm::Auto,
    };
    let min_age = cli
        .min_age
        .as_ref()
        .or(run_config.min_age.as_ref())
        .map(|age| parse_duration(age))
        .transpose()?;
    let max_age = cli
        .max_age
        .as_ref()
        .or(run_config.max_age.as_ref())
        .map(|age| parse_duration(age))
        .transpose()?;

    Ok(DiffOptions {
        key_columns,
        update_column: cli
            .update_column
            .clone()
            .or(run_config.update_column.clone()),
        extra_columns: if !cli.columns.is_empty() {
            cli.columns.clone()
        } else {
            run_config.columns.clone().unwrap_or_default()
        },
        min_age,
        max_age,
        where_clause: cli
            .where_clause
            .clone()
            .or(run_config.where_clause.clone()),
        algorithm,
        bisection_factor: cli
            .bisection_factor
            .or(run_config.bisection_factor)
            .unwrap_or(defaults.bisection_factor),
        bisection_threshold: cli
            .bisection_threshold
            .or(run_config.bisection_threshold)
            .unwrap_or(defaults.bisection_threshold),
        limit: cli.limit.or(run_config.limit),
        assume_unique_key: cli.assume_unique_key
            || run_config.assume_unique_key.unwrap_or(false),
        allow_empty_tables: cli.allow_empty_tables
            || run_config.allow_empty_tables.unwrap_or(false),
        case_sensitive: run_config.case_sensitive.unwrap_or(true),
        materialize: cli.materialize.clone().or(run_config.materialize.clone()),
        materialize_all_rows: cli.materialize_all_rows
            || run_config.materialize_all_rows.unwrap_or(false),
        sample_exclusive_rows: cli.sample_exclusive_rows
            || run_config.sample_exclusive_rows.unwrap_or(false),
        table_write_limit: cli.table_write_limit.or(run_config.table_write_limit),
        ..defaults
    })
}

fn write_record(
    out: &mut impl Write,
    record: &DiffRecord,
    json: bool,
) -> Result<(), DiffError> {
    if json {
        let row: Vec<serde_json::Value> = record
            .row
            .iter()
            .map(|cell| match cell {
                Some(text) => serde_json::Value::String(text.clone()),
                None => serde_json::Value::Null,
            })
            .collect();
        let line = serde_json::json!({
            "sign": record.sign.to_string(),
            "row": row,
        });
        writeln!(out, "{line}")?;
    } else {
        let sign = match record.sign {
            Sign::Minus => '-',
            Sign::Plus => '+',
        };
        let cells: Vec<&str> = record
            .row
            .iter()
            .map(|cell| cell.as_deref().unwrap_or(""))
            .collect();
        writeln!(out, "{sign}\t{}", cells.join("\t"))?;
    }
    Ok(())
}
