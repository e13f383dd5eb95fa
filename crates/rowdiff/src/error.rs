//! Error types for the diffing library.

use thiserror::Error;

/// Main error type for diff operations.
#[derive(Error, Debug)]
pub enum DiffError {
    /// Configuration error (bad URI, unknown driver, conflicting flags, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The two tables' schemas cannot be compared.
    #[error("Schema incompatibility: {0}")]
    Schema(String),

    /// A key column is not unique on one side.
    #[error("Key is not unique in {table}: {total} rows, {distinct} distinct keys. \
             Pass --assume-unique-key to skip this check at your own risk.")]
    UniqueKey {
        table: String,
        total: i64,
        distinct: i64,
    },

    /// A table turned out to be empty and --allow-empty-tables was not set.
    #[error("Table {0} is empty. Use --allow-empty-tables to diff against an empty table.")]
    EmptyTable(String),

    /// A query failed mid-diff. Carries a rendered message so it can cross
    /// worker channels and be replayed by the result iterator.
    #[error("Query error: {0}")]
    Query(String),

    /// Numeric value outside the range the diff can represent.
    #[error("Overflow: {0}")]
    Overflow(String),

    /// PostgreSQL driver error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error.
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    Mysql(#[from] sqlx::Error),

    /// DuckDB driver error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// IO error (config file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML configuration parse error.
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The diff was cancelled (iterator closed, limit reached, SIGINT).
    #[error("Diff cancelled")]
    Cancelled,
}

impl DiffError {
    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        DiffError::Config(message.into())
    }

    /// Create a Schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        DiffError::Schema(message.into())
    }

    /// Create a Query error.
    pub fn query(message: impl Into<String>) -> Self {
        DiffError::Query(message.into())
    }

    /// Whether this error is the expected result of cancellation rather
    /// than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DiffError::Cancelled)
    }

    /// Clone the error for idempotent replay by the result iterator.
    ///
    /// Driver errors are not `Clone`, so they degrade to a rendered
    /// `Query` message; structural variants keep their shape.
    pub fn clone_for_replay(&self) -> DiffError {
        match self {
            DiffError::Config(m) => DiffError::Config(m.clone()),
            DiffError::Schema(m) => DiffError::Schema(m.clone()),
            DiffError::UniqueKey {
                table,
                total,
                distinct,
            } => DiffError::UniqueKey {
                table: table.clone(),
                total: *total,
                distinct: *distinct,
            },
            DiffError::EmptyTable(m) => DiffError::EmptyTable(m.clone()),
            DiffError::Query(m) => DiffError::Query(m.clone()),
            DiffError::Overflow(m) => DiffError::Overflow(m.clone()),
            DiffError::Cancelled => DiffError::Cancelled,
            other => DiffError::Query(other.to_string()),
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\n\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for this error.
    ///
    /// Configuration problems exit 2 (usage error), everything else 1.
    /// Diffs being found is not an error; success always exits 0.
    pub fn exit_code(&self) -> u8 {
        match self {
            DiffError::Config(_) | DiffError::Toml(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for diff operations.
pub type Result<T> = std::result::Result<T, DiffError>;
