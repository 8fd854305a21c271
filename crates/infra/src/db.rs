//! Postgres pool setup, schema migration and sqlx error classification.
//!
//! ## Error mapping
//!
//! | sqlx error | code | [`SqlFailure`] |
//! |------------|------|----------------|
//! | Database (unique violation) | `23505` | `Unique` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `Integrity` |
//! | Database (other), PoolClosed, RowNotFound, IO | any | `Other` |

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_stockline.sql");

/// Open a pool against `DATABASE_URL`.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
}

/// Apply the bundled schema. Every statement is idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema is up to date");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqlFailure {
    Unique(String),
    Integrity(String),
    Other(String),
}

impl SqlFailure {
    pub(crate) fn message(self) -> String {
        match self {
            SqlFailure::Unique(m) | SqlFailure::Integrity(m) | SqlFailure::Other(m) => m,
        }
    }
}

pub(crate) fn classify(operation: &str, err: sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SqlFailure::Unique(msg),
                Some("23503") | Some("23514") => SqlFailure::Integrity(msg),
                _ => SqlFailure::Other(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            SqlFailure::Other(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            SqlFailure::Other(format!("unexpected row not found in {}", operation))
        }
        other => SqlFailure::Other(format!("sqlx error in {}: {}", operation, other)),
    }
}
