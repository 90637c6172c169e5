use crate::db::schema::SchemaVersion;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Creation against a non-empty database, an unknown revision, or a
    /// required table that is missing.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The `version` table or a singleton table does not hold exactly one
    /// row, or a table no longer has the shape of its revision.
    #[error("Corrupt schema: {0}")]
    CorruptSchema(String),

    #[error("Migration from version {from} to {to} failed: {reason}")]
    Migration {
        from: SchemaVersion,
        to: SchemaVersion,
        reason: String,
    },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("URL already recorded: {0}")]
    DuplicateUrl(String),

    #[error("Database lock poisoned")]
    Poisoned,

    #[error("Blocking task failed: {0}")]
    Task(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Maps SQLite constraint failures onto the typed variants callers match on.
pub(crate) fn classify_constraint(err: rusqlite::Error, context: impl Into<String>) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return StoreError::ForeignKeyViolation(context.into());
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return StoreError::DuplicateUrl(context.into());
            }
            _ => {}
        }
    }
    StoreError::Sqlite(err)
}
