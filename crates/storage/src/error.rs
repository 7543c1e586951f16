use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// Lookup by id matched nothing.
    #[snafu(display("no {entity} with id '{id}' on `{stage}`"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    /// Unique key already taken, e.g. a registered email.
    #[snafu(display("{entity} already exists on `{stage}`: {details}"))]
    Conflict {
        stage: &'static str,
        entity: &'static str,
        details: String,
    },
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("participants must be two distinct users, got '{first}' twice"))]
    InvalidParticipants { stage: &'static str, first: String },
    /// A persisted row does not have the shape this crate writes.
    #[snafu(display("stored row violates an invariant on `{stage}`: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("cannot create database directory {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid database location '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open database '{database_url}': {source}"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot set pragma `{pragma}` on the message database"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("schema migration failed: {source}"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("query failed on `{stage}`: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

impl StorageError {
    /// Stage label of the operation that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::Conflict { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::InvalidParticipants { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqlitePragma { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. } => stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
