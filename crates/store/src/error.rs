// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("row not found")]
    RowNotFound,
    #[error("sqlx")]
    Sqlx(#[source] sqlx::Error),
    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("duplicate (key, slot): {0}/{1} slot {2:?}")]
    DuplicateKeySlot(String, String, Option<String>),
    #[error("atom parse error")]
    Atom(#[from] atom::ParseError),
    #[error("dependency parse error")]
    Dependency(#[from] atom::DependencyParseError),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Error::RowNotFound,
            error => Error::Sqlx(error),
        }
    }
}
