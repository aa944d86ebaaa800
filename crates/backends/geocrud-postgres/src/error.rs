//! Driver error translation.

use geocrud_core_common::{DbError, DbErrorKind};

/// Category of an SQLSTATE code, by its two-character class.
///
/// ```
/// use geocrud_core_common::DbErrorKind;
/// use geocrud_postgres::error::kind_for_sqlstate;
///
/// assert_eq!(kind_for_sqlstate("23505"), DbErrorKind::Integrity);
/// assert_eq!(kind_for_sqlstate("XX000"), DbErrorKind::Internal);
/// ```
#[must_use]
pub fn kind_for_sqlstate(code: &str) -> DbErrorKind {
    match code.get(..2) {
        Some("22") => DbErrorKind::Data,
        Some("23") => DbErrorKind::Integrity,
        Some("XX") => DbErrorKind::Internal,
        Some("42") => DbErrorKind::Programming,
        Some("08") => DbErrorKind::Connection,
        _ => DbErrorKind::Other,
    }
}

/// Converts a driver error, keeping the server's message and detail.
pub(crate) fn from_driver(err: &tokio_postgres::Error) -> DbError {
    if let Some(db) = err.as_db_error() {
        let error = DbError::new(kind_for_sqlstate(db.code().code()), db.message());
        return match db.detail() {
            Some(detail) => error.with_detail(detail),
            None => error,
        };
    }
    if err.is_closed() {
        return DbError::new(DbErrorKind::Connection, err.to_string());
    }
    DbError::new(DbErrorKind::Other, err.to_string())
}
