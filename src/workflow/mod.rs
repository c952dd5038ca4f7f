//! Domain operations over a pooled connection. Every multi-row change runs in
//! one transaction; storage constraints back each "at most" rule.

pub mod accounts;
pub mod applications;
pub mod calls;
pub mod invites;
pub mod reviews;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rand::{rngs::OsRng, RngCore};

/// Name of the violated unique constraint, when `err` is one.
pub(crate) fn unique_violation(err: &DieselError) -> Option<&str> {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            Some(info.constraint_name().unwrap_or_default())
        }
        _ => None,
    }
}

/// 32 random bytes, hex encoded.
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
