//! Changeset checksums.
//!
//! A checksum is the lowercase hex SHA-256 of a changeset's forward
//! statements with whitespace normalised, so reformatting SQL does not
//! register as a content change while any token change does.

use sha2::{Digest, Sha256};

/// Computes the checksum of a sequence of statements.
pub fn compute<'a>(statements: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for statement in statements {
        hasher.update(normalize(statement).as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn normalize(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}
