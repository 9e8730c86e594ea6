//! Identifier minting for channels and users
//!
//! Ids are opaque, unique within the process lifetime, and carry no
//! ordering. Everything that needs an identity asks here.

use uuid::Uuid;

/// Mint a fresh identifier.
pub fn fresh_id() -> Uuid {
    Uuid::new_v4()
}
