//! Base types shared by every sable service: account state, 32-byte
//! identifiers, and the SHA-256 hash wrapper used for snapshot hashes.

pub mod account;
pub mod clock;
pub mod hash;
pub mod pubkey;
