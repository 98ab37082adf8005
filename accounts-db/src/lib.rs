//! The sable account storage engine: a content-addressed, append-only
//! account database with a sharded in-memory index, a write-back cache,
//! mmap'd account files, a background flush/clean/shrink/delete lifecycle,
//! and a parallel snapshot load/generate pipeline.

pub mod account_storage;
pub mod accounts_background_service;
pub mod accounts_cache;
pub mod accounts_db;
pub mod accounts_hash;
pub mod accounts_index;
pub mod append_vec;
pub mod disk_allocator;
pub mod hardened_unpack;
pub mod pubkey_bins;
pub mod pubkey_map;
pub mod serde_snapshot;
pub mod snapshot_utils;
