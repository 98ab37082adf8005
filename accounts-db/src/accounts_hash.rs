//! Account hashing primitives: the per-account blake3 hash, and the
//! fanout-16 merkle reduction over per-bin, pubkey-sorted hash vectors that
//! produces the snapshot accounts hash and total capitalization.

use {
    rayon::prelude::*,
    sable_sdk::{
        account::Account,
        clock::{Epoch, Slot},
        hash::{Hash, Hasher},
        pubkey::Pubkey,
    },
};

pub const MERKLE_FANOUT: usize = 16;

/// Which account versions participate in a hash computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// For each pubkey, the greatest version at or below `max_slot`;
    /// zero-lamport accounts are skipped entirely.
    Full { max_slot: Slot },
    /// For each pubkey, the greatest version strictly above `min_slot` (and
    /// at or below `max_slot` when packaging bounds the range); zero-lamport
    /// accounts contribute `blake3(pubkey)` so their deletion is part of the
    /// incremental hash.
    Incremental {
        min_slot: Slot,
        max_slot: Option<Slot>,
    },
}

impl HashKind {
    pub fn min_exclusive(&self) -> Option<Slot> {
        match self {
            Self::Full { .. } => None,
            Self::Incremental { min_slot, .. } => Some(*min_slot),
        }
    }

    pub fn max_inclusive(&self) -> Option<Slot> {
        match self {
            Self::Full { max_slot } => Some(*max_slot),
            Self::Incremental { max_slot, .. } => *max_slot,
        }
    }
}

pub fn hash_account(account: &Account, pubkey: &Pubkey) -> Hash {
    hash_account_data(
        account.lamports,
        &account.owner,
        account.executable,
        account.rent_epoch,
        &account.data,
        pubkey,
    )
}

pub fn hash_account_data(
    lamports: u64,
    owner: &Pubkey,
    executable: bool,
    rent_epoch: Epoch,
    data: &[u8],
    pubkey: &Pubkey,
) -> Hash {
    if lamports == 0 {
        return Hash::default();
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(&lamports.to_le_bytes());
    hasher.update(&rent_epoch.to_le_bytes());
    hasher.update(data);
    if executable {
        hasher.update(&[1u8; 1]);
    } else {
        hasher.update(&[0u8; 1]);
    }
    hasher.update(owner.as_ref());
    hasher.update(pubkey.as_ref());

    Hash::new_from_array(hasher.finalize().into())
}

/// The hash a deleted (zero-lamport) account contributes to an incremental
/// accounts hash.
pub fn zero_lamport_contribution(pubkey: &Pubkey) -> Hash {
    Hash::new_from_array(blake3::hash(pubkey.as_ref()).into())
}

pub fn checked_cast_for_capitalization(balance: u128) -> u64 {
    balance
        .try_into()
        .expect("overflow is detected while summing capitalization")
}

/// Reduce `(hash, lamports)` leaves to the merkle root and summed lamports.
/// Each level hashes `fanout`-sized chunks in parallel.
pub fn compute_merkle_root_and_capitalization(
    hashes: Vec<(Hash, u64)>,
    fanout: usize,
) -> (Hash, u64) {
    if hashes.is_empty() {
        return (Hasher::default().result(), 0);
    }

    let total_hashes = hashes.len();
    let chunks = (total_hashes + fanout - 1) / fanout;

    let result: Vec<(Hash, u64)> = (0..chunks)
        .into_par_iter()
        .map(|i| {
            let start_index = i * fanout;
            let end_index = std::cmp::min(start_index + fanout, total_hashes);

            let mut hasher = Hasher::default();
            let mut this_sum = 0u128;
            for (hash, lamports) in &hashes[start_index..end_index] {
                this_sum += *lamports as u128;
                hasher.hash(hash.as_ref());
            }

            (hasher.result(), checked_cast_for_capitalization(this_sum))
        })
        .collect();

    if result.len() == 1 {
        result[0]
    } else {
        compute_merkle_root_and_capitalization(result, fanout)
    }
}

/// Merkle root over bare hashes (the accounts delta hash for one slot).
/// Input order is irrelevant; leaves are sorted by pubkey first.
pub fn compute_delta_hash(mut hashes: Vec<(Pubkey, Hash)>) -> Hash {
    hashes.par_sort_unstable_by(|a, b| a.0.cmp(&b.0));
    let leaves = hashes.into_iter().map(|(_, hash)| (hash, 0)).collect();
    compute_merkle_root_and_capitalization(leaves, MERKLE_FANOUT).0
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn leaf(byte: u8, lamports: u64) -> (Hash, u64) {
        (Hash::new_from_array([byte; 32]), lamports)
    }

    #[test]
    fn test_empty_root() {
        let (root, capitalization) = compute_merkle_root_and_capitalization(vec![], MERKLE_FANOUT);
        assert_eq!(root, Hasher::default().result());
        assert_eq!(capitalization, 0);
    }

    #[test]
    fn test_single_level_matches_manual() {
        let leaves = vec![leaf(1, 10), leaf(2, 20), leaf(3, 12)];
        let (root, capitalization) =
            compute_merkle_root_and_capitalization(leaves.clone(), MERKLE_FANOUT);

        let mut hasher = Hasher::default();
        for (hash, _) in &leaves {
            hasher.hash(hash.as_ref());
        }
        assert_eq!(root, hasher.result());
        assert_eq!(capitalization, 42);
    }

    #[test]
    fn test_two_levels() {
        // 17 leaves with fanout 16 forces a second level of two nodes
        let leaves: Vec<_> = (0..17).map(|i| leaf(i, 1)).collect();
        let (root, capitalization) =
            compute_merkle_root_and_capitalization(leaves.clone(), MERKLE_FANOUT);
        assert_eq!(capitalization, 17);

        let mut left = Hasher::default();
        for (hash, _) in &leaves[..16] {
            left.hash(hash.as_ref());
        }
        let mut right = Hasher::default();
        right.hash(leaves[16].0.as_ref());

        let mut top = Hasher::default();
        top.hash(left.result().as_ref());
        top.hash(right.result().as_ref());
        assert_eq!(root, top.result());
    }

    #[test]
    #[should_panic(expected = "overflow is detected")]
    fn test_capitalization_overflow() {
        checked_cast_for_capitalization(u128::from(u64::MAX) + 1);
    }

    #[test]
    fn test_hash_account_ignores_nothing() {
        let pubkey = Pubkey::new_unique();
        let mut account = Account::new(42, 3, &Pubkey::new_unique());
        let base = hash_account(&account, &pubkey);
        assert_ne!(base, Hash::default());

        // every field participates
        let mut other = account.clone();
        other.lamports = 43;
        assert_ne!(hash_account(&other, &pubkey), base);
        let mut other = account.clone();
        other.data[0] = 1;
        assert_ne!(hash_account(&other, &pubkey), base);
        let mut other = account.clone();
        other.executable = true;
        assert_ne!(hash_account(&other, &pubkey), base);
        let mut other = account.clone();
        other.rent_epoch = 9;
        assert_ne!(hash_account(&other, &pubkey), base);
        let mut other = account.clone();
        other.owner = Pubkey::new_unique();
        assert_ne!(hash_account(&other, &pubkey), base);
        assert_ne!(hash_account(&account, &Pubkey::new_unique()), base);

        // zero lamports hash to the default sentinel
        account.lamports = 0;
        assert_eq!(hash_account(&account, &pubkey), Hash::default());
    }

    #[test]
    fn test_delta_hash_sorts_by_pubkey() {
        let entries: Vec<_> = (0..5u8)
            .map(|i| (Pubkey::new_unique(), Hash::new_from_array([i; 32])))
            .collect();
        let mut shuffled = entries.clone();
        shuffled.reverse();
        assert_eq!(compute_delta_hash(entries), compute_delta_hash(shuffled));
    }
}
