use {
    serde_derive::{Deserialize, Serialize},
    std::{fmt, mem},
};

/// Number of bytes in a pubkey.
pub const PUBKEY_BYTES: usize = 32;

/// The address of an account.
#[repr(transparent)]
#[derive(
    Serialize, Deserialize, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct Pubkey(pub(crate) [u8; PUBKEY_BYTES]);

impl Pubkey {
    pub const fn new_from_array(pubkey_array: [u8; PUBKEY_BYTES]) -> Self {
        Self(pubkey_array)
    }

    /// unique Pubkey for tests and benchmarks.
    pub fn new_unique() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static I: AtomicU64 = AtomicU64::new(1);

        let mut b = [0u8; PUBKEY_BYTES];
        let i = I.fetch_add(1, Ordering::Relaxed);
        // use big endian representation to ensure that recent unique pubkeys
        // are always greater than less recent unique pubkeys, and spread the
        // low bits across the leading bytes so bin assignment varies in tests
        b[0..8].copy_from_slice(&i.to_be_bytes());
        b[8..16].copy_from_slice(&i.to_le_bytes());
        Self::new_from_array(b)
    }

    pub fn to_bytes(self) -> [u8; PUBKEY_BYTES] {
        self.0
    }
}

impl From<[u8; PUBKEY_BYTES]> for Pubkey {
    fn from(from: [u8; PUBKEY_BYTES]) -> Self {
        Self(from)
    }
}

impl TryFrom<&[u8]> for Pubkey {
    type Error = std::array::TryFromSliceError;

    fn try_from(pubkey: &[u8]) -> Result<Self, Self::Error> {
        <[u8; PUBKEY_BYTES]>::try_from(pubkey).map(Self::from)
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl AsMut<[u8]> for Pubkey {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

const _: () = assert!(mem::size_of::<Pubkey>() == PUBKEY_BYTES);
