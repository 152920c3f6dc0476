//! Custodian key material.
//!
//! The three quorum keys are BIP32 children `m/0`, `m/1`, `m/2` of a single
//! master seed. The master key itself is the internal key of the protocol
//! address and the scalar used to give every user a distinct internal key.

use std::fmt;

use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::key::{Keypair, XOnlyPublicKey};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::NetworkKind;

use crate::error::{CustodyError, Result};

/// One of the three quorum members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Custodian {
    K0,
    K1,
    K2,
}

impl Custodian {
    pub const ALL: [Custodian; 3] = [Custodian::K0, Custodian::K1, Custodian::K2];

    /// BIP32 child index of this custodian's key
    pub fn index(self) -> u32 {
        match self {
            Custodian::K0 => 0,
            Custodian::K1 => 1,
            Custodian::K2 => 2,
        }
    }
}

impl fmt::Display for Custodian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.index())
    }
}

/// An unordered custodian pair, stored lowest index first.
///
/// The first key is checked by `OP_CHECKSIGVERIFY` and signs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignerPair {
    first: Custodian,
    second: Custodian,
}

impl SignerPair {
    pub const ALL: [SignerPair; 3] = [
        SignerPair { first: Custodian::K0, second: Custodian::K1 },
        SignerPair { first: Custodian::K0, second: Custodian::K2 },
        SignerPair { first: Custodian::K1, second: Custodian::K2 },
    ];

    /// Pair used by every server-signed flow.
    pub const ACTIVE: SignerPair = SignerPair::ALL[0];

    pub fn new(a: Custodian, b: Custodian) -> Result<Self> {
        if a == b {
            return Err(CustodyError::validation(format!(
                "signer pair needs two distinct custodians, got {} twice",
                a
            )));
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Ok(SignerPair { first, second })
    }

    pub fn first(&self) -> Custodian {
        self.first
    }

    pub fn second(&self) -> Custodian {
        self.second
    }

    /// Roles in the order they must sign.
    pub fn signing_order(&self) -> [Custodian; 2] {
        [self.first, self.second]
    }
}

impl fmt::Display for SignerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.first.index(), self.second.index())
    }
}

/// Immutable key set shared by every request.
#[derive(Clone)]
pub struct CustodianKeySet {
    master: Keypair,
    custodians: [Keypair; 3],
}

impl CustodianKeySet {
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let seed = hex::decode(seed_hex.trim())
            .map_err(|e| CustodyError::InvalidSeed(format!("seed is not hex: {}", e)))?;
        derive_custodian_keys(&seed)
    }

    pub fn keypair(&self, custodian: Custodian) -> &Keypair {
        &self.custodians[custodian.index() as usize]
    }

    pub fn x_only(&self, custodian: Custodian) -> XOnlyPublicKey {
        self.keypair(custodian).x_only_public_key().0
    }

    /// Internal key of the protocol (pooled collateral) address
    pub fn master_x_only(&self) -> XOnlyPublicKey {
        self.master.x_only_public_key().0
    }

    pub fn master_pubkey(&self) -> PublicKey {
        self.master.public_key()
    }

    pub fn user_internal_key(&self, user_pubkey_hex: &str) -> Result<XOnlyPublicKey> {
        derive_user_internal_key(user_pubkey_hex, &self.master.secret_key())
    }
}

impl fmt::Debug for CustodianKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodianKeySet")
            .field("master", &self.master_x_only())
            .field(
                "custodians",
                &Custodian::ALL.map(|c| self.x_only(c).to_string()),
            )
            .finish()
    }
}

/// Derive the master key and the three custodian keys from a BIP32 seed.
pub fn derive_custodian_keys(seed: &[u8]) -> Result<CustodianKeySet> {
    if seed.is_empty() {
        return Err(CustodyError::InvalidSeed("seed is empty".to_string()));
    }
    if !(16..=64).contains(&seed.len()) {
        return Err(CustodyError::InvalidSeed(format!(
            "seed must be 16 to 64 bytes, got {}",
            seed.len()
        )));
    }

    let secp = Secp256k1::new();
    let master_xprv = Xpriv::new_master(NetworkKind::Test, seed)?;
    let master = Keypair::from_secret_key(&secp, &master_xprv.private_key);

    let derive = |custodian: Custodian| -> Result<Keypair> {
        let child = ChildNumber::from_normal_idx(custodian.index())?;
        let xprv = master_xprv.derive_priv(&secp, &[child])?;
        Ok(Keypair::from_secret_key(&secp, &xprv.private_key))
    };

    Ok(CustodianKeySet {
        master,
        custodians: [
            derive(Custodian::K0)?,
            derive(Custodian::K1)?,
            derive(Custodian::K2)?,
        ],
    })
}

/// Per-user internal key.
///
/// The user's point is multiplied by the master scalar; the x-coordinate of
/// the product is then used as a secret scalar whose BIP340 public key is the
/// internal key.
pub fn derive_user_internal_key(
    user_pubkey_hex: &str,
    master_secret: &SecretKey,
) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(user_pubkey_hex.trim())
        .map_err(|e| CustodyError::InvalidPublicKey(format!("not hex: {}", e)))?;
    let user_point = PublicKey::from_slice(&bytes)
        .map_err(|e| CustodyError::InvalidPublicKey(e.to_string()))?;

    shared_point_to_internal_key(user_point, master_secret)
}

/// The same internal key computed on the user's side.
///
/// `userPub * master == masterPub * user`, so a wallet holding its own secret
/// and the protocol's public key can recompute (and audit) its custody
/// address without any custodian secret.
pub fn user_side_internal_key(
    user_secret: &SecretKey,
    master_pubkey: &PublicKey,
) -> Result<XOnlyPublicKey> {
    shared_point_to_internal_key(*master_pubkey, user_secret)
}

fn shared_point_to_internal_key(point: PublicKey, scalar: &SecretKey) -> Result<XOnlyPublicKey> {
    let secp = Secp256k1::new();
    let shared = point
        .mul_tweak(&secp, &Scalar::from(*scalar))
        .map_err(|e| CustodyError::InvalidPublicKey(e.to_string()))?;

    let shared_x = SecretKey::from_slice(&shared.serialize()[1..33])
        .map_err(|e| CustodyError::InvalidPublicKey(e.to_string()))?;
    let (internal_key, _parity) = Keypair::from_secret_key(&secp, &shared_x).x_only_public_key();

    Ok(internal_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{user_pubkey_hex, GENERATOR, TEST_SEED};

    #[test]
    fn test_same_seed_same_keys() {
        let a = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        let b = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();

        for custodian in Custodian::ALL {
            assert_eq!(a.x_only(custodian), b.x_only(custodian));
        }
        assert_eq!(a.master_x_only(), b.master_x_only());
    }

    #[test]
    fn test_custodian_keys_are_distinct() {
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        let k0 = keys.x_only(Custodian::K0);
        let k1 = keys.x_only(Custodian::K1);
        let k2 = keys.x_only(Custodian::K2);

        assert_ne!(k0, k1);
        assert_ne!(k1, k2);
        assert_ne!(k0, k2);
        assert_ne!(k0, keys.master_x_only());
    }

    #[test]
    fn test_bip32_test_vector_master() {
        // BIP32 test vector 1: m has pubkey 0339a36013301597daef41fbe593a02cc513d0b55527ec2df1050e2e8ff49c85c2
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        assert_eq!(
            keys.master_x_only().to_string(),
            "39a36013301597daef41fbe593a02cc513d0b55527ec2df1050e2e8ff49c85c2"
        );
    }

    #[test]
    fn test_malformed_seed_rejected() {
        assert!(matches!(
            derive_custodian_keys(&[]),
            Err(CustodyError::InvalidSeed(_))
        ));
        assert!(matches!(
            derive_custodian_keys(&[7u8; 8]),
            Err(CustodyError::InvalidSeed(_))
        ));
        assert!(matches!(
            CustodianKeySet::from_seed_hex("not-hex"),
            Err(CustodyError::InvalidSeed(_))
        ));
    }

    #[test]
    fn test_user_internal_key_deterministic() {
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        let first = keys.user_internal_key(GENERATOR).unwrap();
        let second = keys.user_internal_key(GENERATOR).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_users_distinct_internal_keys() {
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        let alice = keys.user_internal_key(&user_pubkey_hex(2)).unwrap();
        let bob = keys.user_internal_key(&user_pubkey_hex(3)).unwrap();
        assert_ne!(alice, bob);
    }

    #[test]
    fn test_user_can_recompute_internal_key() {
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        let user_secret = SecretKey::from_slice(&[2u8; 32]).unwrap();

        let server_side = keys.user_internal_key(&user_pubkey_hex(2)).unwrap();
        let user_side = user_side_internal_key(&user_secret, &keys.master_pubkey()).unwrap();
        assert_eq!(server_side, user_side);
    }

    #[test]
    fn test_uncompressed_user_key_matches_compressed() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();

        let compressed = keys.user_internal_key(&hex::encode(pk.serialize())).unwrap();
        let uncompressed = keys
            .user_internal_key(&hex::encode(pk.serialize_uncompressed()))
            .unwrap();
        assert_eq!(compressed, uncompressed);
    }

    #[test]
    fn test_signer_pair_order() {
        let pair = SignerPair::new(Custodian::K2, Custodian::K0).unwrap();
        assert_eq!(pair.signing_order(), [Custodian::K0, Custodian::K2]);
        assert_eq!(pair.to_string(), "(0,2)");
        assert_eq!(
            SignerPair::ACTIVE.signing_order(),
            [Custodian::K0, Custodian::K1]
        );
        assert!(SignerPair::new(Custodian::K1, Custodian::K1).is_err());
    }

    #[test]
    fn test_invalid_user_key_rejected() {
        let keys = CustodianKeySet::from_seed_hex(TEST_SEED).unwrap();
        let zeros = "00".repeat(33);
        for bad in ["", "zz", "02deadbeef", zeros.as_str()] {
            assert!(matches!(
                keys.user_internal_key(bad),
                Err(CustodyError::InvalidPublicKey(_))
            ));
        }
    }
}
