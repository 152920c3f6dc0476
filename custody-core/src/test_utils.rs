//! Shared fixtures for unit tests.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::keyring::CustodianKeySet;

/// BIP32 test vector 1 seed
pub const TEST_SEED: &str = "000102030405060708090a0b0c0d0e0f";

/// secp256k1 generator point, a valid compressed key nobody should deposit to
pub const GENERATOR: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

pub fn test_keys() -> CustodianKeySet {
    CustodianKeySet::from_seed_hex(TEST_SEED).unwrap()
}

/// Compressed pubkey hex for the secret `[secret_byte; 32]`
pub fn user_pubkey_hex(secret_byte: u8) -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[secret_byte; 32]).unwrap();
    PublicKey::from_secret_key(&secp, &sk).to_string()
}
