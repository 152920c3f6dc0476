use bitcoin::address::NetworkUnchecked;
use bitcoin::key::{TweakedPublicKey, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootSpendInfo};
use bitcoin::{Address, Network, ScriptBuf};

use crate::action::ActionTag;
use crate::error::{CustodyError, Result};
use crate::keyring::SignerPair;
use crate::tree::{LeafAuthority, ScriptTree, TreeLeaf};

/// Turns `(internal key, tree)` into Taproot outputs on one network.
#[derive(Debug, Clone, Copy)]
pub struct AddressDeriver {
    network: Network,
}

impl AddressDeriver {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    /// Deriver for a deployment. Custody runs on test networks only.
    pub fn for_deployment(network: Network) -> Result<Self> {
        match network {
            Network::Testnet | Network::Signet | Network::Regtest => Ok(Self::new(network)),
            other => Err(CustodyError::UnsupportedNetwork {
                requested: other,
                expected: "testnet, signet or regtest".to_string(),
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn derive_address(
        &self,
        internal_key: XOnlyPublicKey,
        tree: &ScriptTree,
        network: Network,
    ) -> Result<CustodyAddress> {
        if network != self.network {
            return Err(CustodyError::UnsupportedNetwork {
                requested: network,
                expected: self.network.to_string(),
            });
        }
        self.derive(internal_key, tree)
    }

    /// Derive on the configured network.
    pub fn derive(&self, internal_key: XOnlyPublicKey, tree: &ScriptTree) -> Result<CustodyAddress> {
        let spend_info = tree.finalize(internal_key)?;
        let address = Address::p2tr_tweaked(spend_info.output_key(), self.network);

        Ok(CustodyAddress {
            internal_key,
            tree: tree.clone(),
            spend_info,
            address,
        })
    }

    /// Parse a caller supplied address and require it to be on our network.
    pub fn parse_address(&self, address: &str) -> Result<Address> {
        let unchecked = address
            .trim()
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| CustodyError::validation(format!("invalid address '{}': {}", address, e)))?;
        unchecked.require_network(self.network).map_err(|e| {
            CustodyError::validation(format!("address '{}' rejected: {}", address, e))
        })
    }
}

/// A Taproot output together with everything needed to spend its leaves.
#[derive(Debug, Clone)]
pub struct CustodyAddress {
    internal_key: XOnlyPublicKey,
    tree: ScriptTree,
    spend_info: TaprootSpendInfo,
    address: Address,
}

impl CustodyAddress {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.internal_key
    }

    pub fn output_key(&self) -> TweakedPublicKey {
        self.spend_info.output_key()
    }

    pub fn merkle_root(&self) -> Option<TapNodeHash> {
        self.spend_info.merkle_root()
    }

    pub fn tree(&self) -> &ScriptTree {
        &self.tree
    }

    pub fn control_block(&self, script: &ScriptBuf) -> Result<ControlBlock> {
        self.spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| CustodyError::Taproot("leaf is not part of this tree".to_string()))
    }

    /// Spend data for the quorum leaf `(tag, pair)`.
    pub fn quorum_leaf(&self, tag: &ActionTag, pair: SignerPair) -> Result<LeafSpend> {
        let leaf = self.tree.quorum_leaf(tag, pair)?;
        self.leaf_spend(leaf)
    }

    /// Spend data for the untagged 2-of-2 leaf of `pair`.
    pub fn plain_leaf(&self, pair: SignerPair) -> Result<LeafSpend> {
        let leaf = self.tree.plain_leaf(pair)?;
        self.leaf_spend(leaf)
    }

    /// Spend data for the tree's only leaf.
    pub fn sole_leaf(&self) -> Result<LeafSpend> {
        match self.tree.leaves() {
            [leaf] => self.leaf_spend(leaf),
            leaves => Err(CustodyError::Taproot(format!(
                "expected a single-leaf tree, found {} leaves",
                leaves.len()
            ))),
        }
    }

    fn leaf_spend(&self, leaf: &TreeLeaf) -> Result<LeafSpend> {
        Ok(LeafSpend {
            script: leaf.script.clone(),
            control_block: self.control_block(&leaf.script)?,
            leaf_hash: TapLeafHash::from_script(&leaf.script, LeafVersion::TapScript),
            authority: leaf.authority.clone(),
            internal_key: self.internal_key,
            merkle_root: self.merkle_root(),
        })
    }
}

/// Everything a PSBT input needs to spend one leaf.
#[derive(Debug, Clone)]
pub struct LeafSpend {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
    pub leaf_hash: TapLeafHash,
    pub authority: LeafAuthority,
    pub internal_key: XOnlyPublicKey,
    pub merkle_root: Option<TapNodeHash>,
}
