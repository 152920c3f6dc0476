//! Taproot script trees for custody addresses.

use bitcoin::consensus::serialize;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::OP_CHECKSIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::taproot::{LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::ScriptBuf;

use crate::action::ActionTag;
use crate::error::{CustodyError, Result};
use crate::keyring::{CustodianKeySet, SignerPair};
use crate::leaf::{build_action_leaf, build_quorum_leaf, push_envelope};

/// Which custody address a tree is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeVariant {
    /// BTC collateral
    Base,
    /// BRC-20 collateral
    Brc20,
}

impl TreeVariant {
    pub fn actions(self) -> [ActionTag; 3] {
        match self {
            TreeVariant::Base | TreeVariant::Brc20 => ActionTag::QUORUM_ACTIONS,
        }
    }
}

/// Who has to sign to spend a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafAuthority {
    Quorum(SignerPair),
    /// Single key held by the depositor's wallet
    User(XOnlyPublicKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLeaf {
    pub depth: u8,
    /// `None` for a bare 2-of-2 leaf
    pub tag: Option<ActionTag>,
    pub authority: LeafAuthority,
    pub script: ScriptBuf,
}

/// Leaves in depth-first order, ready to be committed to an internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTree {
    leaves: Vec<TreeLeaf>,
}

impl ScriptTree {
    pub fn leaves(&self) -> &[TreeLeaf] {
        &self.leaves
    }

    pub fn find(&self, tag: Option<&ActionTag>, authority: &LeafAuthority) -> Option<&TreeLeaf> {
        self.leaves
            .iter()
            .find(|leaf| leaf.tag.as_ref() == tag && &leaf.authority == authority)
    }

    pub fn quorum_leaf(&self, tag: &ActionTag, pair: SignerPair) -> Result<&TreeLeaf> {
        self.find(Some(tag), &LeafAuthority::Quorum(pair)).ok_or_else(|| {
            CustodyError::Taproot(format!("no {} leaf for signer pair {}", tag, pair))
        })
    }

    pub fn plain_leaf(&self, pair: SignerPair) -> Result<&TreeLeaf> {
        self.find(None, &LeafAuthority::Quorum(pair))
            .ok_or_else(|| CustodyError::Taproot(format!("no plain leaf for signer pair {}", pair)))
    }

    /// Tree with a single quorum leaf carrying `tag`.
    pub fn single_quorum(keys: &CustodianKeySet, pair: SignerPair, tag: ActionTag) -> Result<Self> {
        let script = build_action_leaf(&keys.x_only(pair.first()), &keys.x_only(pair.second()), &tag)?;
        Ok(ScriptTree {
            leaves: vec![TreeLeaf {
                depth: 0,
                tag: Some(tag),
                authority: LeafAuthority::Quorum(pair),
                script,
            }],
        })
    }

    /// `<user> OP_CHECKSIG <envelope(tag)>`, spendable by the user alone.
    pub fn single_user(user_key: XOnlyPublicKey, tag: ActionTag) -> Result<Self> {
        let builder = Builder::new()
            .push_x_only_key(&user_key)
            .push_opcode(OP_CHECKSIG);
        let script = push_envelope(builder, &tag)?.into_script();
        Ok(ScriptTree {
            leaves: vec![TreeLeaf {
                depth: 0,
                tag: Some(tag),
                authority: LeafAuthority::User(user_key),
                script,
            }],
        })
    }

    /// Commit the tree to `internal_key`.
    pub fn finalize(&self, internal_key: XOnlyPublicKey) -> Result<TaprootSpendInfo> {
        let secp = Secp256k1::verification_only();
        let mut builder = TaprootBuilder::new();
        for leaf in &self.leaves {
            builder = builder
                .add_leaf(leaf.depth, leaf.script.clone())
                .map_err(|e| CustodyError::Taproot(e.to_string()))?;
        }
        builder
            .finalize(&secp, internal_key)
            .map_err(|_| CustodyError::Taproot("script tree is incomplete".to_string()))
    }

    /// `depth || leaf_version || compact_size(script) || script` per leaf.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for leaf in &self.leaves {
            out.push(leaf.depth);
            out.push(LeafVersion::TapScript.to_consensus());
            out.extend(serialize(&leaf.script));
        }
        out
    }
}

/// Leaf depths of the canonical shape, in depth-first order:
/// eight leaves under one depth-1 branch, then the last leaf at depth 1.
const CANONICAL_DEPTHS: [u8; 9] = [4, 4, 4, 4, 4, 4, 4, 4, 1];

/// Build the custody tree: every custodian pair crossed with every action,
/// grouped by action and ordered by pair.
pub fn assemble_tree(keys: &CustodianKeySet, variant: TreeVariant) -> Result<ScriptTree> {
    let mut leaves = Vec::with_capacity(CANONICAL_DEPTHS.len());
    let combinations = variant
        .actions()
        .into_iter()
        .flat_map(|tag| SignerPair::ALL.map(|pair| (tag.clone(), pair)));

    for ((tag, pair), depth) in combinations.zip(CANONICAL_DEPTHS) {
        let script =
            build_action_leaf(&keys.x_only(pair.first()), &keys.x_only(pair.second()), &tag)?;
        leaves.push(TreeLeaf {
            depth,
            tag: Some(tag),
            authority: LeafAuthority::Quorum(pair),
            script,
        });
    }

    Ok(ScriptTree { leaves })
}

/// Untagged 2-of-2 leaves of the BTC deposit tree, depth-first:
/// `(0,2)` and `(1,2)` share a branch, `(0,1)` sits beside it.
const DEPOSIT_LAYOUT: [(SignerPair, u8); 3] = [
    (SignerPair::ALL[1], 2),
    (SignerPair::ALL[2], 2),
    (SignerPair::ALL[0], 1),
];

/// Tree behind per-user BTC deposit addresses. It has no tagged leaves,
/// so nothing inscribed can ever land on it by way of a custody spend.
pub fn assemble_deposit_tree(keys: &CustodianKeySet) -> ScriptTree {
    let leaves = DEPOSIT_LAYOUT
        .iter()
        .map(|&(pair, depth)| TreeLeaf {
            depth,
            tag: None,
            authority: LeafAuthority::Quorum(pair),
            script: build_quorum_leaf(&keys.x_only(pair.first()), &keys.x_only(pair.second())),
        })
        .collect();
    ScriptTree { leaves }
}
