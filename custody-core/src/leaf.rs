//! Tapscript leaves: a 2-of-2 signature gate followed by an ordinal
//! inscription envelope that tags the leaf with its protocol action.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_ENDIF, OP_IF};
use bitcoin::opcodes::OP_FALSE;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;

use crate::action::ActionTag;
use crate::error::{CustodyError, Result};

pub const ORD_TAG: [u8; 3] = *b"ord";
pub const CONTENT_TYPE_TAG: [u8; 1] = [0x01];
pub const CONTENT_TYPE: &[u8] = b"text/plain;charset=utf-8";

/// Largest single push allowed by consensus.
const MAX_PUSH: usize = 520;

/// Parse a leaf key given either x-only (32 bytes) or compressed (33 bytes).
pub fn parse_leaf_key(bytes: &[u8]) -> Result<XOnlyPublicKey> {
    match bytes.len() {
        32 => XOnlyPublicKey::from_slice(bytes)
            .map_err(|e| CustodyError::InvalidPublicKey(e.to_string())),
        33 => PublicKey::from_slice(bytes)
            .map(|pk| pk.x_only_public_key().0)
            .map_err(|e| CustodyError::InvalidPublicKey(e.to_string())),
        n => Err(CustodyError::InvalidPublicKey(format!(
            "leaf key must be 32 or 33 bytes, got {}",
            n
        ))),
    }
}

/// `<A> OP_CHECKSIGVERIFY <B> OP_CHECKSIG <envelope(tag)>`
///
/// Spending requires signatures from both keys. The envelope is an
/// `OP_FALSE OP_IF .. OP_ENDIF` block and never executes.
pub fn build_action_leaf(
    key_a: &XOnlyPublicKey,
    key_b: &XOnlyPublicKey,
    tag: &ActionTag,
) -> Result<ScriptBuf> {
    Ok(push_envelope(signature_gate(key_a, key_b), tag)?.into_script())
}

/// `<A> OP_CHECKSIGVERIFY <B> OP_CHECKSIG` with no envelope.
pub fn build_quorum_leaf(key_a: &XOnlyPublicKey, key_b: &XOnlyPublicKey) -> ScriptBuf {
    signature_gate(key_a, key_b).into_script()
}

fn signature_gate(key_a: &XOnlyPublicKey, key_b: &XOnlyPublicKey) -> Builder {
    Builder::new()
        .push_x_only_key(key_a)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_x_only_key(key_b)
        .push_opcode(OP_CHECKSIG)
}

pub(crate) fn push_envelope(builder: Builder, tag: &ActionTag) -> Result<Builder> {
    let payload = tag.payload()?;

    let mut builder = builder
        .push_opcode(OP_FALSE)
        .push_opcode(OP_IF)
        .push_slice(PushBytesBuf::try_from(ORD_TAG.to_vec())?)
        .push_slice(PushBytesBuf::try_from(CONTENT_TYPE_TAG.to_vec())?)
        .push_slice(PushBytesBuf::try_from(CONTENT_TYPE.to_vec())?)
        .push_opcode(OP_FALSE);

    for chunk in payload.as_bytes().chunks(MAX_PUSH) {
        builder = builder.push_slice(PushBytesBuf::try_from(chunk.to_vec())?);
    }

    Ok(builder.push_opcode(OP_ENDIF))
}

/// Inscribed payload of a single-chunk action leaf, as it appears in a
/// script-path witness.
pub fn action_payload(leaf: &ScriptBuf) -> Option<Vec<u8>> {
    let ins: Vec<Instruction> = leaf.instructions().collect::<Result<_, _>>().ok()?;
    if ins.len() != 12 || ins[5].opcode() != Some(OP_IF) || ins[11].opcode() != Some(OP_ENDIF) {
        return None;
    }
    ins[10].push_bytes().map(|p| p.as_bytes().to_vec())
}

/// Number of signatures a leaf consumes when spent.
pub fn signature_count(leaf: &ScriptBuf) -> usize {
    leaf.instructions()
        .filter_map(|ins| ins.ok().and_then(|i| i.opcode()))
        .filter(|op| *op == OP_CHECKSIG || *op == OP_CHECKSIGVERIFY)
        .count()
}
