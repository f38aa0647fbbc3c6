use borsh::{BorshDeserialize, BorshSerialize};
use k256::schnorr::Signature;

pub const SIGNATURE_LEN: usize = 64;

/// Raw 64-byte Schnorr signature as carried on the wire.
///
/// Parsing into a curve signature is deferred to verification, so a
/// structurally invalid signature decodes fine and simply fails `verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SerializableSignature(pub [u8; SIGNATURE_LEN]);

impl SerializableSignature {
    /// Placeholder used in headers before they are sealed.
    pub const fn empty() -> Self {
        SerializableSignature([0u8; SIGNATURE_LEN])
    }

    pub fn to_signature(&self) -> Option<Signature> {
        Signature::try_from(self.0.as_slice()).ok()
    }
}

impl From<Signature> for SerializableSignature {
    fn from(sig: Signature) -> Self {
        SerializableSignature(sig.to_bytes())
    }
}
