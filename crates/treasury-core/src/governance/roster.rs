//! Signer roster and Ed25519 signature verification.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use treasury_types::{Role, TreasuryError, TreasuryResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub id: String,
    pub roles: Vec<Role>,
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: String,
}

impl Signer {
    pub fn new(id: impl Into<String>, roles: Vec<Role>, key: &VerifyingKey) -> Self {
        Self {
            id: id.into(),
            roles,
            public_key: hex_encode(key.as_bytes()),
        }
    }

    /// Signer from a submitted hex key. The key must decode to a valid
    /// Ed25519 point and the signer must hold at least one role.
    pub fn from_hex(id: &str, roles: Vec<Role>, public_key: &str) -> TreasuryResult<Self> {
        if id.trim().is_empty() {
            return Err(TreasuryError::InvalidInput("signer id is empty".to_string()));
        }
        if roles.is_empty() {
            return Err(TreasuryError::InvalidInput(format!("signer {} holds no role", id)));
        }
        let invalid = || TreasuryError::InvalidInput(format!("signer {} has a malformed public key", id));
        let bytes = hex_decode(public_key).map_err(|_| invalid())?;
        let key = VerifyingKey::from_bytes(bytes.as_slice().try_into().map_err(|_| invalid())?)
            .map_err(|_| invalid())?;
        Ok(Self::new(id, roles, &key))
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        self.roles.iter().any(|r| roles.contains(r))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignerRoster {
    signers: BTreeMap<String, Signer>,
}

impl SignerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signers(signers: impl IntoIterator<Item = Signer>) -> Self {
        let mut roster = Self::new();
        for signer in signers {
            roster.insert(signer);
        }
        roster
    }

    pub fn insert(&mut self, signer: Signer) {
        self.signers.insert(signer.id.clone(), signer);
    }

    pub fn remove(&mut self, id: &str) -> Option<Signer> {
        self.signers.remove(id)
    }

    pub fn signers(&self) -> impl Iterator<Item = &Signer> + '_ {
        self.signers.values()
    }

    pub fn get(&self, id: &str) -> Option<&Signer> {
        self.signers.get(id)
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    /// Members holding at least one of `roles`.
    pub fn eligible(&self, roles: &[Role]) -> impl Iterator<Item = &Signer> + '_ {
        let roles = roles.to_vec();
        self.signers.values().filter(move |s| s.has_any_role(&roles))
    }

    pub fn has_role_in(&self, id: &str, roles: &[Role]) -> bool {
        self.get(id).is_some_and(|s| s.has_any_role(roles))
    }

    /// Check `signature_hex` is `id`'s signature over `digest`.
    pub fn verify(&self, id: &str, digest: &str, signature_hex: &str) -> TreasuryResult<()> {
        let signer = self
            .get(id)
            .ok_or_else(|| TreasuryError::Unauthorized(format!("{} is not a registered signer", id)))?;
        let invalid = || TreasuryError::InvalidSignature(format!("bad signature from {}", id));

        let key_bytes = hex_decode(&signer.public_key).map_err(|_| invalid())?;
        let key = VerifyingKey::from_bytes(key_bytes.as_slice().try_into().map_err(|_| invalid())?)
            .map_err(|_| invalid())?;
        let sig_bytes = hex_decode(signature_hex).map_err(|_| invalid())?;
        let signature = Signature::from_bytes(sig_bytes.as_slice().try_into().map_err(|_| invalid())?);
        key.verify(digest.as_bytes(), &signature).map_err(|_| invalid())
    }
}

/// Hex signature over a proposal digest, as submitted by a signer.
pub fn sign_digest(key: &SigningKey, digest: &str) -> String {
    hex_encode(key.sign(digest.as_bytes()).to_bytes().as_slice())
}

pub fn public_key_hex(key: &SigningKey) -> String {
    hex_encode(key.verifying_key().as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}
