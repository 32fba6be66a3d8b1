//! Agent credential: the ed25519 key that signs `recordMatch` submissions
//! and the resolver that produces it for each run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::config::{AgentConfig, CredentialMode, AGENT_KEY_VAR, ENV_FILE};
use crate::error::{AppError, AppResult};
use crate::ledger::models::SignedMatch;

/// Process credential used to sign ledger writes
pub struct AgentCredential {
    signing_key: SigningKey,
}

impl std::fmt::Debug for AgentCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCredential")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl AgentCredential {
    /// Parse a hex-encoded 32-byte ed25519 seed (optionally `0x`-prefixed)
    pub fn from_hex(seed: &str) -> AppResult<Self> {
        let trimmed = seed.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);

        let bytes = hex::decode(trimmed)
            .map_err(|_| AppError::InvalidCredential("Agent key is not valid hex".to_string()))?;

        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            AppError::InvalidCredential("Agent key must be a 32-byte seed".to_string())
        })?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a `recordMatch(lost, found)` submission bound to `contract` and `nonce`
    pub fn sign_match(&self, contract: &str, lost_id: u64, found_id: u64, nonce: u64) -> SignedMatch {
        let digest = match_digest(contract, lost_id, found_id, nonce);
        let signature = self.signing_key.sign(&digest);

        SignedMatch {
            contract: contract.to_string(),
            lost_id,
            found_id,
            nonce,
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// SHA-256 digest of the canonical submission message
pub fn match_digest(contract: &str, lost_id: u64, found_id: u64, nonce: u64) -> [u8; 32] {
    let message = format!("recordMatch:{}:{}:{}:{}", contract, lost_id, found_id, nonce);
    Sha256::digest(message.as_bytes()).into()
}

/// Verify a signed submission the way the ledger node does
pub fn verify_match_signature(submission: &SignedMatch) -> AppResult<bool> {
    let key_bytes: [u8; 32] = hex::decode(&submission.public_key)
        .map_err(|_| AppError::InvalidCredential("Invalid public key encoding".to_string()))?
        .try_into()
        .map_err(|_| AppError::InvalidCredential("Public key must be 32 bytes".to_string()))?;

    let sig_bytes: [u8; 64] = hex::decode(&submission.signature)
        .map_err(|_| AppError::InvalidCredential("Invalid signature encoding".to_string()))?
        .try_into()
        .map_err(|_| AppError::InvalidCredential("Signature must be 64 bytes".to_string()))?;

    let verify_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| AppError::InvalidCredential("Invalid verification key".to_string()))?;

    let digest = match_digest(
        &submission.contract,
        submission.lost_id,
        submission.found_id,
        submission.nonce,
    );

    Ok(verify_key
        .verify_strict(&digest, &Signature::from_bytes(&sig_bytes))
        .is_ok())
}

/// Where the agent key is read from
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Variable holding the hex seed. The env file entry wins over the
    /// process environment, which only reflects the file as it was at startup.
    Env { var: String, env_file: PathBuf },
    /// File holding the hex seed
    File(PathBuf),
    /// Fixed key material, used by tests and embedders
    Inline(String),
}

impl KeySource {
    fn read(&self) -> AppResult<String> {
        match self {
            KeySource::Env { var, env_file } => match read_env_file(env_file, var) {
                Some(seed) => Ok(seed),
                None => std::env::var(var)
                    .map_err(|_| AppError::InvalidCredential(format!("{} is not set", var))),
            },
            KeySource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                AppError::InvalidCredential(format!("Cannot read {}: {}", path.display(), e))
            }),
            KeySource::Inline(seed) => Ok(seed.clone()),
        }
    }
}

/// Look `var` up in an env file without touching the process environment
fn read_env_file(path: &Path, var: &str) -> Option<String> {
    dotenv::from_path_iter(path)
        .ok()?
        .filter_map(Result::ok)
        .filter(|(key, _)| key == var)
        .map(|(_, value)| value)
        .last()
}

/// Resolves the credential for each run.
///
/// In static mode the key is parsed once; in reload mode it is re-read from its
/// source every time so a rotated key is picked up by the next run.
pub struct CredentialProvider {
    source: KeySource,
    cached: Option<Arc<AgentCredential>>,
}

impl CredentialProvider {
    /// Validates the key once so a broken credential refuses startup.
    pub fn new(source: KeySource, mode: CredentialMode) -> AppResult<Self> {
        let credential = Arc::new(AgentCredential::from_hex(&source.read()?)?);

        let probe = credential.sign_match("startup-probe", 1, 2, 0);
        if !verify_match_signature(&probe)? {
            return Err(AppError::InvalidCredential(
                "Agent key failed its signing self-check".to_string(),
            ));
        }

        let cached = match mode {
            CredentialMode::Static => Some(credential),
            CredentialMode::ReloadEachRun => None,
        };
        Ok(Self { source, cached })
    }

    pub fn from_config(config: &AgentConfig) -> AppResult<Self> {
        let source = match &config.agent_key_file {
            Some(path) => KeySource::File(path.clone()),
            None => KeySource::Env {
                var: AGENT_KEY_VAR.to_string(),
                env_file: PathBuf::from(ENV_FILE),
            },
        };
        Self::new(source, config.credential_mode)
    }

    pub fn resolve(&self) -> AppResult<Arc<AgentCredential>> {
        match &self.cached {
            Some(credential) => Ok(credential.clone()),
            None => Ok(Arc::new(AgentCredential::from_hex(&self.source.read()?)?)),
        }
    }
}
