//! Encryption module
//!
//! The agent never holds key material itself. Payloads that must be
//! protected at rest are handed to an [`EncryptionProvider`], normally the
//! edge security daemon's workload API.

pub mod workload;

use async_trait::async_trait;

use crate::error::Result;

pub use workload::WorkloadEncryptionProvider;

/// Encrypts and decrypts opaque payloads.
///
/// Failures are reported as [`crate::AgentError::EncryptionFailure`]; the
/// input is never consumed or altered on error.
#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}
