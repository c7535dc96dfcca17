//! Encrypted input builder
//!
//! Collects typed plaintexts bound to one (contract, user) pair and turns
//! them into ciphertext handles plus a validity proof in a single
//! `finalize` step. Handles come back in the order values were added.

use std::mem;

use thiserror::Error;
use tracing::debug;
use veil_types::{Address, FheType, Handle};

use crate::backend::{BackendError, EncryptionBackend, EncryptionSession};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("value {value} does not fit in {bits} bits")]
    OutOfRange { bits: u32, value: u64 },

    #[error("unsupported scalar width {0} (expected 8, 16, 32 or 64)")]
    UnsupportedWidth(u32),

    #[error("encrypted input was already finalized")]
    UseAfterFinalize,

    #[error("encrypted input has no values")]
    Empty,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Output of [`EncryptedInput::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedInput {
    pub handles: Vec<Handle>,
    pub proof: Vec<u8>,
}

/// Single-use builder for one encrypted input.
#[derive(Debug)]
pub struct EncryptedInput<'s> {
    session: &'s EncryptionSession,
    contract: Address,
    user: Address,
    values: Vec<(FheType, u64)>,
    finalized: bool,
}

impl EncryptionSession {
    pub fn create_encrypted_input(&self, contract: Address, user: Address) -> EncryptedInput<'_> {
        EncryptedInput {
            session: self,
            contract,
            user,
            values: Vec::new(),
            finalized: false,
        }
    }
}

impl<'s> EncryptedInput<'s> {
    pub fn contract(&self) -> &Address {
        &self.contract
    }

    pub fn user(&self) -> &Address {
        &self.user
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn push(&mut self, fhe_type: FheType, value: u64) -> Result<&mut Self, InputError> {
        if self.finalized {
            return Err(InputError::UseAfterFinalize);
        }
        if value > fhe_type.max_value() {
            return Err(InputError::OutOfRange {
                bits: fhe_type.bits(),
                value,
            });
        }
        self.values.push((fhe_type, value));
        Ok(self)
    }

    /// Add an unsigned scalar of `bits` width.
    pub fn add_scalar(&mut self, bits: u32, value: u64) -> Result<&mut Self, InputError> {
        if self.finalized {
            return Err(InputError::UseAfterFinalize);
        }
        let fhe_type = FheType::from_width(bits).ok_or(InputError::UnsupportedWidth(bits))?;
        self.push(fhe_type, value)
    }

    pub fn add8(&mut self, value: u8) -> Result<&mut Self, InputError> {
        self.push(FheType::Euint8, u64::from(value))
    }

    pub fn add16(&mut self, value: u16) -> Result<&mut Self, InputError> {
        self.push(FheType::Euint16, u64::from(value))
    }

    pub fn add32(&mut self, value: u32) -> Result<&mut Self, InputError> {
        self.push(FheType::Euint32, u64::from(value))
    }

    pub fn add64(&mut self, value: u64) -> Result<&mut Self, InputError> {
        self.push(FheType::Euint64, value)
    }

    pub fn add_bool(&mut self, value: bool) -> Result<&mut Self, InputError> {
        self.push(FheType::Ebool, u64::from(value))
    }

    /// Encrypt everything added so far. The builder is spent afterwards,
    /// even if encryption fails.
    pub async fn finalize(&mut self) -> Result<FinalizedInput, InputError> {
        if self.finalized {
            return Err(InputError::UseAfterFinalize);
        }
        self.finalized = true;
        let values = mem::take(&mut self.values);
        if values.is_empty() {
            return Err(InputError::Empty);
        }

        let sealed = self
            .session
            .backend()
            .encrypt_input(&self.contract, &self.user, &values)
            .await?;
        debug!(
            "Finalized encrypted input: {} handle(s) for {}",
            sealed.handles.len(),
            self.contract
        );
        Ok(FinalizedInput {
            handles: sealed.handles,
            proof: sealed.proof,
        })
    }
}
