//! Veil Mock Coprocessor
//!
//! Stand-in for the homomorphic encryption coprocessor on local development
//! networks. Values are not really computed under encryption: they are kept
//! in a cleartext store guarded by an access-control list, while everything
//! that crosses the client boundary (input proofs, decryption results) is
//! genuinely encrypted.
//!
//! ```text
//! ┌────────────┐  seal_input   ┌──────────────┐  open_input  ┌──────────────────┐
//! │   Client   │──────────────▶│ input proof  │─────────────▶│ CiphertextStore  │
//! │ (builder)  │               │ + handles    │              │ (values + ACL)   │
//! └────────────┘               └──────────────┘              └──────────────────┘
//!       ▲                                                             │
//!       │            reencrypt (X25519 + ChaCha20-Poly1305)           │
//!       └─────────────────────────────────────────────────────────────┘
//! ```

pub mod eip712;
pub mod error;
pub mod reencrypt;
pub mod seal;
pub mod store;

pub use eip712::{Eip712Payload, USER_DECRYPT_PRIMARY_TYPE, user_decrypt_request};
pub use error::CoprocessorError;
pub use reencrypt::{DecryptionKeypair, open_reencrypted, reencrypt};
pub use seal::{InputKey, SealedInput, open_input, seal_input};
pub use store::CiphertextStore;
