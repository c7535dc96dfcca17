//! Cleartext store with access control.
//!
//! Mirrors what a local development node keeps for the mock coprocessor:
//! every handle maps to its typed plaintext, and an ACL records which
//! addresses may request a user decryption of it.

use std::collections::{HashMap, HashSet};

use veil_types::{Address, FheType, Handle};

use crate::error::CoprocessorError;

const COMPUTED_INDEX: u8 = 0xff;

#[derive(Debug, Default)]
pub struct CiphertextStore {
    chain_id: u64,
    values: HashMap<Handle, (FheType, u64)>,
    acl: HashMap<Handle, HashSet<Address>>,
    public: HashSet<Handle>,
    next_op: u64,
}

fn mask(fhe_type: FheType, value: u64) -> u64 {
    value & fhe_type.max_value()
}

impl CiphertextStore {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    fn fresh_handle(&mut self, op: &[u8], operands: &[&Handle], fhe_type: FheType) -> Handle {
        self.next_op += 1;
        let mut hasher = blake3::Hasher::new_derive_key("veil-mock-op-v1");
        hasher.update(op);
        hasher.update(&self.next_op.to_be_bytes());
        for operand in operands {
            hasher.update(operand.as_bytes());
        }
        Handle::compose(hasher.finalize().as_bytes(), COMPUTED_INDEX, self.chain_id, fhe_type)
    }

    /// Record a value whose input proof has already been verified.
    pub fn insert_verified(&mut self, handle: Handle, fhe_type: FheType, value: u64) {
        self.values.insert(handle, (fhe_type, mask(fhe_type, value)));
    }

    /// Encrypt a public constant.
    pub fn trivial_encrypt(&mut self, fhe_type: FheType, value: u64) -> Handle {
        let handle = self.fresh_handle(b"trivial", &[], fhe_type);
        self.values.insert(handle, (fhe_type, mask(fhe_type, value)));
        handle
    }

    pub fn cleartext(&self, handle: &Handle) -> Result<(FheType, u64), CoprocessorError> {
        self.values
            .get(handle)
            .copied()
            .ok_or(CoprocessorError::UnknownHandle(*handle))
    }

    /// Wrapping addition at the width of `a`.
    pub fn add(&mut self, a: &Handle, b: &Handle) -> Result<Handle, CoprocessorError> {
        let (ta, va) = self.cleartext(a)?;
        let (_, vb) = self.cleartext(b)?;
        let handle = self.fresh_handle(b"add", &[a, b], ta);
        self.values.insert(handle, (ta, mask(ta, va.wrapping_add(vb))));
        Ok(handle)
    }

    /// Encrypted equality against a plaintext scalar.
    pub fn eq_scalar(&mut self, a: &Handle, scalar: u64) -> Result<Handle, CoprocessorError> {
        let (_, va) = self.cleartext(a)?;
        let handle = self.fresh_handle(b"eq", &[a], FheType::Ebool);
        self.values.insert(handle, (FheType::Ebool, u64::from(va == scalar)));
        Ok(handle)
    }

    /// `cond ? a : b`; both branches must share a type.
    pub fn select(
        &mut self,
        cond: &Handle,
        a: &Handle,
        b: &Handle,
    ) -> Result<Handle, CoprocessorError> {
        let (tc, vc) = self.cleartext(cond)?;
        if tc != FheType::Ebool {
            return Err(CoprocessorError::TypeMismatch(*cond));
        }
        let (ta, va) = self.cleartext(a)?;
        let (tb, vb) = self.cleartext(b)?;
        if ta != tb {
            return Err(CoprocessorError::TypeMismatch(*b));
        }
        let handle = self.fresh_handle(b"select", &[cond, a, b], ta);
        self.values.insert(handle, (ta, if vc != 0 { va } else { vb }));
        Ok(handle)
    }

    pub fn allow(&mut self, handle: &Handle, account: Address) {
        self.acl.entry(*handle).or_default().insert(account);
    }

    /// Let any account decrypt `handle`.
    pub fn make_public(&mut self, handle: &Handle) {
        self.public.insert(*handle);
    }

    pub fn is_allowed(&self, handle: &Handle, account: &Address) -> bool {
        self.public.contains(handle)
            || self
                .acl
                .get(handle)
                .map(|allowed| allowed.contains(account))
                .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
