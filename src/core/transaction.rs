//! Signed transactions and their stateless well-formedness checks.

use crate::core::params::ChainParams;
use crate::crypto::key_pair::{PrivateKey, PublicKey, SerializableSignature};
use crate::types::address::Address;
use crate::types::encoding::Decode;
use crate::types::hash::Hash;
use crate::virtual_machine::gas::intrinsic_gas;
use crate::virtual_machine::vm::Word;
use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

/// Largest accepted `data` payload.
pub const MAX_TX_DATA: usize = 64 * 1024;

/// Operation a transaction performs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, BorshSerialize, BorshDeserialize)]
pub enum TransactionType {
    /// Native value transfer to `recipient`.
    Transfer,
    /// Contract creation; `data` holds the bytecode, `recipient` is ignored.
    Deploy,
    /// Contract invocation; `data` holds the borsh-encoded argument words.
    Call,
    /// Bond `amount` from the sender's balance as validator stake.
    Stake,
    /// Start unbonding `amount` of the sender's stake.
    Unstake,
    /// Double-sign evidence against a validator; `data` holds the two headers.
    Evidence,
    /// Block reward. Only valid as the first transaction of a block.
    Coinbase,
}

/// Reasons a transaction is rejected or excluded from a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u128, available: u128 },
    #[error("execution reverted: {0}")]
    ExecutionReverted(String),
    #[error("gas limit {limit} below intrinsic cost {required}")]
    IntrinsicGas { required: u64, limit: u64 },
    #[error("gas limit {limit} exceeds per-transaction cap {max}")]
    GasLimitTooHigh { limit: u64, max: u64 },
    #[error("fee {fee} does not cover gas limit, need {required}")]
    FeeTooLow { fee: u128, required: u128 },
    #[error("no contract deployed at {0}")]
    NotAContract(crate::types::address::Address),
    #[error("coinbase transaction outside the reward slot")]
    UnexpectedCoinbase,
    #[error("stake error: {0}")]
    Stake(String),
    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),
    #[error("balance overflow")]
    Overflow,
    #[error("malformed transaction: {0}")]
    Malformed(String),
}

/// A signed transaction.
///
/// Field order is the canonical encoding order; the signature comes last and
/// covers every preceding field plus the chain id.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    /// Sender's public key, also used for signature verification.
    pub from: PublicKey,
    pub recipient: Address,
    /// Native value moved to the recipient (or bonded/unbonded for staking).
    pub amount: u128,
    pub data: Vec<u8>,
    /// Must equal the sender's next expected nonce. Coinbases carry the block height.
    pub nonce: u64,
    /// Fee paid in full whether or not execution succeeds.
    pub fee: u128,
    /// Gas bought by `fee`; bounds intrinsic plus execution cost.
    pub gas_limit: u64,
    pub tx_type: TransactionType,
    pub signature: SerializableSignature,
}

impl Transaction {
    /// Creates and signs a transaction bound to `chain_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &PrivateKey,
        tx_type: TransactionType,
        recipient: Address,
        amount: u128,
        data: Vec<u8>,
        nonce: u64,
        fee: u128,
        gas_limit: u64,
        chain_id: u64,
    ) -> Self {
        let mut tx = Transaction {
            from: key.public_key(),
            recipient,
            amount,
            data,
            nonce,
            fee,
            gas_limit,
            tx_type,
            signature: SerializableSignature::empty(),
        };
        tx.signature = key.sign(tx.signing_hash(chain_id).as_slice());
        tx
    }

    /// Plain value transfer paying exactly the intrinsic gas.
    pub fn transfer(
        key: &PrivateKey,
        recipient: Address,
        amount: u128,
        nonce: u64,
        fee: u128,
        chain_id: u64,
    ) -> Self {
        let gas_limit = intrinsic_gas(TransactionType::Transfer, 0);
        Self::new(
            key,
            TransactionType::Transfer,
            recipient,
            amount,
            Vec::new(),
            nonce,
            fee,
            gas_limit,
            chain_id,
        )
    }

    /// Reward transaction signed by the block producer.
    pub fn coinbase(
        key: &PrivateKey,
        recipient: Address,
        amount: u128,
        height: u64,
        chain_id: u64,
    ) -> Self {
        Self::new(
            key,
            TransactionType::Coinbase,
            recipient,
            amount,
            Vec::new(),
            height,
            0,
            0,
            chain_id,
        )
    }

    pub fn sender(&self) -> Address {
        self.from.address
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TransactionType::Coinbase
    }

    /// Hash of every field except the signature, bound to the chain.
    pub fn signing_hash(&self, chain_id: u64) -> Hash {
        let mut h = Hash::sha3();
        h.update(b"TX");
        h.update_encoded(&chain_id);
        h.update_encoded(&self.from);
        h.update_encoded(&self.recipient);
        h.update_encoded(&self.amount);
        h.update_encoded(&self.data);
        h.update_encoded(&self.nonce);
        h.update_encoded(&self.fee);
        h.update_encoded(&self.gas_limit);
        h.update_encoded(&self.tx_type);
        h.finalize()
    }

    /// Unique identifier covering the signature as well.
    pub fn id(&self, chain_id: u64) -> Hash {
        let mut h = Hash::sha3();
        h.update(b"TXID");
        h.update_encoded(&chain_id);
        h.update_encoded(self);
        h.finalize()
    }

    /// Checks the signature against an explicit sender key.
    pub fn verify_with(&self, sender: &PublicKey, chain_id: u64) -> bool {
        sender.verify(self.signing_hash(chain_id).as_slice(), &self.signature)
    }

    /// Checks the signature against the embedded sender key.
    pub fn verify(&self, chain_id: u64) -> bool {
        self.verify_with(&self.from, chain_id)
    }

    pub fn intrinsic_gas(&self) -> u64 {
        intrinsic_gas(self.tx_type, self.data.len())
    }

    /// Decodes `data` as contract call arguments.
    pub fn call_args(&self) -> Result<Vec<Word>, TxError> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        Vec::<Word>::from_bytes(&self.data).map_err(|e| TxError::Malformed(e.to_string()))
    }

    /// Stateless checks run before a transaction may enter the mempool or a block.
    ///
    /// Coinbases are validated separately by the chain since their amount
    /// depends on consensus state.
    pub fn check_well_formed(&self, params: &ChainParams) -> Result<(), TxError> {
        if self.data.len() > MAX_TX_DATA {
            return Err(TxError::Malformed(format!(
                "data is {} bytes, limit is {MAX_TX_DATA}",
                self.data.len()
            )));
        }
        if !self.verify(params.chain_id) {
            return Err(TxError::InvalidSignature);
        }
        if self.is_coinbase() {
            return Err(TxError::UnexpectedCoinbase);
        }

        let required = self.intrinsic_gas();
        if self.gas_limit < required {
            return Err(TxError::IntrinsicGas {
                required,
                limit: self.gas_limit,
            });
        }
        if self.gas_limit > params.gas.max_tx_gas {
            return Err(TxError::GasLimitTooHigh {
                limit: self.gas_limit,
                max: params.gas.max_tx_gas,
            });
        }
        let min_fee = u128::from(self.gas_limit).saturating_mul(params.gas.min_gas_price);
        if self.fee < min_fee {
            return Err(TxError::FeeTooLow {
                fee: self.fee,
                required: min_fee,
            });
        }

        match self.tx_type {
            TransactionType::Deploy if self.data.is_empty() => {
                Err(TxError::Malformed("deploy without code".into()))
            }
            TransactionType::Call => self.call_args().map(|_| ()),
            TransactionType::Stake | TransactionType::Unstake if self.amount == 0 => {
                Err(TxError::Malformed("zero stake amount".into()))
            }
            TransactionType::Evidence => {
                crate::consensus::validator::DoubleSignEvidence::from_bytes(&self.data)
                    .map(|_| ())
                    .map_err(|e| TxError::InvalidEvidence(e.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Encode;
    use crate::utils::test_utils::utils::{dev_params, key, transfer};

    const TEST_CHAIN_ID: u64 = 1337;

    #[test]
    fn new_creates_valid_transaction() {
        let tx = transfer(&key(1), key(2).address(), 10, 0);
        assert!(tx.verify(TEST_CHAIN_ID));
        assert_eq!(tx.sender(), key(1).address());
    }

    #[test]
    fn verify_fails_with_wrong_public_key() {
        let tx = transfer(&key(1), key(2).address(), 10, 0);
        let mut tampered = tx.clone();
        tampered.from = key(3).public_key();
        assert!(!tampered.verify(TEST_CHAIN_ID));
        assert!(!tx.verify_with(&key(3).public_key(), TEST_CHAIN_ID));
    }

    #[test]
    fn verify_fails_with_tampered_fields() {
        let tx = transfer(&key(1), key(2).address(), 10, 0);

        let mut amount = tx.clone();
        amount.amount += 1;
        assert!(!amount.verify(TEST_CHAIN_ID));

        let mut nonce = tx.clone();
        nonce.nonce += 1;
        assert!(!nonce.verify(TEST_CHAIN_ID));

        let mut fee = tx.clone();
        fee.fee -= 1;
        assert!(!fee.verify(TEST_CHAIN_ID));
    }

    #[test]
    fn signature_is_bound_to_chain_id() {
        let tx = transfer(&key(1), key(2).address(), 10, 0);
        assert!(!tx.verify(TEST_CHAIN_ID + 1));
    }

    #[test]
    fn serialize_deserialize_roundtrip_keeps_signature_valid() {
        let tx = transfer(&key(1), key(2).address(), 10, 0);
        let decoded = <Transaction as Decode>::from_bytes(&tx.to_bytes()).expect("decode");
        assert_eq!(tx, decoded);
        assert!(decoded.verify(TEST_CHAIN_ID));
        assert_eq!(decoded.id(TEST_CHAIN_ID), tx.id(TEST_CHAIN_ID));
    }

    #[test]
    fn same_payload_different_keys_have_different_ids() {
        let a = transfer(&key(1), key(9).address(), 5, 0);
        let b = transfer(&key(2), key(9).address(), 5, 0);
        assert_ne!(a.id(TEST_CHAIN_ID), b.id(TEST_CHAIN_ID));
    }

    #[test]
    fn well_formed_transfer_passes() {
        let params = dev_params();
        assert_eq!(
            transfer(&key(1), key(2).address(), 10, 0).check_well_formed(&params),
            Ok(())
        );
    }

    #[test]
    fn fee_must_cover_gas_limit() {
        let params = dev_params();
        let tx = Transaction::transfer(&key(1), key(2).address(), 10, 0, 1, params.chain_id);
        assert!(matches!(
            tx.check_well_formed(&params),
            Err(TxError::FeeTooLow { .. })
        ));
    }

    #[test]
    fn gas_limit_below_intrinsic_is_rejected() {
        let params = dev_params();
        let tx = Transaction::new(
            &key(1),
            TransactionType::Transfer,
            key(2).address(),
            1,
            Vec::new(),
            0,
            1_000_000,
            100,
            params.chain_id,
        );
        assert_eq!(
            tx.check_well_formed(&params),
            Err(TxError::IntrinsicGas {
                required: 21_000,
                limit: 100
            })
        );
    }

    #[test]
    fn coinbase_is_not_well_formed_outside_blocks() {
        let params = dev_params();
        let tx = Transaction::coinbase(&key(1), key(1).address(), 50, 1, params.chain_id);
        assert!(tx.verify(params.chain_id));
        assert_eq!(tx.check_well_formed(&params), Err(TxError::UnexpectedCoinbase));
    }

    #[test]
    fn call_with_garbage_args_is_malformed() {
        let params = dev_params();
        let tx = Transaction::new(
            &key(1),
            TransactionType::Call,
            key(2).address(),
            0,
            vec![1, 2, 3],
            0,
            100_000,
            100_000,
            params.chain_id,
        );
        assert!(matches!(
            tx.check_well_formed(&params),
            Err(TxError::Malformed(_))
        ));
    }
}
