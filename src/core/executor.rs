//! Transaction and block execution.
//!
//! `apply` is all-or-nothing per transaction with one twist: a resource
//! fault inside the body (gas, stack, call depth, bad opcode) still charges
//! the fee and bumps the nonce, while state-invalid transactions and explicit
//! reverts are excluded outright and change nothing.

use crate::consensus::validator::DoubleSignEvidence;
use crate::core::block::{Block, BlockError};
use crate::core::params::ChainParams;
use crate::core::receipt::{ExecutionStatus, Log, Receipt};
use crate::core::state::{StateDelta, StateOverlay, WorldState};
use crate::core::transaction::{Transaction, TransactionType, TxError};
use crate::types::address::Address;
use crate::types::encoding::Decode;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::state::ContractState;
use crate::virtual_machine::vm::{CallContext, Vm, Word};

/// Block-level context a transaction executes in.
#[derive(Clone, Debug)]
pub struct ExecutionEnv<'a> {
    pub params: &'a ChainParams,
    pub height: u64,
    /// Receives every fee in the block (the coinbase recipient).
    pub producer: Address,
}

/// Result of a successful body run.
struct BodyOutcome {
    gas_used: u64,
    return_value: Word,
    logs: Vec<Log>,
}

/// Why a body did not complete.
enum BodyFailure {
    /// Resource or runtime fault: fee charged, body discarded.
    Fault { reason: String, gas_used: u64 },
    /// Excludes the transaction.
    Rejected(TxError),
}

impl From<TxError> for BodyFailure {
    fn from(error: TxError) -> Self {
        BodyFailure::Rejected(error)
    }
}

/// Amount the sender must hold beyond the fee before the body runs.
fn upfront_value(tx: &Transaction) -> u128 {
    match tx.tx_type {
        TransactionType::Transfer
        | TransactionType::Deploy
        | TransactionType::Call
        | TransactionType::Stake => tx.amount,
        TransactionType::Unstake | TransactionType::Evidence | TransactionType::Coinbase => 0,
    }
}

/// Applies a user transaction to `state` and returns its changes.
///
/// Errors leave nothing behind: the caller must exclude the transaction.
pub fn apply(
    tx: &Transaction,
    state: &WorldState,
    env: &ExecutionEnv<'_>,
) -> Result<StateDelta, TxError> {
    tx.check_well_formed(env.params)?;

    let sender = tx.sender();
    let mut overlay = StateOverlay::new(state);
    let expected = overlay.nonce(&sender);
    if tx.nonce != expected {
        return Err(TxError::BadNonce {
            expected,
            got: tx.nonce,
        });
    }
    let needed = tx
        .fee
        .checked_add(upfront_value(tx))
        .ok_or(TxError::Overflow)?;
    let available = overlay.account(&sender).map_or(0, |a| a.balance());
    if available < needed {
        return Err(TxError::InsufficientFunds { needed, available });
    }

    overlay.debit(&sender, tx.fee).ok_or(TxError::Overflow)?;
    overlay
        .credit(&env.producer, tx.fee)
        .ok_or(TxError::Overflow)?;
    overlay.account_mut(&sender).nonce += 1;

    let intrinsic = tx.intrinsic_gas();
    let checkpoint = overlay.clone();
    match run_body(&mut overlay, tx, env, intrinsic) {
        Ok(outcome) => Ok(overlay.into_delta(
            ExecutionStatus::Success,
            outcome.gas_used,
            outcome.return_value,
            outcome.logs,
        )),
        Err(BodyFailure::Fault { reason, gas_used }) => Ok(checkpoint.into_delta(
            ExecutionStatus::Failed(reason),
            gas_used,
            0,
            Vec::new(),
        )),
        Err(BodyFailure::Rejected(error)) => Err(error),
    }
}

fn run_body(
    overlay: &mut StateOverlay<'_>,
    tx: &Transaction,
    env: &ExecutionEnv<'_>,
    intrinsic: u64,
) -> Result<BodyOutcome, BodyFailure> {
    let sender = tx.sender();
    let plain = BodyOutcome {
        gas_used: intrinsic,
        return_value: 0,
        logs: Vec::new(),
    };

    match tx.tx_type {
        TransactionType::Transfer => {
            move_value(overlay, &sender, &tx.recipient, tx.amount)?;
            if overlay.code(&tx.recipient).is_some() {
                return invoke(overlay, tx, env, intrinsic, Vec::new());
            }
            Ok(plain)
        }
        TransactionType::Deploy => {
            let contract = Address::contract(&sender, tx.nonce);
            if overlay.account(&contract).is_some_and(|a| a.is_contract()) {
                return Err(TxError::Malformed(format!("{contract} already holds code")).into());
            }
            overlay.account_mut(&contract).code = tx.data.clone();
            move_value(overlay, &sender, &contract, tx.amount)?;
            Ok(plain)
        }
        TransactionType::Call => {
            if overlay.code(&tx.recipient).is_none() {
                return Err(TxError::NotAContract(tx.recipient).into());
            }
            move_value(overlay, &sender, &tx.recipient, tx.amount)?;
            invoke(overlay, tx, env, intrinsic, tx.call_args()?)
        }
        TransactionType::Stake => {
            if env.params.stake().is_none() {
                return Err(TxError::Stake("chain does not use proof of stake".into()).into());
            }
            overlay
                .debit(&sender, tx.amount)
                .ok_or(TxError::InsufficientFunds {
                    needed: tx.amount,
                    available: 0,
                })?;
            overlay
                .validators_mut()
                .bond(sender, tx.amount)
                .map_err(TxError::Stake)?;
            Ok(plain)
        }
        TransactionType::Unstake => {
            let Some(stake) = env.params.stake() else {
                return Err(TxError::Stake("chain does not use proof of stake".into()).into());
            };
            let release = env.height.saturating_add(stake.unbonding_period_blocks);
            overlay
                .validators_mut()
                .begin_unbond(&sender, tx.amount, release)
                .map_err(TxError::Stake)?;
            Ok(plain)
        }
        TransactionType::Evidence => {
            let Some(stake) = env.params.stake() else {
                return Err(TxError::Stake("chain does not use proof of stake".into()).into());
            };
            let evidence = DoubleSignEvidence::from_bytes(&tx.data)
                .map_err(|e| TxError::InvalidEvidence(e.to_string()))?;
            let offender = evidence
                .verify(env.params.chain_id)
                .map_err(TxError::InvalidEvidence)?;
            overlay
                .validators_mut()
                .slash(&offender, stake.slash_bps)
                .map_err(TxError::InvalidEvidence)?;
            Ok(plain)
        }
        TransactionType::Coinbase => Err(TxError::UnexpectedCoinbase.into()),
    }
}

fn move_value(
    overlay: &mut StateOverlay<'_>,
    from: &Address,
    to: &Address,
    amount: u128,
) -> Result<(), TxError> {
    if overlay.transfer(from, to, amount) {
        Ok(())
    } else {
        Err(TxError::InsufficientFunds {
            needed: amount,
            available: overlay.balance(from),
        })
    }
}

fn invoke(
    overlay: &mut StateOverlay<'_>,
    tx: &Transaction,
    env: &ExecutionEnv<'_>,
    intrinsic: u64,
    args: Vec<Word>,
) -> Result<BodyOutcome, BodyFailure> {
    let ctx = CallContext {
        caller: tx.sender(),
        contract: tx.recipient,
        value: tx.amount,
        args,
        height: env.height,
    };
    let budget = tx.gas_limit.saturating_sub(intrinsic);
    let execution = Vm::execute(overlay, ctx, budget);
    let gas_used = intrinsic.saturating_add(execution.gas_used);
    match execution.result {
        Ok(return_value) => Ok(BodyOutcome {
            gas_used,
            return_value,
            logs: execution.logs,
        }),
        Err(VmError::Reverted(reason)) => {
            Err(BodyFailure::Rejected(TxError::ExecutionReverted(reason)))
        }
        Err(fault) => Err(BodyFailure::Fault {
            reason: fault.to_string(),
            gas_used,
        }),
    }
}

/// Credits the block reward. The coinbase must pay exactly `reward`.
pub fn apply_coinbase(
    tx: &Transaction,
    state: &WorldState,
    env: &ExecutionEnv<'_>,
    reward: u128,
) -> Result<StateDelta, TxError> {
    if !tx.is_coinbase() {
        return Err(TxError::Malformed("expected a coinbase".into()));
    }
    if tx.amount != reward {
        return Err(TxError::Malformed(format!(
            "coinbase pays {}, reward is {reward}",
            tx.amount
        )));
    }
    if tx.nonce != env.height {
        return Err(TxError::BadNonce {
            expected: env.height,
            got: tx.nonce,
        });
    }
    let mut overlay = StateOverlay::new(state);
    overlay
        .credit(&tx.recipient, reward)
        .ok_or(TxError::Overflow)?;
    Ok(overlay.into_delta(ExecutionStatus::Success, 0, 0, Vec::new()))
}

/// Post-state of a block plus its receipts.
#[derive(Clone, Debug)]
pub struct BlockOutcome {
    pub state: WorldState,
    pub receipts: Vec<Receipt>,
    pub gas_used: u64,
}

/// Applies transactions one at a time on top of a parent state.
///
/// Used both to replay received blocks and to assemble new ones: a failing
/// `push` leaves the working state untouched so a producer can skip the
/// transaction and continue.
pub struct BlockExecutor<'a> {
    env: ExecutionEnv<'a>,
    state: WorldState,
    receipts: Vec<Receipt>,
    gas_used: u64,
}

impl<'a> BlockExecutor<'a> {
    /// Starts a block: copies the parent state and releases matured unbonding.
    pub fn new(parent: &WorldState, env: ExecutionEnv<'a>) -> Result<Self, BlockError> {
        let mut state = parent.clone();
        begin_block(&mut state, env.height).map_err(|e| {
            BlockError::MalformedBlock(format!("releasing unbonded stake at {}: {e}", env.height))
        })?;
        Ok(Self {
            env,
            state,
            receipts: Vec::new(),
            gas_used: 0,
        })
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    pub fn push_coinbase(&mut self, tx: &Transaction, reward: u128) -> Result<(), TxError> {
        let delta = apply_coinbase(tx, &self.state, &self.env, reward)?;
        self.commit(tx, delta);
        Ok(())
    }

    pub fn push(&mut self, tx: &Transaction) -> Result<(), TxError> {
        let delta = apply(tx, &self.state, &self.env)?;
        self.commit(tx, delta);
        Ok(())
    }

    fn commit(&mut self, tx: &Transaction, mut delta: StateDelta) {
        self.gas_used = self.gas_used.saturating_add(delta.gas_used);
        self.receipts.push(Receipt {
            tx_hash: tx.id(self.env.params.chain_id),
            status: delta.status.clone(),
            gas_used: delta.gas_used,
            cumulative_gas_used: self.gas_used,
            return_value: delta.return_value,
            logs: std::mem::take(&mut delta.logs),
        });
        self.state.apply_delta(delta);
    }

    /// Closes the block, crediting the proposal to `proposer` under proof of stake.
    pub fn finish(mut self, proposer: Option<&Address>) -> BlockOutcome {
        if let Some(proposer) = proposer {
            let mut overlay = StateOverlay::new(&self.state);
            overlay.validators_mut().record_proposal(proposer);
            let delta = overlay.into_delta(ExecutionStatus::Success, 0, 0, Vec::new());
            self.state.apply_delta(delta);
        }
        BlockOutcome {
            state: self.state,
            receipts: self.receipts,
            gas_used: self.gas_used,
        }
    }
}

/// Returns matured unbonding stake to its owners' balances.
///
/// Fails with [`TxError::Overflow`] if a release would overflow a balance;
/// `state` is left untouched in that case.
pub fn begin_block(state: &mut WorldState, height: u64) -> Result<(), TxError> {
    if state.validators().is_empty() {
        return Ok(());
    }
    let mut overlay = StateOverlay::new(state);
    let released = overlay.validators_mut().release_matured(height);
    for (address, amount) in released {
        overlay.credit(&address, amount).ok_or(TxError::Overflow)?;
    }
    let delta = overlay.into_delta(ExecutionStatus::Success, 0, 0, Vec::new());
    state.apply_delta(delta);
    Ok(())
}

/// Replays every transaction of `block` on `parent`.
///
/// Any excluded transaction invalidates the block: a correct producer never
/// includes one.
pub fn execute_block(
    parent: &WorldState,
    block: &Block,
    params: &ChainParams,
    reward: u128,
    proposer: Option<&Address>,
) -> Result<BlockOutcome, BlockError> {
    let Some(coinbase) = block.coinbase() else {
        return Err(BlockError::MalformedBlock("missing coinbase".into()));
    };
    let env = ExecutionEnv {
        params,
        height: block.index(),
        producer: coinbase.recipient,
    };
    let mut executor = BlockExecutor::new(parent, env)?;
    executor
        .push_coinbase(coinbase, reward)
        .map_err(|error| BlockError::InvalidTransaction { index: 0, error })?;
    for (i, tx) in block.user_transactions().iter().enumerate() {
        executor
            .push(tx)
            .map_err(|error| BlockError::InvalidTransaction {
                index: i + 1,
                error,
            })?;
    }
    Ok(executor.finish(proposer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::validator::DoubleSignEvidence;
    use crate::core::block::{ConsensusProof, Header};
    use crate::core::params::GenesisValidator;
    use crate::crypto::key_pair::{PrivateKey, SerializableSignature};
    use crate::types::encoding::Encode;
    use crate::types::hash::Hash;
    use crate::utils::test_utils::utils::{call, deploy, dev_params, dev_pos_params, key, transfer};
    use crate::virtual_machine::assembler::assemble;

    fn env(params: &ChainParams) -> ExecutionEnv<'_> {
        ExecutionEnv {
            params,
            height: 1,
            producer: key(9).address(),
        }
    }

    fn genesis(params: &ChainParams) -> WorldState {
        WorldState::genesis(params).unwrap()
    }

    /// Applies `tx` and returns the resulting state.
    fn applied(state: &WorldState, tx: &Transaction, env: &ExecutionEnv<'_>) -> WorldState {
        let delta = apply(tx, state, env).expect("applies");
        let mut next = state.clone();
        next.apply_delta(delta);
        next
    }

    fn deployed(params: &ChainParams, source: &str) -> (WorldState, Address) {
        let state = genesis(params);
        let env = env(params);
        let code = assemble(source).unwrap();
        let tx = deploy(&key(1), code, 0);
        let contract = Address::contract(&key(1).address(), 0);
        (applied(&state, &tx, &env), contract)
    }

    #[test]
    fn transfer_moves_value_and_fee() {
        let params = dev_params();
        let state = genesis(&params);
        let env = env(&params);
        let tx = transfer(&key(1), key(2).address(), 1_000, 0);

        let next = applied(&state, &tx, &env);
        let a = key(1).address();
        let b = key(2).address();
        assert_eq!(next.balance(&a), state.balance(&a) - 1_000 - tx.fee);
        assert_eq!(next.balance(&b), state.balance(&b) + 1_000);
        assert_eq!(next.balance(&env.producer), tx.fee);
        assert_eq!(next.nonce(&a), 1);
    }

    #[test]
    fn bad_nonce_is_rejected() {
        let params = dev_params();
        let state = genesis(&params);
        let tx = transfer(&key(1), key(2).address(), 1, 5);
        assert_eq!(
            apply(&tx, &state, &env(&params)),
            Err(TxError::BadNonce {
                expected: 0,
                got: 5
            })
        );
    }

    #[test]
    fn insufficient_funds_is_rejected() {
        let params = dev_params();
        let state = genesis(&params);
        let unfunded = PrivateKey::from_bytes(&[77; 32]).unwrap();
        let tx = transfer(&unfunded, key(2).address(), 1, 0);
        assert!(matches!(
            apply(&tx, &state, &env(&params)),
            Err(TxError::InsufficientFunds { available: 0, .. })
        ));
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let params = dev_params();
        let state = genesis(&params);
        let mut tx = transfer(&key(1), key(2).address(), 1, 0);
        tx.amount = 2;
        assert_eq!(
            apply(&tx, &state, &env(&params)),
            Err(TxError::InvalidSignature)
        );
    }

    #[test]
    fn deploy_then_call_updates_storage() {
        let params = dev_params();
        let (state, contract) = deployed(&params, "PUSH 1\nARG 0\nSSTORE\nARG 0\nLOG\nARG 0\nRETURN");
        assert!(state.account(&contract).unwrap().is_contract());

        let env = env(&params);
        let tx = call(&key(1), contract, vec![42], 0, 1, 100_000);
        let delta = apply(&tx, &state, &env).unwrap();
        assert_eq!(delta.status, ExecutionStatus::Success);
        assert_eq!(delta.return_value, 42);
        assert_eq!(delta.logs.len(), 1);
        let mut next = state.clone();
        next.apply_delta(delta);
        assert_eq!(next.account(&contract).unwrap().storage(1), 42);
    }

    #[test]
    fn call_to_plain_account_is_not_a_contract() {
        let params = dev_params();
        let state = genesis(&params);
        let target = key(2).address();
        let tx = call(&key(1), target, Vec::new(), 0, 0, 100_000);
        assert_eq!(
            apply(&tx, &state, &env(&params)),
            Err(TxError::NotAContract(target))
        );
    }

    #[test]
    fn zero_gas_call_only_charges_fee() {
        let params = dev_params();
        let target = key(3).address();
        let (state, contract) = deployed(&params, &format!("PUSH 10\nTRANSFER {target}\nSTOP"));
        let env = env(&params);

        let tx = call(&key(1), contract, Vec::new(), 500, 1, 0);
        assert_eq!(tx.gas_limit, tx.intrinsic_gas());
        let delta = apply(&tx, &state, &env).unwrap();
        assert!(matches!(&delta.status, ExecutionStatus::Failed(reason) if reason.contains("out of gas")));
        assert_eq!(delta.gas_used, tx.gas_limit);

        let next = {
            let mut s = state.clone();
            s.apply_delta(delta);
            s
        };
        let sender = key(1).address();
        assert_eq!(next.balance(&sender), state.balance(&sender) - tx.fee);
        assert_eq!(next.balance(&contract), state.balance(&contract));
        assert_eq!(next.balance(&target), state.balance(&target));
        assert_eq!(next.nonce(&sender), 2);
    }

    #[test]
    fn revert_excludes_transaction() {
        let params = dev_params();
        let (state, contract) = deployed(&params, "PUSH 1\nPUSH 2\nSSTORE\nPUSH 7\nREVERT");
        let tx = call(&key(1), contract, Vec::new(), 10, 1, 100_000);
        assert_eq!(
            apply(&tx, &state, &env(&params)),
            Err(TxError::ExecutionReverted("code 7".into()))
        );
    }

    #[test]
    fn call_depth_fault_discards_body() {
        let params = dev_params();
        let state = genesis(&params);
        let env = env(&params);
        let self_addr = Address::contract(&key(1).address(), 0);
        let code = assemble(&format!("PUSH 1\nPUSH 1\nSSTORE\nCALL {self_addr} 0\nRETURN")).unwrap();
        let state = applied(&state, &deploy(&key(1), code, 0), &env);

        let tx = call(&key(1), self_addr, Vec::new(), 0, 1, 1_000_000);
        let delta = apply(&tx, &state, &env).unwrap();
        assert!(matches!(&delta.status, ExecutionStatus::Failed(reason) if reason.contains("call depth")));
        let mut next = state.clone();
        next.apply_delta(delta);
        assert_eq!(next.account(&self_addr).unwrap().storage(1), 0);
    }

    #[test]
    fn value_transfer_to_contract_runs_code() {
        let params = dev_params();
        let (state, contract) = deployed(&params, "PUSH 5\nCALLVALUE\nSSTORE\nSTOP");
        let tx = Transaction::new(
            &key(1),
            TransactionType::Transfer,
            contract,
            77,
            Vec::new(),
            1,
            100_000,
            100_000,
            params.chain_id,
        );
        let next = applied(&state, &tx, &env(&params));
        let account = next.account(&contract).unwrap();
        assert_eq!(account.balance(), 77);
        assert_eq!(account.storage(5), 77);
    }

    #[test]
    fn stake_unstake_and_release() {
        let params = dev_pos_params();
        let state = genesis(&params);
        let env = env(&params);
        let staker = key(2);

        let bond = Transaction::new(
            &staker,
            TransactionType::Stake,
            staker.address(),
            400,
            Vec::new(),
            0,
            21_000,
            21_000,
            params.chain_id,
        );
        let state = applied(&state, &bond, &env);
        assert_eq!(state.validators().stake_of(&staker.address()), 400);

        let unbond = Transaction::new(
            &staker,
            TransactionType::Unstake,
            staker.address(),
            150,
            Vec::new(),
            1,
            21_000,
            21_000,
            params.chain_id,
        );
        let state = applied(&state, &unbond, &env);
        let before = state.balance(&staker.address());
        assert_eq!(state.validators().stake_of(&staker.address()), 250);

        let mut released = state.clone();
        begin_block(&mut released, 10).unwrap();
        assert_eq!(released.balance(&staker.address()), before);
        begin_block(&mut released, 11).unwrap();
        assert_eq!(released.balance(&staker.address()), before + 150);
    }

    #[test]
    fn release_overflowing_a_balance_is_an_error() {
        let params = dev_pos_params();
        let env = env(&params);
        let staker = key(2);
        let bond = Transaction::new(
            &staker,
            TransactionType::Stake,
            staker.address(),
            400,
            Vec::new(),
            0,
            21_000,
            21_000,
            params.chain_id,
        );
        let unbond = Transaction::new(
            &staker,
            TransactionType::Unstake,
            staker.address(),
            150,
            Vec::new(),
            1,
            21_000,
            21_000,
            params.chain_id,
        );
        let state = applied(&applied(&genesis(&params), &bond, &env), &unbond, &env);

        let mut account = state.account(&staker.address()).unwrap().clone();
        account.balance = u128::MAX - 10;
        let mut state = state;
        state.apply_delta(StateDelta {
            accounts: [(staker.address(), account)].into_iter().collect(),
            validators: None,
            status: ExecutionStatus::Success,
            gas_used: 0,
            return_value: 0,
            logs: Vec::new(),
        });

        let before = state.clone();
        assert_eq!(begin_block(&mut state, 11), Err(TxError::Overflow));
        assert_eq!(state, before);
        assert!(matches!(
            BlockExecutor::new(&before, ExecutionEnv { height: 11, ..env }),
            Err(BlockError::MalformedBlock(_))
        ));
    }

    #[test]
    fn stake_is_refused_under_work() {
        let params = dev_params();
        let state = genesis(&params);
        let tx = Transaction::new(
            &key(1),
            TransactionType::Stake,
            key(1).address(),
            10,
            Vec::new(),
            0,
            21_000,
            21_000,
            params.chain_id,
        );
        assert!(matches!(
            apply(&tx, &state, &env(&params)),
            Err(TxError::Stake(_))
        ));
    }

    #[test]
    fn evidence_slashes_offender() {
        let params = dev_pos_params();
        let state = genesis(&params);
        let GenesisValidator { address, stake } = params.genesis.validators[0].clone();
        let offender = key(5);
        assert_eq!(offender.address(), address);

        let seal = |timestamp: u64| {
            let mut header = Header {
                index: 4,
                previous_hash: Hash::zero(),
                timestamp,
                merkle_root: Hash::zero(),
                state_root: Hash::zero(),
                receipts_root: Hash::zero(),
                gas_used: 0,
                proof: ConsensusProof::Stake {
                    validator: offender.public_key(),
                    signature: SerializableSignature::empty(),
                },
            };
            let digest = header.seal_hash(params.chain_id).unwrap();
            header.proof = ConsensusProof::Stake {
                validator: offender.public_key(),
                signature: offender.sign(digest.as_slice()),
            };
            header
        };
        let evidence = DoubleSignEvidence {
            first: seal(1),
            second: seal(2),
        };
        let data = evidence.to_bytes();
        let gas = crate::virtual_machine::gas::intrinsic_gas(TransactionType::Evidence, data.len());
        let tx = Transaction::new(
            &key(1),
            TransactionType::Evidence,
            Address::zero(),
            0,
            data,
            0,
            u128::from(gas),
            gas,
            params.chain_id,
        );
        let next = applied(&state, &tx, &env(&params));
        let slashed = next.validators().get(&address).unwrap();
        assert!(slashed.slashed);
        assert_eq!(slashed.stake, stake - stake * 500 / 10_000);
    }

    #[test]
    fn coinbase_must_pay_exact_reward() {
        let params = dev_params();
        let state = genesis(&params);
        let env = env(&params);
        let miner = key(9);
        let tx = Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id);
        assert!(apply_coinbase(&tx, &state, &env, 49).is_err());
        let delta = apply_coinbase(&tx, &state, &env, 50).unwrap();
        let mut next = state.clone();
        next.apply_delta(delta);
        assert_eq!(next.balance(&miner.address()), 50);
    }

    #[test]
    fn executor_skips_rejected_and_tracks_cumulative_gas() {
        let params = dev_params();
        let state = genesis(&params);
        let miner = key(9);
        let mut executor = BlockExecutor::new(&state, env(&params)).unwrap();
        executor
            .push_coinbase(&Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id), 50)
            .unwrap();
        executor.push(&transfer(&key(1), key(2).address(), 5, 0)).unwrap();
        assert!(executor.push(&transfer(&key(1), key(2).address(), 5, 0)).is_err());
        executor.push(&transfer(&key(1), key(2).address(), 5, 1)).unwrap();

        let outcome = executor.finish(None);
        assert_eq!(outcome.receipts.len(), 3);
        assert_eq!(outcome.gas_used, 42_000);
        assert_eq!(outcome.receipts[2].cumulative_gas_used, 42_000);
        assert_eq!(outcome.state.nonce(&key(1).address()), 2);
    }
}
