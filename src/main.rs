//! Single-node development ledger.
//!
//! Starts a node on a fresh in-memory chain, feeds it a few transfers and a
//! small counter contract, produces blocks and prints the resulting tip.
//!
//! # Usage
//! ```text
//! ledger [OPTIONS]
//! ```
//!
//! # Options
//! - `--consensus <pow|pos>`: Block production mechanism (defaults to `pow`)
//! - `--blocks <n>`: Number of blocks to produce (defaults to 5)
//! - `--log-level <level>`: `debug`, `info`, `warn` or `error` (defaults to `info`)

use ledger::core::params::{ChainParams, GenesisAllocation, GenesisValidator};
use ledger::core::transaction::{Transaction, TransactionType};
use ledger::crypto::key_pair::PrivateKey;
use ledger::network::message::{Misbehavior, NodeEvent};
use ledger::network::server::{Node, NodeConfig, NodeHandle};
use ledger::storage::kv::MemoryStore;
use ledger::types::address::Address;
use ledger::types::encoding::Encode;
use ledger::utils::log::{self, Level};
use ledger::virtual_machine::assembler::assemble;
use ledger::virtual_machine::gas::intrinsic_gas;
use ledger::virtual_machine::vm::Word;
use ledger::{error, info, warn};
use std::env;
use std::process;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

const COUNTER: &str = "
    # storage[0] += arg 0, logs and returns the new value
    PUSH 0
    SLOAD
    ARG 0
    ADD
    DUP 0
    LOG
    PUSH 0
    DUP 1
    SSTORE
    RETURN
";

const FUNDS: u128 = 1_000_000_000_000;
const VALIDATOR_STAKE: u128 = 1_000_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mechanism {
    Work,
    Stake,
}

struct Options {
    mechanism: Mechanism,
    blocks: u64,
    level: Level,
}

fn parse_args(args: &[String]) -> Options {
    let mut options = Options {
        mechanism: Mechanism::Work,
        blocks: 5,
        level: Level::Info,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        if flag == "--help" || flag == "-h" {
            print_usage(&args[0]);
            process::exit(0);
        }
        i += 1;
        let Some(value) = args.get(i) else {
            eprintln!("{flag} requires an argument");
            process::exit(1);
        };
        match flag {
            "--consensus" => {
                options.mechanism = match value.as_str() {
                    "pow" => Mechanism::Work,
                    "pos" => Mechanism::Stake,
                    other => {
                        eprintln!("Unknown consensus '{other}', expected pow or pos");
                        process::exit(1);
                    }
                }
            }
            "--blocks" => {
                options.blocks = value.parse().unwrap_or_else(|_| {
                    eprintln!("Invalid block count: {value}");
                    process::exit(1);
                })
            }
            "--log-level" => {
                options.level = value.parse().unwrap_or_else(|e| {
                    eprintln!("{e}");
                    process::exit(1);
                })
            }
            other => {
                eprintln!("Unexpected argument: {other}\n");
                print_usage(&args[0]);
                process::exit(1);
            }
        }
        i += 1;
    }
    options
}

fn chain_params(mechanism: Mechanism, producer: &PrivateKey, users: &[&PrivateKey]) -> ChainParams {
    let allocations = users
        .iter()
        .map(|key| GenesisAllocation {
            address: key.address(),
            balance: FUNDS,
        })
        .collect();
    match mechanism {
        Mechanism::Work => ChainParams::dev_pow(allocations),
        Mechanism::Stake => ChainParams::dev_pos(
            allocations,
            vec![GenesisValidator {
                address: producer.address(),
                stake: VALIDATOR_STAKE,
            }],
        ),
    }
}

/// Signed transaction paying the minimum fee for its gas limit.
#[allow(clippy::too_many_arguments)]
fn signed(
    params: &ChainParams,
    key: &PrivateKey,
    tx_type: TransactionType,
    recipient: Address,
    amount: u128,
    data: Vec<u8>,
    nonce: u64,
    exec_gas: u64,
) -> Transaction {
    let gas_limit = intrinsic_gas(tx_type, data.len()) + exec_gas;
    let fee = u128::from(gas_limit) * u128::from(params.gas.min_gas_price);
    Transaction::new(
        key,
        tx_type,
        recipient,
        amount,
        data,
        nonce,
        fee,
        gas_limit,
        params.chain_id,
    )
}

async fn submit(handle: &NodeHandle, tx: Transaction) {
    if let Err(e) = handle.receive_transaction(tx.to_bytes()).await {
        warn!("transaction rejected: {e}");
    }
}

/// Logs node events until the node stops.
async fn watch(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(NodeEvent::NewTip {
                block, reorg_depth, ..
            }) if reorg_depth > 0 => {
                warn!("reorganized {reorg_depth} blocks, tip now at {}", block.index())
            }
            Ok(NodeEvent::SecurityAlert { block, depth, limit }) => {
                error!("security alert: {block} would discard {depth} blocks (limit {limit})")
            }
            Ok(NodeEvent::Misbehavior(Misbehavior::InvalidBlock { hash, reason })) => {
                warn!("peer sent invalid block {hash}: {reason}")
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("event watcher skipped {skipped} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let options = parse_args(&args);
    log::set_level(options.level);

    let producer = PrivateKey::new();
    let alice = PrivateKey::new();
    let bob = PrivateKey::new();
    let params = chain_params(options.mechanism, &producer, &[&alice, &bob]);

    let mut config = NodeConfig::new(params.clone(), Arc::new(MemoryStore::new()));
    config.producer = Some(producer.clone());
    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {e}");
            process::exit(1);
        }
    };
    let (handle, task) = node.spawn();
    tokio::spawn(watch(handle.subscribe()));

    let code = match assemble(COUNTER) {
        Ok(code) => code,
        Err(e) => {
            error!("counter contract does not assemble: {e}");
            process::exit(1);
        }
    };
    let counter = Address::contract(&alice.address(), 0);
    submit(
        &handle,
        signed(&params, &alice, TransactionType::Deploy, Address::zero(), 0, code, 0, 0),
    )
    .await;
    submit(
        &handle,
        signed(&params, &bob, TransactionType::Transfer, alice.address(), 2_500, Vec::new(), 0, 0),
    )
    .await;

    let mut alice_nonce = 1;
    for height in 1..=options.blocks {
        let args: Vec<Word> = vec![height as Word];
        submit(
            &handle,
            signed(
                &params,
                &alice,
                TransactionType::Call,
                counter,
                0,
                args.to_bytes(),
                alice_nonce,
                10_000,
            ),
        )
        .await;
        alice_nonce += 1;

        tokio::select! {
            result = handle.produce_block() => match result {
                Ok(update) => info!(
                    "block {height}: {} with {} transactions",
                    update.hash,
                    update.new_tip.as_ref().map_or(0, |b| b.user_transactions().len())
                ),
                Err(e) => warn!("block {height} not produced: {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
                break;
            }
        }
    }

    let snapshot = handle.snapshot();
    println!("tip:      {} at height {}", snapshot.tip_hash, snapshot.height);
    println!("weight:   {}", snapshot.total_weight);
    for (name, key) in [("producer", &producer), ("alice", &alice), ("bob", &bob)] {
        println!(
            "{name:<9} {} balance={} nonce={}",
            key.address(),
            snapshot.state.balance(&key.address()),
            snapshot.state.nonce(&key.address())
        );
    }
    println!("counter:  {counter} balance={}", snapshot.state.balance(&counter));

    handle.shutdown().await;
    if let Err(e) = task.await {
        eprintln!("Node task error: {e:?}");
    }
}

const USAGE: &str = "\
Development Ledger

USAGE:
    {program} [OPTIONS]

OPTIONS:
    --consensus <pow|pos>   Block production mechanism (defaults to pow)
    --blocks <n>            Number of blocks to produce (defaults to 5)
    --log-level <level>     debug, info, warn or error (defaults to info)
    -h, --help              Print this help message

EXAMPLES:
    {program} --consensus pos --blocks 10
    {program} --log-level debug
";

fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
