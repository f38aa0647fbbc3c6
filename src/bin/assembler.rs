//! Assembly to bytecode compiler CLI.
//!
//! Reads assembly source files and compiles them to contract bytecode. The
//! bytecode is written to a file and printed as hex, ready to be used as the
//! data of a `Deploy` transaction.
//!
//! # Usage
//! ```text
//! assembler <input.asm> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.asm`: Assembly source file to compile
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-p, --predict [price]`: Estimate deployment and call gas cost (price defaults to 1)
//! - `-d, --disassemble`: Print the compiled bytecode as text
//!
//! # Examples
//! ```text
//! assembler counter.asm
//! assembler counter.asm -o counter.bin
//! assembler counter.asm -p 100
//! ```

use ledger::core::transaction::TransactionType;
use ledger::types::address::Address;
use ledger::virtual_machine::assembler::{assemble, disassemble};
use ledger::virtual_machine::gas::intrinsic_gas;
use ledger::virtual_machine::state::ContractState;
use ledger::virtual_machine::vm::{CallContext, Vm, Word};
use ledger::{error, info, warn};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::process;

/// Gas a trial call may burn before the estimate gives up.
const TRIAL_GAS_LIMIT: u64 = 10_000_000;

/// Throwaway state holding only the contract under test.
#[derive(Default)]
struct Scratch {
    code: HashMap<Address, Vec<u8>>,
    storage: HashMap<(Address, Word), Word>,
    balances: HashMap<Address, u128>,
}

impl ContractState for Scratch {
    fn code(&self, address: &Address) -> Option<Vec<u8>> {
        self.code.get(address).cloned()
    }

    fn storage_get(&self, contract: &Address, key: Word) -> Word {
        self.storage.get(&(*contract, key)).copied().unwrap_or(0)
    }

    fn storage_set(&mut self, contract: &Address, key: Word, value: Word) {
        self.storage.insert((*contract, key), value);
    }

    fn balance(&self, address: &Address) -> u128 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    fn set_balance(&mut self, address: &Address, amount: u128) {
        self.balances.insert(*address, amount);
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut gas_price: Option<u64> = None;
    let mut show = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            "--predict" | "-p" => {
                // Check if next arg exists and is a valid number (not another flag)
                if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    i += 1;
                    let price = args[i].parse::<u64>().unwrap_or_else(|_| {
                        error!("Invalid gas price: '{}' is not a valid number", args[i]);
                        process::exit(1);
                    });
                    if price == 0 {
                        error!("Gas price must be greater than 0");
                        process::exit(1);
                    }
                    gas_price = Some(price);
                } else {
                    gas_price = Some(1);
                }
                i += 1;
            }
            "--disassemble" | "-d" => {
                show = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let source = fs::read_to_string(input_path).unwrap_or_else(|e| {
        error!("Cannot read {input_path}: {e}");
        process::exit(1);
    });

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let bytecode = match assemble(&source) {
        Ok(code) => code,
        Err(e) => {
            error!("Assembly failed: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = fs::write(&output_path, &bytecode) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} bytes)",
        input_path,
        output_path,
        bytecode.len()
    );

    println!("{}", to_hex(&bytecode));
    if show {
        print!("{}", disassemble(&bytecode));
    }

    if let Some(price) = gas_price {
        predict(bytecode, price);
    }
}

/// Prints the deployment cost and the cost of one argument-less call.
fn predict(bytecode: Vec<u8>, price: u64) {
    let deploy = intrinsic_gas(TransactionType::Deploy, bytecode.len());

    let contract = Address::contract(&Address::zero(), 0);
    let mut scratch = Scratch::default();
    scratch.code.insert(contract, bytecode);
    let ctx = CallContext {
        caller: Address::zero(),
        contract,
        value: 0,
        args: Vec::new(),
        height: 1,
    };
    let execution = Vm::execute(&mut scratch, ctx, TRIAL_GAS_LIMIT);
    let call = intrinsic_gas(TransactionType::Call, 0) + execution.gas_used;

    let rows = [("deploy", deploy), ("call", call)];
    let width = rows
        .iter()
        .map(|(_, gas)| format_with_commas(gas * price).len())
        .max()
        .unwrap_or(0);

    println!("Gas Estimate (price {price}):");
    println!("{}", "-".repeat(width + 24));
    for (name, gas) in rows {
        println!(
            "{name:<8} {:>12} gas  {:>width$}",
            format_with_commas(gas),
            format_with_commas(gas * price)
        );
    }

    match execution.result {
        Ok(value) => info!("Trial call returned {value} with {} logs", execution.logs.len()),
        Err(e) => warn!("Trial call without arguments failed: {e}"),
    }
    warn!("Actual cost will depend on chain state and call arguments.");
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn format_with_commas(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i).is_multiple_of(3) {
            result.push(',');
        }
        result.push(c);
    }
    result
}

const USAGE: &str = "\
Assembly Compiler

USAGE:
    {program} <input.asm> [OPTIONS]

ARGS:
    <input.asm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>     Output file path (defaults to <input>.bin)
    -p, --predict [price]   Estimate deployment and call gas cost (price defaults to 1)
    -d, --disassemble       Print the compiled bytecode as text
    -h, --help              Print this help message

EXAMPLES:
    # Compile to default output name
    {program} counter.asm

    # Compile with explicit output
    {program} counter.asm -o counter.bin

    # Compile and estimate gas cost with custom price
    {program} counter.asm -p 100
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
