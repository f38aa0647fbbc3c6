//! Stack-machine interpreter.
//!
//! Each contract call gets a [`Frame`] pushed onto an explicit frame stack;
//! the interpreter loop always executes the top frame, so nested calls never
//! recurse on the native stack and the depth limit is a plain length check.
//! All arithmetic is wrapping. Gas is charged before every instruction and the
//! run aborts as soon as the budget cannot cover the next one.

use crate::core::receipt::Log;
use crate::types::address::{ADDRESS_SIZE, Address};
use crate::types::hash::Hash;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::gas::GasMeter;
use crate::virtual_machine::isa::{Instruction, instruction_starts};
use crate::virtual_machine::state::{ContractState, OverlayState};

/// Machine word: every stack slot, storage key and storage value.
pub type Word = i64;

/// Maximum operand stack depth per frame.
pub const MAX_STACK_DEPTH: usize = 1024;
/// Maximum number of simultaneously active frames, the entry call included.
pub const MAX_CALL_DEPTH: usize = 16;

/// Entry point description for one contract call.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub caller: Address,
    pub contract: Address,
    /// Native value already credited to `contract` for this call.
    pub value: u128,
    pub args: Vec<Word>,
    /// Height of the block the call executes in.
    pub height: u64,
}

/// Result of a metered run.
#[derive(Debug)]
pub struct Execution {
    /// Value returned by the entry frame, or the fault that aborted the run.
    pub result: Result<Word, VmError>,
    /// The whole budget when the run ran out of gas.
    pub gas_used: u64,
    /// Logs emitted; empty when the run failed.
    pub logs: Vec<Log>,
}

struct Frame {
    code: Vec<u8>,
    starts: Vec<bool>,
    pc: usize,
    stack: Vec<Word>,
    contract: Address,
    value: u128,
    args: Vec<Word>,
}

impl Frame {
    fn new(code: Vec<u8>, contract: Address, value: u128, args: Vec<Word>) -> Self {
        let starts = instruction_starts(&code);
        Self {
            code,
            starts,
            pc: 0,
            stack: Vec::new(),
            contract,
            value,
            args,
        }
    }

    fn pop(&mut self, offset: usize) -> Result<Word, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { offset })
    }

    fn push(&mut self, value: Word, offset: usize) -> Result<(), VmError> {
        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(VmError::StackOverflow { offset });
        }
        self.stack.push(value);
        Ok(())
    }

    fn read<const N: usize>(&mut self) -> Result<[u8; N], VmError> {
        let end = self.pc + N;
        let bytes = self
            .code
            .get(self.pc..end)
            .and_then(|slice| <[u8; N]>::try_from(slice).ok())
            .ok_or(VmError::UnexpectedEndOfBytecode { offset: self.pc })?;
        self.pc = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, VmError> {
        Ok(self.read::<1>()?[0])
    }

    fn read_i64(&mut self) -> Result<i64, VmError> {
        Ok(i64::from_le_bytes(self.read::<8>()?))
    }

    fn read_target(&mut self) -> Result<usize, VmError> {
        let target = u32::from_le_bytes(self.read::<4>()?);
        match self.starts.get(target as usize) {
            Some(true) => Ok(target as usize),
            _ => Err(VmError::InvalidJump { target }),
        }
    }

    fn read_address(&mut self) -> Result<Address, VmError> {
        Ok(Address(self.read::<ADDRESS_SIZE>()?))
    }
}

/// What the loop does after one instruction.
enum Step {
    Continue,
    Return(Word),
    Call {
        target: Address,
        code: Vec<u8>,
        args: Vec<Word>,
    },
}

pub struct Vm {
    frames: Vec<Frame>,
    gas: GasMeter,
    logs: Vec<Log>,
    height: u64,
}

fn clamp_to_word(value: u128) -> Word {
    Word::try_from(value).unwrap_or(Word::MAX)
}

fn flag(cond: bool) -> Word {
    Word::from(cond)
}

impl Vm {
    /// Runs `ctx.contract` with a fresh gas budget.
    ///
    /// Every storage and balance write goes to an overlay that reaches
    /// `state` only if the entry frame returns normally.
    pub fn execute<S: ContractState + ?Sized>(
        state: &mut S,
        ctx: CallContext,
        gas_limit: u64,
    ) -> Execution {
        let mut vm = Vm {
            frames: Vec::with_capacity(4),
            gas: GasMeter::new(gas_limit),
            logs: Vec::new(),
            height: ctx.height,
        };

        let mut overlay = OverlayState::new(state);
        let result = vm.run(&mut overlay, ctx);

        let gas_used = match &result {
            Err(VmError::OutOfGas { .. }) => vm.gas.limit(),
            _ => vm.gas.used(),
        };
        let logs = if result.is_ok() {
            overlay.commit();
            vm.logs
        } else {
            Vec::new()
        };

        Execution {
            result,
            gas_used,
            logs,
        }
    }

    fn run<S: ContractState + ?Sized>(
        &mut self,
        state: &mut S,
        ctx: CallContext,
    ) -> Result<Word, VmError> {
        let code = state
            .code(&ctx.contract)
            .ok_or_else(|| VmError::NoCode(ctx.contract.to_string()))?;
        self.frames
            .push(Frame::new(code, ctx.contract, ctx.value, ctx.args));

        loop {
            match self.step(state)? {
                Step::Continue => {}
                Step::Call { target, code, args } => {
                    if self.frames.len() >= MAX_CALL_DEPTH {
                        return Err(VmError::CallDepthExceeded {
                            limit: MAX_CALL_DEPTH,
                        });
                    }
                    self.frames.push(Frame::new(code, target, 0, args));
                }
                Step::Return(value) => {
                    self.frames.pop();
                    match self.frames.last_mut() {
                        Some(parent) => {
                            let offset = parent.pc;
                            parent.push(value, offset)?;
                        }
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    /// Executes one instruction of the top frame.
    fn step<S: ContractState + ?Sized>(&mut self, state: &mut S) -> Result<Step, VmError> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(Step::Return(0));
        };
        let offset = frame.pc;
        let Some(&opcode) = frame.code.get(offset) else {
            // Running off the end is an implicit STOP.
            return Ok(Step::Return(0));
        };
        let instr = Instruction::try_from(opcode)
            .map_err(|_| VmError::IllegalInstruction { opcode, offset })?;
        self.gas.charge(instr.base_gas())?;
        frame.pc += 1;

        macro_rules! binop {
            (|$a:ident, $b:ident| $body:expr) => {{
                let $b = frame.pop(offset)?;
                let $a = frame.pop(offset)?;
                frame.push($body, offset)?;
            }};
        }

        match instr {
            Instruction::Stop => return Ok(Step::Return(0)),
            Instruction::Push => {
                let imm = frame.read_i64()?;
                frame.push(imm, offset)?;
            }
            Instruction::Pop => {
                frame.pop(offset)?;
            }
            Instruction::Dup => {
                let depth = frame.read_u8()? as usize;
                let index = frame
                    .stack
                    .len()
                    .checked_sub(depth + 1)
                    .ok_or(VmError::StackUnderflow { offset })?;
                let value = frame.stack[index];
                frame.push(value, offset)?;
            }
            Instruction::Swap => {
                let depth = frame.read_u8()? as usize;
                let top = frame
                    .stack
                    .len()
                    .checked_sub(1)
                    .ok_or(VmError::StackUnderflow { offset })?;
                let other = top
                    .checked_sub(depth + 1)
                    .ok_or(VmError::StackUnderflow { offset })?;
                frame.stack.swap(top, other);
            }
            Instruction::Add => binop!(|a, b| a.wrapping_add(b)),
            Instruction::Sub => binop!(|a, b| a.wrapping_sub(b)),
            Instruction::Mul => binop!(|a, b| a.wrapping_mul(b)),
            Instruction::Div => {
                let b = frame.pop(offset)?;
                let a = frame.pop(offset)?;
                if b == 0 {
                    return Err(VmError::DivisionByZero { offset });
                }
                frame.push(a.wrapping_div(b), offset)?;
            }
            Instruction::Mod => {
                let b = frame.pop(offset)?;
                let a = frame.pop(offset)?;
                if b == 0 {
                    return Err(VmError::DivisionByZero { offset });
                }
                frame.push(a.wrapping_rem(b), offset)?;
            }
            Instruction::Lt => binop!(|a, b| flag(a < b)),
            Instruction::Gt => binop!(|a, b| flag(a > b)),
            Instruction::Eq => binop!(|a, b| flag(a == b)),
            Instruction::And => binop!(|a, b| a & b),
            Instruction::Or => binop!(|a, b| a | b),
            Instruction::Xor => binop!(|a, b| a ^ b),
            Instruction::IsZero => {
                let a = frame.pop(offset)?;
                frame.push(flag(a == 0), offset)?;
            }
            Instruction::Not => {
                let a = frame.pop(offset)?;
                frame.push(!a, offset)?;
            }
            Instruction::Jump => {
                frame.pc = frame.read_target()?;
            }
            Instruction::JumpI => {
                let target = frame.read_target()?;
                if frame.pop(offset)? != 0 {
                    frame.pc = target;
                }
            }
            Instruction::SLoad => {
                let key = frame.pop(offset)?;
                let value = state.storage_get(&frame.contract, key);
                frame.push(value, offset)?;
            }
            Instruction::SStore => {
                let value = frame.pop(offset)?;
                let key = frame.pop(offset)?;
                state.storage_set(&frame.contract, key, value);
            }
            Instruction::CallValue => {
                let value = clamp_to_word(frame.value);
                frame.push(value, offset)?;
            }
            Instruction::Arg => {
                let index = frame.read_u8()? as usize;
                let value = frame.args.get(index).copied().unwrap_or(0);
                frame.push(value, offset)?;
            }
            Instruction::ArgCount => {
                let count = frame.args.len() as Word;
                frame.push(count, offset)?;
            }
            Instruction::Balance => {
                let balance = clamp_to_word(state.balance(&frame.contract));
                frame.push(balance, offset)?;
            }
            Instruction::Height => {
                frame.push(clamp_to_word(u128::from(self.height)), offset)?;
            }
            Instruction::Transfer => {
                let to = frame.read_address()?;
                let amount = frame.pop(offset)?;
                let amount = u128::try_from(amount).map_err(|_| VmError::NegativeAmount(amount))?;
                if !state.transfer(&frame.contract, &to, amount) {
                    return Err(VmError::InsufficientBalance { amount });
                }
            }
            Instruction::Call => {
                let target = frame.read_address()?;
                let argc = frame.read_u8()? as usize;
                if frame.stack.len() < argc {
                    return Err(VmError::StackUnderflow { offset });
                }
                let args = frame.stack.split_off(frame.stack.len() - argc);
                let code = state
                    .code(&target)
                    .ok_or_else(|| VmError::NoCode(target.to_string()))?;
                return Ok(Step::Call { target, code, args });
            }
            Instruction::Return => {
                let value = frame.pop(offset)?;
                return Ok(Step::Return(value));
            }
            Instruction::Revert => {
                let reason = frame.pop(offset).unwrap_or(0);
                return Err(VmError::Reverted(format!("code {reason}")));
            }
            Instruction::Assert => {
                if frame.pop(offset)? == 0 {
                    return Err(VmError::Reverted(format!(
                        "assertion failed at offset {offset}"
                    )));
                }
            }
            Instruction::Log => {
                let value = frame.pop(offset)?;
                self.logs.push(Log {
                    contract: frame.contract,
                    value,
                });
            }
            Instruction::Sha3 => {
                let a = frame.pop(offset)?;
                let digest = Hash::sha3().chain(a.to_le_bytes()).finalize();
                let mut word = [0u8; 8];
                word.copy_from_slice(&digest.0[..8]);
                frame.push(Word::from_le_bytes(word), offset)?;
            }
        }
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::assembler::assemble;
    use crate::virtual_machine::state::tests::TestState;

    const CALLER: Address = Address([0xCA; 20]);
    const CONTRACT: Address = Address([0xC0; 20]);
    const OTHER: Address = Address([0x0B; 20]);

    fn state_with(code: &str) -> TestState {
        let mut state = TestState::default();
        state.code.insert(CONTRACT, assemble(code).expect("assemble"));
        state
    }

    fn ctx(args: Vec<Word>) -> CallContext {
        CallContext {
            caller: CALLER,
            contract: CONTRACT,
            value: 0,
            args,
            height: 5,
        }
    }

    fn run(state: &mut TestState, gas: u64) -> Execution {
        Vm::execute(state, ctx(vec![]), gas)
    }

    // ==================== Arithmetic ====================

    #[test]
    fn arithmetic_and_return() {
        let mut state = state_with("PUSH 6\nPUSH 7\nMUL\nPUSH 2\nSUB\nRETURN");
        assert_eq!(run(&mut state, 1_000).result, Ok(40));
    }

    #[test]
    fn comparison_order_is_a_op_b() {
        let mut state = state_with("PUSH 1\nPUSH 2\nLT\nRETURN");
        assert_eq!(run(&mut state, 1_000).result, Ok(1));
        let mut state = state_with("PUSH 1\nPUSH 2\nGT\nRETURN");
        assert_eq!(run(&mut state, 1_000).result, Ok(0));
    }

    #[test]
    fn arithmetic_wraps() {
        let mut state = state_with(&format!("PUSH {}\nPUSH 1\nADD\nRETURN", i64::MAX));
        assert_eq!(run(&mut state, 1_000).result, Ok(i64::MIN));
    }

    #[test]
    fn division_by_zero_faults() {
        let mut state = state_with("PUSH 1\nPUSH 0\nDIV\nRETURN");
        assert!(matches!(
            run(&mut state, 1_000).result,
            Err(VmError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn dup_and_swap() {
        let mut state = state_with("PUSH 1\nPUSH 2\nSWAP 0\nDUP 1\nSUB\nRETURN");
        // stack after SWAP: [2, 1]; DUP 1 -> [2, 1, 2]; SUB -> [2, -1]
        assert_eq!(run(&mut state, 1_000).result, Ok(-1));
    }

    #[test]
    fn running_off_the_end_returns_zero() {
        let mut state = state_with("PUSH 1");
        assert_eq!(run(&mut state, 1_000).result, Ok(0));
    }

    // ==================== Faults ====================

    #[test]
    fn stack_underflow_is_a_fault() {
        let mut state = state_with("ADD");
        let err = run(&mut state, 1_000).result.unwrap_err();
        assert!(err.is_stack_fault());
    }

    #[test]
    fn stack_overflow_is_a_fault() {
        let mut state = state_with("loop:\nPUSH 1\nJUMP loop");
        let err = run(&mut state, 1_000_000).result.unwrap_err();
        assert_eq!(err, VmError::StackOverflow { offset: 0 });
    }

    #[test]
    fn illegal_opcode_is_reported_with_offset() {
        let mut state = TestState::default();
        state.code.insert(CONTRACT, vec![0x01, 1, 0, 0, 0, 0, 0, 0, 0, 0xEE]);
        assert_eq!(
            run(&mut state, 1_000).result,
            Err(VmError::IllegalInstruction {
                opcode: 0xEE,
                offset: 9
            })
        );
    }

    #[test]
    fn truncated_operand_is_reported() {
        let mut state = TestState::default();
        state.code.insert(CONTRACT, vec![0x01, 1, 2]);
        assert!(matches!(
            run(&mut state, 1_000).result,
            Err(VmError::UnexpectedEndOfBytecode { .. })
        ));
    }

    #[test]
    fn jump_into_operand_bytes_is_rejected() {
        let mut state = TestState::default();
        // PUSH 0 ; JUMP 1 (inside PUSH's immediate)
        let mut code = vec![0x01];
        code.extend_from_slice(&0i64.to_le_bytes());
        code.push(Instruction::Jump as u8);
        code.extend_from_slice(&1u32.to_le_bytes());
        state.code.insert(CONTRACT, code);
        assert_eq!(
            run(&mut state, 1_000).result,
            Err(VmError::InvalidJump { target: 1 })
        );
    }

    // ==================== Gas ====================

    #[test]
    fn zero_gas_fails_on_first_instruction() {
        let mut state = state_with("PUSH 1\nRETURN");
        let exec = run(&mut state, 0);
        assert_eq!(
            exec.result,
            Err(VmError::OutOfGas {
                needed: 3,
                remaining: 0
            })
        );
        assert_eq!(exec.gas_used, 0);
    }

    #[test]
    fn gas_used_matches_schedule() {
        let mut state = state_with("PUSH 1\nPUSH 2\nADD\nRETURN");
        let exec = run(&mut state, 1_000);
        assert_eq!(exec.result, Ok(3));
        assert_eq!(exec.gas_used, 3 + 3 + 3 + 5);
    }

    #[test]
    fn infinite_loop_terminates_by_gas() {
        let mut state = state_with("top:\nJUMP top");
        let exec = run(&mut state, 10_000);
        assert!(matches!(exec.result, Err(VmError::OutOfGas { .. })));
        assert_eq!(exec.gas_used, 10_000);
    }

    // ==================== Storage atomicity ====================

    #[test]
    fn storage_commits_on_success() {
        let mut state = state_with("PUSH 1\nPUSH 99\nSSTORE\nPUSH 1\nSLOAD\nRETURN");
        assert_eq!(run(&mut state, 10_000).result, Ok(99));
        assert_eq!(state.storage_get(&CONTRACT, 1), 99);
    }

    #[test]
    fn out_of_gas_discards_storage_and_transfers() {
        let src = format!(
            "PUSH 1\nPUSH 99\nSSTORE\nPUSH 10\nTRANSFER {OTHER}\nloop:\nJUMP loop"
        );
        let mut state = state_with(&src);
        state.balances.insert(CONTRACT, 50);

        let exec = run(&mut state, 5_000);
        assert!(matches!(exec.result, Err(VmError::OutOfGas { .. })));
        assert_eq!(state.storage_get(&CONTRACT, 1), 0);
        assert_eq!(state.balance(&CONTRACT), 50);
        assert_eq!(state.balance(&OTHER), 0);
    }

    #[test]
    fn revert_discards_writes_and_logs() {
        let mut state = state_with("PUSH 1\nPUSH 2\nSSTORE\nPUSH 7\nLOG\nPUSH 3\nREVERT");
        let exec = run(&mut state, 10_000);
        assert_eq!(exec.result, Err(VmError::Reverted("code 3".into())));
        assert!(exec.logs.is_empty());
        assert_eq!(state.storage_get(&CONTRACT, 1), 0);
    }

    #[test]
    fn failed_assert_reverts() {
        let mut state = state_with("PUSH 0\nASSERT");
        assert!(matches!(
            run(&mut state, 1_000).result,
            Err(VmError::Reverted(_))
        ));
    }

    // ==================== Environment ====================

    #[test]
    fn args_and_height() {
        let mut state = state_with("ARG 0\nARG 1\nADD\nARG 9\nADD\nHEIGHT\nADD\nARGC\nADD\nRETURN");
        let exec = Vm::execute(&mut state, ctx(vec![10, 20]), 1_000);
        assert_eq!(exec.result, Ok(10 + 20 + 0 + 5 + 2));
    }

    #[test]
    fn transfer_moves_contract_funds() {
        let mut state = state_with(&format!("PUSH 30\nTRANSFER {OTHER}\nBALANCE\nRETURN"));
        state.balances.insert(CONTRACT, 100);
        assert_eq!(run(&mut state, 1_000).result, Ok(70));
        assert_eq!(state.balance(&OTHER), 30);
    }

    #[test]
    fn transfer_beyond_balance_faults() {
        let mut state = state_with(&format!("PUSH 30\nTRANSFER {OTHER}"));
        assert_eq!(
            run(&mut state, 1_000).result,
            Err(VmError::InsufficientBalance { amount: 30 })
        );
    }

    #[test]
    fn logs_survive_success() {
        let mut state = state_with("PUSH 4\nLOG\nSTOP");
        let exec = run(&mut state, 1_000);
        assert_eq!(
            exec.logs,
            vec![Log {
                contract: CONTRACT,
                value: 4
            }]
        );
    }

    // ==================== Calls ====================

    #[test]
    fn nested_call_returns_value_to_caller() {
        let mut state = state_with(&format!("PUSH 20\nPUSH 22\nCALL {OTHER} 2\nRETURN"));
        state
            .code
            .insert(OTHER, assemble("ARG 0\nARG 1\nADD\nRETURN").unwrap());
        assert_eq!(run(&mut state, 10_000).result, Ok(42));
    }

    #[test]
    fn callee_storage_is_namespaced() {
        let mut state = state_with(&format!("CALL {OTHER} 0\nPOP\nPUSH 1\nSLOAD\nRETURN"));
        state
            .code
            .insert(OTHER, assemble("PUSH 1\nPUSH 5\nSSTORE\nSTOP").unwrap());
        assert_eq!(run(&mut state, 10_000).result, Ok(0));
        assert_eq!(state.storage_get(&OTHER, 1), 5);
    }

    #[test]
    fn self_recursion_hits_call_depth_limit() {
        let mut state = state_with(&format!("CALL {CONTRACT} 0\nRETURN"));
        assert_eq!(
            run(&mut state, 1_000_000).result,
            Err(VmError::CallDepthExceeded {
                limit: MAX_CALL_DEPTH
            })
        );
    }

    #[test]
    fn call_depth_failure_discards_every_frame_write() {
        let src = format!("PUSH 1\nPUSH 1\nSSTORE\nCALL {CONTRACT} 0\nRETURN");
        let mut state = state_with(&src);
        let exec = run(&mut state, 1_000_000);
        assert!(matches!(exec.result, Err(VmError::CallDepthExceeded { .. })));
        assert_eq!(state.storage_get(&CONTRACT, 1), 0);
    }

    #[test]
    fn call_to_account_without_code_faults() {
        let mut state = state_with(&format!("CALL {OTHER} 0"));
        assert!(matches!(
            run(&mut state, 1_000).result,
            Err(VmError::NoCode(_))
        ));
    }

    #[test]
    fn execution_is_deterministic() {
        let src = "PUSH 12345\nSHA3\nPUSH 3\nMUL\nRETURN";
        let a = run(&mut state_with(src), 1_000).result;
        let b = run(&mut state_with(src), 1_000).result;
        assert_eq!(a, b);
        assert!(a.is_ok());
    }
}
