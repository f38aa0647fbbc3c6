use thiserror::Error;

/// Errors raised while assembling or executing contract bytecode.
///
/// Every execution error aborts the whole call tree and discards its storage
/// overlay. `Reverted` is an explicit contract decision; the rest are faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("out of gas: needed {needed}, remaining {remaining}")]
    OutOfGas { needed: u64, remaining: u64 },
    #[error("stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },
    #[error("stack overflow at offset {offset}")]
    StackOverflow { offset: usize },
    #[error("call depth limit {limit} exceeded")]
    CallDepthExceeded { limit: usize },
    #[error("illegal instruction 0x{opcode:02x} at offset {offset}")]
    IllegalInstruction { opcode: u8, offset: usize },
    #[error("truncated operand at offset {offset}")]
    UnexpectedEndOfBytecode { offset: usize },
    #[error("jump to {target} is outside the code")]
    InvalidJump { target: u32 },
    #[error("division by zero at offset {offset}")]
    DivisionByZero { offset: usize },
    #[error("call to {0}, which has no code")]
    NoCode(String),
    #[error("insufficient contract balance for transfer of {amount}")]
    InsufficientBalance { amount: u128 },
    #[error("negative value {0} where an amount was expected")]
    NegativeAmount(i64),
    #[error("reverted: {0}")]
    Reverted(String),
    #[error("line {line}: {message}")]
    Assembly { line: usize, message: String },
}

impl VmError {
    /// Stack under/overflow, the `StackFault` class.
    pub fn is_stack_fault(&self) -> bool {
        matches!(
            self,
            VmError::StackUnderflow { .. } | VmError::StackOverflow { .. }
        )
    }
}
