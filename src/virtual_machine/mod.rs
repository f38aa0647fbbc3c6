//! Stack-based bytecode virtual machine for contract execution.
//!
//! # Architecture
//!
//! - **Words**: every stack item, argument and storage slot is an `i64`
//! - **Frames**: each call gets its own operand stack, bounded by
//!   [`vm::MAX_STACK_DEPTH`]; nesting is bounded by [`vm::MAX_CALL_DEPTH`]
//! - **Gas**: every instruction is charged before it runs; running out aborts
//!   the call and consumes the whole budget
//! - **Isolation**: writes are buffered in an [`state::OverlayState`] and
//!   reach the world state only if the entry call returns normally
//!
//! # Modules
//!
//! - [`assembler`]: text assembly to bytecode and back
//! - [`errors`]: assembly and execution faults
//! - [`gas`]: intrinsic transaction costs and the gas meter
//! - [`isa`]: instruction table and operand layouts
//! - [`state`]: contract state trait and overlay
//! - [`vm`]: the interpreter

pub mod assembler;
pub mod errors;
pub mod gas;
pub mod isa;
pub mod state;
pub mod vm;
