//! Instruction set of the stack machine.
//!
//! [`for_each_instruction!`](crate::for_each_instruction) holds the canonical
//! table and hands it to a callback macro, so the interpreter and the
//! assembler are generated from one list.
//!
//! # Bytecode format
//!
//! - Opcode: 1 byte
//! - `ImmI64`: 8 bytes, little-endian
//! - `ImmU8`: 1 byte
//! - `Target`: 4 bytes, little-endian absolute code offset
//! - `Addr`: 20 bytes, a contract or account address
//!
//! Binary operators pop `b` then `a` and push `a op b`.

use crate::virtual_machine::errors::VmError;

#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Stack
            // =========================
            /// STOP ; halt the current frame, returning 0
            Stop = 0x00, "STOP" => [], 0,
            /// PUSH imm ; push a 64-bit immediate
            Push = 0x01, "PUSH" => [imm: ImmI64], 3,
            /// POP ; discard the top item
            Pop = 0x02, "POP" => [], 2,
            /// DUP n ; push a copy of the n-th item from the top (0 = top)
            Dup = 0x03, "DUP" => [depth: ImmU8], 3,
            /// SWAP n ; exchange the top with the item n+1 places below it
            Swap = 0x04, "SWAP" => [depth: ImmU8], 3,
            // =========================
            // Arithmetic and logic
            // =========================
            /// ADD ; a + b (wrapping)
            Add = 0x10, "ADD" => [], 3,
            /// SUB ; a - b (wrapping)
            Sub = 0x11, "SUB" => [], 3,
            /// MUL ; a * b (wrapping)
            Mul = 0x12, "MUL" => [], 5,
            /// DIV ; a / b, faults on b = 0
            Div = 0x13, "DIV" => [], 5,
            /// MOD ; a % b, faults on b = 0
            Mod = 0x14, "MOD" => [], 5,
            /// LT ; a < b
            Lt = 0x15, "LT" => [], 3,
            /// GT ; a > b
            Gt = 0x16, "GT" => [], 3,
            /// EQ ; a == b
            Eq = 0x17, "EQ" => [], 3,
            /// ISZERO ; a == 0
            IsZero = 0x18, "ISZERO" => [], 3,
            /// AND ; bitwise and
            And = 0x19, "AND" => [], 3,
            /// OR ; bitwise or
            Or = 0x1A, "OR" => [], 3,
            /// XOR ; bitwise xor
            Xor = 0x1B, "XOR" => [], 3,
            /// NOT ; bitwise not
            Not = 0x1C, "NOT" => [], 3,
            // =========================
            // Control flow
            // =========================
            /// JUMP target ; continue at target
            Jump = 0x20, "JUMP" => [target: Target], 8,
            /// JUMPI target ; pop cond, jump when non-zero
            JumpI = 0x21, "JUMPI" => [target: Target], 10,
            // =========================
            // Storage
            // =========================
            /// SLOAD ; pop key, push storage[key] (0 if unset)
            SLoad = 0x30, "SLOAD" => [], 50,
            /// SSTORE ; pop value, pop key, storage[key] = value
            SStore = 0x31, "SSTORE" => [], 200,
            // =========================
            // Environment
            // =========================
            /// CALLVALUE ; push the value sent with this call
            CallValue = 0x40, "CALLVALUE" => [], 2,
            /// ARG i ; push argument i (0 if absent)
            Arg = 0x41, "ARG" => [index: ImmU8], 3,
            /// ARGC ; push the number of arguments
            ArgCount = 0x42, "ARGC" => [], 2,
            /// BALANCE ; push this contract's balance
            Balance = 0x43, "BALANCE" => [], 20,
            /// HEIGHT ; push the height of the block being built
            Height = 0x44, "HEIGHT" => [], 2,
            /// TRANSFER addr ; pop amount, send it from this contract to addr
            Transfer = 0x45, "TRANSFER" => [to: Addr], 100,
            // =========================
            // Calls
            // =========================
            /// CALL addr, argc ; pop argc args, run addr's code, push its return value
            Call = 0x50, "CALL" => [target: Addr, argc: ImmU8], 100,
            /// RETURN ; pop a value and return it to the caller
            Return = 0x51, "RETURN" => [], 5,
            /// REVERT ; pop a reason code and abort the transaction
            Revert = 0x52, "REVERT" => [], 0,
            /// ASSERT ; pop cond, revert when zero
            Assert = 0x53, "ASSERT" => [], 1,
            // =========================
            // Misc
            // =========================
            /// LOG ; pop a value and append it to the receipt logs
            Log = 0x60, "LOG" => [], 20,
            /// SHA3 ; pop a, push the first 8 bytes of SHA3(a) as a word
            Sha3 = 0x61, "SHA3" => [], 30,
        }
    };
}

/// Operand encodings, with their byte widths.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    ImmI64,
    ImmU8,
    Target,
    Addr,
}

impl OperandKind {
    pub const fn width(&self) -> usize {
        match self {
            OperandKind::ImmI64 => 8,
            OperandKind::ImmU8 => 1,
            OperandKind::Target => 4,
            OperandKind::Addr => 20,
        }
    }
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ], $gas:expr
        ),* $(,)?
    ) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VmError::IllegalInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// Every instruction, in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Fixed gas charged before the instruction executes.
            pub const fn base_gas(&self) -> u64 {
                match self {
                    $( Instruction::$name => $gas, )*
                }
            }

            pub const fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind, )* ], )*
                }
            }

            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                match name {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

impl Instruction {
    /// Encoded size including the opcode byte.
    pub fn encoded_len(&self) -> usize {
        1 + self.operands().iter().map(OperandKind::width).sum::<usize>()
    }
}

/// Marks the offsets at which an instruction begins.
///
/// Jumps may only land on these. Unknown opcodes occupy one byte; decoding
/// them later raises `IllegalInstruction`.
pub fn instruction_starts(code: &[u8]) -> Vec<bool> {
    let mut starts = vec![false; code.len()];
    let mut pc = 0;
    while pc < code.len() {
        starts[pc] = true;
        pc += match Instruction::try_from(code[pc]) {
            Ok(instr) => instr.encoded_len(),
            Err(_) => 1,
        };
    }
    starts
}
