//! Two-pass assembler for the stack machine.
//!
//! # Syntax
//!
//! ```text
//! loop:                 # a label marks the offset of the next instruction
//!     PUSH -1           ; immediates are decimal or 0x-prefixed hex
//!     JUMPI loop        # jump targets are labels or absolute offsets
//!     CALL 0x0b0b...0b, 2
//! ```
//!
//! - Mnemonics are case-insensitive
//! - Comments start with `#` or `;`
//! - Commas between operands are optional
//!
//! Operand layouts come from the same instruction table the interpreter is
//! generated from, so the two cannot drift apart.

use crate::types::address::Address;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::{Instruction, OperandKind};
use std::collections::HashMap;

const LABEL_SUFFIX: char = ':';

fn error(line: usize, message: impl Into<String>) -> VmError {
    VmError::Assembly {
        line,
        message: message.into(),
    }
}

fn strip_comment(line: &str) -> &str {
    let end = line.find(['#', ';']).unwrap_or(line.len());
    &line[..end]
}

/// One parsed source line that emits code.
struct Line<'a> {
    number: usize,
    instr: Instruction,
    operands: Vec<&'a str>,
}

fn parse_i64(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

/// Assembles source text into bytecode.
pub fn assemble(source: &str) -> Result<Vec<u8>, VmError> {
    let mut labels: HashMap<&str, u32> = HashMap::new();
    let mut lines = Vec::new();
    let mut offset = 0usize;

    // Pass 1: parse, size instructions and record label offsets.
    for (index, raw) in source.lines().enumerate() {
        let number = index + 1;
        let mut text = strip_comment(raw).trim();

        while let Some(pos) = text.find(LABEL_SUFFIX) {
            let label = text[..pos].trim();
            if label.is_empty() || label.contains(char::is_whitespace) {
                return Err(error(number, format!("invalid label `{label}`")));
            }
            let at = u32::try_from(offset).map_err(|_| error(number, "program too large"))?;
            if labels.insert(label, at).is_some() {
                return Err(error(number, format!("duplicate label `{label}`")));
            }
            text = text[pos + 1..].trim();
        }
        if text.is_empty() {
            continue;
        }

        let mut tokens = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty());
        let Some(mnemonic) = tokens.next() else {
            continue;
        };
        let instr = Instruction::from_mnemonic(&mnemonic.to_ascii_uppercase())
            .ok_or_else(|| error(number, format!("unknown instruction `{mnemonic}`")))?;
        let operands: Vec<&str> = tokens.collect();
        if operands.len() != instr.operands().len() {
            return Err(error(
                number,
                format!(
                    "{} takes {} operand(s), got {}",
                    instr.mnemonic(),
                    instr.operands().len(),
                    operands.len()
                ),
            ));
        }
        offset += instr.encoded_len();
        lines.push(Line {
            number,
            instr,
            operands,
        });
    }

    // Pass 2: emit.
    let mut out = Vec::with_capacity(offset);
    for line in &lines {
        out.push(line.instr as u8);
        for (kind, text) in line.instr.operands().iter().zip(&line.operands) {
            let bad = || error(line.number, format!("invalid {kind:?} operand `{text}`"));
            match kind {
                OperandKind::ImmI64 => {
                    let value = parse_i64(text).ok_or_else(bad)?;
                    out.extend_from_slice(&value.to_le_bytes());
                }
                OperandKind::ImmU8 => {
                    let value = parse_i64(text)
                        .and_then(|v| u8::try_from(v).ok())
                        .ok_or_else(bad)?;
                    out.push(value);
                }
                OperandKind::Target => {
                    let target = match labels.get(text) {
                        Some(at) => *at,
                        None => parse_i64(text)
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| {
                                error(line.number, format!("undefined label `{text}`"))
                            })?,
                    };
                    out.extend_from_slice(&target.to_le_bytes());
                }
                OperandKind::Addr => {
                    let address = Address::from_hex(text).ok_or_else(bad)?;
                    out.extend_from_slice(address.as_slice());
                }
            }
        }
    }
    Ok(out)
}

/// Renders bytecode back to one instruction per line, for diagnostics.
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut pc = 0;
    while pc < code.len() {
        let Ok(instr) = Instruction::try_from(code[pc]) else {
            out.push_str(&format!("{pc:04}: .byte 0x{:02x}\n", code[pc]));
            pc += 1;
            continue;
        };
        out.push_str(&format!("{pc:04}: {}", instr.mnemonic()));
        let mut cursor = pc + 1;
        for kind in instr.operands() {
            let Some(bytes) = code.get(cursor..cursor + kind.width()) else {
                out.push_str(" <truncated>");
                break;
            };
            let rendered = match kind {
                OperandKind::ImmI64 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    i64::from_le_bytes(buf).to_string()
                }
                OperandKind::ImmU8 => bytes[0].to_string(),
                OperandKind::Target => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(bytes);
                    u32::from_le_bytes(buf).to_string()
                }
                OperandKind::Addr => {
                    let mut buf = [0u8; 20];
                    buf.copy_from_slice(bytes);
                    Address(buf).to_string()
                }
            };
            out.push(' ');
            out.push_str(&rendered);
            cursor += kind.width();
        }
        out.push('\n');
        pc = cursor;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_push_and_arithmetic() {
        let code = assemble("PUSH 2\nPUSH 0x10\nadd\nRETURN").unwrap();
        let mut expected = vec![Instruction::Push as u8];
        expected.extend_from_slice(&2i64.to_le_bytes());
        expected.push(Instruction::Push as u8);
        expected.extend_from_slice(&16i64.to_le_bytes());
        expected.push(Instruction::Add as u8);
        expected.push(Instruction::Return as u8);
        assert_eq!(code, expected);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let code = assemble("start: PUSH 1\nJUMPI end\nJUMP start\nend:\nSTOP").unwrap();
        // PUSH (9) + JUMPI (5) + JUMP (5) = 19
        assert_eq!(&code[10..14], &19u32.to_le_bytes());
        assert_eq!(&code[15..19], &0u32.to_le_bytes());
    }

    #[test]
    fn comments_and_commas_are_ignored() {
        let addr = Address([0xAB; 20]);
        let code = assemble(&format!("CALL {addr}, 2 # call it\n; full line\n")).unwrap();
        assert_eq!(code.len(), 22);
        assert_eq!(code[21], 2);
    }

    #[test]
    fn negative_immediates() {
        let code = assemble("PUSH -5").unwrap();
        assert_eq!(&code[1..], &(-5i64).to_le_bytes());
    }

    #[test]
    fn errors_carry_line_numbers() {
        assert!(matches!(
            assemble("PUSH 1\nFROB"),
            Err(VmError::Assembly { line: 2, .. })
        ));
        assert!(matches!(
            assemble("PUSH"),
            Err(VmError::Assembly { line: 1, .. })
        ));
        assert!(matches!(
            assemble("JUMP nowhere"),
            Err(VmError::Assembly { line: 1, .. })
        ));
        assert!(matches!(
            assemble("a:\na:"),
            Err(VmError::Assembly { line: 2, .. })
        ));
        assert!(matches!(
            assemble("DUP 256"),
            Err(VmError::Assembly { line: 1, .. })
        ));
    }

    #[test]
    fn disassemble_lists_instructions() {
        let code = assemble("PUSH 7\nDUP 0\nADD\nRETURN").unwrap();
        assert_eq!(
            disassemble(&code),
            "0000: PUSH 7\n0009: DUP 0\n0011: ADD\n0012: RETURN\n"
        );
    }
}
