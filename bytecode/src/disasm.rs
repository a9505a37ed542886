use core::fmt::Write;

use crate::op::{Op, OperandKind};
use crate::reader::BytecodeReader;

/// Render one instruction at the reader's current position.
///
/// The reader is left positioned at the next instruction. Returns `None` at
/// end-of-stream; a byte that is not a valid opcode renders as `.byte 0xNN`
/// and advances by one.
pub fn disassemble_one(reader: &mut BytecodeReader<'_>) -> Option<String> {
    let op = match reader.next_op()? {
        Ok(op) => op,
        Err(byte) => return Some(format!(".byte 0x{byte:02x}")),
    };

    let info = op.info();
    let mut out = String::from(info.name);
    for kind in info.operands {
        // SAFETY: well-formed bytecode carries the full operand encoding
        // declared in the opcode table.
        unsafe {
            match kind {
                OperandKind::U8 => {
                    write!(out, " {}", reader.read_u8()).unwrap()
                }
                OperandKind::U32 => {
                    write!(out, " {}", reader.read_u32()).unwrap()
                }
                OperandKind::I64 => {
                    write!(out, " {}", reader.read_i64()).unwrap()
                }
                OperandKind::Target => {
                    write!(out, " @{}", reader.read_u32()).unwrap()
                }
                OperandKind::Table => {
                    write!(out, " #{}", reader.read_u64()).unwrap()
                }
                OperandKind::Type => {
                    write!(out, " t{}", reader.read_u32()).unwrap()
                }
            }
        }
    }
    Some(out)
}

/// Render a whole bytecode buffer, one `offset: mnemonic operands` line per
/// instruction.
pub fn disassemble(code: &[u8]) -> String {
    let mut reader = BytecodeReader::new(code);
    let mut out = String::new();
    loop {
        let offset = reader.offset();
        match disassemble_one(&mut reader) {
            Some(line) => writeln!(out, "{offset:6}: {line}").unwrap(),
            None => break,
        }
    }
    out
}
