mod builder;
mod defs;
mod disasm;
mod op;
mod reader;

pub use builder::{BytecodeBuilder, Label};
pub use defs::{BlockId, CompiledBlock, CompiledDef, DefId, ExceptionHandler};
pub use disasm::{disassemble, disassemble_one};
pub use op::{Op, OpInfo, OperandKind, RmwOp};
pub use reader::BytecodeReader;

#[cfg(test)]
mod tests {
    use super::*;
    use types::TypeId;

    fn lines(code: &[u8]) -> Vec<String> {
        disassemble(code)
            .lines()
            .map(|l| l.split_once(": ").unwrap().1.to_string())
            .collect()
    }

    #[test]
    fn arithmetic_round_trip() {
        let mut b = BytecodeBuilder::new();
        b.put_i64(7);
        b.put_i64(5);
        b.op(Op::SubI64);
        b.put_i64(2);
        b.op(Op::CmpI64);
        b.op(Op::CmpEq);
        b.leave(1);

        assert_eq!(lines(b.as_bytes()), vec![
            "put_i64 7",
            "put_i64 5",
            "sub_i64",
            "put_i64 2",
            "cmp_i64",
            "cmp_eq",
            "leave 1",
        ]);
    }

    #[test]
    fn union_ops_round_trip() {
        let mut b = BytecodeBuilder::new();
        b.put_in_union(TypeId(3), 4, 16);
        b.union_is_a(16, TypeId(3));
        b.remove_from_union(16, 4);
        b.union_to_bool(16);

        assert_eq!(lines(b.as_bytes()), vec![
            "put_in_union t3 4 16",
            "union_is_a 16 t3",
            "remove_from_union 16 4",
            "union_to_bool 16",
        ]);
    }

    #[test]
    fn call_operand_is_a_table_index() {
        let mut b = BytecodeBuilder::new();
        b.call(DefId(9));
        let bytes = b.into_bytes();
        assert_eq!(bytes.len(), 1 + 8);
        assert_eq!(bytes[0], Op::Call as u8);
        assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), 9);
    }

    #[test]
    fn put_i64_encodes_little_endian() {
        let mut b = BytecodeBuilder::new();
        b.put_i64(-2);
        let bytes = b.into_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(
            i64::from_le_bytes(bytes[1..9].try_into().unwrap()),
            -2
        );
    }

    #[test]
    fn forward_branch_binds_absolute_target() {
        let mut b = BytecodeBuilder::new();
        let label = b.branch_unless();
        b.put_i64(1);
        b.bind(label);
        b.leave(8);

        // branch_unless is 1 + 4 bytes, put_i64 is 1 + 8.
        assert_eq!(lines(b.as_bytes()), vec![
            "branch_unless @14",
            "put_i64 1",
            "leave 8",
        ]);
    }

    #[test]
    fn backward_jump_uses_known_offset() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.op(Op::CmpEq);
        b.branch_if_to(top);

        assert_eq!(lines(b.as_bytes()), vec!["cmp_eq", "branch_if @0"]);
    }

    #[test]
    fn atomics_encode_byte_operands() {
        let mut b = BytecodeBuilder::new();
        b.atomicrmw(RmwOp::Add, 4, 0);
        b.cmpxchg(8, 0, 0);
        let bytes = b.as_bytes();
        assert_eq!(bytes.len(), 4 + 4);
        assert_eq!(lines(bytes), vec!["atomicrmw 0 4 0", "cmpxchg 8 0 0"]);
    }

    #[test]
    fn invalid_opcode_renders_as_raw_byte() {
        let code = [0xFFu8];
        assert_eq!(lines(&code), vec![".byte 0xff"]);
    }

    #[test]
    fn op_try_from_rejects_out_of_range() {
        assert!(Op::try_from(Op::COUNT as u8).is_err());
        assert_eq!(Op::try_from(0x00), Ok(Op::PutNil));
        assert_eq!(
            Op::try_from(Op::Unreachable as u8),
            Ok(Op::Unreachable)
        );
    }

    #[test]
    fn rmw_op_try_from() {
        assert_eq!(RmwOp::try_from(0), Ok(RmwOp::Add));
        assert_eq!(RmwOp::try_from(RmwOp::UMin as u8), Ok(RmwOp::UMin));
        assert!(RmwOp::try_from(RmwOp::UMin as u8 + 1).is_err());
    }

    #[test]
    fn every_op_has_a_distinct_mnemonic() {
        let mut seen = std::collections::HashSet::new();
        for byte in 0..Op::COUNT as u8 {
            let op = Op::try_from(byte).unwrap();
            assert!(
                seen.insert(op.info().name),
                "duplicate mnemonic {}",
                op.info().name
            );
        }
    }

    #[test]
    fn operand_widths_cover_the_encoding() {
        // A handler-visible sanity pass: the declared operand widths must
        // walk the stream exactly.
        let mut b = BytecodeBuilder::new();
        b.put_i64(1);
        b.get_local(0, 8);
        b.load_atomic(4, 0);
        b.unreachable(0);
        b.op(Op::PutNil);

        let mut reader = BytecodeReader::new(b.as_bytes());
        let mut count = 0;
        while let Some(op) = reader.next_op() {
            let op = op.unwrap();
            for kind in op.info().operands {
                unsafe {
                    match kind.width() {
                        1 => {
                            reader.read_u8();
                        }
                        4 => {
                            reader.read_u32();
                        }
                        8 => {
                            reader.read_u64();
                        }
                        _ => unreachable!(),
                    }
                }
            }
            count += 1;
        }
        assert_eq!(count, 5);
        assert!(reader.is_at_end());
    }

    #[test]
    fn exception_handler_interval_is_half_open() {
        let h = ExceptionHandler {
            start: 4,
            end: 10,
            target: 20,
            types: vec![],
            stack_depth: 0,
        };
        assert!(!h.covers(3));
        assert!(h.covers(4));
        assert!(h.covers(9));
        assert!(!h.covers(10));
    }
}
