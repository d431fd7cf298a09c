//! Instruction word decoding and classification.
//!
//! A fetched word is never unpacked into per-format structs. The same bits
//! mean different things depending on the format, so `Instruction` keeps the
//! raw word and every field or immediate is a pure extraction from it.

use std::fmt;

use num_enum::TryFromPrimitive;

use crate::Ixlen;

/// Sign extends the low `bits` bits of `value`.
///
/// The sign bit is moved to bit 31 and an arithmetic shift brings it back.
#[inline]
pub const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// One 32 bit instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(u32);

impl Instruction {
    pub const fn new(word: u32) -> Self {
        Instruction(word)
    }

    pub const fn word(self) -> u32 {
        self.0
    }

    /// Bits [6:0]
    #[inline]
    pub const fn opcode(self) -> u8 {
        (self.0 & 0b111_1111) as u8
    }

    /// Bits [11:7]
    #[inline]
    pub const fn rd(self) -> u8 {
        ((self.0 >> 7) & 0b1_1111) as u8
    }

    /// Bits [14:12]
    #[inline]
    pub const fn funct3(self) -> u8 {
        ((self.0 >> 12) & 0b111) as u8
    }

    /// Bits [19:15]. Also the `zimm` of the immediate CSR instructions.
    #[inline]
    pub const fn rs1(self) -> u8 {
        ((self.0 >> 15) & 0b1_1111) as u8
    }

    /// Bits [24:20]
    #[inline]
    pub const fn rs2(self) -> u8 {
        ((self.0 >> 20) & 0b1_1111) as u8
    }

    /// Bits [31:25]
    #[inline]
    pub const fn funct7(self) -> u8 {
        (self.0 >> 25) as u8
    }

    /// Bits [31:20], zero extended. Same bits as the I-type immediate.
    #[inline]
    pub const fn csr(self) -> u16 {
        (self.0 >> 20) as u16
    }

    /// U-type: bits [31:12] in place, low 12 bits cleared.
    ///
    /// All 20 bits are taken, so bit 31 of the word is the sign bit.
    #[inline]
    pub const fn imm_u(self) -> Ixlen {
        (self.0 & 0xff_ff_f0_00) as Ixlen
    }

    /// I-type: bits [31:20], sign extended.
    #[inline]
    pub const fn imm_i(self) -> Ixlen {
        sign_extend(self.0 >> 20, 12)
    }

    /// S-type: bits [31:25] and [11:7], sign extended.
    #[inline]
    pub const fn imm_s(self) -> Ixlen {
        let imm = ((self.0 >> 25) << 5) | ((self.0 >> 7) & 0b1_1111);
        sign_extend(imm, 12)
    }

    /// J-type jump offset, bit 0 is always zero.
    ///
    /// Layout in the word: imm[20|10:1|11|19:12].
    #[inline]
    pub const fn imm_j(self) -> Ixlen {
        let w = self.0;
        let imm = ((w >> 31) & 0b1) << 20
            | ((w >> 21) & 0b11_1111_1111) << 1
            | ((w >> 20) & 0b1) << 11
            | ((w >> 12) & 0b1111_1111) << 12;
        sign_extend(imm, 21)
    }

    /// B-type branch offset, bit 0 is always zero.
    ///
    /// Layout in the word: imm[12|10:5] at [31:25], imm[4:1|11] at [11:7].
    #[inline]
    pub const fn imm_b(self) -> Ixlen {
        let w = self.0;
        let imm = ((w >> 31) & 0b1) << 12
            | ((w >> 25) & 0b11_1111) << 5
            | ((w >> 8) & 0b1111) << 1
            | ((w >> 7) & 0b1) << 11;
        sign_extend(imm, 13)
    }
}

impl From<u32> for Instruction {
    fn from(word: u32) -> Self {
        Instruction(word)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({:#010x})", self.0)
    }
}

/// Major opcodes with at least one supported instruction.
///
/// From Chapter 24, only the 32 bit base encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Load = 0b00_000_11,
    MiscMem = 0b00_011_11,
    OpImm = 0b00_100_11,
    Auipc = 0b00_101_11,
    Store = 0b01_000_11,
    Op = 0b01_100_11,
    Lui = 0b01_101_11,
    Branch = 0b11_000_11,
    Jalr = 0b11_001_11,
    Jal = 0b11_011_11,
    System = 0b11_100_11,
}

/// Every instruction the engine knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionType {
    Lui,
    Auipc,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
    Sb,
    Sh,
    Sw,
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Fence,
    Ecall,
    Ebreak,
    Csrrw,
    Csrrs,
    Csrrc,
    Csrrwi,
    Csrrsi,
    Csrrci,
    /// No execution semantics for this field combination.
    Unimplemented,
}

const FUNCT7_ALT: u8 = 0b010_0000;

impl InstructionType {
    /// Maps the opcode, funct3, funct7 and (for SYSTEM) the csr region of
    /// `instr` to exactly one instruction type.
    pub fn classify(instr: Instruction) -> InstructionType {
        use InstructionType::*;

        let Ok(opcode) = Opcode::try_from(instr.opcode()) else {
            return Unimplemented;
        };
        let funct3 = instr.funct3();
        let funct7 = instr.funct7();

        match opcode {
            Opcode::Lui => Lui,
            Opcode::Auipc => Auipc,
            Opcode::Jal => Jal,
            Opcode::Jalr => match funct3 {
                0b000 => Jalr,
                _ => Unimplemented,
            },
            Opcode::Branch => match funct3 {
                0b000 => Beq,
                0b001 => Bne,
                0b100 => Blt,
                0b101 => Bge,
                0b110 => Bltu,
                0b111 => Bgeu,
                _ => Unimplemented,
            },
            Opcode::Load => match funct3 {
                0b000 => Lb,
                0b001 => Lh,
                0b010 => Lw,
                0b100 => Lbu,
                0b101 => Lhu,
                _ => Unimplemented,
            },
            Opcode::Store => match funct3 {
                0b000 => Sb,
                0b001 => Sh,
                0b010 => Sw,
                _ => Unimplemented,
            },
            Opcode::OpImm => match (funct3, funct7) {
                (0b000, _) => Addi,
                (0b010, _) => Slti,
                (0b011, _) => Sltiu,
                (0b100, _) => Xori,
                (0b110, _) => Ori,
                (0b111, _) => Andi,
                (0b001, 0) => Slli,
                (0b101, 0) => Srli,
                (0b101, FUNCT7_ALT) => Srai,
                _ => Unimplemented,
            },
            Opcode::Op => match (funct3, funct7) {
                (0b000, 0) => Add,
                (0b000, FUNCT7_ALT) => Sub,
                (0b001, 0) => Sll,
                (0b010, 0) => Slt,
                (0b011, 0) => Sltu,
                (0b100, 0) => Xor,
                (0b101, 0) => Srl,
                (0b101, FUNCT7_ALT) => Sra,
                (0b110, 0) => Or,
                (0b111, 0) => And,
                _ => Unimplemented,
            },
            Opcode::MiscMem => match funct3 {
                0b000 => Fence,
                _ => Unimplemented,
            },
            Opcode::System => match funct3 {
                0b000 if instr.rd() == 0 && instr.rs1() == 0 => match instr.csr() {
                    0x000 => Ecall,
                    0x001 => Ebreak,
                    _ => Unimplemented,
                },
                0b001 => Csrrw,
                0b010 => Csrrs,
                0b011 => Csrrc,
                0b101 => Csrrwi,
                0b110 => Csrrsi,
                0b111 => Csrrci,
                _ => Unimplemented,
            },
        }
    }
}

impl From<Instruction> for InstructionType {
    fn from(instr: Instruction) -> Self {
        InstructionType::classify(instr)
    }
}
