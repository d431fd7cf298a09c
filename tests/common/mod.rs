//! Instruction encoders and helpers shared by the integration tests.

#![allow(dead_code)]

use riscv_sim::{Engine, EngineOptions, Machine, MemoryDescriptor};

pub const OP_IMM: u32 = 0b00_100_11;
pub const LUI: u32 = 0b01_101_11;
pub const AUIPC: u32 = 0b00_101_11;
pub const OP: u32 = 0b01_100_11;
pub const STORE: u32 = 0b01_000_11;
pub const LOAD: u32 = 0b00_000_11;
pub const BRANCH: u32 = 0b11_000_11;
pub const JAL: u32 = 0b11_011_11;
pub const SYSTEM: u32 = 0b11_100_11;

pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

pub fn i_type(opcode: u32, rd: u8, funct3: u32, rs1: u8, imm: i32) -> u32 {
    ((imm as u32) & 0xfff) << 20 | (rs1 as u32) << 15 | funct3 << 12 | (rd as u32) << 7 | opcode
}

pub fn r_type(rd: u8, funct3: u32, rs1: u8, rs2: u8, funct7: u32) -> u32 {
    funct7 << 25 | (rs2 as u32) << 20 | (rs1 as u32) << 15 | funct3 << 12 | (rd as u32) << 7 | OP
}

pub fn s_type(funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5) & 0x7f) << 25
        | (rs2 as u32) << 20
        | (rs1 as u32) << 15
        | funct3 << 12
        | (imm & 0x1f) << 7
        | STORE
}

/// `imm20` lands in bits [31:12].
pub fn u_type(opcode: u32, rd: u8, imm20: u32) -> u32 {
    (imm20 & 0xf_ffff) << 12 | (rd as u32) << 7 | opcode
}

pub fn j_type(rd: u8, offset: i32) -> u32 {
    let imm = offset as u32;
    ((imm >> 20) & 0x1) << 31
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 11) & 0x1) << 20
        | ((imm >> 12) & 0xff) << 12
        | (rd as u32) << 7
        | JAL
}

pub fn b_type(funct3: u32, rs1: u8, rs2: u8, offset: i32) -> u32 {
    let imm = offset as u32;
    ((imm >> 12) & 0x1) << 31
        | ((imm >> 5) & 0x3f) << 25
        | (rs2 as u32) << 20
        | (rs1 as u32) << 15
        | funct3 << 12
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 0x1) << 7
        | BRANCH
}

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(OP_IMM, rd, 0b000, rs1, imm)
}

pub fn lui(rd: u8, imm20: u32) -> u32 {
    u_type(LUI, rd, imm20)
}

pub fn auipc(rd: u8, imm20: u32) -> u32 {
    u_type(AUIPC, rd, imm20)
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(rd, 0b000, rs1, rs2, 0)
}

pub fn jal(rd: u8, offset: i32) -> u32 {
    j_type(rd, offset)
}

pub fn beq(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(0b000, rs1, rs2, offset)
}

pub fn bne(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(0b001, rs1, rs2, offset)
}

pub fn sw(rs2: u8, offset: i32, rs1: u8) -> u32 {
    s_type(0b010, rs1, rs2, offset)
}

pub fn lw(rd: u8, offset: i32, rs1: u8) -> u32 {
    i_type(LOAD, rd, 0b010, rs1, offset)
}

pub fn csrrw(rd: u8, csr: u16, rs1: u8) -> u32 {
    i_type(SYSTEM, rd, 0b001, rs1, csr as i32)
}

pub fn csrrs(rd: u8, csr: u16, rs1: u8) -> u32 {
    i_type(SYSTEM, rd, 0b010, rs1, csr as i32)
}

pub fn csrrwi(rd: u8, csr: u16, zimm: u8) -> u32 {
    i_type(SYSTEM, rd, 0b101, zimm, csr as i32)
}

pub const EBREAK: u32 = 0x0010_0073;
pub const ECALL: u32 = 0x0000_0073;

pub fn bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A single hart machine with `words` placed at offset 0.
pub fn machine_with(words: &[u32]) -> Machine {
    let program = bytes(words);
    Machine::new(0x4000, &[MemoryDescriptor::new(0, &program)], 1).expect("machine creation failed")
}

pub fn engine(options: EngineOptions) -> Engine {
    init_logger();
    Engine::new(options)
}
