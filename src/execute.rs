//! Fetch, decode, execute.

use serde::Deserialize;
use thiserror::Error;

use crate::decode::{Instruction, InstructionType, Opcode};
use crate::machine::{Hart, Machine};
use crate::memory::{Memory, MemoryError};
use crate::platform::exception::{Exception, IllegalInstrCause};
use crate::{Ixlen, Uxlen};

/// Optional engine behaviour. None of these change instruction semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Log every executed instruction at trace level.
    pub trace: bool,
    /// Upper bound on the steps of a single [`Engine::run`].
    pub max_steps: Option<u64>,
    /// If false, [`Engine::run`] logs and steps over illegal instructions.
    pub halt_on_illegal: bool,
    pub stop_on_breakpoint: bool,
    pub stop_on_ecall: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            trace: false,
            max_steps: None,
            halt_on_illegal: true,
            stop_on_breakpoint: true,
            stop_on_ecall: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid engine options: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl EngineOptions {
    /// Parses options from a JSON object. Unknown keys are rejected.
    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// How a successfully executed instruction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Retired,
    /// An EBREAK retired.
    Breakpoint,
    /// An ECALL retired.
    EnvironmentCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StepLimit,
    Breakpoint,
    EnvironmentCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Steps taken, including skipped illegal instructions.
    pub steps: u64,
    pub skipped_illegal: u64,
    pub stop: StopReason,
}

/// Drives hart 0 of a [`Machine`].
#[derive(Debug, Clone, Default)]
pub struct Engine {
    options: EngineOptions,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Engine { options }
    }

    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        EngineOptions::from_json(json).map(Engine::new)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Fetches, decodes and executes one instruction on hart 0.
    ///
    /// Either the whole instruction takes effect, including the PC update,
    /// or nothing does and the exception is returned.
    pub fn step(&self, machine: &mut Machine) -> Result<StepOutcome, Exception> {
        let (hart, memory) = machine.primary_mut();
        let pc = hart.pc();
        let word = memory
            .read_word(pc as usize)
            .map_err(|_| Exception::FetchFault { pc })?;
        let instr = Instruction::new(word);
        let ty = InstructionType::classify(instr);

        if self.options.trace {
            log::trace!("[{}] {pc:#010x}: {word:#010x} {ty:?}", hart.id());
        }

        let mut exec = Executor {
            hart,
            memory,
            pc,
            instr,
        };
        let outcome = exec.execute(ty)?;
        exec.hart.csr_mut().increment_tick();
        Ok(outcome)
    }

    /// Steps until a stop condition from the options, or an exception.
    ///
    /// Without `max_steps` this only returns on EBREAK/ECALL (if enabled) or
    /// an exception.
    pub fn run(&self, machine: &mut Machine) -> Result<RunSummary, Exception> {
        let mut steps = 0;
        let mut skipped_illegal = 0;
        let summary = |steps, skipped_illegal, stop| RunSummary {
            steps,
            skipped_illegal,
            stop,
        };

        loop {
            if self.options.max_steps.is_some_and(|max| steps >= max) {
                return Ok(summary(steps, skipped_illegal, StopReason::StepLimit));
            }
            steps += 1;

            match self.step(machine) {
                Ok(StepOutcome::Retired) => {}
                Ok(StepOutcome::Breakpoint) if self.options.stop_on_breakpoint => {
                    return Ok(summary(steps, skipped_illegal, StopReason::Breakpoint));
                }
                Ok(StepOutcome::EnvironmentCall) if self.options.stop_on_ecall => {
                    return Ok(summary(steps, skipped_illegal, StopReason::EnvironmentCall));
                }
                Ok(_) => {}
                Err(Exception::IllegalInstruction { pc, word, cause })
                    if !self.options.halt_on_illegal =>
                {
                    log::warn!("Skipping illegal instruction {word:#010x} at {pc:#010x}: {cause}");
                    let (hart, _) = machine.primary_mut();
                    hart.set_pc(pc.wrapping_add(4));
                    skipped_illegal += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Where execution continues after an instruction.
enum Flow {
    Next,
    Jump(Uxlen),
    Breakpoint,
    EnvironmentCall,
}

/// One instruction in flight on a hart.
///
/// The `execute_xxx` functions take the decoded fields and apply them to the
/// architectural state. Fallible work always happens before the first write,
/// and the PC is only touched by `execute`.
struct Executor<'a> {
    hart: &'a mut Hart,
    memory: &'a mut Memory,
    /// Address of the instruction being executed.
    pc: Uxlen,
    instr: Instruction,
}

impl<'a> Executor<'a> {
    fn execute(&mut self, ty: InstructionType) -> Result<StepOutcome, Exception> {
        use InstructionType::*;

        let instr = self.instr;
        let (rd, rs1, rs2) = (instr.rd(), instr.rs1(), instr.rs2());

        if rd == 0 && Self::is_computational(ty) {
            self.hint();
        }

        let flow = match ty {
            Lui => self.execute_lui(instr.imm_u(), rd),
            Auipc => self.execute_auipc(instr.imm_u(), rd),
            Jal => self.execute_jal(instr.imm_j(), rd),
            Jalr => self.execute_jalr(instr.imm_i(), rs1, rd),

            Beq => self.branch(self.x(rs1) == self.x(rs2)),
            Bne => self.branch(self.x(rs1) != self.x(rs2)),
            Blt => self.branch((self.x(rs1) as Ixlen) < (self.x(rs2) as Ixlen)),
            Bge => self.branch((self.x(rs1) as Ixlen) >= (self.x(rs2) as Ixlen)),
            Bltu => self.branch(self.x(rs1) < self.x(rs2)),
            Bgeu => self.branch(self.x(rs1) >= self.x(rs2)),

            Lb => self.execute_load(rs1, rd, |m, a| Ok(m.read_byte(a)? as i8 as Ixlen as Uxlen))?,
            Lh => self.execute_load(rs1, rd, |m, a| Ok(m.read_halfword(a)? as i16 as Ixlen as Uxlen))?,
            Lw => self.execute_load(rs1, rd, Memory::read_word)?,
            Lbu => self.execute_load(rs1, rd, |m, a| Ok(m.read_byte(a)? as Uxlen))?,
            Lhu => self.execute_load(rs1, rd, |m, a| Ok(m.read_halfword(a)? as Uxlen))?,

            Sb => self.execute_store(rs1, |m, a, v| m.write_byte(a, v as u8), rs2)?,
            Sh => self.execute_store(rs1, |m, a, v| m.write_halfword(a, v as u16), rs2)?,
            Sw => self.execute_store(rs1, Memory::write_word, rs2)?,

            Addi => self.op_imm(rs1, rd, |a, imm| a.wrapping_add(imm)),
            Slti => self.op_imm(rs1, rd, |a, imm| ((a as Ixlen) < (imm as Ixlen)) as Uxlen),
            Sltiu => self.op_imm(rs1, rd, |a, imm| (a < imm) as Uxlen),
            Xori => self.op_imm(rs1, rd, |a, imm| a ^ imm),
            Ori => self.op_imm(rs1, rd, |a, imm| a | imm),
            Andi => self.op_imm(rs1, rd, |a, imm| a & imm),
            Slli => self.op_imm(rs1, rd, |a, imm| a << (imm & 0b1_1111)),
            Srli => self.op_imm(rs1, rd, |a, imm| a >> (imm & 0b1_1111)),
            Srai => self.op_imm(rs1, rd, |a, imm| ((a as Ixlen) >> (imm & 0b1_1111)) as Uxlen),

            Add => self.op(rs1, rs2, rd, Uxlen::wrapping_add),
            Sub => self.op(rs1, rs2, rd, Uxlen::wrapping_sub),
            Sll => self.op(rs1, rs2, rd, |a, b| a << (b & 0b1_1111)),
            Slt => self.op(rs1, rs2, rd, |a, b| ((a as Ixlen) < (b as Ixlen)) as Uxlen),
            Sltu => self.op(rs1, rs2, rd, |a, b| (a < b) as Uxlen),
            Xor => self.op(rs1, rs2, rd, |a, b| a ^ b),
            Srl => self.op(rs1, rs2, rd, |a, b| a >> (b & 0b1_1111)),
            Sra => self.op(rs1, rs2, rd, |a, b| ((a as Ixlen) >> (b & 0b1_1111)) as Uxlen),
            Or => self.op(rs1, rs2, rd, |a, b| a | b),
            And => self.op(rs1, rs2, rd, |a, b| a & b),

            // Single hart, memory accesses are already ordered.
            Fence => Flow::Next,
            Ecall => Flow::EnvironmentCall,
            Ebreak => Flow::Breakpoint,

            Csrrw => self.execute_csr(self.x(rs1), rd, true, |_, src| src)?,
            Csrrs => self.execute_csr(self.x(rs1), rd, rs1 != 0, |prev, src| prev | src)?,
            Csrrc => self.execute_csr(self.x(rs1), rd, rs1 != 0, |prev, src| prev & !src)?,
            // The immediate variants use the 5 bits that usually encode the source register.
            Csrrwi => self.execute_csr(rs1 as Uxlen, rd, true, |_, src| src)?,
            Csrrsi => self.execute_csr(rs1 as Uxlen, rd, rs1 != 0, |prev, src| prev | src)?,
            Csrrci => self.execute_csr(rs1 as Uxlen, rd, rs1 != 0, |prev, src| prev & !src)?,

            Unimplemented => return Err(self.illegal(IllegalInstrCause::Unimplemented)),
        };

        let next = self.pc.wrapping_add(4);
        let (pc, outcome) = match flow {
            Flow::Next => (next, StepOutcome::Retired),
            Flow::Jump(target) => (target, StepOutcome::Retired),
            Flow::Breakpoint => (next, StepOutcome::Breakpoint),
            Flow::EnvironmentCall => (next, StepOutcome::EnvironmentCall),
        };
        self.hart.set_pc(pc);
        Ok(outcome)
    }

    fn x(&self, idx: u8) -> Uxlen {
        self.hart.reg(idx)
    }

    fn illegal(&self, cause: IllegalInstrCause) -> Exception {
        Exception::IllegalInstruction {
            pc: self.pc,
            word: self.instr.word(),
            cause,
        }
    }

    fn is_computational(ty: InstructionType) -> bool {
        use InstructionType::*;
        matches!(
            ty,
            Lui | Auipc
                | Addi
                | Slti
                | Sltiu
                | Xori
                | Ori
                | Andi
                | Slli
                | Srli
                | Srai
                | Add
                | Sub
                | Sll
                | Slt
                | Sltu
                | Xor
                | Srl
                | Sra
                | Or
                | And
        )
    }

    /// Called for Integer Computational Instructions with `rd` = 0.
    /// The result is still computed but the write to `x0` is dropped.
    ///
    /// `ADDI x0, x0, 0` is considered the canonical NOP.
    ///
    /// See Section 2.9: Hint instruction
    fn hint(&self) {
        if self.instr.word() == Opcode::OpImm as u32 {
            // NOP encoded as `ADDI x0, x0, 0`
            return;
        }

        log::warn!("Ignored hint instruction {:#010x}!", self.instr.word());
    }

    fn execute_lui(&mut self, imm: Ixlen, dest: u8) -> Flow {
        self.hart.set_reg(dest, imm as Uxlen);
        Flow::Next
    }

    /// Relative to the address of the AUIPC itself.
    fn execute_auipc(&mut self, imm: Ixlen, dest: u8) -> Flow {
        self.hart.set_reg(dest, self.pc.wrapping_add(imm as Uxlen));
        Flow::Next
    }

    fn execute_jal(&mut self, offset: Ixlen, dest: u8) -> Flow {
        self.hart.set_reg(dest, self.pc.wrapping_add(4));
        Flow::Jump(self.pc.wrapping_add(offset as Uxlen))
    }

    fn execute_jalr(&mut self, offset: Ixlen, base: u8, dest: u8) -> Flow {
        // Read the base before linking, base and dest may be the same register.
        let target = self.x(base).wrapping_add(offset as Uxlen) & !1;
        self.hart.set_reg(dest, self.pc.wrapping_add(4));
        Flow::Jump(target)
    }

    fn branch(&self, taken: bool) -> Flow {
        if taken {
            Flow::Jump(self.pc.wrapping_add(self.instr.imm_b() as Uxlen))
        } else {
            Flow::Next
        }
    }

    fn op_imm(&mut self, src: u8, dest: u8, f: impl FnOnce(Uxlen, Uxlen) -> Uxlen) -> Flow {
        let value = f(self.x(src), self.instr.imm_i() as Uxlen);
        self.hart.set_reg(dest, value);
        Flow::Next
    }

    fn op(&mut self, src1: u8, src2: u8, dest: u8, f: impl FnOnce(Uxlen, Uxlen) -> Uxlen) -> Flow {
        let value = f(self.x(src1), self.x(src2));
        self.hart.set_reg(dest, value);
        Flow::Next
    }

    fn execute_load(
        &mut self,
        base: u8,
        dest: u8,
        read: impl FnOnce(&Memory, usize) -> Result<Uxlen, MemoryError>,
    ) -> Result<Flow, Exception> {
        let addr = self.x(base).wrapping_add(self.instr.imm_i() as Uxlen);
        let value = read(&*self.memory, addr as usize).map_err(|_| Exception::LoadAccessFault {
            pc: self.pc,
            word: self.instr.word(),
            addr,
        })?;
        self.hart.set_reg(dest, value);
        Ok(Flow::Next)
    }

    fn execute_store(
        &mut self,
        base: u8,
        write: impl FnOnce(&mut Memory, usize, Uxlen) -> Result<(), MemoryError>,
        src: u8,
    ) -> Result<Flow, Exception> {
        let addr = self.x(base).wrapping_add(self.instr.imm_s() as Uxlen);
        let value = self.x(src);
        write(&mut *self.memory, addr as usize, value).map_err(|_| Exception::StoreAccessFault {
            pc: self.pc,
            word: self.instr.word(),
            addr,
        })?;
        Ok(Flow::Next)
    }

    /// Zicsr: atomic read-modify-write of the CSR named by the instruction.
    ///
    /// `dest` always receives the value from before the update. With `write`
    /// unset the CSR is only read, which keeps read-only CSRs readable.
    fn execute_csr(
        &mut self,
        src: Uxlen,
        dest: u8,
        write: bool,
        update: impl FnOnce(Uxlen, Uxlen) -> Uxlen,
    ) -> Result<Flow, Exception> {
        let addr = self.instr.csr();
        let prev = self.hart.csr().read(addr);
        if write {
            self.hart
                .csr_mut()
                .write(addr, update(prev, src))
                .map_err(|cause| self.illegal(cause))?;
        }
        self.hart.set_reg(dest, prev);
        Ok(Flow::Next)
    }
}
