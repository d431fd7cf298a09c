use crate::Uxlen;

use self::exception::IllegalInstrCause;

pub mod exception {
    use thiserror::Error;

    use crate::Uxlen;

    /// A synchronous failure of one step.
    ///
    /// No trap is taken: the hart is left exactly as it was before the failing
    /// instruction, and it is up to the caller to halt, skip or abort.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
    pub enum Exception {
        #[error("illegal instruction {word:#010x} at pc {pc:#010x}: {cause}")]
        IllegalInstruction {
            pc: Uxlen,
            word: u32,
            cause: IllegalInstrCause,
        },
        #[error("instruction fetch out of bounds at pc {pc:#010x}")]
        FetchFault { pc: Uxlen },
        #[error("load from {addr:#010x} out of bounds (instruction {word:#010x} at pc {pc:#010x})")]
        LoadAccessFault { pc: Uxlen, word: u32, addr: Uxlen },
        #[error("store to {addr:#010x} out of bounds (instruction {word:#010x} at pc {pc:#010x})")]
        StoreAccessFault { pc: Uxlen, word: u32, addr: Uxlen },
    }

    impl Exception {
        /// Address of the faulting instruction.
        pub fn pc(&self) -> Uxlen {
            match *self {
                Exception::IllegalInstruction { pc, .. }
                | Exception::FetchFault { pc }
                | Exception::LoadAccessFault { pc, .. }
                | Exception::StoreAccessFault { pc, .. } => pc,
            }
        }

        /// The offending instruction word, if it could be fetched.
        pub fn word(&self) -> Option<u32> {
            match *self {
                Exception::IllegalInstruction { word, .. }
                | Exception::LoadAccessFault { word, .. }
                | Exception::StoreAccessFault { word, .. } => Some(word),
                Exception::FetchFault { .. } => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
    pub enum IllegalInstrCause {
        #[error("no such instruction")]
        Unimplemented,
        #[error("CSR is read-only")]
        CSRNotWritable,
    }
}

const CSR_COUNT: usize = 1 << 12;

/// Control and status registers of one hart.
///
/// The whole 12 bit address space is backed. Addresses with bits [11:10]
/// set are read-only; of those, the counters read the tick count.
pub struct Csr {
    regs: Box<[Uxlen]>,
    /// In this simulation, the cycle, time and instret counter are all the same value.
    tick_count: u64,
}

impl Csr {
    pub const CYCLE: u16 = 0xC00;
    pub const TIME: u16 = 0xC01;
    pub const INSTRET: u16 = 0xC02;
    pub const CYCLEH: u16 = 0xC80;
    pub const TIMEH: u16 = 0xC81;
    pub const INSTRETH: u16 = 0xC82;

    pub fn new() -> Self {
        Csr {
            regs: vec![0; CSR_COUNT].into_boxed_slice(),
            tick_count: 0,
        }
    }

    /// The lower 12 bits of `addr` encode the CSR specifier.
    /// Section 2.2 of the priviledged Spec
    pub fn is_read_only(addr: u16) -> bool {
        (addr >> 10) & 0b11 == 0b11
    }

    /// The result is zero extended to `Uxlen`.
    pub fn read(&self, addr: u16) -> Uxlen {
        match addr & 0xfff {
            Self::CYCLE | Self::TIME | Self::INSTRET => self.tick_count as Uxlen,
            Self::CYCLEH | Self::TIMEH | Self::INSTRETH => (self.tick_count >> 32) as Uxlen,
            addr => self.regs[addr as usize],
        }
    }

    pub fn write(&mut self, addr: u16, value: Uxlen) -> Result<(), IllegalInstrCause> {
        let addr = addr & 0xfff;
        if Self::is_read_only(addr) {
            return Err(IllegalInstrCause::CSRNotWritable);
        }
        self.regs[addr as usize] = value;
        Ok(())
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn increment_tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
    }

    pub fn reset(&mut self) {
        self.regs.fill(0);
        self.tick_count = 0;
    }
}

impl Default for Csr {
    fn default() -> Self {
        Csr::new()
    }
}

impl std::fmt::Debug for Csr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Csr")
            .field("tick_count", &self.tick_count)
            .finish_non_exhaustive()
    }
}
