//! RV32I + Zicsr instruction set simulator.
//!
//! https://riscv.org/technical/specifications/
//!
//! A [`Machine`] owns the memory and its harts, an [`Engine`] fetches,
//! decodes and executes instructions on it. Only hart 0 is ever executed.

pub type Uxlen = u32;
pub type Ixlen = i32;

pub mod decode;
pub mod execute;
pub mod machine;
pub mod memory;
pub mod platform;

pub use decode::{Instruction, InstructionType};
pub use execute::{Engine, EngineOptions, OptionsError, RunSummary, StepOutcome, StopReason};
pub use machine::{Hart, Machine, MachineError};
pub use memory::{HeapPages, Memory, MemoryDescriptor, MemoryError, PageAllocator, PageStore};
#[cfg(unix)]
pub use memory::MmapPages;
pub use platform::exception::{Exception, IllegalInstrCause};
