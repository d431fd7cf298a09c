//! The simulated machine: one memory and its hardware threads.

use thiserror::Error;

use crate::memory::{HeapPages, Memory, MemoryDescriptor, MemoryError, PageAllocator};
use crate::platform::Csr;
use crate::Uxlen;

/// Harts the engine is able to execute.
pub const SUPPORTED_HARTS: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("a machine needs at least one hart")]
    NoHarts,
    #[error("{0} harts requested, only a single hart can be executed")]
    UnsupportedHartCount(usize),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Hardware Thread
///
#[derive(Debug)]
pub struct Hart {
    id: usize,
    pc: Uxlen,
    /// x0 is always zero
    /// x1 is usually the return address
    /// x2 is usually the stack pointer
    /// # INVARIANT
    /// regs[0] is always zero!
    regs: [Uxlen; 32],
    csr: Csr,
}

impl Hart {
    fn new(id: usize) -> Self {
        Hart {
            id,
            pc: 0,
            regs: [0; 32],
            csr: Csr::new(),
        }
    }

    /// Position within the machine's harts.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pc(&self) -> Uxlen {
        self.pc
    }

    pub fn set_pc(&mut self, pc: Uxlen) {
        self.pc = pc;
    }

    /// Reads `x{idx}`. There is no register 32 or above, those read as zero.
    pub fn reg(&self, idx: u8) -> Uxlen {
        self.regs.get(idx as usize).copied().unwrap_or(0)
    }

    /// Writes to x0 are dropped, as are writes to an index of 32 or above.
    pub fn set_reg(&mut self, idx: u8, value: Uxlen) {
        if idx == 0 {
            return;
        }
        if let Some(reg) = self.regs.get_mut(idx as usize) {
            *reg = value;
        }
    }

    pub fn regs(&self) -> &[Uxlen; 32] {
        &self.regs
    }

    pub fn csr(&self) -> &Csr {
        &self.csr
    }

    pub fn csr_mut(&mut self) -> &mut Csr {
        &mut self.csr
    }

    fn reset(&mut self) {
        self.pc = 0;
        self.regs = [0; 32];
        self.csr.reset();
    }
}

#[derive(Debug)]
pub struct Machine {
    memory: Memory,
    /// # INVARIANT
    /// Never empty, `harts[i].id == i`.
    harts: Vec<Hart>,
}

impl Machine {
    /// Creates a machine backed by heap memory of at least `capacity` bytes,
    /// loaded with `content`.
    pub fn new(
        capacity: usize,
        content: &[MemoryDescriptor<'_>],
        hart_count: usize,
    ) -> Result<Self, MachineError> {
        Self::with_allocator(capacity, content, hart_count, Box::new(HeapPages))
    }

    pub fn with_allocator(
        capacity: usize,
        content: &[MemoryDescriptor<'_>],
        hart_count: usize,
        allocator: Box<dyn PageAllocator>,
    ) -> Result<Self, MachineError> {
        match hart_count {
            0 => return Err(MachineError::NoHarts),
            SUPPORTED_HARTS => {}
            n => return Err(MachineError::UnsupportedHartCount(n)),
        }

        // Dropped again if any descriptor does not fit.
        let mut memory = Memory::with_allocator(capacity, allocator)?;
        memory.load(content)?;

        log::debug!(
            "Created machine: {:#x} bytes of memory, {} descriptors, {} hart(s)",
            memory.capacity(),
            content.len(),
            hart_count
        );
        Ok(Machine {
            memory,
            harts: (0..hart_count).map(Hart::new).collect(),
        })
    }

    /// Zeroes memory, loads `content` and puts every hart back to pc = 0 with
    /// cleared registers.
    ///
    /// If the fresh memory cannot be allocated nothing changes. If a descriptor
    /// does not fit, the harts are reset and the descriptors before it are applied.
    pub fn reset(&mut self, content: &[MemoryDescriptor<'_>]) -> Result<(), MachineError> {
        self.memory.reallocate()?;
        self.harts.iter_mut().for_each(Hart::reset);
        self.memory.load(content)?;

        log::debug!("Reset machine with {} descriptors", content.len());
        Ok(())
    }

    /// Releases memory and harts.
    pub fn destroy(self) {
        log::debug!("Destroying machine");
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    pub fn harts(&self) -> &[Hart] {
        &self.harts
    }

    pub fn hart(&self, id: usize) -> Option<&Hart> {
        self.harts.get(id)
    }

    pub fn hart_mut(&mut self, id: usize) -> Option<&mut Hart> {
        self.harts.get_mut(id)
    }

    /// Hart 0 together with the memory, borrowed at once for execution.
    pub(crate) fn primary_mut(&mut self) -> (&mut Hart, &mut Memory) {
        (&mut self.harts[0], &mut self.memory)
    }
}
