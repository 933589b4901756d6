use rustc_hash::FxHashMap;
use tgpx4::{Bus, RAM_A_WINDOW, RAM_B_LEN};

/// A self-contained memory system: program memory, both internal RAMs and a sparse external bus.
#[derive(Debug, Clone)]
pub struct Memory {
    program: Vec<u64>,
    pub ram_a: Box<[u32]>,
    pub ram_b: Box<[u32]>,
    pub external: FxHashMap<u32, u32>,
    code_modified: bool,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Memory {
    /// Creates a memory system whose program memory holds `program`, starting at address 0.
    pub fn new(program: Vec<u64>) -> Self {
        Self {
            program,
            ram_a: vec![0; RAM_A_WINDOW as usize].into_boxed_slice(),
            ram_b: vec![0; RAM_B_LEN as usize].into_boxed_slice(),
            external: FxHashMap::default(),
            code_modified: false,
        }
    }

    #[inline(always)]
    pub fn program(&self) -> &[u64] {
        &self.program
    }

    /// Writes a bundle to program memory, growing it if needed. Translated code becomes stale.
    pub fn write_program(&mut self, pc: u32, word: u64) {
        let index = pc as usize;
        if index >= self.program.len() {
            self.program.resize(index + 1, 0);
        }

        self.program[index] = word;
        self.code_modified = true;
    }
}

impl Bus for Memory {
    fn fetch(&mut self, pc: u32) -> Option<u64> {
        self.program.get(pc as usize).copied()
    }

    fn read_a(&mut self, addr: u32) -> u32 {
        self.ram_a[(addr % RAM_A_WINDOW) as usize]
    }

    fn write_a(&mut self, addr: u32, value: u32) {
        self.ram_a[(addr % RAM_A_WINDOW) as usize] = value;
    }

    fn read_b(&mut self, addr: u32) -> u32 {
        self.ram_b[(addr % RAM_B_LEN) as usize]
    }

    fn write_b(&mut self, addr: u32, value: u32) {
        self.ram_b[(addr % RAM_B_LEN) as usize] = value;
    }

    fn read_external(&mut self, addr: u32) -> u32 {
        self.external.get(&addr).copied().unwrap_or(0)
    }

    fn write_external(&mut self, addr: u32, value: u32) {
        self.external.insert(addr, value);
    }

    fn take_code_invalidation(&mut self) -> bool {
        std::mem::take(&mut self.code_modified)
    }
}
