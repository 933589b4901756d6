//! Back ends running [`Fragment`]s.
pub mod clif;
pub mod interp;

use crate::ir::{ExitCode, Fragment, FragmentError, Handle, HostFn};
use easyerr::Error;
use tgpx4::{Registers, Trap};

/// Services generated code reaches through [`HostFn`]s.
pub trait Host {
    fn call(&mut self, regs: &mut Registers, func: HostFn, args: [u32; 3]) -> u32;
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("code cache is full")]
    CacheFull,
    #[error("failed to generate a handle")]
    Handle { source: FragmentError },
    #[error("native code generation failed: {f0}")]
    Codegen(String),
    #[error(transparent)]
    Alloc { source: jitalloc::AllocError },
}

impl InstallError {
    pub fn is_cache_full(&self) -> bool {
        matches!(self, InstallError::CacheFull)
    }
}

/// Code a back end can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Fragment(u32),
    Handle(Handle),
}

/// Installs and runs fragments.
pub trait Backend {
    /// Discards every fragment and regenerates the handles.
    fn reset(&mut self) -> Result<(), InstallError>;

    /// Installs the fragment for `pc`, replacing any previous one.
    fn install(&mut self, pc: u32, fragment: &Fragment) -> Result<(), InstallError>;

    /// Whether a fragment for `pc` is installed.
    fn contains(&self, pc: u32) -> bool;

    /// Number of installed fragments.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `code` until it exits or dispatches.
    fn run(&mut self, code: Code, regs: &mut Registers, host: &mut dyn Host) -> ExitCode;

    /// Runs from the entry handle until generated code exits. Never returns
    /// [`ExitCode::Dispatch`].
    fn execute(&mut self, regs: &mut Registers, host: &mut dyn Host) -> ExitCode {
        let mut code = Code::Handle(Handle::Entry);
        loop {
            match self.run(code, regs, host) {
                ExitCode::Dispatch => {
                    if regs.trap_pending(Trap::ResetCache) {
                        return ExitCode::ResetCache;
                    }

                    code = if self.contains(regs.pc) {
                        Code::Fragment(regs.pc)
                    } else {
                        regs.exp = regs.pc;
                        Code::Handle(Handle::NoCode)
                    };
                }
                exit => return exit,
            }
        }
    }
}
