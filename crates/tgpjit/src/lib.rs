//! Dynamic binary translator for Fujitsu MB86235 (TGPx4) code.
//!
//! Blocks of bundles are described by the [`frontend`], lowered into a small op vocabulary
//! ([`ir`]) by the [`builder`] and handed to a [`Backend`], which either interprets or compiles
//! them. Generated code leaves with an [`ExitCode`] which the host acts upon.
pub mod backend;
pub mod builder;
pub mod frontend;
pub mod handles;
pub mod ir;

pub use backend::{Backend, Host, InstallError};
pub use ir::{ExitCode, FaultKind, HostFn};

use backend::{clif::Cranelift, interp::Interpreter};
use easyerr::{Error, ResultExt};
use ir::{FragmentError, Op};
use strum::{Display, EnumString, VariantArray};
use tgpx4::{Bus, Registers};

/// Which back end runs translated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, VariantArray)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// Walks the op list. Slow, but available everywhere.
    Interpreter,
    /// Compiles to native code with cranelift.
    #[default]
    Cranelift,
}

/// Translator configuration.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Back end to run translated code with.
    pub backend: BackendKind,
    /// Size of the code cache, in bytes. Exhausting it flushes every translated block.
    pub cache_capacity: usize,
    /// Maximum amount of bundles per block.
    pub max_sequence: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            cache_capacity: 16 * bytesize::MIB as usize,
            max_sequence: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("generated an invalid fragment")]
    Fragment { source: FragmentError },
    #[error(transparent)]
    Install { source: InstallError },
}

impl TranslateError {
    /// Whether flushing the cache and retrying may succeed.
    pub fn is_cache_full(&self) -> bool {
        matches!(self, TranslateError::Install { source } if source.is_cache_full())
    }
}

/// Owns a back end and feeds it translated blocks.
pub struct Translator {
    settings: Settings,
    backend: Box<dyn Backend + Send>,
}

impl Translator {
    pub fn new(settings: Settings) -> Result<Self, InstallError> {
        let backend: Box<dyn Backend + Send> = match settings.backend {
            BackendKind::Interpreter => Box::new(Interpreter::new(
                settings.cache_capacity / size_of::<Op>(),
            )?),
            BackendKind::Cranelift => Box::new(Cranelift::new(settings.cache_capacity)?),
        };

        Ok(Self { settings, backend })
    }

    #[inline(always)]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Discards every translated block.
    pub fn flush(&mut self) -> Result<(), InstallError> {
        tracing::debug!(blocks = self.backend.len(), "flushing translation cache");
        self.backend.reset()
    }

    /// Translates the block starting at `pc` and installs it.
    pub fn translate(&mut self, pc: u32, bus: &mut dyn Bus) -> Result<(), TranslateError> {
        let _span = tracing::trace_span!("translate", pc = format_args!("{pc:#06X}")).entered();

        let block = frontend::analyze(pc, self.settings.max_sequence, bus);
        let Some(fragment) = builder::build(&block) else {
            // analysis always yields at least one bundle
            return Err(TranslateError::Fragment {
                source: FragmentError::Unterminated,
            });
        };

        let fragment = fragment.context(TranslateCtx::Fragment)?;
        tracing::trace!(
            bundles = block.bundles.len(),
            cycles = block.cycles(),
            ops = fragment.ops().len(),
            "translated block"
        );

        self.backend
            .install(pc, &fragment)
            .context(TranslateCtx::Install)?;

        Ok(())
    }

    /// Runs translated code until it exits. See [`Backend::execute`].
    #[inline(always)]
    pub fn execute(&mut self, regs: &mut Registers, host: &mut dyn Host) -> ExitCode {
        self.backend.execute(regs, host)
    }

    /// Whether a block starting at `pc` is translated.
    #[inline(always)]
    pub fn contains(&self, pc: u32) -> bool {
        self.backend.contains(pc)
    }

    /// Number of translated blocks.
    #[inline(always)]
    pub fn cached_blocks(&self) -> usize {
        self.backend.len()
    }
}
