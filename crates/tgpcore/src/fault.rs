use easyerr::Error;
use tgpjit::{FaultKind, InstallError, TranslateError};
use tgpx4::FifoId;

/// An unrecoverable condition which terminated a run.
///
/// Variants describing a bundle carry its PC first and its raw word last.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("invalid bundle {f1:016X} at {f0:04X}")]
    InvalidBundle(u32, u64),
    #[error("unimplemented ALU op {f1:02X} at {f0:04X} (bundle {f2:016X})")]
    UnimplementedAlu(u32, u32, u64),
    #[error("unimplemented MUL op {f1:02X} at {f0:04X} (bundle {f2:016X})")]
    UnimplementedMul(u32, u32, u64),
    #[error("unimplemented transfer {f1:04X} at {f0:04X} (bundle {f2:016X})")]
    UnimplementedTransfer(u32, u32, u64),
    #[error("unimplemented double transfer {f1:04X} at {f0:04X} (bundle {f2:016X})")]
    UnimplementedDoubleTransfer(u32, u32, u64),
    #[error("unimplemented control opcode {f1:02X} at {f0:04X} (bundle {f2:016X})")]
    UnimplementedControl(u32, u32, u64),
    #[error("branch in a delay slot at {f0:04X} (bundle {f1:016X})")]
    BranchInDelaySlot(u32, u64),
    #[error("PC stack overflow at {f0:04X}")]
    PcsOverflow(u32),
    #[error("PC stack underflow at {f0:04X}")]
    PcsUnderflow(u32),
    #[error("no program memory at {f0:04X}")]
    UnmappedCode(u32),
    #[error("read from the empty input FIFO at {f0:04X}")]
    FifoEmpty(u32),
    #[error("write to the full {f1:?} FIFO at {f0:04X}")]
    FifoFull(u32, FifoId),
    #[error("generated code failed at {f0:04X}")]
    Internal(u32),
    #[error("failed to translate a block")]
    Translate { source: TranslateError },
    #[error("failed to reset the translation cache")]
    Flush { source: InstallError },
}

impl Fault {
    /// PC of the faulting bundle, if the fault happened while running code.
    pub fn pc(&self) -> Option<u32> {
        Some(match *self {
            Fault::InvalidBundle(pc, _)
            | Fault::UnimplementedAlu(pc, _, _)
            | Fault::UnimplementedMul(pc, _, _)
            | Fault::UnimplementedTransfer(pc, _, _)
            | Fault::UnimplementedDoubleTransfer(pc, _, _)
            | Fault::UnimplementedControl(pc, _, _)
            | Fault::BranchInDelaySlot(pc, _)
            | Fault::PcsOverflow(pc)
            | Fault::PcsUnderflow(pc)
            | Fault::UnmappedCode(pc)
            | Fault::FifoEmpty(pc)
            | Fault::FifoFull(pc, _)
            | Fault::Internal(pc) => pc,
            Fault::Translate { .. } | Fault::Flush { .. } => return None,
        })
    }
}

/// A fault recorded by a host call, completed with the PC once generated code exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    FifoEmpty,
    FifoFull(FifoId),
    /// Arguments of a fault report: `kind | detail << 8` and the bundle.
    Reported { code: u32, bundle: u64 },
}

impl Pending {
    pub fn into_fault(self, pc: u32) -> Fault {
        let (code, bundle) = match self {
            Pending::FifoEmpty => return Fault::FifoEmpty(pc),
            Pending::FifoFull(fifo) => return Fault::FifoFull(pc, fifo),
            Pending::Reported { code, bundle } => (code, bundle),
        };

        let detail = code >> 8;
        let Some(kind) = FaultKind::from_repr(code & 0xFF) else {
            return Fault::Internal(pc);
        };

        match kind {
            FaultKind::Bundle => Fault::InvalidBundle(pc, bundle),
            FaultKind::Alu => Fault::UnimplementedAlu(pc, detail, bundle),
            FaultKind::Mul => Fault::UnimplementedMul(pc, detail, bundle),
            FaultKind::Transfer => Fault::UnimplementedTransfer(pc, detail, bundle),
            FaultKind::DoubleTransfer => Fault::UnimplementedDoubleTransfer(pc, detail, bundle),
            FaultKind::Control => Fault::UnimplementedControl(pc, detail, bundle),
            FaultKind::PcsOverflow => Fault::PcsOverflow(pc),
            FaultKind::PcsUnderflow => Fault::PcsUnderflow(pc),
            FaultKind::BranchInDelaySlot => Fault::BranchInDelaySlot(pc, bundle),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reports_decode() {
        let fault = Pending::Reported {
            code: FaultKind::Alu as u32 | (0x0A << 8),
            bundle: 0x1234,
        }
        .into_fault(7);

        assert!(matches!(fault, Fault::UnimplementedAlu(7, 0x0A, 0x1234)));
        assert_eq!(fault.pc(), Some(7));

        let fault = Pending::Reported {
            code: 0xFF,
            bundle: 0,
        }
        .into_fault(3);
        assert!(matches!(fault, Fault::Internal(3)));

        let fault = Pending::FifoFull(FifoId::Out1).into_fault(9);
        assert_eq!(fault.to_string(), "write to the full Out1 FIFO at 0009");
    }
}
