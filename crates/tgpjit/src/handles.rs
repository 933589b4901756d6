//! Fixed subroutines shared by every fragment.
use crate::ir::{BinOp, Cond, Emitter, ExitCode, Field, Fragment, FragmentError, Handle, HostFn};
use tgpx4::{BUS_WINDOW_MASK, RAM_A_WINDOW};

/// Generates the fragment of a handle.
pub fn generate(handle: Handle) -> Result<Fragment, FragmentError> {
    let mut em = Emitter::new();
    match handle {
        Handle::Entry => em.dispatch(),
        Handle::NoCode => {
            em.mov(Field::Pc, Field::Exp);
            em.exit(ExitCode::MissingCode);
        }
        Handle::OutOfCycles => {
            em.mov(Field::Pc, Field::Exp);
            em.exit(ExitCode::OutOfCycles);
        }
        Handle::ReadAbus => abus(&mut em, false),
        Handle::WriteAbus => abus(&mut em, true),
    }

    em.finish()
}

/// RAM-A access at `ARG0`, moving `ARG1`. Addresses past the internal RAM go through the bus
/// window selected by `EB`.
fn abus(em: &mut Emitter, write: bool) {
    let internal = em.label();
    let is_internal = em.cmp(Cond::ULt, Field::Arg(0), RAM_A_WINDOW);
    em.branch(is_internal, internal);

    let low = em.bin(BinOp::And, Field::Arg(0), BUS_WINDOW_MASK);
    let high = em.bin(BinOp::And, Field::Eb, !BUS_WINDOW_MASK);
    let addr = em.bin(BinOp::Or, low, high);
    if write {
        em.host_call_void(
            HostFn::WriteExternal,
            [addr.into(), Field::Arg(1).into(), 0u32.into()],
        );
    } else {
        let value = em.host_call(HostFn::ReadExternal, [addr.into(), 0u32.into(), 0u32.into()]);
        em.mov(Field::Arg(1), value);
    }
    em.ret();

    em.bind(internal);
    if write {
        em.host_call_void(
            HostFn::WriteA,
            [Field::Arg(0).into(), Field::Arg(1).into(), 0u32.into()],
        );
    } else {
        let value = em.host_call(HostFn::ReadA, [Field::Arg(0).into(), 0u32.into(), 0u32.into()]);
        em.mov(Field::Arg(1), value);
    }
    em.ret();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::Op;

    #[test]
    fn every_handle_is_valid() {
        for handle in Handle::ALL {
            let fragment = generate(handle).unwrap();
            assert!(fragment.ops().last().unwrap().is_terminator());
        }
    }

    #[test]
    fn exits_restore_pc() {
        let fragment = generate(Handle::OutOfCycles).unwrap();
        assert_eq!(
            fragment.ops(),
            &[
                Op::Mov {
                    dst: Field::Pc.into(),
                    src: Field::Exp.into(),
                },
                Op::Exit(ExitCode::OutOfCycles),
            ]
        );
    }
}
