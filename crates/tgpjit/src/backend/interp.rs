//! A back end walking the op list of each fragment.
use super::{Backend, Code, Host, InstallError};
use crate::{
    handles,
    ir::{Array, ExitCode, Field, Fragment, Handle, Op, Operand, Place},
};
use rustc_hash::FxHashMap;
use tgpx4::Registers;
use zerocopy::IntoBytes;

/// A fragment with its labels resolved to op indices.
struct Compiled {
    ops: Box<[Op]>,
    labels: Box<[usize]>,
    temps: usize,
}

impl Compiled {
    fn new(fragment: &Fragment) -> Self {
        Self {
            ops: fragment.ops().into(),
            labels: fragment.label_positions().into(),
            temps: fragment.temps() as usize,
        }
    }
}

struct Frame<'a> {
    code: &'a Compiled,
    index: usize,
    temps: Vec<u32>,
}

impl<'a> Frame<'a> {
    fn new(code: &'a Compiled) -> Self {
        Self {
            code,
            index: 0,
            temps: vec![0; code.temps],
        }
    }
}

fn read_word(regs: &Registers, offset: usize) -> u32 {
    let mut word = [0; 4];
    word.copy_from_slice(&regs.as_bytes()[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

fn write_word(regs: &mut Registers, offset: usize, value: u32) {
    regs.as_mut_bytes()[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn element(array: Array, index: u32) -> usize {
    array.offset() + 4 * (index % array.len()) as usize
}

/// Runs fragments by interpretation. Capacity is counted in ops.
pub struct Interpreter {
    capacity: usize,
    used: usize,
    fragments: FxHashMap<u32, Compiled>,
    handles: Vec<Compiled>,
}

impl Interpreter {
    pub fn new(capacity: usize) -> Result<Self, InstallError> {
        let mut interp = Self {
            capacity,
            used: 0,
            fragments: FxHashMap::default(),
            handles: Vec::new(),
        };

        interp.reset()?;
        Ok(interp)
    }

    /// Number of ops held by the installed fragments.
    pub fn used(&self) -> usize {
        self.used
    }

    fn handle(&self, handle: Handle) -> &Compiled {
        &self.handles[handle as usize]
    }

    fn code(&self, code: Code) -> Option<&Compiled> {
        match code {
            Code::Fragment(pc) => self.fragments.get(&pc),
            Code::Handle(handle) => Some(self.handle(handle)),
        }
    }
}

impl Backend for Interpreter {
    fn reset(&mut self) -> Result<(), InstallError> {
        self.fragments.clear();
        self.used = 0;

        self.handles = Handle::ALL
            .into_iter()
            .map(|handle| {
                handles::generate(handle)
                    .map(|fragment| Compiled::new(&fragment))
                    .map_err(|source| InstallError::Handle { source })
            })
            .collect::<Result<_, _>>()?;

        Ok(())
    }

    fn install(&mut self, pc: u32, fragment: &Fragment) -> Result<(), InstallError> {
        let len = fragment.ops().len();
        if self.used + len > self.capacity {
            return Err(InstallError::CacheFull);
        }

        if let Some(old) = self.fragments.insert(pc, Compiled::new(fragment)) {
            self.used -= old.ops.len();
        }

        self.used += len;
        Ok(())
    }

    fn contains(&self, pc: u32) -> bool {
        self.fragments.contains_key(&pc)
    }

    fn len(&self) -> usize {
        self.fragments.len()
    }

    fn run(&mut self, code: Code, regs: &mut Registers, host: &mut dyn Host) -> ExitCode {
        let this = &*self;
        let Some(code) = this.code(code) else {
            regs.exp = regs.pc;
            return ExitCode::MissingCode;
        };

        let mut stack = vec![Frame::new(code)];
        loop {
            let Some(frame) = stack.last_mut() else {
                tracing::error!("returned from the top level frame");
                return ExitCode::Fault;
            };

            let Some(op) = frame.code.ops.get(frame.index).copied() else {
                tracing::error!("ran past the end of a fragment");
                return ExitCode::Fault;
            };

            frame.index += 1;

            let get = |frame: &Frame, regs: &Registers, operand: Operand| match operand {
                Operand::Imm(value) => value,
                Operand::Temp(temp) => frame.temps[temp.0 as usize],
                Operand::Field(field) => read_word(regs, field.offset()),
            };

            let set = |frame: &mut Frame, regs: &mut Registers, place: Place, value: u32| match place
            {
                Place::Temp(temp) => frame.temps[temp.0 as usize] = value,
                Place::Field(field) => write_word(regs, field.offset(), value),
            };

            match op {
                Op::Mov { dst, src } => {
                    let value = get(frame, regs, src);
                    set(frame, regs, dst, value);
                }
                Op::Bin { op, dst, a, b } => {
                    let value = op.eval(get(frame, regs, a), get(frame, regs, b));
                    set(frame, regs, dst, value);
                }
                Op::Un { op, dst, a } => {
                    let value = op.eval(get(frame, regs, a));
                    set(frame, regs, dst, value);
                }
                Op::Cmp { cond, dst, a, b } => {
                    let value = cond.eval(get(frame, regs, a), get(frame, regs, b));
                    set(frame, regs, dst, value as u32);
                }
                Op::Select { dst, cond, a, b } => {
                    let value = if get(frame, regs, cond) != 0 {
                        get(frame, regs, a)
                    } else {
                        get(frame, regs, b)
                    };

                    set(frame, regs, dst, value);
                }
                Op::Conv { conv, dst, src } => {
                    let value = conv.eval(get(frame, regs, src));
                    set(frame, regs, dst, value);
                }
                Op::Load { dst, array, index } => {
                    let index = get(frame, regs, index);
                    let value = read_word(regs, element(array, index));
                    set(frame, regs, dst, value);
                }
                Op::Store {
                    array,
                    index,
                    value,
                } => {
                    let index = get(frame, regs, index);
                    let value = get(frame, regs, value);
                    write_word(regs, element(array, index), value);
                }
                Op::HostCall { func, args, ret } => {
                    let args = args.map(|arg| get(frame, regs, arg));
                    let value = host.call(regs, func, args);
                    if let Some(ret) = ret {
                        set(frame, regs, ret, value);
                    }
                }
                Op::Bind(_) | Op::MapVar { .. } => (),
                Op::Jump(label) => frame.index = frame.code.labels[label.0 as usize],
                Op::Branch { cond, label } => {
                    if get(frame, regs, cond) != 0 {
                        frame.index = frame.code.labels[label.0 as usize];
                    }
                }
                Op::Call(handle) => stack.push(Frame::new(this.handle(handle))),
                Op::Ret => {
                    stack.pop();
                }
                Op::Exh { handle, param } => {
                    regs.exp = get(frame, regs, param);
                    stack.clear();
                    stack.push(Frame::new(this.handle(handle)));
                }
                Op::Dispatch => return ExitCode::Dispatch,
                Op::Exit(code) => return code,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BinOp, Emitter, HostFn};

    struct NoHost;

    impl Host for NoHost {
        fn call(&mut self, _: &mut Registers, _: HostFn, _: [u32; 3]) -> u32 {
            0
        }
    }

    fn counter() -> Fragment {
        let mut em = Emitter::new();
        em.bin_into(BinOp::Add, Field::Aa(0), Field::Aa(0), 1u32);
        em.mov(Field::Pc, 0u32);
        em.dispatch();
        em.finish().unwrap()
    }

    #[test]
    fn capacity_counts_ops() {
        let mut interp = Interpreter::new(5).unwrap();
        interp.install(0, &counter()).unwrap();
        assert_eq!(interp.used(), 3);

        // replacing frees the old ops
        interp.install(0, &counter()).unwrap();
        assert_eq!(interp.used(), 3);

        assert!(interp.install(1, &counter()).unwrap_err().is_cache_full());

        interp.reset().unwrap();
        assert!(interp.is_empty());
        assert_eq!(interp.used(), 0);
    }

    #[test]
    fn missing_code_exits() {
        let mut interp = Interpreter::new(64).unwrap();
        let mut regs = Registers {
            pc: 0x10,
            ..Default::default()
        };

        let exit = interp.execute(&mut regs, &mut NoHost);
        assert_eq!(exit, ExitCode::MissingCode);
        assert_eq!(regs.pc, 0x10);
    }

    #[test]
    fn out_of_cycles_through_handle() {
        let mut em = Emitter::new();
        em.bin_into(BinOp::Sub, Field::Icount, Field::Icount, 1u32);
        em.exh(Handle::OutOfCycles, 0x42u32);

        let mut interp = Interpreter::new(64).unwrap();
        interp.install(0, &em.finish().unwrap()).unwrap();

        let mut regs = Registers {
            icount: 3,
            ..Default::default()
        };

        let exit = interp.execute(&mut regs, &mut NoHost);
        assert_eq!(exit, ExitCode::OutOfCycles);
        assert_eq!(regs.pc, 0x42);
        assert_eq!(regs.icount, 2);
    }

    #[test]
    fn arrays_wrap() {
        let mut em = Emitter::new();
        em.store(Array::Pr, 25u32, 7u32);
        let value = em.load(Array::Pcs, 5u32);
        em.mov(Field::Aa(1), value);
        em.exit(ExitCode::OutOfCycles);

        let mut interp = Interpreter::new(64).unwrap();
        interp.install(0, &em.finish().unwrap()).unwrap();

        let mut regs = Registers::default();
        regs.pcs[1] = 9;

        interp.execute(&mut regs, &mut NoHost);
        assert_eq!(regs.pr[1], 7);
        assert_eq!(regs.aa[1], 9);
    }
}
