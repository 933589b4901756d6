//! A back end compiling fragments to native code with cranelift.
use super::{Backend, Code, Host, InstallError};
use crate::{
    handles,
    ir::{
        Array, BinOp, Cond, Conv, ExitCode, Field, Fragment, Handle, HostFn, Op, Operand, Place,
        UnOp,
    },
};
use cranelift::{
    codegen::{self, ir},
    frontend::{self, Variable},
    native,
    prelude::{Configurable, FloatCC, InstBuilder, IntCC, isa::TargetIsa},
};
use jitalloc::{AllocError, Allocation, Allocator, Exec};
use rustc_hash::FxHashMap;
use std::{ffi::c_void, sync::Arc};
use tgpx4::{Registers, Trap};

const MEMFLAGS: ir::MemFlags = ir::MemFlags::new().with_notrap().with_aligned();

/// Handles never call each other deeper than this.
const MAX_INLINE_DEPTH: usize = 4;

pub type Context = c_void;

/// Signature of compiled code: registers, host context, returns an [`ExitCode`].
pub type FragmentFn = extern "C" fn(*mut Registers, *mut Context) -> u32;

/// Entry point of host calls. `ctx` points to the `&mut dyn Host` given to [`Backend::run`].
extern "C" fn host_call(
    ctx: *mut Context,
    regs: *mut Registers,
    func: u32,
    a: u32,
    b: u32,
    c: u32,
) -> u32 {
    // SAFETY: both pointers come from `Cranelift::run`, which outlives the compiled call
    let (host, regs) = unsafe { (&mut *ctx.cast::<&mut dyn Host>(), &mut *regs) };
    match HostFn::from_repr(func) {
        Some(func) => host.call(regs, func, [a, b, c]),
        None => {
            regs.raise_trap(Trap::Fault);
            0
        }
    }
}

fn codegen_err(err: impl std::fmt::Display) -> InstallError {
    InstallError::Codegen(err.to_string())
}

fn alloc_err(err: AllocError) -> InstallError {
    match err {
        AllocError::Exhausted => InstallError::CacheFull,
        source => InstallError::Alloc { source },
    }
}

fn host_isa() -> Result<Arc<dyn TargetIsa>, InstallError> {
    let verifier = if cfg!(debug_assertions) {
        "true"
    } else {
        "false"
    };

    let mut codegen = codegen::settings::builder();
    let settings = [
        ("preserve_frame_pointers", "true"),
        ("use_colocated_libcalls", "false"),
        ("unwind_info", "false"),
        ("is_pic", "false"),
        // affect runtime performance
        ("opt_level", "speed"),
        ("enable_verifier", verifier),
        ("enable_alias_analysis", "true"),
        ("regalloc_algorithm", "backtracking"),
        ("regalloc_checker", "false"),
        ("enable_heap_access_spectre_mitigation", "false"),
        ("enable_table_access_spectre_mitigation", "false"),
    ];

    for (name, value) in settings {
        codegen.set(name, value).map_err(codegen_err)?;
    }

    let isa_builder = native::builder()
        .map_err(|msg| InstallError::Codegen(format!("host machine is not supported: {msg}")))?;

    isa_builder
        .finish(codegen::settings::Flags::new(codegen))
        .map_err(codegen_err)
}

/// Emits the cranelift IR of a fragment, inlining the handles it reaches.
struct Translator<'ctx> {
    bd: frontend::FunctionBuilder<'ctx>,
    handles: &'ctx [Fragment],
    ptr_type: ir::Type,
    regs_ptr: ir::Value,
    ctx_ptr: ir::Value,
    host_sig: ir::SigRef,
}

/// Per-fragment state of a [`Translator`]. Inlined handles get their own.
struct Scope {
    vars: Vec<Variable>,
    blocks: Vec<ir::Block>,
    /// Where `Ret` continues, `None` at the top level.
    ret: Option<ir::Block>,
    depth: usize,
}

impl<'ctx> Translator<'ctx> {
    fn new(
        mut bd: frontend::FunctionBuilder<'ctx>,
        isa: &dyn TargetIsa,
        handles: &'ctx [Fragment],
    ) -> Self {
        let entry_bb = bd.create_block();
        bd.append_block_params_for_function_params(entry_bb);
        bd.switch_to_block(entry_bb);
        bd.seal_block(entry_bb);

        let ptr_type = isa.pointer_type();
        let params = bd.block_params(entry_bb);
        let regs_ptr = params[0];
        let ctx_ptr = params[1];

        let host_sig = bd.import_signature(ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ptr_type),       // registers
                ir::AbiParam::new(ir::types::I32), // func
                ir::AbiParam::new(ir::types::I32), // args
                ir::AbiParam::new(ir::types::I32),
                ir::AbiParam::new(ir::types::I32),
            ],
            returns: vec![ir::AbiParam::new(ir::types::I32)],
            call_conv: isa.default_call_conv(),
        });

        Self {
            bd,
            handles,
            ptr_type,
            regs_ptr,
            ctx_ptr,
            host_sig,
        }
    }

    fn build(mut self, fragment: &Fragment) -> Result<(), InstallError> {
        self.fragment(fragment, None, 0)?;
        self.bd.seal_all_blocks();
        self.bd.finalize();

        Ok(())
    }

    fn iconst(&mut self, value: u32) -> ir::Value {
        self.bd.ins().iconst(ir::types::I32, value as i64)
    }

    fn exit(&mut self, code: ExitCode) {
        let code = self.iconst(code as u32);
        self.bd.ins().return_(&[code]);
    }

    fn load_field(&mut self, offset: usize) -> ir::Value {
        self.bd
            .ins()
            .load(ir::types::I32, MEMFLAGS, self.regs_ptr, offset as i32)
    }

    fn store_field(&mut self, offset: usize, value: ir::Value) {
        self.bd
            .ins()
            .store(MEMFLAGS, value, self.regs_ptr, offset as i32);
    }

    fn get(&mut self, scope: &Scope, operand: Operand) -> ir::Value {
        match operand {
            Operand::Imm(value) => self.iconst(value),
            Operand::Temp(temp) => self.bd.use_var(scope.vars[temp.0 as usize]),
            Operand::Field(field) => self.load_field(field.offset()),
        }
    }

    fn set(&mut self, scope: &Scope, place: Place, value: ir::Value) {
        match place {
            Place::Temp(temp) => self.bd.def_var(scope.vars[temp.0 as usize], value),
            Place::Field(field) => self.store_field(field.offset(), value),
        }
    }

    fn to_float(&mut self, value: ir::Value) -> ir::Value {
        self.bd
            .ins()
            .bitcast(ir::types::F32, ir::MemFlags::new(), value)
    }

    fn to_int(&mut self, value: ir::Value) -> ir::Value {
        self.bd
            .ins()
            .bitcast(ir::types::I32, ir::MemFlags::new(), value)
    }

    /// Address of `array[index % len]`.
    fn element(&mut self, array: Array, index: ir::Value) -> ir::Value {
        let index = self.bd.ins().urem_imm(index, array.len() as i64);
        let offset = self.bd.ins().imul_imm(index, 4);
        let offset = self.bd.ins().uextend(self.ptr_type, offset);
        self.bd.ins().iadd(self.regs_ptr, offset)
    }

    fn bin(&mut self, op: BinOp, a: ir::Value, b: ir::Value) -> ir::Value {
        match op {
            BinOp::Add => self.bd.ins().iadd(a, b),
            BinOp::Sub => self.bd.ins().isub(a, b),
            BinOp::And => self.bd.ins().band(a, b),
            BinOp::Or => self.bd.ins().bor(a, b),
            BinOp::Xor => self.bd.ins().bxor(a, b),
            BinOp::Shl => self.bd.ins().ishl(a, b),
            BinOp::Shr => self.bd.ins().ushr(a, b),
            BinOp::Sar => self.bd.ins().sshr(a, b),
            BinOp::Mul => self.bd.ins().imul(a, b),
            BinOp::MulHiS => self.bd.ins().smulhi(a, b),
            BinOp::Rem => {
                // x % 0 = 0
                let one = self.iconst(1);
                let zero = self.iconst(0);
                let divisor = self.bd.ins().select(b, b, one);
                let rem = self.bd.ins().urem(a, divisor);
                self.bd.ins().select(b, rem, zero)
            }
            BinOp::FAdd | BinOp::FSub | BinOp::FMul => {
                let (a, b) = (self.to_float(a), self.to_float(b));
                let result = match op {
                    BinOp::FAdd => self.bd.ins().fadd(a, b),
                    BinOp::FSub => self.bd.ins().fsub(a, b),
                    _ => self.bd.ins().fmul(a, b),
                };

                self.to_int(result)
            }
        }
    }

    fn un(&mut self, op: UnOp, a: ir::Value) -> ir::Value {
        match op {
            UnOp::Not => self.bd.ins().bnot(a),
            UnOp::Neg => self.bd.ins().ineg(a),
            UnOp::FAbs => self.bd.ins().band_imm(a, 0x7FFF_FFFF),
        }
    }

    fn fcmp(&mut self, cc: FloatCC, a: ir::Value, b: ir::Value) -> ir::Value {
        let (a, b) = (self.to_float(a), self.to_float(b));
        let result = self.bd.ins().fcmp(cc, a, b);
        self.bd.ins().uextend(ir::types::I32, result)
    }

    fn cmp(&mut self, cond: Cond, a: ir::Value, b: ir::Value) -> ir::Value {
        let cc = match cond {
            Cond::Eq => IntCC::Equal,
            Cond::Ne => IntCC::NotEqual,
            Cond::SLt => IntCC::SignedLessThan,
            Cond::SLe => IntCC::SignedLessThanOrEqual,
            Cond::SGt => IntCC::SignedGreaterThan,
            Cond::SGe => IntCC::SignedGreaterThanOrEqual,
            Cond::ULt => IntCC::UnsignedLessThan,
            Cond::ULe => IntCC::UnsignedLessThanOrEqual,
            Cond::UGt => IntCC::UnsignedGreaterThan,
            Cond::UGe => IntCC::UnsignedGreaterThanOrEqual,
            Cond::FEq => return self.fcmp(FloatCC::Equal, a, b),
            Cond::FLt => return self.fcmp(FloatCC::LessThan, a, b),
            Cond::FLe => return self.fcmp(FloatCC::LessThanOrEqual, a, b),
            Cond::FGt => return self.fcmp(FloatCC::GreaterThan, a, b),
            Cond::FGe => return self.fcmp(FloatCC::GreaterThanOrEqual, a, b),
        };

        let result = self.bd.ins().icmp(cc, a, b);
        self.bd.ins().uextend(ir::types::I32, result)
    }

    fn conv(&mut self, conv: Conv, value: ir::Value) -> ir::Value {
        match conv {
            Conv::FloatToIntNearest => {
                let float = self.to_float(value);
                let rounded = self.bd.ins().nearest(float);
                self.bd.ins().fcvt_to_sint_sat(ir::types::I32, rounded)
            }
            Conv::FloatToIntTrunc => {
                let float = self.to_float(value);
                self.bd.ins().fcvt_to_sint_sat(ir::types::I32, float)
            }
            Conv::IntToFloatNearest => {
                let float = self.bd.ins().fcvt_from_sint(ir::types::F32, value);
                self.to_int(float)
            }
            Conv::IntToFloatTrunc => {
                // step one ulp towards zero if rounding went away from it
                let float = self.bd.ins().fcvt_from_sint(ir::types::F32, value);
                let wide = self.bd.ins().fpromote(ir::types::F64, float);
                let wide = self.bd.ins().fabs(wide);
                let exact = self.bd.ins().fcvt_from_sint(ir::types::F64, value);
                let exact = self.bd.ins().fabs(exact);
                let away = self.bd.ins().fcmp(FloatCC::GreaterThan, wide, exact);

                let bits = self.to_int(float);
                let stepped = self.bd.ins().iadd_imm(bits, -1);
                self.bd.ins().select(away, stepped, bits)
            }
        }
    }

    fn host(&mut self, func: HostFn, args: [ir::Value; 3]) -> ir::Value {
        let callee = self
            .bd
            .ins()
            .iconst(self.ptr_type, host_call as usize as i64);
        let func = self.iconst(func as u32);

        let inst = self.bd.ins().call_indirect(
            self.host_sig,
            callee,
            &[self.ctx_ptr, self.regs_ptr, func, args[0], args[1], args[2]],
        );

        self.bd.inst_results(inst)[0]
    }

    fn fragment(
        &mut self,
        fragment: &Fragment,
        ret: Option<ir::Block>,
        depth: usize,
    ) -> Result<(), InstallError> {
        if depth > MAX_INLINE_DEPTH {
            return Err(InstallError::Codegen("handles nest too deeply".into()));
        }

        let vars: Vec<_> = (0..fragment.temps())
            .map(|_| self.bd.declare_var(ir::types::I32))
            .collect();

        let zero = self.iconst(0);
        for var in &vars {
            self.bd.def_var(*var, zero);
        }

        let scope = Scope {
            vars,
            blocks: (0..fragment.labels())
                .map(|_| self.bd.create_block())
                .collect(),
            ret,
            depth,
        };

        let mut terminated = false;
        for op in fragment.ops() {
            if let Op::Bind(label) = op {
                let block = scope.blocks[label.0 as usize];
                if !terminated {
                    self.bd.ins().jump(block, &[]);
                }

                self.bd.switch_to_block(block);
                terminated = false;
                continue;
            }

            if terminated {
                // unreachable, but still needs a block
                let dead = self.bd.create_block();
                self.bd.switch_to_block(dead);
            }

            self.op(&scope, *op)?;
            terminated = op.is_terminator();
        }

        Ok(())
    }

    fn op(&mut self, scope: &Scope, op: Op) -> Result<(), InstallError> {
        match op {
            Op::Mov { dst, src } => {
                let value = self.get(scope, src);
                self.set(scope, dst, value);
            }
            Op::Bin { op, dst, a, b } => {
                let (a, b) = (self.get(scope, a), self.get(scope, b));
                let value = self.bin(op, a, b);
                self.set(scope, dst, value);
            }
            Op::Un { op, dst, a } => {
                let a = self.get(scope, a);
                let value = self.un(op, a);
                self.set(scope, dst, value);
            }
            Op::Cmp { cond, dst, a, b } => {
                let (a, b) = (self.get(scope, a), self.get(scope, b));
                let value = self.cmp(cond, a, b);
                self.set(scope, dst, value);
            }
            Op::Select { dst, cond, a, b } => {
                let cond = self.get(scope, cond);
                let (a, b) = (self.get(scope, a), self.get(scope, b));
                let value = self.bd.ins().select(cond, a, b);
                self.set(scope, dst, value);
            }
            Op::Conv { conv, dst, src } => {
                let src = self.get(scope, src);
                let value = self.conv(conv, src);
                self.set(scope, dst, value);
            }
            Op::Load { dst, array, index } => {
                let index = self.get(scope, index);
                let addr = self.element(array, index);
                let value =
                    self.bd
                        .ins()
                        .load(ir::types::I32, MEMFLAGS, addr, array.offset() as i32);
                self.set(scope, dst, value);
            }
            Op::Store {
                array,
                index,
                value,
            } => {
                let index = self.get(scope, index);
                let value = self.get(scope, value);
                let addr = self.element(array, index);
                self.bd
                    .ins()
                    .store(MEMFLAGS, value, addr, array.offset() as i32);
            }
            Op::HostCall { func, args, ret } => {
                let args = args.map(|arg| self.get(scope, arg));
                let value = self.host(func, args);
                if let Some(ret) = ret {
                    self.set(scope, ret, value);
                }
            }
            Op::Bind(_) | Op::MapVar { .. } => (),
            Op::Jump(label) => {
                self.bd.ins().jump(scope.blocks[label.0 as usize], &[]);
            }
            Op::Branch { cond, label } => {
                let cond = self.get(scope, cond);
                let fallthrough = self.bd.create_block();
                self.bd.ins().brif(
                    cond,
                    scope.blocks[label.0 as usize],
                    &[],
                    fallthrough,
                    &[],
                );
                self.bd.switch_to_block(fallthrough);
            }
            Op::Call(handle) => {
                let cont = self.bd.create_block();
                let handles = self.handles;
                self.fragment(&handles[handle as usize], Some(cont), scope.depth + 1)?;
                self.bd.switch_to_block(cont);
            }
            Op::Ret => match scope.ret {
                Some(cont) => {
                    self.bd.ins().jump(cont, &[]);
                }
                None => self.exit(ExitCode::Fault),
            },
            Op::Exh { handle, param } => {
                let param = self.get(scope, param);
                self.store_field(Field::Exp.offset(), param);

                let handles = self.handles;
                self.fragment(&handles[handle as usize], None, scope.depth + 1)?;
            }
            Op::Dispatch => self.exit(ExitCode::Dispatch),
            Op::Exit(code) => self.exit(code),
        }

        Ok(())
    }
}

/// Compiled code held by a [`Cranelift`] back end.
struct Compiled(Allocation<Exec>);

impl Compiled {
    #[inline(always)]
    fn as_fn(&self) -> FragmentFn {
        // SAFETY: the allocation holds a function with the `FragmentFn` signature and is only
        // invalidated by resetting the allocator, which also drops every `Compiled`
        unsafe { std::mem::transmute(self.0.as_ptr().cast::<u8>()) }
    }
}

/// Runs fragments as native code.
pub struct Cranelift {
    isa: Arc<dyn TargetIsa>,
    code_ctx: codegen::Context,
    func_ctx: frontend::FunctionBuilderContext,
    allocator: Allocator<Exec>,
    handle_fragments: Vec<Fragment>,
    handles: Vec<Compiled>,
    fragments: FxHashMap<u32, Compiled>,
}

// SAFETY: compiled code is only reachable through `&mut self`
unsafe impl Send for Cranelift {}

impl Cranelift {
    /// Creates a back end whose generated code may use at most `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, InstallError> {
        let handle_fragments = Handle::ALL
            .into_iter()
            .map(|handle| {
                handles::generate(handle).map_err(|source| InstallError::Handle { source })
            })
            .collect::<Result<_, _>>()?;

        let mut backend = Self {
            isa: host_isa()?,
            code_ctx: codegen::Context::new(),
            func_ctx: frontend::FunctionBuilderContext::new(),
            allocator: Allocator::new(capacity),
            handle_fragments,
            handles: Vec::new(),
            fragments: FxHashMap::default(),
        };

        backend.reset()?;
        Ok(backend)
    }

    /// Bytes of executable memory in use.
    pub fn used(&self) -> usize {
        self.allocator.used()
    }

    fn signature(&self) -> ir::Signature {
        let ptr = self.isa.pointer_type();
        ir::Signature {
            // registers, host context
            params: vec![ir::AbiParam::new(ptr), ir::AbiParam::new(ptr)],
            returns: vec![ir::AbiParam::new(ir::types::I32)],
            call_conv: self.isa.default_call_conv(),
        }
    }

    fn compile(&mut self, fragment: &Fragment) -> Result<Compiled, InstallError> {
        let mut func = ir::Function::new();
        func.signature = self.signature();

        let bd = frontend::FunctionBuilder::new(&mut func, &mut self.func_ctx);
        Translator::new(bd, &*self.isa, &self.handle_fragments).build(fragment)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("compiled fragment:\n{}", func.display());
        }

        self.code_ctx.clear();
        self.code_ctx.func = func;
        let compiled = self
            .code_ctx
            .compile(&*self.isa, &mut Default::default())
            .map_err(|err| codegen_err(err.inner))?;

        let alloc = self
            .allocator
            .allocate(16, compiled.code_buffer())
            .map_err(alloc_err)?;

        Ok(Compiled(alloc))
    }
}

impl Backend for Cranelift {
    fn reset(&mut self) -> Result<(), InstallError> {
        self.fragments.clear();
        self.handles.clear();

        // SAFETY: every allocation was dropped above
        unsafe { self.allocator.reset() };

        for index in 0..self.handle_fragments.len() {
            let fragment = self.handle_fragments[index].clone();
            let compiled = self.compile(&fragment)?;
            self.handles.push(compiled);
        }

        Ok(())
    }

    fn install(&mut self, pc: u32, fragment: &Fragment) -> Result<(), InstallError> {
        let compiled = self.compile(fragment)?;
        self.fragments.insert(pc, compiled);

        Ok(())
    }

    fn contains(&self, pc: u32) -> bool {
        self.fragments.contains_key(&pc)
    }

    fn len(&self) -> usize {
        self.fragments.len()
    }

    fn run(&mut self, code: Code, regs: &mut Registers, mut host: &mut dyn Host) -> ExitCode {
        let compiled = match code {
            Code::Fragment(pc) => self.fragments.get(&pc),
            Code::Handle(handle) => self.handles.get(handle as usize),
        };

        let Some(compiled) = compiled else {
            regs.exp = regs.pc;
            return ExitCode::MissingCode;
        };

        let ctx = (&raw mut host).cast::<Context>();
        let exit = (compiled.as_fn())(regs, ctx);

        ExitCode::from_repr(exit).unwrap_or_else(|| {
            tracing::error!(exit, "generated code returned an unknown exit code");
            ExitCode::Fault
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::interp::Interpreter,
        ir::{Emitter, Label},
    };

    /// Answers host calls deterministically and records them.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<(HostFn, [u32; 3])>,
    }

    impl Host for Recorder {
        fn call(&mut self, _: &mut Registers, func: HostFn, args: [u32; 3]) -> u32 {
            self.calls.push((func, args));
            args[0].wrapping_mul(3).wrapping_add(func as u32)
        }
    }

    type Outcome = (ExitCode, Registers, Vec<(HostFn, [u32; 3])>);

    fn run_both(fragment: &Fragment, regs: Registers) -> Outcome {
        let mut interp = Interpreter::new(1 << 12).unwrap();
        interp.install(regs.pc, fragment).unwrap();
        let mut interp_regs = regs.clone();
        let mut interp_host = Recorder::default();
        let interp_exit = interp.execute(&mut interp_regs, &mut interp_host);

        let mut clif = Cranelift::new(1 << 20).unwrap();
        clif.install(regs.pc, fragment).unwrap();
        let mut clif_regs = regs;
        let mut clif_host = Recorder::default();
        let clif_exit = clif.execute(&mut clif_regs, &mut clif_host);

        assert_eq!(interp_exit, clif_exit);
        assert_eq!(interp_regs, clif_regs);
        assert_eq!(interp_host.calls, clif_host.calls);

        (clif_exit, clif_regs, clif_host.calls)
    }

    #[test]
    fn arithmetic_parity() {
        let mut em = Emitter::new();
        let ops = [
            BinOp::Add,
            BinOp::Sub,
            BinOp::And,
            BinOp::Or,
            BinOp::Xor,
            BinOp::Shl,
            BinOp::Shr,
            BinOp::Sar,
            BinOp::Mul,
            BinOp::MulHiS,
            BinOp::Rem,
        ];

        for (index, op) in ops.into_iter().enumerate() {
            em.bin_into(op, Field::Aa(0), Field::Aa(0), Field::Ab(index as u8 % 8));
            em.bin_into(op, Field::Ma(index as u8 % 8), Field::Ab(1), 0u32);
        }

        let not = em.un(UnOp::Not, Field::Aa(0));
        let neg = em.un(UnOp::Neg, not);
        em.mov(Field::Mb(0), neg);

        for (index, cond) in [Cond::SLt, Cond::UGt, Cond::Eq, Cond::SGe].into_iter().enumerate() {
            let flag = em.cmp(cond, Field::Aa(0), Field::Ab(2));
            em.mov(Field::Ar(index as u8), flag);
        }

        em.exit(ExitCode::OutOfCycles);

        let regs = Registers {
            aa: [0x8000_0001, 0, 0, 0, 0, 0, 0, 0],
            ab: [3, 0xFFFF_FFF0, 0, 7, 33, 0xDEAD_BEEF, 1, 0x7FFF_FFFF],
            ..Default::default()
        };

        run_both(&em.finish().unwrap(), regs);
    }

    #[test]
    fn float_parity() {
        let values = [1.5f32, -2.5, 16777217.0, -0.0, f32::MAX, 1e-40];

        let mut em = Emitter::new();
        for index in 0..values.len() as u8 {
            let sum = em.bin(BinOp::FAdd, Field::Aa(index), Field::Ab(index));
            let product = em.bin(BinOp::FMul, sum, Field::Ab(index));
            let diff = em.bin(BinOp::FSub, product, Field::Aa(index));
            let abs = em.un(UnOp::FAbs, diff);
            em.mov(Field::Ma(index), abs);

            let less = em.cmp(Cond::FLt, Field::Aa(index), Field::Ab(index));
            em.mov(Field::Ar(index), less);

            let nearest = em.conv(Conv::FloatToIntNearest, Field::Aa(index));
            em.mov(Field::Mb(index), nearest);
            let trunc = em.conv(Conv::FloatToIntTrunc, Field::Ab(index));
            let back = em.conv(Conv::IntToFloatTrunc, trunc);
            let odd = em.bin(BinOp::Or, back, 1u32);
            let round = em.conv(Conv::IntToFloatNearest, odd);
            em.mov(Field::Flag(tgpx4::Flag::Md), round);
        }

        em.exit(ExitCode::OutOfCycles);

        let mut regs = Registers::default();
        for (index, value) in values.into_iter().enumerate() {
            regs.aa[index] = value.to_bits();
            regs.ab[index] = (value * 0.75).to_bits();
        }

        run_both(&em.finish().unwrap(), regs);
    }

    #[test]
    fn loop_parity() {
        // sum 1..=10 into AA0
        let mut em = Emitter::new();
        let top: Label = em.label();
        let done = em.label();
        em.mov(Field::Ar(0), 10u32);
        em.bind(top);
        let zero = em.cmp(Cond::Eq, Field::Ar(0), 0u32);
        em.branch(zero, done);
        em.bin_into(BinOp::Add, Field::Aa(0), Field::Aa(0), Field::Ar(0));
        em.store(Array::Pr, Field::Ar(0), Field::Aa(0));
        em.bin_into(BinOp::Sub, Field::Ar(0), Field::Ar(0), 1u32);
        em.jump(top);
        em.bind(done);
        em.exit(ExitCode::OutOfCycles);

        let (exit, regs, _) = run_both(&em.finish().unwrap(), Registers::default());
        assert_eq!(exit, ExitCode::OutOfCycles);
        assert_eq!(regs.aa[0], 55);
        assert_eq!(regs.pr[10], 10);
    }

    #[test]
    fn handle_parity() {
        let mut em = Emitter::new();
        em.mov(Field::Arg(0), 0x10u32);
        em.call(Handle::ReadAbus);
        em.mov(Field::Aa(0), Field::Arg(1));

        em.mov(Field::Arg(0), 0x4010u32);
        em.mov(Field::Arg(1), 5u32);
        em.call(Handle::WriteAbus);

        let popped = em.host_call(HostFn::FifoPop, [0u32.into(), 0u32.into(), 0u32.into()]);
        em.mov(Field::Aa(1), popped);
        em.exh(Handle::OutOfCycles, 0x123u32);

        let regs = Registers {
            eb: 0x0012_0000,
            ..Default::default()
        };

        let (exit, regs, calls) = run_both(&em.finish().unwrap(), regs);
        assert_eq!(exit, ExitCode::OutOfCycles);
        assert_eq!(regs.pc, 0x123);
        assert_eq!(regs.aa[0], 0x30);
        assert_eq!(
            calls,
            vec![
                (HostFn::ReadA, [0x10, 0, 0]),
                (HostFn::WriteExternal, [0x0012_0010, 5, 0]),
                (HostFn::FifoPop, [0, 0, 0]),
            ]
        );
    }

    #[test]
    fn dispatch_between_fragments() {
        let mut first = Emitter::new();
        first.bin_into(BinOp::Add, Field::Aa(0), Field::Aa(0), 1u32);
        first.mov(Field::Pc, 0x20u32);
        first.dispatch();

        let mut second = Emitter::new();
        second.bin_into(BinOp::Add, Field::Aa(0), Field::Aa(0), 2u32);
        second.mov(Field::Pc, 0x30u32);
        second.dispatch();

        let mut clif = Cranelift::new(1 << 20).unwrap();
        clif.install(0x10, &first.finish().unwrap()).unwrap();
        clif.install(0x20, &second.finish().unwrap()).unwrap();
        assert_eq!(clif.len(), 2);

        let mut regs = Registers {
            pc: 0x10,
            ..Default::default()
        };

        let exit = clif.execute(&mut regs, &mut Recorder::default());
        assert_eq!(exit, ExitCode::MissingCode);
        assert_eq!(regs.pc, 0x30);
        assert_eq!(regs.aa[0], 3);

        clif.reset().unwrap();
        assert!(clif.is_empty());
    }
}
