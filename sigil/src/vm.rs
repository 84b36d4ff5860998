// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The interpreter: VM lifecycle, dispatch loop, and trap production.
//!
//! A [`Vm`] binds one [`Module`] to mutable execution state: linear memory,
//! globals, a bounded call stack, an argument staging buffer, and a fuel
//! counter. Host functions are registered before [`Vm::init`]; after init
//! the registry is frozen and exports become callable.
//!
//! Execution is single-threaded and cooperative. Traps abort the current
//! call chain but leave the VM usable; memory and globals keep whatever
//! partial effects the aborted call produced.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::VmError;
use crate::host::{HostFunc, HostRegistry};
use crate::memory::{LinearMemory, PAGE_SIZE};
use crate::module::{FuncBody, FuncKind, MAX_PARAMS, Module};
use crate::opcode::Opcode;
use crate::stack::CallStack;
use crate::trace::{TraceEvent, TraceMask, TraceSink};
use crate::value::Value;

/// Per-VM configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum call depth in frames.
    pub stack_size: usize,
    /// Hard cap on linear memory in bytes. A module whose `max_pages`
    /// exceed this fails [`Vm::init`] with an out-of-memory error.
    pub memory_limit: usize,
    /// Instruction budget per call window; `0` disables metering.
    pub fuel_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 512,
            memory_limit: 64 * 1024 * 1024,
            fuel_limit: 0,
        }
    }
}

struct Tracer<'a> {
    sink: &'a mut dyn TraceSink,
    mask: TraceMask,
}

type TracerSlot<'a, 'b> = Option<&'a mut Tracer<'b>>;

/// A mutable execution context bound to one module.
pub struct Vm {
    module: Arc<Module>,
    cfg: Config,
    host: HostRegistry,
    import_slots: Vec<usize>,
    memory: LinearMemory,
    globals: Vec<Value>,
    stack: CallStack,
    arg_buf: [Value; MAX_PARAMS],
    arg_count: u8,
    fuel_used: u64,
    last_error: String,
    initialized: bool,
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("cfg", &self.cfg)
            .field("initialized", &self.initialized)
            .field("fuel_used", &self.fuel_used)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Creates a VM for `module`. Allocates bookkeeping only; linear memory
    /// is not touched until [`Vm::init`].
    #[must_use]
    pub fn new(module: Arc<Module>, cfg: Config) -> Self {
        let stack = CallStack::new(cfg.stack_size);
        Self {
            module,
            cfg,
            host: HostRegistry::new(),
            import_slots: Vec::new(),
            memory: LinearMemory::empty(),
            globals: Vec::new(),
            stack,
            arg_buf: [Value::Void; MAX_PARAMS],
            arg_count: 0,
            fuel_used: 0,
            last_error: String::new(),
            initialized: false,
        }
    }

    /// The module this VM executes.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The configuration snapshot taken at creation.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Registers a host function for `(module, name)`.
    ///
    /// Must happen before [`Vm::init`]; re-registering a name replaces the
    /// previous callback (last wins).
    pub fn register(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        f: impl HostFunc + 'static,
    ) -> Result<(), VmError> {
        if self.initialized {
            return Err(self.fail(VmError::AlreadyInitialized));
        }
        self.host.register(module, name, Box::new(f));
        Ok(())
    }

    /// Initializes the VM: resolves every import, allocates linear memory to
    /// `max_pages`, applies data segments, copies globals, and runs the
    /// module's `_init` export if declared.
    ///
    /// Any failure leaves the VM uninitialized (and still freeable).
    pub fn init(&mut self) -> Result<(), VmError> {
        let result = self.init_body();
        if let Err(e) = &result {
            self.last_error = e.to_string();
        }
        result
    }

    fn init_body(&mut self) -> Result<(), VmError> {
        if self.initialized {
            return Err(VmError::AlreadyInitialized);
        }
        let module = Arc::clone(&self.module);

        let mut slots = Vec::with_capacity(module.imports().len());
        for imp in module.imports() {
            match self.host.lookup(&imp.module, &imp.name) {
                Some(slot) => slots.push(slot),
                None => {
                    return Err(VmError::UnresolvedImport {
                        module: imp.module.clone(),
                        name: imp.name.clone(),
                    });
                }
            }
        }
        self.import_slots = slots;

        if let Some(desc) = module.memory() {
            let need = u64::from(desc.max_pages) * PAGE_SIZE as u64;
            if need > self.cfg.memory_limit as u64 {
                return Err(VmError::MemoryLimitExceeded {
                    need,
                    limit: self.cfg.memory_limit as u64,
                });
            }
            self.memory = LinearMemory::new(desc.initial_pages, desc.max_pages);
            for seg in module.data_segments() {
                self.memory.write(seg.offset, module.segment_bytes(seg))?;
            }
        }

        self.globals = module.globals().iter().map(|g| g.value).collect();
        self.initialized = true;

        if let Some(init_fn) = module.init_func() {
            let mut tracer: TracerSlot<'_, '_> = None;
            if let Err(e) = self.exec(init_fn, &[], &mut tracer) {
                self.initialized = false;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Calls the exported function `name` with `args`.
    ///
    /// Returns the export's result value, or [`Value::Void`] for exports
    /// with no declared result.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        let mut tracer: TracerSlot<'_, '_> = None;
        self.call_inner(name, args, &mut tracer)
    }

    /// Like [`Vm::call`], emitting the events requested by `sink`.
    pub fn call_traced(
        &mut self,
        name: &str,
        args: &[Value],
        sink: &mut dyn TraceSink,
    ) -> Result<Value, VmError> {
        let mask = sink.mask();
        let mut t = Tracer { sink, mask };
        let mut tracer: TracerSlot<'_, '_> = Some(&mut t);
        self.call_inner(name, args, &mut tracer)
    }

    fn call_inner(
        &mut self,
        name: &str,
        args: &[Value],
        tracer: &mut TracerSlot<'_, '_>,
    ) -> Result<Value, VmError> {
        let result = self.call_body(name, args, tracer);
        if let Err(e) = &result {
            self.last_error = e.to_string();
        }
        result
    }

    fn call_body(
        &mut self,
        name: &str,
        args: &[Value],
        tracer: &mut TracerSlot<'_, '_>,
    ) -> Result<Value, VmError> {
        if !self.initialized {
            return Err(VmError::NotInitialized);
        }
        let module = Arc::clone(&self.module);
        let Some(index) = module.export_func(name) else {
            return Err(VmError::NoSuchExport { name: name.into() });
        };
        let ty = module
            .func_type(index)
            .ok_or(VmError::BadFunctionIndex { index })?;
        if args.len() != ty.params.len() {
            return Err(VmError::ArityMismatch {
                name: name.into(),
                expected: ty.params.len(),
                actual: args.len(),
            });
        }

        // Deterministic staging state at every public-call entry.
        self.arg_buf = [Value::Void; MAX_PARAMS];
        self.arg_count = 0;

        let ret = self.exec(index, args, tracer)?;
        Ok(if ty.result.is_some() {
            ret
        } else {
            Value::Void
        })
    }

    /// Resets the fuel counter and installs a new budget.
    pub fn refuel(&mut self, fuel: u64) {
        self.fuel_used = 0;
        self.cfg.fuel_limit = fuel;
    }

    /// Instructions executed since creation or the last [`Vm::refuel`].
    #[must_use]
    pub fn fuel_used(&self) -> u64 {
        self.fuel_used
    }

    /// The most recent formatted error diagnostic.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Current call depth. Zero whenever no call is in flight.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.stack.depth()
    }

    /// The currently accessible linear memory.
    #[must_use]
    pub fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    /// The currently accessible linear memory, mutably. The slice is
    /// invalidated by [`Vm::memory_grow`].
    #[must_use]
    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    /// Current linear memory size in bytes.
    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.memory.size()
    }

    /// Grows linear memory by `delta` pages. Returns the previous page
    /// count, or an out-of-memory error if `max_pages` would be exceeded.
    pub fn memory_grow(&mut self, delta: u32) -> Result<u32, VmError> {
        match self.memory.grow(delta) {
            -1 => {
                let need =
                    (u64::from(self.memory.pages()) + u64::from(delta)) * PAGE_SIZE as u64;
                let limit = u64::from(self.memory.max_pages()) * PAGE_SIZE as u64;
                Err(self.fail(VmError::MemoryLimitExceeded { need, limit }))
            }
            prev => Ok(prev as u32),
        }
    }

    /// Bounds-checked read from linear memory.
    pub fn memory_read(&mut self, offset: u32, dst: &mut [u8]) -> Result<(), VmError> {
        match self.memory.read(offset, dst) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(VmError::MemoryOutOfBounds(e))),
        }
    }

    /// Bounds-checked write to linear memory.
    pub fn memory_write(&mut self, offset: u32, src: &[u8]) -> Result<(), VmError> {
        match self.memory.write(offset, src) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(VmError::MemoryOutOfBounds(e))),
        }
    }

    fn fail(&mut self, e: VmError) -> VmError {
        self.last_error = e.to_string();
        e
    }

    /// Copies the staged arguments out and resets the buffer to `Void`.
    fn take_args(&mut self) -> (usize, [Value; MAX_PARAMS]) {
        let argc = usize::from(self.arg_count);
        let args = self.arg_buf;
        self.arg_buf = [Value::Void; MAX_PARAMS];
        self.arg_count = 0;
        (argc, args)
    }

    /// Executes function `func_idx` with `args`, recursing on `call`.
    fn exec(
        &mut self,
        func_idx: u32,
        args: &[Value],
        tracer: &mut TracerSlot<'_, '_>,
    ) -> Result<Value, VmError> {
        let module = Arc::clone(&self.module);
        let func = module
            .func(func_idx)
            .ok_or(VmError::BadFunctionIndex { index: func_idx })?;
        if self.stack.depth() >= self.stack.limit() {
            return Err(VmError::StackOverflow {
                limit: self.stack.limit(),
            });
        }

        match &func.kind {
            FuncKind::Import { import_idx } => {
                self.dispatch_host(&module, *import_idx, args, tracer)
            }
            FuncKind::Body(body) => {
                let Some(fi) = self.stack.push() else {
                    return Err(VmError::StackOverflow {
                        limit: self.stack.limit(),
                    });
                };
                let copy_n = args.len().min(usize::from(body.reg_count));
                for (i, &a) in args.iter().take(copy_n).enumerate() {
                    self.stack.set_reg(fi, i as u8, a);
                }

                if let Some(t) = tracer.as_deref_mut()
                    && t.mask.contains(TraceMask::CALL)
                {
                    t.sink.event(TraceEvent::CallEnter {
                        func: func_idx,
                        depth: self.stack.depth(),
                    });
                }

                let result = self.run_frame(fi, &module, func_idx, body, tracer);

                if let Some(t) = tracer.as_deref_mut()
                    && t.mask.contains(TraceMask::CALL)
                {
                    t.sink.event(TraceEvent::CallExit {
                        func: func_idx,
                        depth: self.stack.depth(),
                    });
                }
                self.stack.pop();
                result
            }
        }
    }

    fn dispatch_host(
        &mut self,
        module: &Module,
        import_idx: u32,
        args: &[Value],
        tracer: &mut TracerSlot<'_, '_>,
    ) -> Result<Value, VmError> {
        let slot = *self
            .import_slots
            .get(import_idx as usize)
            .ok_or(VmError::BadImportIndex { index: import_idx })?;
        let imp = &module.imports()[import_idx as usize];

        if let Some(t) = tracer.as_deref_mut()
            && t.mask.contains(TraceMask::HOST)
        {
            t.sink.event(TraceEvent::HostCall {
                module: &imp.module,
                name: &imp.name,
                args: args.len(),
            });
        }

        let Vm { memory, host, .. } = self;
        host.get_mut(slot).call(memory, args).map_err(VmError::Host)
    }

    #[allow(
        clippy::too_many_lines,
        reason = "one arm per opcode keeps dispatch flat"
    )]
    fn run_frame(
        &mut self,
        fi: usize,
        module: &Module,
        func: u32,
        body: &FuncBody,
        tracer: &mut TracerSlot<'_, '_>,
    ) -> Result<Value, VmError> {
        let code = module.code(body);
        let words = body.code_words();
        let mut pc: u32 = 0;

        while pc < words {
            if self.cfg.fuel_limit > 0 {
                if self.fuel_used >= self.cfg.fuel_limit {
                    return Err(VmError::FuelExhausted {
                        limit: self.cfg.fuel_limit,
                    });
                }
                self.fuel_used += 1;
            }

            let instr_pc = pc;
            let w = word_at(code, pc);
            pc += 1;
            let op_byte = (w & 0xFF) as u8;
            let dst = ((w >> 8) & 0xFF) as u8;
            let s1 = ((w >> 16) & 0xFF) as u8;
            let s2 = (w >> 24) as u8;
            let Some(op) = Opcode::from_u8(op_byte) else {
                return Err(VmError::BadOpcode {
                    opcode: op_byte,
                    func,
                    pc: instr_pc,
                });
            };

            if let Some(t) = tracer.as_deref_mut()
                && t.mask.contains(TraceMask::INSTR)
            {
                t.sink.event(TraceEvent::Instr {
                    func,
                    pc: instr_pc,
                    opcode: op_byte,
                });
            }

            match op {
                // Control.
                Opcode::Nop => {}
                Opcode::Trap => {
                    return Err(VmError::ExplicitTrap { func, pc: instr_pc });
                }
                Opcode::Ret => return Ok(self.stack.reg(fi, 0)),
                Opcode::Jmp => {
                    let off = imm32(code, words, &mut pc, func)? as i32;
                    pc = pc.wrapping_add_signed(off);
                }
                Opcode::Jz => {
                    let off = imm32(code, words, &mut pc, func)? as i32;
                    if is_zero(self.stack.reg(fi, s1)) {
                        pc = pc.wrapping_add_signed(off);
                    }
                }
                Opcode::Jnz => {
                    let off = imm32(code, words, &mut pc, func)? as i32;
                    if !is_zero(self.stack.reg(fi, s1)) {
                        pc = pc.wrapping_add_signed(off);
                    }
                }
                Opcode::Jlt => {
                    let off = imm32(code, words, &mut pc, func)? as i32;
                    if self.stack.reg(fi, s1).as_i32() < self.stack.reg(fi, s2).as_i32() {
                        pc = pc.wrapping_add_signed(off);
                    }
                }
                Opcode::Jle => {
                    let off = imm32(code, words, &mut pc, func)? as i32;
                    if self.stack.reg(fi, s1).as_i32() <= self.stack.reg(fi, s2).as_i32() {
                        pc = pc.wrapping_add_signed(off);
                    }
                }
                Opcode::Call => {
                    let target = imm32(code, words, &mut pc, func)?;
                    let (argc, call_args) = self.take_args();
                    let ret = self.exec(target, &call_args[..argc], tracer)?;
                    self.stack.set_reg(fi, dst, ret);
                }
                Opcode::CallHost => {
                    let import_idx = imm32(code, words, &mut pc, func)?;
                    if import_idx >= module.import_count() {
                        return Err(VmError::BadImportIndex { index: import_idx });
                    }
                    let (argc, call_args) = self.take_args();
                    let ret =
                        self.dispatch_host(module, import_idx, &call_args[..argc], tracer)?;
                    self.stack.set_reg(fi, dst, ret);
                }
                Opcode::Arg => {
                    let slot = usize::from(dst);
                    if slot >= MAX_PARAMS {
                        return Err(VmError::BadArgSlot { slot: dst });
                    }
                    self.arg_buf[slot] = self.stack.reg(fi, s1);
                    if dst >= self.arg_count {
                        self.arg_count = dst + 1;
                    }
                }

                // Immediate loads, globals, moves.
                Opcode::Ldi32 => {
                    let imm = imm32(code, words, &mut pc, func)?;
                    self.stack.set_reg(fi, dst, Value::I32(imm as i32));
                }
                Opcode::Ldi64 => {
                    let imm = imm64(code, words, &mut pc, func)?;
                    self.stack.set_reg(fi, dst, Value::I64(imm as i64));
                }
                Opcode::Ldf32 => {
                    let bits = imm32(code, words, &mut pc, func)?;
                    self.stack.set_reg(fi, dst, Value::F32(f32::from_bits(bits)));
                }
                Opcode::Ldf64 => {
                    let bits = imm64(code, words, &mut pc, func)?;
                    self.stack.set_reg(fi, dst, Value::F64(f64::from_bits(bits)));
                }
                Opcode::Ldtrue => self.stack.set_reg(fi, dst, Value::Bool(true)),
                Opcode::Ldfalse => self.stack.set_reg(fi, dst, Value::Bool(false)),
                Opcode::Ldglobal => {
                    let gi = imm32(code, words, &mut pc, func)?;
                    let v = self
                        .globals
                        .get(gi as usize)
                        .copied()
                        .ok_or(VmError::BadGlobalIndex { index: gi })?;
                    self.stack.set_reg(fi, dst, v);
                }
                Opcode::Stglobal => {
                    let gi = imm32(code, words, &mut pc, func)?;
                    if gi as usize >= self.globals.len() {
                        return Err(VmError::BadGlobalIndex { index: gi });
                    }
                    self.globals[gi as usize] = self.stack.reg(fi, s1);
                }
                Opcode::Mov => {
                    let v = self.stack.reg(fi, s1);
                    self.stack.set_reg(fi, dst, v);
                }

                // i32 arithmetic / bitwise.
                Opcode::Add32 => self.bin32(fi, dst, s1, s2, i32::wrapping_add),
                Opcode::Sub32 => self.bin32(fi, dst, s1, s2, i32::wrapping_sub),
                Opcode::Mul32 => self.bin32(fi, dst, s1, s2, i32::wrapping_mul),
                Opcode::Div32 => {
                    let b = self.stack.reg(fi, s2).as_i32();
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i32();
                    self.stack.set_reg(fi, dst, Value::I32(a.wrapping_div(b)));
                }
                Opcode::Divu32 => {
                    let b = self.stack.reg(fi, s2).as_i32() as u32;
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i32() as u32;
                    self.stack.set_reg(fi, dst, Value::I32((a / b) as i32));
                }
                Opcode::Rem32 => {
                    let b = self.stack.reg(fi, s2).as_i32();
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i32();
                    self.stack.set_reg(fi, dst, Value::I32(a.wrapping_rem(b)));
                }
                Opcode::Remu32 => {
                    let b = self.stack.reg(fi, s2).as_i32() as u32;
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i32() as u32;
                    self.stack.set_reg(fi, dst, Value::I32((a % b) as i32));
                }
                Opcode::Neg32 => self.un32(fi, dst, s1, i32::wrapping_neg),
                Opcode::And32 => self.bin32(fi, dst, s1, s2, |a, b| a & b),
                Opcode::Or32 => self.bin32(fi, dst, s1, s2, |a, b| a | b),
                Opcode::Xor32 => self.bin32(fi, dst, s1, s2, |a, b| a ^ b),
                Opcode::Shl32 => self.bin32(fi, dst, s1, s2, |a, b| a.wrapping_shl(b as u32)),
                Opcode::Shr32 => self.bin32(fi, dst, s1, s2, |a, b| a.wrapping_shr(b as u32)),
                Opcode::Shru32 => self.bin32(fi, dst, s1, s2, |a, b| {
                    ((a as u32).wrapping_shr(b as u32)) as i32
                }),
                Opcode::Not32 => self.un32(fi, dst, s1, |a| !a),
                Opcode::Clz32 => self.un32(fi, dst, s1, |a| a.leading_zeros() as i32),
                Opcode::Ctz32 => self.un32(fi, dst, s1, |a| a.trailing_zeros() as i32),
                Opcode::Popcnt32 => self.un32(fi, dst, s1, |a| a.count_ones() as i32),

                // i64 arithmetic / bitwise.
                Opcode::Add64 => self.bin64(fi, dst, s1, s2, i64::wrapping_add),
                Opcode::Sub64 => self.bin64(fi, dst, s1, s2, i64::wrapping_sub),
                Opcode::Mul64 => self.bin64(fi, dst, s1, s2, i64::wrapping_mul),
                Opcode::Div64 => {
                    let b = self.stack.reg(fi, s2).as_i64();
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i64();
                    self.stack.set_reg(fi, dst, Value::I64(a.wrapping_div(b)));
                }
                Opcode::Divu64 => {
                    let b = self.stack.reg(fi, s2).as_i64() as u64;
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i64() as u64;
                    self.stack.set_reg(fi, dst, Value::I64((a / b) as i64));
                }
                Opcode::Rem64 => {
                    let b = self.stack.reg(fi, s2).as_i64();
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i64();
                    self.stack.set_reg(fi, dst, Value::I64(a.wrapping_rem(b)));
                }
                Opcode::Remu64 => {
                    let b = self.stack.reg(fi, s2).as_i64() as u64;
                    if b == 0 {
                        return Err(VmError::DivideByZero { func, pc: instr_pc });
                    }
                    let a = self.stack.reg(fi, s1).as_i64() as u64;
                    self.stack.set_reg(fi, dst, Value::I64((a % b) as i64));
                }
                Opcode::Neg64 => self.un64(fi, dst, s1, i64::wrapping_neg),
                Opcode::And64 => self.bin64(fi, dst, s1, s2, |a, b| a & b),
                Opcode::Or64 => self.bin64(fi, dst, s1, s2, |a, b| a | b),
                Opcode::Xor64 => self.bin64(fi, dst, s1, s2, |a, b| a ^ b),
                Opcode::Shl64 => self.bin64(fi, dst, s1, s2, |a, b| a.wrapping_shl(b as u32)),
                Opcode::Shr64 => self.bin64(fi, dst, s1, s2, |a, b| a.wrapping_shr(b as u32)),
                Opcode::Shru64 => self.bin64(fi, dst, s1, s2, |a, b| {
                    ((a as u64).wrapping_shr(b as u32)) as i64
                }),
                Opcode::Not64 => self.un64(fi, dst, s1, |a| !a),
                Opcode::Clz64 => self.un64(fi, dst, s1, |a| i64::from(a.leading_zeros())),
                Opcode::Ctz64 => self.un64(fi, dst, s1, |a| i64::from(a.trailing_zeros())),
                Opcode::Popcnt64 => self.un64(fi, dst, s1, |a| i64::from(a.count_ones())),

                // f32.
                Opcode::Fadd32 => self.binf32(fi, dst, s1, s2, |a, b| a + b),
                Opcode::Fsub32 => self.binf32(fi, dst, s1, s2, |a, b| a - b),
                Opcode::Fmul32 => self.binf32(fi, dst, s1, s2, |a, b| a * b),
                Opcode::Fdiv32 => self.binf32(fi, dst, s1, s2, |a, b| a / b),
                Opcode::Fabs32 => self.unf32(fi, dst, s1, libm::fabsf),
                Opcode::Fneg32 => self.unf32(fi, dst, s1, |a| -a),
                Opcode::Fsqrt32 => self.unf32(fi, dst, s1, libm::sqrtf),
                Opcode::Fmin32 => self.binf32(fi, dst, s1, s2, libm::fminf),
                Opcode::Fmax32 => self.binf32(fi, dst, s1, s2, libm::fmaxf),
                Opcode::Ffloor32 => self.unf32(fi, dst, s1, libm::floorf),
                Opcode::Fceil32 => self.unf32(fi, dst, s1, libm::ceilf),
                Opcode::Fround32 => self.unf32(fi, dst, s1, libm::roundf),

                // f64.
                Opcode::Fadd64 => self.binf64(fi, dst, s1, s2, |a, b| a + b),
                Opcode::Fsub64 => self.binf64(fi, dst, s1, s2, |a, b| a - b),
                Opcode::Fmul64 => self.binf64(fi, dst, s1, s2, |a, b| a * b),
                Opcode::Fdiv64 => self.binf64(fi, dst, s1, s2, |a, b| a / b),
                Opcode::Fabs64 => self.unf64(fi, dst, s1, libm::fabs),
                Opcode::Fneg64 => self.unf64(fi, dst, s1, |a| -a),
                Opcode::Fsqrt64 => self.unf64(fi, dst, s1, libm::sqrt),
                Opcode::Fmin64 => self.binf64(fi, dst, s1, s2, libm::fmin),
                Opcode::Fmax64 => self.binf64(fi, dst, s1, s2, libm::fmax),
                Opcode::Ffloor64 => self.unf64(fi, dst, s1, libm::floor),
                Opcode::Fceil64 => self.unf64(fi, dst, s1, libm::ceil),
                Opcode::Fround64 => self.unf64(fi, dst, s1, libm::round),

                // Comparisons.
                Opcode::Eq32 => self.cmp32(fi, dst, s1, s2, |a, b| a == b),
                Opcode::Ne32 => self.cmp32(fi, dst, s1, s2, |a, b| a != b),
                Opcode::Lt32 => self.cmp32(fi, dst, s1, s2, |a, b| a < b),
                Opcode::Le32 => self.cmp32(fi, dst, s1, s2, |a, b| a <= b),
                Opcode::Gt32 => self.cmp32(fi, dst, s1, s2, |a, b| a > b),
                Opcode::Ge32 => self.cmp32(fi, dst, s1, s2, |a, b| a >= b),
                Opcode::Ltu32 => self.cmpu32(fi, dst, s1, s2, |a, b| a < b),
                Opcode::Leu32 => self.cmpu32(fi, dst, s1, s2, |a, b| a <= b),
                Opcode::Eq64 => self.cmp64(fi, dst, s1, s2, |a, b| a == b),
                Opcode::Ne64 => self.cmp64(fi, dst, s1, s2, |a, b| a != b),
                Opcode::Lt64 => self.cmp64(fi, dst, s1, s2, |a, b| a < b),
                Opcode::Le64 => self.cmp64(fi, dst, s1, s2, |a, b| a <= b),
                Opcode::Gt64 => self.cmp64(fi, dst, s1, s2, |a, b| a > b),
                Opcode::Ge64 => self.cmp64(fi, dst, s1, s2, |a, b| a >= b),
                Opcode::Ltu64 => self.cmpu64(fi, dst, s1, s2, |a, b| a < b),
                Opcode::Leu64 => self.cmpu64(fi, dst, s1, s2, |a, b| a <= b),
                Opcode::Feq32 => self.cmpf32(fi, dst, s1, s2, |a, b| a == b),
                Opcode::Flt32 => self.cmpf32(fi, dst, s1, s2, |a, b| a < b),
                Opcode::Feq64 => self.cmpf64(fi, dst, s1, s2, |a, b| a == b),
                Opcode::Flt64 => self.cmpf64(fi, dst, s1, s2, |a, b| a < b),

                // Conversions. Float-to-int is saturating with NaN -> 0.
                Opcode::I32ToI64 => self.cvt(fi, dst, s1, |v| Value::I64(i64::from(v.as_i32()))),
                Opcode::U32ToI64 => {
                    self.cvt(fi, dst, s1, |v| Value::I64(i64::from(v.as_i32() as u32)));
                }
                Opcode::I64ToI32 => self.cvt(fi, dst, s1, |v| Value::I32(v.as_i64() as i32)),
                Opcode::I32ToF32 => self.cvt(fi, dst, s1, |v| Value::F32(v.as_i32() as f32)),
                Opcode::I32ToF64 => self.cvt(fi, dst, s1, |v| Value::F64(f64::from(v.as_i32()))),
                Opcode::F32ToI32 => self.cvt(fi, dst, s1, |v| Value::I32(v.as_f32() as i32)),
                Opcode::F64ToI32 => self.cvt(fi, dst, s1, |v| Value::I32(v.as_f64() as i32)),
                Opcode::F32ToF64 => self.cvt(fi, dst, s1, |v| Value::F64(f64::from(v.as_f32()))),
                Opcode::F64ToF32 => self.cvt(fi, dst, s1, |v| Value::F32(v.as_f64() as f32)),
                Opcode::I64ToF64 => self.cvt(fi, dst, s1, |v| Value::F64(v.as_i64() as f64)),
                Opcode::F64ToI64 => self.cvt(fi, dst, s1, |v| Value::I64(v.as_f64() as i64)),
                Opcode::BoolToI32 => {
                    self.cvt(fi, dst, s1, |v| Value::I32(i32::from(v.as_bool())));
                }

                // Memory loads.
                Opcode::Load8 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let [b] = self.memory.load::<1>(addr)?;
                    self.stack.set_reg(fi, dst, Value::I32(i32::from(b)));
                }
                Opcode::Load8S => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let [b] = self.memory.load::<1>(addr)?;
                    self.stack.set_reg(fi, dst, Value::I32(i32::from(b as i8)));
                }
                Opcode::Load16 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = u16::from_le_bytes(self.memory.load(addr)?);
                    self.stack.set_reg(fi, dst, Value::I32(i32::from(v)));
                }
                Opcode::Load16S => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = i16::from_le_bytes(self.memory.load(addr)?);
                    self.stack.set_reg(fi, dst, Value::I32(i32::from(v)));
                }
                Opcode::Load32 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = u32::from_le_bytes(self.memory.load(addr)?);
                    self.stack.set_reg(fi, dst, Value::I32(v as i32));
                }
                Opcode::Load64 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = u64::from_le_bytes(self.memory.load(addr)?);
                    self.stack.set_reg(fi, dst, Value::I64(v as i64));
                }
                Opcode::Loadf32 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = f32::from_le_bytes(self.memory.load(addr)?);
                    self.stack.set_reg(fi, dst, Value::F32(v));
                }
                Opcode::Loadf64 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = f64::from_le_bytes(self.memory.load(addr)?);
                    self.stack.set_reg(fi, dst, Value::F64(v));
                }

                // Memory stores. `dst` names the value register.
                Opcode::Store8 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = self.stack.reg(fi, dst).as_i32() as u8;
                    self.memory.store(addr, [v])?;
                }
                Opcode::Store16 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = self.stack.reg(fi, dst).as_i32() as u16;
                    self.memory.store(addr, v.to_le_bytes())?;
                }
                Opcode::Store32 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = self.stack.reg(fi, dst).as_i32() as u32;
                    self.memory.store(addr, v.to_le_bytes())?;
                }
                Opcode::Store64 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = self.stack.reg(fi, dst).as_i64() as u64;
                    self.memory.store(addr, v.to_le_bytes())?;
                }
                Opcode::Storef32 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = self.stack.reg(fi, dst).as_f32();
                    self.memory.store(addr, v.to_le_bytes())?;
                }
                Opcode::Storef64 => {
                    let addr = self.effective_addr(code, words, &mut pc, fi, s1, func)?;
                    let v = self.stack.reg(fi, dst).as_f64();
                    self.memory.store(addr, v.to_le_bytes())?;
                }

                // Memory system ops.
                Opcode::MemSize => {
                    self.stack
                        .set_reg(fi, dst, Value::I32(self.memory.pages() as i32));
                }
                Opcode::MemGrow => {
                    let delta = self.stack.reg(fi, s1).as_i32() as u32;
                    let prev = self.memory.grow(delta);
                    self.stack.set_reg(fi, dst, Value::I32(prev));
                }
                Opcode::MemCopy => {
                    let d = self.stack.reg(fi, dst).as_i32() as u32;
                    let s = self.stack.reg(fi, s1).as_i32() as u32;
                    let len = self.stack.reg(fi, s2).as_i32() as u32;
                    self.memory.copy(d, s, len)?;
                }
                Opcode::MemFill => {
                    let d = self.stack.reg(fi, dst).as_i32() as u32;
                    let v = self.stack.reg(fi, s1).as_i32() as u8;
                    let len = self.stack.reg(fi, s2).as_i32() as u32;
                    self.memory.fill(d, v, len)?;
                }
            }
        }

        // Fell off the end: implicit return with R0.
        Ok(self.stack.reg(fi, 0))
    }

    fn effective_addr(
        &mut self,
        code: &[u8],
        words: u32,
        pc: &mut u32,
        fi: usize,
        base: u8,
        func: u32,
    ) -> Result<u32, VmError> {
        let off = imm32(code, words, pc, func)?;
        Ok((self.stack.reg(fi, base).as_i32() as u32).wrapping_add(off))
    }

    #[inline]
    fn bin32(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(i32, i32) -> i32) {
        let a = self.stack.reg(fi, s1).as_i32();
        let b = self.stack.reg(fi, s2).as_i32();
        self.stack.set_reg(fi, dst, Value::I32(f(a, b)));
    }

    #[inline]
    fn un32(&mut self, fi: usize, dst: u8, s1: u8, f: impl FnOnce(i32) -> i32) {
        let a = self.stack.reg(fi, s1).as_i32();
        self.stack.set_reg(fi, dst, Value::I32(f(a)));
    }

    #[inline]
    fn bin64(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(i64, i64) -> i64) {
        let a = self.stack.reg(fi, s1).as_i64();
        let b = self.stack.reg(fi, s2).as_i64();
        self.stack.set_reg(fi, dst, Value::I64(f(a, b)));
    }

    #[inline]
    fn un64(&mut self, fi: usize, dst: u8, s1: u8, f: impl FnOnce(i64) -> i64) {
        let a = self.stack.reg(fi, s1).as_i64();
        self.stack.set_reg(fi, dst, Value::I64(f(a)));
    }

    #[inline]
    fn binf32(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(f32, f32) -> f32) {
        let a = self.stack.reg(fi, s1).as_f32();
        let b = self.stack.reg(fi, s2).as_f32();
        self.stack.set_reg(fi, dst, Value::F32(f(a, b)));
    }

    #[inline]
    fn unf32(&mut self, fi: usize, dst: u8, s1: u8, f: impl FnOnce(f32) -> f32) {
        let a = self.stack.reg(fi, s1).as_f32();
        self.stack.set_reg(fi, dst, Value::F32(f(a)));
    }

    #[inline]
    fn binf64(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(f64, f64) -> f64) {
        let a = self.stack.reg(fi, s1).as_f64();
        let b = self.stack.reg(fi, s2).as_f64();
        self.stack.set_reg(fi, dst, Value::F64(f(a, b)));
    }

    #[inline]
    fn unf64(&mut self, fi: usize, dst: u8, s1: u8, f: impl FnOnce(f64) -> f64) {
        let a = self.stack.reg(fi, s1).as_f64();
        self.stack.set_reg(fi, dst, Value::F64(f(a)));
    }

    #[inline]
    fn cmp32(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(i32, i32) -> bool) {
        let a = self.stack.reg(fi, s1).as_i32();
        let b = self.stack.reg(fi, s2).as_i32();
        self.stack.set_reg(fi, dst, Value::Bool(f(a, b)));
    }

    #[inline]
    fn cmpu32(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(u32, u32) -> bool) {
        let a = self.stack.reg(fi, s1).as_i32() as u32;
        let b = self.stack.reg(fi, s2).as_i32() as u32;
        self.stack.set_reg(fi, dst, Value::Bool(f(a, b)));
    }

    #[inline]
    fn cmp64(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(i64, i64) -> bool) {
        let a = self.stack.reg(fi, s1).as_i64();
        let b = self.stack.reg(fi, s2).as_i64();
        self.stack.set_reg(fi, dst, Value::Bool(f(a, b)));
    }

    #[inline]
    fn cmpu64(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(u64, u64) -> bool) {
        let a = self.stack.reg(fi, s1).as_i64() as u64;
        let b = self.stack.reg(fi, s2).as_i64() as u64;
        self.stack.set_reg(fi, dst, Value::Bool(f(a, b)));
    }

    #[inline]
    fn cmpf32(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(f32, f32) -> bool) {
        let a = self.stack.reg(fi, s1).as_f32();
        let b = self.stack.reg(fi, s2).as_f32();
        self.stack.set_reg(fi, dst, Value::Bool(f(a, b)));
    }

    #[inline]
    fn cmpf64(&mut self, fi: usize, dst: u8, s1: u8, s2: u8, f: impl FnOnce(f64, f64) -> bool) {
        let a = self.stack.reg(fi, s1).as_f64();
        let b = self.stack.reg(fi, s2).as_f64();
        self.stack.set_reg(fi, dst, Value::Bool(f(a, b)));
    }

    #[inline]
    fn cvt(&mut self, fi: usize, dst: u8, s1: u8, f: impl FnOnce(Value) -> Value) {
        let v = self.stack.reg(fi, s1);
        self.stack.set_reg(fi, dst, f(v));
    }
}

/// Branch-condition coercion: bool as `!b`, integers and pointers as `== 0`,
/// anything else is nonzero.
fn is_zero(v: Value) -> bool {
    match v {
        Value::Bool(b) => !b,
        Value::I32(v) => v == 0,
        Value::I64(v) => v == 0,
        Value::Ptr(p) => p == 0,
        Value::F32(_) | Value::F64(_) | Value::Void => false,
    }
}

#[inline]
fn word_at(code: &[u8], pc: u32) -> u32 {
    let i = pc as usize * 4;
    u32::from_le_bytes([code[i], code[i + 1], code[i + 2], code[i + 3]])
}

fn imm32(code: &[u8], words: u32, pc: &mut u32, func: u32) -> Result<u32, VmError> {
    if *pc >= words {
        return Err(VmError::TruncatedCode { func, pc: *pc });
    }
    let w = word_at(code, *pc);
    *pc += 1;
    Ok(w)
}

fn imm64(code: &[u8], words: u32, pc: &mut u32, func: u32) -> Result<u64, VmError> {
    let lo = u64::from(imm32(code, words, pc, func)?);
    let hi = u64::from(imm32(code, words, pc, func)?);
    Ok(lo | (hi << 32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Asm, ModuleBuilder};
    use crate::error::ErrorCode;
    use crate::host::HostError;
    use crate::value::ValueType;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    fn vm_for(builder: &ModuleBuilder) -> Vm {
        let module = Arc::new(Module::load(&builder.finish()).unwrap());
        let mut vm = Vm::new(module, Config::default());
        vm.init().unwrap();
        vm
    }

    /// One export `f(a: i32, b: i32) -> i32` whose body is `asm`.
    fn binop_vm(asm: Asm) -> Vm {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
        let f = b.func(ty, 8, 0, asm).unwrap();
        b.export_func(f, "f");
        vm_for(&b)
    }

    fn run2(vm: &mut Vm, a: i32, b: i32) -> Result<Value, VmError> {
        vm.call("f", &[Value::I32(a), Value::I32(b)])
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let mut a = Asm::new();
        a.op(Opcode::Add32, 0, 0, 1);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, 10, 32).unwrap(), Value::I32(42));
        assert_eq!(run2(&mut vm, i32::MAX, 1).unwrap(), Value::I32(i32::MIN));

        let mut a = Asm::new();
        a.op(Opcode::Mul32, 0, 0, 1);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(
            run2(&mut vm, i32::MAX, 2).unwrap(),
            Value::I32(i32::MAX.wrapping_mul(2))
        );
    }

    #[test]
    fn signed_division_edge_cases() {
        let mut a = Asm::new();
        a.op(Opcode::Div32, 0, 0, 1);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, 10, 2).unwrap(), Value::I32(5));
        // INT_MIN / -1 wraps instead of faulting.
        assert_eq!(run2(&mut vm, i32::MIN, -1).unwrap(), Value::I32(i32::MIN));
        let err = run2(&mut vm, 10, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DivZero);
        assert_eq!(vm.frame_count(), 0);

        let mut a = Asm::new();
        a.op(Opcode::Rem32, 0, 0, 1);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, i32::MIN, -1).unwrap(), Value::I32(0));
    }

    #[test]
    fn shift_amounts_are_masked() {
        let mut a = Asm::new();
        a.op(Opcode::Shl32, 0, 0, 1);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, 1, 33).unwrap(), Value::I32(2));

        let mut a = Asm::new();
        a.op(Opcode::Shru32, 0, 0, 1);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, -1, 28).unwrap(), Value::I32(15));
    }

    #[test]
    fn clz_ctz_of_zero_yield_width() {
        let mut a = Asm::new();
        a.op(Opcode::Clz32, 0, 0, 0);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, 0, 0).unwrap(), Value::I32(32));

        let mut a = Asm::new();
        a.op(Opcode::Ctz32, 0, 0, 0);
        a.ret();
        let mut vm = binop_vm(a);
        assert_eq!(run2(&mut vm, 0, 0).unwrap(), Value::I32(32));
        assert_eq!(run2(&mut vm, 8, 0).unwrap(), Value::I32(3));
    }

    #[test]
    fn float_division_by_zero_does_not_trap() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], Some(ValueType::F64));
        let mut a = Asm::new();
        a.ldf64(0, 1.0);
        a.ldf64(1, 0.0);
        a.op(Opcode::Fdiv64, 0, 0, 1);
        a.ret();
        let f = b.func(ty, 2, 0, a).unwrap();
        b.export_func(f, "f");
        let mut vm = vm_for(&b);
        let Value::F64(v) = vm.call("f", &[]).unwrap() else {
            panic!("expected f64");
        };
        assert!(v.is_infinite() && v.is_sign_positive());
    }

    #[test]
    fn float_to_int_saturates() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[ValueType::F64], Some(ValueType::I32));
        let mut a = Asm::new();
        a.op(Opcode::F64ToI32, 0, 0, 0);
        a.ret();
        let f = b.func(ty, 2, 0, a).unwrap();
        b.export_func(f, "f");
        let mut vm = vm_for(&b);
        assert_eq!(
            vm.call("f", &[Value::F64(1e12)]).unwrap(),
            Value::I32(i32::MAX)
        );
        assert_eq!(
            vm.call("f", &[Value::F64(-1e12)]).unwrap(),
            Value::I32(i32::MIN)
        );
        assert_eq!(vm.call("f", &[Value::F64(f64::NAN)]).unwrap(), Value::I32(0));
        assert_eq!(vm.call("f", &[Value::F64(-2.9)]).unwrap(), Value::I32(-2));
    }

    #[test]
    fn globals_persist_across_calls() {
        let mut b = ModuleBuilder::new();
        let g = b.global(ValueType::I32, true, Value::I32(0));
        let ty = b.ty(&[], Some(ValueType::I32));
        let mut a = Asm::new();
        a.ldglobal(0, g);
        a.ldi32(1, 1);
        a.op(Opcode::Add32, 0, 0, 1);
        a.stglobal(0, g);
        a.ret();
        let f = b.func(ty, 2, 0, a).unwrap();
        b.export_func(f, "increment");
        let mut vm = vm_for(&b);
        assert_eq!(vm.call("increment", &[]).unwrap(), Value::I32(1));
        assert_eq!(vm.call("increment", &[]).unwrap(), Value::I32(2));
        assert_eq!(vm.call("increment", &[]).unwrap(), Value::I32(3));
    }

    #[test]
    fn fuel_limit_is_exact() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        let top = a.new_label();
        a.place(top);
        a.ldi32(0, 1);
        a.jnz(0, top);
        a.ret();
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "loop");

        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(
            module,
            Config {
                fuel_limit: 100,
                ..Config::default()
            },
        );
        vm.init().unwrap();
        let err = vm.call("loop", &[]).unwrap_err();
        assert_eq!(err, VmError::FuelExhausted { limit: 100 });
        assert_eq!(vm.fuel_used(), 100);
        assert_eq!(vm.frame_count(), 0);

        // Refueling makes the VM runnable again (and exhaustible again).
        vm.refuel(10);
        assert_eq!(vm.call("loop", &[]).unwrap_err().code(), ErrorCode::Fuel);
        assert_eq!(vm.fuel_used(), 10);
    }

    #[test]
    fn arg_staging_resets_after_each_call() {
        let seen: Rc<RefCell<Vec<Vec<Value>>>> = Rc::default();
        let sink = Rc::clone(&seen);

        let mut b = ModuleBuilder::new();
        let ty_sink = b.ty(&[ValueType::I32, ValueType::I32], None);
        let sink_fn = b.import("test", "sink", ty_sink);
        let ty = b.ty(&[ValueType::I32], Some(ValueType::I32));
        let mut a = Asm::new();
        // First call stages both slots; second stages only slot 1, so the
        // host must observe slot 0 as Void.
        a.arg(0, 0);
        a.arg(1, 0);
        a.call_host(1, sink_fn);
        a.arg(1, 0);
        a.call_host(1, sink_fn);
        a.ret();
        let f = b.func(ty, 2, 0, a).unwrap();
        b.export_func(f, "f");

        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(module, Config::default());
        vm.register(
            "test",
            "sink",
            move |_mem: &mut LinearMemory, args: &[Value]| -> Result<Value, HostError> {
                sink.borrow_mut().push(args.to_vec());
                Ok(Value::Void)
            },
        )
        .unwrap();
        vm.init().unwrap();
        vm.call("f", &[Value::I32(9)]).unwrap();

        let calls = seen.borrow();
        assert_eq!(calls[0], vec![Value::I32(9), Value::I32(9)]);
        assert_eq!(calls[1], vec![Value::Void, Value::I32(9)]);
    }

    #[test]
    fn unknown_opcode_traps() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.raw_word(0xFF);
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "f");
        let mut vm = vm_for(&b);
        let err = vm.call("f", &[]).unwrap_err();
        assert_eq!(
            err,
            VmError::BadOpcode {
                opcode: 0xFF,
                func: 0,
                pc: 0
            }
        );
        assert_eq!(err.code(), ErrorCode::BadOpcode);
    }

    #[test]
    fn truncated_immediate_is_malformed() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        // An ldi32 word with no immediate following it.
        a.raw_word(u32::from(Opcode::Ldi32.byte()));
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "f");
        let mut vm = vm_for(&b);
        let err = vm.call("f", &[]).unwrap_err();
        assert_eq!(err, VmError::TruncatedCode { func: 0, pc: 1 });
        assert_eq!(err.code(), ErrorCode::BadModule);
    }

    #[test]
    fn stack_overflow_on_infinite_recursion() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], Some(ValueType::I32));
        let mut a = Asm::new();
        a.call(0, 0);
        a.ret();
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "f");

        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(
            module,
            Config {
                stack_size: 16,
                ..Config::default()
            },
        );
        vm.init().unwrap();
        let err = vm.call("f", &[]).unwrap_err();
        assert_eq!(err, VmError::StackOverflow { limit: 16 });
        assert_eq!(vm.frame_count(), 0);
    }

    #[test]
    fn mem_grow_semantics() {
        let mut b = ModuleBuilder::new();
        b.memory(1, 3);
        let ty = b.ty(&[ValueType::I32], Some(ValueType::I32));
        let mut a = Asm::new();
        a.op(Opcode::MemGrow, 0, 0, 0);
        a.ret();
        let f = b.func(ty, 2, 0, a).unwrap();
        b.export_func(f, "grow");
        let mut vm = vm_for(&b);
        assert_eq!(vm.call("grow", &[Value::I32(1)]).unwrap(), Value::I32(1));
        assert_eq!(vm.memory_size(), 2 * PAGE_SIZE);
        // Beyond max: -1, size unchanged.
        assert_eq!(vm.call("grow", &[Value::I32(5)]).unwrap(), Value::I32(-1));
        assert_eq!(vm.memory_size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn lifecycle_misuse_is_rejected() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.ret();
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "f");
        let module = Arc::new(Module::load(&b.finish()).unwrap());

        let mut vm = Vm::new(Arc::clone(&module), Config::default());
        assert_eq!(vm.call("f", &[]).unwrap_err(), VmError::NotInitialized);
        vm.init().unwrap();
        assert_eq!(vm.init().unwrap_err(), VmError::AlreadyInitialized);
        let late = vm.register(
            "env",
            "f",
            |_: &mut LinearMemory, _: &[Value]| -> Result<Value, HostError> {
                Ok(Value::Void)
            },
        );
        assert_eq!(late.unwrap_err(), VmError::AlreadyInitialized);

        // Arity mismatches are Type errors and recorded in last_error.
        let err = vm.call("f", &[Value::I32(1)]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Type);
        assert!(vm.last_error().contains("argument"));
    }

    #[test]
    fn host_error_propagates_verbatim() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let imp = b.import("env", "fail", ty);
        let mut a = Asm::new();
        a.call_host(0, imp);
        a.ret();
        let ty2 = b.ty(&[], None);
        let f = b.func(ty2, 1, 0, a).unwrap();
        b.export_func(f, "f");

        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(module, Config::default());
        vm.register(
            "env",
            "fail",
            |_: &mut LinearMemory, _: &[Value]| -> Result<Value, HostError> {
                Err(HostError::new("disk on fire"))
            },
        )
        .unwrap();
        vm.init().unwrap();
        let err = vm.call("f", &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::HostError);
        assert!(vm.last_error().contains("disk on fire"));
        assert_eq!(vm.frame_count(), 0);
    }

    #[test]
    fn init_runs_init_export() {
        let mut b = ModuleBuilder::new();
        let g = b.global(ValueType::I32, true, Value::I32(0));
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.ldi32(0, 7);
        a.stglobal(0, g);
        a.ret();
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "_init");

        let ty_get = b.ty(&[], Some(ValueType::I32));
        let mut a = Asm::new();
        a.ldglobal(0, g);
        a.ret();
        let get = b.func(ty_get, 1, 0, a).unwrap();
        b.export_func(get, "get");

        let mut vm = vm_for(&b);
        assert_eq!(vm.call("get", &[]).unwrap(), Value::I32(7));
    }

    #[test]
    fn failed_init_leaves_vm_uninitialized() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.op(Opcode::Trap, 0, 0, 0);
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "_init");

        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(module, Config::default());
        let err = vm.init().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Trap);
        assert_eq!(vm.call("_init", &[]).unwrap_err(), VmError::NotInitialized);
    }

    #[test]
    fn memory_limit_fails_init_with_oom() {
        let mut b = ModuleBuilder::new();
        b.memory(1, 32);
        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(
            module,
            Config {
                memory_limit: PAGE_SIZE,
                ..Config::default()
            },
        );
        let err = vm.init().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Oom);
        assert_eq!(vm.memory_size(), 0);
    }

    #[test]
    fn void_typed_exports_return_void() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.ldi32(0, 99);
        a.ret();
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "f");
        let mut vm = vm_for(&b);
        assert_eq!(vm.call("f", &[]).unwrap(), Value::Void);
    }

    #[test]
    fn tracing_emits_requested_events() {
        #[derive(Default)]
        struct Counting {
            instrs: usize,
            enters: usize,
            exits: usize,
            hosts: usize,
        }
        impl TraceSink for Counting {
            fn mask(&self) -> TraceMask {
                TraceMask::CALL | TraceMask::INSTR | TraceMask::HOST
            }
            fn event(&mut self, event: TraceEvent<'_>) {
                match event {
                    TraceEvent::Instr { .. } => self.instrs += 1,
                    TraceEvent::CallEnter { .. } => self.enters += 1,
                    TraceEvent::CallExit { .. } => self.exits += 1,
                    TraceEvent::HostCall { .. } => self.hosts += 1,
                }
            }
        }

        let mut b = ModuleBuilder::new();
        let ty_sink = b.ty(&[], None);
        let imp = b.import("t", "sink", ty_sink);
        let ty = b.ty(&[], Some(ValueType::I32));
        let mut a = Asm::new();
        a.call_host(1, imp);
        a.ldi32(0, 1);
        a.ret();
        let f = b.func(ty, 2, 0, a).unwrap();
        b.export_func(f, "f");

        let module = Arc::new(Module::load(&b.finish()).unwrap());
        let mut vm = Vm::new(module, Config::default());
        vm.register(
            "t",
            "sink",
            |_: &mut LinearMemory, _: &[Value]| -> Result<Value, HostError> {
                Ok(Value::Void)
            },
        )
        .unwrap();
        vm.init().unwrap();

        let mut sink = Counting::default();
        vm.call_traced("f", &[], &mut sink).unwrap();
        assert_eq!(sink.instrs, 3);
        assert_eq!(sink.enters, 1);
        assert_eq!(sink.exits, 1);
        assert_eq!(sink.hosts, 1);
    }
}
