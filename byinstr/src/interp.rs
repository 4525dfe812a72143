//! Reference interpreter.
//!
//! Executes a [`Module`] over a flat, region-based memory so that tests can
//! compare the observable behavior of a module before and after a
//! transformation. Pointers are `region << 32 | offset`; region `0` is the
//! null region. Globals are laid out packed (no padding), mirroring
//! [`TypeRegistry::byte_size`].
//!
//! Calls to functions the module does not define are forwarded to an
//! [`ExternalHandler`], except for the memory intrinsics (`llvm.memset.*`,
//! `llvm.memcpy.*`, `llvm.memmove.*`) and the debug/lifetime/assume
//! intrinsics, which are executed in place.
use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;

use crate::{
    consts::AnyConst,
    modules::{
        Function, Instruction, Module,
        fp::FCmpOp,
        instructions::Instr,
        int::{ICmpOp, IShiftOp, IntegerSignedness},
        misc::{Call, CastOp},
        operand::{Label, Name, Operand},
        terminator::Terminator,
    },
    types::{
        AnyType, TypeRegistry, Typeref,
        primary::{FType, PrimaryType, VectorSize},
    },
};

const REGION_SHIFT: u32 = 32;
const OFFSET_MASK: u64 = (1 << REGION_SHIFT) - 1;
const FUNCTION_BASE: u64 = 0xFFFF_0000_0000_0000;
const DEFAULT_FUEL: u64 = 1_000_000;

fn mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

fn sext(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

/// A runtime value held in a register.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int { bits: u32, value: u64 },
    Float(f64),
    Ptr(u64),
    Vector(Vec<Value>),
}

impl Value {
    pub fn int(bits: u32, value: u64) -> Self {
        Value::Int {
            bits,
            value: value & mask(bits),
        }
    }

    pub fn i1(value: bool) -> Self {
        Self::int(1, value as u64)
    }

    pub fn i32(value: u32) -> Self {
        Self::int(32, value as u64)
    }

    pub fn i64(value: u64) -> Self {
        Self::int(64, value)
    }

    /// Integer payload or pointer address.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int { value, .. } => Some(*value),
            Value::Ptr(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpError {
    #[error("The interpreter ran out of fuel after {0} steps.")]
    OutOfFuel(u64),

    #[error("Function `{function}` reads `{name}` before it is defined.")]
    UndefinedValue { function: String, name: Name },

    #[error("Call to `{0}`, which is neither defined in the module nor handled externally.")]
    UnknownFunction(String),

    #[error("Access of {len} bytes at address 0x{addr:016x} is out of bounds.")]
    InvalidAddress { addr: u64, len: u64 },

    #[error("Division by zero in function `{0}`.")]
    DivisionByZero(String),

    #[error("Function `{function}` reached an unreachable terminator in `{block}`.")]
    Unreachable { function: String, block: Label },

    #[error("Block `{block}` of function `{function}` has a phi without an incoming value for its predecessor.")]
    MissingIncoming { function: String, block: Label },

    #[error("Function `{function}` expects {expected} arguments, got {found}.")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("An exception escaped function `{0}`.")]
    Unwound(String),

    #[error("Unsupported operation: {0}.")]
    Unsupported(String),
}

/// Outcome of a call handled outside of the module.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalOutcome {
    Return(Option<Value>),
    /// The callee raised an exception.
    Unwind,
}

/// Implementation of the functions a module declares but does not define.
pub trait ExternalHandler {
    fn call(
        &mut self,
        name: &str,
        args: &[Value],
        memory: &mut Memory,
    ) -> Result<ExternalOutcome, InterpError>;
}

impl<F> ExternalHandler for F
where
    F: FnMut(&str, &[Value], &mut Memory) -> Result<ExternalOutcome, InterpError>,
{
    fn call(
        &mut self,
        name: &str,
        args: &[Value],
        memory: &mut Memory,
    ) -> Result<ExternalOutcome, InterpError> {
        self(name, args, memory)
    }
}

/// Region-based byte memory.
#[derive(Debug, Default)]
pub struct Memory {
    regions: Vec<Vec<u8>>,
}

impl Memory {
    /// Allocate `size` zeroed bytes and return their address.
    pub fn allocate(&mut self, size: u64) -> u64 {
        self.regions.push(vec![0; size as usize]);
        (self.regions.len() as u64) << REGION_SHIFT
    }

    fn locate(&self, addr: u64, len: u64) -> Result<(usize, usize), InterpError> {
        let region = (addr >> REGION_SHIFT) as usize;
        let offset = (addr & OFFSET_MASK) as usize;
        let invalid = InterpError::InvalidAddress { addr, len };
        if region == 0 || region > self.regions.len() {
            return Err(invalid);
        }
        if offset as u64 + len > self.regions[region - 1].len() as u64 {
            return Err(invalid);
        }
        Ok((region - 1, offset))
    }

    pub fn read(&self, addr: u64, len: u64) -> Result<&[u8], InterpError> {
        let (region, offset) = self.locate(addr, len)?;
        Ok(&self.regions[region][offset..offset + len as usize])
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), InterpError> {
        let (region, offset) = self.locate(addr, bytes.len() as u64)?;
        self.regions[region][offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&mut self, addr: u64, byte: u8, len: u64) -> Result<(), InterpError> {
        let (region, offset) = self.locate(addr, len)?;
        self.regions[region][offset..offset + len as usize].fill(byte);
        Ok(())
    }

    pub fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<(), InterpError> {
        let bytes = self.read(src, len)?.to_vec();
        self.write(dst, &bytes)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, InterpError> {
        let bytes = self.read(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), InterpError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// NUL-terminated string starting at `addr`.
    pub fn read_cstr(&self, addr: u64) -> Result<String, InterpError> {
        let (region, offset) = self.locate(addr, 0)?;
        let bytes = &self.regions[region][offset..];
        let end = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or(InterpError::InvalidAddress {
                addr,
                len: bytes.len() as u64 + 1,
            })?;
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

enum Flow {
    Return(Option<Value>),
    Unwind,
}

type Frame = BTreeMap<Name, Value>;

pub struct Interpreter<'m, H> {
    module: &'m Module,
    registry: &'m TypeRegistry,
    memory: Memory,
    globals: BTreeMap<String, u64>,
    functions: Vec<String>,
    handler: H,
    fuel: u64,
    steps: u64,
}

impl<'m, H: ExternalHandler> Interpreter<'m, H> {
    /// Lay out and initialize every global of `module`.
    pub fn new(
        module: &'m Module,
        registry: &'m TypeRegistry,
        handler: H,
    ) -> Result<Self, InterpError> {
        let mut interp = Self {
            module,
            registry,
            memory: Memory::default(),
            globals: BTreeMap::new(),
            functions: module
                .functions
                .iter()
                .map(|func| func.name.clone())
                .chain(module.external_functions.iter().map(|decl| decl.name.clone()))
                .collect(),
            handler,
            fuel: DEFAULT_FUEL,
            steps: 0,
        };

        for global in &module.globals {
            let size = interp.size_of(global.ty)?;
            let addr = interp.memory.allocate(size);
            interp.globals.insert(global.name.clone(), addr);
        }
        for global in &module.globals {
            if let Some(init) = &global.init {
                let addr = interp.globals[&global.name];
                interp.write_const(addr, init)?;
            }
        }

        Ok(interp)
    }

    /// Limit the number of executed instructions and terminators.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn global_address(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }

    /// 64-bit word `index` of the global `name`.
    pub fn read_global_u64(&self, name: &str, index: u64) -> Result<u64, InterpError> {
        let addr = self
            .global_address(name)
            .ok_or_else(|| InterpError::Unsupported(format!("unknown global `{}`", name)))?;
        self.memory.read_u64(addr + 8 * index)
    }

    /// Number of instructions and terminators executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Run every static constructor of the module, in order.
    pub fn run_constructors(&mut self) -> Result<(), InterpError> {
        let module = self.module;
        for ctor in &module.constructors {
            self.call(ctor, &[])?;
        }
        Ok(())
    }

    /// Call `name` with `args`. An exception escaping the call is an error.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, InterpError> {
        match self.call_by_name(name, args.to_vec())? {
            Flow::Return(value) => Ok(value),
            Flow::Unwind => Err(InterpError::Unwound(name.to_string())),
        }
    }

    fn size_of(&self, ty: Typeref) -> Result<u64, InterpError> {
        self.registry
            .byte_size(ty)
            .ok_or_else(|| InterpError::Unsupported(format!("size of unknown type {:?}", ty)))
    }

    fn function_address(&mut self, name: &str) -> u64 {
        let index = match self.functions.iter().position(|f| f == name) {
            Some(index) => index,
            None => {
                self.functions.push(name.to_string());
                self.functions.len() - 1
            }
        };
        FUNCTION_BASE | index as u64
    }

    fn write_const(&mut self, addr: u64, constant: &AnyConst) -> Result<u64, InterpError> {
        let registry = self.registry;
        let size = self.size_of(constant.type_of(registry))?;
        match constant {
            AnyConst::Int(i) => {
                let bytes = i.value.to_le_bytes();
                let len = (size as usize).min(8);
                self.memory.write(addr, &bytes[..len])?;
            }
            AnyConst::Float(f) => match f.ty {
                FType::Fp32 => self.memory.write(addr, &(f.value() as f32).to_le_bytes())?,
                FType::Fp64 => self.memory.write(addr, &f.value().to_le_bytes())?,
                other => return Err(InterpError::Unsupported(format!("{} constants", other))),
            },
            AnyConst::Null | AnyConst::Zero(_) => {}
            AnyConst::Str(s) => self.memory.write(addr, s.as_bytes())?,
            AnyConst::Array { elems, .. } => {
                let mut offset = 0;
                for elem in elems {
                    offset += self.write_const(addr + offset, elem)?;
                }
            }
            AnyConst::Struct { fields, .. } => {
                let mut offset = 0;
                for field in fields {
                    offset += self.write_const(addr + offset, field)?;
                }
            }
            AnyConst::GlobalAddr(name) => {
                let target = self.symbol_address(name);
                self.memory.write_u64(addr, target)?;
            }
        }
        Ok(size)
    }

    fn symbol_address(&mut self, name: &str) -> u64 {
        match self.globals.get(name) {
            Some(addr) => *addr,
            None => self.function_address(name),
        }
    }

    fn const_value(&mut self, constant: &AnyConst) -> Result<Value, InterpError> {
        Ok(match constant {
            AnyConst::Int(i) => Value::int(i.ty.num_bits(), i.value),
            AnyConst::Float(f) => Value::Float(f.value()),
            AnyConst::Null => Value::Ptr(0),
            AnyConst::Zero(ty) => self.zero_value(*ty)?,
            AnyConst::GlobalAddr(name) => Value::Ptr(self.symbol_address(name)),
            other => {
                return Err(InterpError::Unsupported(format!(
                    "aggregate constant `{}` as operand",
                    other
                )));
            }
        })
    }

    fn zero_value(&self, ty: Typeref) -> Result<Value, InterpError> {
        Ok(match self.registry.lookup(ty) {
            Some(AnyType::Primary(PrimaryType::Int(itype))) => Value::int(itype.num_bits(), 0),
            Some(AnyType::Primary(PrimaryType::Float(_))) => Value::Float(0.0),
            Some(AnyType::Primary(PrimaryType::Ptr(_))) => Value::Ptr(0),
            Some(AnyType::Primary(PrimaryType::Vc(vc))) => {
                let elem = self.registry.search_or_insert(PrimaryType::from(vc.ty).into());
                let lane = self.zero_value(elem)?;
                Value::Vector(vec![lane; fixed_lanes(vc.size)?])
            }
            _ => return Err(InterpError::Unsupported("zero value of an aggregate".to_string())),
        })
    }

    fn operand(&mut self, function: &Function, frame: &Frame, operand: &Operand) -> Result<Value, InterpError> {
        match operand {
            Operand::Reg(name) => frame.get(name).cloned().ok_or_else(|| InterpError::UndefinedValue {
                function: function.name.clone(),
                name: *name,
            }),
            Operand::Imm(constant) => self.const_value(constant),
            Operand::Global(name) => Ok(Value::Ptr(self.symbol_address(name))),
            Operand::Function(name) => Ok(Value::Ptr(self.function_address(name))),
        }
    }

    fn address(&mut self, function: &Function, frame: &Frame, operand: &Operand) -> Result<u64, InterpError> {
        self.operand(function, frame, operand)?
            .as_u64()
            .ok_or_else(|| InterpError::Unsupported("non-scalar address".to_string()))
    }

    fn load(&self, ty: Typeref, addr: u64) -> Result<Value, InterpError> {
        Ok(match self.registry.lookup(ty) {
            Some(AnyType::Primary(PrimaryType::Int(itype))) => {
                let len = itype.byte_size().min(8) as u64;
                let mut buf = [0u8; 8];
                buf[..len as usize].copy_from_slice(self.memory.read(addr, len)?);
                Value::int(itype.num_bits(), u64::from_le_bytes(buf))
            }
            Some(AnyType::Primary(PrimaryType::Float(FType::Fp32))) => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(self.memory.read(addr, 4)?);
                Value::Float(f32::from_le_bytes(buf) as f64)
            }
            Some(AnyType::Primary(PrimaryType::Float(FType::Fp64))) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(self.memory.read(addr, 8)?);
                Value::Float(f64::from_le_bytes(buf))
            }
            Some(AnyType::Primary(PrimaryType::Ptr(_))) => Value::Ptr(self.memory.read_u64(addr)?),
            Some(AnyType::Primary(PrimaryType::Vc(vc))) => {
                let elem = self.registry.search_or_insert(PrimaryType::from(vc.ty).into());
                let stride = vc.ty.byte_size() as u64;
                let lanes = (0..fixed_lanes(vc.size)? as u64)
                    .map(|i| self.load(elem, addr + i * stride))
                    .collect::<Result<_, _>>()?;
                Value::Vector(lanes)
            }
            _ => {
                return Err(InterpError::Unsupported(format!(
                    "load of type {}",
                    self.registry.fmt(ty)
                )));
            }
        })
    }

    fn store(&mut self, ty: Typeref, addr: u64, value: &Value) -> Result<(), InterpError> {
        match (self.registry.lookup(ty), value) {
            (Some(AnyType::Primary(PrimaryType::Int(itype))), Value::Int { value, .. }) => {
                let len = itype.byte_size().min(8) as usize;
                self.memory.write(addr, &value.to_le_bytes()[..len])
            }
            (Some(AnyType::Primary(PrimaryType::Float(FType::Fp32))), Value::Float(v)) => {
                self.memory.write(addr, &(*v as f32).to_le_bytes())
            }
            (Some(AnyType::Primary(PrimaryType::Float(FType::Fp64))), Value::Float(v)) => {
                self.memory.write(addr, &v.to_le_bytes())
            }
            (Some(AnyType::Primary(PrimaryType::Ptr(_))), value) => {
                let raw = value
                    .as_u64()
                    .ok_or_else(|| InterpError::Unsupported("store of a non-pointer as ptr".to_string()))?;
                self.memory.write_u64(addr, raw)
            }
            (Some(AnyType::Primary(PrimaryType::Vc(vc))), Value::Vector(lanes)) => {
                let elem = self.registry.search_or_insert(PrimaryType::from(vc.ty).into());
                let stride = vc.ty.byte_size() as u64;
                for (i, lane) in lanes.iter().enumerate() {
                    self.store(elem, addr + i as u64 * stride, lane)?;
                }
                Ok(())
            }
            _ => Err(InterpError::Unsupported(format!(
                "store of {:?} as {}",
                value,
                self.registry.fmt(ty)
            ))),
        }
    }

    /// Byte offset selected by the indices of a getelementptr.
    fn gep_offset(&self, ty: Typeref, indices: &[Value]) -> Result<i64, InterpError> {
        let index_of = |value: &Value| match value {
            Value::Int { bits, value } => Ok(sext(*value, *bits)),
            _ => Err(InterpError::Unsupported("non-integer gep index".to_string())),
        };

        let Some((first, rest)) = indices.split_first() else {
            return Ok(0);
        };
        let mut offset = index_of(first)?.wrapping_mul(self.size_of(ty)? as i64);
        let mut current = ty;
        for index in rest {
            let index = index_of(index)?;
            match self.registry.lookup(current) {
                Some(AnyType::Struct(_)) => {
                    let field = self
                        .registry
                        .field_offset(current, index as usize)
                        .ok_or_else(|| InterpError::Unsupported("gep past the last field".to_string()))?;
                    offset += field as i64;
                    current = match self.registry.lookup(current) {
                        Some(AnyType::Struct(st)) => st.element_types[index as usize],
                        _ => current,
                    };
                }
                Some(AnyType::Array(_)) | Some(AnyType::Primary(PrimaryType::Vc(_))) => {
                    let elem = self
                        .registry
                        .element_type(current)
                        .ok_or_else(|| InterpError::Unsupported("gep into a scalar".to_string()))?;
                    offset += index.wrapping_mul(self.size_of(elem)? as i64);
                    current = elem;
                }
                _ => return Err(InterpError::Unsupported("gep into a scalar".to_string())),
            }
        }
        Ok(offset)
    }

    fn tick(&mut self) -> Result<(), InterpError> {
        self.steps += 1;
        if self.steps > self.fuel {
            return Err(InterpError::OutOfFuel(self.fuel));
        }
        Ok(())
    }

    fn call_by_name(&mut self, name: &str, args: Vec<Value>) -> Result<Flow, InterpError> {
        let module = self.module;
        if let Some(function) = module.function(name) {
            return self.run(function, args);
        }

        let arg_u64 = |i: usize| args.get(i).and_then(Value::as_u64).unwrap_or(0);
        if name.starts_with("llvm.memset") {
            self.memory.fill(arg_u64(0), arg_u64(1) as u8, arg_u64(2))?;
            return Ok(Flow::Return(None));
        }
        if name.starts_with("llvm.memcpy") || name.starts_with("llvm.memmove") {
            self.memory.copy(arg_u64(0), arg_u64(1), arg_u64(2))?;
            return Ok(Flow::Return(None));
        }
        if name.starts_with("llvm.dbg.") || name.starts_with("llvm.lifetime.") || name == "llvm.assume" {
            return Ok(Flow::Return(None));
        }

        trace!("external call {}({:?})", name, args);
        Ok(match self.handler.call(name, &args, &mut self.memory)? {
            ExternalOutcome::Return(value) => Flow::Return(value),
            ExternalOutcome::Unwind => Flow::Unwind,
        })
    }

    fn perform_call(&mut self, function: &Function, frame: &Frame, call: &Call) -> Result<Flow, InterpError> {
        let args = call
            .args
            .iter()
            .map(|arg| self.operand(function, frame, arg))
            .collect::<Result<Vec<_>, _>>()?;
        let callee = match call.callee() {
            Some(name) => name.to_string(),
            None => {
                let addr = self.address(function, frame, &call.function)?;
                let index = (addr & !FUNCTION_BASE) as usize;
                if addr & FUNCTION_BASE != FUNCTION_BASE || index >= self.functions.len() {
                    return Err(InterpError::Unsupported(format!(
                        "indirect call through 0x{:016x}",
                        addr
                    )));
                }
                self.functions[index].clone()
            }
        };
        self.call_by_name(&callee, args)
    }

    fn run(&mut self, function: &Function, args: Vec<Value>) -> Result<Flow, InterpError> {
        if args.len() != function.params.len() {
            return Err(InterpError::ArityMismatch {
                function: function.name.clone(),
                expected: function.params.len(),
                found: args.len(),
            });
        }
        if function.body.is_empty() {
            return Err(InterpError::UnknownFunction(function.name.clone()));
        }

        let mut frame: Frame = function
            .params
            .iter()
            .map(|(name, _)| *name)
            .zip(args)
            .collect();
        let mut previous: Option<Label> = None;
        let mut current = Label::NIL;

        loop {
            let block = function.body.get(&current).ok_or_else(|| {
                InterpError::Unsupported(format!("jump to missing block {}", current))
            })?;

            // Phis read their inputs simultaneously.
            let mut incoming = Vec::new();
            for phi in block.phis() {
                let value = previous
                    .and_then(|pred| phi.incoming(pred))
                    .ok_or_else(|| InterpError::MissingIncoming {
                        function: function.name.clone(),
                        block: current,
                    })?;
                incoming.push((phi.dest, self.operand(function, &frame, value)?));
            }
            let num_phis = incoming.len();
            frame.extend(incoming);

            for instr in block.instructions.iter().skip(num_phis) {
                self.tick()?;
                if let Flow::Unwind = self.execute(function, &mut frame, instr)? {
                    return Ok(Flow::Unwind);
                }
            }

            self.tick()?;
            let next = match &block.terminator {
                Terminator::Jump(jump) => jump.target,
                Terminator::CBranch(cbranch) => {
                    let cond = self.operand(function, &frame, &cbranch.cond)?;
                    if cond.as_u64().unwrap_or(0) & 1 == 1 {
                        cbranch.target_true
                    } else {
                        cbranch.target_false
                    }
                }
                Terminator::Switch(switch) => {
                    let value = self.operand(function, &frame, &switch.value)?.as_u64().unwrap_or(0);
                    switch
                        .cases
                        .iter()
                        .find(|(case, _)| *case == value)
                        .map_or(switch.default, |(_, label)| *label)
                }
                Terminator::Ret(ret) => {
                    let value = match &ret.value {
                        Some(value) => Some(self.operand(function, &frame, value)?),
                        None => None,
                    };
                    return Ok(Flow::Return(value));
                }
                Terminator::Trap(_) => {
                    return Err(InterpError::Unreachable {
                        function: function.name.clone(),
                        block: current,
                    });
                }
                Terminator::Invoke(invoke) => match self.perform_call(function, &frame, &invoke.call)? {
                    Flow::Return(value) => {
                        if let (Some(dest), Some(value)) = (invoke.call.dest, value) {
                            frame.insert(dest, value);
                        }
                        invoke.normal
                    }
                    Flow::Unwind => invoke.unwind,
                },
            };
            previous = Some(current);
            current = next;
        }
    }

    fn execute(&mut self, function: &Function, frame: &mut Frame, instr: &Instr) -> Result<Flow, InterpError> {
        let value = match instr {
            Instr::IAdd(i) => self.int_binary(function, frame, &i.lhs, &i.rhs, |a, b, _| Ok(a.wrapping_add(b)))?,
            Instr::ISub(i) => self.int_binary(function, frame, &i.lhs, &i.rhs, |a, b, _| Ok(a.wrapping_sub(b)))?,
            Instr::IMul(i) => self.int_binary(function, frame, &i.lhs, &i.rhs, |a, b, _| Ok(a.wrapping_mul(b)))?,
            Instr::IDiv(i) => {
                let signedness = i.signedness;
                let name = function.name.clone();
                self.int_binary(function, frame, &i.lhs, &i.rhs, move |a, b, bits| {
                    if b & mask(bits) == 0 {
                        return Err(InterpError::DivisionByZero(name.clone()));
                    }
                    Ok(match signedness {
                        IntegerSignedness::Signed => sext(a, bits).wrapping_div(sext(b, bits)) as u64,
                        IntegerSignedness::Unsigned => a / b,
                    })
                })?
            }
            Instr::IRem(i) => {
                let signedness = i.signedness;
                let name = function.name.clone();
                self.int_binary(function, frame, &i.lhs, &i.rhs, move |a, b, bits| {
                    if b & mask(bits) == 0 {
                        return Err(InterpError::DivisionByZero(name.clone()));
                    }
                    Ok(match signedness {
                        IntegerSignedness::Signed => sext(a, bits).wrapping_rem(sext(b, bits)) as u64,
                        IntegerSignedness::Unsigned => a % b,
                    })
                })?
            }
            Instr::ISht(i) => {
                let op = i.op;
                self.int_binary(function, frame, &i.lhs, &i.rhs, move |a, b, bits| {
                    let amount = b as u32;
                    if amount >= bits {
                        return Ok(0);
                    }
                    Ok(match op {
                        IShiftOp::Shl => a << amount,
                        IShiftOp::LShr => a >> amount,
                        IShiftOp::AShr => (sext(a, bits) >> amount) as u64,
                    })
                })?
            }
            Instr::IAnd(i) => self.int_binary(function, frame, &i.lhs, &i.rhs, |a, b, _| Ok(a & b))?,
            Instr::IOr(i) => self.int_binary(function, frame, &i.lhs, &i.rhs, |a, b, _| Ok(a | b))?,
            Instr::IXor(i) => self.int_binary(function, frame, &i.lhs, &i.rhs, |a, b, _| Ok(a ^ b))?,
            Instr::INeg(i) => {
                let zero = self.zero_value(i.ty)?;
                let value = self.operand(function, frame, &i.value)?;
                lanewise(&zero, &value, &mut |a, b| int_op(a, b, &mut |a, b, _| Ok(a.wrapping_sub(b))))?
            }
            Instr::INot(i) => {
                let value = self.operand(function, frame, &i.value)?;
                lanewise(&value, &value, &mut |a, b| int_op(a, b, &mut |a, _, _| Ok(!a)))?
            }
            Instr::ICmp(i) => {
                let op = i.op;
                let lhs = self.operand(function, frame, &i.lhs)?;
                let rhs = self.operand(function, frame, &i.rhs)?;
                lanewise(&lhs, &rhs, &mut |a, b| {
                    let (bits, a) = scalar_bits(a)?;
                    let (_, b) = scalar_bits(b)?;
                    let (sa, sb) = (sext(a, bits), sext(b, bits));
                    Ok(Value::i1(match op {
                        ICmpOp::Eq => a == b,
                        ICmpOp::Ne => a != b,
                        ICmpOp::Ugt => a > b,
                        ICmpOp::Uge => a >= b,
                        ICmpOp::Ult => a < b,
                        ICmpOp::Ule => a <= b,
                        ICmpOp::Sgt => sa > sb,
                        ICmpOp::Sge => sa >= sb,
                        ICmpOp::Slt => sa < sb,
                        ICmpOp::Sle => sa <= sb,
                    }))
                })?
            }
            Instr::FAdd(i) => self.fp_binary(function, frame, i.ty, &i.lhs, &i.rhs, |a, b| a + b)?,
            Instr::FSub(i) => self.fp_binary(function, frame, i.ty, &i.lhs, &i.rhs, |a, b| a - b)?,
            Instr::FMul(i) => self.fp_binary(function, frame, i.ty, &i.lhs, &i.rhs, |a, b| a * b)?,
            Instr::FDiv(i) => self.fp_binary(function, frame, i.ty, &i.lhs, &i.rhs, |a, b| a / b)?,
            Instr::FRem(i) => self.fp_binary(function, frame, i.ty, &i.lhs, &i.rhs, |a, b| a % b)?,
            Instr::FNeg(i) => {
                let value = self.operand(function, frame, &i.value)?;
                lanewise(&value, &value, &mut |a, _| fp_op(a, a, &mut |a, _| -a))?
            }
            Instr::FCmp(i) => {
                let op: FCmpOp = i.op;
                let lhs = self.operand(function, frame, &i.lhs)?;
                let rhs = self.operand(function, frame, &i.rhs)?;
                lanewise(&lhs, &rhs, &mut |a, b| match (a, b) {
                    (Value::Float(a), Value::Float(b)) => Ok(Value::i1(op.evaluate(*a, *b))),
                    _ => Err(InterpError::Unsupported("fcmp of non-floats".to_string())),
                })?
            }
            Instr::MLoad(load) => {
                let addr = self.address(function, frame, &load.addr)?;
                self.load(load.ty, addr)?
            }
            Instr::MStore(store) => {
                let addr = self.address(function, frame, &store.addr)?;
                let value = self.operand(function, frame, &store.value)?;
                self.store(store.ty, addr, &value)?;
                return Ok(Flow::Return(None));
            }
            Instr::MAlloca(alloca) => {
                let count = self.operand(function, frame, &alloca.count)?.as_u64().unwrap_or(1);
                let size = self.size_of(alloca.ty)? * count;
                Value::Ptr(self.memory.allocate(size))
            }
            Instr::MGetElementPtr(gep) => {
                let base = self.address(function, frame, &gep.base)?;
                let indices = gep
                    .indices
                    .iter()
                    .map(|index| self.operand(function, frame, index))
                    .collect::<Result<Vec<_>, _>>()?;
                let offset = self.gep_offset(gep.ty, &indices)?;
                Value::Ptr(base.wrapping_add_signed(offset))
            }
            Instr::Call(call) => {
                return match self.perform_call(function, frame, call)? {
                    Flow::Return(value) => {
                        if let (Some(dest), Some(value)) = (call.dest, value.clone()) {
                            frame.insert(dest, value);
                        }
                        Ok(Flow::Return(value))
                    }
                    Flow::Unwind => Ok(Flow::Unwind),
                };
            }
            Instr::Cast(cast) => {
                let value = self.operand(function, frame, &cast.value)?;
                self.cast(cast.op, cast.to_ty, value)?
            }
            Instr::Select(select) => {
                let cond = self.operand(function, frame, &select.cond)?;
                if cond.as_u64().unwrap_or(0) & 1 == 1 {
                    self.operand(function, frame, &select.on_true)?
                } else {
                    self.operand(function, frame, &select.on_false)?
                }
            }
            Instr::Phi(_) => {
                return Err(InterpError::Unsupported("phi after a non-phi instruction".to_string()));
            }
        };

        if let Some(dest) = instr.destination() {
            frame.insert(dest, value);
        }
        Ok(Flow::Return(None))
    }

    fn int_binary(
        &mut self,
        function: &Function,
        frame: &Frame,
        lhs: &Operand,
        rhs: &Operand,
        mut op: impl FnMut(u64, u64, u32) -> Result<u64, InterpError>,
    ) -> Result<Value, InterpError> {
        let lhs = self.operand(function, frame, lhs)?;
        let rhs = self.operand(function, frame, rhs)?;
        lanewise(&lhs, &rhs, &mut |a, b| int_op(a, b, &mut op))
    }

    fn fp_binary(
        &mut self,
        function: &Function,
        frame: &Frame,
        ty: Typeref,
        lhs: &Operand,
        rhs: &Operand,
        op: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, InterpError> {
        let single = self.is_single_precision(ty);
        let lhs = self.operand(function, frame, lhs)?;
        let rhs = self.operand(function, frame, rhs)?;
        lanewise(&lhs, &rhs, &mut |a, b| {
            fp_op(a, b, &mut |a, b| {
                let result = op(a, b);
                if single { result as f32 as f64 } else { result }
            })
        })
    }

    fn is_single_precision(&self, ty: Typeref) -> bool {
        match self.registry.lookup(ty) {
            Some(AnyType::Primary(PrimaryType::Float(FType::Fp32))) => true,
            Some(AnyType::Primary(PrimaryType::Vc(vc))) => {
                vc.ty == FType::Fp32.into()
            }
            _ => false,
        }
    }

    fn cast(&self, op: CastOp, to_ty: Typeref, value: Value) -> Result<Value, InterpError> {
        let target = self.registry.lookup(to_ty);
        let to_bits = match &target {
            Some(AnyType::Primary(PrimaryType::Int(itype))) => itype.num_bits(),
            _ => 64,
        };
        let unsupported = || InterpError::Unsupported(format!("{} of {:?}", op.to_str(), value));
        Ok(match (op, &value) {
            (CastOp::Trunc | CastOp::ZExt, Value::Int { value, .. }) => Value::int(to_bits, *value),
            (CastOp::SExt, Value::Int { bits, value }) => Value::int(to_bits, sext(*value, *bits) as u64),
            (CastOp::FpTrunc, Value::Float(v)) if self.is_single_precision(to_ty) => {
                Value::Float(*v as f32 as f64)
            }
            (CastOp::FpTrunc | CastOp::FpExt, Value::Float(v)) => Value::Float(*v),
            (CastOp::FpToUi, Value::Float(v)) => Value::int(to_bits, *v as u64),
            (CastOp::FpToSi, Value::Float(v)) => Value::int(to_bits, *v as i64 as u64),
            (CastOp::UiToFp, Value::Int { value, .. }) => Value::Float(*value as f64),
            (CastOp::SiToFp, Value::Int { bits, value }) => Value::Float(sext(*value, *bits) as f64),
            (CastOp::PtrToInt, Value::Ptr(addr)) => Value::int(to_bits, *addr),
            (CastOp::IntToPtr, Value::Int { value, .. }) => Value::Ptr(*value),
            (CastOp::Bitcast, _) => match (&target, &value) {
                (Some(AnyType::Primary(PrimaryType::Float(FType::Fp64))), Value::Int { value, .. }) => {
                    Value::Float(f64::from_bits(*value))
                }
                (Some(AnyType::Primary(PrimaryType::Int(_))), Value::Float(v)) => {
                    Value::int(to_bits, v.to_bits())
                }
                _ => value.clone(),
            },
            _ => return Err(unsupported()),
        })
    }
}

fn fixed_lanes(size: VectorSize) -> Result<usize, InterpError> {
    match size {
        VectorSize::Fixed(n) => Ok(n as usize),
        VectorSize::Scalable(_) => Err(InterpError::Unsupported("scalable vectors".to_string())),
    }
}

fn scalar_bits(value: &Value) -> Result<(u32, u64), InterpError> {
    match value {
        Value::Int { bits, value } => Ok((*bits, *value)),
        Value::Ptr(addr) => Ok((64, *addr)),
        _ => Err(InterpError::Unsupported(format!("integer operation on {:?}", value))),
    }
}

fn int_op(
    a: &Value,
    b: &Value,
    op: &mut impl FnMut(u64, u64, u32) -> Result<u64, InterpError>,
) -> Result<Value, InterpError> {
    let (bits, a) = scalar_bits(a)?;
    let (_, b) = scalar_bits(b)?;
    Ok(Value::int(bits, op(a, b, bits)?))
}

fn fp_op(a: &Value, b: &Value, op: &mut impl FnMut(f64, f64) -> f64) -> Result<Value, InterpError> {
    match (a, b) {
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(op(*a, *b))),
        _ => Err(InterpError::Unsupported("floating-point operation on non-floats".to_string())),
    }
}

fn lanewise(
    a: &Value,
    b: &Value,
    op: &mut impl FnMut(&Value, &Value) -> Result<Value, InterpError>,
) -> Result<Value, InterpError> {
    match (a, b) {
        (Value::Vector(a), Value::Vector(b)) => Ok(Value::Vector(
            a.iter().zip(b).map(|(a, b)| op(a, b)).collect::<Result<_, _>>()?,
        )),
        _ => op(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::FunctionBuilder,
        consts::AnyConst,
        modules::{Linkage, int::ICmpOp, symbol::GlobalVariable},
    };

    fn no_externals(name: &str, _: &[Value], _: &mut Memory) -> Result<ExternalOutcome, InterpError> {
        Err(InterpError::UnknownFunction(name.to_string()))
    }

    #[test]
    fn loop_sums_a_global_array() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let arr_ty = reg.array(i64_ty, 4);

        let mut module = Module::new("sum");
        module.declare_global(GlobalVariable::new(
            "data",
            arr_ty,
            AnyConst::Array {
                elem: i64_ty,
                elems: (1..=4).map(AnyConst::i64).collect(),
            },
            Linkage::Internal,
        ));

        let mut b = FunctionBuilder::new(&reg, "sum", &[], Some(i64_ty));
        let body = b.new_block();
        let exit = b.new_block();
        b.jump(body);

        b.switch_to(body);
        let (i, acc) = (b.fresh(), b.fresh());
        let (i_next, acc_next) = (b.fresh(), b.fresh());
        b.phi_into(i, i64_ty, vec![(Label::NIL, AnyConst::i64(0).into()), (body, i_next.into())]);
        b.phi_into(acc, i64_ty, vec![(Label::NIL, AnyConst::i64(0).into()), (body, acc_next.into())]);
        let slot = b.gep(
            arr_ty,
            Operand::Global("data".to_string()),
            vec![AnyConst::i64(0).into(), i.into()],
        );
        let elem = b.load(i64_ty, slot);
        b.push(crate::modules::int::IAdd {
            dest: acc_next,
            ty: i64_ty,
            lhs: acc.into(),
            rhs: elem,
        });
        b.push(crate::modules::int::IAdd {
            dest: i_next,
            ty: i64_ty,
            lhs: i.into(),
            rhs: AnyConst::i64(1).into(),
        });
        let done = b.icmp(ICmpOp::Eq, i64_ty, i_next.into(), AnyConst::i64(4).into());
        b.branch(done, exit, body);
        b.switch_to(exit);
        b.ret(Some(acc_next.into()));
        module.functions.push(b.finish());
        module.check().unwrap();

        let mut interp = Interpreter::new(&module, &reg, no_externals).unwrap();
        assert_eq!(interp.call("sum", &[]).unwrap(), Some(Value::i64(10)));
        assert_eq!(interp.read_global_u64("data", 3).unwrap(), 4);
    }

    #[test]
    fn unwinding_external_call_takes_the_unwind_edge() {
        let reg = TypeRegistry::new();
        let i32_ty = reg.int(32);
        let mut b = FunctionBuilder::new(&reg, "guarded", &[], Some(i32_ty));
        let normal = b.new_block();
        let unwind = b.new_block();
        b.invoke("may_throw", None, vec![], normal, unwind);
        b.switch_to(normal);
        b.ret(Some(AnyConst::i32(0).into()));
        b.switch_to(unwind);
        b.ret(Some(AnyConst::i32(1).into()));

        let mut module = Module::new("eh");
        module.functions.push(b.finish());

        let throw = |_: &str, _: &[Value], _: &mut Memory| Ok::<_, InterpError>(ExternalOutcome::Unwind);
        let mut interp = Interpreter::new(&module, &reg, throw).unwrap();
        assert_eq!(interp.call("guarded", &[]).unwrap(), Some(Value::i32(1)));
    }

    #[test]
    fn fuel_bounds_infinite_loops() {
        let reg = TypeRegistry::new();
        let mut b = FunctionBuilder::new(&reg, "spin", &[], None);
        b.jump(Label::NIL);
        let mut module = Module::new("spin");
        module.functions.push(b.finish());

        let mut interp = Interpreter::new(&module, &reg, no_externals).unwrap().with_fuel(100);
        assert_eq!(interp.call("spin", &[]), Err(InterpError::OutOfFuel(100)));
    }
}
