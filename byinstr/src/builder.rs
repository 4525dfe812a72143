//! # Function Builder
//!
//! A small fluent API for constructing [`Function`]s without spelling out
//! every instruction struct. The builder hands out fresh SSA names, keeps
//! track of the block being filled, and assembles the body on
//! [`FunctionBuilder::finish`].
//!
//! ## Basic Usage Pattern
//!
//! 1. Create a builder with [`FunctionBuilder::new`]
//! 2. Reserve blocks with [`FunctionBuilder::new_block`] and select one with
//!    [`FunctionBuilder::switch_to`] (the entry block is selected initially)
//! 3. Append instructions; value-producing helpers return the result operand
//! 4. End every block with a terminator helper
//! 5. Generate the function with `finish()`
//!
//! ```rust
//! # use byinstr::{builder::FunctionBuilder, consts::AnyConst, types::TypeRegistry};
//! let reg = TypeRegistry::new();
//! let i32_ty = reg.int(32);
//! let mut b = FunctionBuilder::new(&reg, "add_one", &[i32_ty], Some(i32_ty));
//! let x = b.param(0);
//! let sum = b.iadd(i32_ty, x, AnyConst::i32(1).into());
//! b.ret(Some(sum));
//! let func = b.finish();
//! assert!(func.check_ssa().is_ok());
//! ```
use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::{
    consts::AnyConst,
    modules::{
        BasicBlock, DebugVariable, Function, Instruction, Linkage, SourceLoc,
        fp::{FAdd, FCmp, FCmpOp, FDiv, FMul, FSub},
        instructions::Instr,
        int::{IAdd, ICmp, ICmpOp, IMul, ISub},
        mem::{MAlloca, MGetElementPtr, MLoad, MStore},
        misc::{Call, Cast, CastOp, Phi, Select},
        operand::{Label, Name, Operand},
        terminator::{CBranch, Invoke, Jump, Ret, Switch, Terminator, Trap},
    },
    types::{TypeRegistry, Typeref},
};

struct PendingBlock {
    instructions: Vec<Instr>,
    terminator: Option<Terminator>,
}

pub struct FunctionBuilder<'r> {
    registry: &'r TypeRegistry,
    function: Function,
    blocks: BTreeMap<Label, PendingBlock>,
    current: Label,
    next_name: u32,
}

impl<'r> FunctionBuilder<'r> {
    /// Start a function whose parameters are named `%0 .. %n-1`.
    pub fn new(
        registry: &'r TypeRegistry,
        name: impl Into<String>,
        params: &[Typeref],
        return_type: Option<Typeref>,
    ) -> Self {
        let mut function = Function::new(name, return_type);
        function.params = params
            .iter()
            .enumerate()
            .map(|(i, ty)| (Name(i as u32), *ty))
            .collect();

        let mut blocks = BTreeMap::new();
        blocks.insert(
            Label::NIL,
            PendingBlock {
                instructions: Vec::new(),
                terminator: None,
            },
        );

        Self {
            registry,
            function,
            blocks,
            current: Label::NIL,
            next_name: params.len() as u32,
        }
    }

    pub fn registry(&self) -> &'r TypeRegistry {
        self.registry
    }

    /// Operand referring to parameter `index`.
    pub fn param(&self, index: usize) -> Operand {
        Operand::Reg(self.function.params[index].0)
    }

    /// A fresh SSA name. Useful for values referenced before their definition
    /// (loop-carried phi operands).
    pub fn fresh(&mut self) -> Name {
        let name = Name(self.next_name);
        self.next_name += 1;
        name
    }

    pub fn set_linkage(&mut self, linkage: Linkage) -> &mut Self {
        self.function.linkage = linkage;
        self
    }

    pub fn set_source(&mut self, file: impl Into<String>, line: u32) -> &mut Self {
        self.function.source = Some(SourceLoc {
            file: file.into(),
            line,
        });
        self
    }

    /// Attach a source variable to the stack allocation `name`.
    pub fn describe_local(&mut self, name: Name, var: DebugVariable) -> &mut Self {
        self.function.locals.insert(name, var);
        self
    }

    /// Attach a source position to the value `name`.
    pub fn locate(&mut self, name: Name, file: impl Into<String>, line: u32) -> &mut Self {
        self.function.locations.insert(
            name,
            SourceLoc {
                file: file.into(),
                line,
            },
        );
        self
    }

    /// Reserve a new, empty block.
    pub fn new_block(&mut self) -> Label {
        let label = self
            .blocks
            .last_key_value()
            .map_or(Label::NIL, |(label, _)| Label(label.0 + 1));
        self.blocks.insert(
            label,
            PendingBlock {
                instructions: Vec::new(),
                terminator: None,
            },
        );
        label
    }

    /// Direct subsequent instructions to `label`.
    pub fn switch_to(&mut self, label: Label) -> &mut Self {
        self.current = label;
        self
    }

    pub fn current_block(&self) -> Label {
        self.current
    }

    fn block(&mut self) -> &mut PendingBlock {
        self.blocks
            .entry(self.current)
            .or_insert_with(|| PendingBlock {
                instructions: Vec::new(),
                terminator: None,
            })
    }

    /// Append `instr` to the current block.
    pub fn push(&mut self, instr: impl Into<Instr>) -> &mut Self {
        self.block().instructions.push(instr.into());
        self
    }

    /// Append `instr` after renaming its result to a fresh name, and return
    /// that result.
    fn value(&mut self, instr: impl Into<Instr>) -> Operand {
        let mut instr = instr.into();
        let dest = self.fresh();
        instr.set_destination(dest);
        self.push(instr);
        Operand::Reg(dest)
    }

    pub fn iadd(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(IAdd { dest: Name(0), ty, lhs, rhs })
    }

    pub fn isub(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(ISub { dest: Name(0), ty, lhs, rhs })
    }

    pub fn imul(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(IMul { dest: Name(0), ty, lhs, rhs })
    }

    pub fn icmp(&mut self, op: ICmpOp, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(ICmp { dest: Name(0), ty, lhs, rhs, op })
    }

    pub fn fadd(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(FAdd { dest: Name(0), ty, lhs, rhs })
    }

    pub fn fsub(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(FSub { dest: Name(0), ty, lhs, rhs })
    }

    pub fn fmul(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(FMul { dest: Name(0), ty, lhs, rhs })
    }

    pub fn fdiv(&mut self, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(FDiv { dest: Name(0), ty, lhs, rhs })
    }

    pub fn fcmp(&mut self, op: FCmpOp, ty: Typeref, lhs: Operand, rhs: Operand) -> Operand {
        self.value(FCmp { dest: Name(0), ty, lhs, rhs, op })
    }

    pub fn load(&mut self, ty: Typeref, addr: Operand) -> Operand {
        self.value(MLoad {
            dest: Name(0),
            ty,
            addr,
            alignment: None,
            volatile: false,
        })
    }

    pub fn store(&mut self, ty: Typeref, value: Operand, addr: Operand) -> &mut Self {
        self.push(MStore {
            addr,
            value,
            ty,
            alignment: None,
            volatile: false,
        })
    }

    /// Stack slot for one value of type `ty`. Returns the slot and its name.
    pub fn alloca(&mut self, ty: Typeref) -> (Operand, Name) {
        let dest = self.fresh();
        self.push(MAlloca {
            dest,
            ty,
            count: AnyConst::i64(1).into(),
            alignment: None,
        });
        (Operand::Reg(dest), dest)
    }

    pub fn gep(&mut self, ty: Typeref, base: Operand, indices: Vec<Operand>) -> Operand {
        self.value(MGetElementPtr {
            dest: Name(0),
            ty,
            base,
            indices: SmallVec::from_vec(indices),
        })
    }

    pub fn cast(&mut self, op: CastOp, from_ty: Typeref, to_ty: Typeref, value: Operand) -> Operand {
        self.value(Cast {
            dest: Name(0),
            op,
            from_ty,
            to_ty,
            value,
        })
    }

    pub fn select(&mut self, ty: Typeref, cond: Operand, on_true: Operand, on_false: Operand) -> Operand {
        self.value(Select {
            dest: Name(0),
            ty,
            cond,
            on_true,
            on_false,
        })
    }

    /// Phi defining `dest`, typically a name obtained from [`Self::fresh`].
    pub fn phi_into(&mut self, dest: Name, ty: Typeref, values: Vec<(Label, Operand)>) -> Operand {
        self.push(Phi { dest, ty, values });
        Operand::Reg(dest)
    }

    /// Direct call of `function`. Returns the result for non-void callees.
    pub fn call(&mut self, function: &str, ret: Option<Typeref>, args: Vec<Operand>) -> Option<Operand> {
        let dest = ret.map(|_| self.fresh());
        self.push(Call {
            dest,
            ty: ret,
            function: Operand::Function(function.to_string()),
            args,
        });
        dest.map(Operand::Reg)
    }

    /// End the current block with `terminator`.
    pub fn terminate(&mut self, terminator: impl Into<Terminator>) -> &mut Self {
        self.block().terminator = Some(terminator.into());
        self
    }

    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.terminate(Jump { target })
    }

    pub fn branch(&mut self, cond: Operand, target_true: Label, target_false: Label) -> &mut Self {
        self.terminate(CBranch {
            cond,
            target_true,
            target_false,
        })
    }

    pub fn switch(&mut self, value: Operand, ty: Typeref, default: Label, cases: Vec<(u64, Label)>) -> &mut Self {
        self.terminate(Switch {
            value,
            ty,
            default,
            cases,
        })
    }

    pub fn ret(&mut self, value: Option<Operand>) -> &mut Self {
        self.terminate(Ret { value })
    }

    pub fn trap(&mut self) -> &mut Self {
        self.terminate(Trap)
    }

    /// End the current block with an invoke of `function`.
    pub fn invoke(
        &mut self,
        function: &str,
        ret: Option<Typeref>,
        args: Vec<Operand>,
        normal: Label,
        unwind: Label,
    ) -> Option<Operand> {
        let dest = ret.map(|_| self.fresh());
        self.terminate(Invoke {
            call: Call {
                dest,
                ty: ret,
                function: Operand::Function(function.to_string()),
                args,
            },
            normal,
            unwind,
        });
        dest.map(Operand::Reg)
    }

    /// Assemble the function. Blocks left without terminator end in a trap.
    pub fn finish(self) -> Function {
        let mut function = self.function;
        function.body = self
            .blocks
            .into_iter()
            .map(|(label, pending)| {
                (
                    label,
                    BasicBlock {
                        instructions: pending.instructions,
                        terminator: pending.terminator.unwrap_or(Terminator::Trap(Trap)),
                    },
                )
            })
            .collect();
        function
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_valid_ssa_with_loop_carried_phi() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let mut b = FunctionBuilder::new(&reg, "count", &[i64_ty], Some(i64_ty));
        let n = b.param(0);
        let header = b.new_block();
        let exit = b.new_block();
        b.jump(header);

        b.switch_to(header);
        let next = b.fresh();
        let i = b.fresh();
        b.phi_into(
            i,
            i64_ty,
            vec![(Label::NIL, AnyConst::i64(0).into()), (header, Operand::Reg(next))],
        );
        b.push(IAdd {
            dest: next,
            ty: i64_ty,
            lhs: Operand::Reg(i),
            rhs: AnyConst::i64(1).into(),
        });
        let done = b.icmp(ICmpOp::Uge, i64_ty, Operand::Reg(next), n);
        b.branch(done, exit, header);

        b.switch_to(exit);
        b.ret(Some(Operand::Reg(next)));

        let func = b.finish();
        assert_eq!(func.body.len(), 3);
        assert!(func.check_ssa().is_ok());
        assert_eq!(func.next_available_name(), Name(4));
    }
}
