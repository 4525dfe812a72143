//! Pretty-print helpers for instructions, terminators, functions, and modules.
use crate::{
    modules::{
        Function, Instruction, Linkage, Module,
        instructions::Instr,
        int::{IDiv, IRem},
        terminator::Terminator,
    },
    types::TypeRegistry,
};

impl Instr {
    /// Build a formatting helper that renders the instruction using the supplied registry.
    pub fn fmt<'a>(&'a self, registry: &'a TypeRegistry) -> impl std::fmt::Display + Copy + 'a {
        #[derive(Clone, Copy)]
        pub struct Fmt<'a> {
            instr: &'a Instr,
            registry: &'a TypeRegistry,
        }

        impl Fmt<'_> {
            /// Writes the opcode-specific part. Returns true if operands were
            /// written too.
            fn specific_fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<bool, std::fmt::Error> {
                match self.instr {
                    Instr::IDiv(IDiv { signedness, .. }) | Instr::IRem(IRem { signedness, .. }) => {
                        write!(f, ".{}", signedness.to_str())?;
                        Ok(false)
                    }
                    Instr::ICmp(cmp) => {
                        write!(f, ".{} {}", cmp.op.to_str(), self.registry.fmt(cmp.ty))?;
                        Ok(false)
                    }
                    Instr::FCmp(cmp) => {
                        write!(f, ".{} {}", cmp.op.to_str(), self.registry.fmt(cmp.ty))?;
                        Ok(false)
                    }
                    Instr::ISht(isht) => {
                        write!(f, ".{}", isht.op.to_str())?;
                        Ok(false)
                    }
                    Instr::Cast(cast) => {
                        write!(
                            f,
                            ".{} {} {} to {}",
                            cast.op.to_str(),
                            self.registry.fmt(cast.from_ty),
                            cast.value,
                            self.registry.fmt(cast.to_ty)
                        )?;
                        Ok(true)
                    }
                    Instr::MLoad(load) => {
                        if load.volatile {
                            write!(f, " volatile")?;
                        }
                        write!(f, " {}", load.addr)?;
                        if let Some(alignment) = load.alignment {
                            write!(f, ", align {}", alignment)?;
                        }
                        Ok(true)
                    }
                    Instr::MStore(store) => {
                        if store.volatile {
                            write!(f, " volatile")?;
                        }
                        write!(
                            f,
                            " {} {}, {}",
                            self.registry.fmt(store.ty),
                            store.value,
                            store.addr
                        )?;
                        if let Some(alignment) = store.alignment {
                            write!(f, ", align {}", alignment)?;
                        }
                        Ok(true)
                    }
                    Instr::MAlloca(alloca) => {
                        write!(f, " {}, {}", self.registry.fmt(alloca.ty), alloca.count)?;
                        if let Some(alignment) = alloca.alignment {
                            write!(f, ", align {}", alignment)?;
                        }
                        Ok(true)
                    }
                    Instr::MGetElementPtr(gep) => {
                        write!(f, " {}, {}", self.registry.fmt(gep.ty), gep.base)?;
                        for index in gep.indices.iter() {
                            write!(f, ", {}", index)?;
                        }
                        Ok(true)
                    }
                    Instr::Phi(phi) => {
                        for (i, (label, operand)) in phi.values.iter().enumerate() {
                            if i > 0 {
                                write!(f, ",")?;
                            }
                            write!(f, " [{}, {}]", operand, label)?;
                        }
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if let Some(dest) = self.instr.destination() {
                    match self.instr.destination_type(self.registry) {
                        Some(ty) => write!(f, "{}: {} = ", dest, self.registry.fmt(ty))?,
                        None => write!(f, "{} = ", dest)?,
                    }
                }
                write!(f, "{}", self.instr.opname())?;

                // Perform specific formatting based on instruction type
                if self.specific_fmt(f)? {
                    return Ok(());
                }

                // Format operands
                for (i, operand) in self.instr.operands().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}", operand)?;
                }

                Ok(())
            }
        }

        Fmt {
            instr: self,
            registry,
        }
    }
}

impl std::fmt::Display for Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Terminator::CBranch(cbranch) => write!(
                f,
                "branch {}, {:#}, {:#}",
                cbranch.cond, cbranch.target_true, cbranch.target_false
            ),
            Terminator::Jump(jump) => write!(f, "jump {:#}", jump.target),
            Terminator::Switch(switch) => {
                write!(f, "switch {}, {:#} [", switch.value, switch.default)?;
                for (i, (value, label)) in switch.cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {:#}", value, label)?;
                }
                write!(f, "]")
            }
            Terminator::Ret(ret) => match &ret.value {
                Some(value) => write!(f, "ret {}", value),
                None => write!(f, "ret void"),
            },
            Terminator::Trap(_) => write!(f, "trap"),
            Terminator::Invoke(invoke) => {
                if let Some(dest) = invoke.call.dest {
                    write!(f, "{} = ", dest)?;
                }
                write!(f, "invoke {}(", invoke.call.function)?;
                for (i, arg) in invoke.call.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ") to {:#} unwind {:#}", invoke.normal, invoke.unwind)
            }
        }
    }
}

impl Function {
    /// Build a formatting helper that renders the function in textual form.
    pub fn fmt<'a>(&'a self, type_registry: &'a TypeRegistry) -> impl std::fmt::Display + 'a {
        struct Fmt<'a> {
            function: &'a Function,
            type_registry: &'a TypeRegistry,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    "define{} {} @{}(",
                    linkage_prefix(self.function.linkage),
                    self.function
                        .return_type
                        .map(|ty| self.type_registry.fmt(ty).to_string())
                        .unwrap_or("void".to_string()),
                    self.function.name
                )?;

                for (i, (param_name, param_type)) in self.function.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", param_name, self.type_registry.fmt(*param_type))?;
                }
                writeln!(f, ") {{")?;

                for (block_label, block) in &self.function.body {
                    writeln!(f, "{}:", block_label)?;
                    for instr in &block.instructions {
                        writeln!(f, "  {}", instr.fmt(self.type_registry))?;
                    }

                    writeln!(f, "  {}", block.terminator)?;
                }

                writeln!(f, "}}")
            }
        }

        Fmt {
            function: self,
            type_registry,
        }
    }
}

fn linkage_prefix(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::Private => " private",
        Linkage::Internal => " internal",
        Linkage::External => "",
        Linkage::LinkOnce => " linkonce",
    }
}

impl Module {
    /// Build a formatting helper that renders globals, declarations and
    /// every function within the module.
    pub fn fmt<'a>(&'a self, type_registry: &'a TypeRegistry) -> impl std::fmt::Display + 'a {
        struct Fmt<'a> {
            module: &'a Module,
            type_registry: &'a TypeRegistry,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                writeln!(f, "; module {}", self.module.name)?;
                for global in &self.module.globals {
                    write!(
                        f,
                        "@{} ={} {} {}",
                        global.name,
                        linkage_prefix(global.linkage),
                        if global.constant { "constant" } else { "global" },
                        self.type_registry.fmt(global.ty)
                    )?;
                    match &global.init {
                        Some(init) => writeln!(f, " {}", init)?,
                        None => writeln!(f)?,
                    }
                }
                for decl in &self.module.external_functions {
                    writeln!(f, "declare @{}", decl.name)?;
                }
                for ctor in &self.module.constructors {
                    writeln!(f, "; constructor @{}", ctor)?;
                }
                for function in &self.module.functions {
                    writeln!(f, "{}", function.fmt(self.type_registry))?;
                }
                Ok(())
            }
        }

        Fmt {
            module: self,
            type_registry,
        }
    }
}
