//! Inner-loop statistics and entry/exit instrumentation.
use std::collections::BTreeMap;

use byinstr::{
    cfg::{ControlFlowGraph, EdgeKind, NaturalLoop},
    modules::{Function, InsertionPoint, instructions::Instr, operand::Label},
};
use log::{debug, trace};

use crate::{classify::is_ignorable_call, inject::Injector, magic::Routine, utils::error::ByflResult};

/// Static size of an inner loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InnerLoopInfo {
    pub basic_blocks: usize,
    /// Instructions that produce code, terminators included.
    pub instructions: usize,
}

impl InnerLoopInfo {
    pub fn measure(function: &Function, lp: &NaturalLoop) -> Self {
        let instructions = lp
            .blocks
            .iter()
            .filter_map(|label| function.body.get(label))
            .map(|block| {
                let body = block
                    .instructions
                    .iter()
                    .filter(|instr| match instr {
                        Instr::Phi(_) => false,
                        Instr::Call(call) => !call.callee().is_some_and(is_ignorable_call),
                        _ => true,
                    })
                    .count();
                body + 1
            })
            .sum();

        Self {
            basic_blocks: lp.blocks.len(),
            instructions,
        }
    }
}

/// Name under which a loop is reported.
pub fn loop_key(function: &str, header: Label) -> String {
    format!("{}:{}", function, header)
}

/// Splits every edge into and out of the loops in `loops` with a block
/// calling `bf_enter_inner_loop` or `bf_exit_inner_loop`.
///
/// `cfg` must describe `function` before any split. Unwind edges are left
/// alone. When an edge leaves one loop and enters another, the exit block
/// comes first.
pub fn instrument_inner_loops(
    function: &mut Function,
    cfg: &ControlFlowGraph,
    loops: &[NaturalLoop],
    injector: &mut Injector,
) -> ByflResult<()> {
    // Latest block standing in for the source of an original edge.
    let mut sources: BTreeMap<(Label, Label), Label> = BTreeMap::new();

    let mut edges = Vec::new();
    for lp in loops {
        for edge in cfg.exit_edges(lp) {
            edges.push((edge, lp.header, Routine::ExitInnerLoop));
        }
    }
    for lp in loops {
        let mut entries = cfg.entry_edges(lp);
        entries.sort();
        for edge in entries {
            edges.push((edge, lp.header, Routine::EnterInnerLoop));
        }
    }

    for ((from, to), header, routine) in edges {
        if cfg.edge_kind(from, to) != Some(EdgeKind::Normal) {
            debug!("{}: not splitting unwind edge {} -> {}", function.name, from, to);
            continue;
        }

        let source = sources.get(&(from, to)).copied().unwrap_or(from);
        let middle = function.split_edge(source, to)?;

        let name = injector.string(&loop_key(&function.name, header));
        let mut code = vec![];
        injector.call(&mut code, routine, vec![name]);
        let code = injector.guarded(code);
        if let Some(block) = function.body.get_mut(&middle) {
            block.insert(InsertionPoint::Before(0), code)?;
        }

        trace!("{}: {} on {} -> {}", function.name, routine.name(), from, to);
        sources.insert((from, to), middle);
    }
    Ok(())
}
