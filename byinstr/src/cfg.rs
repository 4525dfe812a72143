//! Control-flow graph view of a [`Function`].
//!
//! The graph is a snapshot: editing the function afterwards does not update
//! it. Loop discovery follows the classical recipe: a back edge `latch ->
//! header` is a DFS back edge whose target dominates its source, and the
//! natural loop of that edge is every block that reaches `latch` without
//! going through `header`.
use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use petgraph::{
    Direction,
    algo::dominators::{self, Dominators},
    prelude::DiGraphMap,
    visit::{DfsEvent, depth_first_search},
};

use crate::modules::{Function, operand::Label, terminator::Terminator};

/// Kind of the control-flow edge.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum EdgeKind {
    Normal,
    /// Exceptional edge of an invoke.
    Unwind,
}

/// A natural loop, possibly the union of several back edges sharing a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalLoop {
    pub header: Label,
    pub latches: BTreeSet<Label>,
    pub blocks: BTreeSet<Label>,
}

pub struct ControlFlowGraph {
    graph: DiGraphMap<Label, EdgeKind>,
    dominators: Dominators<Label>,
}

impl ControlFlowGraph {
    /// Build the graph of `function`. The function must have an entry block.
    pub fn new(function: &Function) -> Self {
        let mut graph = DiGraphMap::new();
        for label in function.body.keys() {
            graph.add_node(*label);
        }
        for (label, block) in &function.body {
            let unwind = match &block.terminator {
                Terminator::Invoke(invoke) => Some(invoke.unwind),
                _ => None,
            };
            for target in block.terminator.iter_targets() {
                let kind = if Some(target) == unwind {
                    EdgeKind::Unwind
                } else {
                    EdgeKind::Normal
                };
                graph.add_edge(*label, target, kind);
            }
        }

        let dominators = dominators::simple_fast(&graph, Label::NIL);
        Self { graph, dominators }
    }

    pub fn successors(&self, label: Label) -> impl Iterator<Item = Label> + '_ {
        self.graph.neighbors_directed(label, Direction::Outgoing)
    }

    pub fn predecessors(&self, label: Label) -> impl Iterator<Item = Label> + '_ {
        self.graph.neighbors_directed(label, Direction::Incoming)
    }

    /// Kind of the edge `from -> to`, if it exists.
    pub fn edge_kind(&self, from: Label, to: Label) -> Option<EdgeKind> {
        self.graph.edge_weight(from, to).copied()
    }

    /// Returns true if `a` dominates `b`. Unreachable blocks are dominated by nothing.
    pub fn dominates(&self, a: Label, b: Label) -> bool {
        self.dominators
            .dominators(b)
            .map(|mut doms| doms.any(|d| d == a))
            .unwrap_or(false)
    }

    /// Back edges `(latch, header)` reachable from the entry, in discovery order.
    pub fn back_edges(&self) -> Vec<(Label, Label)> {
        let mut edges = Vec::new();
        depth_first_search(&self.graph, Some(Label::NIL), |event| {
            if let DfsEvent::BackEdge(latch, header) = event {
                if self.dominates(header, latch) {
                    edges.push((latch, header));
                } else {
                    debug!("ignoring retreating edge {} -> {} (irreducible)", latch, header);
                }
            }
        });
        edges
    }

    /// Blocks of the natural loop of the back edge `latch -> header`.
    pub fn natural_loop(&self, latch: Label, header: Label) -> BTreeSet<Label> {
        let mut blocks = BTreeSet::from([header]);
        let mut worklist = vec![latch];
        while let Some(label) = worklist.pop() {
            if blocks.insert(label) {
                worklist.extend(
                    self.predecessors(label)
                        .filter(|pred| self.dominates(header, *pred)),
                );
            }
        }
        blocks
    }

    /// Natural loops keyed by header. Back edges sharing a header are merged.
    pub fn loops(&self) -> BTreeMap<Label, NaturalLoop> {
        let mut loops: BTreeMap<Label, NaturalLoop> = BTreeMap::new();
        for (latch, header) in self.back_edges() {
            let blocks = self.natural_loop(latch, header);
            let entry = loops.entry(header).or_insert_with(|| NaturalLoop {
                header,
                latches: BTreeSet::new(),
                blocks: BTreeSet::new(),
            });
            entry.latches.insert(latch);
            entry.blocks.extend(blocks);
        }
        loops
    }

    /// Loops that contain no other loop header.
    pub fn inner_loops(&self) -> Vec<NaturalLoop> {
        let loops = self.loops();
        loops
            .values()
            .filter(|lp| {
                !loops
                    .keys()
                    .any(|other| *other != lp.header && lp.blocks.contains(other))
            })
            .cloned()
            .collect()
    }

    /// Edges entering `lp` from outside, i.e. into the header from a non-latch.
    pub fn entry_edges(&self, lp: &NaturalLoop) -> Vec<(Label, Label)> {
        self.predecessors(lp.header)
            .filter(|pred| !lp.blocks.contains(pred))
            .map(|pred| (pred, lp.header))
            .collect()
    }

    /// Edges leaving `lp`, sorted.
    pub fn exit_edges(&self, lp: &NaturalLoop) -> Vec<(Label, Label)> {
        let mut edges: Vec<_> = lp
            .blocks
            .iter()
            .flat_map(|from| {
                self.successors(*from)
                    .filter(|to| !lp.blocks.contains(to))
                    .map(move |to| (*from, to))
            })
            .collect();
        edges.sort();
        edges
    }
}
