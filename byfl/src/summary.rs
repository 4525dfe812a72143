//! Static report of what the pass instrumented.
use std::{collections::BTreeMap, fmt};

use crate::loops::InnerLoopInfo;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationSummary {
    pub module: String,
    pub static_loads: u64,
    pub static_stores: u64,
    pub static_flops: u64,
    /// Code-producing instructions, terminators included.
    pub static_ops: u64,
    /// Conditional and multi-way branches.
    pub static_cond_brs: u64,
    pub static_blocks: u64,
    pub instrumented_functions: u64,
    /// Functions left alone because of the include/exclude lists.
    pub skipped_functions: u64,
    pub inner_loops: BTreeMap<String, InnerLoopInfo>,
}

impl InstrumentationSummary {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    /// Inner loops, largest first. Ties are broken by name.
    pub fn sorted_inner_loops(&self) -> Vec<(&str, &InnerLoopInfo)> {
        let mut loops: Vec<_> = self
            .inner_loops
            .iter()
            .map(|(key, info)| (key.as_str(), info))
            .collect();
        loops.sort_by(|(ka, a), (kb, b)| b.instructions.cmp(&a.instructions).then(ka.cmp(kb)));
        loops
    }
}

impl fmt::Display for InstrumentationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "instrumented {}:", self.module)?;
        writeln!(
            f,
            "  {} functions ({} skipped), {} basic blocks",
            self.instrumented_functions, self.skipped_functions, self.static_blocks
        )?;
        writeln!(
            f,
            "  {} loads, {} stores, {} flops, {} ops, {} conditional branches",
            self.static_loads,
            self.static_stores,
            self.static_flops,
            self.static_ops,
            self.static_cond_brs
        )?;
        for (key, info) in self.sorted_inner_loops() {
            writeln!(
                f,
                "  inner loop {}: {} basic blocks, {} instructions",
                key, info.basic_blocks, info.instructions
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loops_are_listed_largest_first() {
        let mut summary = InstrumentationSummary::new("m");
        let info = |basic_blocks, instructions| InnerLoopInfo {
            basic_blocks,
            instructions,
        };
        summary.inner_loops.insert("b:block_1".to_string(), info(1, 4));
        summary.inner_loops.insert("a:block_3".to_string(), info(2, 9));
        summary.inner_loops.insert("a:block_1".to_string(), info(1, 4));

        let order: Vec<&str> = summary.sorted_inner_loops().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["a:block_3", "a:block_1", "b:block_1"]);

        let text = summary.to_string();
        assert!(text.starts_with("instrumented m:"));
        assert!(text.contains("inner loop a:block_3: 2 basic blocks, 9 instructions"));
    }
}
