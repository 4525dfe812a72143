//! Instrumentation options.
//!
//! Options are plain data with `Default` values and a kebab-case TOML form,
//! e.g.
//!
//! ```toml
//! merge-bb = 4
//! call-stack = true
//! exclude = ["std::vector<int, std::allocator<int>>::push_back(int const&)"]
//! reuse-distance = ["loads"]
//! ```
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::utils::error::{ByflError, ByflResult, ConfigError};

bitflags! {
    /// Accesses fed to the reuse-distance tracker. Published as `bf_reuse_dist`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReuseDistance: u64 {
        const LOADS = 1 << 0;
        const STORES = 1 << 1;
    }
}

/// One entry of the `reuse-distance` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReuseDistanceMode {
    Loads,
    Stores,
    Both,
}

impl ReuseDistanceMode {
    pub fn flags(self) -> ReuseDistance {
        match self {
            ReuseDistanceMode::Loads => ReuseDistance::LOADS,
            ReuseDistanceMode::Stores => ReuseDistance::STORES,
            ReuseDistanceMode::Both => ReuseDistance::all(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct InstrumentOptions {
    /// Report counters after every basic block.
    pub every_bb: bool,
    /// Run the end-of-block bookkeeping once every `merge_bb` blocks.
    pub merge_bb: u64,
    pub by_function: bool,
    /// Track the call stack. Implies `by_function`.
    pub call_stack: bool,

    pub unique_bytes: bool,
    pub mem_footprint: bool,
    pub data_structs: bool,
    /// Tally loads and stores by type.
    pub types: bool,

    pub inst_mix: bool,
    pub inst_deps: bool,

    /// Only instrument these functions.
    pub include: Vec<String>,
    /// Instrument every function except these.
    pub exclude: Vec<String>,

    /// Wrap counter updates in the runtime mega-lock.
    pub thread_safe: bool,
    pub vectors: bool,

    pub reuse_distance: Vec<ReuseDistanceMode>,
    /// `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reuse_distance: Option<u64>,

    pub cache_model: bool,
    pub cache_line_bytes: u64,
    pub cache_max_set_bits: u64,

    pub strides: bool,
    pub inner_loops: bool,

    /// Seed of the symbol id generator. Derived from the module name when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_seed: Option<u64>,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            every_bb: false,
            merge_bb: 1,
            by_function: false,
            call_stack: false,
            unique_bytes: false,
            mem_footprint: false,
            data_structs: false,
            types: false,
            inst_mix: false,
            inst_deps: false,
            include: Vec::new(),
            exclude: Vec::new(),
            thread_safe: false,
            vectors: false,
            reuse_distance: Vec::new(),
            max_reuse_distance: None,
            cache_model: false,
            cache_line_bytes: 64,
            cache_max_set_bits: 16,
            strides: false,
            inner_loops: false,
            symbol_seed: None,
        }
    }
}

impl InstrumentOptions {
    /// Parse options from TOML text. `origin` names the source in errors.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            source: e,
            origin: origin.to_string(),
        })
    }

    /// Load and validate options from a TOML file.
    pub fn load_from_toml(path: &Path) -> ByflResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let options = Self::from_toml_str(&text, &path.display().to_string())?;
        options.validate()?;
        Ok(options)
    }

    pub fn save_to_toml(&self, path: &Path) -> ByflResult<()> {
        let text = toml::to_string(self)?;
        std::fs::write(path, text).map_err(ByflError::IoError)
    }

    /// Reject option combinations the pass cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(ConfigError::IncludeAndExclude {
                include: self.include.len(),
                exclude: self.exclude.len(),
            });
        }
        if self.merge_bb == 0 {
            return Err(ConfigError::ZeroMergeCount);
        }
        if !self.cache_line_bytes.is_power_of_two() {
            return Err(ConfigError::InvalidCacheLineSize(self.cache_line_bytes));
        }
        let line_bits = self.cache_line_bytes.trailing_zeros();
        if self.cache_max_set_bits > 64 - u64::from(line_bits) {
            return Err(ConfigError::CacheGeometryTooLarge {
                line_bits,
                set_bits: self.cache_max_set_bits,
            });
        }
        Ok(())
    }

    /// Counters are attributed to the enclosing function.
    pub fn tally_by_function(&self) -> bool {
        self.by_function || self.call_stack
    }

    pub fn reuse_distance_flags(&self) -> ReuseDistance {
        self.reuse_distance
            .iter()
            .fold(ReuseDistance::empty(), |acc, mode| acc | mode.flags())
    }

    /// Seed of the symbol id generator for the module `module_name`: FNV-1a
    /// of the name unless pinned by `symbol_seed`.
    pub fn seed_for(&self, module_name: &str) -> u64 {
        self.symbol_seed.unwrap_or_else(|| {
            module_name.bytes().fold(0xcbf29ce484222325u64, |hash, byte| {
                (hash ^ byte as u64).wrapping_mul(0x100000001b3)
            })
        })
    }

    /// Human-readable list of the options that differ from their default,
    /// published as `bf_option_string`.
    pub fn describe(&self) -> String {
        let defaults = Self::default();
        let mut parts: Vec<String> = Vec::new();

        let flags = [
            ("every-bb", self.every_bb),
            ("by-function", self.by_function),
            ("call-stack", self.call_stack),
            ("unique-bytes", self.unique_bytes),
            ("mem-footprint", self.mem_footprint),
            ("data-structs", self.data_structs),
            ("types", self.types),
            ("inst-mix", self.inst_mix),
            ("inst-deps", self.inst_deps),
            ("thread-safe", self.thread_safe),
            ("vectors", self.vectors),
            ("cache-model", self.cache_model),
            ("strides", self.strides),
            ("inner-loops", self.inner_loops),
        ];
        parts.extend(
            flags
                .iter()
                .filter(|(_, on)| *on)
                .map(|(name, _)| name.to_string()),
        );

        if self.merge_bb != defaults.merge_bb {
            parts.push(format!("merge-bb={}", self.merge_bb));
        }
        if !self.include.is_empty() {
            parts.push(format!("include={}", self.include.join(",")));
        }
        if !self.exclude.is_empty() {
            parts.push(format!("exclude={}", self.exclude.join(",")));
        }
        let reuse = self.reuse_distance_flags();
        if !reuse.is_empty() {
            let mode = if reuse == ReuseDistance::all() {
                "both"
            } else if reuse.contains(ReuseDistance::LOADS) {
                "loads"
            } else {
                "stores"
            };
            parts.push(format!("reuse-distance={}", mode));
        }
        if let Some(max) = self.max_reuse_distance {
            parts.push(format!("max-reuse-distance={}", max));
        }
        if self.cache_model {
            parts.push(format!("cache-line-bytes={}", self.cache_line_bytes));
            parts.push(format!("cache-max-set-bits={}", self.cache_max_set_bits));
        }

        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = InstrumentOptions::default();
        options.validate().unwrap();
        assert_eq!(options.merge_bb, 1);
        assert!(!options.tally_by_function());
        assert_eq!(options.describe(), "");
    }

    #[test]
    fn kebab_case_keys_are_parsed() {
        let options = InstrumentOptions::from_toml_str(
            r#"
            merge-bb = 3
            call-stack = true
            reuse-distance = ["loads", "stores"]
            cache-line-bytes = 128
            "#,
            "inline",
        )
        .unwrap();

        assert_eq!(options.merge_bb, 3);
        assert!(options.tally_by_function());
        assert_eq!(options.reuse_distance_flags(), ReuseDistance::all());
        assert_eq!(options.cache_line_bytes, 128);
        assert!(!options.every_bb);
        options.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = InstrumentOptions::from_toml_str("every-block = true", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref origin, .. } if origin == "inline"));
    }

    #[test]
    fn include_and_exclude_are_exclusive() {
        let options = InstrumentOptions {
            include: vec!["main".to_string()],
            exclude: vec!["foo".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::IncludeAndExclude {
                include: 1,
                exclude: 1
            })
        ));
    }

    #[test]
    fn merge_count_and_cache_geometry_are_checked() {
        let zero_merge = InstrumentOptions {
            merge_bb: 0,
            ..Default::default()
        };
        assert!(matches!(zero_merge.validate(), Err(ConfigError::ZeroMergeCount)));

        let odd_line = InstrumentOptions {
            cache_line_bytes: 48,
            ..Default::default()
        };
        assert!(matches!(
            odd_line.validate(),
            Err(ConfigError::InvalidCacheLineSize(48))
        ));

        let huge = InstrumentOptions {
            cache_line_bytes: 64,
            cache_max_set_bits: 59,
            ..Default::default()
        };
        assert!(matches!(
            huge.validate(),
            Err(ConfigError::CacheGeometryTooLarge {
                line_bits: 6,
                set_bits: 59
            })
        ));

        let overflowing = InstrumentOptions {
            cache_max_set_bits: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            overflowing.validate(),
            Err(ConfigError::CacheGeometryTooLarge {
                set_bits: u64::MAX,
                ..
            })
        ));

        let widest = InstrumentOptions {
            cache_line_bytes: 64,
            cache_max_set_bits: 58,
            ..Default::default()
        };
        widest.validate().unwrap();
    }

    #[test]
    fn seed_is_stable_per_module_name() {
        let options = InstrumentOptions::default();
        assert_eq!(options.seed_for("a.ll"), options.seed_for("a.ll"));
        assert_ne!(options.seed_for("a.ll"), options.seed_for("b.ll"));
        // Fixed across toolchains.
        assert_eq!(options.seed_for(""), 0xcbf29ce484222325);
        assert_eq!(options.seed_for("a"), 0xaf63dc4c8601ec8c);

        let pinned = InstrumentOptions {
            symbol_seed: Some(7),
            ..Default::default()
        };
        assert_eq!(pinned.seed_for("a.ll"), 7);
    }
}
