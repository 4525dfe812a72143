use thiserror::Error;

/// Invalid combination of instrumentation options. Reported before any code
/// is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Function filters are mutually exclusive: both an include list ({include} entries) and an exclude list ({exclude} entries) were given."
    )]
    IncludeAndExclude { include: usize, exclude: usize },

    #[error("Basic-block merging requires a merge count of at least 1, found 0.")]
    ZeroMergeCount,

    #[error("The simulated cache line size must be a nonzero power of two, found {0} bytes.")]
    InvalidCacheLineSize(u64),

    #[error(
        "The simulated cache addresses {line_bits} line-offset bits plus {set_bits} set bits, which exceeds the 64 bits of an address."
    )]
    CacheGeometryTooLarge { line_bits: u32, set_bits: u64 },

    #[error("Failed to parse instrumentation options from '{origin}': {source}")]
    ParseError {
        source: toml::de::Error,
        origin: String,
    },
}

#[derive(Debug, Error)]
pub enum ByflError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Malformed input module: {0}")]
    MalformedInput(#[from] byinstr::utils::Error),

    #[error("Failed to serialize instrumentation options: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

pub type ByflResult<T> = Result<T, ByflError>;
