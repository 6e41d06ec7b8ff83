pub mod config;

pub use config::{
    ConfigError, ConvolutionConfig, DuplicatePolicy, PartitionConfig, SchedulerConfig,
    SourceConfig, SynthesisConfig, TunerConfig,
};
