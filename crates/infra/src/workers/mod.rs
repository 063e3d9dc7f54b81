//! Background workers.

pub mod rollup;

pub use rollup::{
    RollupReader, RollupRunner, RollupRunnerHandle, RollupSink, RollupSnapshot, RollupSource,
};
