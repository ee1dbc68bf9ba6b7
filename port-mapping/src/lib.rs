//! Data model for port-mapping inference: architectures, experiments and
//! port mappings, plus the bottleneck throughput simulator, the
//! equivalence-class partitioner and the uniform experiment sampler.
//!
//! An [`Architecture`](arch::Architecture) interns instruction and port
//! names into small integer ids; everything downstream (experiment
//! sequences, mapping assignments, the simulator's weight tables) works on
//! those ids and only touches names at the serialization boundary.

pub mod arch;
pub mod experiment;
pub mod mapping;
pub mod partition;
pub mod sample;
pub mod simulator;

pub use arch::{Architecture, InsnId, PortId};
pub use experiment::{ExpResult, Experiment, ExperimentList, MeasureError};
pub use mapping::{Assignment, Mapping, PortSet};
pub use simulator::{Processor, SimProcessor};
