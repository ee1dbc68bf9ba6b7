use thiserror::Error;

use port_mapping::arch::ArchError;
use port_mapping::experiment::ExperimentError;
use port_mapping::mapping::MappingError;
use port_mapping::partition::PartitionError;
use portbench_rpc::client::ClientError;
use portbench_rpc::tls::TlsError;

/// Anything a subcommand can die of. `main` prints it and exits nonzero.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Arch(#[from] ArchError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Msg(String),
}

pub fn fail(msg: impl Into<String>) -> CliError {
    CliError::Msg(msg.into())
}
