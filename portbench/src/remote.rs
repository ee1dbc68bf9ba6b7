use port_mapping::arch::{Architecture, InsnId};
use port_mapping::experiment::{ExpResult, MeasureError};
use port_mapping::simulator::Processor;
use portbench_rpc::client::ClientError;
use portbench_rpc::{RemoteClient, RunOptions, SslInfo};

use crate::cli::ClientArgs;
use crate::errors::CliError;

/// A [`Processor`] that forwards experiments to a measurement server.
///
/// The server identifies instructions by their raw template strings, which
/// may contain whitespace; the local architecture normalizes them. The
/// original spellings are kept for the wire.
pub struct RemoteProcessor {
    client: RemoteClient,
    arch: Architecture,
    raw_names: Vec<String>,
    remote_description: String,
    host: String,
    port: u16,
}

impl RemoteProcessor {
    pub fn connect(args: &ClientArgs) -> Result<Self, CliError> {
        let ssl = SslInfo::in_dir(&args.sslpath);
        let client = RemoteClient::new(&args.host, args.port, &ssl, None)?;

        let raw_names = client.get_insns()?;
        let mut arch = Architecture::new();
        for raw in &raw_names {
            arch.add_insn(raw)?;
        }
        let num_ports = client.get_num_ports()?;
        arch.add_numbered_ports(num_ports)?;
        let remote_description = client.get_description()?;

        Ok(RemoteProcessor {
            client,
            arch,
            raw_names,
            remote_description,
            host: args.host.clone(),
            port: args.port,
        })
    }

    fn raw_iseq(&self, iseq: &[InsnId]) -> Vec<String> {
        iseq.iter()
            .map(|insn| self.raw_names[insn.0 as usize].clone())
            .collect()
    }

    /// Runs one experiment with explicit driver options.
    pub fn execute_with(
        &self,
        iseq: &[InsnId],
        opts: &RunOptions,
    ) -> Result<ExpResult, ClientError> {
        self.client.run_experiment(&self.raw_iseq(iseq), opts)
    }

    pub fn gen_code(
        &self,
        iseq: &[InsnId],
        opts: &RunOptions,
    ) -> Result<(String, u64), ClientError> {
        self.client.gen_code(&self.raw_iseq(iseq), opts)
    }
}

impl Processor for RemoteProcessor {
    fn arch(&self) -> &Architecture {
        &self.arch
    }

    fn description(&self) -> String {
        format!(
            "remote processor wrapping a {} from {}:{}",
            self.remote_description, self.host, self.port
        )
    }

    fn execute(&mut self, iseq: &[InsnId]) -> ExpResult {
        match self.execute_with(iseq, &RunOptions::default()) {
            Ok(result) => result,
            Err(err) => ExpResult::failed(MeasureError::Other(err.to_string())),
        }
    }
}
