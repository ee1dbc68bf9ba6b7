use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use port_mapping::experiment::{ExpResult, MeasureError};

use crate::proto::{recv_message, send_message, Request, Response, RunOptions};
use crate::tls::{self, SslInfo, TlsError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },

    #[error("server closed the connection mid-request")]
    Disconnected,

    #[error("server reported an error: {0}")]
    Server(String),

    #[error("unexpected response to {request}: {got}")]
    UnexpectedResponse {
        request: &'static str,
        got: &'static str,
    },

    #[error("invalid host name {0:?}")]
    BadHostName(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Blocking client for a measurement server. Mirrors the server's
/// single-tenant nature: one connection is opened per call and torn down
/// afterwards, so a crashed experiment never wedges the transport.
pub struct RemoteClient {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
    runtime: tokio::runtime::Runtime,
    request_timeout: Duration,
}

impl RemoteClient {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        host: &str,
        port: u16,
        ssl: &SslInfo,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        ssl.check_files()?;
        let config = tls::client_config(ssl)?;
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| ClientError::BadHostName(host.to_owned()))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(RemoteClient {
            host: host.to_owned(),
            port,
            server_name,
            config,
            runtime,
            request_timeout: request_timeout.unwrap_or(Self::DEFAULT_REQUEST_TIMEOUT),
        })
    }

    fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let connector = TlsConnector::from(self.config.clone());
        let addr = (self.host.as_str(), self.port);
        let server_name = self.server_name.clone();
        let fut = async {
            let tcp = TcpStream::connect(addr).await?;
            let stream = connector.connect(server_name, tcp).await?;
            let (read_half, mut write_half) = tokio::io::split(stream);
            send_message(&mut write_half, request).await?;
            let mut reader = BufReader::new(read_half);
            let response: Option<Response> = recv_message(&mut reader).await?;
            Ok::<_, std::io::Error>(response)
        };
        let result = self
            .runtime
            .block_on(tokio::time::timeout(self.request_timeout, fut));
        match result {
            Err(_elapsed) => Err(ClientError::Timeout {
                host: self.host.clone(),
                port: self.port,
            }),
            Ok(Err(io)) => Err(ClientError::Io(io)),
            Ok(Ok(None)) => Err(ClientError::Disconnected),
            Ok(Ok(Some(Response::Error { message }))) => Err(ClientError::Server(message)),
            Ok(Ok(Some(response))) => Ok(response),
        }
    }

    pub fn get_insns(&self) -> Result<Vec<String>, ClientError> {
        match self.call(&Request::GetInsns)? {
            Response::Insns { insns } => Ok(insns),
            other => Err(unexpected("get_insns", &other)),
        }
    }

    pub fn get_num_ports(&self) -> Result<u32, ClientError> {
        match self.call(&Request::GetNumPorts)? {
            Response::NumPorts { num_ports } => Ok(num_ports),
            other => Err(unexpected("get_num_ports", &other)),
        }
    }

    pub fn get_description(&self) -> Result<String, ClientError> {
        match self.call(&Request::GetDescription)? {
            Response::Description { description } => Ok(description),
            other => Err(unexpected("get_description", &other)),
        }
    }

    /// Runs one experiment. Timeouts and dropped connections degrade to a
    /// result with `cycles: None` and the `"connection timeout"` cause so
    /// that callers can decide whether to retry; anything else is an `Err`.
    pub fn run_experiment(
        &self,
        iseq: &[String],
        opts: &RunOptions,
    ) -> Result<ExpResult, ClientError> {
        let request = Request::RunExperiment {
            iseq: iseq.to_vec(),
            opts: opts.clone(),
        };
        match self.call(&request) {
            Ok(Response::ExperimentResult { result }) => Ok(result),
            Ok(other) => Err(unexpected("run_experiment", &other)),
            Err(ClientError::Timeout { .. })
            | Err(ClientError::Disconnected)
            | Err(ClientError::Io(_)) => Ok(ExpResult::failed(MeasureError::Timeout)),
            Err(err) => Err(err),
        }
    }

    /// Asks the server to render (but not run) the measurement loop body.
    pub fn gen_code(
        &self,
        iseq: &[String],
        opts: &RunOptions,
    ) -> Result<(String, u64), ClientError> {
        let request = Request::GenCode {
            iseq: iseq.to_vec(),
            opts: opts.clone(),
        };
        match self.call(&request)? {
            Response::Code {
                code,
                num_testcase_instances,
            } => Ok((code, num_testcase_instances)),
            other => Err(unexpected("gen_code", &other)),
        }
    }
}

fn unexpected(request: &'static str, response: &Response) -> ClientError {
    let got = match response {
        Response::Insns { .. } => "insns",
        Response::NumPorts { .. } => "num_ports",
        Response::Description { .. } => "description",
        Response::ExperimentResult { .. } => "experiment_result",
        Response::Code { .. } => "code",
        Response::Error { .. } => "error",
    };
    ClientError::UnexpectedResponse { request, got }
}
