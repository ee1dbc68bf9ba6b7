//! The RPC surface of the measurement server.
//!
//! Connections are accepted concurrently, but the driver sits behind a
//! mutex: the pinned core, the compiler invocation and the benchmark
//! source/binary paths are all exclusive resources, so experiments run
//! strictly one at a time.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use portbench_rpc::proto::{recv_message, send_message, Request, Response};
use portbench_rpc::tls::{self, SslInfo, TlsError};

use crate::driver::Driver;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub async fn serve(driver: Driver, port: u16, ssl: &SslInfo) -> Result<(), ServeError> {
    let config = tls::server_config(ssl)?;
    let acceptor = TlsAcceptor::from(config);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let driver = Arc::new(Mutex::new(driver));
    log::info!("listening on port {port}");

    loop {
        let (tcp, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let driver = driver.clone();
        tokio::spawn(async move {
            log::info!("opened connection from {peer}");
            match acceptor.accept(tcp).await {
                Ok(stream) => {
                    if let Err(err) = handle_connection(stream, driver).await {
                        log::warn!("connection from {peer} failed: {err}");
                    }
                }
                Err(err) => log::warn!("TLS handshake with {peer} failed: {err}"),
            }
            log::info!("closed connection from {peer}");
        });
    }
}

async fn handle_connection(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    driver: Arc<Mutex<Driver>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    while let Some(request) = recv_message::<_, Request>(&mut reader).await? {
        let response = dispatch(request, &driver).await;
        send_message(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn dispatch(request: Request, driver: &Arc<Mutex<Driver>>) -> Response {
    match request {
        Request::GetInsns => {
            log::info!("handling request for the instruction list");
            Response::Insns {
                insns: driver.lock().unwrap().insns(),
            }
        }
        Request::GetNumPorts => {
            log::info!("handling request for the port count");
            Response::NumPorts {
                num_ports: driver.lock().unwrap().num_ports(),
            }
        }
        Request::GetDescription => {
            log::info!("handling request for the description");
            Response::Description {
                description: driver.lock().unwrap().description(),
            }
        }
        Request::RunExperiment { iseq, opts } => {
            log::info!("handling experiment of length {}", iseq.len());
            let driver = driver.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                driver.lock().unwrap().run_experiment(&iseq, &opts)
            })
            .await;
            match outcome {
                Ok(Ok(result)) => Response::ExperimentResult { result },
                Ok(Err(err)) => Response::Error {
                    message: err.to_string(),
                },
                Err(join_err) => Response::Error {
                    message: format!("experiment task failed: {join_err}"),
                },
            }
        }
        Request::GenCode { iseq, opts } => {
            log::info!("handling code generation for a sequence of length {}", iseq.len());
            let driver = driver.clone();
            let outcome =
                tokio::task::spawn_blocking(move || driver.lock().unwrap().gen_code(&iseq, &opts))
                    .await;
            match outcome {
                Ok(Ok((code, num_testcase_instances))) => Response::Code {
                    code,
                    num_testcase_instances,
                },
                Ok(Err(err)) => Response::Error {
                    message: err.to_string(),
                },
                Err(join_err) => Response::Error {
                    message: format!("code generation task failed: {join_err}"),
                },
            }
        }
    }
}
