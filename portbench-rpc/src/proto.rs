use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize as DeriveDe, Serialize as DeriveSer};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use port_mapping::experiment::ExpResult;

/// Optional per-experiment overrides for the benchmark driver. Absent
/// fields fall back to the server's calibrated defaults.
#[derive(Debug, Clone, Default, PartialEq, DeriveSer, DeriveDe)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_insns_per_iteration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_total_dynamic_insns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_time_us: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uncertainty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, DeriveSer, DeriveDe)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    GetInsns,
    GetNumPorts,
    GetDescription,
    RunExperiment {
        iseq: Vec<String>,
        #[serde(flatten)]
        opts: RunOptions,
    },
    GenCode {
        iseq: Vec<String>,
        #[serde(flatten)]
        opts: RunOptions,
    },
}

#[derive(Debug, Clone, PartialEq, DeriveSer, DeriveDe)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Insns { insns: Vec<String> },
    NumPorts { num_ports: u32 },
    Description { description: String },
    ExperimentResult { result: ExpResult },
    Code {
        code: String,
        num_testcase_instances: u64,
    },
    Error { message: String },
}

/// Writes one message as a single JSON line.
pub async fn send_message<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Reads one JSON-line message. `Ok(None)` means the peer closed the
/// connection cleanly.
pub async fn recv_message<R, T>(reader: &mut BufReader<R>) -> std::io::Result<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let msg = serde_json::from_str(line.trim_end())?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip() {
        let reqs = vec![
            Request::GetInsns,
            Request::GetNumPorts,
            Request::GetDescription,
            Request::RunExperiment {
                iseq: vec!["add".to_owned(), "mul".to_owned()],
                opts: RunOptions {
                    repetitions: Some(5),
                    target_time_us: Some(10000.0),
                    ..Default::default()
                },
            },
            Request::GenCode {
                iseq: vec!["add".to_owned()],
                opts: RunOptions::default(),
            },
        ];
        for req in reqs {
            let s = serde_json::to_string(&req).unwrap();
            let back: Request = serde_json::from_str(&s).unwrap();
            assert_eq!(back, req);
        }
    }

    #[test]
    fn responses_round_trip() {
        let resps = vec![
            Response::Insns {
                insns: vec!["add".to_owned()],
            },
            Response::NumPorts { num_ports: 8 },
            Response::Description {
                description: "x86_64 processor".to_owned(),
            },
            Response::ExperimentResult {
                result: ExpResult::ok(2.5),
            },
            Response::Code {
                code: "add rbx, rsi, 44".to_owned(),
                num_testcase_instances: 50,
            },
            Response::Error {
                message: "no such instruction".to_owned(),
            },
        ];
        for resp in resps {
            let s = serde_json::to_string(&resp).unwrap();
            let back: Response = serde_json::from_str(&s).unwrap();
            assert_eq!(back, resp);
        }
    }

    #[test]
    fn run_options_flatten_into_the_request_object() {
        let req = Request::RunExperiment {
            iseq: vec!["a".to_owned()],
            opts: RunOptions {
                max_uncertainty: Some(0.05),
                ..Default::default()
            },
        };
        let v: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v["op"], "run_experiment");
        assert_eq!(v["max_uncertainty"], 0.05);
        assert!(v.get("repetitions").is_none());
    }

    #[tokio::test]
    async fn line_codec_round_trips() {
        let mut buf = Vec::new();
        send_message(&mut buf, &Request::GetNumPorts).await.unwrap();
        send_message(&mut buf, &Request::GetInsns).await.unwrap();
        let mut reader = BufReader::new(buf.as_slice());
        let a: Request = recv_message(&mut reader).await.unwrap().unwrap();
        let b: Request = recv_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(a, Request::GetNumPorts);
        assert_eq!(b, Request::GetInsns);
        let eof: Option<Request> = recv_message(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }
}
