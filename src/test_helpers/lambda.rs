// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A local stand-in for the Lambda Invoke API, listening on plain HTTP.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::hyper_util::http1_server;

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Answers 200 with a small JSON payload.
    Ok,
    /// Answers 200 but flags the function as failed.
    FunctionError,
    Status(StatusCode),
    /// Reads the whole request, then aborts the connection with a TCP RST.
    Reset,
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Every header as received, names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct FakeLambda {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeLambda {
    pub async fn spawn(behavior: Behavior) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("fake lambda accept failed: {e}");
                        continue;
                    }
                };
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let res = match behavior {
                        Behavior::Reset => reset_connection(socket, recorded).await,
                        _ => serve(socket, behavior, recorded).await,
                    };
                    if let Err(e) = res {
                        debug!("fake lambda connection ended: {e}");
                    }
                });
            }
        });
        Ok(FakeLambda { addr, requests })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(
    socket: TcpStream,
    behavior: Behavior,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> anyhow::Result<()> {
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let recorded = recorded.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
            let headers = parts
                .headers
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect();
            recorded.lock().unwrap().push(RecordedRequest {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                headers,
                body,
            });
            Ok::<_, Infallible>(respond(behavior))
        }
    });
    http1_server()
        .serve_connection(TokioIo::new(socket), service)
        .await?;
    Ok(())
}

fn respond(behavior: Behavior) -> Response<Full<Bytes>> {
    let builder = Response::builder().header(hyper::header::CONTENT_TYPE, "application/json");
    let resp = match behavior {
        Behavior::Ok => builder
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"{\"statusCode\":200}"))),
        Behavior::FunctionError => builder
            .status(StatusCode::OK)
            .header("x-amz-function-error", "Unhandled")
            .body(Full::new(Bytes::from_static(
                b"{\"errorMessage\":\"boom\",\"errorType\":\"Error\"}",
            ))),
        Behavior::Status(code) => builder
            .status(code)
            .body(Full::new(Bytes::from_static(b"{\"message\":\"Rate Exceeded.\"}"))),
        Behavior::Reset => builder.status(StatusCode::OK).body(Full::default()),
    };
    resp.expect("builder with known status code should not fail")
}

/// Reads one request off the socket and closes it with SO_LINGER 0, so the peer sees a RST.
async fn reset_connection(
    mut socket: TcpStream,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let (head_len, content_length) = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before a full request arrived");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            break (end, content_length(&buf[..end]));
        }
    };
    while buf.len() < head_len + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf[..head_len]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split(' ');
    recorded.lock().unwrap().push(RecordedRequest {
        method: request_line.next().unwrap_or_default().to_string(),
        path: request_line.next().unwrap_or_default().to_string(),
        headers: lines
            .filter_map(|line| {
                let (k, v) = line.split_once(':')?;
                Some((k.trim().to_ascii_lowercase(), v.trim().to_string()))
            })
            .collect(),
        body: Bytes::copy_from_slice(&buf[head_len..]),
    });

    socket2::SockRef::from(&socket).set_linger(Some(Duration::ZERO))?;
    drop(socket);
    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &[u8]) -> usize {
    head_value(&String::from_utf8_lossy(head), "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn head_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim()
            .eq_ignore_ascii_case(name)
            .then(|| v.trim().to_string())
    })
}
