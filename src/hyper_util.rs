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

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, warn};

use crate::drain::DrainWatcher;

pub fn empty_response(code: hyper::StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::default())
        .expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("builder with known status code should not fail")
}

pub fn http1_server() -> hyper::server::conn::http1::Builder {
    let mut b = hyper::server::conn::http1::Builder::new();
    b.timer(TokioTimer::new());
    b
}

/// Server implements a generic HTTP server with the following behavior:
/// * HTTP/1.1 plaintext only
/// * Draining: on drain, new connections are refused and open ones are shut down gracefully
pub struct Server<S> {
    name: String,
    binds: TcpListener,
    drain_rx: DrainWatcher,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        s: S,
    ) -> anyhow::Result<Self> {
        let binds = TcpListener::bind(addr)
            .await
            .with_context(|| format!("{name} bind {addr}"))?;
        Ok(Server {
            name: name.to_string(),
            binds,
            drain_rx,
            state: Arc::new(s),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.binds
            .local_addr()
            .expect("local address must be ready")
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
    {
        let address = self.address();
        let Server {
            name,
            binds,
            drain_rx,
            state,
        } = self;
        let f = Arc::new(f);
        info!(
            %address,
            component = name.as_str(),
            "listener established",
        );
        let span = tracing::info_span!("server", component = name.as_str());
        tokio::spawn(
            async move {
                let stop = drain_rx.clone().wait_for_drain();
                tokio::pin!(stop);
                loop {
                    let (socket, remote) = tokio::select! {
                        res = binds.accept() => match res {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        },
                        blocker = &mut stop => {
                            info!("starting drain of {name} server");
                            drop(blocker);
                            return;
                        }
                    };
                    debug!(%remote, "accepted connection");
                    let state = state.clone();
                    let f = f.clone();
                    let conn_drain = drain_rx.clone();
                    tokio::spawn(
                        async move {
                            let service = hyper::service::service_fn(move |req| {
                                f(state.clone(), req)
                            });
                            let conn = http1_server()
                                .half_close(true)
                                .header_read_timeout(Duration::from_secs(2))
                                .max_buf_size(8 * 1024)
                                .serve_connection(TokioIo::new(socket), service);
                            tokio::pin!(conn);
                            let res = tokio::select! {
                                res = conn.as_mut() => res,
                                blocker = conn_drain.wait_for_drain() => {
                                    conn.as_mut().graceful_shutdown();
                                    let res = conn.await;
                                    drop(blocker);
                                    res
                                }
                            };
                            if let Err(e) = res {
                                debug!(%remote, "connection closed with error: {e}");
                            }
                        }
                        .in_current_span(),
                    );
                }
            }
            .instrument(span),
        );
    }
}
