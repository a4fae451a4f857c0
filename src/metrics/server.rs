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

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util;

pub struct Server {
    s: hyper_util::Server<Mutex<Registry>>,
}

impl Server {
    pub async fn new(
        config: &Config,
        drain_rx: DrainWatcher,
        registry: Registry,
    ) -> anyhow::Result<Self> {
        hyper_util::Server::<Mutex<Registry>>::bind(
            "stats",
            config.stats_addr,
            drain_rx,
            Mutex::new(registry),
        )
        .await
        .map(|s| Server { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|registry, req| async move {
            match req.uri().path() {
                "/metrics" | "/stats/prometheus" => Ok(handle_metrics(registry, req)),
                _ => Ok(hyper_util::empty_response(hyper::StatusCode::NOT_FOUND)),
            }
        })
    }
}

fn handle_metrics<T>(reg: Arc<Mutex<Registry>>, req: Request<T>) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    let encoded = match reg.lock() {
        Ok(reg) => encode(&mut buf, &reg).map_err(|e| e.to_string()),
        Err(_) => Err("registry lock poisoned".to_string()),
    };
    if let Err(err) = encoded {
        return hyper_util::plaintext_response(hyper::StatusCode::INTERNAL_SERVER_ERROR, err);
    }

    Response::builder()
        .status(hyper::StatusCode::OK)
        .header(
            hyper::header::CONTENT_TYPE,
            ContentType::negotiate(req.headers()).as_str(),
        )
        .body(buf.into())
        .expect("builder with known status code should not fail")
}

/// The exposition formats a scraper can ask for through `Accept`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContentType {
    PlainText,
    OpenMetrics,
}

impl ContentType {
    /// Picks OpenMetrics if any Accept value names it, plain text otherwise.
    fn negotiate(headers: &http::HeaderMap) -> Self {
        let wants_openmetrics = headers
            .get_all(http::header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|v| v.split(';').next())
            .any(|media| media.trim().eq_ignore_ascii_case("application/openmetrics-text"));
        if wants_openmetrics {
            ContentType::OpenMetrics
        } else {
            ContentType::PlainText
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ContentType::PlainText => "text/plain; charset=utf-8",
            ContentType::OpenMetrics => "application/openmetrics-text;charset=utf-8;version=1.0.0",
        }
    }
}

#[cfg(test)]
mod test {
    use http_body_util::BodyExt;

    use super::*;
    use crate::invoke::Outcome;
    use crate::metrics::{IncrementRecorder, Invocation, Metrics, Phase};

    fn negotiate(accept: &[&str]) -> ContentType {
        let mut req = http::Request::builder();
        for v in accept {
            req = req.header(http::header::ACCEPT, *v);
        }
        ContentType::negotiate(req.body(()).unwrap().headers())
    }

    #[test]
    fn accept_negotiation() {
        assert_eq!(negotiate(&[]), ContentType::PlainText);
        assert_eq!(negotiate(&["application/json"]), ContentType::PlainText);
        assert_eq!(
            negotiate(&["application/json", "application/openmetrics-text; version=1.0.0"]),
            ContentType::OpenMetrics
        );
        assert_eq!(
            negotiate(&["text/plain;q=0.5, application/openmetrics-text;q=1"]),
            ContentType::OpenMetrics
        );
        assert_eq!(
            ContentType::OpenMetrics.as_str(),
            "application/openmetrics-text;charset=utf-8;version=1.0.0"
        );
    }

    #[tokio::test]
    async fn serves_invocation_counters() {
        let mut registry = Registry::default();
        let metrics = Metrics::from(&mut registry);
        metrics.increment(&Invocation {
            phase: Phase::Manual,
            outcome: Outcome::OtherFailure,
        });

        let resp = handle_metrics(Arc::new(Mutex::new(registry)), http::Request::new(()));
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(
            body.contains("hangup_invocations_total{phase=\"manual\",outcome=\"other_failure\"} 1"),
            "{body}"
        );
    }
}
