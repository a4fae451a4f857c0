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
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use tracing::{Instrument, Span, error, info};

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util::{Server, empty_response, plaintext_response};
use crate::invoke::{InvocationRequest, Invoker, Outcome, ResetClassifier};
use crate::metrics::{IncrementRecorder, Invocation, Metrics, Phase};

pub const RESET_BODY: &str = "ECONNRESET received";
pub const UNKNOWN_BODY: &str = "unknown error";

/// State shared by every front end request. Nothing in it changes after startup.
pub struct Frontend {
    invoker: Arc<dyn Invoker>,
    classifier: Arc<dyn ResetClassifier>,
    request: InvocationRequest,
    metrics: Arc<Metrics>,
    span: Span,
}

impl Frontend {
    pub fn new(
        config: &Config,
        invoker: Arc<dyn Invoker>,
        classifier: Arc<dyn ResetClassifier>,
        metrics: Arc<Metrics>,
        span: Span,
    ) -> Self {
        Frontend {
            invoker,
            classifier,
            request: InvocationRequest::demo(config.lambda_arn.clone().unwrap_or_default()),
            metrics,
            span,
        }
    }
}

pub struct Service {
    s: Server<Frontend>,
}

impl Service {
    pub async fn new(
        config: &Config,
        frontend: Frontend,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        Server::<Frontend>::bind("frontend", config.frontend_addr, drain_rx, frontend)
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|frontend, req| async move {
            let span = frontend.span.clone();
            Ok(handle(&frontend, req).instrument(span).await)
        })
    }
}

enum Route {
    Health,
    Demo,
    NotAllowed,
    NotFound,
}

fn route<B>(req: &Request<B>) -> Route {
    match (req.uri().path(), req.method()) {
        ("/health", &hyper::Method::GET | &hyper::Method::HEAD) => Route::Health,
        ("/demo", &hyper::Method::GET) => Route::Demo,
        ("/health" | "/demo", _) => Route::NotAllowed,
        _ => Route::NotFound,
    }
}

async fn handle<B>(frontend: &Frontend, req: Request<B>) -> Response<Full<Bytes>> {
    match route(&req) {
        Route::Health => handle_health(),
        Route::Demo => handle_demo(frontend).await,
        Route::NotAllowed => empty_response(StatusCode::METHOD_NOT_ALLOWED),
        Route::NotFound => empty_response(StatusCode::NOT_FOUND),
    }
}

fn handle_health() -> Response<Full<Bytes>> {
    plaintext_response(StatusCode::OK, "OK".to_string())
}

async fn handle_demo(frontend: &Frontend) -> Response<Full<Bytes>> {
    info!("manual call invoked");
    let res = frontend.invoker.invoke(&frontend.request).await;
    let outcome = Outcome::classify(&res, frontend.classifier.as_ref());
    frontend.metrics.increment(&Invocation {
        phase: Phase::Manual,
        outcome,
    });
    match (outcome, res) {
        (Outcome::Success, _) => {
            info!("successful manual invocation");
            plaintext_response(StatusCode::OK, "OK".to_string())
        }
        (Outcome::ConnectionReset, _) => {
            error!("failed with ECONNRESET");
            plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, RESET_BODY.to_string())
        }
        (Outcome::OtherFailure, res) => {
            error!(
                error = res.err().map(tracing::field::display),
                "manual invocation failed"
            );
            plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, UNKNOWN_BODY.to_string())
        }
    }
}

#[cfg(test)]
mod test {
    use http_body_util::BodyExt;

    use super::*;
    use crate::invoke::TransportReset;
    use crate::test_helpers::invoker::{FakeInvoker, Script};

    fn frontend(script: Script) -> (Frontend, Arc<FakeInvoker>, Arc<Metrics>) {
        let fake = Arc::new(FakeInvoker::new(script));
        let metrics = Arc::new(Metrics::default());
        let cfg = crate::test_helpers::test_config();
        let f = Frontend::new(
            &cfg,
            fake.clone(),
            Arc::new(TransportReset),
            metrics.clone(),
            Span::none(),
        );
        (f, fake, metrics)
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_of(resp: Response<Full<Bytes>>) -> (StatusCode, String) {
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_never_touches_invoker() {
        for script in [Script::AlwaysSucceed, Script::AlwaysReset, Script::AlwaysFail] {
            let (f, fake, _) = frontend(script);
            let (status, body) = body_of(handle(&f, get("/health")).await).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "OK");
            assert!(fake.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn demo_outcomes() {
        let cases = [
            (Script::AlwaysSucceed, StatusCode::OK, "OK", Outcome::Success),
            (
                Script::AlwaysReset,
                StatusCode::INTERNAL_SERVER_ERROR,
                RESET_BODY,
                Outcome::ConnectionReset,
            ),
            (
                Script::AlwaysFail,
                StatusCode::INTERNAL_SERVER_ERROR,
                UNKNOWN_BODY,
                Outcome::OtherFailure,
            ),
        ];
        for (script, want_status, want_body, want_outcome) in cases {
            let (f, fake, metrics) = frontend(script);
            let (status, body) = body_of(handle(&f, get("/demo")).await).await;
            assert_eq!(status, want_status);
            assert_eq!(body, want_body);
            assert_eq!(fake.calls().len(), 1);
            assert_eq!(metrics.invocations(Phase::Manual, want_outcome), 1);
        }
    }

    #[tokio::test]
    async fn demo_sends_the_driver_request() {
        let (f, fake, _) = frontend(Script::AlwaysSucceed);
        handle(&f, get("/demo")).await;
        let cfg = crate::test_helpers::test_config();
        let expected = InvocationRequest::demo(cfg.lambda_arn.unwrap_or_default());
        assert_eq!(fake.calls()[0].request, expected);
    }

    #[tokio::test]
    async fn routing() {
        let (f, _, _) = frontend(Script::AlwaysSucceed);
        let resp = handle(&f, get("/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let post = Request::builder()
            .method(hyper::Method::POST)
            .uri("/demo")
            .body(())
            .unwrap();
        assert_eq!(
            handle(&f, post).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
