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
use std::time::Duration;

use hyper::StatusCode;
use tokio::net::TcpListener;
use tokio::time;

use hangup::config;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use hangup::invoke::{InvocationRequest, Invoker, LambdaClient, Signer};
use hangup::test_helpers::lambda::{Behavior, FakeLambda};
use hangup::test_helpers::*;

async fn app_with(behavior: Behavior) -> (hangup::app::Bound, FakeLambda) {
    helpers::initialize_telemetry();
    let lambda = FakeLambda::spawn(behavior).await.unwrap();
    let cfg = test_config_with_endpoint(Some(lambda.endpoint()));
    let app = hangup::app::build(Arc::new(cfg)).await.unwrap();
    (app, lambda)
}

#[tokio::test]
async fn test_shutdown_lifecycle() {
    let (app, _lambda) = app_with(Behavior::Ok).await;

    let shutdown = app.shutdown.trigger().clone();
    let (app, _shutdown) = tokio::join!(
        time::timeout(Duration::from_secs(5), app.wait_termination()),
        shutdown.shutdown_now()
    );
    app.expect("app shuts down")
        .expect("app exits without error")
}

// Check that port conflicts on any address results in the app failing instead of silently failing
async fn test_bind_conflict<F: FnOnce(&mut config::Config) -> &mut SocketAddr>(f: F) {
    helpers::initialize_telemetry();
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = test_config();
    let sa = f(&mut cfg);
    *sa = l.local_addr().unwrap();

    assert!(hangup::app::build(Arc::new(cfg)).await.is_err());
}

#[tokio::test]
async fn test_conflicting_bind_error_frontend() {
    test_bind_conflict(|c| &mut c.frontend_addr).await;
}

#[tokio::test]
async fn test_conflicting_bind_error_stats() {
    test_bind_conflict(|c| &mut c.stats_addr).await;
}

#[tokio::test]
async fn test_health() {
    for behavior in [Behavior::Ok, Behavior::Reset] {
        let (app, _lambda) = app_with(behavior).await;
        let (status, body) = helpers::get(app.frontend_address, "/health").await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}

#[tokio::test]
async fn test_demo_success() {
    let (app, lambda) = app_with(Behavior::Ok).await;
    let (status, body) = helpers::get(app.frontend_address, "/demo").await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");

    let expected = InvocationRequest::demo(TEST_FUNCTION_ARN);
    let requests = lambda.requests();
    assert!(!requests.is_empty());
    for r in requests {
        assert_eq!(r.method, "POST");
        assert_eq!(
            r.path,
            format!("/2015-03-31/functions/{TEST_FUNCTION_ARN}/invocations")
        );
        assert_eq!(r.header("x-amz-invocation-type"), Some("RequestResponse"));
        assert_eq!(r.header("x-amz-client-context"), Some(expected.client_context()));
        assert_eq!(&r.body, expected.payload());
        assert_eq!(r.header("authorization"), None);
    }
}

#[tokio::test]
async fn test_signed_requests_carry_sigv4_headers() {
    helpers::initialize_telemetry();
    let lambda = FakeLambda::spawn(Behavior::Ok).await.unwrap();
    let cfg = test_config_with_endpoint(Some(lambda.endpoint()));
    let credentials = Credentials::new(
        "AKIDEXAMPLE",
        "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
        Some("session-token".to_string()),
        None,
        "test",
    );
    let client = LambdaClient::new(&cfg)
        .unwrap()
        .with_signer(Signer::new(
            SharedCredentialsProvider::new(credentials),
            "us-east-1",
        ));

    let request = InvocationRequest::demo(TEST_FUNCTION_ARN);
    for _ in 0..2 {
        client.invoke(&request).await.unwrap();
    }

    let requests = lambda.requests();
    assert_eq!(requests.len(), 2);
    for r in requests {
        let auth = r.header("authorization").unwrap();
        assert!(
            auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"),
            "{auth}"
        );
        assert!(auth.contains("/us-east-1/lambda/aws4_request"), "{auth}");
        assert!(r.header("x-amz-date").is_some());
        assert_eq!(r.header("x-amz-security-token"), Some("session-token"));
        assert_eq!(r.header("x-amz-invocation-type"), Some("RequestResponse"));
        assert_eq!(&r.body, request.payload());
    }
}

#[tokio::test]
async fn test_demo_function_error_is_still_a_result() {
    let (app, _lambda) = app_with(Behavior::FunctionError).await;
    let (status, body) = helpers::get(app.frontend_address, "/demo").await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_demo_reset() {
    let (app, _lambda) = app_with(Behavior::Reset).await;
    let (status, body) = helpers::get(app.frontend_address, "/demo").await.unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "ECONNRESET received");
}

#[tokio::test]
async fn test_demo_other_failure() {
    let (app, _lambda) = app_with(Behavior::Status(StatusCode::TOO_MANY_REQUESTS)).await;
    let (status, body) = helpers::get(app.frontend_address, "/demo").await.unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "unknown error");
}

#[tokio::test]
async fn test_unknown_path() {
    let (app, _lambda) = app_with(Behavior::Ok).await;
    let (status, _) = helpers::get(app.frontend_address, "/nope").await.unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
}

async fn scrape(addr: SocketAddr) -> String {
    helpers::get(addr, "/stats/prometheus")
        .await
        .map(|(_, body)| body)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_driver_runs_schedule() {
    let (app, lambda) = app_with(Behavior::Ok).await;
    let total = test_schedule().total_calls();

    let lambda = &lambda;
    assert_eventually(
        Duration::from_secs(5),
        || async move { lambda.requests().len() },
        total,
    )
    .await;
    assert_eq!(app.driver.issued(), total as u64);

    let stats = app.stats_address;
    assert_eventually(
        Duration::from_secs(5),
        || async move {
            let body = scrape(stats).await;
            (
                body.contains("hangup_invocations_total{phase=\"warmup\",outcome=\"success\"} 10"),
                body.contains("hangup_invocations_total{phase=\"probe\",outcome=\"success\"} 3"),
            )
        },
        (true, true),
    )
    .await;
}

#[tokio::test]
async fn test_driver_counts_resets() {
    let (app, _lambda) = app_with(Behavior::Reset).await;
    let stats = app.stats_address;
    assert_eventually(
        Duration::from_secs(5),
        || async move {
            let body = scrape(stats).await;
            (
                body.contains(
                    "hangup_invocations_total{phase=\"warmup\",outcome=\"connection_reset\"} 10",
                ),
                body.contains(
                    "hangup_invocations_total{phase=\"probe\",outcome=\"connection_reset\"} 3",
                ),
            )
        },
        (true, true),
    )
    .await;
}
