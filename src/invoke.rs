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

use std::fmt::{self, Write};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use aws_credential_types::provider::error::CredentialsError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::Uri;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use rustls::ClientConfig;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;

mod classify;
mod sign;
pub use classify::*;
pub use sign::Signer;

const API_VERSION: &str = "2015-03-31";
const CLIENT_CONTEXT_NAME: &str = "demo-issue-fargate";

const INVOCATION_TYPE_HEADER: &str = "x-amz-invocation-type";
const CLIENT_CONTEXT_HEADER: &str = "x-amz-client-context";
const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no invocation target configured (set LAMBDA_ARN, or LAMBDA_ENDPOINT/AWS_REGION)")]
    MissingTarget,
    #[error("invalid invocation target {0:?}: {1}")]
    InvalidTarget(String, http::Error),
    #[error("request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("reading response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("lambda returned {0}: {1}")]
    Status(StatusCode, String),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("signing request: {0}")]
    Signing(String),
    #[error("loading credentials: {0}")]
    Credentials(#[from] CredentialsError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum InvocationType {
    RequestResponse,
    Event,
    DryRun,
}

impl InvocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationType::RequestResponse => "RequestResponse",
            InvocationType::Event => "Event",
            InvocationType::DryRun => "DryRun",
        }
    }
}

#[derive(Serialize)]
struct ClientContext<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DemoPayload<'a> {
    body: &'a str,
    path: &'a str,
    http_method: &'a str,
}

/// InvocationRequest is the fixed request sent on every call. It is built once and only read
/// afterwards, so every call carries byte-identical content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationRequest {
    function_name: String,
    client_context: String,
    invocation_type: InvocationType,
    payload: Bytes,
}

impl InvocationRequest {
    /// demo builds the request used by both the driver and the manual endpoint.
    pub fn demo(function_name: impl Into<String>) -> Self {
        let context = serde_json::to_vec_pretty(&ClientContext {
            name: CLIENT_CONTEXT_NAME,
        })
        .expect("static context serializes");
        let payload = serde_json::to_vec_pretty(&DemoPayload {
            body: "testing",
            path: "/demo/issue",
            http_method: "GET",
        })
        .expect("static payload serializes");
        InvocationRequest {
            function_name: function_name.into(),
            client_context: STANDARD.encode(context),
            invocation_type: InvocationType::RequestResponse,
            payload: Bytes::from(payload),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn client_context(&self) -> &str {
        &self.client_context
    }

    pub fn invocation_type(&self) -> InvocationType {
        self.invocation_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[derive(Clone, Debug, Default)]
pub struct InvokeResponse {
    pub status: u16,
    /// Set when the function itself failed; the call still counts as a result.
    pub function_error: Option<String>,
    pub payload: Bytes,
}

/// Invoker issues a single remote invocation.
#[async_trait::async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, req: &InvocationRequest) -> Result<InvokeResponse, Error>;
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ConnectionReset,
    OtherFailure,
}

impl Outcome {
    pub fn classify<T>(res: &Result<T, Error>, classifier: &dyn ResetClassifier) -> Outcome {
        match res {
            Ok(_) => Outcome::Success,
            Err(e) if classifier.is_reset(e) => Outcome::ConnectionReset,
            Err(_) => Outcome::OtherFailure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ConnectionReset => "connection_reset",
            Outcome::OtherFailure => "other_failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EncodeLabelValue for Outcome {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        writer.write_str(self.as_str())
    }
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// PoolSettings are the connection pool knobs applied to the shared client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// None keeps idle connections until the peer closes them.
    pub idle_timeout: Option<Duration>,
    /// Whether a request whose pooled connection was closed before it was sent is silently
    /// resent on a new one. Off, so a stale connection surfaces as a failed call.
    pub retry_canceled: bool,
}

impl PoolSettings {
    pub fn new(cfg: &Config) -> Self {
        PoolSettings {
            idle_timeout: cfg.pool_idle_timeout,
            retry_canceled: false,
        }
    }

    fn apply(&self, builder: &mut hyper_util::client::legacy::Builder) {
        builder
            .pool_idle_timeout(self.idle_timeout)
            .retry_canceled_requests(self.retry_canceled)
            .pool_timer(hyper_util::rt::TokioTimer::new());
    }
}

/// LambdaClient invokes functions over the Lambda Invoke API.
///
/// A single client (and so a single connection pool) is meant to be shared by every caller in the
/// process; idle connections are reused for as long as the pool allows.
#[derive(Clone)]
pub struct LambdaClient {
    endpoint: Option<Uri>,
    client: HttpsClient,
    signer: Option<Arc<Signer>>,
}

impl LambdaClient {
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let endpoint = match resolve_endpoint(cfg) {
            Some(ep) => Some(
                Uri::try_from(ep.as_str())
                    .map_err(|e| Error::InvalidTarget(ep.clone(), e.into()))?,
            ),
            None => {
                warn!("no lambda endpoint could be resolved, invocations will fail");
                None
            }
        };

        let mut http = HttpConnector::new();
        http.set_keepalive(cfg.tcp_keepalive);
        http.set_nodelay(true);
        http.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(client_config()?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let mut builder = Client::builder(hyper_util::rt::TokioExecutor::new());
        PoolSettings::new(cfg).apply(&mut builder);
        let client = builder.build(https);

        Ok(LambdaClient {
            endpoint,
            client,
            signer: None,
        })
    }

    /// Signs every request with the given signer. Without one, requests go out unsigned.
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    fn uri(&self, req: &InvocationRequest) -> Result<Uri, Error> {
        let endpoint = self.endpoint.as_ref().ok_or(Error::MissingTarget)?;
        if req.function_name().is_empty() {
            return Err(Error::MissingTarget);
        }
        let base = endpoint.to_string();
        let uri = format!(
            "{}/{API_VERSION}/functions/{}/invocations",
            base.trim_end_matches('/'),
            req.function_name()
        );
        Uri::try_from(uri.as_str()).map_err(|e| Error::InvalidTarget(uri, e.into()))
    }
}

#[async_trait::async_trait]
impl Invoker for LambdaClient {
    async fn invoke(&self, req: &InvocationRequest) -> Result<InvokeResponse, Error> {
        let uri = self.uri(req)?;
        let mut request = hyper::Request::post(uri.clone())
            .header(INVOCATION_TYPE_HEADER, req.invocation_type().as_str())
            .header(CLIENT_CONTEXT_HEADER, req.client_context())
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(req.payload().clone()))
            .map_err(|e| Error::InvalidTarget(uri.to_string(), e))?;
        if let Some(signer) = &self.signer {
            signer.sign(&mut request, req.payload()).await?;
        }

        let response = self.client.request(request).await?;
        let status = response.status();
        let function_error = response
            .headers()
            .get(FUNCTION_ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let payload = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(Error::Status(
                status,
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }
        if let Some(fe) = &function_error {
            warn!(function_error = fe, "function returned an error payload");
        }
        debug!(status = status.as_u16(), bytes = payload.len(), "invocation complete");
        Ok(InvokeResponse {
            status: status.as_u16(),
            function_error,
            payload,
        })
    }
}

fn resolve_endpoint(cfg: &Config) -> Option<String> {
    if let Some(ep) = &cfg.lambda_endpoint {
        return Some(ep.clone());
    }
    cfg.lambda_arn
        .as_deref()
        .and_then(region_from_arn)
        .or(cfg.region.as_deref())
        .map(|region| format!("https://lambda.{region}.amazonaws.com"))
}

/// Extracts the region from `arn:aws:lambda:{region}:{account}:function:{name}`.
fn region_from_arn(arn: &str) -> Option<&str> {
    let mut parts = arn.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("arn"), Some(_), Some("lambda"), Some(region)) if !region.is_empty() => Some(region),
        _ => None,
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    #[cfg(feature = "tls-aws-lc")]
    let p = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
    let p = rustls::crypto::ring::default_provider();
    Arc::new(p)
}

fn client_config() -> Result<ClientConfig, Error> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!("failed to load a native root certificate: {err}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded native root certificates");
    Ok(ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn demo_request_content() {
        let req = InvocationRequest::demo("arn:aws:lambda:us-east-1:123456789012:function:hello");
        assert_eq!(
            std::str::from_utf8(req.payload()).unwrap(),
            "{\n  \"body\": \"testing\",\n  \"path\": \"/demo/issue\",\n  \"httpMethod\": \"GET\"\n}"
        );
        let ctx = STANDARD.decode(req.client_context()).unwrap();
        assert_eq!(
            std::str::from_utf8(&ctx).unwrap(),
            "{\n  \"name\": \"demo-issue-fargate\"\n}"
        );
        assert_eq!(req.invocation_type().as_str(), "RequestResponse");
    }

    #[test]
    fn demo_request_is_stable() {
        let a = InvocationRequest::demo("fn");
        let b = InvocationRequest::demo("fn");
        assert_eq!(a, b);
        assert_eq!(a.payload(), b.payload());
    }

    #[test]
    fn arn_region() {
        assert_eq!(
            region_from_arn("arn:aws:lambda:eu-west-1:123456789012:function:hello"),
            Some("eu-west-1")
        );
        assert_eq!(region_from_arn("hello"), None);
        assert_eq!(region_from_arn("arn:aws:s3:::bucket"), None);
        assert_eq!(region_from_arn("arn:aws:lambda::123:function:x"), None);
    }

    #[test]
    fn endpoint_resolution() {
        let mut cfg = crate::config::Config {
            lambda_arn: Some("arn:aws:lambda:us-west-2:1:function:f".to_string()),
            region: Some("eu-central-1".to_string()),
            ..crate::config::parse_config().unwrap()
        };
        assert_eq!(
            resolve_endpoint(&cfg).as_deref(),
            Some("https://lambda.us-west-2.amazonaws.com")
        );
        cfg.lambda_arn = Some("not-an-arn".to_string());
        assert_eq!(
            resolve_endpoint(&cfg).as_deref(),
            Some("https://lambda.eu-central-1.amazonaws.com")
        );
        cfg.lambda_endpoint = Some("http://127.0.0.1:9001".to_string());
        assert_eq!(resolve_endpoint(&cfg).as_deref(), Some("http://127.0.0.1:9001"));
        cfg.lambda_endpoint = None;
        cfg.region = None;
        assert_eq!(resolve_endpoint(&cfg), None);
    }

    #[tokio::test]
    async fn missing_target_fails_at_call_time() {
        let cfg = crate::config::Config {
            lambda_arn: None,
            lambda_endpoint: None,
            region: None,
            ..crate::config::parse_config().unwrap()
        };
        let client = LambdaClient::new(&cfg).unwrap();
        let res = client.invoke(&InvocationRequest::demo("")).await;
        assert!(matches!(res, Err(Error::MissingTarget)));
        assert_eq!(
            Outcome::classify(&res, &TransportReset),
            Outcome::OtherFailure
        );
    }

    #[test]
    fn pool_settings() {
        let cfg = crate::config::Config {
            pool_idle_timeout: Some(Duration::from_secs(30)),
            ..crate::config::parse_config().unwrap()
        };
        assert_eq!(
            PoolSettings::new(&cfg),
            PoolSettings {
                idle_timeout: Some(Duration::from_secs(30)),
                retry_canceled: false,
            }
        );
        let cfg = crate::config::Config {
            pool_idle_timeout: None,
            ..cfg
        };
        assert_eq!(PoolSettings::new(&cfg).idle_timeout, None);
        assert!(!PoolSettings::new(&cfg).retry_canceled);
    }

    #[test]
    fn invocation_uri() {
        let cfg = crate::config::Config {
            lambda_endpoint: Some("http://127.0.0.1:9001/".to_string()),
            ..crate::config::parse_config().unwrap()
        };
        let client = LambdaClient::new(&cfg).unwrap();
        let uri = client
            .uri(&InvocationRequest::demo(
                "arn:aws:lambda:us-east-1:1:function:hello",
            ))
            .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://127.0.0.1:9001/2015-03-31/functions/arn:aws:lambda:us-east-1:1:function:hello/invocations"
        );
    }
}
