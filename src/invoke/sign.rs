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

use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use tokio::sync::Mutex;

use super::{Error, region_from_arn};
use crate::config::Config;

const SERVICE: &str = "lambda";

/// Credentials this close to expiry are fetched again before signing.
const REFRESH_BEFORE_EXPIRY: Duration = Duration::from_secs(300);

/// Signer adds SigV4 authentication to Lambda API requests.
///
/// Credentials come from a provider (normally the default chain: environment, profile, ECS
/// container or instance metadata) and are cached until they near expiry.
pub struct Signer {
    provider: SharedCredentialsProvider,
    region: String,
    cached: Mutex<Option<Credentials>>,
}

impl Signer {
    pub fn new(provider: SharedCredentialsProvider, region: impl Into<String>) -> Self {
        Signer {
            provider,
            region: region.into(),
            cached: Mutex::new(None),
        }
    }

    /// Loads the default credential chain. The signing region is taken from the target ARN, then
    /// `AWS_REGION`, then whatever the chain resolves. Returns None if no credentials provider
    /// or no region could be found.
    pub async fn from_env(cfg: &Config) -> Option<Self> {
        let sdk = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let region = cfg
            .lambda_arn
            .as_deref()
            .and_then(region_from_arn)
            .map(str::to_string)
            .or_else(|| cfg.region.clone())
            .or_else(|| sdk.region().map(|r| r.to_string()))?;
        let provider = sdk.credentials_provider()?;
        Some(Signer::new(provider, region))
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn credentials(&self) -> Result<Credentials, Error> {
        let mut cached = self.cached.lock().await;
        if let Some(creds) = cached.as_ref() {
            let fresh = creds
                .expiry()
                .is_none_or(|exp| exp > SystemTime::now() + REFRESH_BEFORE_EXPIRY);
            if fresh {
                return Ok(creds.clone());
            }
        }
        let creds = self.provider.provide_credentials().await?;
        *cached = Some(creds.clone());
        Ok(creds)
    }

    /// Signs the request in place, adding `authorization`, `x-amz-date` and, for temporary
    /// credentials, `x-amz-security-token`.
    pub async fn sign<B>(&self, request: &mut http::Request<B>, body: &[u8]) -> Result<(), Error> {
        let creds = self.credentials().await?;
        self.sign_at(request, body, creds, SystemTime::now())
    }

    fn sign_at<B>(
        &self,
        request: &mut http::Request<B>,
        body: &[u8],
        creds: Credentials,
        time: SystemTime,
    ) -> Result<(), Error> {
        let identity = creds.into();
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SERVICE)
            .time(time)
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| Error::Signing(e.to_string()))?
            .into();

        let uri = request.uri().to_string();
        let headers = request
            .headers()
            .iter()
            .map(|(k, v)| {
                v.to_str()
                    .map(|v| (k.as_str(), v))
                    .map_err(|e| Error::Signing(format!("header {k}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let signable = SignableRequest::new(
            request.method().as_str(),
            uri.as_str(),
            headers.into_iter(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| Error::Signing(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| Error::Signing(e.to_string()))?
            .into_parts();
        instructions.apply_to_request_http1x(request);
        Ok(())
    }
}
