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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::driver::Schedule;

const LAMBDA_ARN: &str = "LAMBDA_ARN";
const LAMBDA_ENDPOINT: &str = "LAMBDA_ENDPOINT";
const AWS_REGION: &str = "AWS_REGION";
const SIGN_REQUESTS: &str = "SIGN_REQUESTS";
const FRONTEND_PORT: &str = "FRONTEND_PORT";
const STATS_PORT: &str = "STATS_PORT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const POOL_IDLE_TIMEOUT: &str = "POOL_IDLE_TIMEOUT";
const TCP_KEEPALIVE: &str = "TCP_KEEPALIVE";

const WARMUP_ROUNDS: &str = "WARMUP_ROUNDS";
const WARMUP_BATCH: &str = "WARMUP_BATCH";
const SETTLE_PERIOD: &str = "SETTLE_PERIOD";
const IDLE_PERIOD: &str = "IDLE_PERIOD";
const PROBE_CALLS: &str = "PROBE_CALLS";
const PROBE_INTERVAL: &str = "PROBE_INTERVAL";

const DEFAULT_FRONTEND_PORT: u16 = 8080;
const DEFAULT_STATS_PORT: u16 = 15020;
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The function to invoke. Not validated; a bad value only shows up as failed calls.
    pub lambda_arn: Option<String>,
    /// Overrides the Lambda API base URL derived from the ARN or region.
    pub lambda_endpoint: Option<String>,
    pub region: Option<String>,
    /// SigV4-sign requests with credentials from the default AWS chain.
    pub sign_requests: bool,

    pub frontend_addr: SocketAddr,
    pub stats_addr: SocketAddr,

    pub termination_grace_period: Duration,

    /// How long an idle pooled connection is kept. None keeps it until the peer closes it.
    pub pool_idle_timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,

    pub schedule: Schedule,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// Duration in human form, such as `100ms`, `9m` or `1h 30s`.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(HumanDuration)
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &str) -> Result<Option<Duration>, Error> {
    parse::<HumanDuration>(env).map(|d| d.map(|d| d.0))
}

pub fn parse_config() -> Result<Config, Error> {
    let defaults = Schedule::default();
    let schedule = Schedule {
        warmup_rounds: parse_default(WARMUP_ROUNDS, defaults.warmup_rounds)?,
        warmup_batch: parse_default(WARMUP_BATCH, defaults.warmup_batch)?,
        settle: parse_duration(SETTLE_PERIOD)?.unwrap_or(defaults.settle),
        idle: parse_duration(IDLE_PERIOD)?.unwrap_or(defaults.idle),
        probe_calls: parse_default(PROBE_CALLS, defaults.probe_calls)?,
        probe_interval: parse_duration(PROBE_INTERVAL)?.unwrap_or(defaults.probe_interval),
    };

    Ok(Config {
        lambda_arn: empty_to_none(parse(LAMBDA_ARN)?),
        lambda_endpoint: empty_to_none(parse(LAMBDA_ENDPOINT)?),
        region: empty_to_none(parse(AWS_REGION)?),
        sign_requests: parse_default(SIGN_REQUESTS, true)?,

        frontend_addr: SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            parse_default(FRONTEND_PORT, DEFAULT_FRONTEND_PORT)?,
        ),
        stats_addr: SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            parse_default(STATS_PORT, DEFAULT_STATS_PORT)?,
        ),

        termination_grace_period: parse_duration(TERMINATION_GRACE_PERIOD)?
            .unwrap_or(DEFAULT_DRAIN_DURATION),

        pool_idle_timeout: parse_duration(POOL_IDLE_TIMEOUT)?,
        tcp_keepalive: parse_duration(TCP_KEEPALIVE)?,

        schedule,
    })
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}
