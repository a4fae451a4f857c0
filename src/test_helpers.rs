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

use std::fmt::Debug;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::trace;

use crate::config;
use crate::driver::Schedule;

pub mod helpers;
pub mod invoker;
pub mod lambda;

pub const TEST_FUNCTION_ARN: &str = "arn:aws:lambda:us-east-1:123456789012:function:hangup-test";

/// A short schedule, so tests can run the driver against real sockets.
pub fn test_schedule() -> Schedule {
    Schedule {
        warmup_rounds: 2,
        warmup_batch: 5,
        settle: Duration::from_millis(10),
        idle: Duration::from_millis(50),
        probe_calls: 3,
        probe_interval: Duration::from_millis(10),
    }
}

pub fn test_config_with_endpoint(endpoint: Option<String>) -> config::Config {
    config::Config {
        lambda_arn: Some(TEST_FUNCTION_ARN.to_string()),
        lambda_endpoint: endpoint,
        // The fake Lambda does not check signatures; tests that want them attach a signer.
        sign_requests: false,
        // Localhost and port 0, so tests neither expose ports nor conflict with each other.
        frontend_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        stats_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        termination_grace_period: Duration::from_secs(1),
        schedule: test_schedule(),
        ..config::parse_config().unwrap()
    }
}

pub fn test_config() -> config::Config {
    test_config_with_endpoint(None)
}

pub async fn assert_eventually<F, T, Fut>(dur: Duration, f: F, expected: T)
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    T: Eq + Debug,
{
    let mut delay = Duration::from_millis(10);
    let end = std::time::Instant::now() + dur;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = f().await;
        if last == expected {
            return;
        }
        trace!("attempt {attempts} with delay {delay:?}");
        if std::time::Instant::now() + delay > end {
            panic!("assert_eventually failed after {attempts}: last response: {last:?}")
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}
