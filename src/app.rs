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

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::driver::Driver;
use crate::invoke::{
    InvocationRequest, Invoker, LambdaClient, ResetClassifier, Signer, TransportReset,
};
use crate::metrics::Metrics;
use crate::{config, drain, frontend, metrics, signal, telemetry};

/// Builds the application around the given invoker. Both the driver and the front end share it,
/// and with it a single connection pool.
pub async fn build_with_invoker(
    config: Arc<config::Config>,
    invoker: Arc<dyn Invoker>,
    classifier: Arc<dyn ResetClassifier>,
) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));

    let shutdown = signal::Shutdown::new();
    // Setup a drain channel. drain_tx is used to trigger a drain, which will complete
    // once all drain_rx handlers are dropped.
    // Note: there is still a hard timeout if the draining takes too long
    let (drain_tx, drain_rx) = drain::new();

    let frontend_server = frontend::Service::new(
        &config,
        frontend::Frontend::new(
            &config,
            invoker.clone(),
            classifier.clone(),
            metrics.clone(),
            telemetry::component_span("frontend"),
        ),
        drain_rx.clone(),
    )
    .await
    .context("frontend server starts")?;
    let stats_server = metrics::server::Server::new(&config, drain_rx.clone(), registry)
        .await
        .context("stats server starts")?;
    let frontend_address = frontend_server.address();
    let stats_address = stats_server.address();

    frontend_server.spawn();
    stats_server.spawn();

    let driver = Arc::new(Driver::new(
        invoker,
        classifier,
        InvocationRequest::demo(config.lambda_arn.clone().unwrap_or_default()),
        config.schedule.clone(),
        metrics,
        telemetry::component_span("driver"),
    ));
    let driver_task = tokio::spawn(driver.clone().run());

    Ok(Bound {
        frontend_address,
        stats_address,
        driver,
        shutdown,
        config,
        drain_tx,
        driver_task,
    })
}

pub async fn build(config: Arc<config::Config>) -> anyhow::Result<Bound> {
    let mut client = LambdaClient::new(&config).context("lambda client")?;
    if config.sign_requests {
        match Signer::from_env(&config).await {
            Some(signer) => {
                info!(region = signer.region(), "signing lambda requests");
                client = client.with_signer(signer);
            }
            None => warn!("no AWS credentials or region found, lambda requests are not signed"),
        }
    }
    build_with_invoker(config, Arc::new(client), Arc::new(TransportReset)).await
}

pub struct Bound {
    pub frontend_address: SocketAddr,
    pub stats_address: SocketAddr,
    pub driver: Arc<Driver>,

    pub shutdown: signal::Shutdown,
    config: Arc<config::Config>,
    drain_tx: drain::DrainTrigger,
    driver_task: JoinHandle<()>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from an explicit trigger or signal
        self.shutdown.wait().await;

        // In-flight calls are abandoned; only the remaining schedule is stopped.
        self.driver_task.abort();

        // Start a drain; this will wait for all drain_rx handles to be dropped before completing,
        // allowing components to terminate.
        // If they take too long, terminate anyways.
        match time::timeout(
            self.config.termination_grace_period,
            self.drain_tx.start_drain_and_wait(),
        )
        .await
        {
            Ok(()) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                self.config.termination_grace_period
            ),
        }
        Ok(())
    }
}
