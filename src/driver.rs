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

//! The driver issues a fixed pattern of invocations meant to surface stale pooled connections:
//! a large warm-up burst, a long idle period, then a slow probe burst over the same pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, error, info};

use crate::invoke::{InvocationRequest, Invoker, Outcome, ResetClassifier};
use crate::metrics::{IncrementRecorder, Invocation, Metrics, Phase};

/// Schedule is the burst/pause recipe. The defaults reproduce the idle-connection reset; an idle
/// period longer than roughly 5m50s is what lets the shared connection go stale.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub warmup_rounds: usize,
    pub warmup_batch: usize,
    /// Lets the warm-up calls finish before the idle period starts.
    pub settle: Duration,
    pub idle: Duration,
    pub probe_calls: usize,
    pub probe_interval: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            warmup_rounds: 10,
            warmup_batch: 100,
            settle: Duration::from_millis(60_000),
            idle: Duration::from_millis(540_000),
            probe_calls: 35,
            probe_interval: Duration::from_millis(100),
        }
    }
}

impl Schedule {
    pub fn warmup_calls(&self) -> usize {
        self.warmup_rounds * self.warmup_batch
    }

    pub fn total_calls(&self) -> usize {
        self.warmup_calls() + self.probe_calls
    }
}

/// CallCounter hands out sequence numbers at issue time, starting from zero.
#[derive(Debug, Default)]
pub struct CallCounter(AtomicU64);

impl CallCounter {
    /// Returns the current value and advances the counter.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Driver {
    invoker: Arc<dyn Invoker>,
    classifier: Arc<dyn ResetClassifier>,
    request: Arc<InvocationRequest>,
    schedule: Schedule,
    counter: CallCounter,
    metrics: Arc<Metrics>,
    tasks: TaskTracker,
    span: Span,
}

impl Driver {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        classifier: Arc<dyn ResetClassifier>,
        request: InvocationRequest,
        schedule: Schedule,
        metrics: Arc<Metrics>,
        span: Span,
    ) -> Self {
        Driver {
            invoker,
            classifier,
            request: Arc::new(request),
            schedule,
            counter: CallCounter::default(),
            metrics,
            tasks: TaskTracker::new(),
            span,
        }
    }

    /// Runs the whole schedule. Calls are not awaited; each one logs its own outcome, so outcomes
    /// may still be arriving when this returns.
    pub async fn run(self: Arc<Self>) {
        let span = self.span.clone();
        self.run_schedule().instrument(span).await
    }

    async fn run_schedule(&self) {
        let s = &self.schedule;
        info!("Targeting lambda: {}", self.request.function_name());

        for _ in 0..s.warmup_rounds {
            for _ in 0..s.warmup_batch {
                self.issue(Phase::Warmup);
            }
        }

        tokio::time::sleep(s.settle).await;

        info!("Breaking for {} milliseconds", s.idle.as_millis());
        tokio::time::sleep(s.idle).await;

        info!("-------Sending calls after break---------");
        for _ in 0..s.probe_calls {
            self.issue(Phase::Probe);
            tokio::time::sleep(s.probe_interval).await;
        }
        info!(issued = self.counter.issued(), "schedule complete");
    }

    /// Starts one invocation without waiting for it.
    fn issue(&self, phase: Phase) {
        let counter = self.counter.next();
        let invoker = self.invoker.clone();
        let classifier = self.classifier.clone();
        let request = self.request.clone();
        let metrics = self.metrics.clone();
        self.tasks.spawn(
            async move {
                let res = invoker.invoke(&request).await;
                let outcome = Outcome::classify(&res, classifier.as_ref());
                match outcome {
                    Outcome::Success => info!(invocation = counter, "successful invocation"),
                    Outcome::ConnectionReset => {
                        error!(invocation = counter, "failed with ECONNRESET on invocation")
                    }
                    Outcome::OtherFailure => error!(
                        invocation = counter,
                        error = res.as_ref().err().map(tracing::field::display),
                        "unknown error on invocation"
                    ),
                }
                metrics.increment(&Invocation { phase, outcome });
            }
            .in_current_span(),
        );
    }

    pub fn issued(&self) -> u64 {
        self.counter.issued()
    }

    /// Waits for every issued call to resolve. Only used by callers that want to observe the
    /// final outcomes; the schedule itself never waits on calls.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
