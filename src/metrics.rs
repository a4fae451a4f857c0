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

use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::invoke::Outcome;

pub mod server;

/// Phase is the part of the run an invocation was issued from.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Probe,
    Manual,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Warmup => "warmup",
            Phase::Probe => "probe",
            Phase::Manual => "manual",
        }
    }
}

impl EncodeLabelValue for Phase {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Invocation {
    pub phase: Phase,
    pub outcome: Outcome,
}

pub struct Metrics {
    invocations: Family<Invocation, Counter>,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let invocations = Family::default();
        registry.register(
            "invocations",
            "The total number of completed invocations, by phase and outcome",
            invocations.clone(),
        );
        Self { invocations }
    }

    /// invocations returns the current count for one phase and outcome. Reading never creates a
    /// series; an outcome that was never recorded reads as zero.
    pub fn invocations(&self, phase: Phase, outcome: Outcome) -> u64 {
        self.invocations
            .get(&Invocation { phase, outcome })
            .map(|c| c.get())
            .unwrap_or(0)
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(registry.sub_registry_with_prefix("hangup"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

impl Recorder<Invocation, u64> for Metrics {
    fn record(&self, event: &Invocation, count: u64) {
        self.invocations.get_or_create(event).inc_by(count);
    }
}
