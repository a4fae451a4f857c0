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

use tokio::sync::{mpsc, watch};

/// Creates a drain channel.
///
/// The `DrainTrigger` starts a drain; every `DrainWatcher` is notified and the drain completes once
/// all of them (and the `DrainBlocker`s they hand out) are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(false);
    let (drained_tx, drained_rx) = mpsc::channel(1);
    (
        DrainTrigger {
            drained_rx,
            signal_tx,
        },
        DrainWatcher {
            drained_tx,
            signal_rx,
        },
    )
}

enum Never {}

pub struct DrainTrigger {
    drained_rx: mpsc::Receiver<Never>,
    signal_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DrainWatcher {
    drained_tx: mpsc::Sender<Never>,
    signal_rx: watch::Receiver<bool>,
}

/// Holding a DrainBlocker keeps the drain from completing.
#[must_use = "DrainBlocker should be dropped explicitly to release the drain"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>);

impl DrainTrigger {
    /// Signals every watcher to drain and waits until all of them are released.
    pub async fn start_drain_and_wait(mut self) {
        let _ = self.signal_tx.send(true);
        match self.drained_rx.recv().await {
            None => {}
            Some(n) => match n {},
        }
    }
}

impl DrainWatcher {
    /// Completes once a drain starts. The returned blocker must be dropped when cleanup is done.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        // An error means the trigger is gone, which is treated the same as a drain.
        let _ = self.signal_rx.wait_for(|draining| *draining).await;
        DrainBlocker(self.drained_tx)
    }
}

impl std::fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}
