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

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use hyper::StatusCode;
use tokio::time::Instant;

use crate::invoke::{Error, InvocationRequest, InvokeResponse, Invoker};

/// Script decides what a FakeInvoker answers, by call order.
#[derive(Clone, Copy, Debug)]
pub enum Script {
    AlwaysSucceed,
    AlwaysReset,
    AlwaysFail,
    /// The first n calls succeed; every later one is reset.
    ResetAfter(usize),
}

#[derive(Clone, Debug)]
pub struct Call {
    /// When the call started, on the tokio clock.
    pub at: Instant,
    pub request: InvocationRequest,
}

/// FakeInvoker records every call and answers from a Script, without any network.
pub struct FakeInvoker {
    script: Script,
    delay: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl FakeInvoker {
    pub fn new(script: Script) -> Self {
        FakeInvoker {
            script,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, index: usize) -> Result<InvokeResponse, Error> {
        let reset = || Err(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
        match self.script {
            Script::AlwaysSucceed => Ok(ok_response()),
            Script::AlwaysReset => reset(),
            Script::AlwaysFail => Err(Error::Status(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate Exceeded.".to_string(),
            )),
            Script::ResetAfter(n) if index < n => Ok(ok_response()),
            Script::ResetAfter(_) => reset(),
        }
    }
}

fn ok_response() -> InvokeResponse {
    InvokeResponse {
        status: 200,
        function_error: None,
        payload: bytes::Bytes::from_static(b"{\"statusCode\":200}"),
    }
}

#[async_trait::async_trait]
impl Invoker for FakeInvoker {
    async fn invoke(&self, req: &InvocationRequest) -> Result<InvokeResponse, Error> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                at: Instant::now(),
                request: req.clone(),
            });
            calls.len() - 1
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer(index)
    }
}
