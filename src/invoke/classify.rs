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

use std::error::Error as StdError;
use std::io;

/// ResetClassifier decides whether a failed invocation was caused by the peer resetting the
/// connection. What a reset looks like depends on the transport, so callers can swap it out.
pub trait ResetClassifier: Send + Sync {
    fn is_reset(&self, err: &super::Error) -> bool;
}

/// TransportReset treats a failure as a reset when any error in its source chain is an
/// `io::ErrorKind::ConnectionReset`, or a hyper error for a connection closed before the response
/// completed (a "socket hang up").
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportReset;

impl ResetClassifier for TransportReset {
    fn is_reset(&self, err: &super::Error) -> bool {
        source_chain(err).any(|e| {
            if let Some(io) = e.downcast_ref::<io::Error>() {
                return io.kind() == io::ErrorKind::ConnectionReset;
            }
            e.downcast_ref::<hyper::Error>()
                .is_some_and(hyper::Error::is_incomplete_message)
        })
    }
}

/// IoKinds matches a configurable set of `io::ErrorKind`s anywhere in the source chain.
#[derive(Clone, Debug)]
pub struct IoKinds(pub Vec<io::ErrorKind>);

impl ResetClassifier for IoKinds {
    fn is_reset(&self, err: &super::Error) -> bool {
        source_chain(err).any(|e| {
            e.downcast_ref::<io::Error>()
                .is_some_and(|io| self.0.contains(&io.kind()))
        })
    }
}

/// Walks an error and its causes. `io::Error` hides a wrapped error from `source()`, so it is
/// unwrapped explicitly.
fn source_chain(err: &super::Error) -> impl Iterator<Item = &(dyn StdError + 'static)> {
    let first: &(dyn StdError + 'static) = err;
    std::iter::successors(Some(first), |&e| match e.downcast_ref::<io::Error>() {
        Some(io) => io
            .get_ref()
            .map(|inner| inner as &(dyn StdError + 'static))
            .or_else(|| e.source()),
        None => e.source(),
    })
}

impl<F> ResetClassifier for F
where
    F: Fn(&super::Error) -> bool + Send + Sync,
{
    fn is_reset(&self, err: &super::Error) -> bool {
        self(err)
    }
}

#[cfg(test)]
mod test {
    use super::super::{Error, Outcome};
    use super::*;
    use hyper::StatusCode;
    use test_case::test_case;

    fn io_err(kind: io::ErrorKind) -> Error {
        Error::Io(io::Error::new(kind, "boom"))
    }

    #[test_case(io::ErrorKind::ConnectionReset => Outcome::ConnectionReset; "reset")]
    #[test_case(io::ErrorKind::ConnectionRefused => Outcome::OtherFailure; "refused")]
    #[test_case(io::ErrorKind::TimedOut => Outcome::OtherFailure; "timeout")]
    #[test_case(io::ErrorKind::BrokenPipe => Outcome::OtherFailure; "broken pipe")]
    fn classify_io(kind: io::ErrorKind) -> Outcome {
        Outcome::classify::<()>(&Err(io_err(kind)), &TransportReset)
    }

    #[test]
    fn classify_success() {
        assert_eq!(
            Outcome::classify(&Ok::<_, Error>(()), &TransportReset),
            Outcome::Success
        );
    }

    #[test]
    fn classify_status_and_config() {
        let status = Err::<(), _>(Error::Status(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down".to_string(),
        ));
        assert_eq!(
            Outcome::classify(&status, &TransportReset),
            Outcome::OtherFailure
        );
        let missing = Err::<(), _>(Error::MissingTarget);
        assert_eq!(
            Outcome::classify(&missing, &TransportReset),
            Outcome::OtherFailure
        );
    }

    #[test]
    fn classify_nested_reset() {
        // A reset wrapped by another io error is still found through the source chain.
        let inner = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let outer = io::Error::other(inner);
        assert_eq!(
            Outcome::classify::<()>(&Err(Error::Io(outer)), &TransportReset),
            Outcome::ConnectionReset
        );
    }

    #[test]
    fn custom_classifiers() {
        let kinds = IoKinds(vec![io::ErrorKind::BrokenPipe]);
        assert_eq!(
            Outcome::classify::<()>(&Err(io_err(io::ErrorKind::BrokenPipe)), &kinds),
            Outcome::ConnectionReset
        );
        assert_eq!(
            Outcome::classify::<()>(&Err(io_err(io::ErrorKind::ConnectionReset)), &kinds),
            Outcome::OtherFailure
        );

        let everything = |_: &Error| true;
        assert_eq!(
            Outcome::classify::<()>(&Err(Error::MissingTarget), &everything),
            Outcome::ConnectionReset
        );
    }
}
