//! Retry/redirect engine (C7): classifies a failed attempt's error into a
//! concrete next action — follow a `MOVED`/`ASK` redirect, wait out a
//! `TRYAGAIN`/`CLUSTERDOWN`, or give up — against a per-request hop budget
//! (spec §4.7).
//!
//! Generalizes the teacher's `poll_request` dispatch (`MOVED`/`ASK` clear
//! the exclusion set and retry immediately; `TRYAGAIN`/`CLUSTERDOWN` sleep on
//! an exponential backoff first) into a pure decision function plus a
//! per-request [`HopTracker`], so the async retry loop itself lives in
//! [`crate::client::Client::execute`] rather than inside a hand-rolled
//! `Future::poll` state machine.

use std::net::SocketAddr;
use std::time::Duration;

use crate::backoff::ReconnectBackoff;
use crate::cmd::Command;
use crate::error::{RedisCoreError, ServerErrorKind};
use crate::router::Route;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectDecision {
    pub route: Route,
    /// Whether the redirected command must be preceded by `ASKING` on the
    /// target connection (true only for `ASK`, spec §4.7).
    pub asking: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Redirect(RedirectDecision),
    RetryAfter(Duration),
    Fail(RedisCoreError),
}

/// One per logical request, threaded through every attempt of its retry loop.
pub struct HopTracker {
    hops: u32,
    max_hops: u32,
    backoff: ReconnectBackoff,
}

impl HopTracker {
    pub fn new(max_hops: u32, backoff_template: ReconnectBackoff) -> Self {
        HopTracker {
            hops: 0,
            max_hops,
            backoff: backoff_template,
        }
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    /// Classify `err` from the most recent attempt. Never mutates state on a
    /// terminal outcome, so a caller that ignores a `Fail` and calls again
    /// anyway gets the same answer.
    pub fn decide(&mut self, err: &RedisCoreError) -> Outcome {
        if self.hops >= self.max_hops {
            return Outcome::Fail(err.clone());
        }

        let (kind, message) = match err {
            RedisCoreError::Request { kind, message } => (kind.as_str(), message.as_str()),
            _ => return Outcome::Fail(err.clone()),
        };

        match ServerErrorKind::from_token(kind) {
            ServerErrorKind::Moved => match parse_redirect(message) {
                Some((_, addr)) => {
                    self.hops += 1;
                    Outcome::Redirect(RedirectDecision {
                        route: Route::Address(addr),
                        asking: false,
                    })
                }
                None => Outcome::Fail(err.clone()),
            },
            ServerErrorKind::Ask => match parse_redirect(message) {
                Some((_, addr)) => {
                    self.hops += 1;
                    Outcome::Redirect(RedirectDecision {
                        route: Route::Address(addr),
                        asking: true,
                    })
                }
                None => Outcome::Fail(err.clone()),
            },
            ServerErrorKind::TryAgain | ServerErrorKind::ClusterDown => {
                self.hops += 1;
                Outcome::RetryAfter(self.backoff.next_delay())
            }
            _ => Outcome::Fail(err.clone()),
        }
    }
}

/// `MOVED`/`ASK` error bodies are `"<slot> <ip>:<port>"`.
fn parse_redirect(message: &str) -> Option<(u16, SocketAddr)> {
    let mut parts = message.split_whitespace();
    let slot = parts.next()?.parse::<u16>().ok()?;
    let addr = parts.next()?.parse::<SocketAddr>().ok()?;
    Some((slot, addr))
}

/// Prepends `ASKING` ahead of a redirected command on the target connection
/// (spec §4.7): the two are sent as separate requests, not combined into one
/// `MULTI`, since `ASKING` only needs to apply to the very next command on
/// that connection.
pub fn asking_command() -> Command {
    Command::new(crate::cmd::CommandKind::Admin).arg("ASKING")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved(slot: u16, addr: &str) -> RedisCoreError {
        RedisCoreError::from_server_error("MOVED", format!("{slot} {addr}"))
    }

    #[test]
    fn moved_redirects_and_consumes_a_hop() {
        let mut tracker = HopTracker::new(5, ReconnectBackoff::default());
        let outcome = tracker.decide(&moved(100, "127.0.0.1:7001"));
        match outcome {
            Outcome::Redirect(decision) => {
                assert!(!decision.asking);
                assert_eq!(decision.route, Route::Address("127.0.0.1:7001".parse().unwrap()));
            }
            other => panic!("expected Redirect, got {other:?}"),
        }
        assert_eq!(tracker.hops(), 1);
    }

    #[test]
    fn ask_sets_asking_flag() {
        let mut tracker = HopTracker::new(5, ReconnectBackoff::default());
        let err = RedisCoreError::from_server_error("ASK", "100 127.0.0.1:7002");
        match tracker.decide(&err) {
            Outcome::Redirect(decision) => assert!(decision.asking),
            other => panic!("expected Redirect, got {other:?}"),
        }
    }

    #[test]
    fn tryagain_backs_off_without_redirecting() {
        let mut tracker = HopTracker::new(5, ReconnectBackoff::default());
        let err = RedisCoreError::from_server_error("TRYAGAIN", "");
        assert!(matches!(tracker.decide(&err), Outcome::RetryAfter(_)));
    }

    #[test]
    fn hop_budget_is_enforced() {
        let mut tracker = HopTracker::new(2, ReconnectBackoff::default());
        assert!(matches!(
            tracker.decide(&moved(1, "127.0.0.1:7001")),
            Outcome::Redirect(_)
        ));
        assert!(matches!(
            tracker.decide(&moved(1, "127.0.0.1:7001")),
            Outcome::Redirect(_)
        ));
        assert!(matches!(
            tracker.decide(&moved(1, "127.0.0.1:7001")),
            Outcome::Fail(_)
        ));
    }

    #[test]
    fn non_redirect_request_error_is_terminal() {
        let mut tracker = HopTracker::new(5, ReconnectBackoff::default());
        let err = RedisCoreError::from_server_error("WRONGTYPE", "Operation against a key");
        assert!(matches!(tracker.decide(&err), Outcome::Fail(_)));
    }
}
