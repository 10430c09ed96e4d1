use std::thread::sleep;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::client::{ActionApi, Params, RequestMethod};
use crate::config::RetrySection;
use crate::error::{MetricsError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    /// Authenticated action API calls: 4 attempts, 20s growing by 2.3x.
    pub fn action_api() -> Self {
        Self {
            attempts: 4,
            initial_delay: Duration::from_secs(20),
            factor: 2.3,
        }
    }

    /// Unauthenticated view-count calls: 5 attempts, 12s doubling.
    pub fn pageviews() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(12),
            factor: 2.0,
        }
    }

    pub fn immediate(attempts: usize) -> Self {
        Self {
            attempts,
            initial_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Policy from a `[retry]`-style config section. Delays and factors must
    /// be finite and non-negative.
    pub fn from_section(section: &RetrySection) -> Result<Self> {
        if !section.factor.is_finite() || section.factor < 0.0 {
            return Err(MetricsError::validation(format!(
                "retry factor must be a finite non-negative number, got {}",
                section.factor
            )));
        }
        let initial_delay = Duration::try_from_secs_f64(section.initial_delay_secs).map_err(|_| {
            MetricsError::validation(format!(
                "retry initial_delay_secs must be a finite non-negative number, got {}",
                section.initial_delay_secs
            ))
        })?;
        Ok(Self {
            attempts: section.attempts,
            initial_delay,
            factor: section.factor,
        })
    }

    /// Sleep that follows each failed scripted attempt, in order. Growth
    /// saturates at `Duration::MAX`.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delay = self.initial_delay;
        let mut out = Vec::with_capacity(self.attempts);
        for _ in 0..self.attempts {
            out.push(delay);
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * self.factor)
                .unwrap_or(Duration::MAX);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: usize },
    Reauthenticating,
    /// Scripted attempts used up; one last attempt whose error propagates.
    Exhausted,
}

pub type Reauthenticate<'a, C> = &'a mut dyn FnMut(&mut C) -> Result<()>;

/// Run `operation` under `policy`.
///
/// Every scripted failure is followed by a sleep. Once the budget is spent the
/// optional `reauthenticate` hook runs (its error is fatal) and `operation` is
/// tried exactly once more without retry.
pub fn run_with_retry<C, T>(
    policy: &RetryPolicy,
    context: &mut C,
    mut operation: impl FnMut(&mut C) -> Result<T>,
    mut reauthenticate: Option<Reauthenticate<'_, C>>,
) -> Result<T> {
    let delays = policy.delays();
    let mut state = RetryState::Attempting { attempt: 0 };
    loop {
        state = match state {
            RetryState::Attempting { attempt } if attempt < policy.attempts => {
                match operation(context) {
                    Ok(value) => return Ok(value),
                    Err(error) => {
                        let delay = delays[attempt];
                        warn!(
                            attempt = attempt + 1,
                            of = policy.attempts,
                            transient = error.is_transient(),
                            "request failed, retrying in {delay:?}: {error}"
                        );
                        sleep(delay);
                        RetryState::Attempting {
                            attempt: attempt + 1,
                        }
                    }
                }
            }
            RetryState::Attempting { .. } => {
                if reauthenticate.is_some() {
                    RetryState::Reauthenticating
                } else {
                    RetryState::Exhausted
                }
            }
            RetryState::Reauthenticating => {
                info!("retry budget spent, logging in again");
                if let Some(hook) = reauthenticate.as_mut() {
                    hook(context)?;
                }
                RetryState::Exhausted
            }
            RetryState::Exhausted => return operation(context),
        };
    }
}

/// Action API session with the retry and re-login discipline applied to
/// every call.
pub struct RetryingClient<A> {
    api: A,
    policy: RetryPolicy,
}

impl<A: ActionApi> RetryingClient<A> {
    pub fn new(api: A, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    /// Unretried login handshake.
    pub fn login(&mut self) -> Result<()> {
        self.api.login()
    }

    pub fn call(
        &mut self,
        params: &Params,
        method: RequestMethod,
        require_success: bool,
    ) -> Result<Value> {
        let relogin: Reauthenticate<'_, A> = &mut |api: &mut A| api.login();
        run_with_retry(
            &self.policy,
            &mut self.api,
            |api| api.request(params, method, require_success),
            Some(relogin),
        )
    }

    pub fn get(&mut self, params: &Params) -> Result<Value> {
        self.call(params, RequestMethod::Get, false)
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn into_inner(self) -> A {
        self.api
    }
}
