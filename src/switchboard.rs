//! Runs the answer cycle on every line at once.
//!
//! Each line gets its own task that waits for a call, waits for the carrier,
//! hands the session to the [`SessionHandler`] and starts over. One shared
//! [`CancellationToken`] stops all of them; every line is closed exactly once
//! on the way out.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::LineSpec;
use crate::handler::SessionHandler;
use crate::line::{Line, LineFactory, Session};
use crate::LineId;

/// What to do with a line after a failed wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Close the line for good.
    Terminate,
    /// Go back to waiting for the next call.
    Retry,
}

#[derive(Debug, Error)]
#[error("expected `terminate` or `retry`, got `{0}`")]
pub struct InvalidErrorAction(String);

impl FromStr for ErrorAction {
    type Err = InvalidErrorAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" => Ok(Self::Terminate),
            "retry" => Ok(Self::Retry),
            _ => Err(InvalidErrorAction(s.to_owned())),
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Terminate => "terminate",
            Self::Retry => "retry",
        };
        f.write_str(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub on_call_error: ErrorAction,
    pub on_connect_error: ErrorAction,
    /// Pause before waiting for the next call after a retried failure.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            on_call_error: ErrorAction::Terminate,
            on_connect_error: ErrorAction::Retry,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Why a line stopped serving calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineExit {
    Cancelled,
    InitFailed,
    CallFailed,
    ConnectFailed,
    Faulted,
}

pub struct Switchboard {
    lines: Vec<Box<dyn Line>>,
    handler: Arc<dyn SessionHandler>,
    policy: RetryPolicy,
}

impl Switchboard {
    pub fn new(handler: Arc<dyn SessionHandler>, policy: RetryPolicy) -> Self {
        Self {
            lines: Vec::new(),
            handler,
            policy,
        }
    }

    pub fn add_line(&mut self, line: Box<dyn Line>) {
        self.lines.push(line);
    }

    pub fn add_lines(&mut self, factory: &dyn LineFactory, specs: &[LineSpec]) {
        self.lines.extend(specs.iter().map(|spec| factory.build(spec)));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Serves every line until `cancel` fires or the line gives up, and
    /// reports how each one ended.
    pub async fn run(self, cancel: CancellationToken) -> Vec<(LineId, LineExit)> {
        let tasks: Vec<_> = self.lines
            .into_iter()
            .map(|line| {
                let id = line.id().to_owned();
                let span = tracing::info_span!("line", line = %id);
                let task = tokio::spawn(
                    serve_line(line, Arc::clone(&self.handler), self.policy, cancel.clone()).instrument(span),
                );
                (id, task)
            })
            .collect();
        tracing::info!(lines = tasks.len(), "switchboard running");

        let mut exits = Vec::with_capacity(tasks.len());
        for (id, task) in tasks {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(err) => {
                    tracing::error!(line = %id, error = %err, "line task failed");
                    LineExit::Faulted
                }
            };
            exits.push((id, exit));
        }
        tracing::info!("all lines stopped");
        exits
    }
}

async fn serve_line(
    mut line: Box<dyn Line>,
    handler: Arc<dyn SessionHandler>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> LineExit {
    if let Err(err) = line.init().await {
        tracing::error!(error = %err, "unable to open line");
        return LineExit::InitFailed;
    }

    let exit = answer_calls(line.as_mut(), handler.as_ref(), &policy, &cancel).await;
    tracing::info!(?exit, "line stopped");
    if let Err(err) = line.close().await {
        tracing::warn!(error = %err, "failed to close line");
    }
    exit
}

async fn answer_calls(
    line: &mut dyn Line,
    handler: &dyn SessionHandler,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> LineExit {
    loop {
        let call = tokio::select! {
            biased;
            () = cancel.cancelled() => return LineExit::Cancelled,
            call = line.wait_for_call() => call,
        };
        if let Err(err) = call {
            tracing::warn!(error = %err, "waiting for a call failed");
            match policy.on_call_error {
                ErrorAction::Terminate => return LineExit::CallFailed,
                ErrorAction::Retry => {
                    if !pause(policy.retry_delay, cancel).await {
                        return LineExit::Cancelled;
                    }
                    continue;
                }
            }
        }

        let connect = tokio::select! {
            biased;
            () = cancel.cancelled() => return LineExit::Cancelled,
            connect = line.wait_for_connect() => connect,
        };
        match connect {
            Ok(event) => tracing::info!(rate = ?event.rate, message = %event.message, "caller connected"),
            Err(err) => {
                tracing::warn!(error = %err, "waiting for a carrier failed");
                match policy.on_connect_error {
                    ErrorAction::Terminate => return LineExit::ConnectFailed,
                    ErrorAction::Retry => {
                        if !pause(policy.retry_delay, cancel).await {
                            return LineExit::Cancelled;
                        }
                        continue;
                    }
                }
            }
        }

        let session = match line.get_read_writer() {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(error = %err, "unable to start session");
                return LineExit::Faulted;
            }
        };
        let cancelled = dispatch(handler, session, cancel).await;

        if let Err(err) = line.release_session().await {
            tracing::error!(error = %err, "unable to release session");
            return LineExit::Faulted;
        }
        if cancelled {
            return LineExit::Cancelled;
        }
    }
}

/// Runs the handler until it finishes, the caller hangs up or everything is
/// cancelled. Returns whether it was cancelled.
async fn dispatch(handler: &dyn SessionHandler, session: Session, cancel: &CancellationToken) -> bool {
    let hangup = session.hangup.clone();
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::info!("session cut short by shutdown");
            true
        }
        () = hangup.wait() => {
            tracing::info!("caller hung up");
            false
        }
        result = handler.handle(session) => {
            match result {
                Ok(()) => tracing::info!("session finished"),
                Err(err) => tracing::warn!(error = ?err, "session handler failed"),
            }
            false
        }
    }
}

/// Returns false if cancelled while waiting.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
