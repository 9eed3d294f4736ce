use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::gateway::app::SharedApp;
use crate::gateway::queue::{EventReceiver, EventSender};
use crate::gateway::scope::Scope;

/// How an application invocation settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOutcome {
    Completed,
    Failed(String),
    Panicked,
    Cancelled,
}

impl AppOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AppOutcome::Completed)
    }
}

/// Invokes `app` exactly once for `scope` on its own task.
///
/// The application runs beside the connection rather than inside it, so a
/// connection can keep reading and writing while the application is
/// suspended in `receive` or `send`, and a panicking application is
/// contained to its scope.
pub fn spawn(app: &SharedApp, scope: Scope, receive: EventReceiver, send: EventSender) -> AppTask {
    let span = tracing::debug_span!("app", scope = scope.scope_type().as_str());
    let future = app.call(scope, receive, send);
    AppTask {
        handle: tokio::spawn(future.instrument(span)),
        outcome: None,
    }
}

/// Handle to a running application. Resolves to its [`AppOutcome`]; can be
/// polled again after completion. Dropping it aborts the application.
pub struct AppTask {
    handle: JoinHandle<anyhow::Result<()>>,
    outcome: Option<AppOutcome>,
}

impl AppTask {
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.handle.is_finished()
    }

    pub fn outcome(&self) -> Option<&AppOutcome> {
        self.outcome.as_ref()
    }

    /// Gives the application `grace` to return on its own, then aborts it.
    pub async fn finish_within(&mut self, grace: Duration) -> AppOutcome {
        match tokio::time::timeout(grace, &mut *self).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!("aborting application after {:?}", grace);
                self.handle.abort();
                (&mut *self).await
            }
        }
    }
}

impl Future for AppTask {
    type Output = AppOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AppOutcome> {
        if let Some(outcome) = &self.outcome {
            return Poll::Ready(outcome.clone());
        }
        let outcome = match ready!(Pin::new(&mut self.handle).poll(cx)) {
            Ok(Ok(())) => AppOutcome::Completed,
            Ok(Err(e)) => AppOutcome::Failed(format!("{e:#}")),
            Err(e) if e.is_panic() => AppOutcome::Panicked,
            Err(_) => AppOutcome::Cancelled,
        };
        self.outcome = Some(outcome.clone());
        Poll::Ready(outcome)
    }
}

impl Drop for AppTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
