//! Process-wide startup/shutdown protocol.
//!
//! The application is invoked once with a lifespan scope. It receives
//! `lifespan.startup` before any connection is accepted and
//! `lifespan.shutdown` after the acceptors stop and connections drain; both
//! phases are driven by the same invocation.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LifespanConfig, LifespanMode};
use crate::gateway::app::SharedApp;
use crate::gateway::driver::{self, AppOutcome, AppTask};
use crate::gateway::event::Event;
use crate::gateway::queue::{self, InboundQueue, OutboundQueue};
use crate::gateway::scope::{LifespanScope, Scope};
use crate::gateway::state::State;

const QUEUE_CAPACITY: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifespanError {
    #[error("lifespan startup failed: {0}")]
    StartupFailed(String),

    #[error("lifespan shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("application does not support lifespan ({0})")]
    Unsupported(String),

    #[error("lifespan {0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("lifespan {0} already ran")]
    AlreadyRan(&'static str),

    #[error("application sent {0} during lifespan")]
    UnexpectedEvent(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifespanPhase {
    Idle,
    /// Startup completed; shutdown still to run.
    Running,
    /// The application doesn't take part in lifespan.
    Unsupported,
    Disabled,
    Stopped,
    Failed,
}

enum Reply {
    Event(Event),
    Exited(AppOutcome),
    TimedOut,
}

pub struct LifespanController {
    app: SharedApp,
    config: LifespanConfig,
    state: State,
    phase: LifespanPhase,
    inbound: Option<InboundQueue>,
    outbound: Option<OutboundQueue>,
    task: Option<AppTask>,
}

impl LifespanController {
    pub fn new(app: SharedApp, config: LifespanConfig, state: State) -> Self {
        Self {
            app,
            config,
            state,
            phase: LifespanPhase::Idle,
            inbound: None,
            outbound: None,
            task: None,
        }
    }

    pub fn phase(&self) -> LifespanPhase {
        self.phase
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Runs the startup phase. Must succeed before the server binds.
    pub async fn startup(&mut self) -> Result<(), LifespanError> {
        if self.phase != LifespanPhase::Idle {
            return Err(LifespanError::AlreadyRan("startup"));
        }
        if self.config.mode == LifespanMode::Off {
            self.phase = LifespanPhase::Disabled;
            return Ok(());
        }

        let (inbound, receive) = queue::inbound(QUEUE_CAPACITY, Event::LifespanShutdown);
        let (send, outbound) = queue::outbound(QUEUE_CAPACITY);
        inbound.try_push(Event::LifespanStartup);

        let scope = Scope::Lifespan(LifespanScope {
            state: self.state.clone(),
        });
        self.task = Some(driver::spawn(&self.app, scope, receive, send));
        self.inbound = Some(inbound);
        self.outbound = Some(outbound);

        match self.await_reply().await {
            Reply::Event(Event::LifespanStartupComplete) => {
                info!("Lifespan startup complete");
                self.phase = LifespanPhase::Running;
                Ok(())
            }
            Reply::Event(Event::LifespanStartupFailed { message }) => {
                self.phase = LifespanPhase::Failed;
                self.teardown().await;
                Err(LifespanError::StartupFailed(message))
            }
            Reply::Event(other) => {
                self.phase = LifespanPhase::Failed;
                self.teardown().await;
                Err(LifespanError::UnexpectedEvent(other.name()))
            }
            Reply::Exited(outcome) => {
                let reason = describe(&outcome);
                self.teardown().await;
                if self.config.mode == LifespanMode::Auto {
                    info!("Application does not support lifespan ({}), continuing", reason);
                    self.phase = LifespanPhase::Unsupported;
                    Ok(())
                } else {
                    self.phase = LifespanPhase::Failed;
                    Err(LifespanError::Unsupported(reason))
                }
            }
            Reply::TimedOut => {
                self.phase = LifespanPhase::Failed;
                self.teardown().await;
                Err(LifespanError::Timeout("startup", self.config.timeout()))
            }
        }
    }

    /// Runs the shutdown phase. A no-op unless startup completed.
    pub async fn shutdown(&mut self) -> Result<(), LifespanError> {
        match self.phase {
            LifespanPhase::Running => {}
            LifespanPhase::Stopped => return Err(LifespanError::AlreadyRan("shutdown")),
            _ => return Ok(()),
        }
        self.phase = LifespanPhase::Stopped;

        let delivered = match &self.inbound {
            Some(inbound) => inbound.push(Event::LifespanShutdown).await,
            None => false,
        };
        let result = if !delivered {
            Err(LifespanError::ShutdownFailed(
                "application stopped listening".to_string(),
            ))
        } else {
            match self.await_reply().await {
                Reply::Event(Event::LifespanShutdownComplete) => {
                    info!("Lifespan shutdown complete");
                    Ok(())
                }
                Reply::Event(Event::LifespanShutdownFailed { message }) => {
                    Err(LifespanError::ShutdownFailed(message))
                }
                Reply::Event(other) => Err(LifespanError::UnexpectedEvent(other.name())),
                Reply::Exited(outcome) => Err(LifespanError::ShutdownFailed(describe(&outcome))),
                Reply::TimedOut => Err(LifespanError::Timeout("shutdown", self.config.timeout())),
            }
        };
        self.teardown().await;
        result
    }

    async fn await_reply(&mut self) -> Reply {
        let limit = self.config.timeout();
        let (Some(outbound), Some(task)) = (self.outbound.as_mut(), self.task.as_mut()) else {
            return Reply::Exited(AppOutcome::Cancelled);
        };
        let wait = async move {
            tokio::select! {
                biased;
                event = outbound.next() => match event {
                    Some(event) => Reply::Event(event),
                    None => Reply::Exited((&mut *task).await),
                },
                outcome = &mut *task => {
                    // Replies sent just before returning still count
                    match outbound.next().await {
                        Some(event) => Reply::Event(event),
                        None => Reply::Exited(outcome),
                    }
                }
            }
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(reply) => reply,
            Err(_) => Reply::TimedOut,
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut inbound) = self.inbound.take() {
            inbound.close();
        }
        if let Some(mut outbound) = self.outbound.take() {
            outbound.close();
        }
        if let Some(mut task) = self.task.take() {
            let outcome = task.finish_within(self.config.timeout()).await;
            debug!(?outcome, "Lifespan task finished");
            if let AppOutcome::Failed(err) = outcome {
                warn!("Lifespan application failed: {}", err);
            }
        }
    }
}

fn describe(outcome: &AppOutcome) -> String {
    match outcome {
        AppOutcome::Completed => "returned without replying".to_string(),
        AppOutcome::Failed(err) => format!("failed: {err}"),
        AppOutcome::Panicked => "panicked".to_string(),
        AppOutcome::Cancelled => "cancelled".to_string(),
    }
}
