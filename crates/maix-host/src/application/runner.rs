//! ProgramRunner: run one source file on the current device.
//!
//! The runner is the boundary a debugger front end (or the CLI `run`
//! subcommand) talks to.  `start` pushes a file to the device and returns a
//! [`RunOutput`] that yields the program's output, camera frames, and a final
//! [`RunnerEvent::End`].  `stop` asks the device to interrupt the program.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use maix_core::ExitStatus;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::application::link_state::{LinkError, LinkEvent};
use crate::application::session_manager::{DeviceLink, SessionManager};

/// Error type for the runner use case.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("device is not connected")]
    NotConnected,

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// What a running program produces, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Stdout(String),
    Stderr(String),
    Image { format_tag: u8, data: Bytes },
    /// Always the last event.  Carries the exit status when the device
    /// reported one.
    End(Option<ExitStatus>),
}

/// Runs programs on the current session's device.
#[derive(Default)]
pub struct ProgramRunner {
    link: Option<Arc<dyn DeviceLink>>,
}

impl ProgramRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `program` and runs it on the current device.
    ///
    /// # Errors
    ///
    /// - [`RunnerError::NotConnected`] if there is no current session or it
    ///   has not completed its handshake.
    /// - [`RunnerError::Io`] if the file cannot be read.
    /// - [`RunnerError::Link`] if the link refuses the run (e.g. a program is
    ///   already running).
    pub async fn start(
        &mut self,
        program: &Path,
        sessions: &SessionManager,
    ) -> Result<RunOutput, RunnerError> {
        let link = sessions.current().await.ok_or(RunnerError::NotConnected)?;
        if !link.state().is_connected() {
            return Err(RunnerError::NotConnected);
        }

        let source = tokio::fs::read(program)
            .await
            .map_err(|source| RunnerError::Io {
                path: program.to_path_buf(),
                source,
            })?;
        let source = String::from_utf8_lossy(&source);

        let events = link.subscribe();
        link.run_code(&source).await?;
        info!("running {} on {}", program.display(), link.identity());

        self.link = Some(link);
        Ok(RunOutput {
            events,
            pending: VecDeque::new(),
            ended: false,
        })
    }

    /// Asks the device to stop the program started by the last `start`.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let link = self.link.as_ref().ok_or(RunnerError::NotConnected)?;
        link.stop_code().await?;
        Ok(())
    }
}

/// Event stream of one program run.
pub struct RunOutput {
    events: broadcast::Receiver<LinkEvent>,
    pending: VecDeque<RunnerEvent>,
    ended: bool,
}

impl RunOutput {
    /// Next event, or `None` after [`RunnerEvent::End`] has been returned.
    pub async fn next(&mut self) -> Option<RunnerEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.ended {
                return None;
            }

            let event = match self.events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("runner output lagging; {n} link events skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => LinkEvent::Closed {
                    reason: "link dropped".into(),
                },
            };
            self.translate(event);
        }
    }

    fn translate(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Output(text) | LinkEvent::Message(text) => {
                self.pending.push_back(RunnerEvent::Stdout(text));
            }
            LinkEvent::Image { format_tag, data } => {
                self.pending.push_back(RunnerEvent::Image { format_tag, data });
            }
            LinkEvent::Finished(status) => {
                if !status.is_clean() {
                    self.pending.push_back(RunnerEvent::Stderr(status.to_string()));
                }
                self.end(Some(status));
            }
            LinkEvent::Error(err) => {
                self.pending.push_back(RunnerEvent::Stderr(err.to_string()));
                self.end(None);
            }
            LinkEvent::Closed { reason } => {
                self.pending
                    .push_back(RunnerEvent::Stderr(format!("connection closed: {reason}")));
                self.end(None);
            }
            _ => {}
        }
    }

    fn end(&mut self, status: Option<ExitStatus>) {
        self.pending.push_back(RunnerEvent::End(status));
        self.ended = true;
    }
}
