//! Device/origin provisioning state machine.
//!
//! At most one provisioning cycle is in flight at any time:
//!
//! ```text
//! Idle -> Requesting -> AwaitingResponse -> Applying -> Idle
//!            |                 |               |
//!            +-----------------+---------------+--> Failed
//! ```
//!
//! The coordinator owns only the state. The manager asks it to start a cycle
//! and feeds it the caller's response; queue draining and crypto context
//! creation happen in the manager once the coordinator is back to `Idle`.

use std::fmt;

use crate::cdm::{CdmEngine, EngineError, ProvisionRequest};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProvisioningState {
    #[default]
    Idle,
    Requesting,
    AwaitingResponse,
    Applying,
    Failed,
}

impl ProvisioningState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningState::Idle => "idle",
            ProvisioningState::Requesting => "requesting",
            ProvisioningState::AwaitingResponse => "awaiting-response",
            ProvisioningState::Applying => "applying",
            ProvisioningState::Failed => "failed",
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the coordinator to start a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new cycle began; the request must be handed to the caller.
    Started(ProvisionRequest),
    /// A cycle is already running; nothing new was requested.
    AlreadyActive,
}

#[derive(Debug, Default)]
pub struct ProvisioningCoordinator {
    state: ProvisioningState,
    cycles: u64,
}

impl ProvisioningCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Whether a cycle is running. `Failed` counts as finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ProvisioningState::Requesting
                | ProvisioningState::AwaitingResponse
                | ProvisioningState::Applying
        )
    }

    #[must_use]
    pub fn is_awaiting_response(&self) -> bool {
        self.state == ProvisioningState::AwaitingResponse
    }

    /// Number of cycles started so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn transition(&mut self, to: ProvisioningState) -> Result<()> {
        use ProvisioningState::*;

        let allowed = matches!(
            (self.state, to),
            (Idle, Requesting)
                | (Failed, Requesting)
                | (Requesting, AwaitingResponse)
                | (AwaitingResponse, Applying)
                | (Applying, Idle)
                | (Failed, Idle)
                | (Requesting, Failed)
                | (AwaitingResponse, Failed)
                | (Applying, Failed)
        );
        if !allowed {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        log!(debug, "Provisioning {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Begin a cycle unless one is already running.
    ///
    /// An engine failure leaves the coordinator `Failed` and is returned.
    pub fn start<E: CdmEngine>(&mut self, engine: &mut E) -> Result<StartOutcome> {
        if self.is_active() {
            log!(debug, "Provisioning already in progress");
            return Ok(StartOutcome::AlreadyActive);
        }
        self.transition(ProvisioningState::Requesting)?;
        self.cycles += 1;
        match engine.get_provision_request() {
            Ok(request) => {
                self.transition(ProvisioningState::AwaitingResponse)?;
                log!(
                    info,
                    "Provisioning request ready ({} bytes, url '{}')",
                    request.data.len(),
                    request.default_url
                );
                Ok(StartOutcome::Started(request))
            }
            Err(e) => {
                log!(error, "Failed to get provisioning request: {}", e);
                self.transition(ProvisioningState::Failed)?;
                Err(e.into())
            }
        }
    }

    /// Apply the caller's provisioning response.
    ///
    /// Returns `Ok(false)` without touching the engine when no cycle is
    /// awaiting a response. An empty or unreceived response fails the cycle.
    pub fn apply_response<E: CdmEngine>(
        &mut self,
        engine: &mut E,
        response_received: bool,
        response: &[u8],
    ) -> Result<bool> {
        if !self.is_awaiting_response() {
            log!(warn, "Provisioning response arrived in state {}", self.state);
            return Ok(false);
        }
        self.transition(ProvisioningState::Applying)?;

        if !response_received || response.is_empty() {
            log!(error, "Provisioning response not received");
            self.transition(ProvisioningState::Failed)?;
            return Err(EngineError::InvalidResponse(
                "Provisioning response not received".to_string(),
            )
            .into());
        }

        match engine.provide_provision_response(response) {
            Ok(()) => {
                log!(info, "Provisioning response applied");
                Ok(true)
            }
            Err(e) => {
                log!(error, "Failed to apply provisioning response: {}", e);
                self.transition(ProvisioningState::Failed)?;
                Err(e.into())
            }
        }
    }

    /// Finish the cycle and return to `Idle`.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(ProvisioningState::Idle)
    }

    /// Forget any cycle in flight.
    pub fn reset(&mut self) {
        self.state = ProvisioningState::Idle;
    }
}
