//! Per-call confirmation acknowledgments.

use super::error::ConfirmationRequiredError;
use crate::protocol::Capability;

/// Proof that a capability's confirmation message was shown to a human for one call.
///
/// Neither `Clone` nor `Copy`: an acknowledgment is moved into exactly one
/// invocation and consumed there.
#[derive(Debug, PartialEq, Eq)]
pub struct Acknowledgment {
    capability: String,
    message: String,
}

impl Acknowledgment {
    /// `message` must be the text that was presented, verbatim.
    pub fn new(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Acknowledge the message `cap` declares.
    pub fn presented(cap: &Capability) -> Self {
        Self::new(cap.id.clone(), cap.confirmation_message().unwrap_or_default())
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Consume `ack` against the capability's gate.
pub(crate) fn check(cap: &Capability, ack: Option<Acknowledgment>) -> Result<(), ConfirmationRequiredError> {
    if !cap.requires_confirmation() {
        return Ok(());
    }
    let message = cap.confirmation_message().unwrap_or_default();
    match ack {
        Some(ack) if ack.capability == cap.id && ack.message == message => Ok(()),
        _ => Err(ConfirmationRequiredError {
            capability: cap.id.clone(),
            message: message.to_string(),
        }),
    }
}
