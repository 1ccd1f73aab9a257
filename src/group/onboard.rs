//! Onboarding handshake: bring a newcomer to topic parity.
//!
//! All envelopes of one handshake share the initial request's correlation
//! id. In `open` mode a sponsor completes immediately; in `gated` mode the
//! newcomer must answer a capability challenge first. Only the addressed
//! agent processes each step.

use crate::config::OnboardMode;
use crate::group::envelope::{
    AgentIdentity, Envelope, EnvelopeType, OnboardAction, OnboardPayload,
};
use crate::ledger::group::TopicManifest;
use std::collections::HashMap;

/// Newcomer-side progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewcomerState {
    Idle,
    Requested { correlation_id: String },
    Joined,
    Rejected,
}

/// What the router should do after one onboarding envelope.
#[derive(Debug, Default)]
pub struct OnboardOutcome {
    /// Envelopes to publish on the onboarding topic.
    pub replies: Vec<Envelope>,
    /// Manifest to adopt (newcomer received Complete).
    pub adopt_manifest: Option<TopicManifest>,
    /// The local agent just joined and should announce itself.
    pub joined: bool,
}

/// Both sides of the handshake for the local agent.
pub struct Onboarding {
    mode: OnboardMode,
    state: NewcomerState,
    /// Sponsor side: correlation id -> challenged newcomer id.
    pending_challenges: HashMap<String, String>,
}

impl Onboarding {
    pub fn new(mode: OnboardMode) -> Self {
        Self { mode, state: NewcomerState::Idle, pending_challenges: HashMap::new() }
    }

    pub fn state(&self) -> &NewcomerState {
        &self.state
    }

    /// Newcomer: open the handshake.
    pub fn start(&mut self, identity: &AgentIdentity) -> Envelope {
        let envelope = Envelope::new(
            EnvelopeType::Onboard,
            identity.agent_id.clone(),
            serde_json::to_value(OnboardPayload {
                action: OnboardAction::Request,
                identity: Some(identity.clone()),
                manifest: None,
                challenge: None,
                answer: None,
                target_id: None,
            })
            .unwrap_or_default(),
        );
        self.state = NewcomerState::Requested { correlation_id: envelope.correlation_id.clone() };
        tracing::info!(correlation_id = %envelope.correlation_id, "onboarding requested");
        envelope
    }

    /// Drive the state machine with one received onboarding envelope.
    pub fn handle(
        &mut self,
        local: &AgentIdentity,
        manifest: &TopicManifest,
        envelope: &Envelope,
        payload: OnboardPayload,
    ) -> OnboardOutcome {
        let mut outcome = OnboardOutcome::default();

        // Steps addressed to somebody else are not ours to process.
        if let Some(target) = &payload.target_id {
            if target != &local.agent_id {
                return outcome;
            }
        }

        match payload.action {
            // Sponsor side: a newcomer asked in.
            OnboardAction::Request => match self.mode {
                OnboardMode::Open => {
                    outcome.replies.push(self.complete(local, manifest, envelope));
                }
                OnboardMode::Gated => {
                    self.pending_challenges
                        .insert(envelope.correlation_id.clone(), envelope.sender_id.clone());
                    outcome.replies.push(
                        Envelope::new(
                            EnvelopeType::Onboard,
                            local.agent_id.clone(),
                            serde_json::to_value(OnboardPayload {
                                action: OnboardAction::Challenge,
                                identity: None,
                                manifest: None,
                                challenge: Some(
                                    "describe your capabilities and intended role".into(),
                                ),
                                answer: None,
                                target_id: Some(envelope.sender_id.clone()),
                            })
                            .unwrap_or_default(),
                        )
                        .with_correlation(envelope.correlation_id.clone()),
                    );
                }
            },

            // Newcomer side: answer the sponsor's challenge.
            OnboardAction::Challenge => {
                if let NewcomerState::Requested { correlation_id } = &self.state {
                    if correlation_id == &envelope.correlation_id {
                        let answer = format!(
                            "capabilities: {}; role: {}",
                            local.capabilities.join(", "),
                            local.role.as_str(),
                        );
                        outcome.replies.push(
                            Envelope::new(
                                EnvelopeType::Onboard,
                                local.agent_id.clone(),
                                serde_json::to_value(OnboardPayload {
                                    action: OnboardAction::Response,
                                    identity: Some(local.clone()),
                                    manifest: None,
                                    challenge: None,
                                    answer: Some(answer),
                                    target_id: Some(envelope.sender_id.clone()),
                                })
                                .unwrap_or_default(),
                            )
                            .with_correlation(envelope.correlation_id.clone()),
                        );
                    }
                }
            }

            // Sponsor side: validate the challenge answer.
            OnboardAction::Response => {
                if self.pending_challenges.remove(&envelope.correlation_id).is_some() {
                    let accepted = payload
                        .answer
                        .as_deref()
                        .map(|a| !a.trim().is_empty())
                        .unwrap_or(false);
                    if accepted {
                        outcome.replies.push(self.complete(local, manifest, envelope));
                    } else {
                        outcome.replies.push(
                            Envelope::new(
                                EnvelopeType::Onboard,
                                local.agent_id.clone(),
                                serde_json::to_value(OnboardPayload {
                                    action: OnboardAction::Reject,
                                    identity: None,
                                    manifest: None,
                                    challenge: None,
                                    answer: None,
                                    target_id: Some(envelope.sender_id.clone()),
                                })
                                .unwrap_or_default(),
                            )
                            .with_correlation(envelope.correlation_id.clone()),
                        );
                    }
                }
            }

            // Newcomer side: adopt the manifest and auto-join.
            OnboardAction::Complete => {
                if let NewcomerState::Requested { correlation_id } = &self.state {
                    if correlation_id == &envelope.correlation_id {
                        outcome.adopt_manifest = payload.manifest;
                        outcome.joined = true;
                        self.state = NewcomerState::Joined;
                        tracing::info!("onboarding complete, joined group");
                    }
                }
            }

            OnboardAction::Reject => {
                if let NewcomerState::Requested { correlation_id } = &self.state {
                    if correlation_id == &envelope.correlation_id {
                        self.state = NewcomerState::Rejected;
                        tracing::warn!("onboarding rejected by sponsor");
                    }
                }
            }
        }

        outcome
    }

    fn complete(
        &self,
        local: &AgentIdentity,
        manifest: &TopicManifest,
        request: &Envelope,
    ) -> Envelope {
        Envelope::new(
            EnvelopeType::Onboard,
            local.agent_id.clone(),
            serde_json::to_value(OnboardPayload {
                action: OnboardAction::Complete,
                identity: None,
                manifest: Some(manifest.clone()),
                challenge: None,
                answer: None,
                target_id: Some(request.sender_id.clone()),
            })
            .unwrap_or_default(),
        )
        .with_correlation(request.correlation_id.clone())
    }
}
