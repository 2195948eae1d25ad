use termchat_keystore::{KeyStore, mask_secret};
use tracing::{debug, info, warn};

use crate::error::{TransportError, ValidationError};

pub const PROMPT_MISSING: &str = "OpenAI API Key not found. Please enter your key:";
pub const PROMPT_CHECK_FAILED: &str =
    "Error checking server key status. Please enter your OpenAI API Key:";
pub const KEY_SAVED: &str = "API Key saved successfully.";

/// Where chat requests get their provider credential from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    ServerManaged,
    LocalKey(String),
    Missing,
}

impl CredentialState {
    /// Secret to attach to chat requests. `None` for server-managed sessions.
    pub fn api_key(&self) -> Option<&str> {
        match self {
            Self::LocalKey(secret) => Some(secret),
            Self::ServerManaged | Self::Missing => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerManaged => "server_managed",
            Self::LocalKey(_) => "local_key",
            Self::Missing => "missing",
        }
    }
}

/// Asks the backend whether it holds a provider credential of its own.
pub trait CredentialCheck: Send + Sync {
    fn has_server_credential(&self) -> Result<bool, TransportError>;
}

/// Identifies one in-flight credential check. Only the newest ticket is honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: CredentialState,
    /// System line to show when the session now needs a key typed in.
    pub prompt: Option<&'static str>,
}

pub struct CredentialService {
    store: Box<dyn KeyStore + Send>,
    state: CredentialState,
    resolved: bool,
    sequence: u64,
    pending: Option<u64>,
}

impl CredentialService {
    pub fn new(store: Box<dyn KeyStore + Send>) -> Self {
        Self {
            store,
            state: CredentialState::Missing,
            resolved: false,
            sequence: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> &CredentialState {
        &self.state
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn is_resolving(&self) -> bool {
        self.pending.is_some()
    }

    pub fn begin_resolution(&mut self) -> ResolutionTicket {
        self.sequence += 1;
        self.pending = Some(self.sequence);
        ResolutionTicket(self.sequence)
    }

    /// Applies a check result. Returns `None` when something newer (a manual
    /// submit or another check) has already superseded `ticket`.
    pub fn complete_resolution(
        &mut self,
        ticket: ResolutionTicket,
        result: Result<bool, TransportError>,
    ) -> Option<Resolution> {
        if self.pending != Some(ticket.0) {
            debug!(ticket = ticket.0, "dropping superseded credential check result");
            return None;
        }
        self.pending = None;
        self.resolved = true;

        let resolution = match result {
            Ok(true) => {
                if let Err(err) = self.store.remove() {
                    warn!(error = %err, "failed to erase local key after server key was found");
                }
                Resolution {
                    state: CredentialState::ServerManaged,
                    prompt: None,
                }
            }
            Ok(false) => match self.read_store() {
                Some(secret) => Resolution {
                    state: CredentialState::LocalKey(secret),
                    prompt: None,
                },
                None => Resolution {
                    state: CredentialState::Missing,
                    prompt: Some(PROMPT_MISSING),
                },
            },
            Err(err) => {
                warn!(error = %err, "credential check failed, falling back to local key");
                match self.read_store() {
                    Some(secret) => Resolution {
                        state: CredentialState::LocalKey(secret),
                        prompt: None,
                    },
                    None => Resolution {
                        state: CredentialState::Missing,
                        prompt: Some(PROMPT_CHECK_FAILED),
                    },
                }
            }
        };
        info!(state = resolution.state.as_str(), "credential resolved");
        self.state = resolution.state.clone();
        Some(resolution)
    }

    /// Synchronous resolution against `check`.
    pub fn resolve(&mut self, check: &dyn CredentialCheck) -> Resolution {
        let ticket = self.begin_resolution();
        let result = check.has_server_credential();
        self.complete_resolution(ticket, result).unwrap_or_else(|| Resolution {
            state: self.state.clone(),
            prompt: None,
        })
    }

    pub fn submit(&mut self, secret: &str) -> Result<CredentialState, ValidationError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(ValidationError::Empty);
        }
        if self.state == CredentialState::ServerManaged {
            return Err(ValidationError::ServerManaged);
        }
        if let Err(err) = self.store.set(secret) {
            warn!(error = %err, "failed to persist key, keeping it for this session only");
        }
        // A manual key outranks any check still in flight.
        self.sequence += 1;
        self.pending = None;
        self.resolved = true;
        self.state = CredentialState::LocalKey(secret.to_string());
        info!(key = %mask_secret(secret), "local key stored");
        Ok(self.state.clone())
    }

    /// Forgets the stored key. A server-managed session stays server-managed.
    pub fn clear(&mut self) {
        if let Err(err) = self.store.remove() {
            warn!(error = %err, "failed to remove stored key");
        }
        if matches!(self.state, CredentialState::LocalKey(_)) {
            self.state = CredentialState::Missing;
        }
        info!(state = self.state.as_str(), "local key cleared");
    }

    pub fn masked_secret(&self) -> Option<String> {
        self.read_store().map(|secret| mask_secret(&secret))
    }

    fn read_store(&self) -> Option<String> {
        match self.store.get() {
            Ok(secret) => secret.filter(|value| !value.is_empty()),
            Err(err) => {
                warn!(error = %err, "failed to read stored key");
                None
            }
        }
    }
}
