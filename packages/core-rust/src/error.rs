//! Error metadata persisted on operations.
//!
//! [`LastError`] records which dependency a failing step was talking to and
//! a short reason. Everything stored here is visible to pollers, so reasons
//! pass through [`sanitize_reason`] before they are attached.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length (in characters) of a persisted error reason.
pub const MAX_REASON_LEN: usize = 512;

static SECRET_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(password|passwd|client_secret|clientsecret|secret|access_token|token|api_key|apikey|kubeconfig)\s*[=:]\s*("[^"]*"|\S+)"#,
    )
    .unwrap_or_else(|_| unreachable!("static pattern is valid"))
});

/// Dependency a failing step was interacting with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorComponent {
    NotSet,
    Broker,
    Database,
    KubernetesApi,
    InfrastructureManager,
    LifecycleManager,
    Gardener,
}

impl ErrorComponent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorComponent::NotSet => "not set",
            ErrorComponent::Broker => "broker",
            ErrorComponent::Database => "db",
            ErrorComponent::KubernetesApi => "k8s api",
            ErrorComponent::InfrastructureManager => "infrastructure manager",
            ErrorComponent::LifecycleManager => "lifecycle manager",
            ErrorComponent::Gardener => "gardener",
        }
    }
}

impl fmt::Display for ErrorComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent error observed while processing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub component: ErrorComponent,
    /// Name of the step that reported the error.
    pub step: String,
    /// Author-controlled summary (the description passed by the step).
    pub message: String,
    /// Sanitized text of the underlying cause, if any.
    pub reason: String,
}

impl LastError {
    /// Builds a `LastError`, sanitizing the cause text.
    #[must_use]
    pub fn new(
        component: ErrorComponent,
        step: impl Into<String>,
        message: impl Into<String>,
        cause: Option<&str>,
    ) -> Self {
        Self {
            component,
            step: step.into(),
            message: message.into(),
            reason: cause.map(sanitize_reason).unwrap_or_default(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.step, self.component, self.message)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Masks credential-looking `key=value` pairs and truncates to
/// [`MAX_REASON_LEN`] characters.
#[must_use]
pub fn sanitize_reason(text: &str) -> String {
    let masked = SECRET_PAIR.replace_all(text, "$1=***");
    let mut out: String = masked.chars().take(MAX_REASON_LEN).collect();
    if masked.chars().count() > MAX_REASON_LEN {
        out.push_str("...");
    }
    out
}
