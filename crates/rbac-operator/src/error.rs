//! Error types for the RBAC operator

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error that could not be classified further
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The RbacDefinition cannot be compiled into RBAC objects
    #[error("Invalid RbacDefinition spec: {0}")]
    InvalidSpec(String),

    /// A desired object collides with an object this definition must not overwrite
    #[error("Ownership conflict on {kind} {name}: {reason}")]
    Conflict {
        kind: String,
        name: String,
        reason: String,
    },

    /// API call failed due to network problems or contention
    #[error("Transient error: {0}")]
    Transient(String),

    /// Some objects converged, others did not
    #[error("{} object(s) failed to converge: {}", .failures.len(), summarize(.failures))]
    PartialFailure { failures: Vec<ObjectFailure> },

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Resource already exists
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Watch stream delivered an object that is not of the expected kind
    #[error("Failed to decode {kind} from watch event: {message}")]
    Decode { kind: String, message: String },

    /// Watch stream failed
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// A single object that could not be converged during a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
    /// Kind of the object (`RoleBinding`, ...)
    pub kind: String,
    /// `namespace/name` or `name` for cluster-scoped objects
    pub name: String,
    /// What went wrong
    pub message: String,
    /// Whether retrying the reconcile can fix this
    pub retryable: bool,
}

impl ObjectFailure {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, error: &OperatorError) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

impl fmt::Display for ObjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.message)
    }
}

fn summarize(failures: &[ObjectFailure]) -> String {
    const SHOWN: usize = 3;
    let mut parts: Vec<String> = failures.iter().take(SHOWN).map(|f| f.to_string()).collect();
    if failures.len() > SHOWN {
        parts.push(format!("and {} more", failures.len() - SHOWN));
    }
    parts.join("; ")
}

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::KubeError(_)
            | OperatorError::Transient(_)
            | OperatorError::WatchError(_)
            | OperatorError::NotFound { .. }
            | OperatorError::AlreadyExists { .. } => true,
            OperatorError::PartialFailure { failures } => failures.iter().any(|f| f.retryable),
            _ => false,
        }
    }

    /// Check if this error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(e) => is_kube_not_found(e),
            _ => false,
        }
    }

    /// Check if this error means the target object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            OperatorError::AlreadyExists { .. } => true,
            OperatorError::KubeError(e) => is_kube_already_exists(e),
            _ => false,
        }
    }

    /// Short machine-readable label, used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::KubeError(_) => "kube",
            OperatorError::InvalidSpec(_) => "invalid_spec",
            OperatorError::Conflict { .. } => "conflict",
            OperatorError::Transient(_) => "transient",
            OperatorError::PartialFailure { .. } => "partial_failure",
            OperatorError::NotFound { .. } => "not_found",
            OperatorError::AlreadyExists { .. } => "already_exists",
            OperatorError::Decode { .. } => "decode",
            OperatorError::WatchError(_) => "watch",
            OperatorError::SerializationError(_) | OperatorError::YamlError(_) => "serialization",
            OperatorError::Internal(_) => "internal",
        }
    }

    /// Get a suggested requeue delay for retryable errors
    ///
    /// `attempt` starts at 1 for the first failure.
    pub fn requeue_delay(&self, attempt: u32, base: Duration, max: Duration) -> Option<Duration> {
        if self.is_retryable() {
            Some(exponential_backoff(attempt, base, max))
        } else {
            None
        }
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`
pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

pub(crate) fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

pub(crate) fn is_kube_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::NotFound {
            kind: "RoleBinding".to_string(),
            name: "team-a-edit-0".to_string(),
            namespace: "ns1".to_string(),
        };
        assert!(err.to_string().contains("RoleBinding"));
        assert!(err.to_string().contains("team-a-edit-0"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(OperatorError::Transient("timeout".into()).is_retryable());
        assert!(!OperatorError::InvalidSpec("no subjects".into()).is_retryable());

        let conflict = OperatorError::Conflict {
            kind: "ClusterRole".into(),
            name: "reader".into(),
            reason: "owned by another definition".into(),
        };
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_partial_failure_retryable_if_any_member_is() {
        let transient = ObjectFailure::new(
            "RoleBinding",
            "ns1/a",
            &OperatorError::Transient("connection reset".into()),
        );
        let conflict = ObjectFailure::new(
            "ClusterRole",
            "reader",
            &OperatorError::Conflict {
                kind: "ClusterRole".into(),
                name: "reader".into(),
                reason: "content differs".into(),
            },
        );

        let only_conflicts = OperatorError::PartialFailure {
            failures: vec![conflict.clone()],
        };
        assert!(!only_conflicts.is_retryable());

        let mixed = OperatorError::PartialFailure {
            failures: vec![conflict, transient],
        };
        assert!(mixed.is_retryable());
        assert!(mixed.to_string().starts_with("2 object(s)"));
    }

    #[test]
    fn test_partial_failure_summary_truncates() {
        let failures: Vec<ObjectFailure> = (0..5)
            .map(|i| ObjectFailure {
                kind: "RoleBinding".into(),
                name: format!("ns{}/rb", i),
                message: "boom".into(),
                retryable: true,
            })
            .collect();
        let msg = OperatorError::PartialFailure { failures }.to_string();
        assert!(msg.contains("ns2/rb"));
        assert!(!msg.contains("ns3/rb"));
        assert!(msg.contains("and 2 more"));
    }

    #[test]
    fn test_requeue_delay() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        let retryable = OperatorError::Transient("test".to_string());
        assert_eq!(retryable.requeue_delay(1, base, max), Some(base));
        assert_eq!(
            retryable.requeue_delay(3, base, max),
            Some(Duration::from_secs(20))
        );
        assert_eq!(retryable.requeue_delay(30, base, max), Some(max));

        let not_retryable = OperatorError::InvalidSpec("test".to_string());
        assert!(not_retryable.requeue_delay(1, base, max).is_none());
    }

    #[test]
    fn test_not_found_classification() {
        let err = OperatorError::NotFound {
            kind: "ServiceAccount".into(),
            name: "sa".into(),
            namespace: "default".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert!(!OperatorError::Internal("x".into()).is_not_found());
    }
}
