//! Asynchronous audit recording.
//!
//! Requests are captured after the response is produced and pushed onto a
//! bounded channel; a background task drains it into the store. Drops and
//! write failures are logged, never surfaced.

use tokio::sync::mpsc;
use tracing::warn;

use crate::database::AuditRepository;
use crate::models::NewAuditRecord;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<NewAuditRecord>,
}

impl AuditRecorder {
    /// Spawn the drain task and return the handle used to enqueue records.
    pub fn start(repository: AuditRepository) -> Self {
        let (tx, mut rx) = mpsc::channel::<NewAuditRecord>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = repository.insert(&record).await {
                    warn!(error = %e, action = %record.action, "audit write failed");
                }
            }
        });
        Self { tx }
    }

    /// Non-blocking enqueue; a full channel drops the record.
    pub fn record(&self, record: NewAuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!(error = %e, "audit record dropped");
        }
    }
}

/// Derive `(action, resource_type)` from the request line.
pub fn derive_action(method: &str, path: &str) -> (&'static str, &'static str) {
    let method = method.to_ascii_uppercase();
    if path.starts_with("/fhir/CodeSystem/$lookup") {
        return ("LOOKUP", "CodeSystem");
    }
    if path.starts_with("/fhir/ConceptMap/$translate") {
        return ("TRANSLATE", "ConceptMap");
    }
    if path.starts_with("/fhir/ValueSet/$expand") {
        return ("EXPAND", "ValueSet");
    }
    if path.starts_with("/fhir") {
        return ("READ", "CodeSystem");
    }
    if path.starts_with("/mapping/batch") {
        return match method.as_str() {
            "POST" => ("BATCH_TRANSLATE", "ConceptMap"),
            "DELETE" => ("CANCEL_BATCH", "ConceptMap"),
            _ => ("READ_BATCH", "ConceptMap"),
        };
    }
    if path.starts_with("/mapping") {
        return match method.as_str() {
            "POST" => ("TRANSLATE", "ConceptMap"),
            "PATCH" => ("VALIDATE", "ConceptMap"),
            _ => ("LIST", "ConceptMap"),
        };
    }
    if path.starts_with("/autocomplete") {
        return ("SEARCH", "CodeSystem");
    }
    if path.starts_with("/admin") {
        return ("ADMIN", "System");
    }
    ("REQUEST", "System")
}

/// Health and metrics probes are not audited.
pub fn is_audited(path: &str) -> bool {
    !(path.starts_with("/health") || path.starts_with("/metrics"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_derivation() {
        assert_eq!(derive_action("POST", "/mapping"), ("TRANSLATE", "ConceptMap"));
        assert_eq!(
            derive_action("POST", "/mapping/batch/async"),
            ("BATCH_TRANSLATE", "ConceptMap")
        );
        assert_eq!(
            derive_action("DELETE", "/mapping/batch/42"),
            ("CANCEL_BATCH", "ConceptMap")
        );
        assert_eq!(
            derive_action("PATCH", "/mapping/42/validate"),
            ("VALIDATE", "ConceptMap")
        );
        assert_eq!(
            derive_action("POST", "/fhir/ConceptMap/$translate"),
            ("TRANSLATE", "ConceptMap")
        );
        assert_eq!(
            derive_action("GET", "/fhir/CodeSystem/$lookup"),
            ("LOOKUP", "CodeSystem")
        );
        assert_eq!(derive_action("GET", "/autocomplete/source"), ("SEARCH", "CodeSystem"));
    }

    #[test]
    fn probes_are_not_audited() {
        assert!(!is_audited("/health"));
        assert!(!is_audited("/health/ready"));
        assert!(!is_audited("/metrics"));
        assert!(is_audited("/mapping"));
    }
}
