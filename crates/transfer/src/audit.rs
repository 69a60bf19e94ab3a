//! Incident reporting for failed operations.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{ErrorKind, VfsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

impl AuditLevel {
    /// Severity of a failure of the given kind.
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ResourceAccess => Self::Critical,
            ErrorKind::ResourceAccessDenied
            | ErrorKind::InvalidResourcePath
            | ErrorKind::IntegrityCheckFailed => Self::Warning,
            _ => Self::Info,
        }
    }
}

/// One audited failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIncident {
    pub level: AuditLevel,
    /// Operation that failed, e.g. `write_block`.
    pub context: String,
    /// Event id, the [`ErrorKind`] identifier.
    pub event: String,
    pub message: String,
}

impl AuditIncident {
    pub fn from_error(context: &str, err: &VfsError) -> Self {
        Self {
            level: AuditLevel::for_kind(err.kind()),
            context: context.to_string(),
            event: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Sink for audit incidents.
pub trait Auditor: Send + Sync {
    fn report(&self, incident: AuditIncident);
}

/// Writes incidents to the `tessera::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn report(&self, incident: AuditIncident) {
        let AuditIncident {
            level,
            context,
            event,
            message,
        } = incident;
        match level {
            AuditLevel::Info => {
                info!(target: "tessera::audit", %context, %event, "{message}")
            }
            AuditLevel::Warning => {
                warn!(target: "tessera::audit", %context, %event, "{message}")
            }
            AuditLevel::Critical => {
                error!(target: "tessera::audit", %context, %event, "{message}")
            }
        }
    }
}

/// Reports `err` unless it was reported before, then marks it.
pub(crate) fn audit_once(auditor: &dyn Auditor, context: &str, err: &mut VfsError) {
    if err.is_audited() {
        return;
    }
    auditor.report(AuditIncident::from_error(context, err));
    err.mark_audited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<AuditIncident>>);

    impl Auditor for Recording {
        fn report(&self, incident: AuditIncident) {
            self.0.lock().unwrap().push(incident);
        }
    }

    #[test]
    fn incident_carries_kind_as_event() {
        let err = VfsError::locked("a.txt");
        let incident = AuditIncident::from_error("request_upload_token", &err);
        assert_eq!(incident.level, AuditLevel::Info);
        assert_eq!(incident.event, "resource_locked");
        assert_eq!(incident.context, "request_upload_token");
    }

    #[test]
    fn errors_are_audited_once() {
        let auditor = Recording::default();
        let mut err = VfsError::access_denied("no read permission");
        audit_once(&auditor, "inner", &mut err);
        audit_once(&auditor, "outer", &mut err);

        let incidents = auditor.0.lock().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].context, "inner");
        assert_eq!(incidents[0].level, AuditLevel::Warning);
        assert!(err.is_audited());
    }

    #[test]
    fn storage_failures_are_critical() {
        let err = VfsError::from(std::io::Error::other("disk gone"));
        assert_eq!(AuditIncident::from_error("x", &err).level, AuditLevel::Critical);
    }
}
