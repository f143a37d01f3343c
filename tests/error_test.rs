use std::time::Duration;

use huginn::{HuginnError, RequestStatus, Result};

#[test]
fn test_error_display() {
    let err = HuginnError::Http("connection refused".to_string());
    assert!(err.to_string().contains("connection refused"));
}

#[test]
fn test_timeout_names_the_phase() {
    let err = HuginnError::Timeout("read");
    assert_eq!(err.to_string(), "read timeout elapsed");
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(HuginnError::Timeout("connect"))
    }
    assert!(returns_error().is_err());
}

// ============================================================================
// Finalization status
// ============================================================================

#[test]
fn admission_timeout_is_rejected() {
    let err = HuginnError::AdmissionTimeout {
        waited: Duration::from_millis(250),
    };
    assert_eq!(err.status(), RequestStatus::Rejected);
    assert!(!err.is_upstream());
}

#[test]
fn upstream_failures_are_errors() {
    let errors = [
        HuginnError::Http("connection reset".into()),
        HuginnError::Timeout("write"),
        HuginnError::Timeout("request"),
    ];
    for err in errors {
        assert!(err.is_upstream(), "{err}");
        assert_eq!(err.status(), RequestStatus::Error, "{err}");
    }
}

#[test]
fn json_errors_convert() {
    let err: HuginnError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(matches!(err, HuginnError::Json(_)));
    assert_eq!(err.status(), RequestStatus::Error);
}
