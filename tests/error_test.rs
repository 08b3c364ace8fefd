use std::error::Error;
use std::time::Duration;

use mimir::{FailureKind, LoadError, MimirError, Result};

#[test]
fn test_error_display() {
    let err = MimirError::ModelNotFound("/models/gone.gguf".to_string());
    assert!(err.to_string().contains("/models/gone.gguf"));

    let err = MimirError::AcquireTimeout {
        path: "/models/a.gguf".to_string(),
        waited: Duration::from_millis(1500),
    };
    assert!(err.to_string().contains("/models/a.gguf"));
    assert!(err.to_string().contains("1.5s"));
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(MimirError::ShuttingDown)
    }
    assert!(returns_error().is_err());
}

#[test]
fn loader_failure_keeps_backend_error_as_source() {
    let err = MimirError::LoaderFailure {
        path: "/models/a.gguf".to_string(),
        source: LoadError::new("invalid magic number"),
    };
    assert!(err.to_string().contains("invalid magic number"));
    let source = err.source().expect("source");
    assert_eq!(source.to_string(), "invalid magic number");
}

// ============================================================================
// Failure classification
// ============================================================================

#[test]
fn errors_map_onto_failure_kinds() {
    let cases = [
        (
            MimirError::AcquireTimeout {
                path: String::new(),
                waited: Duration::ZERO,
            },
            FailureKind::AcquireTimeout,
        ),
        (
            MimirError::QueueFull {
                waited: Duration::ZERO,
            },
            FailureKind::QueueFull,
        ),
        (MimirError::ShuttingDown, FailureKind::QueueFull),
        (
            MimirError::LoaderFailure {
                path: String::new(),
                source: LoadError::new("x"),
            },
            FailureKind::LoaderFailure,
        ),
        (
            MimirError::ModelNotFound(String::new()),
            FailureKind::LoaderFailure,
        ),
        (
            MimirError::InferenceFailure(String::new()),
            FailureKind::InferenceFailure,
        ),
        (
            MimirError::InferenceTimeout(Duration::from_secs(1)),
            FailureKind::InferenceFailure,
        ),
        (
            MimirError::Configuration(String::new()),
            FailureKind::Other,
        ),
        (MimirError::InvalidInput(String::new()), FailureKind::Other),
    ];

    for (err, kind) in cases {
        assert_eq!(err.kind(), kind, "{err}");
    }
}

#[test]
fn only_capacity_errors_are_recoverable() {
    assert!(
        MimirError::AcquireTimeout {
            path: String::new(),
            waited: Duration::ZERO
        }
        .is_recoverable()
    );
    assert!(
        MimirError::QueueFull {
            waited: Duration::ZERO
        }
        .is_recoverable()
    );
    assert!(MimirError::ShuttingDown.is_recoverable());

    assert!(
        !MimirError::LoaderFailure {
            path: String::new(),
            source: LoadError::new("x")
        }
        .is_recoverable()
    );
    assert!(!MimirError::InferenceFailure(String::new()).is_recoverable());
    assert!(!MimirError::InferenceTimeout(Duration::ZERO).is_recoverable());
    assert!(!MimirError::Configuration(String::new()).is_recoverable());
}

#[test]
fn failure_kinds_serialize_as_snake_case() {
    for kind in [
        FailureKind::AcquireTimeout,
        FailureKind::QueueFull,
        FailureKind::ResultTimeout,
        FailureKind::LoaderFailure,
        FailureKind::InferenceFailure,
        FailureKind::Other,
    ] {
        let json = serde_json::to_value(kind).unwrap();
        assert_eq!(json, kind.as_str());
    }
}
