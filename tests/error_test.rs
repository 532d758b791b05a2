//! Stable error codes surfaced to clients.

use relay_rs::error::Error;
use relay_rs::model::JobStatus;

#[test]
fn every_error_kind_maps_to_a_client_code() {
    let cases = [
        (Error::Overloaded { depth: 10, ceiling: 5 }, "OVERLOADED"),
        (
            Error::UnresolvableDependencies {
                plan_id: "p".to_string(),
                pending: vec!["a".to_string()],
            },
            "PLAN_CYCLE_OR_MISSING_DEPENDENCY",
        ),
        (
            Error::StepFailed {
                step_id: "a".to_string(),
                message: "boom".to_string(),
            },
            "STEP_EXECUTION_FAILURE",
        ),
        (Error::InvalidPlan("x".to_string()), "INVALID_PLAN"),
        (Error::Delivery("x".to_string()), "DELIVERY_FAILURE"),
        (
            Error::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Processing,
            },
            "INVALID_TRANSITION",
        ),
        (Error::Tool("x".to_string()), "TRANSIENT_WORKER_FAILURE"),
        (Error::Completion("x".to_string()), "TRANSIENT_WORKER_FAILURE"),
        (Error::Config("x".to_string()), "CONFIG"),
        (Error::Other("x".to_string()), "INTERNAL"),
    ];
    for (error, code) in cases {
        assert_eq!(error.code(), code, "{error}");
    }
}
