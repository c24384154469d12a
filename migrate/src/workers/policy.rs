//! Classification of export failures into retryable and fatal ones.

/// Error codes of the export tool in `54XYZ` carry the HTTP status `XYZ` of a failed object
/// storage request.
const NETWORK_ERROR_CLASS: i64 = 54;

/// HTTP statuses worth retrying, each with the service error codes it is limited to. An empty
/// list retries every error with that status. `-1` stands for a request that never got a
/// response.
const RETRYABLE_STATUSES: &[(i64, &[&str])] = &[
    (-1, &[]),
    (409, &["IncorrectState"]),
    (429, &[]),
    (500, &[]),
    (502, &[]),
    (503, &[]),
    (504, &[]),
];

/// Statuses retried while a freshly created bucket or policy propagates.
const NOT_FOUND_STATUSES: &[(i64, &[&str])] = &[
    (400, &["RelatedResourceNotAuthorizedOrNotFound"]),
    (404, &["BucketNotFound", "NotAuthorizedOrNotFound"]),
];

/// Decides which failed requests are retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    retry_on_not_found: bool,
}

impl RetryPolicy {
    pub fn new(retry_on_not_found: bool) -> Self {
        Self { retry_on_not_found }
    }

    /// Returns `true` when a request that failed with the HTTP `status` and `message` should be
    /// retried.
    pub fn should_retry(&self, status: i64, message: &str) -> bool {
        let extra: &[(i64, &[&str])] = if self.retry_on_not_found {
            NOT_FOUND_STATUSES
        } else {
            &[]
        };

        RETRYABLE_STATUSES
            .iter()
            .chain(extra)
            .find(|(retryable, _)| *retryable == status)
            .is_some_and(|(_, codes)| {
                codes.is_empty() || codes.iter().any(|code| message.contains(code))
            })
    }

    /// Returns `true` when the export tool error `code` is a network error worth retrying.
    pub fn should_retry_export(&self, code: i64, message: &str) -> bool {
        if code == 0 || message.is_empty() {
            return false;
        }

        code / 1000 == NETWORK_ERROR_CLASS && self.should_retry(code % 1000, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_with_retryable_statuses_are_retried() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry_export(54503, "Service Unavailable"));
        assert!(policy.should_retry_export(54429, "TooManyRequests"));
        assert!(!policy.should_retry_export(54401, "NotAuthenticated"));
        assert!(!policy.should_retry_export(53503, "Service Unavailable"));
        assert!(!policy.should_retry_export(54503, ""));
    }

    #[test]
    fn conflicts_are_retried_for_incorrect_state_only() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry_export(54409, "Conflict (IncorrectState)"));
        assert!(!policy.should_retry_export(54409, "Conflict (NamespaceExists)"));
    }

    #[test]
    fn not_found_is_retried_when_enabled() {
        let message = "Not Found (BucketNotFound)";

        assert!(!RetryPolicy::new(false).should_retry_export(54404, message));
        assert!(RetryPolicy::new(true).should_retry_export(54404, message));
        assert!(!RetryPolicy::new(true).should_retry_export(54404, "Not Found (ObjectNotFound)"));
    }

    #[test]
    fn unanswered_requests_are_retried() {
        assert!(RetryPolicy::default().should_retry(-1, "connection reset"));
    }
}
