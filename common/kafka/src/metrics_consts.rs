/// Messages acknowledged by the broker after `publish`
pub const MESSAGES_PUBLISHED: &str = "kafka_client_messages_published_total";

/// Publishes that failed, labelled by reason
pub const PUBLISH_FAILURES: &str = "kafka_client_publish_failures_total";

/// Messages passed to the message handler
pub const MESSAGES_HANDLED: &str = "kafka_client_messages_handled_total";

/// Messages the handler failed on; they are acknowledged regardless
pub const HANDLER_FAILURES: &str = "kafka_client_handler_failures_total";

/// Consumer group sessions that became active
pub const SESSIONS_STARTED: &str = "kafka_client_sessions_started_total";

/// Consumer group sessions that ended with an error and were retried
pub const SESSION_ERRORS: &str = "kafka_client_session_errors_total";

/// Errors returned by the rdkafka consumer stream, labelled by level
pub const CONSUMER_ERRORS: &str = "kafka_client_consumer_errors_total";

/// Revocations that gave a partition up while its handler was still running
pub const REVOKE_STALLED_HANDLERS: &str = "kafka_client_revoke_stalled_handlers_total";
