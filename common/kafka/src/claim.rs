use futures::StreamExt;
use tracing::{debug, error};

use crate::broker::{GroupSession, PartitionClaim};
use crate::message::MessageHandler;
use crate::metrics_consts::{HANDLER_FAILURES, MESSAGES_HANDLED};

/// Pumps one partition claim through `handler` until the claim's stream ends.
///
/// Each message is handled at most once and marked right after the handler
/// returns, whatever the outcome, so the partition keeps moving past messages
/// that cannot be processed. Returns the number of messages marked.
pub async fn process_claim(
    handler: &dyn MessageHandler,
    session: &dyn GroupSession,
    claim: PartitionClaim,
) -> u64 {
    let topic = claim.topic().to_string();
    let partition = claim.partition();
    debug!(topic = %topic, partition, "Consuming partition claim");

    let mut messages = claim.into_messages();
    let mut marked = 0;

    while let Some(message) = messages.next().await {
        match handler.handle_message(&message).await {
            Ok(()) => {
                metrics::counter!(MESSAGES_HANDLED, "topic" => topic.clone()).increment(1);
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    partition,
                    offset = message.offset,
                    "Handler error: {e:#}"
                );
                metrics::counter!(HANDLER_FAILURES, "topic" => topic.clone()).increment(1);
            }
        }
        session.mark_message(&message);
        marked += 1;
    }

    debug!(topic = %topic, partition, marked, "Partition claim released");
    marked
}
