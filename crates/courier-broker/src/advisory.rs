// Builds the status and query messages fanned out on open, close and poll.
use courier_wire::{now_pair, Message, MessageType};

#[derive(Debug)]
pub(crate) struct AdvisoryNotifier {
    broker_id: String,
    queue_prefix: String,
}

impl AdvisoryNotifier {
    pub(crate) fn new(broker_id: impl Into<String>, queue_prefix: impl Into<String>) -> Self {
        Self {
            broker_id: broker_id.into(),
            queue_prefix: queue_prefix.into(),
        }
    }

    /// Queue went online or offline. Sender is the queue itself so the
    /// dispatcher's exclusion rule keeps it out of its own mailbox.
    pub(crate) fn status(&self, queue: &str, online: bool) -> Message {
        self.build(MessageType::Status, queue, online)
    }

    /// Ask opted-in peers to republish their state.
    pub(crate) fn query(&self, queue: &str) -> Message {
        self.build(MessageType::Query, queue, true)
    }

    fn build(&self, mtype: MessageType, queue: &str, online: bool) -> Message {
        let destination = format!("{}*", self.queue_prefix);
        let mut message = Message::advisory(mtype, destination, queue, online);
        message.header.sender_id = queue.to_string();
        message.header.broker_id = self.broker_id.clone();
        message.header.broker_time = now_pair();
        message.header.description = match (mtype, online) {
            (MessageType::Query, _) => "advisory query".to_string(),
            (_, true) => "advisory online".to_string(),
            (_, false) => "advisory offline".to_string(),
        };
        message
    }
}
