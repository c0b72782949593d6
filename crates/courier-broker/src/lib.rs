// Embedded named-mailbox message broker.
//
// Clients open mailboxes under the broker's queue prefix and submit encoded
// envelopes addressed to a literal queue name or a single-`*` pattern.
// Delivery fans one shared message out to every matched mailbox under a
// deterministic lock order; advisory status/query messages reach every
// opted-in mailbox except the sender's own.
use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use courier_wire::{now_pair, Message, MessageType};

mod advisory;
mod config;
mod counters;
mod mailbox;
mod matcher;

pub use config::BrokerConfig;
pub use counters::{BrokerCounters, CounterSnapshot};
pub use mailbox::Mailbox;
pub use matcher::wildcard_match;

use advisory::AdvisoryNotifier;
use mailbox::DeliveredMessage;
use matcher::is_wildcard;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("mailbox already open: {0}")]
    AlreadyOpen(String),
    #[error("queue not served by this broker: {0}")]
    NotServed(String),
    #[error("broker backlog full ({pending} pending messages)")]
    Backlog { pending: usize },
    #[error("queue backlog rejected delivery to: {queues}")]
    QueueBacklogRejected { queues: String },
    #[error("no matching mailbox for {0}")]
    Undeliverable(String),
    #[error("broker is not accepting messages")]
    NotAccepting,
    #[error(transparent)]
    Protocol(#[from] courier_wire::Error),
}

/// Successful submit: how many mailboxes took the message, which queues are
/// past their warn threshold, and whether an unmatched monitoring message
/// was discarded instead of failing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub delivered: usize,
    pub warned_queues: Vec<String>,
    pub discarded_monitoring: bool,
}

/// RAII handle to an open mailbox; dropping it closes the mailbox and emits
/// the offline advisory.
#[derive(Debug)]
pub struct MailboxHandle {
    broker: Weak<Broker>,
    mailbox: Arc<Mailbox>,
}

impl MailboxHandle {
    pub fn name(&self) -> &str {
        self.mailbox.name()
    }

    pub fn close(self) {}
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.close_mailbox(&self.mailbox);
        }
    }
}

/// In-process message broker.
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use courier_broker::{Broker, BrokerConfig};
/// use courier_wire::Message;
///
/// let broker = Arc::new(Broker::new(BrokerConfig::default()));
/// let mailbox = broker.open("/courier/fst1", false, false).expect("open");
/// let message = Message::to_queue("/courier/fst1", "debug=info");
/// broker.submit(&message.encode()).expect("submit");
/// let batch = broker
///     .receive(&mailbox, Duration::from_secs(1))
///     .expect("receive");
/// let record = Message::split_batch(std::str::from_utf8(&batch).expect("utf8"))
///     .next()
///     .expect("record");
/// assert_eq!(Message::decode(record).expect("decode").body, "debug=info");
/// ```
#[derive(Debug)]
pub struct Broker {
    // Name -> mailbox; one coarse lock, held across a whole delivery so a
    // fan-out is atomic with respect to open/close.
    registry: Mutex<HashMap<String, Arc<Mailbox>, RandomState>>,
    config: BrokerConfig,
    counters: Arc<BrokerCounters>,
    notifier: AdvisoryNotifier,
    accepting: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let notifier = AdvisoryNotifier::new(&config.broker_id, &config.queue_prefix);
        Self {
            registry: Mutex::new(HashMap::with_hasher(RandomState::new())),
            config,
            counters: Arc::new(BrokerCounters::default()),
            notifier,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn counters(&self) -> &BrokerCounters {
        &self.counters
    }

    /// Whether submits are currently taken. The decision to park the broker
    /// belongs to a collaborator; the core only exposes the flag.
    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Register a mailbox and announce it to advisory subscribers.
    pub fn open(
        self: &Arc<Self>,
        name: &str,
        advisory_status: bool,
        advisory_query: bool,
    ) -> Result<MailboxHandle> {
        if !name.starts_with(&self.config.queue_prefix) {
            return Err(BrokerError::NotServed(name.to_string()));
        }
        let mailbox = Arc::new(Mailbox::new(name, advisory_status, advisory_query));
        {
            let mut registry = self.registry.lock();
            if registry.contains_key(name) {
                return Err(BrokerError::AlreadyOpen(name.to_string()));
            }
            registry.insert(name.to_string(), Arc::clone(&mailbox));
        }
        info!(queue = %name, advisory_status, advisory_query, "mailbox opened");
        self.send_advisory(self.notifier.status(name, true));
        Ok(MailboxHandle {
            broker: Arc::downgrade(self),
            mailbox,
        })
    }

    /// Admit, stamp and deliver an encoded envelope.
    pub fn submit(&self, raw: &str) -> Result<SubmitOutcome> {
        if !self.accepting() {
            return Err(BrokerError::NotAccepting);
        }
        // Admission runs before decode so an overloaded broker sheds load
        // without paying for parsing.
        let pending = self.counters.pending();
        if pending >= self.config.max_message_backlog {
            self.counters.backlog_deferred_inc();
            warn!(pending, limit = self.config.max_message_backlog, "backlog full, submit refused");
            return Err(BrokerError::Backlog { pending });
        }
        let mut message = Message::decode(raw)?;
        // Status and query traffic is accounted separately as advisory.
        if message.header.mtype.is_advisory() {
            self.counters.advisory_inc();
        } else {
            self.counters.received_inc();
        }
        message.header.broker_id = self.config.broker_id.clone();
        message.header.broker_time = now_pair();
        self.deliver(&message)
    }

    /// Drain a mailbox into its batch buffer and report the batch size.
    pub fn poll(&self, handle: &MailboxHandle) -> usize {
        if self.config.poll_sends_query && handle.mailbox.wants_advisory_query() {
            self.send_advisory(self.notifier.query(handle.name()));
        }
        let size = handle.mailbox.poll();
        if size == 0 {
            self.counters.no_messages_inc();
        }
        size
    }

    /// Consume batched bytes into `buf`; returns the number copied.
    pub fn read(&self, handle: &MailboxHandle, buf: &mut [u8]) -> usize {
        handle.mailbox.read(buf)
    }

    /// Block until the mailbox has something deliverable, then take the
    /// whole batch. `None` on timeout or close.
    pub fn receive(&self, handle: &MailboxHandle, timeout: Duration) -> Option<Bytes> {
        handle.mailbox.receive(timeout)
    }

    // Fan a message out to every matched mailbox. The registry lock is held
    // for the whole delivery; mailbox locks are taken in name order, all
    // before any mutation.
    fn deliver(&self, message: &Message) -> Result<SubmitOutcome> {
        let destination = &message.header.receiver_queue;
        let sender = &message.header.sender_id;
        let registry = self.registry.lock();

        let mut candidates: SmallVec<[Arc<Mailbox>; 4]> = SmallVec::new();
        if message.header.mtype.is_advisory() {
            let wants = |mailbox: &Mailbox| match message.header.mtype {
                MessageType::Status => mailbox.wants_advisory_status(),
                MessageType::Query => mailbox.wants_advisory_query(),
                MessageType::Message => false,
            };
            for (name, mailbox) in registry.iter() {
                if name != sender && wants(mailbox) {
                    candidates.push(Arc::clone(mailbox));
                }
            }
        } else if is_wildcard(destination) {
            for (name, mailbox) in registry.iter() {
                if name != sender && wildcard_match(destination, name) {
                    candidates.push(Arc::clone(mailbox));
                }
            }
        } else if let Some(mailbox) = registry.get(destination) {
            candidates.push(Arc::clone(mailbox));
        }
        candidates.sort_by(|a, b| a.name().cmp(b.name()));

        let delivered_message = DeliveredMessage::new(message.encode(), Arc::clone(&self.counters));
        let mut guards: Vec<_> = candidates.iter().map(|mailbox| mailbox.lock()).collect();

        let mut delivered = 0usize;
        let mut warned_queues = Vec::new();
        let mut rejected_queues = Vec::new();
        for (mailbox, guard) in candidates.iter().zip(guards.iter_mut()) {
            let queued = guard.queued();
            if queued >= self.config.reject_queue_backlog {
                self.counters.queue_backlog_hit_inc();
                warn!(queue = %mailbox.name(), queued, "queue backlog, delivery rejected");
                rejected_queues.push(mailbox.name().to_string());
                continue;
            }
            if queued > self.config.warn_queue_backlog {
                warn!(queue = %mailbox.name(), queued, "queue backlog warning");
                warned_queues.push(mailbox.name().to_string());
            }
            if guard.push(&delivered_message) {
                mailbox.notify();
                delivered += 1;
            }
        }
        // The gauge must move up before any mailbox lock is released: once a
        // guard drops, a concurrent drain may release the last hold, and its
        // decrement has to find the increment already in place.
        if delivered > 0 {
            self.counters.pending_inc();
            self.counters.delivered_add(delivered as u64);
        }
        drop(guards);
        drop(registry);
        if !rejected_queues.is_empty() {
            return Err(BrokerError::QueueBacklogRejected {
                queues: rejected_queues.join(","),
            });
        }
        if delivered == 0 {
            if message.monitor {
                self.counters.discarded_monitoring_inc();
                debug!(destination = %destination, "monitoring message discarded");
                return Ok(SubmitOutcome {
                    discarded_monitoring: true,
                    ..SubmitOutcome::default()
                });
            }
            self.counters.undeliverable_inc();
            return Err(BrokerError::Undeliverable(destination.clone()));
        }
        debug!(destination = %destination, delivered, "message delivered");
        Ok(SubmitOutcome {
            delivered,
            warned_queues,
            discarded_monitoring: false,
        })
    }

    // Deliver an advisory, counting it and swallowing delivery failures.
    fn send_advisory(&self, message: Message) {
        self.counters.advisory_inc();
        match self.deliver(&message) {
            Ok(outcome) => {
                debug!(queue = %message.header.sender_id, delivered = outcome.delivered, "advisory delivered")
            }
            Err(err) => debug!(queue = %message.header.sender_id, %err, "advisory not delivered"),
        }
    }

    // Close path: announce offline while still registered, then unregister
    // and drain. The deletion guard inside Mailbox::close serializes this
    // against an in-flight poll.
    fn close_mailbox(&self, mailbox: &Arc<Mailbox>) {
        {
            let registry = self.registry.lock();
            match registry.get(mailbox.name()) {
                Some(current) if Arc::ptr_eq(current, mailbox) => {}
                _ => return,
            }
        }
        self.send_advisory(self.notifier.status(mailbox.name(), false));
        {
            let mut registry = self.registry.lock();
            if let Some(current) = registry.get(mailbox.name()) {
                if Arc::ptr_eq(current, mailbox) {
                    registry.remove(mailbox.name());
                }
            }
        }
        mailbox.close();
        info!(queue = %mailbox.name(), "mailbox closed");
    }
}
