// Per-queue FIFO state plus the shared, hold-counted message wrapper.
use crate::counters::BrokerCounters;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One admitted message shared by every mailbox it was delivered to.
///
/// The hold count tracks queue membership. Whichever drain drops it to zero
/// performs the reclaim bookkeeping, so the global pending gauge moves down
/// exactly once per message.
#[derive(Debug)]
pub(crate) struct DeliveredMessage {
    wire: String,
    holds: AtomicUsize,
    counters: Arc<BrokerCounters>,
}

impl DeliveredMessage {
    pub(crate) fn new(wire: String, counters: Arc<BrokerCounters>) -> Arc<Self> {
        Arc::new(Self {
            wire,
            holds: AtomicUsize::new(0),
            counters,
        })
    }

    pub(crate) fn wire(&self) -> &str {
        &self.wire
    }

    pub(crate) fn add_hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_hold(&self) {
        if self.holds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counters.pending_dec();
        }
    }

    #[cfg(test)]
    pub(crate) fn holds(&self) -> usize {
        self.holds.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MailboxInner {
    queue: VecDeque<Arc<DeliveredMessage>>,
    // Drained wire forms not yet consumed by read/receive.
    batch: BytesMut,
    closed: bool,
}

impl MailboxInner {
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Append at the FIFO tail; refused once the mailbox is closed.
    pub(crate) fn push(&mut self, message: &Arc<DeliveredMessage>) -> bool {
        if self.closed {
            return false;
        }
        message.add_hold();
        self.queue.push_back(Arc::clone(message));
        true
    }

    // Move the whole FIFO into the batch buffer, newline separated,
    // releasing each hold as it goes.
    fn drain(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            self.batch.extend_from_slice(message.wire().as_bytes());
            self.batch.extend_from_slice(b"\n");
            message.release_hold();
        }
    }
}

/// A named FIFO endpoint registered with the broker.
#[derive(Debug)]
pub struct Mailbox {
    name: String,
    advisory_status: bool,
    advisory_query: bool,
    inner: Mutex<MailboxInner>,
    readable: Condvar,
    // Serializes close against an in-flight poll.
    deletion: Mutex<()>,
}

impl Mailbox {
    pub(crate) fn new(name: impl Into<String>, advisory_status: bool, advisory_query: bool) -> Self {
        Self {
            name: name.into(),
            advisory_status,
            advisory_query,
            inner: Mutex::new(MailboxInner::default()),
            readable: Condvar::new(),
            deletion: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wants_advisory_status(&self) -> bool {
        self.advisory_status
    }

    pub fn wants_advisory_query(&self) -> bool {
        self.advisory_query
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MailboxInner> {
        self.inner.lock()
    }

    pub(crate) fn notify(&self) {
        self.readable.notify_all();
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queued()
    }

    /// Drain pending messages into the batch buffer and report its size.
    pub fn poll(&self) -> usize {
        let _deletion = self.deletion.lock();
        let mut inner = self.inner.lock();
        inner.drain();
        inner.batch.len()
    }

    /// Copy batched bytes into `buf`, consuming them.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = buf.len().min(inner.batch.len());
        buf[..n].copy_from_slice(&inner.batch[..n]);
        inner.batch.advance(n);
        n
    }

    /// Block until something is deliverable, then take the whole batch.
    /// Returns `None` on timeout or once the mailbox closes.
    pub fn receive(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if !inner.batch.is_empty() || inner.queued() > 0 {
                inner.drain();
                return Some(inner.batch.split().freeze());
            }
            if inner.closed {
                return None;
            }
            if self.readable.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }

    // Final drain on close: release remaining holds, discard the batch,
    // wake blocked receivers.
    pub(crate) fn close(&self) {
        let _deletion = self.deletion.lock();
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.drain();
        inner.batch.clear();
        drop(inner);
        self.readable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn delivered(wire: &str, counters: &Arc<BrokerCounters>) -> Arc<DeliveredMessage> {
        DeliveredMessage::new(wire.to_string(), Arc::clone(counters))
    }

    #[test]
    fn push_then_poll_then_read_round_trips() {
        let counters = Arc::new(BrokerCounters::default());
        let mailbox = Mailbox::new("/courier/fst1", false, false);
        let message = delivered("record-one", &counters);
        assert!(mailbox.lock().push(&message));
        assert_eq!(mailbox.queued(), 1);

        let size = mailbox.poll();
        assert_eq!(size, "record-one\n".len());
        assert_eq!(mailbox.queued(), 0);

        let mut buf = [0u8; 32];
        let n = mailbox.read(&mut buf);
        assert_eq!(&buf[..n], b"record-one\n");
        assert_eq!(mailbox.read(&mut buf), 0);
    }

    #[test]
    fn partial_reads_consume_the_batch_in_order() {
        let counters = Arc::new(BrokerCounters::default());
        let mailbox = Mailbox::new("/courier/fst1", false, false);
        let message = delivered("abcdef", &counters);
        mailbox.lock().push(&message);
        mailbox.poll();

        let mut buf = [0u8; 3];
        assert_eq!(mailbox.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(mailbox.read(&mut buf), 3);
        assert_eq!(&buf, b"def");
        assert_eq!(mailbox.read(&mut buf), 1);
        assert_eq!(buf[0], b'\n');
    }

    #[test]
    fn drain_releases_holds() {
        let counters = Arc::new(BrokerCounters::default());
        let a = Mailbox::new("/courier/a", false, false);
        let b = Mailbox::new("/courier/b", false, false);
        let message = delivered("shared", &counters);
        a.lock().push(&message);
        b.lock().push(&message);
        counters.pending_inc();
        assert_eq!(message.holds(), 2);

        a.poll();
        assert_eq!(message.holds(), 1);
        assert_eq!(counters.pending(), 1);
        b.poll();
        assert_eq!(message.holds(), 0);
        assert_eq!(counters.pending(), 0);
    }

    #[test]
    fn closed_mailbox_refuses_pushes() {
        let counters = Arc::new(BrokerCounters::default());
        let mailbox = Mailbox::new("/courier/fst1", false, false);
        mailbox.close();
        let message = delivered("late", &counters);
        assert!(!mailbox.lock().push(&message));
    }

    #[test]
    fn close_releases_remaining_holds() {
        let counters = Arc::new(BrokerCounters::default());
        let mailbox = Mailbox::new("/courier/fst1", false, false);
        let message = delivered("pending", &counters);
        mailbox.lock().push(&message);
        counters.pending_inc();
        mailbox.close();
        assert_eq!(message.holds(), 0);
        assert_eq!(counters.pending(), 0);
    }

    #[test]
    fn receive_blocks_until_delivery() {
        let counters = Arc::new(BrokerCounters::default());
        let mailbox = Arc::new(Mailbox::new("/courier/fst1", false, false));
        let writer = {
            let mailbox = Arc::clone(&mailbox);
            let counters = Arc::clone(&counters);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let message = delivered("wake", &counters);
                mailbox.lock().push(&message);
                mailbox.notify();
            })
        };
        let batch = mailbox
            .receive(Duration::from_secs(5))
            .expect("delivered before timeout");
        assert_eq!(&batch[..], b"wake\n");
        writer.join().expect("writer");
    }

    #[test]
    fn receive_times_out_when_idle() {
        let mailbox = Mailbox::new("/courier/fst1", false, false);
        assert!(mailbox.receive(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn receive_returns_none_after_close() {
        let mailbox = Arc::new(Mailbox::new("/courier/fst1", false, false));
        let reader = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.receive(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        mailbox.close();
        assert!(reader.join().expect("reader").is_none());
    }
}
