use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, watch, Mutex};
use tracing::warn;

/// Outbound queue depth per session. Enqueueing never blocks; a full queue
/// drops the frame, because signaling is resent by peers and a slow consumer
/// must never stall the hub.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Socket,
    EventStream,
}

#[derive(Clone, Debug)]
pub struct Membership {
    pub rid: String,
    pub cid: String,
}

/// One live connection. The hub writes the outbound queue; the owning
/// transport adapter drains it. The receiver lives *inside* the session so an
/// event-stream reattach picks up exactly where the lost stream stopped, and
/// frames enqueued across the swap are not lost.
pub struct Session {
    pub sid: String,
    pub transport: Transport,
    pub ip: IpAddr,

    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<String>>>,

    /// Bumped whenever the wire behind this session changes (reattach, forced
    /// eviction). Transport tasks watching an older epoch let go of the queue.
    epoch: watch::Sender<u64>,

    pub(super) membership: StdMutex<Option<Membership>>,
    last_seen: StdMutex<Instant>,
    replaced: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    pub fn new(sid: String, transport: Transport, ip: IpAddr) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        Arc::new(Self {
            sid,
            transport,
            ip,
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            epoch: watch::channel(0).0,
            membership: StdMutex::new(None),
            last_seen: StdMutex::new(Instant::now()),
            replaced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue one serialized frame for delivery. Exactly one protocol message
    /// per frame; no coalescing.
    pub fn enqueue(&self, frame: String) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        match self.outbound_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(sid = %self.sid, "outbound queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn outbound(&self) -> Arc<Mutex<mpsc::Receiver<String>>> {
        Arc::clone(&self.outbound_rx)
    }

    /// The current epoch plus a watcher on it, taken by a transport as it
    /// attaches.
    pub fn attach_epoch(&self) -> (u64, watch::Receiver<u64>) {
        (*self.epoch.borrow(), self.epoch.subscribe())
    }

    pub fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Kicks whichever transport currently drains the queue.
    pub fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    #[cfg(test)]
    pub(super) fn backdate_last_seen(&self, by: Duration) {
        let mut last_seen = self.last_seen.lock().unwrap();
        if let Some(earlier) = last_seen.checked_sub(by) {
            *last_seen = earlier;
        }
    }

    pub fn membership(&self) -> Option<Membership> {
        self.membership.lock().unwrap().clone()
    }

    /// A ghost whose cid was taken over by a reconnecting client.
    pub fn mark_replaced(&self) {
        self.replaced.store(true, Ordering::Relaxed);
    }

    pub fn is_replaced(&self) -> bool {
        self.replaced.load(Ordering::Relaxed)
    }

    /// Returns whether the session had already been closed, so disconnect
    /// runs its teardown exactly once.
    pub(super) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<Session> {
        Session::new(
            "S-test".to_owned(),
            Transport::Socket,
            "127.0.0.1".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let session = session();

        for i in 0..OUTBOUND_QUEUE_DEPTH + 10 {
            session.enqueue(format!("frame {i}"));
        }

        let outbound = session.outbound();
        let mut queue = outbound.lock().await;
        let mut drained = 0;
        while queue.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, OUTBOUND_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn queue_preserves_fifo() {
        let session = session();
        session.enqueue("first".to_owned());
        session.enqueue("second".to_owned());

        let outbound = session.outbound();
        let mut queue = outbound.lock().await;
        assert_eq!(queue.try_recv().unwrap(), "first");
        assert_eq!(queue.try_recv().unwrap(), "second");
    }

    #[tokio::test]
    async fn epoch_bump_wakes_watchers() {
        let session = session();
        let (epoch, mut watcher) = session.attach_epoch();
        assert_eq!(epoch, 0);

        session.bump_epoch();
        watcher.changed().await.unwrap();
        assert_eq!(session.current_epoch(), 1);
    }

    #[test]
    fn closed_is_sticky_and_reported_once() {
        let session = session();
        assert!(!session.mark_closed());
        assert!(session.mark_closed());
        assert!(session.is_closed());
    }
}
