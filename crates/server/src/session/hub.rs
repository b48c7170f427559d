//! Per-session buffer broadcast hub.
//!
//! The hub turns a backend's output into numbered [`BufferFrame`]s and
//! delivers them to every subscriber through a bounded per-subscriber queue.
//! Publishing never blocks: a full queue loses its oldest frame, and the
//! subscriber is told to resynchronise before it sees anything newer.
//!
//! Late subscribers do not get full history. `subscribe` hands out a
//! [`Snapshot`] (recent output plus current geometry) taken atomically with
//! registration, and live frames continue at `last_sequence + 1`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Bytes, BytesMut};
use protocol::BufferFrame;
use tokio::sync::Notify;

use super::model::{Geometry, SessionError, SessionId};
use crate::auth::Scope;

/// Default per-subscriber queue capacity, in frames.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Default size of the catch-up replay buffer, in bytes.
pub const DEFAULT_REPLAY_BYTES: usize = 64 * 1024;

/// Hub tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub subscriber_capacity: usize,
    pub replay_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            replay_bytes: DEFAULT_REPLAY_BYTES,
        }
    }
}

/// Statistics about a subscriber's delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Frames handed to the subscriber.
    pub frames_delivered: u64,
    /// Frames dropped because the queue was full.
    pub frames_dropped: u64,
    /// Whether a drop happened that the subscriber has not yet observed.
    pub resync_required: bool,
}

/// Catch-up state for a (re)joining viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Sequence number of the last frame published before this snapshot.
    pub last_sequence: u32,
    pub geometry: Geometry,
    /// Most recent output, at most `replay_bytes` long.
    pub replay: Bytes,
    pub exited: bool,
    /// Exit code if exited; `None` also when the code is unknown.
    pub exit_code: Option<i32>,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Frame(BufferFrame),
    /// Frames were dropped; request a fresh snapshot instead of trusting the gap.
    ResyncRequired { dropped: u64 },
}

/// Bounded window of recent output.
#[derive(Debug)]
struct ReplayBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
}

impl ReplayBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
        }
    }

    fn push(&mut self, data: &Bytes) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }
        let data = if data.len() > self.capacity {
            data.slice(data.len() - self.capacity..)
        } else {
            data.clone()
        };
        self.len += data.len();
        self.chunks.push_back(data);

        while self.len > self.capacity {
            let excess = self.len - self.capacity;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= excess {
                self.len -= front.len();
                self.chunks.pop_front();
            } else {
                *front = front.slice(excess..);
                self.len -= excess;
            }
        }
    }

    fn contents(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<BufferFrame>,
    pending_drops: u64,
    closed: bool,
    stats: SubscriberStats,
}

/// One subscriber's bounded outbound queue.
#[derive(Debug)]
struct SubscriberQueue {
    id: u64,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, frame: BufferFrame) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.pending_drops += 1;
            state.stats.frames_dropped += 1;
            if !state.stats.resync_required {
                state.stats.resync_required = true;
                tracing::warn!(
                    subscriber_id = self.id,
                    dropped = state.stats.frames_dropped,
                    "Subscriber is backpressured, dropping oldest frames"
                );
            }
        }
        state.frames.push_back(frame);
        drop(state);
        self.notify.notify_one();
    }

    /// Stop accepting frames. With `discard`, pending frames are released too.
    fn close(&self, discard: bool) {
        let mut state = self.lock();
        state.closed = true;
        if discard {
            state.frames.clear();
            state.pending_drops = 0;
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Next event, or `Err(())` if nothing is queued, or `Ok(None)` at end of stream.
    fn poll(&self) -> Result<Option<HubEvent>, ()> {
        let mut state = self.lock();
        if state.pending_drops > 0 {
            let dropped = std::mem::take(&mut state.pending_drops);
            state.stats.resync_required = false;
            return Ok(Some(HubEvent::ResyncRequired { dropped }));
        }
        if let Some(frame) = state.frames.pop_front() {
            state.stats.frames_delivered += 1;
            return Ok(Some(HubEvent::Frame(frame)));
        }
        if state.closed {
            return Ok(None);
        }
        Err(())
    }
}

#[derive(Debug)]
struct HubInner {
    next_sequence: u32,
    geometry: Geometry,
    replay: ReplayBuffer,
    exit: Option<Option<i32>>,
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
}

impl HubInner {
    fn last_sequence(&self) -> u32 {
        self.next_sequence.wrapping_sub(1)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            last_sequence: self.last_sequence(),
            geometry: self.geometry,
            replay: self.replay.contents(),
            exited: self.exit.is_some(),
            exit_code: self.exit.flatten(),
        }
    }

    fn broadcast(&mut self, make: impl FnOnce(u32) -> BufferFrame) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let frame = make(sequence);
        for queue in self.subscribers.values() {
            queue.push(frame.clone());
        }
        sequence
    }
}

/// Fan-out of one session's frames to its subscribers.
#[derive(Debug)]
pub struct BufferBroadcastHub {
    session_id: SessionId,
    config: HubConfig,
    inner: Mutex<HubInner>,
    next_subscriber_id: AtomicU64,
}

impl BufferBroadcastHub {
    /// Create a hub; the first published frame gets sequence 1.
    pub fn new(session_id: SessionId, geometry: Geometry, config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            config,
            inner: Mutex::new(HubInner {
                next_sequence: 1,
                geometry,
                replay: ReplayBuffer::new(config.replay_bytes),
                exit: None,
                subscribers: HashMap::new(),
            }),
            next_subscriber_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Register a subscriber. Fails once the exit frame has been published.
    pub fn subscribe(self: &Arc<Self>, scope: Scope) -> Result<Subscriber, SessionError> {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return Err(SessionError::HubClosed(self.session_id.clone()));
        }

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(id, self.config.subscriber_capacity));
        inner.subscribers.insert(id, Arc::clone(&queue));
        let snapshot = inner.snapshot();
        drop(inner);

        tracing::debug!(
            session_id = %self.session_id,
            subscriber_id = id,
            scope = %scope,
            from_sequence = snapshot.last_sequence.wrapping_add(1),
            "Subscriber attached"
        );

        Ok(Subscriber {
            id,
            scope,
            queue,
            hub: Arc::downgrade(self),
            snapshot,
        })
    }

    /// Release a subscriber's queue. Safe to call repeatedly.
    pub fn unsubscribe(&self, subscriber_id: u64) {
        let removed = self.lock().subscribers.remove(&subscriber_id);
        if let Some(queue) = removed {
            queue.close(true);
            tracing::debug!(
                session_id = %self.session_id,
                subscriber_id,
                "Subscriber detached"
            );
        }
    }

    /// Publish terminal output. Returns the frame's sequence, or `None` after exit.
    pub fn publish_data(&self, data: Bytes) -> Option<u32> {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return None;
        }
        inner.replay.push(&data);
        Some(inner.broadcast(|seq| BufferFrame::data(seq, data)))
    }

    /// Publish a geometry change.
    pub fn publish_resize(&self, geometry: Geometry) -> Option<u32> {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return None;
        }
        inner.geometry = geometry;
        Some(inner.broadcast(|seq| BufferFrame::resize(seq, geometry.cols(), geometry.rows())))
    }

    /// Publish the exit frame and close the hub.
    ///
    /// Only the first call has any effect; later calls return `None`.
    pub fn publish_exit(&self, code: Option<i32>) -> Option<u32> {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return None;
        }
        inner.exit = Some(code);
        let sequence = inner.broadcast(|seq| BufferFrame::exit(seq, code));
        for (_, queue) in inner.subscribers.drain() {
            queue.close(false);
        }
        drop(inner);

        tracing::debug!(session_id = %self.session_id, sequence, code = ?code, "Hub closed");
        Some(sequence)
    }

    /// Fresh catch-up state, for resynchronisation.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().exit.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn last_sequence(&self) -> u32 {
        self.lock().last_sequence()
    }
}

/// A live attachment to a hub.
///
/// Dropping the subscriber unsubscribes it.
#[derive(Debug)]
pub struct Subscriber {
    id: u64,
    scope: Scope,
    queue: Arc<SubscriberQueue>,
    hub: Weak<BufferBroadcastHub>,
    snapshot: Snapshot,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// State at the moment of subscription.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Wait for the next event. `None` once the stream has ended or the
    /// subscriber was released.
    pub async fn recv(&self) -> Option<HubEvent> {
        loop {
            let notified = self.queue.notify.notified();
            match self.queue.poll() {
                Ok(event) => return event,
                Err(()) => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` if nothing is queued.
    pub fn try_recv(&self) -> Option<HubEvent> {
        self.queue.poll().ok().flatten()
    }

    pub fn stats(&self) -> SubscriberStats {
        self.queue.lock().stats.clone()
    }

    pub fn is_resync_required(&self) -> bool {
        self.queue.lock().pending_drops > 0
    }

    /// Release this subscriber. Idempotent.
    pub fn unsubscribe(&self) {
        match self.hub.upgrade() {
            Some(hub) => hub.unsubscribe(self.id),
            None => self.queue.close(true),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::FrameKind;

    fn hub_with(capacity: usize, replay: usize) -> Arc<BufferBroadcastHub> {
        BufferBroadcastHub::new(
            "s1".to_string(),
            Geometry::default(),
            HubConfig {
                subscriber_capacity: capacity,
                replay_bytes: replay,
            },
        )
    }

    fn drain(sub: &Subscriber) -> Vec<HubEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    fn frames(events: &[HubEvent]) -> Vec<&BufferFrame> {
        events
            .iter()
            .filter_map(|e| match e {
                HubEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sequences_start_at_one_without_gaps() {
        let hub = hub_with(16, 1024);
        let sub = hub.subscribe(Scope::View).unwrap();
        assert_eq!(sub.snapshot().last_sequence, 0);

        hub.publish_data(Bytes::from_static(b"a"));
        hub.publish_resize(Geometry::new(100, 30).unwrap());
        hub.publish_data(Bytes::from_static(b"b"));

        let events = drain(&sub);
        let seqs: Vec<u32> = frames(&events).iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(frames(&events)[1].kind, FrameKind::Resize);
    }

    #[test]
    fn test_two_subscribers_receive_identical_frames() {
        let hub = hub_with(16, 1024);
        let a = hub.subscribe(Scope::View).unwrap();
        let b = hub.subscribe(Scope::Control).unwrap();

        for chunk in [&b"one"[..], b"two", b"three"] {
            hub.publish_data(Bytes::from_static(chunk));
        }

        assert_eq!(drain(&a), drain(&b));
    }

    #[test]
    fn test_full_queue_drops_oldest_and_flags_resync_first() {
        let hub = hub_with(2, 1024);
        let sub = hub.subscribe(Scope::View).unwrap();

        for i in 0..5u8 {
            hub.publish_data(Bytes::from(vec![i]));
        }
        assert!(sub.is_resync_required());
        assert_eq!(sub.stats().frames_dropped, 3);

        let events = drain(&sub);
        assert_eq!(events[0], HubEvent::ResyncRequired { dropped: 3 });
        let seqs: Vec<u32> = frames(&events).iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert!(!sub.stats().resync_required);
    }

    #[test]
    fn test_slow_subscriber_does_not_affect_others() {
        let hub = hub_with(2, 1024);
        let slow = hub.subscribe(Scope::View).unwrap();
        let fast = hub.subscribe(Scope::View).unwrap();

        let mut fast_seqs = Vec::new();
        for i in 0..10u8 {
            hub.publish_data(Bytes::from(vec![i]));
            for event in drain(&fast) {
                match event {
                    HubEvent::Frame(f) => fast_seqs.push(f.sequence),
                    HubEvent::ResyncRequired { .. } => panic!("fast subscriber dropped"),
                }
            }
        }

        assert_eq!(fast_seqs, (1..=10).collect::<Vec<u32>>());
        assert_eq!(slow.stats().frames_dropped, 8);
        assert_eq!(fast.stats().frames_dropped, 0);
    }

    #[test]
    fn test_exit_closes_hub() {
        let hub = hub_with(16, 1024);
        let sub = hub.subscribe(Scope::View).unwrap();

        hub.publish_data(Bytes::from_static(b"bye"));
        assert_eq!(hub.publish_exit(Some(0)), Some(2));
        assert_eq!(hub.publish_exit(Some(1)), None);
        assert_eq!(hub.publish_data(Bytes::from_static(b"late")), None);

        let events = drain(&sub);
        let last = frames(&events).last().copied().unwrap().clone();
        assert_eq!(last.kind, FrameKind::Exit);
        assert_eq!(last.exit_code().unwrap(), Some(0));
        assert!(sub.try_recv().is_none());

        assert!(matches!(
            hub.subscribe(Scope::View),
            Err(SessionError::HubClosed(_))
        ));
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_recv_ends_after_exit_frame() {
        let hub = hub_with(16, 1024);
        let sub = hub.subscribe(Scope::View).unwrap();

        let publisher = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                hub.publish_data(Bytes::from_static(b"x"));
                hub.publish_exit(None);
            })
        };

        let mut kinds = Vec::new();
        while let Some(HubEvent::Frame(frame)) = sub.recv().await {
            kinds.push(frame.kind);
        }
        publisher.await.unwrap();
        assert_eq!(kinds, vec![FrameKind::Data, FrameKind::Exit]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_ends_recv() {
        let hub = hub_with(16, 1024);
        let sub = hub.subscribe(Scope::View).unwrap();
        hub.publish_data(Bytes::from_static(b"pending"));

        sub.unsubscribe();
        sub.unsubscribe();
        hub.unsubscribe(sub.id());

        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = hub_with(16, 1024);
        let sub = hub.subscribe(Scope::View).unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_late_subscriber_gets_snapshot_then_live_frames() {
        let hub = hub_with(16, 1024);
        hub.publish_data(Bytes::from_static(b"hello "));
        hub.publish_resize(Geometry::new(120, 40).unwrap());
        hub.publish_data(Bytes::from_static(b"world"));

        let sub = hub.subscribe(Scope::View).unwrap();
        let snap = sub.snapshot();
        assert_eq!(snap.last_sequence, 3);
        assert_eq!(snap.replay.as_ref(), b"hello world");
        assert_eq!(snap.geometry, Geometry::new(120, 40).unwrap());
        assert!(!snap.exited);

        hub.publish_data(Bytes::from_static(b"!"));
        let events = drain(&sub);
        assert_eq!(frames(&events)[0].sequence, 4);
    }

    #[test]
    fn test_replay_is_bounded() {
        let hub = hub_with(16, 8);
        hub.publish_data(Bytes::from_static(b"0123456789"));
        hub.publish_data(Bytes::from_static(b"abc"));

        let snap = hub.snapshot();
        assert_eq!(snap.replay.as_ref(), b"56789abc");
    }

    #[test]
    fn test_snapshot_after_exit() {
        let hub = hub_with(16, 64);
        hub.publish_data(Bytes::from_static(b"done"));
        hub.publish_exit(Some(3));

        let snap = hub.snapshot();
        assert!(snap.exited);
        assert_eq!(snap.exit_code, Some(3));
        assert_eq!(snap.last_sequence, 2);
    }

    #[test]
    fn test_replay_buffer_zero_capacity() {
        let mut replay = ReplayBuffer::new(0);
        replay.push(&Bytes::from_static(b"abc"));
        assert!(replay.contents().is_empty());
    }
}
