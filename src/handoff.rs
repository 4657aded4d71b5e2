/// Handoff coordinator
///
/// Owns the listen/suspend state machine:
///
/// ```text
/// Listening --detection--> Suspended --notify--> AwaitingAck --ack|timeout--> Listening
/// ```
///
/// Capture is paused for the whole handoff, so frame processing and the
/// acknowledgment wait never overlap in time. Resuming always requests a
/// scorer reset before the next frame is scored.

use crate::capture::CaptureControl;
use crate::detector::WakeEvent;
use crate::notifier::Notifier;
use crate::pipeline::CaptureSignals;
use crate::protocol::{Message, MAX_DATAGRAM};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default upper bound on one handoff
pub const DEFAULT_SESSION_MAX_WAIT: Duration = Duration::from_secs(300);

/// Default receive slice between shutdown checks
pub const DEFAULT_ACK_POLL: Duration = Duration::from_millis(250);

/// How long the stale-ack drain waits for queued datagrams
const DRAIN_WINDOW: Duration = Duration::from_millis(5);

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Failed to bind acknowledgment socket on {addr}: {source}")]
    AckBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid handoff timing: {0}")]
    InvalidTiming(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Listening,
    Suspended,
    AwaitingAck { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    SessionDone,
    TimedOut,
    DelayElapsed,
    Shutdown,
}

/// Decides when a suspended session may resume listening.
#[async_trait]
pub trait ResumeTrigger: Send {
    /// Called before the notification goes out
    async fn prepare(&mut self) {}

    /// Upper bound on `wait`
    fn max_wait(&self) -> Duration;

    async fn wait(&mut self, shutdown: &CancellationToken) -> ResumeReason;
}

/// Waits for `{"type":"session_done"}` on a UDP socket, bounded by a
/// deadline and polled in short slices.
pub struct AckChannel {
    socket: Arc<UdpSocket>,
    max_wait: Duration,
    poll: Duration,
}

impl AckChannel {
    /// Listen on the notifier's socket; consumers reply to the wake sender
    pub fn on_notifier(notifier: &Notifier, max_wait: Duration, poll: Duration) -> Result<Self, HandoffError> {
        Self::new(notifier.socket(), max_wait, poll)
    }

    /// Listen on a dedicated socket
    pub async fn bind(addr: SocketAddr, max_wait: Duration, poll: Duration) -> Result<Self, HandoffError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| HandoffError::AckBind { addr, source })?;
        if let Ok(local) = socket.local_addr() {
            info!("Acknowledgment listener bound on {}", local);
        }
        Self::new(Arc::new(socket), max_wait, poll)
    }

    fn new(socket: Arc<UdpSocket>, max_wait: Duration, poll: Duration) -> Result<Self, HandoffError> {
        if max_wait.is_zero() || poll.is_zero() {
            return Err(HandoffError::InvalidTiming(format!(
                "max_wait={:?} poll={:?}",
                max_wait, poll
            )));
        }
        Ok(Self { socket, max_wait, poll })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[async_trait]
impl ResumeTrigger for AckChannel {
    async fn prepare(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut stale = 0;
        // Readiness comes from the reactor, so give it one short window
        while let Ok(Ok(_)) = tokio::time::timeout(DRAIN_WINDOW, self.socket.recv_from(&mut buf)).await {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale datagrams before handoff", stale);
        }
    }

    fn max_wait(&self) -> Duration {
        self.max_wait
    }

    async fn wait(&mut self, shutdown: &CancellationToken) -> ResumeReason {
        let deadline = Instant::now() + self.max_wait;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let now = Instant::now();
            if now >= deadline {
                info!("No session_done within {:?}; resuming", self.max_wait);
                return ResumeReason::TimedOut;
            }
            let slice = self.poll.min(deadline - now);

            tokio::select! {
                _ = shutdown.cancelled() => return ResumeReason::Shutdown,
                received = tokio::time::timeout(slice, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Err(_) => continue,
                        Ok(Err(e)) => {
                            debug!("Acknowledgment receive error: {}", e);
                        }
                        Ok(Ok((n, from))) => {
                            if Message::is_session_done(&buf[..n]) {
                                info!("session_done from {}", from);
                                return ResumeReason::SessionDone;
                            }
                            debug!("Ignoring {}-byte datagram from {}", n, from);
                        }
                    }
                }
            }
        }
    }
}

/// Degraded fallback: resume after a fixed delay, with no acknowledgment.
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ResumeTrigger for FixedDelay {
    fn max_wait(&self) -> Duration {
        self.delay
    }

    async fn wait(&mut self, shutdown: &CancellationToken) -> ResumeReason {
        tokio::select! {
            _ = shutdown.cancelled() => ResumeReason::Shutdown,
            _ = tokio::time::sleep(self.delay) => ResumeReason::DelayElapsed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffStats {
    pub handoffs: u64,
    pub acks: u64,
    pub timeouts: u64,
}

pub struct HandoffCoordinator {
    notifier: Notifier,
    trigger: Box<dyn ResumeTrigger>,
    signals: Arc<CaptureSignals>,
    state: watch::Sender<HandoffState>,
    stats: HandoffStats,
}

impl HandoffCoordinator {
    pub fn new(notifier: Notifier, trigger: Box<dyn ResumeTrigger>, signals: Arc<CaptureSignals>) -> Self {
        let (state, _) = watch::channel(HandoffState::Listening);
        Self {
            notifier,
            trigger,
            signals,
            state,
            stats: HandoffStats::default(),
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<HandoffState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> HandoffState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &HandoffStats {
        &self.stats
    }

    /// Run until shutdown or until the capture side drops its sender.
    pub async fn run<C>(
        &mut self,
        capture: &mut C,
        events: &mut mpsc::UnboundedReceiver<WakeEvent>,
        shutdown: CancellationToken,
    ) where
        C: CaptureControl + ?Sized,
    {
        info!("Handoff coordinator listening");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!("Capture side closed its event channel");
                        break;
                    }
                },
            };

            if self.handoff(capture, event, &shutdown).await == ResumeReason::Shutdown {
                break;
            }
        }

        info!(
            "Handoff coordinator stopped: {} handoffs, {} acks, {} timeouts",
            self.stats.handoffs, self.stats.acks, self.stats.timeouts
        );
    }

    /// One full handoff for `event`; returns why listening resumed.
    pub async fn handoff<C>(&mut self, capture: &mut C, event: WakeEvent, shutdown: &CancellationToken) -> ResumeReason
    where
        C: CaptureControl + ?Sized,
    {
        self.stats.handoffs += 1;

        // The callback already suspended itself; make it a real stop
        self.signals.suspend();
        if let Err(e) = capture.pause() {
            warn!("Failed to pause capture: {}", e);
        }
        self.state.send_replace(HandoffState::Suspended);

        self.trigger.prepare().await;
        self.notifier.send(&event).await;

        let deadline = Instant::now() + self.trigger.max_wait();
        self.state.send_replace(HandoffState::AwaitingAck { deadline });
        debug!("Awaiting consumer for '{}' (up to {:?})", event.label, self.trigger.max_wait());

        let reason = self.trigger.wait(shutdown).await;
        match reason {
            ResumeReason::SessionDone => self.stats.acks += 1,
            ResumeReason::TimedOut => self.stats.timeouts += 1,
            ResumeReason::DelayElapsed => {}
            ResumeReason::Shutdown => {
                info!("Shutdown during handoff");
                return reason;
            }
        }

        self.signals.resume_with_reset();
        if let Err(e) = capture.resume() {
            error!("Failed to resume capture: {}", e);
        }
        self.state.send_replace(HandoffState::Listening);
        info!("Listening again ({:?})", reason);

        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCaptureControl;
    use mockall::Sequence;
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_millis(400);
    const POLL: Duration = Duration::from_millis(20);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Consumer socket plus a coordinator whose notifier targets it
    async fn setup() -> (UdpSocket, HandoffCoordinator, Arc<CaptureSignals>) {
        let consumer = UdpSocket::bind(loopback()).await.unwrap();
        let notifier = Notifier::bind(loopback(), consumer.local_addr().unwrap())
            .await
            .unwrap();
        let trigger = AckChannel::on_notifier(&notifier, WAIT, POLL).unwrap();
        let signals = CaptureSignals::new();
        let coordinator = HandoffCoordinator::new(notifier, Box::new(trigger), Arc::clone(&signals));
        (consumer, coordinator, signals)
    }

    fn expect_pause_then_resume(capture: &mut MockCaptureControl) {
        let mut seq = Sequence::new();
        capture.expect_pause().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        capture.expect_resume().times(1).in_sequence(&mut seq).returning(|| Ok(()));
    }

    #[tokio::test]
    async fn test_session_done_resumes() {
        let (consumer, mut coordinator, signals) = setup().await;
        let mut capture = MockCaptureControl::new();
        expect_pause_then_resume(&mut capture);

        let consumer_task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (n, from) = consumer.recv_from(&mut buf).await.unwrap();
            let message = Message::from_bytes(&buf[..n]).unwrap();
            consumer
                .send_to(br#"{"type":"session_done","ts":1.0}"#, from)
                .await
                .unwrap();
            message
        });

        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.95), &shutdown)
            .await;

        assert_eq!(reason, ResumeReason::SessionDone);
        assert!(started.elapsed() < WAIT);
        assert_eq!(coordinator.state(), HandoffState::Listening);
        assert!(!signals.is_suspended());
        assert!(signals.reset_pending());
        assert_eq!(coordinator.stats().acks, 1);

        match consumer_task.await.unwrap() {
            Message::Wake { label, .. } => assert_eq!(label, "hey_x"),
            other => panic!("Expected wake, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_resumes() {
        let (_consumer, mut coordinator, signals) = setup().await;
        let mut capture = MockCaptureControl::new();
        expect_pause_then_resume(&mut capture);

        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.95), &shutdown)
            .await;

        assert_eq!(reason, ResumeReason::TimedOut);
        assert!(started.elapsed() >= WAIT);
        assert!(signals.reset_pending());
        assert_eq!(coordinator.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_malformed_ack_ignored() {
        let (consumer, mut coordinator, _signals) = setup().await;
        let mut capture = MockCaptureControl::new();
        expect_pause_then_resume(&mut capture);

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (_, from) = consumer.recv_from(&mut buf).await.unwrap();
            let junk: [&[u8]; 3] = [b"garbage", br#"{"type":"ping"}"#, br#"{"type":"wake"}"#];
            for junk in junk {
                consumer.send_to(junk, from).await.unwrap();
            }
        });

        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.9), &CancellationToken::new())
            .await;

        assert_eq!(reason, ResumeReason::TimedOut);
    }

    #[tokio::test]
    async fn test_stale_ack_drained() {
        let (consumer, mut coordinator, _signals) = setup().await;
        let notifier_addr = coordinator.notifier.socket().local_addr().unwrap();

        // A leftover ack from an earlier session
        consumer
            .send_to(br#"{"type":"session_done"}"#, notifier_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut capture = MockCaptureControl::new();
        expect_pause_then_resume(&mut capture);

        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.9), &CancellationToken::new())
            .await;

        assert_eq!(reason, ResumeReason::TimedOut);
    }

    type StateSlot = Arc<Mutex<Option<watch::Receiver<HandoffState>>>>;

    /// Wraps a trigger and records the published state at each hook
    struct StateRecorder {
        inner: Box<dyn ResumeTrigger>,
        states: StateSlot,
        log: Arc<Mutex<Vec<HandoffState>>>,
    }

    impl StateRecorder {
        fn record(&self) {
            if let Some(rx) = self.states.lock().unwrap().as_ref() {
                let state = *rx.borrow();
                self.log.lock().unwrap().push(state);
            }
        }
    }

    #[async_trait]
    impl ResumeTrigger for StateRecorder {
        async fn prepare(&mut self) {
            self.record();
            self.inner.prepare().await;
        }

        fn max_wait(&self) -> Duration {
            self.inner.max_wait()
        }

        async fn wait(&mut self, shutdown: &CancellationToken) -> ResumeReason {
            self.record();
            self.inner.wait(shutdown).await
        }
    }

    fn state_name(state: &HandoffState) -> &'static str {
        match state {
            HandoffState::Listening => "listening",
            HandoffState::Suspended => "suspended",
            HandoffState::AwaitingAck { .. } => "awaiting_ack",
        }
    }

    /// Run one handoff and return the states seen at each step
    async fn observe_handoff(reply: bool) -> (Vec<&'static str>, ResumeReason, Option<Message>) {
        let consumer = UdpSocket::bind(loopback()).await.unwrap();
        let notifier = Notifier::bind(loopback(), consumer.local_addr().unwrap())
            .await
            .unwrap();
        let ack = AckChannel::on_notifier(&notifier, WAIT, POLL).unwrap();

        let slot = StateSlot::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = StateRecorder {
            inner: Box::new(ack),
            states: Arc::clone(&slot),
            log: Arc::clone(&log),
        };
        let mut coordinator = HandoffCoordinator::new(notifier, Box::new(recorder), CaptureSignals::new());
        *slot.lock().unwrap() = Some(coordinator.subscribe());

        let consumer_task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let received = tokio::time::timeout(WAIT, consumer.recv_from(&mut buf)).await;
            let Ok(Ok((n, from))) = received else {
                return None;
            };
            if reply {
                consumer.send_to(br#"{"type":"session_done"}"#, from).await.unwrap();
            }
            Message::from_bytes(&buf[..n]).ok()
        });

        let mut capture = MockCaptureControl::new();
        expect_pause_then_resume(&mut capture);

        let mut seen = vec![state_name(&coordinator.state())];
        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.95), &CancellationToken::new())
            .await;
        seen.extend(log.lock().unwrap().iter().map(state_name));
        seen.push(state_name(&coordinator.state()));

        (seen, reason, consumer_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_state_sequence_on_ack() {
        let (seen, reason, message) = observe_handoff(true).await;

        assert_eq!(reason, ResumeReason::SessionDone);
        // Suspended is published before the notification goes out
        assert_eq!(seen, vec!["listening", "suspended", "awaiting_ack", "listening"]);
        assert!(matches!(message, Some(Message::Wake { .. })));
    }

    #[tokio::test]
    async fn test_state_sequence_on_timeout() {
        let (seen, reason, message) = observe_handoff(false).await;

        assert_eq!(reason, ResumeReason::TimedOut);
        assert_eq!(seen, vec!["listening", "suspended", "awaiting_ack", "listening"]);
        assert!(matches!(message, Some(Message::Wake { .. })));
    }

    #[tokio::test]
    async fn test_states_observed() {
        let (_consumer, mut coordinator, _signals) = setup().await;
        let mut states = coordinator.subscribe();
        let mut capture = MockCaptureControl::new();
        capture.expect_pause().times(1).returning(|| Ok(()));
        capture.expect_resume().times(0);

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();

        let watcher = tokio::spawn(async move {
            let awaiting = states
                .wait_for(|s| matches!(s, HandoffState::AwaitingAck { .. }))
                .await
                .map(|s| *s)
                .unwrap();
            canceller.cancel();
            awaiting
        });

        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.9), &shutdown)
            .await;

        assert_eq!(reason, ResumeReason::Shutdown);
        assert!(matches!(watcher.await.unwrap(), HandoffState::AwaitingAck { .. }));
        // Shutdown leaves capture stopped
        assert!(matches!(coordinator.state(), HandoffState::AwaitingAck { .. }));
    }

    #[tokio::test]
    async fn test_fixed_delay_trigger() {
        let consumer = UdpSocket::bind(loopback()).await.unwrap();
        let notifier = Notifier::bind(loopback(), consumer.local_addr().unwrap())
            .await
            .unwrap();
        let signals = CaptureSignals::new();
        let mut coordinator = HandoffCoordinator::new(
            notifier,
            Box::new(FixedDelay::new(Duration::from_millis(50))),
            Arc::clone(&signals),
        );

        let mut capture = MockCaptureControl::new();
        expect_pause_then_resume(&mut capture);

        let reason = coordinator
            .handoff(&mut capture, WakeEvent::new("hey_x", 0.9), &CancellationToken::new())
            .await;

        assert_eq!(reason, ResumeReason::DelayElapsed);
        assert!(signals.reset_pending());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let (_consumer, mut coordinator, _signals) = setup().await;
        let mut capture = MockCaptureControl::new();
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        coordinator.run(&mut capture, &mut rx, shutdown).await;
        assert_eq!(coordinator.stats().handoffs, 0);
    }

    #[tokio::test]
    async fn test_dedicated_ack_socket() {
        let mut trigger = AckChannel::bind(loopback(), WAIT, POLL).await.unwrap();
        let addr = trigger.local_addr().unwrap();
        assert!(addr.port() != 0);

        let sender = UdpSocket::bind(loopback()).await.unwrap();
        sender.send_to(br#"{"type":"session_done"}"#, addr).await.unwrap();

        let reason = trigger.wait(&CancellationToken::new()).await;
        assert_eq!(reason, ResumeReason::SessionDone);
    }

    #[test]
    fn test_zero_timing_rejected() {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let socket = Arc::new(UdpSocket::from_std(std_socket).unwrap());

        assert!(AckChannel::new(Arc::clone(&socket), Duration::ZERO, POLL).is_err());
        assert!(AckChannel::new(socket, WAIT, Duration::ZERO).is_err());
    }
}
