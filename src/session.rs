//! Client session: the two loops that sit between one connection and the
//! hub.
//!
//! The receive loop decodes inbound envelopes and routes them: chat goes to
//! the hub, candidates and answers go to the session's negotiator. The send
//! loop drains the mailbox onto the connection and keeps it alive with
//! pings. Whichever loop ends first unregisters the session; the hub then
//! cancels the other one.

use crate::config::SessionTiming;
use crate::error::SessionError;
use crate::hub::HubHandle;
use crate::message::{ChatMessage, EventKind, Outbound, WireMessage};
use crate::peer::Negotiator;
use crate::transport::{Frame, FrameSink, FrameSource};
use crate::utils::random_id;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn random() -> Self {
        Self(random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lets the negotiator push messages into a session's mailbox without
/// keeping it open: once the hub drops its sender, sends are discarded.
///
/// A held sender buffers until [`SignalSender::release`], so the offer can
/// be queued ahead of any candidate gathered while it was being created.
#[derive(Clone)]
pub struct SignalSender {
    mailbox: mpsc::WeakSender<Outbound>,
    held: Arc<Mutex<Option<Vec<Outbound>>>>,
}

impl SignalSender {
    pub fn new(mailbox: &mpsc::Sender<Outbound>) -> Self {
        Self {
            mailbox: mailbox.downgrade(),
            held: Arc::new(Mutex::new(None)),
        }
    }

    pub fn held(mailbox: &mpsc::Sender<Outbound>) -> Self {
        Self {
            mailbox: mailbox.downgrade(),
            held: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Returns `false` when the session is gone or its mailbox is full.
    pub fn send(&self, message: &WireMessage) -> bool {
        let outbound = match message.to_outbound() {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(error = %e, "could not encode signal");
                return false;
            }
        };
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.as_mut() {
            Some(buffer) => {
                buffer.push(outbound);
                true
            }
            None => self.deliver(outbound),
        }
    }

    /// Flushes buffered signals in order and stops buffering.
    pub fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for outbound in held.take().unwrap_or_default() {
            if !self.deliver(outbound) {
                break;
            }
        }
    }

    fn deliver(&self, outbound: Outbound) -> bool {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return false;
        };
        match mailbox.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("mailbox full, signal dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Per-connection state; immutable once the loops start.
pub struct Session {
    pub id: SessionId,
    pub nick: String,
    hub: HubHandle,
    negotiator: Arc<dyn Negotiator>,
    timing: SessionTiming,
}

impl Session {
    pub fn new(
        id: SessionId,
        nick: String,
        hub: HubHandle,
        negotiator: Arc<dyn Negotiator>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            id,
            nick,
            hub,
            negotiator,
            timing,
        }
    }

    /// Runs both loops to completion. `cancel` is the token the hub fires
    /// when it unregisters this session.
    pub async fn run<R, W>(
        self: Arc<Self>,
        source: R,
        sink: W,
        mailbox: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
    ) where
        R: FrameSource + 'static,
        W: FrameSink + 'static,
    {
        info!(session_id = %self.id, nick = %self.nick, "session started");
        let sending = tokio::spawn(self.clone().send_loop(sink, mailbox));
        let receiving = tokio::spawn(self.clone().receive_loop(source, cancel));

        let (received, sent) = tokio::join!(receiving, sending);
        for joined in [received, sent] {
            if let Err(e) = joined {
                warn!(session_id = %self.id, error = %e, "session loop panicked");
            }
        }
        info!(session_id = %self.id, "session ended");
    }

    async fn receive_loop<R: FrameSource>(
        self: Arc<Self>,
        mut source: R,
        cancel: CancellationToken,
    ) {
        let _unregister = self.hub.unregister_on_drop(self.id.clone());
        match self.read_frames(&mut source, &cancel).await {
            Ok(()) => debug!(session_id = %self.id, "receive loop cancelled"),
            Err(e) if e.is_expected() => debug!(session_id = %self.id, "client closed connection"),
            Err(e) => warn!(session_id = %self.id, error = %e, "receive loop failed"),
        }
    }

    async fn read_frames<R: FrameSource>(
        &self,
        source: &mut R,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            // A fresh deadline per frame: any frame, keepalive included,
            // extends the session's life.
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                next = timeout(self.timing.pong_wait, source.recv_frame()) => match next {
                    Err(_) => return Err(SessionError::Timeout(self.timing.pong_wait)),
                    Ok(Ok(Some(frame))) => frame,
                    Ok(Ok(None)) => return Err(SessionError::Closed),
                    Ok(Err(e)) => return Err(e),
                },
            };
            if let Frame::Payload(raw) = frame {
                self.dispatch(&raw).await?;
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) -> Result<(), SessionError> {
        let message = WireMessage::parse(raw)?;
        match message.event {
            EventKind::Chat => self.relay_chat(message)?,
            EventKind::Candidate => {
                let candidate: RTCIceCandidateInit = message.decode_data()?;
                debug!(session_id = %self.id, candidate = %candidate.candidate, "remote candidate");
                self.negotiator.apply_remote_candidate(candidate).await?;
            }
            EventKind::Answer => {
                let answer: RTCSessionDescription = message.decode_data()?;
                debug!(session_id = %self.id, "remote answer");
                self.negotiator.set_remote_description(answer).await?;
            }
            EventKind::Offer | EventKind::Info | EventKind::Unknown => {
                debug!(session_id = %self.id, event = ?message.event, "ignoring message");
            }
        }
        Ok(())
    }

    fn relay_chat(&self, mut message: WireMessage) -> Result<(), SessionError> {
        let mut chat: ChatMessage = message.decode_data()?;
        if chat.nick.is_empty() {
            chat.nick = self.nick.clone();
            message = WireMessage::chat(&chat)?;
        }
        self.hub.broadcast(message.to_outbound()?);
        self.hub.record_chat(chat);
        Ok(())
    }

    async fn send_loop<W: FrameSink>(
        self: Arc<Self>,
        mut sink: W,
        mut mailbox: mpsc::Receiver<Outbound>,
    ) {
        let _unregister = self.hub.unregister_on_drop(self.id.clone());
        match self.write_frames(&mut sink, &mut mailbox).await {
            Ok(()) => debug!(session_id = %self.id, "mailbox closed"),
            Err(e) => warn!(session_id = %self.id, error = %e, "send loop failed"),
        }
    }

    async fn write_frames<W: FrameSink>(
        &self,
        sink: &mut W,
        mailbox: &mut mpsc::Receiver<Outbound>,
    ) -> Result<(), SessionError> {
        // Fixed schedule: a client that only listens answers nothing but pings.
        let period = self.timing.ping_period;
        let mut ping = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                next = mailbox.recv() => match next {
                    Some(first) => {
                        let batch = coalesce(first, mailbox);
                        self.bounded(sink.send_text(batch)).await?;
                    }
                    None => {
                        if let Err(e) = self.bounded(sink.close()).await {
                            debug!(session_id = %self.id, error = %e, "close notice not sent");
                        }
                        return Ok(());
                    }
                },
                _ = ping.tick() => self.bounded(sink.send_ping()).await?,
            }
        }
    }

    async fn bounded<F>(&self, write: F) -> Result<(), SessionError>
    where
        F: Future<Output = Result<(), SessionError>>,
    {
        let limit = self.timing.write_wait;
        timeout(limit, write)
            .await
            .map_err(|_| SessionError::Transport(format!("write timed out after {limit:?}")))?
    }
}

/// Joins `first` with whatever is already queued, newline-delimited, so a
/// burst goes out in a single frame.
fn coalesce(first: Outbound, mailbox: &mut mpsc::Receiver<Outbound>) -> String {
    let mut batch = String::from(&*first);
    while let Ok(next) = mailbox.try_recv() {
        batch.push('\n');
        batch.push_str(&next);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, SessionHandle};
    use crate::peer::testing::StubNegotiator;
    use crate::transport::testing::{ChannelSource, RecordingSink, SinkEvent};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        id: SessionId,
        frames: mpsc::UnboundedSender<Result<Frame, SessionError>>,
        sink: mpsc::UnboundedReceiver<SinkEvent>,
        negotiator: Arc<StubNegotiator>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn send(&self, raw: &str) {
            let _ = self
                .frames
                .send(Ok(Frame::Payload(Bytes::copy_from_slice(raw.as_bytes()))));
        }

        /// Next text frame, skipping pings and unrelated events.
        async fn next_text_with(&mut self, needle: &str) -> String {
            timeout(Duration::from_secs(5), async {
                loop {
                    match self.sink.recv().await {
                        Some(SinkEvent::Text(text)) if text.contains(needle) => return text,
                        Some(_) => continue,
                        None => panic!("sink closed"),
                    }
                }
            })
            .await
            .expect("timed out waiting for frame")
        }
    }

    fn start(
        hub: &HubHandle,
        nick: &str,
        negotiator: StubNegotiator,
        timing: SessionTiming,
        fail_writes: bool,
    ) -> Harness {
        let id = SessionId::random();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(64);
        let negotiator = Arc::new(negotiator);
        let cancel = CancellationToken::new();
        hub.register(SessionHandle::new(
            id.clone(),
            nick.to_string(),
            mailbox_tx,
            negotiator.clone(),
            cancel.clone(),
        ));

        let session = Arc::new(Session::new(
            id.clone(),
            nick.to_string(),
            hub.clone(),
            negotiator.clone(),
            timing,
        ));
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink) = mpsc::unbounded_channel();
        let task = tokio::spawn(session.run(
            ChannelSource(frames_rx),
            RecordingSink {
                events: sink_tx,
                fail: fail_writes,
            },
            mailbox_rx,
            cancel,
        ));
        Harness {
            id,
            frames,
            sink,
            negotiator,
            task,
        }
    }

    fn default_session(hub: &HubHandle, nick: &str) -> Harness {
        start(hub, nick, StubNegotiator::default(), SessionTiming::default(), false)
    }

    // Generous enough for tests on a paused clock, where the deadline under
    // test must fire before this one.
    async fn ended(harness: Harness) {
        timeout(Duration::from_secs(600), harness.task)
            .await
            .expect("session did not end")
            .unwrap();
    }

    #[tokio::test]
    async fn chat_without_nick_is_stamped_for_everyone() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let mut alice = default_session(&hub, "Arwen Oakheart");
        let mut bob = default_session(&hub, "Bel Stormward");
        assert_eq!(hub.connection_count().await, 2);

        alice.send(r#"{"event":"chat","data":"{\"message\":\"hi\"}"}"#);

        let expected = r#"{"event":"chat","data":"{\"message\":\"hi\",\"nick\":\"Arwen Oakheart\"}"}"#;
        assert!(alice.next_text_with("hi").await.contains(expected));
        assert!(bob.next_text_with("hi").await.contains(expected));

        let history = hub.chat_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].nick, "Arwen Oakheart");
    }

    #[tokio::test]
    async fn chat_with_null_nick_is_stamped() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let mut alice = default_session(&hub, "Arwen Oakheart");

        alice.send(r#"{"event":"chat","data":"{\"message\":\"hi\",\"nick\":null}"}"#);

        let expected = r#"{"event":"chat","data":"{\"message\":\"hi\",\"nick\":\"Arwen Oakheart\"}"}"#;
        assert!(alice.next_text_with("hi").await.contains(expected));
        assert_eq!(hub.connection_count().await, 1);
        assert!(!alice.task.is_finished());
    }

    #[tokio::test]
    async fn chat_with_nick_passes_through() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let alice = default_session(&hub, "Arwen Oakheart");
        let mut bob = default_session(&hub, "Bel Stormward");
        let _ = hub.connection_count().await;

        let raw = r#"{"event":"chat","data":"{\"message\":\"yo\",\"nick\":\"Gandalf\"}"}"#;
        alice.send(raw);
        assert!(bob.next_text_with("yo").await.contains(raw));
    }

    #[tokio::test]
    async fn candidate_goes_to_negotiator() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let alice = default_session(&hub, "Arwen");
        alice.send(
            r#"{"event":"candidate","data":"{\"candidate\":\"candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host\",\"sdpMid\":\"0\",\"sdpMLineIndex\":0}"}"#,
        );

        let negotiator = alice.negotiator.clone();
        timeout(Duration::from_secs(2), async {
            while negotiator.candidates.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let candidates = negotiator.candidates.lock().unwrap();
        assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
        assert!(candidates[0].candidate.contains("typ host"));
        drop(candidates);
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn answer_sets_remote_description() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let alice = default_session(&hub, "Arwen");
        alice.send(r#"{"event":"answer","data":{"type":"answer","sdp":"v=0\r\n"}}"#);

        let negotiator = alice.negotiator.clone();
        timeout(Duration::from_secs(2), async {
            while negotiator.descriptions.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(negotiator.descriptions.lock().unwrap()[0].sdp, "v=0\r\n");
    }

    #[tokio::test]
    async fn rejected_candidate_ends_session() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let alice = start(
            &hub,
            "Arwen",
            StubNegotiator::rejecting(),
            SessionTiming::default(),
            false,
        );
        alice.send(r#"{"event":"candidate","data":{"candidate":"bogus"}}"#);
        ended(alice).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_envelope_ends_session() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let mut alice = default_session(&hub, "Arwen");
        let bob = default_session(&hub, "Bel");
        alice.send("{not json");

        let mut closed = false;
        while let Some(event) = timeout(Duration::from_secs(5), alice.sink.recv()).await.unwrap() {
            if event == SinkEvent::Close {
                closed = true;
                break;
            }
        }
        assert!(closed);
        ended(alice).await;
        assert_eq!(hub.connection_count().await, 1);
        drop(bob);
    }

    #[tokio::test]
    async fn unknown_and_offer_events_are_ignored() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let mut alice = default_session(&hub, "Arwen");
        alice.send(r#"{"event":"typing","data":"{}"}"#);
        alice.send(r#"{"event":"offer","data":"{}"}"#);
        alice.send(r#"{"event":"chat","data":"{\"message\":\"still here\"}"}"#);
        let _ = alice.next_text_with("still here").await;
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn clean_close_unregisters() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let alice = default_session(&hub, "Arwen");
        let negotiator = alice.negotiator.clone();
        let _ = hub.connection_count().await;
        let Harness { frames, task, sink, .. } = alice;
        drop(frames);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        drop(sink);
        assert_eq!(hub.connection_count().await, 0);
        timeout(Duration::from_secs(2), async {
            while negotiator.close_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let timing = SessionTiming {
            ping_period: Duration::from_secs(60),
            pong_wait: Duration::from_secs(120),
            write_wait: Duration::from_secs(10),
        };
        let alice = start(&hub, "Arwen", StubNegotiator::default(), timing, false);
        let frames = alice.frames.clone();
        ended(alice).await;
        assert_eq!(hub.connection_count().await, 0);
        drop(frames);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_extends_deadline() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let timing = SessionTiming {
            ping_period: Duration::from_secs(60),
            pong_wait: Duration::from_secs(120),
            write_wait: Duration::from_secs(10),
        };
        let alice = start(&hub, "Arwen", StubNegotiator::default(), timing, false);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(100)).await;
            let _ = alice.frames.send(Ok(Frame::Keepalive));
        }
        // 500s elapsed, well past a single deadline.
        assert_eq!(hub.connection_count().await, 1);
        assert!(!alice.task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_pinged() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let mut alice = default_session(&hub, "Arwen");
        let mut pings = 0;
        while pings < 2 {
            match timeout(Duration::from_secs(300), alice.sink.recv()).await.unwrap() {
                Some(SinkEvent::Ping) => pings += 1,
                Some(_) => {}
                None => panic!("sink closed"),
            }
            let _ = alice.frames.send(Ok(Frame::Keepalive));
        }
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_in_busy_room_is_still_pinged() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let mut listener = default_session(&hub, "Arwen");
        let chatter = default_session(&hub, "Bel");

        let mut chats = tokio::time::interval(Duration::from_secs(30));
        let done = tokio::time::sleep(Duration::from_secs(300));
        tokio::pin!(done);
        let mut pings = 0;
        loop {
            tokio::select! {
                () = &mut done => break,
                _ = chats.tick() => {
                    chatter.send(r#"{"event":"chat","data":"{\"message\":\"busy\"}"}"#);
                }
                event = listener.sink.recv() => match event {
                    Some(SinkEvent::Ping) => {
                        pings += 1;
                        let _ = listener.frames.send(Ok(Frame::Keepalive));
                    }
                    Some(_) => {}
                    None => panic!("listener was dropped"),
                },
            }
        }

        assert!(pings >= 4, "only {pings} pings in a busy room");
        assert_eq!(hub.connection_count().await, 2);
        assert!(!listener.task.is_finished());
    }

    #[tokio::test]
    async fn failed_write_ends_session() {
        let hub = Hub::spawn(Duration::from_secs(1));
        let alice = start(
            &hub,
            "Arwen",
            StubNegotiator::default(),
            SessionTiming::default(),
            true,
        );
        // The info broadcast triggered by registration is the first write.
        ended(alice).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn queued_messages_are_coalesced() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(8);
        for text in ["a", "b", "c"] {
            tx.send(text.into()).await.unwrap();
        }
        let first = rx.recv().await.unwrap();
        assert_eq!(coalesce(first, &mut rx), "a\nb\nc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn signal_sender_does_not_keep_mailbox_open() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(8);
        let signals = SignalSender::new(&tx);
        let info = WireMessage::info(3).unwrap();
        assert!(signals.send(&info));
        drop(tx);
        assert!(!signals.send(&info));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn held_signals_follow_released_offer() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(8);
        let signals = SignalSender::held(&tx);
        let candidate = WireMessage::encoded(EventKind::Candidate, &"c1").unwrap();
        assert!(signals.send(&candidate));
        assert!(rx.try_recv().is_err());

        tx.try_send(Arc::from("offer")).unwrap();
        signals.release();
        assert_eq!(&*rx.recv().await.unwrap(), "offer");
        assert_eq!(rx.recv().await.unwrap(), candidate.to_outbound().unwrap());

        assert!(signals.send(&candidate));
        assert_eq!(rx.recv().await.unwrap(), candidate.to_outbound().unwrap());
    }

    #[tokio::test]
    async fn full_mailbox_rejects_signal() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(1);
        let signals = SignalSender::new(&tx);
        let info = WireMessage::info(1).unwrap();
        assert!(signals.send(&info));
        assert!(!signals.send(&info));
        assert!(rx.recv().await.is_some());
        assert!(signals.send(&info));
    }

    #[test]
    fn session_ids_are_distinct() {
        assert_ne!(SessionId::random(), SessionId::random());
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }
}
