//! Session controller: runs one [`TransferMachine`] over a [`Transport`].
//!
//! A single driver task owns the machine. Scans, discovery results, pairing
//! results and back-channel traffic all arrive on one event queue, so the
//! machine sees them strictly in order. Display frames and the final result
//! are published on `watch` channels for the host to poll or await.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::identity::{AckToken, SessionId};
use crate::machine::{Action, DisplayFrame, Outcome, TransferError, TransferMachine};
use crate::protocol::{Message, Role};
use crate::transport::{
    PairingError, PairingInfo, PeerCandidate, Transport, TransportError,
};
use crate::wire::{encode_message, MessageBuffer};

/// Timing and retry knobs for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on one receiver pairing attempt.
    pub pairing_timeout: Duration,
    /// How long one discovery round runs before it is restarted.
    pub discovery_interval: Duration,
    /// Retries after the first failed pairing attempt.
    pub pairing_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(10),
            discovery_interval: Duration::from_secs(10),
            pairing_retries: crate::machine::DEFAULT_PAIRING_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResult {
    Pending,
    Success(Vec<String>),
    Error(TransferError),
}

impl SessionResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionResult::Pending)
    }
}

impl From<Outcome> for SessionResult {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(messages) => SessionResult::Success(messages),
            Outcome::Error(err) => SessionResult::Error(err),
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Scanned(String),
    PeerFound(PeerCandidate),
    Paired(Result<PairingInfo, PairingError>),
    AckReceived(AckToken),
    AckSent(AckToken),
    AckFailed(AckToken, TransportError),
    TransportFailed(TransportError),
    Stop,
}

/// Cloneable handle for feeding forward-channel text into a session.
#[derive(Debug, Clone)]
pub struct FrameInput {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl FrameInput {
    /// Hand over decoded text from the forward channel. Returns false once the session is gone.
    pub fn submit(&self, text: impl Into<String>) -> bool {
        self.events
            .send(SessionEvent::Scanned(text.into()))
            .is_ok()
    }
}

/// Handle to a running session. Dropping it cancels the session.
pub struct SessionController {
    session_id: SessionId,
    role: Role,
    events: mpsc::UnboundedSender<SessionEvent>,
    display: watch::Receiver<Option<DisplayFrame>>,
    result: watch::Receiver<SessionResult>,
}

impl SessionController {
    /// Start a session on the current tokio runtime.
    pub fn start<T: Transport>(
        transport: Arc<T>,
        role: Role,
        messages: Option<Vec<String>>,
        config: SessionConfig,
    ) -> SessionController {
        let mut machine = TransferMachine::new(role, messages);
        machine.set_pairing_retries(config.pairing_retries);
        let session_id = machine.session_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = watch::channel(None);
        let (result_tx, result_rx) = watch::channel(SessionResult::Pending);

        let driver = Driver {
            transport,
            machine,
            config,
            events_tx: events_tx.clone(),
            events: events_rx,
            display: display_tx,
            result: result_tx,
            outcome: None,
            discovery: None,
            pairing: None,
            reader: None,
            writer: None,
        };
        let span = tracing::info_span!("session", id = %session_id, %role);
        tokio::spawn(driver.run().instrument(span));

        SessionController {
            session_id,
            role,
            events: events_tx,
            display: display_rx,
            result: result_rx,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn frame_input(&self) -> FrameInput {
        FrameInput {
            events: self.events.clone(),
        }
    }

    /// Receiver: text decoded from the forward channel.
    pub fn on_forward_channel_message(&self, text: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Scanned(text.into()));
    }

    /// Frame the host should be showing right now, if any.
    pub fn current_display_frame(&self) -> Option<DisplayFrame> {
        self.display.borrow().clone()
    }

    /// Watch for display changes instead of polling.
    pub fn display_updates(&self) -> watch::Receiver<Option<DisplayFrame>> {
        self.display.clone()
    }

    pub fn result(&self) -> SessionResult {
        self.result.borrow().clone()
    }

    /// Wait for the session to finish.
    pub async fn wait(&self) -> SessionResult {
        wait_for_result(self.result.clone()).await
    }

    /// Cancel the session. No effect once it has finished.
    pub fn stop(&self) {
        let _ = self.events.send(SessionEvent::Stop);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn wait_for_result(mut rx: watch::Receiver<SessionResult>) -> SessionResult {
    match rx.wait_for(|r| !r.is_pending()).await {
        Ok(r) => r.clone(),
        Err(_) => SessionResult::Error(TransferError::Cancelled),
    }
}

struct Driver<T: Transport> {
    transport: Arc<T>,
    machine: TransferMachine,
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    display: watch::Sender<Option<DisplayFrame>>,
    result: watch::Sender<SessionResult>,
    outcome: Option<Outcome>,
    discovery: Option<JoinHandle<()>>,
    pairing: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<(mpsc::UnboundedSender<AckToken>, JoinHandle<()>)>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        let invitation = match self.machine.role() {
            Role::Sender => self.transport.invitation_address(),
            Role::Receiver => None,
        };
        let actions = self.machine.start(invitation.as_deref());
        self.apply(actions);
        while !self.machine.is_finished() {
            let Some(event) = self.events.recv().await else {
                let actions = self.machine.cancel();
                self.apply(actions);
                break;
            };
            let actions = self.dispatch(event);
            self.apply(actions);
        }
        self.teardown().await;
    }

    fn dispatch(&mut self, event: SessionEvent) -> Vec<Action> {
        match event {
            SessionEvent::Scanned(text) => self.machine.on_frame_scanned(&text),
            SessionEvent::PeerFound(candidate) => self.machine.on_peer_found(candidate),
            SessionEvent::Paired(Ok(info)) => self.machine.on_paired(info),
            SessionEvent::Paired(Err(err)) => self.machine.on_pairing_failed(err),
            SessionEvent::AckReceived(token) => self.machine.on_ack_received(token),
            SessionEvent::AckSent(token) => self.machine.on_ack_sent(token),
            SessionEvent::AckFailed(token, err) => self.machine.on_ack_send_failed(token, err),
            SessionEvent::TransportFailed(err) => self.machine.on_transport_error(err),
            SessionEvent::Stop => self.machine.cancel(),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::StartDiscovery => self.restart_discovery(),
                Action::AwaitPeer => self.spawn_pairing(None),
                Action::Pair(candidate) => self.spawn_pairing(Some(candidate)),
                Action::StartReceiving => self.start_back_channel(),
                Action::Display(frame) => {
                    debug!(position = frame.position, total = frame.total, "display");
                    self.display.send_replace(Some(frame));
                }
                Action::SendAck(token) => match &self.writer {
                    Some((tx, _)) if tx.send(token).is_ok() => {}
                    _ => {
                        let _ = self
                            .events_tx
                            .send(SessionEvent::AckFailed(token, TransportError::NotPaired));
                    }
                },
                Action::Finish(outcome) => self.outcome = Some(outcome),
            }
        }
    }

    fn restart_discovery(&mut self) {
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
        let task = discovery_loop(
            self.transport.clone(),
            self.config.discovery_interval,
            self.events_tx.clone(),
        );
        self.discovery = Some(tokio::spawn(task.in_current_span()));
    }

    fn spawn_pairing(&mut self, candidate: Option<PeerCandidate>) {
        if let Some(task) = self.pairing.take() {
            task.abort();
        }
        let transport = self.transport.clone();
        let role = self.machine.role();
        let limit = self.config.pairing_timeout;
        let events = self.events_tx.clone();
        let task = async move {
            let result = match candidate {
                Some(candidate) => {
                    match tokio::time::timeout(limit, transport.pair(role, Some(candidate))).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(PairingError::Timeout),
                    }
                }
                None => transport.pair(role, None).await,
            };
            let _ = events.send(SessionEvent::Paired(result));
        };
        self.pairing = Some(tokio::spawn(task.in_current_span()));
    }

    fn start_back_channel(&mut self) {
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
        let reader = reader_loop(self.transport.clone(), self.events_tx.clone());
        self.reader = Some(tokio::spawn(reader.in_current_span()));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = writer_loop(self.transport.clone(), rx, self.events_tx.clone());
        self.writer = Some((tx, tokio::spawn(writer.in_current_span())));
    }

    async fn teardown(mut self) {
        for task in [self.discovery.take(), self.pairing.take(), self.reader.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some((_, task)) = self.writer.take() {
            task.abort();
        }
        self.transport.close().await;
        self.display.send_replace(None);
        let outcome = self
            .outcome
            .take()
            .unwrap_or(Outcome::Error(TransferError::Cancelled));
        match &outcome {
            Outcome::Success(messages) => info!(messages = messages.len(), "session finished"),
            Outcome::Error(err) => warn!(error = %err, "session failed"),
        }
        self.result.send_replace(outcome.into());
    }
}

/// Rerun discovery every `interval`, forwarding candidates until the task is aborted.
async fn discovery_loop<T: Transport>(
    transport: Arc<T>,
    interval: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        let mut candidates = transport.discover().await;
        let round = tokio::time::sleep(interval);
        tokio::pin!(round);
        loop {
            tokio::select! {
                found = candidates.recv() => match found {
                    Some(candidate) => {
                        debug!(peer = %candidate.address, "discovered");
                        if events.send(SessionEvent::PeerFound(candidate)).is_err() {
                            return;
                        }
                    }
                    None => {
                        (&mut round).await;
                        break;
                    }
                },
                _ = &mut round => break,
            }
        }
        debug!("restarting discovery");
    }
}

/// Read acks off the back-channel. An ack equal to the one just before it is
/// a re-ack of a rescanned frame and is dropped here.
async fn reader_loop<T: Transport>(transport: Arc<T>, events: mpsc::UnboundedSender<SessionEvent>) {
    let mut buf = MessageBuffer::new();
    let mut previous: Option<AckToken> = None;
    loop {
        let bytes = match transport.receive().await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "back-channel reader stopped");
                let _ = events.send(SessionEvent::TransportFailed(err));
                return;
            }
        };
        buf.extend(&bytes);
        loop {
            match buf.next_message() {
                Ok(Some(Message::Ack { token })) => {
                    if previous == Some(token) {
                        debug!(%token, "repeated ack dropped");
                        continue;
                    }
                    previous = Some(token);
                    if events.send(SessionEvent::AckReceived(token)).is_err() {
                        return;
                    }
                }
                Ok(Some(other)) => debug!(?other, "unexpected message on back-channel"),
                Ok(None) => break,
                Err(err) => {
                    let _ = events.send(SessionEvent::TransportFailed(TransportError::Io(
                        err.to_string(),
                    )));
                    return;
                }
            }
        }
    }
}

/// Serialize outbound acks; every token is reported as sent or failed.
async fn writer_loop<T: Transport>(
    transport: Arc<T>,
    mut acks: mpsc::UnboundedReceiver<AckToken>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(token) = acks.recv().await {
        let sent = match encode_message(&Message::Ack { token }) {
            Ok(bytes) => transport.send(&bytes).await,
            Err(err) => Err(TransportError::Io(err.to_string())),
        };
        let event = match sent {
            Ok(()) => SessionEvent::AckSent(token),
            Err(err) => SessionEvent::AckFailed(token, err),
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::transport::memory::MemoryTransport;

    const LIMIT: Duration = Duration::from_secs(5);

    fn fast_config() -> SessionConfig {
        SessionConfig {
            pairing_timeout: Duration::from_millis(500),
            discovery_interval: Duration::from_millis(50),
            pairing_retries: 1,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct Pair {
        sender: SessionController,
        receiver: SessionController,
        sender_link: Arc<MemoryTransport>,
    }

    fn start_pair(messages: Option<Vec<String>>) -> Pair {
        let (a, b) = MemoryTransport::linked();
        let (a, b) = (Arc::new(a), Arc::new(b));
        let sender = SessionController::start(a.clone(), Role::Sender, messages, fast_config());
        let receiver = SessionController::start(b, Role::Receiver, None, fast_config());
        Pair {
            sender,
            receiver,
            sender_link: a,
        }
    }

    /// Keeps pointing the receiver's camera at the sender's screen.
    fn camera(sender: &SessionController, receiver: &SessionController) -> JoinHandle<()> {
        let screen = sender.display_updates();
        let input = receiver.frame_input();
        tokio::spawn(async move {
            loop {
                let shown = screen.borrow().clone();
                if let Some(d) = shown {
                    if !input.submit(d.frame.as_str()) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    async fn wait_for_position(sender: &SessionController, position: usize) -> DisplayFrame {
        let mut rx = sender.display_updates();
        let frame = rx
            .wait_for(|d| matches!(d, Some(d) if d.position == position))
            .await
            .unwrap();
        frame.clone().unwrap()
    }

    #[tokio::test]
    async fn hello_transfer_completes_on_both_sides() {
        let p = start_pair(Some(strings(&["hello"])));
        let cam = camera(&p.sender, &p.receiver);
        let (s, r) = tokio::time::timeout(LIMIT, async {
            tokio::join!(p.sender.wait(), p.receiver.wait())
        })
        .await
        .unwrap();
        cam.abort();
        assert_eq!(s, SessionResult::Success(vec![]));
        assert_eq!(r, SessionResult::Success(strings(&["hello"])));
        assert_eq!(p.sender.current_display_frame(), None);
    }

    #[tokio::test]
    async fn many_messages_arrive_in_order_despite_rescans() {
        let msgs = strings(&["one", "", "three\nlines", "ÿ latin-1 é"]);
        let p = start_pair(Some(msgs.clone()));
        // the camera rescans every frame many times before the screen changes
        let cam = camera(&p.sender, &p.receiver);
        let r = tokio::time::timeout(LIMIT, p.receiver.wait()).await.unwrap();
        let s = tokio::time::timeout(LIMIT, p.sender.wait()).await.unwrap();
        cam.abort();
        assert_eq!(r, SessionResult::Success(msgs));
        assert_eq!(s, SessionResult::Success(vec![]));
    }

    #[tokio::test]
    async fn empty_list_transfers_only_eot() {
        let p = start_pair(Some(vec![]));
        let cam = camera(&p.sender, &p.receiver);
        let r = tokio::time::timeout(LIMIT, p.receiver.wait()).await.unwrap();
        cam.abort();
        assert_eq!(r, SessionResult::Success(vec![]));
    }

    #[tokio::test]
    async fn sender_without_messages_errors_immediately() {
        let (a, _b) = MemoryTransport::linked();
        let s = SessionController::start(Arc::new(a), Role::Sender, None, fast_config());
        let r = tokio::time::timeout(LIMIT, s.wait()).await.unwrap();
        assert_eq!(r, SessionResult::Error(TransferError::MissingMessages));
    }

    #[tokio::test]
    async fn sender_shows_invitation_while_pairing() {
        let (a, _b) = MemoryTransport::linked();
        let s = SessionController::start(Arc::new(a), Role::Sender, Some(vec![]), fast_config());
        let shown = tokio::time::timeout(LIMIT, wait_for_position(&s, 0))
            .await
            .unwrap();
        let decoded = frame::decode_frame(shown.frame.as_str()).unwrap();
        assert_eq!(decoded.invitation_address(), Some("mem:coordinator"));
        assert!(s.result().is_pending());
    }

    #[tokio::test]
    async fn corrupted_scan_is_ignored_until_a_clean_one() {
        let p = start_pair(Some(strings(&["payload"])));
        let first = tokio::time::timeout(LIMIT, wait_for_position(&p.sender, 1))
            .await
            .unwrap();
        let tampered = first.frame.as_str().replacen("payload", "paYload", 1);
        p.receiver.on_forward_channel_message(tampered);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(p.sender.current_display_frame().map(|d| d.position), Some(1));
        assert!(p.receiver.result().is_pending());

        let cam = camera(&p.sender, &p.receiver);
        let r = tokio::time::timeout(LIMIT, p.receiver.wait()).await.unwrap();
        cam.abort();
        assert_eq!(r, SessionResult::Success(strings(&["payload"])));
    }

    #[tokio::test]
    async fn disconnect_mid_transfer_fails_both() {
        let p = start_pair(Some(strings(&["a"])));
        let first = tokio::time::timeout(LIMIT, wait_for_position(&p.sender, 1))
            .await
            .unwrap();
        // rescan until the receiver is paired and has acked the first frame
        tokio::time::timeout(LIMIT, async {
            while p.sender.current_display_frame().map(|d| d.position) != Some(2) {
                p.receiver.on_forward_channel_message(first.frame.as_str());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        p.sender_link.disconnect();
        let (s, r) = tokio::time::timeout(LIMIT, async {
            tokio::join!(p.sender.wait(), p.receiver.wait())
        })
        .await
        .unwrap();
        assert_eq!(s, SessionResult::Error(TransferError::Disconnected));
        assert_eq!(r, SessionResult::Error(TransferError::Disconnected));
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_session() {
        let (_a, b) = MemoryTransport::linked();
        let r = SessionController::start(Arc::new(b), Role::Receiver, None, fast_config());
        r.stop();
        let res = tokio::time::timeout(LIMIT, r.wait()).await.unwrap();
        assert_eq!(res, SessionResult::Error(TransferError::Cancelled));
    }

    #[tokio::test]
    async fn pairing_failure_is_retried_once() {
        let (a, b) = MemoryTransport::linked();
        let (a, b) = (Arc::new(a), Arc::new(b));
        b.fail_next_pairing(PairingError::Rejected("busy".into()));
        let sender =
            SessionController::start(a, Role::Sender, Some(strings(&["x"])), fast_config());
        let receiver = SessionController::start(b, Role::Receiver, None, fast_config());
        let cam = camera(&sender, &receiver);
        let r = tokio::time::timeout(LIMIT, receiver.wait()).await.unwrap();
        cam.abort();
        assert_eq!(r, SessionResult::Success(strings(&["x"])));
    }

    #[tokio::test]
    async fn pairing_gives_up_after_the_retry() {
        let (_a, b) = MemoryTransport::linked();
        b.fail_next_pairing(PairingError::Timeout);
        b.fail_next_pairing(PairingError::Timeout);
        let r = SessionController::start(Arc::new(b), Role::Receiver, None, fast_config());
        let res = tokio::time::timeout(LIMIT, r.wait()).await.unwrap();
        assert!(matches!(
            res,
            SessionResult::Error(TransferError::PairingExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn two_senders_conflict() {
        let (a, b) = MemoryTransport::linked();
        let s1 =
            SessionController::start(Arc::new(a), Role::Sender, Some(vec![]), fast_config());
        let s2 =
            SessionController::start(Arc::new(b), Role::Sender, Some(vec![]), fast_config());
        let (r1, r2) = tokio::time::timeout(LIMIT, async { tokio::join!(s1.wait(), s2.wait()) })
            .await
            .unwrap();
        assert_eq!(r1, SessionResult::Error(TransferError::RoleConflict));
        assert_eq!(r2, SessionResult::Error(TransferError::RoleConflict));
    }

    #[tokio::test]
    async fn reader_drops_back_to_back_repeats() {
        let (a, b) = MemoryTransport::linked();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(Arc::new(a), tx));
        let first = AckToken::from_bytes([1, 1]);
        let second = AckToken::from_bytes([2, 2]);
        for token in [first, first, second, first] {
            b.send(&encode_message(&Message::Ack { token }).unwrap())
                .await
                .unwrap();
        }
        b.close().await;
        tokio::time::timeout(LIMIT, reader).await.unwrap().unwrap();

        let mut acks = Vec::new();
        let mut closed = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                SessionEvent::AckReceived(t) => acks.push(t),
                SessionEvent::TransportFailed(TransportError::Closed) => closed = true,
                _ => panic!("unexpected event"),
            }
        }
        assert_eq!(acks, [first, second, first]);
        assert!(closed);
    }
}
