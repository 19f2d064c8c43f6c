//! Host-driven transfer state machine: the host passes events, the machine returns actions.
//!
//! One machine per session, parameterized by [`Role`]. It never blocks and
//! never performs I/O; the session controller executes the returned
//! [`Action`]s and feeds results back as events through a single queue.

use tracing::{debug, info, warn};

use crate::charset;
use crate::frame::{self, Frame};
use crate::identity::{AckToken, SessionId};
use crate::protocol::{self, Role, EOT};
use crate::transport::{PairingError, PairingInfo, PeerCandidate, TransportError};

/// Default number of pairing retries after the first attempt.
pub const DEFAULT_PAIRING_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Pairing,
    Paired,
    InTransmission,
    Finishing,
    Success,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Error)
    }
}

/// The frame the sender currently shows, with its place in the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub frame: Frame,
    /// 1-based position among the framed messages (EOT included); 0 for the invitation.
    pub position: usize,
    pub total: usize,
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Received messages in order (always empty on the sender).
    Success(Vec<String>),
    Error(TransferError),
}

/// Why a session ended in `Error`. Recoverable conditions never show up here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("sender started without a message list")]
    MissingMessages,
    #[error("message {index} cannot be sent: {reason}")]
    InvalidMessage { index: usize, reason: String },
    #[error("ack mismatch: expected {expected}, received {received}")]
    AckMismatch {
        expected: AckToken,
        received: AckToken,
    },
    #[error("ack {0} received while no frame was awaiting one")]
    UnexpectedAck(AckToken),
    #[error("back-channel disconnected before the transfer finished")]
    Disconnected,
    #[error("back-channel failure: {0}")]
    Transport(TransportError),
    #[error("role conflict: peers disagree on who is the sender")]
    RoleConflict,
    #[error("pairing failed after {attempts} attempt(s): {last}")]
    PairingExhausted { attempts: u32, last: PairingError },
    #[error("session cancelled")]
    Cancelled,
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// (Re)start peer discovery in the background.
    StartDiscovery,
    /// Coordinator: wait for a peer to pair with us.
    AwaitPeer,
    /// Receiver: pair with this candidate.
    Pair(PeerCandidate),
    /// Back-channel is up: start the reader and writer workers.
    StartReceiving,
    /// Show this frame on the forward channel until told otherwise.
    Display(DisplayFrame),
    /// Send an ack over the back-channel and report `on_ack_sent` when done.
    SendAck(AckToken),
    /// Session is over. Emitted exactly once.
    Finish(Outcome),
}

enum Side {
    Sender {
        messages: Option<Vec<String>>,
        index: usize,
        expected_ack: Option<AckToken>,
    },
    Receiver {
        received: Vec<String>,
        previous_ack: Option<AckToken>,
        eot_ack: Option<AckToken>,
    },
}

/// Transfer state machine for one session.
pub struct TransferMachine {
    session_id: SessionId,
    role: Role,
    state: State,
    side: Side,
    pairing: Option<PairingInfo>,
    attempt_in_flight: bool,
    attempts: u32,
    retries_left: u32,
}

impl TransferMachine {
    /// Sender machine. `None` is accepted here and reported as `MissingMessages` on start.
    pub fn sender(messages: Option<Vec<String>>) -> Self {
        Self::with_side(
            Role::Sender,
            Side::Sender {
                messages,
                index: 0,
                expected_ack: None,
            },
        )
    }

    pub fn receiver() -> Self {
        Self::with_side(
            Role::Receiver,
            Side::Receiver {
                received: Vec::new(),
                previous_ack: None,
                eot_ack: None,
            },
        )
    }

    /// Machine for `role`; `messages` is only used by the sender.
    pub fn new(role: Role, messages: Option<Vec<String>>) -> Self {
        match role {
            Role::Sender => Self::sender(messages),
            Role::Receiver => {
                if messages.is_some() {
                    debug!("receiver ignores the supplied message list");
                }
                Self::receiver()
            }
        }
    }

    fn with_side(role: Role, side: Side) -> Self {
        Self {
            session_id: SessionId::new(),
            role,
            state: State::Idle,
            side,
            pairing: None,
            attempt_in_flight: false,
            attempts: 0,
            retries_left: DEFAULT_PAIRING_RETRIES,
        }
    }

    /// Set how many times pairing may be retried after the first attempt.
    pub fn set_pairing_retries(&mut self, retries: u32) {
        self.retries_left = retries;
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn pairing_info(&self) -> Option<&PairingInfo> {
        self.pairing.as_ref()
    }

    /// Ack the sender is waiting for, if any.
    pub fn expected_ack(&self) -> Option<AckToken> {
        match &self.side {
            Side::Sender { expected_ack, .. } => *expected_ack,
            Side::Receiver { .. } => None,
        }
    }

    /// Messages accumulated so far (receiver only).
    pub fn received(&self) -> &[String] {
        match &self.side {
            Side::Receiver { received, .. } => received,
            Side::Sender { .. } => &[],
        }
    }

    /// Begin the session. `invitation` is the sender's back-channel address,
    /// shown as a pre-pairing frame when the transport offers one.
    pub fn start(&mut self, invitation: Option<&str>) -> Vec<Action> {
        if self.state != State::Idle {
            warn!(state = ?self.state, "start ignored: session already started");
            return vec![];
        }
        info!(session = %self.session_id, role = %self.role, "session starting");
        if let Side::Sender { messages, .. } = &mut self.side {
            let Some(list) = messages.as_mut() else {
                return self.fail(TransferError::MissingMessages);
            };
            if let Some(err) = validate_messages(list) {
                return self.fail(err);
            }
            list.push(EOT.to_string());
        }
        self.state = State::Pairing;
        let mut actions = self.begin_pairing();
        if self.role == Role::Sender {
            if let Some(address) = invitation {
                match frame::invitation_frame(AckToken::generate(), address) {
                    Ok(frame) => actions.push(Action::Display(DisplayFrame {
                        frame,
                        position: 0,
                        total: self.total_frames(),
                    })),
                    Err(e) => warn!(%address, error = %e, "invitation address not displayable"),
                }
            }
        }
        actions
    }

    /// Discovery found a peer (or the receiver scanned an invitation).
    pub fn on_peer_found(&mut self, candidate: PeerCandidate) -> Vec<Action> {
        if self.state != State::Pairing {
            return vec![];
        }
        if self.role.is_coordinator() {
            debug!(peer = %candidate.address, "peer seen, waiting for it to pair");
            return vec![];
        }
        if self.attempt_in_flight {
            debug!(peer = %candidate.address, "pairing attempt already in flight");
            return vec![];
        }
        self.attempt_in_flight = true;
        self.attempts += 1;
        info!(peer = %candidate.address, attempt = self.attempts, "pairing");
        vec![Action::Pair(candidate)]
    }

    /// Transport finished pairing.
    pub fn on_paired(&mut self, info: PairingInfo) -> Vec<Action> {
        if self.state != State::Pairing {
            warn!(state = ?self.state, "late pairing result ignored");
            return vec![];
        }
        self.attempt_in_flight = false;
        if info.is_coordinator != self.role.is_coordinator() {
            warn!(
                role = %self.role,
                coordinator = info.is_coordinator,
                "devices are inverted: the sender must coordinate the back-channel"
            );
            return self.fail(TransferError::RoleConflict);
        }
        info!(peer = %info.peer_address, "paired");
        self.pairing = Some(info);
        self.state = State::Paired;
        let mut actions = vec![Action::StartReceiving];
        if self.role == Role::Sender {
            actions.extend(self.emit_current());
        }
        actions
    }

    /// Transport could not pair.
    pub fn on_pairing_failed(&mut self, err: PairingError) -> Vec<Action> {
        if self.state != State::Pairing {
            return vec![];
        }
        self.attempt_in_flight = false;
        if !err.is_transient() {
            return self.fail(TransferError::RoleConflict);
        }
        self.retry_or_fail(err)
    }

    /// Sender: ack arrived over the back-channel.
    pub fn on_ack_received(&mut self, token: AckToken) -> Vec<Action> {
        if self.state.is_terminal() {
            return vec![];
        }
        let expected = match &self.side {
            Side::Sender { expected_ack, .. } => *expected_ack,
            Side::Receiver { .. } => {
                warn!(%token, "receiver got an ack; ignoring");
                return vec![];
            }
        };
        match expected {
            Some(exp) if exp == token => {
                debug!(%token, "ack matched");
                self.advance()
            }
            Some(exp) => self.fail(TransferError::AckMismatch {
                expected: exp,
                received: token,
            }),
            None => self.fail(TransferError::UnexpectedAck(token)),
        }
    }

    /// Receiver: the forward channel produced text.
    pub fn on_frame_scanned(&mut self, text: &str) -> Vec<Action> {
        if self.role != Role::Receiver
            || self.state.is_terminal()
            || self.state == State::Finishing
        {
            return vec![];
        }
        let decoded = match frame::decode_frame(text) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discarding unreadable frame");
                return vec![];
            }
        };
        if !decoded.is_intact() {
            warn!(ack = %decoded.ack, "digest mismatch, waiting for rescan");
            return vec![];
        }
        if let Some(address) = decoded.invitation_address() {
            if matches!(self.state, State::Idle | State::Pairing) {
                let candidate = PeerCandidate::new(address);
                return self.on_peer_found(candidate);
            }
            debug!("invitation scanned after pairing; ignoring");
            return vec![];
        }
        match self.state {
            State::Idle | State::Pairing => {
                debug!("frame scanned before pairing; ignoring");
                return vec![];
            }
            State::Paired => {
                info!("first frame scanned, transmission started");
                self.state = State::InTransmission;
            }
            _ => {}
        }
        let ack = decoded.ack;
        let Side::Receiver {
            received,
            previous_ack,
            eot_ack,
        } = &mut self.side
        else {
            return vec![];
        };
        if decoded.content == EOT {
            info!(%ack, messages = received.len(), "end of transmission scanned");
            *previous_ack = Some(ack);
            *eot_ack = Some(ack);
            self.state = State::Finishing;
            return vec![Action::SendAck(ack)];
        }
        if *previous_ack == Some(ack) {
            debug!(%ack, "repeated scan, re-sending ack");
        } else {
            *previous_ack = Some(ack);
            received.push(decoded.content);
            debug!(%ack, count = received.len(), "message accepted");
        }
        vec![Action::SendAck(ack)]
    }

    /// Receiver: an ack left the device.
    pub fn on_ack_sent(&mut self, token: AckToken) -> Vec<Action> {
        if self.state != State::Finishing {
            return vec![];
        }
        match &self.side {
            Side::Receiver {
                received,
                eot_ack: Some(eot),
                ..
            } if *eot == token => {
                let messages = received.clone();
                self.succeed(messages)
            }
            _ => vec![],
        }
    }

    /// Receiver: an ack could not be sent.
    pub fn on_ack_send_failed(&mut self, token: AckToken, err: TransportError) -> Vec<Action> {
        let awaiting_eot = matches!(
            &self.side,
            Side::Receiver { eot_ack: Some(eot), .. } if *eot == token
        );
        if self.state == State::Finishing && awaiting_eot {
            return match err {
                TransportError::Closed => self.fail(TransferError::Disconnected),
                other => self.fail(TransferError::Transport(other)),
            };
        }
        self.on_transport_error(err)
    }

    /// Back-channel dropped.
    pub fn on_disconnected(&mut self) -> Vec<Action> {
        match self.state {
            State::Idle | State::Success | State::Error => vec![],
            State::Pairing => {
                self.attempt_in_flight = false;
                self.retry_or_fail(PairingError::Transport("link dropped".into()))
            }
            State::Finishing if self.role == Role::Receiver => {
                debug!("disconnect after end of transmission; ignoring");
                vec![]
            }
            State::Paired | State::InTransmission | State::Finishing => {
                self.fail(TransferError::Disconnected)
            }
        }
    }

    /// Back-channel I/O failed outside of a clean disconnect.
    pub fn on_transport_error(&mut self, err: TransportError) -> Vec<Action> {
        if self.state.is_terminal() {
            return vec![];
        }
        if err == TransportError::Closed {
            return self.on_disconnected();
        }
        self.fail(TransferError::Transport(err))
    }

    /// Host is tearing the session down.
    pub fn cancel(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return vec![];
        }
        self.fail(TransferError::Cancelled)
    }

    fn begin_pairing(&mut self) -> Vec<Action> {
        if self.role.is_coordinator() {
            self.attempt_in_flight = true;
            self.attempts += 1;
            vec![Action::StartDiscovery, Action::AwaitPeer]
        } else {
            vec![Action::StartDiscovery]
        }
    }

    fn retry_or_fail(&mut self, last: PairingError) -> Vec<Action> {
        if self.retries_left == 0 {
            return self.fail(TransferError::PairingExhausted {
                attempts: self.attempts,
                last,
            });
        }
        self.retries_left -= 1;
        warn!(error = %last, retries_left = self.retries_left, "pairing failed, retrying");
        self.state = State::Pairing;
        self.pairing = None;
        self.begin_pairing()
    }

    /// Sender: expected ack arrived.
    fn advance(&mut self) -> Vec<Action> {
        let Side::Sender {
            messages: Some(messages),
            index,
            ..
        } = &mut self.side
        else {
            return vec![];
        };
        if messages[*index] == EOT {
            return self.succeed(Vec::new());
        }
        *index += 1;
        self.emit_current()
    }

    /// Sender: frame the current message under a fresh token.
    fn emit_current(&mut self) -> Vec<Action> {
        let Side::Sender {
            messages: Some(messages),
            index,
            expected_ack,
        } = &mut self.side
        else {
            return vec![];
        };
        // consecutive frames never share a token, or dedup would swallow the second
        let mut token = AckToken::generate();
        while Some(token) == *expected_ack {
            token = AckToken::generate();
        }
        let content = &messages[*index];
        let position = *index + 1;
        let total = messages.len();
        let is_eot = content == EOT;
        let frame = match frame::encode_frame(token, content) {
            Ok(f) => f,
            Err(e) => {
                let index = *index;
                return self.fail(TransferError::InvalidMessage {
                    index,
                    reason: e.to_string(),
                });
            }
        };
        *expected_ack = Some(token);
        self.state = if is_eot {
            State::Finishing
        } else {
            State::InTransmission
        };
        debug!(%token, position, total, "displaying frame");
        vec![Action::Display(DisplayFrame {
            frame,
            position,
            total,
        })]
    }

    fn total_frames(&self) -> usize {
        match &self.side {
            Side::Sender {
                messages: Some(m), ..
            } => m.len(),
            _ => 0,
        }
    }

    fn succeed(&mut self, messages: Vec<String>) -> Vec<Action> {
        info!(session = %self.session_id, messages = messages.len(), "transfer complete");
        self.state = State::Success;
        vec![Action::Finish(Outcome::Success(messages))]
    }

    fn fail(&mut self, err: TransferError) -> Vec<Action> {
        warn!(session = %self.session_id, state = ?self.state, error = %err, "transfer failed");
        self.state = State::Error;
        vec![Action::Finish(Outcome::Error(err))]
    }
}

/// First problem with a sender's list, if any.
fn validate_messages(messages: &[String]) -> Option<TransferError> {
    messages.iter().enumerate().find_map(|(index, m)| {
        if !charset::is_latin1(m) {
            Some(TransferError::InvalidMessage {
                index,
                reason: "content is not representable in ISO-8859-1".into(),
            })
        } else if protocol::is_reserved(m) {
            Some(TransferError::InvalidMessage {
                index,
                reason: "content collides with a protocol marker".into(),
            })
        } else {
            None
        }
    })
}
