//! QrLink transfer protocol.
//!
//! A sender shows a sequence of QR frames; a receiver scans them and
//! acknowledges each one over a short-range back-channel. The framing and the
//! transfer machine are host-driven and do no I/O; [`session`] wires them to a
//! [`Transport`] on a tokio runtime.

pub mod charset;
pub mod forward;
pub mod frame;
pub mod identity;
pub mod integrity;
pub mod machine;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wire;

pub use forward::ForwardChannel;
pub use frame::{decode_frame, encode_frame, DecodedFrame, Frame, FrameError};
pub use identity::{AckToken, SessionId};
pub use integrity::ContentDigest;
pub use machine::{Action, DisplayFrame, Outcome, State, TransferError, TransferMachine};
pub use protocol::{Message, Role, EOT, PROTOCOL_VERSION};
pub use session::{FrameInput, SessionConfig, SessionController, SessionResult};
pub use transport::{PairingError, PairingInfo, PeerCandidate, Transport, TransportError};
pub use wire::{decode_message, encode_message, MessageBuffer, WireDecodeError, WireEncodeError};
