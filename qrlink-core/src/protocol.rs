//! QrLink protocol: roles, reserved contents, back-channel message types and version.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::AckToken;

/// Current protocol version. Used in beacons and the pairing handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// End Of Transmission sentinel, always the last message a sender frames.
pub const EOT: &str = "OTP_EOT";

/// Prefix of the pre-pairing invitation frame; the rest is the sender's back-channel address.
pub const INVITATION_TAG: &str = "OTP_MAC:";

/// Which end of the transfer this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Displays frames, receives acks. Coordinates the back-channel.
    Sender,
    /// Scans frames, sends acks.
    Receiver,
}

impl Role {
    /// The sender is always the coordinating (accepting) side of the back-channel.
    pub fn is_coordinator(self) -> bool {
        matches!(self, Role::Sender)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Contents the protocol itself uses; user messages may not collide with them.
pub fn is_reserved(content: &str) -> bool {
    content == EOT || content.starts_with(INVITATION_TAG)
}

/// Back-channel message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence on the LAN.
    Beacon {
        protocol_version: u8,
        instance: u64,
        role: Role,
        listen_port: u16,
    },
    /// Pairing handshake, exchanged once in each direction.
    Hello { protocol_version: u8, role: Role },
    /// Receiver acknowledges the frame carrying `token`.
    Ack { token: AckToken },
}
