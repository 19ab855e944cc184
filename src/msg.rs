//! The drone control wire protocol.
//!
//! One self-describing envelope per datagram, serialised as compact
//! single-line JSON. Types starting with `!` are control verbs handled by
//! the drone runtime itself; every other type is a user command forwarded
//! to whatever the drone is running.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Well-known multicast group all drones listen on.
pub const MCAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 6, 6, 6);

/// Well-known multicast port.
pub const MCAST_PORT: u16 = 21337;

/// Upper bound for one encoded envelope.
pub const MAX_DGRAM: usize = 32 * 1024;

/// Pseudo group addressing every idle (unassigned) drone.
pub const GROUP_ALL_DEFAULT: &str = "!all-default";

/// Sequence numbers are random 31-bit values below this bound.
pub const SEQ_BOUND: u32 = 2_000_000_000;

/// Discovery and liveness control verb.
pub const TYPE_WHOIS: &str = "!whois";

/// Membership control verb.
pub const TYPE_ASSIGN: &str = "!assign";

/// Teardown control verb.
pub const TYPE_RESET: &str = "!reset";

/// Terminal reply carrying a numeric result code, 0 meaning success.
pub const TYPE_STATUS: &str = "status";

/// Non-terminal reply, the drone is still working.
pub const TYPE_ACCEPT: &str = "accept";

/// Terminal reply, the command is not understood.
pub const TYPE_UNSUPPORTED: &str = "unsupported";

/// A single protocol envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    /// Constructs an envelope originating from `from`.
    pub fn new(from: &str, to: &str, msg_type: &str, seq: u32, data: Option<Value>) -> Self {
        Message {
            from: from.to_owned(),
            to: to.to_owned(),
            msg_type: msg_type.to_owned(),
            seq,
            data,
        }
    }

    /// Serialises to the compact single-line wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::Protocol(err.to_string()))
    }

    /// Parses a received datagram; `None` for anything malformed.
    pub fn decode(raw: &[u8]) -> Option<Message> {
        serde_json::from_slice(raw).ok()
    }

    /// Control messages never advance a group's sequence counter.
    pub fn is_control(&self) -> bool {
        self.msg_type.starts_with('!')
    }

    pub fn is_accept(&self) -> bool {
        self.msg_type == TYPE_ACCEPT
    }

    pub fn is_status(&self) -> bool {
        self.msg_type == TYPE_STATUS
    }

    /// The numeric result code of a well-formed `status` reply.
    pub fn status_code(&self) -> Option<i64> {
        if !self.is_status() {
            return None;
        }
        self.data.as_ref()?.get("code")?.as_i64()
    }

    /// The optional error description of a `status` reply.
    pub fn errstr(&self) -> Option<&str> {
        self.data.as_ref()?.get("errstr")?.as_str()
    }
}
