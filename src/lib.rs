//! Host-side runtime for the udrone multicast control protocol.
//!
//! A [`Host`] owns one UDP socket whose multicast egress is pinned to a
//! local interface. It discovers idle drones with `!whois`, recruits them
//! into named [`Group`]s and dispatches commands to every member at once,
//! tolerating datagram loss through bounded retransmission.

#![cfg(any(target_os = "linux", feature = "doc"))]

mod error;
mod group;
mod host;
mod msg;
mod sock;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
pub use group::{Group, Replies, DEFAULT_CALL_TIMEOUT};
pub use host::{Answers, Builder, Host, GROUP_ID_MAX, IDLE_INTERVAL, RESEND_STRATEGY};
pub use msg::{
    Message, GROUP_ALL_DEFAULT, MAX_DGRAM, MCAST_GROUP, MCAST_PORT, SEQ_BOUND, TYPE_ACCEPT,
    TYPE_ASSIGN, TYPE_RESET, TYPE_STATUS, TYPE_UNSUPPORTED, TYPE_WHOIS,
};
pub use sock::{interface_addr, Link};
