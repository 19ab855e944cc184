//! The drone host: identity, retransmission policy and the reliable
//! request primitives shared by all groups.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::group::Group;
use crate::msg::{Message, MAX_DGRAM, MCAST_GROUP, MCAST_PORT, SEQ_BOUND, TYPE_RESET, TYPE_STATUS, TYPE_WHOIS};
use crate::sock::Link;

/// Receive windows of one reliable call; each entry is one (re)send.
pub const RESEND_STRATEGY: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(1),
];

/// Idle interval between keep-alive pings of a non-empty group.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(19);

/// Longest group id, including the appended host token.
pub const GROUP_ID_MAX: usize = 16;

/// Replies to one call, keyed by responder identity.
///
/// Duplicate replies for the same identity are last-writer-wins.
pub type Answers = HashMap<String, Message>;

/// Allocates a random 31-bit sequence number.
pub(crate) fn genseq() -> u32 {
    rand::thread_rng().gen_range(0, SEQ_BOUND)
}

fn gen_hostid() -> String {
    format!("{:06x}", rand::thread_rng().gen::<u32>() & 0x00ff_ffff)
}

/// Host configuration with protocol defaults.
///
/// The terminal [`Builder::open`] binds the socket and brings the host up.
#[derive(Clone, Debug)]
pub struct Builder {
    dest: SocketAddr,
    resend: Vec<Duration>,
    idle_interval: Duration,
    max_dgram: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            dest: SocketAddr::V4(SocketAddrV4::new(MCAST_GROUP, MCAST_PORT)),
            resend: RESEND_STRATEGY.to_vec(),
            idle_interval: IDLE_INTERVAL,
            max_dgram: MAX_DGRAM,
        }
    }
}

impl Builder {
    /// Overrides the destination endpoint (default `239.6.6.6:21337`).
    pub fn dest(mut self, dest: SocketAddr) -> Self {
        self.dest = dest;
        self
    }

    /// Overrides the receive windows of the retransmission strategy.
    pub fn resend_strategy<I>(mut self, windows: I) -> Self
    where
        I: IntoIterator<Item = Duration>,
    {
        self.resend = windows.into_iter().collect();
        self
    }

    /// Overrides the keep-alive interval of idle groups.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Overrides the datagram size limit.
    pub fn max_dgram(mut self, max_dgram: usize) -> Self {
        self.max_dgram = max_dgram;
        self
    }

    /// Binds the socket and brings the host up on `interface`.
    pub fn open(self, interface: &str) -> Result<Host> {
        if self.resend.is_empty() {
            return Err(Error::Protocol(
                "retransmission strategy must not be empty".to_owned(),
            ));
        }

        let hostid = gen_hostid();
        let ident = format!("Host {}", hostid);
        let link = Link::open(interface, self.dest, self.max_dgram)?;
        info!("host {} up on {}", ident, interface);

        Ok(Host(Arc::new(Shared {
            hostid,
            ident,
            resend: self.resend,
            idle_interval: self.idle_interval,
            link: Mutex::new(link),
            groups: Mutex::new(Vec::new()),
        })))
    }
}

pub(crate) struct Shared {
    hostid: String,
    ident: String,
    resend: Vec<Duration>,
    idle_interval: Duration,
    link: Mutex<Link>,
    groups: Mutex<Vec<Group>>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        // the socket: at most one send or receive drain at a time
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A drone host. Cloning yields another handle to the same runtime.
#[derive(Clone)]
pub struct Host(pub(crate) Arc<Shared>);

impl Host {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Opens a host with protocol defaults on `interface`.
    pub fn open(interface: &str) -> Result<Host> {
        Builder::default().open(interface)
    }

    /// The full sender identity, `Host <hex>`.
    pub fn identity(&self) -> &str {
        &self.0.ident
    }

    /// The hex token appended to relative group ids.
    pub fn hostid(&self) -> &str {
        &self.0.hostid
    }

    fn recv_into(
        &self,
        link: &Link,
        answers: &mut Answers,
        seq: u32,
        resp_type: Option<&str>,
        timeout: Duration,
        mut expect: Option<&mut HashSet<String>>,
    ) -> Result<()> {
        debug!(
            "awaiting replies for seq {} for {:?}, expecting {:?}",
            seq, timeout, expect
        );

        let start = Instant::now();
        loop {
            if expect.as_ref().map_or(false, |expect| expect.is_empty()) {
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }

            link.poll(timeout - elapsed)?;
            while let Some(msg) = link.recv_one(&self.0.ident, seq, resp_type)? {
                if let Some(expect) = expect.as_mut() {
                    expect.remove(&msg.from);
                }
                answers.insert(msg.from.clone(), msg);
            }
        }
        Ok(())
    }

    /// Drains replies for `seq` into `answers` without sending anything.
    ///
    /// Responders are removed from `expect`; the drain finishes early once
    /// it empties.
    pub fn recv_until(
        &self,
        answers: &mut Answers,
        seq: u32,
        resp_type: Option<&str>,
        timeout: Duration,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<()> {
        let link = self.0.link();
        self.recv_into(&link, answers, seq, resp_type, timeout, expect)
    }

    /// One reliable request to a single target or group id.
    ///
    /// Per receive window the request is (re)sent once and matching replies
    /// are collected, finishing early once everyone in `expect` answered.
    /// A zero `seq` allocates a fresh random sequence.
    pub fn call(
        &self,
        to: &str,
        seq: u32,
        msg_type: &str,
        data: Option<Value>,
        resp_type: Option<&str>,
        mut expect: Option<&mut HashSet<String>>,
    ) -> Result<Answers> {
        let seq = if seq == 0 { genseq() } else { seq };
        let msg = Message::new(&self.0.ident, to, msg_type, seq, data);

        let mut answers = Answers::new();
        let link = self.0.link();
        for window in &self.0.resend {
            link.send(&msg)?;
            self.recv_into(
                &link,
                &mut answers,
                seq,
                resp_type,
                *window,
                expect.as_deref_mut(),
            )?;
            if expect.as_ref().map_or(false, |expect| expect.is_empty()) {
                break;
            }
        }
        Ok(answers)
    }

    /// Like [`Host::call`], but addresses every node individually; each
    /// window re-sends only to the nodes still missing.
    pub fn call_multi(
        &self,
        nodes: &[String],
        seq: u32,
        msg_type: &str,
        data: Option<Value>,
        resp_type: Option<&str>,
    ) -> Result<Answers> {
        let seq = if seq == 0 { genseq() } else { seq };
        let mut expect: HashSet<String> = nodes.iter().cloned().collect();

        let mut answers = Answers::new();
        let link = self.0.link();
        for window in &self.0.resend {
            for node in &expect {
                link.send(&Message::new(&self.0.ident, node, msg_type, seq, data.clone()))?;
            }
            self.recv_into(
                &link,
                &mut answers,
                seq,
                resp_type,
                *window,
                Some(&mut expect),
            )?;
            if expect.is_empty() {
                break;
            }
        }
        Ok(answers)
    }

    /// Discovers drones addressed by `group`, optionally filtered by board.
    ///
    /// `need == 0` sends a single fire-and-forget ping; `need > 0` finishes
    /// as soon as that many replies accumulated; otherwise the whole
    /// retransmission budget is spent. A given `seq` (zero included) is used
    /// verbatim so keep-alive pings go out with sequence 0.
    pub fn whois(
        &self,
        group: &str,
        need: Option<usize>,
        seq: Option<u32>,
        board: Option<&str>,
    ) -> Result<Answers> {
        let seq = seq.unwrap_or_else(genseq);
        let mut data = Map::new();
        if let Some(board) = board {
            data.insert("board".to_owned(), Value::from(board));
        }
        let msg = Message::new(&self.0.ident, group, TYPE_WHOIS, seq, Some(Value::Object(data)));

        let mut answers = Answers::new();
        let link = self.0.link();
        for window in &self.0.resend {
            link.send(&msg)?;
            if need == Some(0) {
                break;
            }
            self.recv_into(&link, &mut answers, seq, Some(TYPE_STATUS), *window, None)?;
            if need.map_or(false, |need| answers.len() >= need) {
                break;
            }
        }
        Ok(answers)
    }

    /// Asks `whom` to reset; `how = "system"` requests a full reboot.
    pub fn reset(
        &self,
        whom: &str,
        how: Option<&str>,
        expect: Option<&mut HashSet<String>>,
    ) -> Result<Answers> {
        let data = how.map(|how| json!({ "how": how }));
        self.call(whom, 0, TYPE_RESET, data, Some(TYPE_STATUS), expect)
    }

    /// Creates a group.
    ///
    /// Relative ids get the host token appended; absolute ids are used as
    /// given. Ids longer than [`GROUP_ID_MAX`] characters are rejected.
    pub fn group(&self, prefix: &str, absolute: bool) -> Result<Group> {
        let id = if absolute {
            prefix.to_owned()
        } else {
            format!("{}{}", prefix, self.0.hostid)
        };
        if id.len() > GROUP_ID_MAX {
            return Err(Error::Protocol(format!(
                "group id {:?} exceeds {} characters",
                id, GROUP_ID_MAX
            )));
        }

        let group = Group::new(id, Arc::downgrade(&self.0), self.0.idle_interval)?;
        self.0
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(group.clone());
        Ok(group)
    }

    /// Resets and forgets every group created by this host.
    ///
    /// All groups are torn down even if some fail; the first failure is
    /// reported.
    pub fn disband(&self, how: Option<&str>) -> Result<()> {
        let groups: Vec<Group> = self
            .0
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut first_err = None;
        for group in groups {
            if let Err(err) = group.reset(how) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
