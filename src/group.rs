//! Drone groups: durable cohorts of drones under one group id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::host::{genseq, Answers, Host, Shared};
use crate::msg::{Message, GROUP_ALL_DEFAULT, TYPE_ASSIGN, TYPE_RESET, TYPE_STATUS, TYPE_UNSUPPORTED};

/// Wall-clock bound of [`Group::request`] and [`Group::call`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Receive bound of one passive round inside a request.
const PASSIVE_ROUND_MAX: Duration = Duration::from_secs(10);

/// Per-member outcome of a request.
///
/// `None` while a drone has been silent or has only sent `accept` so far.
pub type Replies = HashMap<String, Option<Message>>;

#[derive(Debug)]
struct State {
    seq: u32,
    members: HashSet<String>,
}

/// A named cohort of drones owned by one host.
///
/// Cloning yields another handle to the same group.
#[derive(Clone)]
pub struct Group {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    host: Weak<Shared>,
    state: Arc<Mutex<State>>,
    keepalive: KeepAlive,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // the timer must be gone before the group state is released
        self.keepalive.stop();
        debug!("group {} released", self.id);
    }
}

impl Group {
    pub(crate) fn new(id: String, host: Weak<Shared>, idle_interval: Duration) -> Result<Group> {
        let state = Arc::new(Mutex::new(State {
            seq: genseq(),
            members: HashSet::new(),
        }));
        let keepalive = KeepAlive::spawn(
            id.clone(),
            Weak::clone(&host),
            Arc::clone(&state),
            idle_interval,
        )?;
        debug!("group {} created", id);

        Ok(Group {
            inner: Arc::new(Inner {
                id,
                host,
                state,
                keepalive,
            }),
        })
    }

    /// The group id drones are addressed by.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// A snapshot of the current member set.
    pub fn members(&self) -> HashSet<String> {
        self.state().members.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host(&self) -> Result<Host> {
        self.inner.host.upgrade().map(Host).ok_or(Error::HostGone)
    }

    /// Recruits up to `max_nodes` idle drones into the group.
    ///
    /// When fewer than `min_nodes` could be engaged after one retry, the
    /// drones engaged by this call are reset and dropped again and the call
    /// fails with `NotFound`. `min_nodes` defaults to `max_nodes`, or 1 when
    /// that is 0.
    pub fn assign(
        &self,
        max_nodes: usize,
        min_nodes: Option<usize>,
        board: Option<&str>,
    ) -> Result<Vec<String>> {
        let min_nodes = min_nodes.unwrap_or(if max_nodes > 0 { max_nodes } else { 1 });
        let host = self.host()?;

        let available: Vec<String> = host
            .whois(GROUP_ALL_DEFAULT, Some(max_nodes), None, board)?
            .into_iter()
            .map(|(from, _)| from)
            .take(max_nodes)
            .collect();
        let mut new_members = self.engage(&available)?;

        if new_members.len() < min_nodes {
            let shortfall = max_nodes - new_members.len();
            let available: Vec<String> = host
                .whois(GROUP_ALL_DEFAULT, Some(shortfall), None, board)?
                .into_iter()
                .map(|(from, _)| from)
                .filter(|from| !new_members.contains(from))
                .take(shortfall)
                .collect();
            new_members.extend(self.engage(&available)?);
        }

        if new_members.len() < min_nodes {
            if !new_members.is_empty() {
                // roll back: release the drones this call engaged
                host.call_multi(&new_members, 0, TYPE_RESET, None, Some(TYPE_STATUS))?;
                let mut state = self.state();
                for drone in &new_members {
                    state.members.remove(drone);
                }
            }
            return Err(Error::NotFound(
                "you must construct additional drones".to_owned(),
            ));
        }

        Ok(new_members)
    }

    /// Invites `nodes` into the group; returns those that acknowledged.
    pub fn engage(&self, nodes: &[String]) -> Result<Vec<String>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let host = self.host()?;
        let seq = self.state().seq;
        let data = json!({ "group": self.inner.id, "seq": seq });

        let answers = host.call_multi(nodes, seq, TYPE_ASSIGN, Some(data), Some(TYPE_STATUS))?;
        let joined: Vec<String> = answers
            .into_iter()
            .filter(|(_, answer)| answer.status_code() == Some(0))
            .map(|(drone, _)| drone)
            .collect();

        self.state().members.extend(joined.iter().cloned());
        Ok(joined)
    }

    /// Disbands the membership by resetting every member.
    ///
    /// Members that do not acknowledge stay in the member set and are
    /// reported as unreachable. Resetting an empty group is a no-op.
    pub fn reset(&self, how: Option<&str>) -> Result<()> {
        let members = self.members();
        if members.is_empty() {
            return Ok(());
        }

        let host = self.host()?;
        let mut expect = members;
        host.reset(&self.inner.id, how, Some(&mut expect))?;

        let residual: Vec<String> = expect.iter().cloned().collect();
        self.state().members = expect;
        if !residual.is_empty() {
            return Err(Error::Unreachable(residual));
        }
        Ok(())
    }

    /// Issues one reliable group request with the default timeout.
    pub fn request(&self, msg_type: &str, data: Option<Value>) -> Result<Replies> {
        self.request_timeout(msg_type, data, DEFAULT_CALL_TIMEOUT)
    }

    /// Issues one reliable group request.
    ///
    /// Send-and-wait rounds over the whole retransmission budget alternate
    /// with passive receive rounds, so a drone that answered `accept` gets
    /// time to finish without being asked again. A member's entry stays
    /// `None` until a terminal reply arrives; `accept` replies do not extend
    /// the timeout.
    pub fn request_timeout(
        &self,
        msg_type: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Replies> {
        let host = self.host()?;
        let (seq, mut pending) = {
            let mut state = self.state();
            if state.members.is_empty() {
                return Err(Error::NotFound("drone group is empty".to_owned()));
            }
            let seq = if msg_type.starts_with('!') {
                genseq()
            } else {
                state.seq += 1;
                state.seq
            };
            (seq, state.members.clone())
        };

        let mut answers = Replies::new();
        let mut round = 0u32;
        let start = Instant::now();
        self.inner.keepalive.rearm();

        while !pending.is_empty() && start.elapsed() < timeout {
            let mut expect = pending.clone();
            round += 1;

            let fresh = if round % 2 == 1 {
                host.call(
                    &self.inner.id,
                    seq,
                    msg_type,
                    data.clone(),
                    None,
                    Some(&mut expect),
                )?
            } else {
                let remaining = timeout.checked_sub(start.elapsed()).unwrap_or_default();
                let mut fresh = Answers::new();
                host.recv_until(
                    &mut fresh,
                    seq,
                    None,
                    PASSIVE_ROUND_MAX.min(remaining),
                    Some(&mut expect),
                )?;
                fresh
            };
            for (drone, msg) in fresh {
                answers.insert(drone, Some(msg));
            }

            for drone in &expect {
                // no reply this round
                answers.insert(drone.clone(), None);
            }
            let mut done = Vec::new();
            for (drone, answer) in answers.iter_mut() {
                match answer {
                    Some(msg) if msg.is_accept() => *answer = None, // in progress
                    Some(_) => {
                        if pending.contains(drone) {
                            done.push(drone.clone());
                        }
                    }
                    None => (),
                }
            }
            for drone in done {
                pending.remove(&drone);
            }

            self.inner.keepalive.rearm();
        }
        Ok(answers)
    }

    /// Like [`Group::request`], but strict: partial failures become errors.
    pub fn call(&self, msg_type: &str, data: Option<Value>) -> Result<Answers> {
        self.call_timeout(msg_type, data, DEFAULT_CALL_TIMEOUT)
    }

    /// Like [`Group::request_timeout`], but strict.
    ///
    /// A member without a terminal reply is unreachable, a responder from
    /// outside the member set is a conflict, and any non-zero or unreadable
    /// status is a runtime failure.
    pub fn call_timeout(
        &self,
        msg_type: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Answers> {
        let replies = self.request_timeout(msg_type, data, timeout)?;
        let members = self.members();

        let mut answers = Answers::new();
        for (drone, reply) in replies {
            let msg = match reply {
                Some(msg) => msg,
                None => return Err(Error::Unreachable(vec![drone])),
            };
            if !members.contains(&drone) {
                return Err(Error::Conflict(vec![drone]));
            }
            if msg.msg_type == TYPE_UNSUPPORTED {
                return Err(Error::Runtime {
                    code: i64::from(libc::EOPNOTSUPP),
                    errstr: Some("unknown command".to_owned()),
                    drone,
                });
            }
            if msg.is_status() {
                match msg.status_code() {
                    Some(code) if code > 0 => {
                        return Err(Error::Runtime {
                            code,
                            errstr: msg.errstr().map(str::to_owned),
                            drone,
                        });
                    }
                    Some(_) => (),
                    None => {
                        return Err(Error::Runtime {
                            code: i64::from(libc::EPROTO),
                            errstr: Some("invalid status reply".to_owned()),
                            drone,
                        });
                    }
                }
            }
            answers.insert(drone, msg);
        }
        Ok(answers)
    }
}

struct TimerState {
    epoch: u64,
    shutdown: bool,
}

/// Self-rescheduling keep-alive timer of one group.
struct KeepAlive {
    timer: Arc<(Mutex<TimerState>, Condvar)>,
    worker: Option<thread::JoinHandle<()>>,
}

impl KeepAlive {
    fn spawn(
        id: String,
        host: Weak<Shared>,
        state: Arc<Mutex<State>>,
        interval: Duration,
    ) -> std::io::Result<KeepAlive> {
        let timer = Arc::new((
            Mutex::new(TimerState {
                epoch: 0,
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let worker = {
            let timer = Arc::clone(&timer);
            thread::Builder::new()
                .name(format!("keepalive-{}", id))
                .spawn(move || keepalive_loop(id, host, state, timer, interval))?
        };

        Ok(KeepAlive {
            timer,
            worker: Some(worker),
        })
    }

    /// Pushes the next firing a full interval out.
    fn rearm(&self) {
        let (lock, cvar) = &*self.timer;
        let mut timer = lock.lock().unwrap_or_else(PoisonError::into_inner);
        timer.epoch += 1;
        cvar.notify_all();
    }

    fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.timer;
            let mut timer = lock.lock().unwrap_or_else(PoisonError::into_inner);
            timer.shutdown = true;
            cvar.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            // the worker itself can drop the last group reference mid-ping;
            // it must not join its own thread
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn keepalive_loop(
    id: String,
    host: Weak<Shared>,
    state: Arc<Mutex<State>>,
    timer: Arc<(Mutex<TimerState>, Condvar)>,
    interval: Duration,
) {
    let (lock, cvar) = &*timer;
    let mut timer = lock.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if timer.shutdown {
            return;
        }
        let epoch = timer.epoch;

        let (guard, wait) = cvar
            .wait_timeout(timer, interval)
            .unwrap_or_else(PoisonError::into_inner);
        timer = guard;

        if timer.shutdown {
            return;
        }
        if timer.epoch != epoch || !wait.timed_out() {
            // rearmed or woken spuriously, start a fresh interval
            continue;
        }
        drop(timer);

        let shared = match host.upgrade() {
            Some(shared) => shared,
            None => return, // host released, nothing left to ping
        };
        let armed = !state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .is_empty();
        if armed {
            debug!("group {} keep-alive timer fired", id);
            if let Err(err) = Host(shared).whois(&id, Some(0), Some(0), None) {
                warn!("group {} keep-alive ping failed: {}", id, err);
            }
        }

        timer = lock.lock().unwrap_or_else(PoisonError::into_inner);
    }
}
