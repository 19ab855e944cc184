//! Shared harness for socket-level tests: a loopback relay standing in for
//! the multicast medium, plus scripted fake drones.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::host::{Builder, Host};
use crate::msg::{Message, GROUP_ALL_DEFAULT, TYPE_ACCEPT, TYPE_ASSIGN, TYPE_RESET, TYPE_STATUS, TYPE_UNSUPPORTED, TYPE_WHOIS};

const POLL_TICK: Duration = Duration::from_millis(10);

/// Fans every host datagram out to all registered drones and forwards drone
/// traffic back to the host, emulating the multicast medium over loopback.
pub struct Relay {
    addr: SocketAddr,
    drones: Arc<Mutex<Vec<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Relay {
    pub fn spawn() -> Relay {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(POLL_TICK)).unwrap();
        let addr = sock.local_addr().unwrap();
        let drones: Arc<Mutex<Vec<SocketAddr>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let drones = Arc::clone(&drones);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut host: Option<SocketAddr> = None;
                let mut buf = [0u8; 64 * 1024];
                while !stop.load(Ordering::Relaxed) {
                    let (len, src) = match sock.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(_) => continue, // timeout, check the stop flag
                    };
                    let targets = drones.lock().unwrap();
                    if targets.contains(&src) {
                        if let Some(host) = host {
                            let _ = sock.send_to(&buf[..len], host);
                        }
                    } else {
                        host = Some(src);
                        for drone in targets.iter() {
                            let _ = sock.send_to(&buf[..len], *drone);
                        }
                    }
                }
            })
        };

        Relay {
            addr,
            drones,
            stop,
            worker: Some(worker),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn register(&self, drone: SocketAddr) {
        self.drones.lock().unwrap().push(drone);
    }

    /// A builder wired to this relay, with millisecond-scale windows.
    pub fn builder(&self) -> Builder {
        Builder::default().dest(self.addr).resend_strategy(vec![
            Duration::from_millis(60),
            Duration::from_millis(120),
            Duration::from_millis(120),
        ])
    }

    pub fn host(&self) -> Host {
        self.builder().open("lo").unwrap()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// How a drone answers user commands. Control verbs are always handled.
#[derive(Clone, Copy)]
pub enum Answer {
    /// Reply `status {code}` right away.
    Status(i64),
    /// Reply `accept`, then `status 0` after the delay.
    AcceptThen(Duration),
    /// Reply `status` without a code.
    BadStatus,
    /// Reply `unsupported`.
    Unsupported,
    /// Never reply.
    Silent,
}

pub struct DroneCfg {
    ident: String,
    board: String,
    group: String,
    answer: Answer,
    accept_assign: bool,
    ignore_reset: bool,
}

impl DroneCfg {
    pub fn new(ident: &str) -> DroneCfg {
        DroneCfg {
            ident: ident.to_owned(),
            board: "generic".to_owned(),
            group: GROUP_ALL_DEFAULT.to_owned(),
            answer: Answer::Status(0),
            accept_assign: true,
            ignore_reset: false,
        }
    }

    pub fn board(mut self, board: &str) -> Self {
        self.board = board.to_owned();
        self
    }

    /// Starts out already claiming membership of `group`.
    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_owned();
        self
    }

    pub fn answer(mut self, answer: Answer) -> Self {
        self.answer = answer;
        self
    }

    pub fn refuse_assign(mut self) -> Self {
        self.accept_assign = false;
        self
    }

    pub fn ignore_reset(mut self) -> Self {
        self.ignore_reset = true;
        self
    }
}

/// A scripted drone endpoint behind the relay.
pub struct FakeDrone {
    log: Arc<Mutex<Vec<Message>>>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FakeDrone {
    pub fn spawn(relay: &Relay, cfg: DroneCfg) -> FakeDrone {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(POLL_TICK)).unwrap();
        relay.register(sock.local_addr().unwrap());
        let uplink = relay.addr();

        let log: Arc<Mutex<Vec<Message>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let log = Arc::clone(&log);
            let stop = Arc::clone(&stop);
            thread::spawn(move || drone_loop(&sock, uplink, cfg, &log, &stop))
        };

        FakeDrone {
            log,
            stop,
            worker: Some(worker),
        }
    }

    /// Everything the drone saw addressed to it.
    pub fn seen(&self) -> Vec<Message> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for FakeDrone {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drone_loop(
    sock: &UdpSocket,
    uplink: SocketAddr,
    cfg: DroneCfg,
    log: &Mutex<Vec<Message>>,
    stop: &AtomicBool,
) {
    let mut group = cfg.group.clone();
    let mut handled: HashMap<u32, Message> = HashMap::new();
    let mut buf = [0u8; 64 * 1024];

    let send = |msg: Message| {
        let _ = sock.send_to(&msg.encode().unwrap(), uplink);
    };
    let status = |to: &str, seq: u32, data: Value| {
        Message::new(&cfg.ident, to, TYPE_STATUS, seq, Some(data))
    };

    while !stop.load(Ordering::Relaxed) {
        let len = match sock.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(_) => continue,
        };
        let msg = match Message::decode(&buf[..len]) {
            Some(msg) => msg,
            None => continue,
        };
        if msg.to != cfg.ident && msg.to != group {
            continue;
        }
        log.lock().unwrap().push(msg.clone());

        match msg.msg_type.as_str() {
            TYPE_WHOIS => {
                let wanted = msg
                    .data
                    .as_ref()
                    .and_then(|data| data.get("board"))
                    .and_then(Value::as_str);
                if wanted.map_or(true, |board| board == cfg.board) {
                    send(status(&msg.from, msg.seq, json!({ "code": 0, "board": cfg.board })));
                }
            }
            TYPE_ASSIGN => {
                if !cfg.accept_assign {
                    send(status(&msg.from, msg.seq, json!({ "code": 16, "errstr": "busy" })));
                } else if let Some(assigned) = msg
                    .data
                    .as_ref()
                    .and_then(|data| data.get("group"))
                    .and_then(Value::as_str)
                {
                    group = assigned.to_owned();
                    send(status(&msg.from, msg.seq, json!({ "code": 0 })));
                }
            }
            TYPE_RESET => {
                if !cfg.ignore_reset {
                    group = GROUP_ALL_DEFAULT.to_owned();
                    handled.clear();
                    send(status(&msg.from, msg.seq, json!({ "code": 0 })));
                }
            }
            _ => {
                // duplicate command: repeat the terminal reply
                if let Some(previous) = handled.get(&msg.seq) {
                    send(previous.clone());
                    continue;
                }
                let terminal = match cfg.answer {
                    Answer::Status(0) => Some(status(&msg.from, msg.seq, json!({ "code": 0 }))),
                    Answer::Status(code) => Some(status(
                        &msg.from,
                        msg.seq,
                        json!({ "code": code, "errstr": "injected failure" }),
                    )),
                    Answer::AcceptThen(delay) => {
                        send(Message::new(&cfg.ident, &msg.from, TYPE_ACCEPT, msg.seq, None));
                        thread::sleep(delay);
                        Some(status(&msg.from, msg.seq, json!({ "code": 0 })))
                    }
                    Answer::BadStatus => Some(status(&msg.from, msg.seq, json!({ "note": "oops" }))),
                    Answer::Unsupported => Some(Message::new(
                        &cfg.ident,
                        &msg.from,
                        TYPE_UNSUPPORTED,
                        msg.seq,
                        None,
                    )),
                    Answer::Silent => None,
                };
                if let Some(reply) = terminal {
                    send(reply.clone());
                    handled.insert(msg.seq, reply);
                }
            }
        }
    }
}
