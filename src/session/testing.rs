//! Scripted simulation service for tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::RetryPolicy;
use crate::env::ImageShape;
use crate::network::Endpoint;
use crate::protocol::command::{self, Command, InitReply, PeekReply, StepReply};
use crate::protocol::{receive, send};

/// Retry policy with millisecond delays
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        find_interval: Duration::from_millis(5),
    }
}

/// Shape of the observations the fake simulation returns
pub fn test_shape() -> ImageShape {
    ImageShape::new(2, 2, 3)
}

/// How the fake simulation behaves
#[derive(Debug, Clone)]
pub struct SimScript {
    /// Refuse this many mission starts (counted across connections)
    pub refuse_starts: u64,
    /// Empty peeks per episode before the observation appears
    pub peeks_before_begin: u64,
    /// Steps until an episode reports done
    pub steps_per_episode: u64,
    /// Zero replies to Find before the port is reported
    pub finds_before_port: u64,
    pub integrated_port: u16,
    pub reward: f64,
    /// Drop the connection instead of answering this step (1-based, per connection)
    pub hang_up_on_step: Option<u64>,
    /// Never answer this step, keeping the connection open (1-based, per connection)
    pub stall_on_step: Option<u64>,
    /// Turn key handed out with every accepted mission start
    pub turn_key: String,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            refuse_starts: 0,
            peeks_before_begin: 0,
            steps_per_episode: 3,
            finds_before_port: 0,
            integrated_port: 31000,
            reward: 1.5,
            hang_up_on_step: None,
            stall_on_step: None,
            turn_key: String::new(),
        }
    }
}

/// Counters shared with the test
#[derive(Debug, Default)]
pub struct SimStats {
    connections: AtomicU64,
    start_requests: AtomicU64,
    peeks: AtomicU64,
    steps: AtomicU64,
    quits: AtomicU64,
    finds: AtomicU64,
    closes: AtomicU64,
    exits: AtomicU64,
    tokens: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
}

impl SimStats {
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
    pub fn start_requests(&self) -> u64 {
        self.start_requests.load(Ordering::SeqCst)
    }
    pub fn peeks(&self) -> u64 {
        self.peeks.load(Ordering::SeqCst)
    }
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }
    pub fn quits(&self) -> u64 {
        self.quits.load(Ordering::SeqCst)
    }
    pub fn finds(&self) -> u64 {
        self.finds.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
    pub fn exits(&self) -> u64 {
        self.exits.load(Ordering::SeqCst)
    }
    /// Mission-init tokens in arrival order
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
    /// Step commands in arrival order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// A simulation command service on a loopback port
pub struct FakeSimulation {
    addr: SocketAddr,
    stats: Arc<SimStats>,
    task: JoinHandle<()>,
}

impl FakeSimulation {
    pub async fn spawn(script: SimScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, script)
    }

    pub fn serve(listener: TcpListener, script: SimScript) -> Self {
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(SimStats::default());
        let task_stats = stats.clone();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                task_stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(stream, script.clone(), task_stats.clone()));
            }
        });

        Self { addr, stats, task }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }
}

impl Drop for FakeSimulation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind `n` listeners on consecutive loopback ports
pub async fn bind_consecutive(n: u16) -> Vec<TcpListener> {
    for _ in 0..100 {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = first.local_addr().unwrap().port();
        if base.checked_add(n).is_none() {
            continue;
        }

        let mut listeners = vec![first];
        for offset in 1..n {
            match TcpListener::bind(("127.0.0.1", base + offset)).await {
                Ok(listener) => listeners.push(listener),
                Err(_) => break,
            }
        }
        if listeners.len() == n as usize {
            return listeners;
        }
    }
    panic!("could not bind {} consecutive ports", n);
}

async fn serve_connection(mut stream: TcpStream, script: SimScript, stats: Arc<SimStats>) {
    let observation = vec![7u8; test_shape().len()];
    let mut started = false;
    let mut episode_done = true;
    let mut episode_peeks = 0u64;
    let mut episode_steps = 0u64;
    let mut connection_steps = 0u64;

    while let Ok(Some(msg)) = receive(&mut stream).await {
        let replies: Vec<Vec<u8>> = match Command::parse(&msg) {
            Some(Command::Hello) => continue,
            Some(Command::Peek) => {
                stats.peeks.fetch_add(1, Ordering::SeqCst);
                episode_peeks += 1;
                let begun = started && episode_peeks > script.peeks_before_begin;
                PeekReply {
                    done: started && episode_done,
                    observation: if begun { observation.clone() } else { Vec::new() },
                }
                .encode()
                .into()
            }
            Some(Command::Step { options, command }) => {
                stats.steps.fetch_add(1, Ordering::SeqCst);
                stats.commands.lock().unwrap().push(command.clone());
                connection_steps += 1;
                if script.hang_up_on_step == Some(connection_steps) {
                    return;
                }
                if script.stall_on_step == Some(connection_steps) {
                    std::future::pending::<()>().await;
                }
                episode_steps += 1;
                episode_done = episode_steps >= script.steps_per_episode;
                vec![StepReply {
                    reward: script.reward,
                    done: episode_done,
                    sent: true,
                    observation: observation.clone(),
                    info: (options == command::StepOptions::WithInfo)
                        .then(|| format!("{{\"step\":{}}}", episode_steps)),
                }
                .encode()]
            }
            Some(Command::Quit) => {
                stats.quits.fetch_add(1, Ordering::SeqCst);
                episode_done = true;
                vec![command::encode_code(1)]
            }
            Some(Command::Find(_)) => {
                let n = stats.finds.fetch_add(1, Ordering::SeqCst) + 1;
                let port = if n > script.finds_before_port {
                    script.integrated_port as u32
                } else {
                    0
                };
                vec![command::encode_code(port)]
            }
            Some(Command::Close(_)) => {
                stats.closes.fetch_add(1, Ordering::SeqCst);
                vec![command::encode_code(1)]
            }
            Some(Command::Exit(_)) => {
                stats.exits.fetch_add(1, Ordering::SeqCst);
                vec![command::encode_code(1)]
            }
            Some(Command::Init(_)) => vec![command::encode_code(1)],
            Some(Command::Status) => vec![b"ok".to_vec()],
            None => {
                // Mission payload; the token follows
                let Ok(Some(token)) = receive(&mut stream).await else {
                    return;
                };
                stats
                    .tokens
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&token).into_owned());
                let n = stats.start_requests.fetch_add(1, Ordering::SeqCst) + 1;
                let reply = if n <= script.refuse_starts {
                    InitReply {
                        started: false,
                        turn_key: String::new(),
                    }
                } else {
                    started = true;
                    episode_done = false;
                    episode_peeks = 0;
                    episode_steps = 0;
                    InitReply {
                        started: true,
                        turn_key: script.turn_key.clone(),
                    }
                };
                reply.encode().into()
            }
        };

        for reply in replies {
            if send(&mut stream, &reply).await.is_err() {
                return;
            }
        }
    }
}
