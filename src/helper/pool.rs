//! A single named [`HelperPool`] (spec.md §3 "Helper pool", §4.2).

use std::{
    collections::{HashMap, VecDeque},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::{oneshot, Mutex as AsyncMutex},
};
use tracing::{debug, error, warn};

/// Overload response once `queue_size` is exceeded for more than 180 s
/// (spec.md §4.2 "Overload").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadPolicy {
    /// Terminate the owning process.
    Die,
    /// Silently drop further submissions, returning an error to callers.
    Err,
}

const OVERLOAD_GRACE: Duration = Duration::from_secs(180);
const CRASH_WINDOW: Duration = Duration::from_secs(30);
const MAX_RETRIES: u8 = 2;

#[derive(Debug, Clone)]
pub struct HelperPoolConfig {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    pub min: usize,
    pub max: usize,
    pub startup: usize,
    pub queue_size: usize,
    pub overload_policy: OverloadPolicy,
    /// Requests a single child may carry in flight at once. `1` still uses
    /// id-prefixed lines (spec.md §4.2 "Wire format": "For concurrency ≥ 1").
    pub concurrency: usize,
    pub request_timeout: Option<Duration>,
    pub retry_timed_out: bool,
    pub precanned_timeout_reply: Option<String>,
    /// End-of-message delimiter; `\n` per spec.md §GLOSSARY "eom".
    pub eom: u8,
}

impl Default for HelperPoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            executable: String::new(),
            args: Vec::new(),
            min: 1,
            max: 4,
            startup: 1,
            queue_size: 64,
            overload_policy: OverloadPolicy::Err,
            concurrency: 1,
            request_timeout: Some(Duration::from_secs(30)),
            retry_timed_out: false,
            precanned_timeout_reply: None,
            eom: b'\n',
        }
    }
}

/// Classification of a reply's first token (spec.md §3 "Helper request
/// record", §6 "Helper wire").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperReplyKind {
    Okay,
    ErrorAck,
    Broken,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct HelperReply {
    pub kind: HelperReplyKind,
    /// `true` for [`HelperReplyKind::Okay`]; kept as a plain field so callers
    /// can write `reply.ok` instead of matching the enum at every call site.
    pub ok: bool,
    pub kv: HashMap<String, String>,
    pub raw: String,
}

impl HelperReply {
    fn parse(line: &str) -> Self {
        let mut parts = line.splitn(2, char::is_whitespace);
        let token = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();
        let kind = match token {
            "OK" => HelperReplyKind::Okay,
            "ERR" => HelperReplyKind::ErrorAck,
            "BH" => HelperReplyKind::Broken,
            _ => HelperReplyKind::Unknown,
        };
        let mut kv = HashMap::new();
        for field in rest.split_whitespace() {
            if let Some((k, v)) = field.split_once('=') {
                kv.insert(k.to_owned(), v.trim_matches('"').to_owned());
            }
        }
        Self {
            ok: kind == HelperReplyKind::Okay,
            kind,
            kv,
            raw: line.to_owned(),
        }
    }

    fn broken() -> Self {
        Self {
            kind: HelperReplyKind::Broken,
            ok: false,
            kv: HashMap::new(),
            raw: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue full and overload policy is `err` (spec.md §4.2 "Overload").
    Overloaded,
    /// All children reported broken, or the pool has no running children.
    Broken,
    TimedOut,
}

struct PendingRequest {
    reply_tx: oneshot::Sender<HelperReply>,
}

struct ChildHandle {
    index: usize,
    stdin: AsyncMutex<ChildStdin>,
    pending: Arc<AsyncMutex<HashMap<u64, PendingRequest>>>,
    next_id: AtomicU64,
    concurrency: usize,
    shutting_down: AtomicBool,
    /// Kept alive so the process is reaped on pool drop; the reader task
    /// holds stdout independently.
    _child: Child,
}

impl ChildHandle {
    async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

struct QueuedRequest {
    input: String,
    retries: u8,
    reply_tx: oneshot::Sender<HelperReply>,
}

struct PoolState {
    children: Vec<Arc<ChildHandle>>,
    queue: VecDeque<QueuedRequest>,
    overloaded_since: Option<Instant>,
}

/// A named pool of external helper subprocesses (spec.md §3 "Helper pool").
pub struct HelperPool {
    cfg: HelperPoolConfig,
    state: Arc<AsyncMutex<PoolState>>,
    requests: AtomicU64,
    replies: AtomicU64,
}

impl HelperPool {
    pub fn new(cfg: HelperPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Arc::new(AsyncMutex::new(PoolState {
                children: Vec::new(),
                queue: VecDeque::new(),
                overloaded_since: None,
            })),
            requests: AtomicU64::new(0),
            replies: AtomicU64::new(0),
        })
    }

    /// Opens children up to `startup` and tops up to `min` (spec.md §4.2
    /// "Startup").
    pub async fn start(self: &Arc<Self>) -> Result<(), std::io::Error> {
        let target = self.cfg.startup.max(self.cfg.min).min(self.cfg.max.max(1));
        for _ in 0..target {
            self.spawn_child().await?;
        }
        Ok(())
    }

    async fn spawn_child(self: &Arc<Self>) -> Result<(), std::io::Error> {
        let mut state = self.state.lock().await;
        if state.children.len() >= self.cfg.max {
            return Ok(());
        }
        let index = state.children.len();
        let mut child = tokio::process::Command::new(&self.cfg.executable)
            .args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let pending: Arc<AsyncMutex<HashMap<u64, PendingRequest>>> = Arc::new(AsyncMutex::new(HashMap::new()));
        let handle = Arc::new(ChildHandle {
            index,
            stdin: AsyncMutex::new(stdin),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            concurrency: self.cfg.concurrency.max(1),
            shutting_down: AtomicBool::new(false),
            _child: child,
        });

        let reader_pool = self.clone();
        let reader_pending = pending;
        let eom = self.cfg.eom;
        let concurrency = self.cfg.concurrency.max(1);
        let name = self.cfg.name.clone();
        let started_at = Instant::now();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            let mut replied = false;
            loop {
                buf.clear();
                match reader.read_until(eom, &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        replied = true;
                        while buf.last() == Some(&eom) || buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        let Ok(line) = std::str::from_utf8(&buf) else {
                            warn!(pool = %name, "helper reply was not valid utf-8, dropping");
                            continue;
                        };
                        let (id, body) = if concurrency >= 1 {
                            match line.split_once(' ') {
                                Some((id_str, rest)) => match id_str.parse::<u64>() {
                                    Ok(id) => (Some(id), rest),
                                    Err(_) => (None, line),
                                },
                                None => (None, line),
                            }
                        } else {
                            (None, line)
                        };
                        let reply = HelperReply::parse(body);
                        let mut pending = reader_pending.lock().await;
                        match id {
                            Some(id) => {
                                if let Some(req) = pending.remove(&id) {
                                    let _ = req.reply_tx.send(reply);
                                } else {
                                    error!(pool = %name, id, "reply id did not match any pending request");
                                }
                            }
                            None => {
                                // Stateful / unnumbered: resolve the oldest pending request.
                                if let Some((&key, _)) = pending.iter().next() {
                                    if let Some(req) = pending.remove(&key) {
                                        let _ = req.reply_tx.send(reply);
                                    }
                                }
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            if !replied && started_at.elapsed() < CRASH_WINDOW {
                error!(pool = %name, "helper exited within 30s of start with no replies: crashing too rapidly");
            }
            reader_pool.retire_child(index).await;
        });

        state.children.push(handle);
        drop(state);
        self.drain_queue().await;
        Ok(())
    }

    async fn retire_child(&self, index: usize) {
        let mut state = self.state.lock().await;
        state.children.retain(|c| c.index != index);
    }

    /// `submit(input, callback)` restated as an async call returning the
    /// reply (spec.md §4.2 "Dispatch").
    pub async fn submit(self: &Arc<Self>, input: String) -> Result<HelperReply, SubmitError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.submit_inner(input, 0).await
    }

    async fn submit_inner(self: &Arc<Self>, input: String, retries: u8) -> Result<HelperReply, SubmitError> {
        if let Some(rx) = self.try_dispatch(&input).await? {
            return self.await_reply(rx, input, retries).await;
        }

        let mut state = self.state.lock().await;
        if state.queue.len() >= self.cfg.queue_size {
            let since = *state.overloaded_since.get_or_insert(Instant::now());
            if since.elapsed() > OVERLOAD_GRACE {
                return match self.cfg.overload_policy {
                    OverloadPolicy::Die => {
                        error!(pool = %self.cfg.name, "helper pool overloaded for >180s, policy=die");
                        std::process::exit(1);
                    }
                    OverloadPolicy::Err => Err(SubmitError::Overloaded),
                };
            }
            return Err(SubmitError::Overloaded);
        }
        state.overloaded_since = None;
        let (reply_tx, reply_rx) = oneshot::channel();
        state.queue.push_back(QueuedRequest { input: input.clone(), retries, reply_tx });
        drop(state);
        self.await_reply(reply_rx, input, retries).await
    }

    async fn await_reply(
        self: &Arc<Self>,
        rx: oneshot::Receiver<HelperReply>,
        input: String,
        retries: u8,
    ) -> Result<HelperReply, SubmitError> {
        let result = match self.cfg.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await,
            None => Ok(rx.await),
        };
        self.replies.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SubmitError::Broken),
            Err(_) => {
                // Timeout: §4.2 "Timeout and retry".
                if self.cfg.retry_timed_out && retries < MAX_RETRIES {
                    debug!(pool = %self.cfg.name, retries, "retrying timed-out helper request");
                    Box::pin(self.submit_inner(input, retries + 1)).await
                } else if let Some(canned) = &self.cfg.precanned_timeout_reply {
                    Ok(HelperReply::parse(canned))
                } else {
                    Err(SubmitError::TimedOut)
                }
            }
        }
    }

    /// Finds the least-loaded non-shutdown child with spare concurrency, or
    /// spawns a new one if `needNew() > 0` (spec.md §4.2 "Dispatch").
    async fn try_dispatch(self: &Arc<Self>, input: &str) -> Result<Option<oneshot::Receiver<HelperReply>>, SubmitError> {
        let state = self.state.lock().await;
        let mut best: Option<(Arc<ChildHandle>, usize)> = None;
        for child in &state.children {
            if child.shutting_down.load(Ordering::Relaxed) {
                continue;
            }
            let pending = child.pending_count().await;
            if pending >= child.concurrency {
                continue;
            }
            if best.as_ref().map(|(_, n)| pending < *n).unwrap_or(true) {
                best = Some((child.clone(), pending));
            }
        }
        let children_len = state.children.len();
        drop(state);

        if let Some((child, _)) = best {
            return Ok(Some(self.dispatch_to(&child, input).await));
        }

        if children_len < self.cfg.max {
            self.spawn_child().await.map_err(|_| SubmitError::Broken)?;
            let state = self.state.lock().await;
            if let Some(child) = state.children.last().cloned() {
                drop(state);
                return Ok(Some(self.dispatch_to(&child, input).await));
            }
        }
        Ok(None)
    }

    async fn dispatch_to(&self, child: &Arc<ChildHandle>, input: &str) -> oneshot::Receiver<HelperReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = child.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = child.pending.lock().await;
            pending.insert(id, PendingRequest { reply_tx });
        }
        let line = if child.concurrency >= 1 {
            format!("{id} {input}\n")
        } else {
            format!("{input}\n")
        };
        let mut stdin = child.stdin.lock().await;
        if stdin.write_all(line.as_bytes()).await.is_err() {
            let mut pending = child.pending.lock().await;
            if let Some(req) = pending.remove(&id) {
                let _ = req.reply_tx.send(HelperReply::broken());
            }
        }
        reply_rx
    }

    /// Dispatches as many queued requests as current slack allows; called
    /// after a new child is spawned (spec.md §4.2 "Dispatch").
    async fn drain_queue(self: &Arc<Self>) {
        loop {
            let queued = {
                let mut state = self.state.lock().await;
                state.queue.pop_front()
            };
            let Some(queued) = queued else { break };
            match self.try_dispatch(&queued.input).await {
                Ok(Some(rx)) => {
                    let pool = self.clone();
                    let input = queued.input.clone();
                    let retries = queued.retries;
                    let reply_tx = queued.reply_tx;
                    tokio::spawn(async move {
                        if let Ok(reply) = pool.await_reply(rx, input, retries).await {
                            let _ = reply_tx.send(reply);
                        }
                    });
                }
                _ => {
                    let mut state = self.state.lock().await;
                    state.queue.push_front(queued);
                    break;
                }
            }
        }
    }

    /// Graceful shutdown (spec.md §4.2 "Shutdown"): flags every child and
    /// best-effort replies to anything still queued with `Unknown`.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for child in &state.children {
            child.shutting_down.store(true, Ordering::Relaxed);
        }
        for queued in state.queue.drain(..) {
            let _ = queued.reply_tx.send(HelperReply {
                kind: HelperReplyKind::Unknown,
                ok: false,
                kv: HashMap::new(),
                raw: String::new(),
            });
        }
    }

    /// `queue_size(P) = |undispatched(P)|` (spec.md §8 invariants).
    pub async fn queue_size(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn replies_seen(&self) -> u64 {
        self.replies.load(Ordering::Relaxed)
    }
}
