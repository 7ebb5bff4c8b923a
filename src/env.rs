use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::config::ExecutorOptions;
use crate::dag::Dag;
use crate::kv::KvStore;
use crate::notify::NotificationQueue;
use crate::pipe::Piper;
use crate::runtime::Opener;
use crate::seqno::Seqno;

/// Per-node standard-handle override, keyed by fd then opener name, as
/// configured under a node name in `for_env_pipe` (§4.6a / §13).
#[derive(Clone, Debug, Default)]
pub struct PerNodeEnv {
    pub handles: HashMap<i32, Opener>,
}

/// Wires together every shared collaborator: seqno, notification queue,
/// KV store, piper, DAG, plus the process-wide errno and the
/// finished/active node bookkeeping the original splits out into a
/// separate `Processes` collaborator (`processes.py`). Keeping that state
/// here instead lets `DagOpsHandle` (which only ever sees an `Environment`)
/// mark a value node finished without a second back-reference into the
/// scheduler — `scheduler.rs` reads the same sets.
pub struct Environment {
    seqno: Arc<Seqno>,
    queue: Arc<NotificationQueue>,
    kv: Arc<KvStore>,
    piper: Arc<Piper>,
    dag: Arc<Dag>,
    errno: AtomicI32,
    for_env_pipe: HashMap<String, PerNodeEnv>,
    env_config: Value,
    channel_buffer_sz: usize,
    finished: Mutex<HashSet<String>>,
    active: Mutex<HashSet<String>>,
    completion_codes: Mutex<HashMap<String, i32>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        let seqno = Arc::new(Seqno::new());
        let queue = Arc::new(NotificationQueue::new());
        let kv = Arc::new(KvStore::new());
        let piper = Arc::new(Piper::new(kv.clone(), queue.clone(), seqno.clone()));
        let dag = Arc::new(Dag::new(seqno.clone()));
        Self {
            seqno,
            queue,
            kv,
            piper,
            dag,
            errno: AtomicI32::new(0),
            for_env_pipe: HashMap::new(),
            env_config: serde_json::json!({}),
            channel_buffer_sz: ExecutorOptions::default().channel_buffer_sz,
            finished: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
            completion_codes: Mutex::new(HashMap::new()),
        }
    }

    /// Builds an environment from an explicit `ExecutorOptions` instead of
    /// all-defaults, for callers that need per-node handle overrides or a
    /// custom env-config blob wired in up front rather than set later via
    /// `set_for_env_pipe`/`set_env_config`.
    pub fn with_options(options: ExecutorOptions) -> Self {
        let mut env = Self::new();
        env.for_env_pipe = options.for_env_pipe;
        env.env_config = options.env_config;
        env.channel_buffer_sz = options.channel_buffer_sz;
        env
    }

    #[cfg(feature = "persist")]
    pub fn with_kv_backend(backend: Box<dyn crate::kv::KvBackend>) -> Self {
        let seqno = Arc::new(Seqno::new());
        let queue = Arc::new(NotificationQueue::new());
        let kv = Arc::new(KvStore::with_backend(backend));
        let piper = Arc::new(Piper::new(kv.clone(), queue.clone(), seqno.clone()));
        let dag = Arc::new(Dag::new(seqno.clone()));
        Self {
            seqno,
            queue,
            kv,
            piper,
            dag,
            errno: AtomicI32::new(0),
            for_env_pipe: HashMap::new(),
            env_config: serde_json::json!({}),
            channel_buffer_sz: ExecutorOptions::default().channel_buffer_sz,
            finished: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
            completion_codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn seqno(&self) -> &Arc<Seqno> {
        &self.seqno
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn piper(&self) -> &Arc<Piper> {
        &self.piper
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    pub fn get_errno(&self) -> i32 {
        self.errno.load(Ordering::SeqCst)
    }

    pub fn set_errno(&self, errno: i32) {
        self.errno.store(errno, Ordering::SeqCst);
    }

    /// First-writer-wins: once a non-zero errno is latched, later calls
    /// are no-ops. This is how one failing node's completion code becomes
    /// the run's overall outcome without a later success clobbering it.
    pub fn latch_errno(&self, errno: i32) {
        if errno != 0 {
            let _ = self
                .errno
                .compare_exchange(0, errno, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub fn is_node_finished(&self, name: &str) -> bool {
        self.finished.lock().contains(name)
    }

    pub fn is_node_active(&self, name: &str) -> bool {
        self.active.lock().contains(name)
    }

    pub fn mark_finished(&self, name: &str) {
        self.finished.lock().insert(name.to_string());
    }

    pub fn mark_active(&self, name: &str) {
        self.active.lock().insert(name.to_string());
    }

    /// Records a node's completion code and, the first time any node
    /// fails, latches it as the run's overall errno.
    pub fn set_completion_code(&self, name: &str, code: i32) {
        self.completion_codes.lock().insert(name.to_string(), code);
        self.latch_errno(code);
    }

    pub fn completion_code(&self, name: &str) -> Option<i32> {
        self.completion_codes.lock().get(name).copied()
    }

    pub fn set_for_env_pipe(&mut self, node: impl Into<String>, cfg: PerNodeEnv) {
        self.for_env_pipe.insert(node.into(), cfg);
    }

    pub fn env_pipe_override(&self, node: &str, fd: i32) -> Option<Opener> {
        self.for_env_pipe.get(node)?.handles.get(&fd).copied()
    }

    pub fn set_env_config(&mut self, cfg: Value) {
        self.env_config = cfg;
    }

    pub fn channel_buffer_sz(&self) -> usize {
        self.channel_buffer_sz
    }

    /// Serialized as the payload of the synthetic `env` pipe every node's
    /// fd 3 resolves to by default.
    pub fn for_env_pipe_json(&self) -> Value {
        self.env_config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_latches_first_nonzero() {
        let env = Environment::new();
        env.latch_errno(5);
        env.latch_errno(7);
        assert_eq!(env.get_errno(), 5);
    }

    #[test]
    fn fresh_env_has_no_errno() {
        let env = Environment::new();
        assert_eq!(env.get_errno(), 0);
    }

    #[test]
    fn with_options_carries_env_config_and_channel_size() {
        let opts = ExecutorOptions {
            env_config: serde_json::json!({"model": "test"}),
            channel_buffer_sz: 4,
            ..ExecutorOptions::default()
        };
        let env = Environment::with_options(opts);
        assert_eq!(env.for_env_pipe_json(), serde_json::json!({"model": "test"}));
        assert_eq!(env.channel_buffer_sz(), 4);
    }
}
