use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::env::Environment;
use crate::errors::Result;
use crate::node::Dependency;
use crate::runtime::NodeRuntime;

/// Drives nodes to completion one OS thread per ready node, the way
/// `run_nodes`/`build_node_alone` drive one asyncio task per ready node in
/// the original. Grounded on `pylib-v1/ailets/cons/processes.py::Processes`.
pub struct Scheduler {
    env: Arc<Environment>,
    deps: Mutex<HashMap<String, Vec<Dependency>>>,
    rev_deps: Mutex<HashMap<String, Vec<Dependency>>>,
    progress_handle: i64,
    progress_seq: AtomicU64,
    fsops_subscription: u64,
}

impl Scheduler {
    pub fn new(env: Arc<Environment>) -> Result<Self> {
        let progress_handle = env.seqno().next();
        env.queue().whitelist(progress_handle, "scheduler.progress");

        let fsops_handle = env.piper().get_fsops_handle();
        let fsops_subscription =
            subscribe_fsops(env.queue().clone(), fsops_handle, progress_handle)?;

        Ok(Self {
            env,
            deps: Mutex::new(HashMap::new()),
            rev_deps: Mutex::new(HashMap::new()),
            progress_handle,
            progress_seq: AtomicU64::new(0),
            fsops_subscription,
        })
    }

    pub fn destroy(&self) {
        let fsops_handle = self.env.piper().get_fsops_handle();
        self.env.queue().unsubscribe(fsops_handle, self.fsops_subscription);
        self.env.queue().unlist(self.progress_handle);
    }

    fn notify_progress(&self, hint_handle: i64) {
        self.progress_seq.fetch_add(1, Ordering::SeqCst);
        let _ = self.env.queue().notify(self.progress_handle, hint_handle);
    }

    /// Recomputes `deps`/`rev_deps` with every alias fully resolved. Must
    /// be re-run whenever `dag.hash_of_node_names()` changes.
    pub fn resolve_deps(&self) {
        let names = self.env.dag().get_node_names();
        let mut deps = HashMap::new();
        for name in &names {
            if let Ok(d) = self.env.dag().iter_deps(name) {
                deps.insert(name.clone(), d);
            }
        }

        let mut rev_deps: HashMap<String, Vec<Dependency>> = HashMap::new();
        for (node_name, node_deps) in &deps {
            for dep in node_deps {
                rev_deps.entry(dep.source.clone()).or_default().push(Dependency {
                    source: node_name.clone(),
                    name: dep.name.clone(),
                    slot: dep.slot.clone(),
                    schema: None,
                });
            }
        }

        *self.deps.lock() = deps;
        *self.rev_deps.lock() = rev_deps;
    }

    pub fn get_nodes_to_build(&self, target_node_name: &str) -> Vec<String> {
        let deps = self.deps.lock().clone();
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.visit_node(target_node_name, &deps, &mut visited, &mut out);
        out
    }

    fn visit_node(
        &self,
        node_name: &str,
        deps: &HashMap<String, Vec<Dependency>>,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !visited.insert(node_name.to_string()) {
            return;
        }
        if let Some(node_deps) = deps.get(node_name) {
            for dep in node_deps {
                self.visit_node(&dep.source, deps, visited, out);
            }
        }
        if !self.env.is_node_finished(node_name) {
            out.push(node_name.to_string());
        }
    }

    /// At-least-one-byte liveness: a dependency counts as progressed once
    /// its source is finished, or is active and has already written
    /// something into its backing pipe.
    fn can_start_node(&self, node_name: &str) -> bool {
        let deps = self.deps.lock();
        let Some(node_deps) = deps.get(node_name) else {
            return false;
        };
        node_deps.iter().all(|dep| {
            if self.env.is_node_finished(&dep.source) {
                return true;
            }
            if !self.env.is_node_active(&dep.source) {
                return false;
            }
            match self.env.piper().get_existing_pipe(&dep.source, &dep.slot) {
                Ok(pipe) => pipe.tell() > 0,
                Err(_) => false,
            }
        })
    }

    fn next_node(&self, iter: &mut NodeIter) -> Option<String> {
        if iter.finished {
            return None;
        }

        if !iter.pass_active {
            iter.nodes_to_build = self.get_nodes_to_build(&iter.target);
            iter.last_hash = self.env.dag().hash_of_node_names();
            iter.idx = 0;
            iter.pass_active = true;
        }

        while iter.idx < iter.nodes_to_build.len() {
            let node_name = iter.nodes_to_build[iter.idx].clone();
            iter.idx += 1;

            if iter.yielded_nodes.contains(&node_name) {
                continue;
            }
            if iter.last_hash != self.env.dag().hash_of_node_names() {
                break; // graph changed mid-pass; abandon it
            }
            if self.env.is_node_finished(&node_name) || self.env.is_node_active(&node_name) {
                continue;
            }
            if !self.can_start_node(&node_name) {
                continue;
            }

            let is_stop_before = iter.stop_before.as_deref() == Some(node_name.as_str());
            if iter.flag_one_step
                || is_stop_before
                || iter.stop_after.as_deref() == Some(node_name.as_str())
            {
                iter.finished = true;
            }
            if !is_stop_before {
                iter.yielded_nodes.insert(node_name.clone());
                return Some(node_name);
            }
            return None;
        }

        if iter.finished {
            return None;
        }
        if iter.last_hash != self.env.dag().hash_of_node_names() {
            debug!("scheduler: node set changed mid-pass, re-resolving deps");
            self.resolve_deps();
        }
        iter.pass_active = false;
        None
    }

    /// Drives `target` (and everything it transitively needs) to
    /// completion, spawning one thread per ready node and waiting for
    /// progress between rounds.
    pub fn run_nodes(self: &Arc<Self>, target: &str) -> Result<()> {
        self.resolve_deps();
        let mut iter = NodeIter::new(target, false, None, None);

        enum Event {
            NodeDone,
            Awake,
        }
        let (tx, rx) = crossbeam::channel::bounded::<Event>(self.env.channel_buffer_sz().max(1));

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut awaker: Option<JoinHandle<()>> = None;
        let mut active = 0usize;

        let mut extend_pool = |scheduler: &Arc<Self>,
                                iter: &mut NodeIter,
                                handles: &mut Vec<JoinHandle<()>>,
                                active: &mut usize| {
            if scheduler.env.get_errno() != 0 {
                return;
            }
            while let Some(name) = scheduler.next_node(iter) {
                let scheduler = scheduler.clone();
                let tx = tx.clone();
                handles.push(
                    thread::Builder::new()
                        .name(format!("ailets-node-{name}"))
                        .spawn(move || {
                            scheduler.build_node_alone(&name);
                            let _ = tx.send(Event::NodeDone);
                        })
                        .expect("spawn node thread"),
                );
                *active += 1;
            }
        };

        extend_pool(self, &mut iter, &mut handles, &mut active);

        while active > 0 {
            if awaker.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
                let queue = self.env.queue().clone();
                let progress_handle = self.progress_handle;
                let tx = tx.clone();
                awaker = Some(
                    thread::Builder::new()
                        .name("ailets-scheduler-awaker".to_string())
                        .spawn(move || {
                            let mut guard = queue.get_lock().lock();
                            if queue.wait_unsafe(&mut guard, progress_handle, "process.awaker").is_ok()
                            {
                                let _ = tx.send(Event::Awake);
                            }
                        })
                        .expect("spawn awaker thread"),
                );
            }

            match rx.recv() {
                Ok(Event::NodeDone) => active -= 1,
                Ok(Event::Awake) => {}
                Err(_) => break,
            }
            extend_pool(self, &mut iter, &mut handles, &mut active);
        }

        if let Some(handle) = awaker {
            if !handle.is_finished() {
                self.notify_progress(-1);
            }
            let _ = handle.join();
        }
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Builds a single node; does not build its dependencies. Catches
    /// panics the way the original catches any stray exception escaping
    /// an actor body, so one broken actor can't wedge the whole run.
    fn build_node_alone(self: &Arc<Self>, name: &str) {
        debug!(name, "scheduler: starting node");
        let node = match self.env.dag().get_node(name) {
            Ok(n) => n,
            Err(e) => {
                warn!(name, %e, "scheduler: node vanished before build");
                return;
            }
        };
        let deps = self.deps.lock().get(name).cloned().unwrap_or_default();

        self.env.mark_active(name);
        let mut node_runtime = NodeRuntime::new(self.env.clone(), name.to_string(), deps);

        let func = node.func.clone();
        let result = catch_unwind(AssertUnwindSafe(|| func(&mut node_runtime)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("*** ailet error: {name}: {e}");
                if node_runtime.get_errno() == 0 {
                    node_runtime.set_errno(-1);
                }
            }
            Err(_) => {
                eprintln!("*** ailet error: {name}: actor panicked");
                if node_runtime.get_errno() == 0 {
                    node_runtime.set_errno(-1);
                }
            }
        }

        let ccode = node_runtime.get_errno();
        debug!(name, ccode, "scheduler: finished node");
        self.env.set_completion_code(name, ccode);
        self.env.mark_finished(name);
        node_runtime.destroy();
        self.notify_progress(-1);
    }
}

/// Top-level convenience entry point: validates `target`'s ancestor set is
/// acyclic before handing off to the thread-pool scheduler, so a cyclic
/// graph fails fast with a cycle error instead of deadlocking the pool
/// with zero ready nodes (the scheduler's own node-selection DFS, unlike
/// `Dag::plan`, does not itself check for cycles — see
/// `processes.py::get_nodes_to_build`, which has the same property).
/// Grounded on `dozer-core/src/executor.rs::DagExecutor::start`'s
/// validate-then-run shape.
pub fn run(env: Arc<Environment>, target: &str) -> Result<()> {
    env.dag().plan(target)?;
    let scheduler = Arc::new(Scheduler::new(env)?);
    let result = scheduler.run_nodes(target);
    scheduler.destroy();
    result
}

fn subscribe_fsops(
    queue: Arc<crate::notify::NotificationQueue>,
    fsops_handle: i64,
    progress_handle: i64,
) -> Result<u64> {
    let cb_queue = queue.clone();
    queue.subscribe(
        fsops_handle,
        "Scheduler: observe fsops",
        Arc::new(move |writer_handle: i64| {
            let watch_queue = cb_queue.clone();
            thread::spawn(move || {
                let mut guard = watch_queue.get_lock().lock();
                let _ = watch_queue.wait_unsafe(&mut guard, writer_handle, "process.awaker_on_write");
                drop(guard);
                let _ = watch_queue.notify(progress_handle, writer_handle);
            });
            let _ = cb_queue.notify(progress_handle, writer_handle);
        }),
    )
}

/// Resumable cursor over "nodes ready to build", re-planning whenever the
/// node set changes. A `None` result means "nothing ready right now, maybe
/// later" rather than "exhausted" — once `finished` is set it is `None`
/// forever after, mirroring the original generator's endless trailing
/// `while True: yield None`.
struct NodeIter {
    target: String,
    flag_one_step: bool,
    stop_before: Option<String>,
    stop_after: Option<String>,
    yielded_nodes: HashSet<String>,
    finished: bool,
    nodes_to_build: Vec<String>,
    last_hash: u64,
    idx: usize,
    pass_active: bool,
}

impl NodeIter {
    fn new(
        target: &str,
        flag_one_step: bool,
        stop_before: Option<String>,
        stop_after: Option<String>,
    ) -> Self {
        Self {
            target: target.to_string(),
            flag_one_step,
            stop_before,
            stop_after,
            yielded_nodes: HashSet::new(),
            finished: false,
            nodes_to_build: Vec::new(),
            last_hash: 0,
            idx: 0,
            pass_active: false,
        }
    }
}
