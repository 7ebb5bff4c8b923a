use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::dagops::DagOpsHandle;
use crate::env::Environment;
use crate::errors::{ExecutionError, Result};
use crate::node::Dependency;
use crate::pipe::{EBADF, PipeMode, PipeWriter, PrintTeeWriter, Reader, Writer};

pub const EPIPE: i32 = 32;

/// Standard fds every node gets auto-opened on first touch, per
/// `pylib-v1/ailets/atyping.py::StdHandles`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StdHandle {
    Stdin = 0,
    Stdout = 1,
    Log = 2,
    Env = 3,
    Metrics = 4,
    Trace = 5,
}

impl StdHandle {
    fn from_fd(fd: i32) -> Option<Self> {
        match fd {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Log),
            3 => Some(Self::Env),
            4 => Some(Self::Metrics),
            5 => Some(Self::Trace),
            _ => None,
        }
    }
}

/// How a standard handle resolves to a concrete open, before any
/// per-node override from `for_env_pipe` (§4.6a) is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opener {
    Input,
    Output,
    Print,
    Env,
}

fn default_openers() -> HashMap<i32, Opener> {
    HashMap::from([
        (StdHandle::Stdin as i32, Opener::Input),
        (StdHandle::Stdout as i32, Opener::Output),
        (StdHandle::Log as i32, Opener::Print),
        (StdHandle::Env as i32, Opener::Env),
        (StdHandle::Metrics as i32, Opener::Print),
        (StdHandle::Trace as i32, Opener::Print),
    ])
}

enum OpenFd {
    Reader(MergeReader),
    Writer(Box<dyn PipeWriter>, String),
}

/// Merges the pipes of every dependency bound to one logical input slot,
/// reading them in list order, each to exhaustion before the next.
/// Falls back to a KV-addressed pipe when no live dependency matches and
/// the slot name looks like a `value.*` or `/`-rooted attachment path.
/// Grounded on `pylib-v1/ailets/io/input_reader.py::MergeInputReader`.
pub struct MergeReader {
    env: Arc<Environment>,
    deps: Vec<Dependency>,
    slot_name: String,
    index: i64,
    current: Option<Reader>,
    closed: bool,
}

impl MergeReader {
    fn new(env: Arc<Environment>, deps: Vec<Dependency>, slot_name: String) -> Self {
        Self {
            env,
            deps,
            slot_name,
            index: -1,
            current: None,
            closed: false,
        }
    }

    fn matching_pipes(&self) -> Vec<Arc<crate::pipe::Pipe>> {
        self.deps
            .iter()
            .filter(|d| d.name == self.slot_name)
            .filter_map(|d| self.env.piper().get_existing_pipe(&d.source, &d.slot).ok())
            .collect()
    }

    pub fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        if self.closed {
            return Ok(Vec::new());
        }
        loop {
            if let Some(reader) = &self.current {
                let chunk = reader.read(size)?;
                if !chunk.is_empty() {
                    return Ok(chunk);
                }
                self.current = None;
            }

            let mut pipes = self.matching_pipes();
            self.index += 1;

            if pipes.is_empty() && self.index == 0 {
                let kv_base = if self.slot_name.contains('/') {
                    Some("/")
                } else if self.slot_name.starts_with("value.") {
                    Some("")
                } else {
                    None
                };
                if let Some(base) = kv_base {
                    if let Ok(p) = self.env.piper().get_existing_pipe(base, &self.slot_name) {
                        pipes = vec![p];
                    }
                }
            }

            if (self.index as usize) >= pipes.len() {
                self.closed = true;
                return Ok(Vec::new());
            }

            self.current = Some(pipes[self.index as usize].reader());
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.current = None;
    }
}

/// Per-invocation actor-facing surface: a POSIX-ish fd table scoped to one
/// node. Never lets `ExecutionError` cross into actor code — failures are
/// reported the way a syscall would, via `-1` + an errno the actor can
/// read back with `get_errno`. Grounded on
/// `pylib-v1/ailets/actor_runtime/node_runtime.py::NodeRuntime`.
pub struct NodeRuntime {
    env: Arc<Environment>,
    node_name: String,
    deps: Vec<Dependency>,
    open_fds: HashMap<i32, OpenFd>,
    fd_openers: HashMap<i32, Opener>,
    errno: i32,
    cached_dagops: Option<DagOpsHandle>,
}

impl NodeRuntime {
    pub fn new(env: Arc<Environment>, node_name: String, deps: Vec<Dependency>) -> Self {
        Self {
            env,
            node_name,
            deps,
            open_fds: HashMap::new(),
            fd_openers: default_openers(),
            errno: 0,
            cached_dagops: None,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.node_name
    }

    pub fn get_errno(&self) -> i32 {
        self.errno
    }

    pub fn set_errno(&mut self, errno: i32) {
        self.errno = errno;
    }

    fn handle_error(&mut self, prefix: &str, err: ExecutionError) {
        trace!(node = %self.node_name, prefix, %err, "runtime error");
        let errno = match &err {
            ExecutionError::BadDescriptor(e) | ExecutionError::BrokenPipe(e) => *e,
            _ => -1,
        };
        self.set_errno(errno);
    }

    fn resolved_opener(&self, fd: i32) -> Option<Opener> {
        let base = *self.fd_openers.get(&fd)?;
        let Some(per_node) = self.env.env_pipe_override(&self.node_name, fd) else {
            return Some(base);
        };
        Some(per_node)
    }

    /// Resolve a standard handle on first touch, applying any per-node
    /// override from the environment's `for_env_pipe` configuration.
    fn auto_open(&mut self, fd: i32) -> Result<()> {
        let opener = self
            .resolved_opener(fd)
            .ok_or(ExecutionError::BadDescriptor(EBADF))?;
        match opener {
            Opener::Input => {
                let real_fd = self.open_read("")?;
                self.alias_fd(fd, real_fd)
            }
            Opener::Output => {
                let real_fd = self.open_write("")?;
                self.alias_fd(fd, real_fd)
            }
            Opener::Env => {
                let params = self.env.for_env_pipe_json();
                let pipe = self.env.piper().make_env_pipe(&params)?;
                self.open_fds.insert(fd, OpenFd::Reader(MergeReader {
                    env: self.env.clone(),
                    deps: vec![],
                    slot_name: "env".to_string(),
                    index: 0,
                    current: Some(pipe.reader()),
                    closed: false,
                }));
                Ok(())
            }
            Opener::Print => {
                let slot_name = match StdHandle::from_fd(fd) {
                    Some(StdHandle::Stdout) => "",
                    Some(StdHandle::Log) => "log",
                    Some(StdHandle::Metrics) => "metrics",
                    Some(StdHandle::Trace) => "trace",
                    _ => return Err(ExecutionError::BadDescriptor(EBADF)),
                };
                let pipe = self.env.piper().create_pipe(&self.node_name, slot_name, PipeMode::Write)?;
                let writer: Box<dyn PipeWriter> = Box::new(PrintTeeWriter::new(Some(pipe.writer())));
                self.open_fds
                    .insert(fd, OpenFd::Writer(writer, slot_name.to_string()));
                Ok(())
            }
        }
    }

    fn alias_fd(&mut self, fd: i32, real_fd: i32) -> Result<()> {
        let moved = self
            .open_fds
            .remove(&real_fd)
            .ok_or(ExecutionError::BadDescriptor(EBADF))?;
        self.open_fds.insert(fd, moved);
        Ok(())
    }

    /// All four of these mirror a POSIX syscall: `-1` + a readable errno
    /// on failure, never a propagated `ExecutionError` (spec.md §6).
    pub fn open_read(&mut self, slot_name: &str) -> i32 {
        match self.try_open_read(slot_name) {
            Ok(fd) => fd,
            Err(e) => {
                self.handle_error("open_read", e);
                -1
            }
        }
    }

    fn try_open_read(&mut self, slot_name: &str) -> Result<i32> {
        let fd = self.env.seqno().next() as i32;
        let reader = MergeReader::new(self.env.clone(), self.deps.clone(), slot_name.to_string());
        self.open_fds.insert(fd, OpenFd::Reader(reader));
        Ok(fd)
    }

    pub fn open_write(&mut self, slot_name: &str) -> i32 {
        match self.try_open_write(slot_name) {
            Ok(fd) => fd,
            Err(e) => {
                self.handle_error("open_write", e);
                -1
            }
        }
    }

    fn try_open_write(&mut self, slot_name: &str) -> Result<i32> {
        let pipe = self
            .env
            .piper()
            .create_pipe(&self.node_name, slot_name, PipeMode::Write)?;
        let fd = self.env.seqno().next() as i32;
        self.open_fds.insert(
            fd,
            OpenFd::Writer(Box::new(pipe.writer()), slot_name.to_string()),
        );
        Ok(fd)
    }

    /// Copies up to `buf.len()` bytes in, returning the count read (`0`
    /// at end of stream) or `-1` on error.
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        match self.try_read(fd, buf.len()) {
            Ok(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                n as i32
            }
            Err(e) => {
                self.handle_error("read", e);
                -1
            }
        }
    }

    fn try_read(&mut self, fd: i32, count: usize) -> Result<Vec<u8>> {
        if !self.open_fds.contains_key(&fd) && self.fd_openers.contains_key(&fd) {
            self.auto_open(fd)?;
        }
        match self.open_fds.get_mut(&fd) {
            Some(OpenFd::Reader(r)) => r.read(count),
            Some(OpenFd::Writer(..)) => Err(ExecutionError::BadDescriptor(EBADF)),
            None => Err(ExecutionError::BadDescriptor(EBADF)),
        }
    }

    pub fn write(&mut self, fd: i32, bytes: &[u8]) -> i32 {
        match self.try_write(fd, bytes) {
            Ok(n) => n as i32,
            Err(e) => {
                self.handle_error("write", e);
                -1
            }
        }
    }

    fn try_write(&mut self, fd: i32, bytes: &[u8]) -> Result<usize> {
        if !self.open_fds.contains_key(&fd) && self.fd_openers.contains_key(&fd) {
            self.auto_open(fd)?;
        }
        match self.open_fds.get(&fd) {
            Some(OpenFd::Writer(w, _)) => w.write(bytes),
            Some(OpenFd::Reader(_)) => Err(ExecutionError::BadDescriptor(EBADF)),
            None => Err(ExecutionError::BadDescriptor(EBADF)),
        }
    }

    pub fn close(&mut self, fd: i32) -> i32 {
        match self.try_close(fd) {
            Ok(()) => 0,
            Err(e) => {
                self.handle_error("close", e);
                -1
            }
        }
    }

    fn try_close(&mut self, fd: i32) -> Result<()> {
        if self.fd_openers.contains_key(&fd) {
            return Ok(()); // standard handles aren't individually closeable
        }
        match self.open_fds.remove(&fd) {
            Some(OpenFd::Reader(mut r)) => {
                r.close();
                Ok(())
            }
            Some(OpenFd::Writer(w, slot_name)) => {
                w.close()?;
                let path = crate::pipe::Piper::path_for(&self.node_name, &slot_name);
                self.env.kv().flush(&path)?;
                Ok(())
            }
            None => Err(ExecutionError::BadDescriptor(EBADF)),
        }
    }

    pub fn dagops(&mut self) -> &mut DagOpsHandle {
        if self.cached_dagops.is_none() {
            self.cached_dagops = Some(DagOpsHandle::new(self.env.clone(), self.node_name.clone()));
        }
        self.cached_dagops.as_mut().expect("just inserted")
    }

    pub fn get_next_name(&self, base_name: &str) -> String {
        self.env.dag().get_next_name(base_name)
    }

    /// Closes every fd still open; if the node is ending in an error
    /// state, propagates it to peers so blocked readers/writers wake up
    /// with `EPIPE` instead of hanging. Grounded on
    /// `NodeRuntime.destroy` in the original.
    pub fn destroy(&mut self) {
        let fds: Vec<i32> = self.open_fds.keys().copied().collect();
        for fd in fds {
            if self.errno != 0 {
                if let Some(OpenFd::Writer(w, _)) = self.open_fds.get(&fd) {
                    let _ = w.set_error(EPIPE);
                }
            }
            let _ = self.close(fd);
        }
        debug!(node = %self.node_name, "runtime destroyed");
    }
}
