use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{ExecutionError, Result};
use crate::kv::{Buffer, KvMode, KvStore};
use crate::notify::NotificationQueue;
use crate::seqno::Seqno;

/// `EPIPE`-equivalent used when a writer is put into the error state.
pub const EPIPE: i32 = 32;
/// `EBADF`-equivalent used for operations on an unknown/wrong-direction fd.
pub const EBADF: i32 = 9;

/// State shared between a pipe's single writer and all of its readers.
struct WriterState {
    buffer: Buffer,
    /// Notification handle; `-1` means "never waited on" (static pipes).
    handle: i64,
    closed: AtomicBool,
    errno: AtomicI32,
}

impl WriterState {
    fn new(buffer: Buffer, handle: i64) -> Self {
        Self {
            buffer,
            handle,
            closed: AtomicBool::new(false),
            errno: AtomicI32::new(0),
        }
    }
}

/// Trait object surface the actor runtime holds per open fd — lets
/// `PrintTeeWriter` stand in for a plain `Writer` without the runtime
/// caring which it has.
pub trait PipeWriter: Send + Sync {
    fn write(&self, bytes: &[u8]) -> Result<usize>;
    fn tell(&self) -> usize;
    fn close(&self) -> Result<()>;
    fn set_error(&self, errno: i32) -> Result<()>;
}

#[derive(Clone)]
pub struct Writer {
    state: Arc<WriterState>,
    queue: Arc<NotificationQueue>,
}

impl Writer {
    fn notify_handle(&self) -> Option<i64> {
        (self.state.handle >= 0).then_some(self.state.handle)
    }
}

impl PipeWriter for Writer {
    fn write(&self, bytes: &[u8]) -> Result<usize> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ExecutionError::BadDescriptor(EBADF));
        }
        let errno = self.state.errno.load(Ordering::SeqCst);
        if errno != 0 {
            return Err(ExecutionError::BrokenPipe(errno));
        }
        self.state.buffer.lock().extend_from_slice(bytes);
        if let Some(handle) = self.notify_handle() {
            self.queue.notify(handle, bytes.len() as i64)?;
        }
        Ok(bytes.len())
    }

    fn tell(&self) -> usize {
        self.state.buffer.lock().len()
    }

    fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(()); // idempotent
        }
        if let Some(handle) = self.notify_handle() {
            self.queue.notify(handle, -1)?;
            self.queue.unlist(handle);
        }
        Ok(())
    }

    fn set_error(&self, errno: i32) -> Result<()> {
        self.state.errno.store(errno, Ordering::SeqCst);
        if let Some(handle) = self.notify_handle() {
            self.queue.notify(handle, errno as i64)?;
        }
        Ok(())
    }
}

/// Wraps another writer (or none). Every write mirrors to process stdout
/// first, then delegates.
pub struct PrintTeeWriter {
    inner: Option<Writer>,
}

impl PrintTeeWriter {
    pub fn new(inner: Option<Writer>) -> Self {
        Self { inner }
    }
}

impl PipeWriter for PrintTeeWriter {
    fn write(&self, bytes: &[u8]) -> Result<usize> {
        print!("{}", String::from_utf8_lossy(bytes));
        std::io::stdout().flush().ok();
        match &self.inner {
            Some(w) => w.write(bytes),
            None => Ok(bytes.len()),
        }
    }

    fn tell(&self) -> usize {
        self.inner.as_ref().map(PipeWriter::tell).unwrap_or(0)
    }

    fn close(&self) -> Result<()> {
        match &self.inner {
            Some(w) => w.close(),
            None => Ok(()),
        }
    }

    fn set_error(&self, errno: i32) -> Result<()> {
        match &self.inner {
            Some(w) => w.set_error(errno),
            None => Ok(()),
        }
    }
}

/// Independent read cursor over a single writer. Blocks on read only when
/// caught up to the writer and the writer is neither closed nor errored.
pub struct Reader {
    writer: Arc<WriterState>,
    queue: Arc<NotificationQueue>,
    pos: AtomicUsize,
    closed: AtomicBool,
}

impl Reader {
    pub fn read(&self, size: usize) -> Result<Vec<u8>> {
        loop {
            {
                let buf = self.writer.buffer.lock();
                let wlen = buf.len();
                let pos = self.pos.load(Ordering::SeqCst);
                if pos < wlen {
                    let end = (pos + size).min(wlen);
                    let out = buf[pos..end].to_vec();
                    drop(buf);
                    self.pos.store(end, Ordering::SeqCst);
                    return Ok(out);
                }
                let errno = self.writer.errno.load(Ordering::SeqCst);
                if errno != 0 {
                    return Err(ExecutionError::BrokenPipe(errno));
                }
                if self.writer.closed.load(Ordering::SeqCst) {
                    return Ok(Vec::new()); // end-of-stream
                }
            }

            let Some(handle) = (self.writer.handle >= 0).then_some(self.writer.handle) else {
                // No notification handle and nothing to read: treat as EOF.
                return Ok(Vec::new());
            };

            let mut guard = self.queue.get_lock().lock();
            // Re-check under the lock before committing to sleep — this is
            // what eliminates the lost-wakeup race (spec.md §5).
            let still_must_wait = {
                let buf = self.writer.buffer.lock();
                self.pos.load(Ordering::SeqCst) >= buf.len()
                    && self.writer.errno.load(Ordering::SeqCst) == 0
                    && !self.writer.closed.load(Ordering::SeqCst)
            };
            if !still_must_wait {
                continue;
            }
            self.queue.wait_unsafe(&mut guard, handle, "pipe reader")?;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A single-writer/many-reader byte pipe.
pub struct Pipe {
    state: Arc<WriterState>,
    queue: Arc<NotificationQueue>,
}

impl Pipe {
    pub fn writer(&self) -> Writer {
        Writer {
            state: self.state.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn reader(&self) -> Reader {
        Reader {
            writer: self.state.clone(),
            queue: self.queue.clone(),
            pos: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Static input: pre-filled, immediately closed, unlimited readers.
    /// Never registered with the notification queue — nobody will ever
    /// need to wait on it.
    pub fn static_pipe(content: Vec<u8>, queue: Arc<NotificationQueue>) -> Self {
        let buffer: Buffer = Arc::new(Mutex::new(content));
        let state = Arc::new(WriterState::new(buffer, -1));
        state.closed.store(true, Ordering::SeqCst);
        Self { state, queue }
    }

    pub fn tell(&self) -> usize {
        self.state.buffer.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn errno(&self) -> i32 {
        self.state.errno.load(Ordering::SeqCst)
    }

    /// Notification handle the writer publishes on, if any (`static_pipe`s
    /// have none). Used by a waiter that must block until this pipe's
    /// writer closes, e.g. an open value node's body.
    pub fn notify_handle(&self) -> Option<i64> {
        (self.state.handle >= 0).then_some(self.state.handle)
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeMode {
    Write,
    Read,
    Append,
}

/// Pipe directory: path-keyed pipe storage, plus the fsops handle the
/// scheduler subscribes to in order to learn about new pipes as they're
/// created.
pub struct Piper {
    pipes: Mutex<HashMap<String, Arc<Pipe>>>,
    kv: Arc<KvStore>,
    queue: Arc<NotificationQueue>,
    seq: Arc<Seqno>,
    fsops_handle: i64,
}

impl Piper {
    pub fn new(kv: Arc<KvStore>, queue: Arc<NotificationQueue>, seq: Arc<Seqno>) -> Self {
        let fsops_handle = seq.next();
        queue.whitelist(fsops_handle, "piper.fsops");
        Self {
            pipes: Mutex::new(HashMap::new()),
            kv,
            queue,
            seq,
            fsops_handle,
        }
    }

    pub fn get_fsops_handle(&self) -> i64 {
        self.fsops_handle
    }

    /// `"<node>"` for the unnamed slot, `"<node>-<slot>"` otherwise, or the
    /// raw slot if it already looks like a path.
    pub fn path_for(node: &str, slot: &str) -> String {
        if slot.contains('/') {
            slot.to_string()
        } else if slot.is_empty() {
            node.to_string()
        } else {
            format!("{node}-{slot}")
        }
    }

    pub fn create_pipe(&self, node: &str, slot: &str, mode: PipeMode) -> Result<Arc<Pipe>> {
        let path = Self::path_for(node, slot);
        match mode {
            PipeMode::Write | PipeMode::Append => {
                let mut pipes = self.pipes.lock();
                if pipes.contains_key(&path) {
                    return Err(ExecutionError::PipeAlreadyExists(path));
                }
                let handle = self.seq.next();
                self.queue.whitelist(handle, &path);
                let buffer = self.kv.open(&path, KvMode::Write)?;
                let pipe = Arc::new(Pipe {
                    state: Arc::new(WriterState::new(buffer, handle)),
                    queue: self.queue.clone(),
                });
                pipes.insert(path.clone(), pipe.clone());
                drop(pipes);
                debug!(path, "piper: created pipe");
                self.queue.notify(self.fsops_handle, handle)?;
                Ok(pipe)
            }
            PipeMode::Read => {
                {
                    let pipes = self.pipes.lock();
                    if let Some(p) = pipes.get(&path) {
                        return Ok(p.clone());
                    }
                }
                // No producer: lazily create a pipe and immediately close
                // its writer, so reading it yields empty end-of-stream
                // rather than blocking forever.
                let mut pipes = self.pipes.lock();
                if let Some(p) = pipes.get(&path) {
                    return Ok(p.clone());
                }
                let handle = self.seq.next();
                self.queue.whitelist(handle, &path);
                let buffer = self.kv.open(&path, KvMode::Write)?;
                let state = Arc::new(WriterState::new(buffer, handle));
                let pipe = Arc::new(Pipe {
                    state,
                    queue: self.queue.clone(),
                });
                pipe.writer().close()?;
                pipes.insert(path.clone(), pipe.clone());
                drop(pipes);
                self.queue.notify(self.fsops_handle, handle)?;
                Ok(pipe)
            }
        }
    }

    pub fn get_existing_pipe(&self, node: &str, slot: &str) -> Result<Arc<Pipe>> {
        let path = Self::path_for(node, slot);
        self.pipes
            .lock()
            .get(&path)
            .cloned()
            .ok_or(ExecutionError::PipeNotFound(path))
    }

    pub fn make_env_pipe(&self, params: &serde_json::Value) -> Result<Pipe> {
        let content = serde_json::to_vec(params)?;
        Ok(Pipe::static_pipe(content, self.queue.clone()))
    }

    pub fn destroy(&self) {
        self.queue.unlist(self.fsops_handle);
        self.pipes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_piper() -> Piper {
        Piper::new(
            Arc::new(KvStore::new()),
            Arc::new(NotificationQueue::new()),
            Arc::new(Seqno::new()),
        )
    }

    #[test]
    fn fifo_order_and_eof() {
        let piper = new_piper();
        let pipe = piper.create_pipe("n", "", PipeMode::Write).unwrap();
        let writer = pipe.writer();
        let reader = pipe.reader();

        writer.write(b"ab").unwrap();
        writer.write(b"cd").unwrap();
        writer.close().unwrap();

        let mut out = Vec::new();
        loop {
            let chunk = reader.read(1024).unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn error_propagates_to_reader() {
        let piper = new_piper();
        let pipe = piper.create_pipe("n", "", PipeMode::Write).unwrap();
        let writer = pipe.writer();
        let reader = pipe.reader();

        writer.write(b"abc").unwrap();
        writer.set_error(EPIPE).unwrap();

        assert_eq!(reader.read(3).unwrap(), b"abc");
        let err = reader.read(10).unwrap_err();
        assert!(matches!(err, ExecutionError::BrokenPipe(EPIPE)));
        // idempotent close on errored writer
        assert!(writer.close().is_ok());
    }

    #[test]
    fn read_mode_with_no_producer_is_empty() {
        let piper = new_piper();
        let pipe = piper.create_pipe("solo", "", PipeMode::Read).unwrap();
        assert_eq!(pipe.reader().read(10).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn duplicate_write_mode_errors() {
        let piper = new_piper();
        piper.create_pipe("n", "", PipeMode::Write).unwrap();
        assert!(piper.create_pipe("n", "", PipeMode::Write).is_err());
    }

    #[test]
    fn static_pipe_is_immediately_readable() {
        let queue = Arc::new(NotificationQueue::new());
        let pipe = Pipe::static_pipe(b"hello".to_vec(), queue);
        assert_eq!(pipe.reader().read(1024).unwrap(), b"hello");
        assert_eq!(pipe.reader().read(1024).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn blocking_reader_wakes_on_write() {
        use std::thread;
        use std::time::Duration;

        let piper = Arc::new(new_piper());
        let pipe = piper.create_pipe("p", "out", PipeMode::Write).unwrap();
        let reader = pipe.reader();
        let writer = pipe.writer();

        let reader_thread = thread::spawn(move || reader.read(10).unwrap());
        thread::sleep(Duration::from_millis(50));
        writer.write(b"hi").unwrap();
        writer.close().unwrap();

        assert_eq!(reader_thread.join().unwrap(), b"hi");
    }
}
