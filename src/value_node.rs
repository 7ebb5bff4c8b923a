use std::sync::Arc;

use crate::dag::Dag;
use crate::env::Environment;
use crate::errors::Result;
use crate::node::{ActorFn, Node};
use crate::notify::NotificationQueue;
use crate::pipe::{PipeMode, PipeWriter, Piper};

/// Registers the node, writes `value` into its backing pipe, closes it,
/// and marks it finished immediately — a value node never runs on the
/// scheduler's thread pool, it is finished on creation (spec.md §3).
/// Grounded on `pylib-v1/ailets/cons/value_node.py::add_value_node`,
/// whose `processes.add_finished_node(node.name)` call this mirrors.
pub fn add_value_node(env: &Environment, value: &[u8], explain: Option<String>) -> Result<Node> {
    let dag = env.dag();
    let piper = env.piper();
    let name = dag.get_next_name("value");
    let noop: ActorFn = Arc::new(|_rt| Ok(()));
    let node = dag.insert_node(name.clone(), noop, vec![], explain);
    let pipe = piper.create_pipe(&name, "", PipeMode::Write)?;
    let writer = pipe.writer();
    writer.write(value)?;
    writer.close()?;
    env.mark_finished(&name);
    Ok(node)
}

/// Registers a node whose body simply blocks until its own backing
/// pipe's writer is closed by someone else entirely (e.g. a streaming
/// HTTP response handler writing through the handle returned by
/// `DagOpsHandle::open_write_pipe`). Grounded on
/// `pylib-v1/ailets/cons/value_node.py::add_open_value_node`.
pub fn add_open_value_node(
    dag: &Dag,
    piper: &Piper,
    queue: &Arc<NotificationQueue>,
    explain: Option<String>,
) -> Result<Node> {
    let name = dag.get_next_name("value");
    let noop: ActorFn = Arc::new(|_rt| Ok(()));
    dag.insert_node(name.clone(), noop, vec![], explain);
    let pipe = piper.create_pipe(&name, "", PipeMode::Write)?;

    let wait_pipe = pipe.clone();
    let full_name = name.clone();
    let queue = queue.clone();
    let func: ActorFn = Arc::new(move |_rt| -> Result<()> {
        loop {
            if wait_pipe.is_closed() {
                return Ok(());
            }
            let Some(handle) = wait_pipe.notify_handle() else {
                return Ok(());
            };
            let mut guard = queue.get_lock().lock();
            if wait_pipe.is_closed() {
                return Ok(());
            }
            queue.wait_unsafe(&mut guard, handle, &format!("value node {full_name}"))?;
        }
    });
    dag.set_func(&name, func)?;
    dag.get_node(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStore;
    use crate::seqno::Seqno;

    fn setup() -> (Dag, Piper, Arc<NotificationQueue>) {
        let seq = Arc::new(Seqno::new());
        let queue = Arc::new(NotificationQueue::new());
        let kv = Arc::new(KvStore::new());
        let piper = Piper::new(kv, queue.clone(), seq.clone());
        let dag = Dag::new(seq);
        (dag, piper, queue)
    }

    #[test]
    fn value_node_is_immediately_readable() {
        let env = Environment::new();
        let node = add_value_node(&env, b"payload", None).unwrap();
        let pipe = env.piper().get_existing_pipe(&node.name, "").unwrap();
        assert_eq!(pipe.reader().read(1024).unwrap(), b"payload");
    }

    #[test]
    fn value_node_is_marked_finished_on_creation() {
        let env = Environment::new();
        let node = add_value_node(&env, b"payload", None).unwrap();
        assert!(env.is_node_finished(&node.name));
    }

    #[test]
    fn open_value_node_func_blocks_until_closed() {
        use std::thread;
        use std::time::Duration;

        let (dag, piper, queue) = setup();
        let node = add_open_value_node(&dag, &piper, &queue, None).unwrap();
        let pipe = piper.get_existing_pipe(&node.name, "").unwrap();
        let writer = pipe.writer();

        let func = node.func.clone();
        let handle = thread::spawn(move || {
            use crate::env::Environment;
            let env = Arc::new(Environment::new());
            let mut rt = crate::runtime::NodeRuntime::new(env, "t".to_string(), vec![]);
            func(&mut rt)
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        writer.close().unwrap();
        handle.join().unwrap().unwrap();
    }
}
