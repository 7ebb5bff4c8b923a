//! End-to-end scenarios driving a full `Environment` + scheduler, one per
//! function. Mirrors `dozer-core/src/tests/dag_base_run.rs`'s shape: build
//! a small DAG by hand, run it, inspect the resulting pipes/completion
//! codes.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::node::{ActorFn, Dependency};
use crate::pipe::PipeMode;
use crate::tests::{drain, fresh_env};
use crate::value_node::add_value_node;

fn noop() -> ActorFn {
    Arc::new(|_rt| Ok(()))
}

/// Value passthrough: a consumer copies a value node's bytes verbatim.
#[test]
fn s1_value_passthrough() {
    let env = fresh_env();
    let v = add_value_node(&env, b"hello", None).unwrap();

    let c_func: ActorFn = Arc::new(|rt| {
        let fd = rt.open_read("in");
        let mut buf = [0u8; 64];
        let n = rt.read(fd, &mut buf);
        let out = rt.open_write("");
        rt.write(out, &buf[..n.max(0) as usize]);
        rt.close(out);
        Ok(())
    });
    let c = env.dag().add_node(
        "c",
        c_func,
        vec![Dependency::new(v.name.as_str(), "in", "")],
        None,
    );

    crate::run(env.clone(), &c.name).unwrap();

    assert!(env.is_node_finished(&v.name));
    assert!(env.is_node_finished(&c.name));
    assert_eq!(env.completion_code(&v.name), Some(0));
    assert_eq!(env.completion_code(&c.name), Some(0));

    let out_pipe = env.piper().get_existing_pipe(&c.name, "").unwrap();
    assert_eq!(drain(&out_pipe), b"hello");
    assert_eq!(env.kv().listdir("").len(), 2);
}

/// Streaming: the consumer observes each write as it happens rather than
/// waiting for the whole stream to buffer up front.
#[test]
fn s2_streaming() {
    let env = fresh_env();
    let write_count = Arc::new(AtomicUsize::new(0));
    let write_count2 = write_count.clone();

    let p_func: ActorFn = Arc::new(move |rt| {
        let fd = rt.open_write("");
        rt.write(fd, b"a");
        write_count2.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        rt.write(fd, b"b");
        write_count2.fetch_add(1, Ordering::SeqCst);
        rt.close(fd);
        Ok(())
    });
    let p = env.dag().add_node("p", p_func, vec![], None);

    let seen_first_write_count = Arc::new(AtomicUsize::new(99));
    let seen_first_write_count2 = seen_first_write_count.clone();
    let reads = Arc::new(AtomicUsize::new(0));
    let reads2 = reads.clone();

    let c_func: ActorFn = Arc::new(move |rt| {
        let fd = rt.open_read("in");
        let out = rt.open_write("");
        let mut buf = [0u8; 8];
        loop {
            let n = rt.read(fd, &mut buf);
            if n <= 0 {
                break;
            }
            reads2.fetch_add(1, Ordering::SeqCst);
            if reads2.load(Ordering::SeqCst) == 1 {
                seen_first_write_count2.store(write_count.load(Ordering::SeqCst), Ordering::SeqCst);
            }
            rt.write(out, &buf[..n as usize]);
        }
        rt.close(out);
        Ok(())
    });
    let c = env.dag().add_node(
        "c",
        c_func,
        vec![Dependency::new(p.name.as_str(), "in", "")],
        None,
    );

    crate::run(env.clone(), &c.name).unwrap();

    // C's first observed byte came after P had written at least once.
    assert!(seen_first_write_count.load(Ordering::SeqCst) >= 1);
    assert_eq!(reads.load(Ordering::SeqCst), 2);

    let out_pipe = env.piper().get_existing_pipe(&c.name, "").unwrap();
    assert_eq!(drain(&out_pipe), b"ab");
}

/// Merge: two value nodes feeding the same input slot concatenate in
/// dependency-list order, not completion order.
#[test]
fn s3_merge_preserves_dependency_order() {
    let env = fresh_env();
    let v1 = add_value_node(&env, b"one", None).unwrap();
    let v2 = add_value_node(&env, b"two", None).unwrap();

    let c_func: ActorFn = Arc::new(|rt| {
        let fd = rt.open_read("in");
        let out = rt.open_write("");
        let mut buf = [0u8; 8];
        loop {
            let n = rt.read(fd, &mut buf);
            if n <= 0 {
                break;
            }
            rt.write(out, &buf[..n as usize]);
        }
        rt.close(out);
        Ok(())
    });
    let c = env.dag().add_node(
        "c",
        c_func,
        vec![
            Dependency::new(v1.name.as_str(), "in", ""),
            Dependency::new(v2.name.as_str(), "in", ""),
        ],
        None,
    );

    crate::run(env.clone(), &c.name).unwrap();

    let out_pipe = env.piper().get_existing_pipe(&c.name, "").unwrap();
    assert_eq!(drain(&out_pipe), b"onetwo");
}

/// Dynamic extension: while the run is in progress, an actor grows an
/// alias that a still-pending sibling depends on. The scheduler must
/// notice the DAG-hash change and re-plan rather than building the
/// sibling against a stale dependency snapshot.
#[test]
fn s4_dynamic_extension_triggers_replan() {
    let env = fresh_env();
    let v1 = add_value_node(&env, b"x", None).unwrap();
    env.dag().alias(".extra", Some(&v1.name)).unwrap();

    let trigger_func: ActorFn = Arc::new(|rt| {
        let handle = rt.dagops().add_value_node(b"y", None)?;
        rt.dagops().alias_handle(".extra", handle)?;
        Ok(())
    });
    let trigger = env.dag().add_node("trigger", trigger_func, vec![], None);

    let t_func: ActorFn = Arc::new(|rt| {
        let fd = rt.open_read("in");
        let out = rt.open_write("");
        let mut buf = [0u8; 8];
        loop {
            let n = rt.read(fd, &mut buf);
            if n <= 0 {
                break;
            }
            rt.write(out, &buf[..n as usize]);
        }
        rt.close(out);
        Ok(())
    });
    let t = env.dag().add_node(
        "t",
        t_func,
        vec![
            Dependency::new(trigger.name.as_str(), "trigger", ""),
            Dependency::new(".extra", "in", ""),
        ],
        None,
    );

    crate::run(env.clone(), &t.name).unwrap();

    assert!(env.is_node_finished(&trigger.name));
    assert!(env.is_node_finished(&t.name));
    assert_eq!(env.completion_code(&t.name), Some(0));

    let out_pipe = env.piper().get_existing_pipe(&t.name, "").unwrap();
    // T only becomes buildable once the dynamically-added value node (the
    // second member of `.extra`) is finished, so its output must include it.
    assert_eq!(drain(&out_pipe), b"xy");
}

/// Error propagation: once a writer is put into an error state, every
/// reader's next read observes the same errno, and the failure latches
/// onto the environment's overall exit code.
#[test]
fn s5_error_propagates_to_reader_and_environment() {
    let env = fresh_env();

    let p_func: ActorFn = Arc::new(|rt| {
        let fd = rt.open_write("");
        rt.write(fd, b"abc");
        rt.set_errno(32); // EPIPE; propagated to the still-open writer by destroy()
        Ok(())
    });
    let p = env.dag().add_node("p", p_func, vec![], None);

    let first_read = Arc::new(Mutex::new(Vec::new()));
    let first_read2 = first_read.clone();
    let second_errno = Arc::new(AtomicI32::new(0));
    let second_errno2 = second_errno.clone();

    let c_func: ActorFn = Arc::new(move |rt| {
        let fd = rt.open_read("in");
        let mut buf = [0u8; 16];
        let n = rt.read(fd, &mut buf);
        if n > 0 {
            first_read2.lock().extend_from_slice(&buf[..n as usize]);
        }
        let n2 = rt.read(fd, &mut buf);
        if n2 < 0 {
            second_errno2.store(rt.get_errno(), Ordering::SeqCst);
        }
        Ok(())
    });
    let c = env.dag().add_node(
        "c",
        c_func,
        vec![Dependency::new(p.name.as_str(), "in", "")],
        None,
    );

    crate::run(env.clone(), &c.name).unwrap();

    assert_eq!(&*first_read.lock(), b"abc");
    assert_eq!(second_errno.load(Ordering::SeqCst), 32);
    assert_ne!(env.completion_code(&c.name).unwrap(), 0);
    assert_eq!(env.get_errno(), 32);
}

/// Cycle: a target whose ancestor set contains a cycle fails fast with a
/// cycle error, before any pipe is ever created.
#[test]
fn s6_cycle_fails_fast_without_creating_pipes() {
    let env = fresh_env();
    let a = env.dag().add_node("a", noop(), vec![], None);
    let b = env
        .dag()
        .add_node("b", noop(), vec![Dependency::new(a.name.as_str(), "in", "")], None);
    env.dag()
        .depend(&a.name, vec![Dependency::new(b.name.as_str(), "in", "")])
        .unwrap();

    let err = crate::run(env.clone(), &a.name).unwrap_err();
    assert!(matches!(err, crate::ExecutionError::Cycle(_)));

    assert!(env.piper().get_existing_pipe(&a.name, "").is_err());
    assert!(env.piper().get_existing_pipe(&b.name, "").is_err());
    assert_eq!(env.completion_code(&a.name), None);
    assert_eq!(env.completion_code(&b.name), None);

    let _ = PipeMode::Write; // referenced for symmetry with the other scenarios' pipe setup
}
