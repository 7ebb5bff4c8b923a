use std::sync::Arc;

use crate::env::Environment;
use crate::pipe::Pipe;

mod scenarios;

/// Reads an entire pipe to EOF. Panics if the pipe errors instead of
/// closing — every scenario here expects a clean end-of-stream.
pub(crate) fn drain(pipe: &Pipe) -> Vec<u8> {
    let reader = pipe.reader();
    let mut out = Vec::new();
    loop {
        let chunk = reader.read(4096).expect("pipe read failed in test");
        if chunk.is_empty() {
            break;
        }
        out.extend(chunk);
    }
    out
}

pub(crate) fn fresh_env() -> Arc<Environment> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Arc::new(Environment::new())
}
