use std::sync::atomic::{AtomicI64, Ordering};

/// Single monotonic counter shared across a whole environment. Used for
/// pipe handles, node-name suffixes, and notification tokens alike —
/// anywhere a fresh, never-reused id is needed.
#[derive(Debug, Default)]
pub struct Seqno {
    next: AtomicI64,
}

impl Seqno {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Returns the current value and increments.
    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_and_distinct() {
        let seq = Seqno::new();
        let a = seq.next();
        let b = seq.next();
        let c = seq.next();
        assert!(a < b);
        assert!(b < c);
    }
}
