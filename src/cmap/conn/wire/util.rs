use std::sync::atomic::{AtomicI32, Ordering};

/// Generator for the request ids used on a single connection.
///
/// Ids start at 1 when the connection is opened and are unique among the connection's in-flight
/// requests; they wrap back around to 1 after `i32::MAX` rather than going negative.
#[derive(Debug)]
pub(crate) struct RequestIdGenerator {
    next: AtomicI32,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }
}

impl RequestIdGenerator {
    #[cfg(test)]
    pub(crate) fn starting_at(id: i32) -> Self {
        Self {
            next: AtomicI32::new(id),
        }
    }

    /// Returns the next request id for this connection.
    pub(crate) fn next_id(&self) -> i32 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id == i32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or(1)
    }
}

/// Serializes `string` into `buf` with a null terminator appended.
pub(super) fn write_cstring(buf: &mut Vec<u8>, string: &str) {
    buf.extend_from_slice(string.as_bytes());
    buf.push(0);
}
