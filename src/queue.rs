//! Bounded queue of pending requests for the next batch.

use crate::error::DispatchError;

/// Invoked once with the result of its request.
pub type Callback<'cb, R> = Box<dyn FnOnce(&R) + 'cb>;

pub struct QueuedRequest<'cb, R> {
    pub payload: String,
    pub callback: Option<Callback<'cb, R>>,
}

/// Insertion-ordered, capacity-limited request list.
pub struct RequestQueue<'cb, R> {
    items: Vec<QueuedRequest<'cb, R>>,
    limit: usize,
}

impl<'cb, R> RequestQueue<'cb, R> {
    pub fn new(limit: usize) -> Self {
        Self {
            items: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Append a request. On error the queue is unchanged.
    pub fn push(
        &mut self,
        payload: String,
        callback: Option<Callback<'cb, R>>,
    ) -> Result<(), DispatchError> {
        if self.items.len() >= self.limit {
            return Err(DispatchError::QueueFull { limit: self.limit });
        }
        if payload.is_empty() {
            return Err(DispatchError::EmptyPayload);
        }
        self.items.push(QueuedRequest { payload, callback });
        Ok(())
    }

    /// Take every queued request, leaving the queue empty.
    pub fn take(&mut self) -> Vec<QueuedRequest<'cb, R>> {
        std::mem::take(&mut self.items)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_until_full() {
        let mut q: RequestQueue<'_, String> = RequestQueue::new(2);
        q.push("a".into(), None).expect("first");
        q.push("b".into(), None).expect("second");

        let err = q.push("c".into(), None).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { limit: 2 }));
        assert_eq!(err.to_string(), "over 2 queued requests");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn full_check_precedes_payload_check() {
        let mut q: RequestQueue<'_, String> = RequestQueue::new(1);
        q.push("a".into(), None).expect("first");
        let err = q.push(String::new(), None).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { .. }));
    }

    #[test]
    fn empty_payload_rejected() {
        let mut q: RequestQueue<'_, String> = RequestQueue::new(4);
        let err = q.push(String::new(), Some(Box::new(|_| {}))).unwrap_err();
        assert!(matches!(err, DispatchError::EmptyPayload));
        assert!(q.is_empty());
    }

    #[test]
    fn take_preserves_insertion_order_and_empties() {
        let mut q: RequestQueue<'_, String> = RequestQueue::new(4);
        for p in ["one", "two", "three"] {
            q.push(p.into(), None).expect("push");
        }
        let taken: Vec<_> = q.take().into_iter().map(|r| r.payload).collect();
        assert_eq!(taken, ["one", "two", "three"]);
        assert!(q.is_empty());
        assert_eq!(q.limit(), 4);
    }
}
