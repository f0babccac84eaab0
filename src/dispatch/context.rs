//! Pooled per-request context, reused across requests to bound allocator
//! pressure under load. Exclusively owned by the handling task for the
//! request's lifetime; reset (never referenced again) on release.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start_time: Instant,
    pub endpoint_name: Option<String>,
    pub target_url: Option<String>,
    pub selection_ms: Option<u64>,
    pub backend_response_ms: Option<u64>,
    pub first_data_ms: Option<u64>,
    pub streaming_ms: Option<u64>,
    pub total_bytes: u64,
}

impl RequestContext {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            start_time: Instant::now(),
            endpoint_name: None,
            target_url: None,
            selection_ms: None,
            backend_response_ms: None,
            first_data_ms: None,
            streaming_ms: None,
            total_bytes: 0,
        }
    }

    /// Reset all fields for reuse by a new request. Does not touch
    /// `request_id`/`start_time`, which the pool always overwrites on
    /// checkout.
    pub fn reset(&mut self, request_id: String) {
        self.request_id = request_id;
        self.start_time = Instant::now();
        self.endpoint_name = None;
        self.target_url = None;
        self.selection_ms = None;
        self.backend_response_ms = None;
        self.first_data_ms = None;
        self.streaming_ms = None;
        self.total_bytes = 0;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// `0 <= selectionMs <= backendResponseMs <= firstDataMs <=
    /// streamingMs + firstDataMs <= latencyMs`.
    #[cfg(test)]
    pub fn phase_times_are_monotone(&self) -> bool {
        let selection = self.selection_ms.unwrap_or(0);
        let backend = self.backend_response_ms.unwrap_or(selection);
        let first_data = self.first_data_ms.unwrap_or(backend);
        let streaming = self.streaming_ms.unwrap_or(0);
        let latency = self.elapsed_ms();

        selection <= backend && backend <= first_data && first_data + streaming <= latency
    }
}

/// Bounded pool of [`RequestContext`]s, checked out per request and
/// returned on completion. A plain `Vec`-backed stack guarded by a mutex
/// is sufficient here: checkout/return is cheap and infrequent relative
/// to the request's own I/O.
pub struct RequestContextPool {
    free: parking_lot::Mutex<Vec<RequestContext>>,
}

impl RequestContextPool {
    pub fn new() -> Self {
        Self {
            free: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn checkout(&self, request_id: String) -> RequestContext {
        if let Some(mut context) = self.free.lock().pop() {
            context.reset(request_id);
            context
        } else {
            RequestContext::new(request_id)
        }
    }

    pub fn release(&self, context: RequestContext) {
        self.free.lock().push(context);
    }
}

impl Default for RequestContextPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_after_release_resets_fields() {
        let pool = RequestContextPool::new();
        let mut context = pool.checkout("req-1".to_string());
        context.total_bytes = 999;
        context.endpoint_name = Some("e1".to_string());
        pool.release(context);

        let reused = pool.checkout("req-2".to_string());
        assert_eq!(reused.request_id, "req-2");
        assert_eq!(reused.total_bytes, 0);
        assert!(reused.endpoint_name.is_none());
    }

    #[test]
    fn phase_times_monotone_holds_for_ordered_samples() {
        let mut context = RequestContext::new("req-1".to_string());
        context.selection_ms = Some(1);
        context.backend_response_ms = Some(5);
        context.first_data_ms = Some(10);
        context.streaming_ms = Some(2);
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(context.phase_times_are_monotone());
    }
}
