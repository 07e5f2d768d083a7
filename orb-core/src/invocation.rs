//! Client-side invocation: pending-request tracking and proxies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::error::OrbError;
use crate::frame::{Message, ReplyBody, ReplyFrame, RequestFrame};
use crate::identity::Identity;
use crate::message::{OperationMode, ReplyStatus};
use crate::stream::OutputStream;

// ── RequestRegistry ──────────────────────────────────────────────

type ReplyResult = Result<ReplyFrame, OrbError>;

struct PendingRequest {
    tx: oneshot::Sender<ReplyResult>,
    sent_at: Instant,
    /// `None` means the request never expires.
    deadline: Option<Duration>,
    operation: String,
}

impl PendingRequest {
    fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => self.sent_at.elapsed() > d,
            None => false,
        }
    }
}

/// Outstanding two-way requests keyed by `request_id`.
///
/// Ids are allocated here, never reused while pending, and 0 is
/// reserved for oneway requests.
#[derive(Default)]
pub struct RequestRegistry {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        RequestRegistry {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and register the reply slot for it.
    pub fn register(
        &self,
        operation: &str,
        deadline: Option<Duration>,
    ) -> (u32, oneshot::Receiver<ReplyResult>) {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == 0 {
            // Wrapped around; 0 stays reserved for oneway.
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("registry lock poisoned").insert(
            id,
            PendingRequest {
                tx,
                sent_at: Instant::now(),
                deadline,
                operation: operation.to_string(),
            },
        );
        (id, rx)
    }

    /// Deliver a reply to its waiter. Returns `false` for unknown or
    /// already-expired ids.
    pub fn complete(&self, request_id: u32, reply: ReplyFrame) -> bool {
        let pending = self
            .pending
            .lock()
            .expect("registry lock poisoned")
            .remove(&request_id);
        match pending {
            Some(p) => p.tx.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("registry lock poisoned").len()
    }

    /// Remove expired requests, failing each with a timeout error.
    /// Returns how many were expired.
    pub fn drain_expired(&self) -> usize {
        let mut pending = self.pending.lock().expect("registry lock poisoned");
        let expired: Vec<u32> = pending
            .iter()
            .filter(|(_, p)| p.is_expired())
            .map(|(&id, _)| id)
            .collect();
        for id in &expired {
            if let Some(p) = pending.remove(id) {
                debug!(request_id = id, operation = %p.operation, "request timed out");
                let deadline = p.deadline.unwrap_or_default();
                let _ = p.tx.send(Err(OrbError::Timeout(deadline)));
            }
        }
        expired.len()
    }

    /// Fail every outstanding request. Called when the connection is
    /// lost; waiters see the failure instead of hanging.
    pub fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("registry lock poisoned");
        for (_, p) in pending.drain() {
            let _ = p.tx.send(Err(OrbError::ConnectionLost));
        }
    }
}

// ── Proxy ────────────────────────────────────────────────────────

/// Client-side handle to one remote object over one connection.
pub struct Proxy {
    identity: Identity,
    facet: String,
    connection: Connection,
    context: HashMap<String, String>,
    timeout: Option<Duration>,
    batch: Mutex<Vec<RequestFrame>>,
}

impl Proxy {
    pub fn new(connection: Connection, identity: Identity) -> Self {
        Proxy {
            identity,
            facet: String::new(),
            connection,
            context: HashMap::new(),
            timeout: None,
            batch: Mutex::new(Vec::new()),
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn frame(&self, request_id: u32, operation: &str, mode: OperationMode, params: Bytes) -> RequestFrame {
        RequestFrame {
            request_id,
            identity: self.identity.clone(),
            facet: self.facet.clone(),
            operation: operation.to_string(),
            mode,
            context: self.context.clone(),
            params,
        }
    }

    /// Two-way invocation: send, await the reply frame.
    pub async fn invoke_raw(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
    ) -> Result<ReplyFrame, OrbError> {
        let (request_id, rx) = self.connection.registry().register(operation, self.timeout);
        let frame = self.frame(request_id, operation, mode, params);
        self.connection.send(Message::Request(frame)).await?;
        let reply = rx.await??;
        Ok(reply)
    }

    /// Two-way invocation mapped to a result encapsulation. Not-exist
    /// and unknown-exception replies become errors; a user-exception
    /// reply surfaces as [`OrbError::UserException`] (use
    /// [`invoke_raw`] to decode the exception body).
    ///
    /// [`invoke_raw`]: Proxy::invoke_raw
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
    ) -> Result<Bytes, OrbError> {
        let reply = self.invoke_raw(operation, mode, params).await?;
        match (reply.status, reply.body) {
            (ReplyStatus::Ok, ReplyBody::Results(encaps)) => Ok(encaps),
            (ReplyStatus::UserException, _) => Err(OrbError::UserException),
            (ReplyStatus::ObjectNotExist, _) => Err(OrbError::ObjectNotExist {
                identity: self.identity.to_string(),
            }),
            (ReplyStatus::FacetNotExist, _) => Err(OrbError::FacetNotExist {
                identity: self.identity.to_string(),
                facet: self.facet.clone(),
            }),
            (ReplyStatus::OperationNotExist, _) => Err(OrbError::OperationNotExist {
                identity: self.identity.to_string(),
                operation: operation.to_string(),
            }),
            (_, ReplyBody::Unknown(message)) => Err(OrbError::UnknownException(message)),
            _ => Err(OrbError::ProtocolViolation("malformed reply body")),
        }
    }

    /// Fire-and-forget invocation; no reply is ever produced.
    pub async fn invoke_oneway(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
    ) -> Result<(), OrbError> {
        let frame = self.frame(0, operation, mode, params);
        self.connection.send(Message::Request(frame)).await
    }

    /// Queue a oneway invocation locally; nothing hits the network
    /// until [`flush_batch`].
    ///
    /// [`flush_batch`]: Proxy::flush_batch
    pub fn enqueue_batch(&self, operation: &str, mode: OperationMode, params: Bytes) {
        let frame = self.frame(0, operation, mode, params);
        self.batch.lock().expect("batch lock poisoned").push(frame);
    }

    /// Send every queued invocation as one batch message — a single
    /// network write containing the concatenated frames, in enqueue
    /// order. A flush with an empty queue is a no-op.
    pub async fn flush_batch(&self) -> Result<(), OrbError> {
        let frames = std::mem::take(&mut *self.batch.lock().expect("batch lock poisoned"));
        if frames.is_empty() {
            return Ok(());
        }
        self.connection.send(Message::BatchRequest(frames)).await
    }

    /// Reachability probe: a no-op twoway invocation every servant
    /// understands is not required here; the operation simply has to
    /// resolve. Errors map like any other invocation.
    pub async fn ping(&self) -> Result<(), OrbError> {
        let mut os = OutputStream::new();
        os.write_empty_encapsulation();
        self.invoke("ping", OperationMode::Nonmutating, os.finished())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_reply(id: u32) -> ReplyFrame {
        let mut os = OutputStream::new();
        os.write_empty_encapsulation();
        ReplyFrame::ok(id, os.finished())
    }

    #[test]
    fn register_complete_roundtrip() {
        let registry = RequestRegistry::new();
        let (id, mut rx) = registry.register("op", None);
        assert!(id != 0);
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.complete(id, empty_reply(id)));
        assert_eq!(registry.pending_count(), 0);
        assert!(rx.try_recv().unwrap().is_ok());

        // Unknown id after completion.
        assert!(!registry.complete(id, empty_reply(id)));
    }

    #[test]
    fn ids_are_unique_and_never_zero() {
        let registry = RequestRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let (id, _rx) = registry.register("op", None);
            assert!(id != 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn expired_requests_fail_with_timeout() {
        let registry = RequestRegistry::new();
        let (_id, mut rx) = registry.register("slow", Some(Duration::ZERO));
        let (_id2, mut rx2) = registry.register("patient", None);
        std::thread::sleep(Duration::from_millis(1));

        assert_eq!(registry.drain_expired(), 1);
        assert!(matches!(rx.try_recv().unwrap(), Err(OrbError::Timeout(_))));
        // The deadline-free request is untouched.
        assert!(rx2.try_recv().is_err());
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn fail_all_notifies_every_waiter() {
        let registry = RequestRegistry::new();
        let (_a, mut rx_a) = registry.register("a", None);
        let (_b, mut rx_b) = registry.register("b", None);

        registry.fail_all();
        assert!(matches!(rx_a.try_recv().unwrap(), Err(OrbError::ConnectionLost)));
        assert!(matches!(rx_b.try_recv().unwrap(), Err(OrbError::ConnectionLost)));
        assert_eq!(registry.pending_count(), 0);
    }
}
