//! Server-side dispatch: identity resolution, operation lookup, and
//! async reply completion.
//!
//! Servants expose a tagged operation table instead of an inheritance
//! hierarchy; the adapter resolves `(identity, facet, operation)`,
//! checks the declared mode against the caller's, and runs the
//! handler. Handlers answer through a [`Responder`], immediately or
//! from another task, and the outcome travels up the stack as a value
//! — there is no sentinel error for "the response was already sent".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::OrbError;
use crate::frame::{Message, ReplyFrame, RequestFrame};
use crate::identity::Identity;
use crate::message::OperationMode;
use crate::stream::InputStream;

// ── Current ──────────────────────────────────────────────────────

/// Per-invocation context handed to every operation handler.
#[derive(Debug, Clone)]
pub struct Current {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: HashMap<String, String>,
    pub request_id: u32,
}

impl Current {
    fn from_request(request: &RequestFrame) -> Self {
        Current {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
            mode: request.mode,
            context: request.context.clone(),
            request_id: request.request_id,
        }
    }
}

// ── Responder ────────────────────────────────────────────────────

/// Completion handle for one invocation.
///
/// Cloneable and callable from any task. Only the first completion
/// wins; later calls are no-ops returning `false`.
#[derive(Clone)]
pub struct Responder {
    request_id: u32,
    slot: Arc<Mutex<Option<oneshot::Sender<ReplyFrame>>>>,
}

impl Responder {
    pub fn new(request_id: u32) -> (Self, oneshot::Receiver<ReplyFrame>) {
        let (tx, rx) = oneshot::channel();
        let responder = Responder {
            request_id,
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (responder, rx)
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Complete successfully with a marshaled out-params encapsulation.
    pub fn complete(&self, out_params: Bytes) -> bool {
        self.finish(ReplyFrame::ok(self.request_id, out_params))
    }

    /// Complete with a marshaled user-exception encapsulation.
    pub fn complete_with_exception(&self, exception: Bytes) -> bool {
        self.finish(ReplyFrame::user_exception(self.request_id, exception))
    }

    /// Complete with an error mapped onto the reply taxonomy.
    pub fn complete_with_error(&self, err: &OrbError) -> bool {
        self.finish(ReplyFrame::from_error(self.request_id, err))
    }

    fn finish(&self, reply: ReplyFrame) -> bool {
        let sender = self.slot.lock().expect("responder lock poisoned").take();
        match sender {
            // The receiver may be gone (connection closed); the
            // completion itself still counts.
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }
}

// ── Operations / Servant ─────────────────────────────────────────

/// Handler signature: read in-params from the stream, answer through
/// the responder (now or later). Returning an error produces an error
/// reply for the caller.
pub type Handler =
    Box<dyn Fn(&Current, &mut InputStream<'_>, Responder) -> Result<(), OrbError> + Send + Sync>;

pub struct Operation {
    pub mode: OperationMode,
    handler: Handler,
}

/// Name-keyed operation table. A servant is its table plus whatever
/// state the handlers capture.
#[derive(Default)]
pub struct OperationTable {
    ops: HashMap<&'static str, Operation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(mut self, name: &'static str, mode: OperationMode, handler: F) -> Self
    where
        F: Fn(&Current, &mut InputStream<'_>, Responder) -> Result<(), OrbError>
            + Send
            + Sync
            + 'static,
    {
        self.ops.insert(
            name,
            Operation {
                mode,
                handler: Box::new(handler),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.ops.get(name)
    }
}

pub trait Servant: Send + Sync {
    fn operations(&self) -> &OperationTable;
}

// ── DispatchOutcome ──────────────────────────────────────────────

/// How a dispatch ended, as a value travelling up the stack.
pub enum DispatchOutcome {
    /// The reply is ready now.
    Completed(ReplyFrame),
    /// The handler kept its responder; the reply arrives on the
    /// receiver later.
    Pending(oneshot::Receiver<ReplyFrame>),
}

// ── Interceptors ─────────────────────────────────────────────────

/// The continuation an interceptor wraps.
pub type DispatchFn<'a> = dyn Fn(&RequestFrame) -> Result<DispatchOutcome, OrbError> + 'a;

/// Wraps every dispatch uniformly: logging, authorization, metrics.
/// Whatever an interceptor returns is still a plain outcome or error;
/// nothing it does can leak a sentinel past the transport boundary.
pub trait DispatchInterceptor: Send + Sync {
    fn intercept(
        &self,
        request: &RequestFrame,
        next: &DispatchFn<'_>,
    ) -> Result<DispatchOutcome, OrbError>;
}

// ── ObjectAdapter ────────────────────────────────────────────────

type FacetMap = HashMap<String, Arc<dyn Servant>>;

/// Holds the servant map of one listening endpoint and turns incoming
/// request frames into replies.
pub struct ObjectAdapter {
    name: String,
    servants: RwLock<HashMap<Identity, FacetMap>>,
    interceptors: Vec<Arc<dyn DispatchInterceptor>>,
}

impl ObjectAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        ObjectAdapter {
            name: name.into(),
            servants: RwLock::new(HashMap::new()),
            interceptors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install an interceptor around every dispatch. Interceptors run
    /// outermost-first in installation order.
    pub fn add_interceptor(&mut self, interceptor: Arc<dyn DispatchInterceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Register a servant under the default facet.
    pub fn add(&self, identity: Identity, servant: Arc<dyn Servant>) -> Result<(), OrbError> {
        self.add_facet(identity, "", servant)
    }

    /// Register a servant under an explicit facet. Registration is
    /// unique per `(identity, facet)`.
    pub fn add_facet(
        &self,
        identity: Identity,
        facet: &str,
        servant: Arc<dyn Servant>,
    ) -> Result<(), OrbError> {
        if identity.is_null() {
            return Err(OrbError::InvalidIdentity("null identity".to_string()));
        }
        let mut map = self.servants.write().expect("servant map poisoned");
        let facets = map.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(OrbError::ServantAlreadyRegistered {
                identity: identity.to_string(),
                facet: facet.to_string(),
            });
        }
        facets.insert(facet.to_string(), servant);
        Ok(())
    }

    /// Remove a registration, returning the servant if it was present.
    pub fn remove(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let mut map = self.servants.write().expect("servant map poisoned");
        let facets = map.get_mut(identity)?;
        let servant = facets.remove(facet);
        if facets.is_empty() {
            map.remove(identity);
        }
        servant
    }

    pub fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.servants
            .read()
            .expect("servant map poisoned")
            .get(identity)?
            .get(facet)
            .cloned()
    }

    fn resolve(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>, OrbError> {
        let map = self.servants.read().expect("servant map poisoned");
        let facets = map.get(identity).ok_or_else(|| OrbError::ObjectNotExist {
            identity: identity.to_string(),
        })?;
        facets
            .get(facet)
            .cloned()
            .ok_or_else(|| OrbError::FacetNotExist {
                identity: identity.to_string(),
                facet: facet.to_string(),
            })
    }

    /// Dispatch a request through the interceptor chain. Errors are
    /// already folded into an error reply here; the connection layer
    /// only decides whether a reply gets written at all (twoway) or
    /// dropped (oneway).
    pub fn dispatch(&self, request: &RequestFrame) -> DispatchOutcome {
        match self.dispatch_chain(request, 0) {
            Ok(outcome) => outcome,
            Err(err) => DispatchOutcome::Completed(ReplyFrame::from_error(request.request_id, err.as_ref())),
        }
    }

    fn dispatch_chain(
        &self,
        request: &RequestFrame,
        depth: usize,
    ) -> Result<DispatchOutcome, Box<OrbError>> {
        match self.interceptors.get(depth) {
            Some(interceptor) => {
                let next = |req: &RequestFrame| {
                    self.dispatch_chain(req, depth + 1).map_err(|e| *e)
                };
                interceptor.intercept(request, &next).map_err(Box::new)
            }
            None => self.dispatch_inner(request).map_err(Box::new),
        }
    }

    fn dispatch_inner(&self, request: &RequestFrame) -> Result<DispatchOutcome, OrbError> {
        let servant = self.resolve(&request.identity, &request.facet)?;
        let operation =
            servant
                .operations()
                .get(&request.operation)
                .ok_or_else(|| OrbError::OperationNotExist {
                    identity: request.identity.to_string(),
                    operation: request.operation.clone(),
                })?;

        if !operation.mode.accepts_call(request.mode) {
            return Err(OrbError::OperationModeMismatch {
                operation: request.operation.clone(),
                declared: operation.mode.as_str(),
                called: request.mode.as_str(),
            });
        }

        let current = Current::from_request(request);
        let (responder, mut rx) = Responder::new(request.request_id);
        let mut is = InputStream::new(&request.params);
        (operation.handler)(&current, &mut is, responder)?;

        match rx.try_recv() {
            Ok(reply) => Ok(DispatchOutcome::Completed(reply)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(DispatchOutcome::Pending(rx)),
            // Every responder clone was dropped without completing.
            Err(oneshot::error::TryRecvError::Closed) => Err(OrbError::UnknownException(
                "dispatch finished without a reply".to_string(),
            )),
        }
    }

    /// Dispatch batched oneway requests strictly in enqueue order.
    /// Failures are logged and never answered; the batch never
    /// produces replies.
    pub fn dispatch_batch(&self, requests: &[RequestFrame]) {
        for request in requests {
            if let DispatchOutcome::Completed(reply) = self.dispatch(request) {
                if !matches!(reply.status, crate::message::ReplyStatus::Ok) {
                    warn!(
                        adapter = %self.name,
                        operation = %request.operation,
                        status = %reply.status,
                        "batched dispatch failed"
                    );
                }
            }
        }
    }

    /// Handle any incoming message on the server side, producing the
    /// message to write back, if any.
    pub async fn handle(&self, message: Message) -> Result<Option<Message>, OrbError> {
        match message {
            Message::Request(request) => {
                let twoway = !request.is_oneway();
                let reply = match self.dispatch(&request) {
                    DispatchOutcome::Completed(reply) => reply,
                    DispatchOutcome::Pending(rx) => rx.await?,
                };
                Ok(twoway.then(|| Message::Reply(reply)))
            }
            Message::BatchRequest(requests) => {
                self.dispatch_batch(&requests);
                Ok(None)
            }
            Message::Reply(_) => Err(OrbError::ProtocolViolation("reply sent to server")),
            Message::ValidateConnection => Ok(None),
            Message::CloseConnection => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::OutputStream;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Counter {
        table: OperationTable,
    }

    impl Counter {
        fn new() -> Self {
            let count = Arc::new(AtomicI64::new(0));

            let add_count = count.clone();
            let read_count = count.clone();
            let table = OperationTable::new()
                .add("increment", OperationMode::Normal, move |_, is, responder| {
                    is.start_encapsulation()?;
                    let delta = is.read_i32()? as i64;
                    is.end_encapsulation()?;
                    let value = add_count.fetch_add(delta, Ordering::SeqCst) + delta;
                    responder.complete(ok_body(value));
                    Ok(())
                })
                .add("value", OperationMode::Idempotent, move |_, is, responder| {
                    is.skip_encapsulation()?;
                    responder.complete(ok_body(read_count.load(Ordering::SeqCst)));
                    Ok(())
                })
                .add("defer", OperationMode::Normal, |_, is, responder| {
                    is.skip_encapsulation()?;
                    // Completion happens later, from another task.
                    std::thread::spawn(move || {
                        responder.complete(ok_body(7));
                    });
                    Ok(())
                });
            Counter { table }
        }
    }

    impl Servant for Counter {
        fn operations(&self) -> &OperationTable {
            &self.table
        }
    }

    fn ok_body(value: i64) -> Bytes {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_i64(value);
        os.end_encapsulation().unwrap();
        os.finished()
    }

    fn empty_params() -> Bytes {
        let mut os = OutputStream::new();
        os.write_empty_encapsulation();
        os.finished()
    }

    fn params_i32(v: i32) -> Bytes {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_i32(v);
        os.end_encapsulation().unwrap();
        os.finished()
    }

    fn request(identity: &str, facet: &str, operation: &str, mode: OperationMode, params: Bytes) -> RequestFrame {
        RequestFrame {
            request_id: 1,
            identity: identity.parse().unwrap(),
            facet: facet.to_string(),
            operation: operation.to_string(),
            mode,
            context: HashMap::new(),
            params,
        }
    }

    fn adapter_with_counter() -> ObjectAdapter {
        let adapter = ObjectAdapter::new("test");
        adapter
            .add("demo/counter".parse().unwrap(), Arc::new(Counter::new()))
            .unwrap();
        adapter
    }

    fn completed_status(outcome: DispatchOutcome) -> crate::message::ReplyStatus {
        match outcome {
            DispatchOutcome::Completed(reply) => reply.status,
            DispatchOutcome::Pending(_) => panic!("unexpected pending dispatch"),
        }
    }

    #[test]
    fn successful_dispatch() {
        let adapter = adapter_with_counter();
        let req = request("demo/counter", "", "increment", OperationMode::Normal, params_i32(5));
        let DispatchOutcome::Completed(reply) = adapter.dispatch(&req) else {
            panic!("expected completed");
        };
        assert_eq!(reply.status, crate::message::ReplyStatus::Ok);
        let crate::frame::ReplyBody::Results(body) = &reply.body else {
            panic!("expected results");
        };
        let mut is = InputStream::new(body);
        is.start_encapsulation().unwrap();
        assert_eq!(is.read_i64().unwrap(), 5);
    }

    #[test]
    fn resolution_failures_map_to_statuses() {
        use crate::message::ReplyStatus;
        let adapter = adapter_with_counter();

        let req = request("demo/other", "", "value", OperationMode::Idempotent, empty_params());
        assert_eq!(completed_status(adapter.dispatch(&req)), ReplyStatus::ObjectNotExist);

        let req = request("demo/counter", "admin", "value", OperationMode::Idempotent, empty_params());
        assert_eq!(completed_status(adapter.dispatch(&req)), ReplyStatus::FacetNotExist);

        let req = request("demo/counter", "", "reset", OperationMode::Normal, empty_params());
        assert_eq!(completed_status(adapter.dispatch(&req)), ReplyStatus::OperationNotExist);
    }

    #[test]
    fn mode_mismatch_rejected_except_nonmutating_on_idempotent() {
        use crate::message::ReplyStatus;
        let adapter = adapter_with_counter();

        // Tolerated: nonmutating call on an idempotent operation.
        let req = request("demo/counter", "", "value", OperationMode::Nonmutating, empty_params());
        assert_eq!(completed_status(adapter.dispatch(&req)), ReplyStatus::Ok);

        // Rejected: normal call on an idempotent operation.
        let req = request("demo/counter", "", "value", OperationMode::Normal, empty_params());
        assert_eq!(
            completed_status(adapter.dispatch(&req)),
            ReplyStatus::UnknownException
        );
    }

    #[test]
    fn duplicate_registration_rejected_and_remove_frees_slot() {
        let adapter = adapter_with_counter();
        let identity: Identity = "demo/counter".parse().unwrap();

        let err = adapter.add(identity.clone(), Arc::new(Counter::new())).unwrap_err();
        assert!(matches!(err, OrbError::ServantAlreadyRegistered { .. }));

        assert!(adapter.remove(&identity, "").is_some());
        assert!(adapter.find(&identity, "").is_none());
        adapter.add(identity, Arc::new(Counter::new())).unwrap();
    }

    #[test]
    fn pending_dispatch_completes_later() {
        let adapter = adapter_with_counter();
        let req = request("demo/counter", "", "defer", OperationMode::Normal, empty_params());
        match adapter.dispatch(&req) {
            DispatchOutcome::Pending(rx) => {
                let reply = rx.blocking_recv().unwrap();
                assert_eq!(reply.status, crate::message::ReplyStatus::Ok);
            }
            DispatchOutcome::Completed(reply) => {
                // The spawned thread may win the race; same answer.
                assert_eq!(reply.status, crate::message::ReplyStatus::Ok);
            }
        }
    }

    #[test]
    fn duplicate_completion_is_noop() {
        let (responder, mut rx) = Responder::new(3);
        assert!(responder.complete(ok_body(1)));
        assert!(!responder.complete(ok_body(2)));
        assert!(!responder.complete_with_error(&OrbError::ConnectionLost));

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.status, crate::message::ReplyStatus::Ok);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_responder_yields_unknown_exception() {
        let adapter = ObjectAdapter::new("test");
        let table = OperationTable::new().add("noop", OperationMode::Normal, |_, _, responder| {
            drop(responder);
            Ok(())
        });
        struct Noop(OperationTable);
        impl Servant for Noop {
            fn operations(&self) -> &OperationTable {
                &self.0
            }
        }
        adapter.add("x".parse().unwrap(), Arc::new(Noop(table))).unwrap();

        let req = request("x", "", "noop", OperationMode::Normal, empty_params());
        assert_eq!(
            completed_status(adapter.dispatch(&req)),
            crate::message::ReplyStatus::UnknownException
        );
    }

    #[test]
    fn interceptor_wraps_every_dispatch() {
        struct CountingInterceptor(AtomicI64);
        impl DispatchInterceptor for CountingInterceptor {
            fn intercept(
                &self,
                request: &RequestFrame,
                next: &DispatchFn<'_>,
            ) -> Result<DispatchOutcome, OrbError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                next(request)
            }
        }

        let mut adapter = adapter_with_counter();
        let interceptor = Arc::new(CountingInterceptor(AtomicI64::new(0)));
        adapter.add_interceptor(interceptor.clone());

        let req = request("demo/counter", "", "value", OperationMode::Idempotent, empty_params());
        adapter.dispatch(&req);
        let req = request("demo/missing", "", "value", OperationMode::Idempotent, empty_params());
        adapter.dispatch(&req);
        assert_eq!(interceptor.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_dispatches_in_order() {
        let adapter = adapter_with_counter();
        let reqs: Vec<RequestFrame> = (0..3)
            .map(|_| {
                let mut r = request("demo/counter", "", "increment", OperationMode::Normal, params_i32(1));
                r.request_id = 0;
                r
            })
            .collect();
        adapter.dispatch_batch(&reqs);

        let req = request("demo/counter", "", "value", OperationMode::Idempotent, empty_params());
        let DispatchOutcome::Completed(reply) = adapter.dispatch(&req) else {
            panic!("expected completed");
        };
        let crate::frame::ReplyBody::Results(body) = &reply.body else {
            panic!("expected results");
        };
        let mut is = InputStream::new(body);
        is.start_encapsulation().unwrap();
        assert_eq!(is.read_i64().unwrap(), 3);
    }
}
