//! Request and reply frame bodies.
//!
//! A frame is everything after the 14-byte [`Header`]; the codec pairs
//! the two and handles compression. Parameter and result payloads stay
//! opaque encapsulations here, decoded only by the servant or caller
//! that knows their types.
//!
//! [`Header`]: crate::header::Header

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{MarshalError, OrbError};
use crate::identity::Identity;
use crate::message::{MessageType, OperationMode, ReplyStatus};
use crate::stream::{InputStream, OutputStream};

// ── Requests ─────────────────────────────────────────────────────

/// A single invocation: target, operation, and marshaled parameters.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    /// Non-zero for two-way calls; 0 for oneway and batched calls,
    /// which never produce a reply.
    pub request_id: u32,
    pub identity: Identity,
    /// Facet name; empty selects the default facet.
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    /// Caller-supplied propagated metadata.
    pub context: HashMap<String, String>,
    /// In-parameters as an opaque encapsulation.
    pub params: Bytes,
}

impl RequestFrame {
    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    pub(crate) fn write_body(&self, os: &mut OutputStream) -> Result<(), MarshalError> {
        os.write_u32(self.request_id);
        self.identity.write(os);
        os.write_string(&self.facet);
        os.write_string(&self.operation);
        os.write_u8(self.mode as u8);
        os.write_context(&self.context);
        os.write_encapsulation(&self.params)
    }

    pub(crate) fn read_body(is: &mut InputStream<'_>) -> Result<Self, OrbError> {
        let request_id = is.read_u32()?;
        let identity = Identity::read(is)?;
        let facet = is.read_string()?;
        let operation = is.read_string()?;
        let mode = OperationMode::try_from(is.read_u8()?)?;
        let context = is.read_context()?;
        let params = Bytes::copy_from_slice(is.read_encapsulation_slice()?);
        Ok(RequestFrame {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }
}

// ── Replies ──────────────────────────────────────────────────────

/// Status-dependent reply payload.
#[derive(Debug, Clone)]
pub enum ReplyBody {
    /// `Ok` / `UserException`: a result or exception encapsulation.
    Results(Bytes),
    /// The not-exist statuses echo the unresolved target.
    NotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },
    /// The unknown-exception statuses carry a descriptive string.
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct ReplyFrame {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub body: ReplyBody,
}

impl ReplyFrame {
    pub fn ok(request_id: u32, results: Bytes) -> Self {
        ReplyFrame {
            request_id,
            status: ReplyStatus::Ok,
            body: ReplyBody::Results(results),
        }
    }

    pub fn user_exception(request_id: u32, exception: Bytes) -> Self {
        ReplyFrame {
            request_id,
            status: ReplyStatus::UserException,
            body: ReplyBody::Results(exception),
        }
    }

    /// Map a dispatch failure onto the reply taxonomy. Anything that
    /// is not a resolution failure becomes an unknown-exception reply
    /// so the caller still gets an answer.
    pub fn from_error(request_id: u32, err: &OrbError) -> Self {
        let (status, body) = match err {
            OrbError::ObjectNotExist { identity } => (
                ReplyStatus::ObjectNotExist,
                not_exist_body(identity, "", ""),
            ),
            OrbError::FacetNotExist { identity, facet } => (
                ReplyStatus::FacetNotExist,
                not_exist_body(identity, facet, ""),
            ),
            OrbError::OperationNotExist { identity, operation } => (
                ReplyStatus::OperationNotExist,
                not_exist_body(identity, "", operation),
            ),
            OrbError::Marshal(_) | OrbError::ProtocolViolation(_) => (
                ReplyStatus::UnknownLocalException,
                ReplyBody::Unknown(err.to_string()),
            ),
            _ => (ReplyStatus::UnknownException, ReplyBody::Unknown(err.to_string())),
        };
        ReplyFrame { request_id, status, body }
    }

    pub(crate) fn write_body(&self, os: &mut OutputStream) -> Result<(), MarshalError> {
        os.write_u32(self.request_id);
        os.write_u8(self.status as u8);
        match &self.body {
            ReplyBody::Results(encaps) => os.write_encapsulation(encaps),
            ReplyBody::NotExist { identity, facet, operation } => {
                identity.write(os);
                os.write_string(facet);
                os.write_string(operation);
                Ok(())
            }
            ReplyBody::Unknown(message) => {
                os.write_string(message);
                Ok(())
            }
        }
    }

    pub(crate) fn read_body(is: &mut InputStream<'_>) -> Result<Self, OrbError> {
        let request_id = is.read_u32()?;
        let status = ReplyStatus::try_from(is.read_u8()?)?;
        let body = if status.has_encapsulation() {
            ReplyBody::Results(Bytes::copy_from_slice(is.read_encapsulation_slice()?))
        } else if status.is_not_exist() {
            ReplyBody::NotExist {
                identity: Identity::read(is)?,
                facet: is.read_string()?,
                operation: is.read_string()?,
            }
        } else {
            ReplyBody::Unknown(is.read_string()?)
        };
        Ok(ReplyFrame { request_id, status, body })
    }
}

fn not_exist_body(identity: &str, facet: &str, operation: &str) -> ReplyBody {
    ReplyBody::NotExist {
        identity: identity.parse().unwrap_or_default(),
        facet: facet.to_string(),
        operation: operation.to_string(),
    }
}

// ── Messages ─────────────────────────────────────────────────────

/// A complete protocol message as seen by the codec.
#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestFrame),
    /// Oneway requests coalesced into one write. The batch produces no
    /// replies; its requests all carry id 0.
    BatchRequest(Vec<RequestFrame>),
    Reply(ReplyFrame),
    ValidateConnection,
    CloseConnection,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::BatchRequest(_) => MessageType::BatchRequest,
            Message::Reply(_) => MessageType::Reply,
            Message::ValidateConnection => MessageType::ValidateConnection,
            Message::CloseConnection => MessageType::CloseConnection,
        }
    }

    /// Serialize the body (everything after the header).
    pub fn write_body(&self, os: &mut OutputStream) -> Result<(), MarshalError> {
        match self {
            Message::Request(req) => req.write_body(os),
            Message::BatchRequest(reqs) => {
                os.write_size(reqs.len());
                for req in reqs {
                    req.write_body(os)?;
                }
                Ok(())
            }
            Message::Reply(reply) => reply.write_body(os),
            Message::ValidateConnection | Message::CloseConnection => Ok(()),
        }
    }

    /// Parse the body for the given message type.
    pub fn read_body(message_type: MessageType, body: &[u8]) -> Result<Self, OrbError> {
        let mut is = InputStream::new(body);
        let msg = match message_type {
            MessageType::Request => Message::Request(RequestFrame::read_body(&mut is)?),
            MessageType::BatchRequest => {
                let count = is.read_and_check_seq_size(1)?;
                let mut reqs = Vec::with_capacity(count);
                for _ in 0..count {
                    reqs.push(RequestFrame::read_body(&mut is)?);
                }
                Message::BatchRequest(reqs)
            }
            MessageType::Reply => Message::Reply(ReplyFrame::read_body(&mut is)?),
            MessageType::ValidateConnection => Message::ValidateConnection,
            MessageType::CloseConnection => Message::CloseConnection,
        };
        if is.remaining() != 0 {
            return Err(OrbError::ProtocolViolation("trailing bytes after message body"));
        }
        Ok(msg)
    }
}
