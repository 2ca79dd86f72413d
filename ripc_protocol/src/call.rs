use std::collections::BTreeMap;

use bytes::Bytes;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{Error, ErrorKind, Identity, Result};

/// Request context: ordered key/value pairs sent along with a call.
pub type Context = BTreeMap<String, String>;

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, Hash, EnumIter, EnumString, Primitive)]
pub enum InvocationMode {
    Twoway = 0,
    Oneway = 1,
    BatchOneway = 2,
    Datagram = 3,
    BatchDatagram = 4,
}

impl InvocationMode {
    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    pub fn is_batch(self) -> bool {
        matches!(
            self,
            InvocationMode::BatchOneway | InvocationMode::BatchDatagram
        )
    }

    pub fn is_datagram(self) -> bool {
        matches!(
            self,
            InvocationMode::Datagram | InvocationMode::BatchDatagram
        )
    }
}

impl Default for InvocationMode {
    fn default() -> Self {
        InvocationMode::Twoway
    }
}

/// Whether an operation may be executed more than once without harm.
#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString, Primitive)]
pub enum OperationMode {
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    pub fn is_idempotent(self) -> bool {
        self != OperationMode::Normal
    }
}

impl Default for OperationMode {
    fn default() -> Self {
        OperationMode::Normal
    }
}

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, Hash, EnumIter, EnumString, Serialize, Deserialize)]
pub enum EndpointSelection {
    Random,
    Ordered,
}

impl Default for EndpointSelection {
    fn default() -> Self {
        EndpointSelection::Random
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

/// One request as handed to a connection or a collocated adapter.
///
/// The payload holds the already-marshaled arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub payload: Bytes,
}

impl Request {
    pub fn new(identity: Identity, operation: &str) -> Self {
        Request {
            identity,
            facet: String::new(),
            operation: operation.to_owned(),
            mode: OperationMode::Normal,
            context: Context::new(),
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString, Primitive)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_byte(b: u8) -> Result<ReplyStatus> {
        ReplyStatus::from_u8(b).ok_or_else(|| {
            Error::new(ErrorKind::Marshal, format!("unknown reply status {}", b))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub payload: Bytes,
}

impl Reply {
    pub fn ok(payload: Bytes) -> Self {
        Reply {
            status: ReplyStatus::Ok,
            payload,
        }
    }

    /// Turns the "not found" and "unknown" statuses into errors; `Ok` and
    /// `UserException` replies are handed back to the caller for decoding.
    pub fn into_result(self, request: &Request) -> Result<Reply> {
        let not_found = |kind: ErrorKind, what: &str| {
            Error::new(
                kind,
                format!(
                    "{} `{}' of object `{}' does not exist",
                    what,
                    if kind == ErrorKind::FacetNotExist {
                        &request.facet
                    } else {
                        &request.operation
                    },
                    request.identity
                ),
            )
            .with_operation(request.operation.as_str())
        };
        match self.status {
            ReplyStatus::Ok | ReplyStatus::UserException => Ok(self),
            ReplyStatus::ObjectNotExist => Err(Error::object_not_exist(
                &request.identity,
                &request.facet,
                &request.operation,
            )),
            ReplyStatus::FacetNotExist => Err(not_found(ErrorKind::FacetNotExist, "facet")),
            ReplyStatus::OperationNotExist => {
                Err(not_found(ErrorKind::OperationNotExist, "operation"))
            }
            ReplyStatus::UnknownLocalException
            | ReplyStatus::UnknownUserException
            | ReplyStatus::UnknownException => Err(Error::new(
                ErrorKind::Unknown,
                String::from_utf8_lossy(&self.payload).into_owned(),
            )
            .with_operation(request.operation.as_str())),
        }
    }
}
