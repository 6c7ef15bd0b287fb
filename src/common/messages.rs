//! DHT request and response messages.
//!
//! Messages are plain values, encoding them on the wire is the job of a
//! [crate::dispatcher::MessageDispatcher] implementation.

use std::net::SocketAddr;

use crate::common::{Contact, DhtValueEntity, EntityKey, Kuid, SecurityToken};

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpecific {
    /// Contact of the requester, its address is where responses go.
    pub requester: Contact,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    Store(StoreRequestArguments),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindNodeRequestArguments {
    pub target: Kuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueRequestArguments {
    pub key: EntityKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequestArguments {
    pub token: Option<SecurityToken>,
    pub entities: Vec<DhtValueEntity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSpecific {
    pub responder: Contact,
    pub response_type: ResponseTypeSpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseTypeSpecific {
    Pong(PongResponseArguments),
    /// Also the answer to a FIND_VALUE request when the responder has no value.
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
    Store(StoreResponseArguments),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PongResponseArguments {
    /// Our address as seen by the responder.
    pub external_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindNodeResponseArguments {
    pub token: Option<SecurityToken>,
    pub nodes: Vec<Contact>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueResponseArguments {
    pub token: Option<SecurityToken>,
    pub entities: Vec<DhtValueEntity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponseArguments {
    pub statuses: Vec<(EntityKey, StoreStatus)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Success,
    Failure,
}

impl RequestSpecific {
    pub fn new(requester: Contact, request_type: RequestTypeSpecific) -> Self {
        RequestSpecific {
            requester,
            request_type,
        }
    }

    /// Short name of the request kind, used in logs and request counters.
    pub fn kind(&self) -> RequestKind {
        match self.request_type {
            RequestTypeSpecific::Ping => RequestKind::Ping,
            RequestTypeSpecific::FindNode(_) => RequestKind::FindNode,
            RequestTypeSpecific::FindValue(_) => RequestKind::FindValue,
            RequestTypeSpecific::Store(_) => RequestKind::Store,
        }
    }
}

impl ResponseSpecific {
    /// Security token carried by a lookup response.
    pub fn token(&self) -> Option<&SecurityToken> {
        match &self.response_type {
            ResponseTypeSpecific::FindNode(args) => args.token.as_ref(),
            ResponseTypeSpecific::FindValue(args) => args.token.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    FindNode,
    FindValue,
    Store,
}
