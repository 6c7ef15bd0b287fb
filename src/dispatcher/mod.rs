//! Sending requests to remote nodes.

pub mod sim;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Kuid, RequestSpecific, ResponseSpecific};
use crate::{Error, Result};

/// Callbacks for one request, exactly one of them is called per request.
pub trait ResponseHandler: Send + Sync {
    fn response(&self, response: ResponseSpecific);

    /// The remote node did not respond in time.
    fn timeout(&self, node_id: Option<Kuid>, address: SocketAddr, elapsed: Duration);

    /// Sending the request or reading the response failed.
    fn error(&self, node_id: Option<Kuid>, address: SocketAddr, error: Error);
}

/// Sends requests and routes responses, timeouts and errors back to the
/// request's [ResponseHandler].
pub trait MessageDispatcher: Debug + Send + Sync {
    /// Send `request` to `destination`, `node_id` is the expected id of the
    /// remote node if known.
    ///
    /// An `Err` means the handler will not be called.
    fn send(
        &self,
        node_id: Option<Kuid>,
        destination: SocketAddr,
        request: RequestSpecific,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<()>;
}
