//! Response handlers, the [crate::concurrent::DhtTask]s talking to remote nodes.

mod lookup;
mod ping;
mod security_token;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

pub use lookup::*;
pub use ping::*;
pub use security_token::*;
pub use store::*;

use crate::common::{Kuid, RequestSpecific};
use crate::context::Context;
use crate::dispatcher::ResponseHandler;

/// Send through the context's dispatcher, a refused send is reported to the
/// handler as an error.
pub(crate) fn send(
    context: &Context,
    node_id: Option<Kuid>,
    address: SocketAddr,
    request: RequestSpecific,
    handler: Arc<dyn ResponseHandler>,
) {
    if let Err(error) = context
        .dispatcher
        .send(node_id, address, request, handler.clone())
    {
        handler.error(node_id, address, error);
    }
}
