//! Connection establishment.

use std::sync::Arc;

use corelib::NodeId;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::substrate::{SessionOps, SessionParams, SessionType, Substrate};

/// Opens a client session to `nid` and connects it within `ctx`.
///
/// The URL scheme follows the node's transport type. `ops` receives every
/// callback for the session and serves as its user context. If the connect
/// step fails the session is destroyed before returning.
pub fn create_connection<S: Substrate>(
    substrate: &S,
    ctx: &S::Context,
    nid: &NodeId,
    ops: Arc<dyn SessionOps>,
) -> Result<(S::Session, S::Connection), TransportError> {
    let uri = nid.url();
    debug!(%uri, substrate = substrate.name(), "creating client session");

    let session = substrate.create_session(SessionParams {
        session_type: SessionType::Client,
        uri: uri.clone(),
        ops,
    })?;

    match substrate.connect(&session, ctx) {
        Ok(conn) => Ok((session, conn)),
        Err(err) => {
            warn!(%uri, error = %err, "connect failed");
            substrate.destroy_session(session);
            Err(err)
        }
    }
}
