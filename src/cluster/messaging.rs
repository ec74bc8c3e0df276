//! Coordination messages and the transport seam between nodes.
//!
//! All placement and maintenance traffic travels as [`CoordRequest`] /
//! [`CoordResponse`] pairs. Responses are a tagged result so a waiting
//! collector can fail fast the moment a peer reports an error rather than
//! waiting out its timeout.
//!
//! [`MessagingChannel`] abstracts the transport. [`InProcessNetwork`] is the
//! built-in loopback implementation: it routes requests directly to
//! registered coordinators in the same process, which serves embedded
//! multi-node deployments and the integration tests alike.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::cluster::distribution::DistributionSnapshot;
use crate::error::{Error, Result};
use crate::types::NodeId;

/// A coordination request sent from one node to another.
#[derive(Debug, Clone)]
pub enum CoordRequest {
    /// Ask the receiver for its current distribution snapshot.
    GetDistInfo,
    /// Ask the main node to run a rehash on the sender's behalf.
    RehashRequest,
    /// Push a placement plan entry for the receiver to apply.
    Rehash(DistributionSnapshot),
    /// Enable or disable rehash participation on the receiver.
    RehashSwitch(bool),
    /// Delegate a persistence save for the receiver's partitions.
    Save { timeout: Duration },
    /// Delegate a persistence reload for the receiver's partitions.
    Load { timeout: Duration },
    /// Delegate a single-key reload.
    LoadKey { key: Bytes, timeout: Duration },
}

impl CoordRequest {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordRequest::GetDistInfo => "GET_DIST_INFO",
            CoordRequest::RehashRequest => "REHASH_REQUEST",
            CoordRequest::Rehash(_) => "REHASH",
            CoordRequest::RehashSwitch(_) => "REHASH_SWITCH",
            CoordRequest::Save { .. } => "SAVE",
            CoordRequest::Load { .. } => "LOAD",
            CoordRequest::LoadKey { .. } => "LOAD_KEY",
        }
    }
}

/// The receiver's answer to a [`CoordRequest`].
#[derive(Debug, Clone)]
pub enum CoordResponse {
    /// The request was applied.
    Ack,
    /// The receiver's distribution snapshot (answer to GET_DIST_INFO).
    DistInfo(DistributionSnapshot),
    /// The receiver failed to apply the request.
    Error(String),
}

impl CoordResponse {
    /// Convert a remote error into a local [`Error::Send`], passing other
    /// responses through.
    pub fn into_result(self) -> Result<CoordResponse> {
        match self {
            CoordResponse::Error(message) => Err(Error::Send(message)),
            other => Ok(other),
        }
    }
}

/// Handles coordination requests addressed to one node.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, from: NodeId, request: CoordRequest) -> CoordResponse;
}

/// Transport for coordination traffic.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Node ids currently registered on this channel, in ascending order.
    fn members(&self) -> Vec<NodeId>;

    /// True if `node` has a registered receiver.
    fn is_registered(&self, node: NodeId) -> bool;

    /// Deliver `request` to `to`, returning its response.
    async fn send(
        &self,
        to: NodeId,
        from: NodeId,
        request: CoordRequest,
    ) -> Result<CoordResponse>;
}

/// Loopback transport routing requests to in-process coordinators.
#[derive(Default)]
pub struct InProcessNetwork {
    handlers: DashMap<NodeId, Arc<dyn RequestHandler>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's request handler. A later registration for the same
    /// id supersedes the earlier one.
    pub fn register(&self, node: NodeId, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(node, handler);
    }

    /// Remove a node's handler, simulating its departure.
    pub fn deregister(&self, node: NodeId) {
        self.handlers.remove(&node);
    }
}

#[async_trait]
impl MessagingChannel for InProcessNetwork {
    fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.handlers.iter().map(|e| *e.key()).collect();
        members.sort();
        members
    }

    fn is_registered(&self, node: NodeId) -> bool {
        self.handlers.contains_key(&node)
    }

    async fn send(
        &self,
        to: NodeId,
        from: NodeId,
        request: CoordRequest,
    ) -> Result<CoordResponse> {
        trace!(%to, %from, kind = request.kind(), "dispatching coordination request");
        let handler = self
            .handlers
            .get(&to)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::Send(format!("no receiver registered for {to}")))?;
        Ok(handler.handle_request(from, request).await)
    }
}
