//! Reply routing: one task per pool drains the shared reply queue and hands
//! each reply to the worker whose id matches its correlation id.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::{Deliveries, Envelope};
use crate::pool::PoolShared;
use crate::protocol::ResultMessage;
use crate::registry::Delivery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    MissingCorrelationId,
    UnknownWorker,
    Duplicate,
    Undecodable,
}

pub(crate) async fn run(shared: Arc<PoolShared>, mut deliveries: Deliveries, stop: CancellationToken) {
    let language = shared.language;
    tracing::debug!(%language, queue = %shared.reply_queue, "reply router started");
    loop {
        let envelope = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = deliveries.recv() => match next {
                Some(envelope) => envelope,
                None => {
                    tracing::warn!(%language, "reply stream ended");
                    break;
                }
            },
        };
        route(&shared, envelope);
    }
    tracing::debug!(%language, "reply router stopped");
}

pub(crate) fn route(shared: &PoolShared, envelope: Envelope) -> RouteOutcome {
    let language = shared.language;
    let Some(correlation_id) = envelope.correlation_id else {
        tracing::warn!(%language, "dropping reply without correlation id");
        return RouteOutcome::MissingCorrelationId;
    };
    if !shared.registry.contains(&correlation_id) {
        shared.stats.record_late_reply();
        tracing::info!(%language, %correlation_id, "dropping reply for unknown worker");
        return RouteOutcome::UnknownWorker;
    }
    let reply: ResultMessage = match serde_json::from_slice(&envelope.body) {
        Ok(reply) => reply,
        Err(err) => {
            tracing::error!(%language, %correlation_id, error = %err, "dropping undecodable reply");
            return RouteOutcome::Undecodable;
        }
    };
    match shared.registry.deliver(&correlation_id, reply) {
        Delivery::Delivered => {
            tracing::debug!(%language, %correlation_id, "reply routed");
            RouteOutcome::Delivered
        }
        Delivery::Unknown => {
            shared.stats.record_late_reply();
            tracing::info!(%language, %correlation_id, "worker cleaned up before reply arrived");
            RouteOutcome::UnknownWorker
        }
        Delivery::Duplicate => {
            tracing::warn!(%language, %correlation_id, "dropping duplicate reply");
            RouteOutcome::Duplicate
        }
    }
}
