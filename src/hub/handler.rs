// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Per-role message dispatch. Frames parse into the role's message enum
// first, so the set of operations a role can reach is fixed by the type:
// the monitor enum simply has no state-changing variants. Worker frames
// that state a worker_id are checked against the connection's bound
// identity before anything touches the broker.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::broker::CancelOutcome;
use crate::error::{BrokerError, Result};
use crate::events::MonitorSubscription;
use crate::hub::messages::{
    ClientMessage, ConnectionRole, Frame, MonitorMessage, OutboundFrame, WorkerMessage,
};
use crate::hub::HubState;

#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub role: ConnectionRole,
    pub bound_id: String,
}

/// Handle one inbound frame, returning the frames to send back on the
/// same connection. Errors become `error` frames; only auth errors close
/// connections, and none originate here.
pub async fn dispatch(hub: &Arc<HubState>, ctx: &ConnectionContext, text: &str) -> Vec<OutboundFrame> {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(e) => return vec![OutboundFrame::error(&e)],
    };
    debug!(
        connection_id = %ctx.connection_id,
        msg_type = %frame.msg_type,
        "frame received"
    );

    let result = match ctx.role {
        ConnectionRole::Worker => handle_worker(hub, ctx, &frame).await,
        ConnectionRole::Client => handle_client(hub, ctx, &frame).await,
        ConnectionRole::Monitor => handle_monitor(hub, ctx, &frame).await,
    };
    match result {
        Ok(frames) => frames,
        Err(e) => vec![OutboundFrame::error(&e)],
    }
}

fn check_provenance(stated: &Option<String>, bound_id: &str) -> Result<()> {
    match stated {
        Some(stated) if stated != bound_id => Err(BrokerError::Validation(format!(
            "worker_id {} does not match connection identity {}",
            stated, bound_id
        ))),
        _ => Ok(()),
    }
}

async fn handle_worker(
    hub: &Arc<HubState>,
    ctx: &ConnectionContext,
    frame: &Frame,
) -> Result<Vec<OutboundFrame>> {
    let worker_id = ctx.bound_id.as_str();
    match WorkerMessage::parse(frame)? {
        WorkerMessage::Register { capabilities } => {
            hub.broker.register_worker(worker_id, capabilities).await?;
            Ok(vec![OutboundFrame::worker_registered(worker_id)])
        }
        WorkerMessage::Claim(request) => {
            if let Some(capabilities) = request.capabilities {
                hub.broker
                    .refresh_worker_capabilities(worker_id, capabilities)
                    .await?;
            }
            let mut frames = Vec::new();
            for _ in 0..request.max_jobs.max(1) {
                match hub.broker.claim(worker_id).await? {
                    Some(job) => frames.push(OutboundFrame::assigned_job(&job)),
                    None => break,
                }
            }
            if frames.is_empty() {
                frames.push(OutboundFrame::no_match());
            }
            Ok(frames)
        }
        WorkerMessage::Progress(update) => {
            check_provenance(&update.worker_id, worker_id)?;
            hub.broker
                .progress(
                    &update.job_id,
                    worker_id,
                    update.progress,
                    update.message,
                    update.current_step,
                    update.total_steps,
                )
                .await?;
            Ok(Vec::new())
        }
        WorkerMessage::Completion(report) => {
            check_provenance(&report.worker_id, worker_id)?;
            hub.broker
                .complete(&report.job_id, worker_id, report.result)
                .await?;
            Ok(Vec::new())
        }
        WorkerMessage::Failure(report) => {
            check_provenance(&report.worker_id, worker_id)?;
            hub.broker
                .fail(&report.job_id, worker_id, &report.error, report.retryable)
                .await?;
            Ok(Vec::new())
        }
        WorkerMessage::Heartbeat => {
            hub.broker.worker_heartbeat(worker_id).await?;
            Ok(vec![OutboundFrame::heartbeat_ack()])
        }
        WorkerMessage::StatusChange { status } => {
            hub.broker.worker_status_change(worker_id, status).await?;
            Ok(Vec::new())
        }
    }
}

async fn handle_client(
    hub: &Arc<HubState>,
    ctx: &ConnectionContext,
    frame: &Frame,
) -> Result<Vec<OutboundFrame>> {
    match ClientMessage::parse(frame)? {
        ClientMessage::SubmitJob(submission) => {
            let job = hub.broker.submit(submission).await?;
            Ok(vec![OutboundFrame::job_submitted(&job.id)])
        }
        ClientMessage::CancelJob { job_id } => {
            let outcome = hub.broker.cancel(&job_id).await?;
            let outcome = match outcome {
                CancelOutcome::Cancelled => "cancelled",
                CancelOutcome::Requested => "cancel_requested",
                CancelOutcome::Ignored => "ignored",
            };
            Ok(vec![OutboundFrame::cancel_result(&job_id, outcome)])
        }
        ClientMessage::SyncJob { job_id } => {
            let job = hub.broker.sync(&job_id).await?;
            Ok(vec![OutboundFrame::job_state(&job)])
        }
        ClientMessage::SubscribeJobEvents { job_id } => {
            if !hub.broadcaster.is_attached(&ctx.connection_id).await {
                hub.attach_event_feed(&ctx.connection_id).await;
            }
            let mut subscription = MonitorSubscription::default();
            subscription.topics = HashSet::from(["job".to_string()]);
            subscription.filters.job_id = Some(job_id.clone());
            hub.broadcaster
                .update_subscription(&ctx.connection_id, subscription)
                .await;
            Ok(vec![OutboundFrame::subscribed(&["job".to_string()])])
        }
    }
}

async fn handle_monitor(
    hub: &Arc<HubState>,
    ctx: &ConnectionContext,
    frame: &Frame,
) -> Result<Vec<OutboundFrame>> {
    match MonitorMessage::parse(frame)? {
        MonitorMessage::Connect { request_full_state } => {
            hub.attach_event_feed(&ctx.connection_id).await;
            let mut frames = vec![OutboundFrame::monitor_connected(&ctx.connection_id)];
            if request_full_state {
                let snapshot = hub.broker.snapshot().await?;
                frames.push(OutboundFrame::full_state_snapshot(&snapshot));
            }
            Ok(frames)
        }
        MonitorMessage::Subscribe { topics, filters } => {
            if !hub.broadcaster.is_attached(&ctx.connection_id).await {
                hub.attach_event_feed(&ctx.connection_id).await;
            }
            let subscription = MonitorSubscription {
                topics: topics.iter().cloned().collect(),
                filters,
            };
            hub.broadcaster
                .update_subscription(&ctx.connection_id, subscription)
                .await;
            Ok(vec![OutboundFrame::subscribed(&topics)])
        }
        MonitorMessage::Heartbeat => Ok(vec![OutboundFrame::heartbeat_ack()]),
        MonitorMessage::ResyncRequest {
            since_timestamp,
            max_events,
        } => {
            let events = hub.broadcaster.resync(since_timestamp, max_events).await;
            let mut frames: Vec<OutboundFrame> =
                events.iter().map(OutboundFrame::event).collect();
            frames.push(OutboundFrame::resync_complete(events.len()));
            Ok(frames)
        }
    }
}
