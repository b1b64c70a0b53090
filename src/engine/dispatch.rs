use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::handlers::{self, HandlerContext};
use crate::engine::queue::CommandQueue;
use crate::engine::retry::RetryPolicy;
use crate::error::{DispatchError, HandlerError};
use crate::models::command::{
    Command, CommandOrigin, CommandParams, CommandRequest, CommandStatus, CommandType,
    FailureKind, QueueStatus, SubmitReceipt,
};
use crate::models::event::FleetEvent;
use crate::notify::EmergencyContact;
use crate::observability::metrics::Metrics;

pub const DEFAULT_HISTORY_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    pub handler_timeout: Duration,
    pub history_limit: usize,
}

impl From<&Config> for DispatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry: if config.command_retry_backoff.is_zero() {
                RetryPolicy::immediate(config.command_max_retries)
            } else {
                RetryPolicy::with_backoff(
                    config.command_max_retries,
                    config.command_retry_backoff,
                    config.command_retry_backoff_max,
                )
            },
            handler_timeout: config.command_timeout,
            history_limit: config.command_history_limit,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationReceipt {
    pub order_id: String,
    pub token_revoked: bool,
    pub drone_id: Option<String>,
    pub return_command_id: Option<Uuid>,
}

/// Single FIFO command coordinator. One command is in flight at a time;
/// a failed attempt is retried from the front of the queue so a drone's
/// commands never run out of order.
pub struct Dispatcher {
    ctx: HandlerContext,
    settings: DispatchSettings,
    queue: CommandQueue,
    active: DashMap<Uuid, Command>,
    history: Mutex<VecDeque<Command>>,
    drain: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(ctx: HandlerContext, settings: DispatchSettings, metrics: Metrics) -> Self {
        Self {
            ctx,
            settings,
            queue: CommandQueue::new(),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            drain: tokio::sync::Mutex::new(()),
            processing: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    pub fn submit(&self, request: CommandRequest) -> Result<SubmitReceipt, DispatchError> {
        let drone_id = request.drone_id.trim();
        if drone_id.is_empty() {
            return Err(DispatchError::InvalidCommand("drone_id is required".to_string()));
        }

        let command_type: CommandType = request
            .command_type
            .parse()
            .map_err(DispatchError::InvalidCommand)?;

        let availability = self.ctx.gate.check_availability(drone_id);
        if !availability.available {
            let reason = availability.reason.unwrap_or_default();
            warn!(drone_id = %drone_id, command_type = %command_type, reason = %reason, "command rejected at submit");
            return Err(DispatchError::UnavailableDrone(reason));
        }

        Ok(self.enqueue(Command::new(
            drone_id.to_string(),
            command_type,
            request.params,
            CommandOrigin::Operator,
        )))
    }

    /// Queues an emergency landing that skips the battery floor. An emergency
    /// landing already pending for the drone is returned instead of a second one.
    pub fn force_emergency_land(
        &self,
        drone_id: &str,
        reason: &str,
    ) -> Result<SubmitReceipt, DispatchError> {
        let availability = self.ctx.gate.check_emergency_availability(drone_id);
        if !availability.available {
            return Err(DispatchError::UnavailableDrone(
                availability.reason.unwrap_or_default(),
            ));
        }

        let pending = self.active.iter().find_map(|entry| {
            let command = entry.value();
            (command.drone_id == drone_id && command.command_type == CommandType::EmergencyLand)
                .then(|| SubmitReceipt {
                    command_id: command.id,
                    status: command.status,
                })
        });
        if let Some(receipt) = pending {
            debug!(drone_id = %drone_id, command_id = %receipt.command_id, "emergency landing already pending");
            return Ok(receipt);
        }

        warn!(drone_id = %drone_id, reason = %reason, "forcing emergency landing");
        let _ = self.ctx.events_tx.send(FleetEvent::Emergency {
            drone_id: drone_id.to_string(),
            reason: reason.to_string(),
        });

        let params = CommandParams {
            emergency_type: Some(reason.to_string()),
            ..CommandParams::default()
        };
        Ok(self.enqueue(Command::new(
            drone_id.to_string(),
            CommandType::EmergencyLand,
            params,
            CommandOrigin::Safety,
        )))
    }

    fn enqueue(&self, command: Command) -> SubmitReceipt {
        let receipt = SubmitReceipt {
            command_id: command.id,
            status: command.status,
        };

        info!(
            command_id = %command.id,
            drone_id = %command.drone_id,
            command_type = %command.command_type,
            "command queued"
        );

        self.publish(&command);
        self.active.insert(command.id, command);
        let queued = self.queue.push_back(receipt.command_id);
        self.metrics.commands_in_queue.set(queued as i64);

        receipt
    }

    /// Drains the queue. Returns immediately if another caller is draining.
    pub async fn process_queue(&self) {
        let Ok(_drain) = self.drain.try_lock() else {
            return;
        };
        self.processing.store(true, Ordering::SeqCst);

        while let Some(id) = self.queue.pop_front() {
            self.metrics.commands_in_queue.set(self.queue.len() as i64);
            self.process_one(id).await;
        }

        self.processing.store(false, Ordering::SeqCst);
    }

    async fn process_one(&self, id: Uuid) {
        let Some(command) = self.mark_executing(id) else {
            return;
        };

        if command.command_type.is_flight() {
            if let Some(drone) = self.ctx.registry.get(&command.drone_id) {
                let decision = self
                    .ctx
                    .gate
                    .check_flight(&command.drone_id, drone.location.point())
                    .await;
                if !decision.safe {
                    let reason = decision.reason.unwrap_or_default();
                    self.finish(
                        id,
                        CommandStatus::Failed,
                        None,
                        Some((FailureKind::UnsafeWeather, format!("weather unsafe: {reason}"))),
                    );
                    return;
                }
            }
        }

        if self.ctx.registry.contains(&command.drone_id) {
            let availability = if command.origin == CommandOrigin::Safety {
                self.ctx.gate.check_emergency_availability(&command.drone_id)
            } else {
                self.ctx.gate.check_availability(&command.drone_id)
            };
            if !availability.available {
                let reason = availability.reason.unwrap_or_default();
                self.finish(
                    id,
                    CommandStatus::Failed,
                    None,
                    Some((FailureKind::UnavailableDrone, reason)),
                );
                return;
            }
        }

        let outcome = match timeout(
            self.settings.handler_timeout,
            handlers::execute(&self.ctx, &command),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::Transient(format!(
                "handler timed out after {:?}",
                self.settings.handler_timeout
            ))),
        };

        match outcome {
            Ok(handled) => {
                self.finish(id, CommandStatus::Executed, Some(handled.result), None);
                if let Some(reason) = handled.escalate {
                    if let Err(err) = self.force_emergency_land(&command.drone_id, &reason) {
                        error!(drone_id = %command.drone_id, error = %err, "could not force emergency landing");
                    }
                }
            }
            Err(HandlerError::Rejected(reason)) => {
                self.finish(
                    id,
                    CommandStatus::Failed,
                    None,
                    Some((FailureKind::Rejected, reason)),
                );
            }
            Err(err @ HandlerError::UnsafeWeather(_)) => {
                self.finish(
                    id,
                    CommandStatus::Failed,
                    None,
                    Some((FailureKind::UnsafeWeather, err.to_string())),
                );
            }
            Err(HandlerError::Transient(reason)) => {
                self.retry_or_fail(command, reason).await;
            }
        }
    }

    async fn retry_or_fail(&self, command: Command, reason: String) {
        if !self.settings.retry.allows(command.retries) {
            error!(
                command_id = %command.id,
                drone_id = %command.drone_id,
                retries = command.retries,
                error = %reason,
                "command failed after retries"
            );
            self.finish(
                command.id,
                CommandStatus::Failed,
                None,
                Some((FailureKind::HandlerFailure, reason)),
            );
            return;
        }

        let attempt = command.retries + 1;
        warn!(
            command_id = %command.id,
            drone_id = %command.drone_id,
            attempt,
            error = %reason,
            "command failed; retrying"
        );

        let updated = self.active.get_mut(&command.id).map(|mut entry| {
            entry.retries = attempt;
            entry.status = CommandStatus::Retrying;
            entry.error = Some(reason);
            entry.clone()
        });
        let Some(updated) = updated else {
            return;
        };
        self.publish(&updated);

        if let Some(delay) = self.settings.retry.next_delay(attempt) {
            sleep(delay).await;
        }

        self.queue.push_front(command.id);
        self.metrics.commands_in_queue.set(self.queue.len() as i64);
    }

    fn mark_executing(&self, id: Uuid) -> Option<Command> {
        let command = {
            let mut entry = self.active.get_mut(&id)?;
            entry.status = CommandStatus::Executing;
            entry.clone()
        };
        self.publish(&command);
        Some(command)
    }

    fn finish(
        &self,
        id: Uuid,
        status: CommandStatus,
        result: Option<Value>,
        failure: Option<(FailureKind, String)>,
    ) {
        let Some((_, mut command)) = self.active.remove(&id) else {
            return;
        };

        let now = Utc::now();
        command.status = status;
        command.result = result;
        command.executed_at = Some(now);
        if let Some((kind, reason)) = failure {
            command.error_kind = Some(kind);
            command.error = Some(reason);
        }

        let outcome = match status {
            CommandStatus::Executed => "executed",
            CommandStatus::Cancelled => "cancelled",
            _ => "failed",
        };
        let elapsed = (now - command.enqueued_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics
            .command_latency_seconds
            .with_label_values(&[outcome])
            .observe(elapsed);
        self.metrics.commands_total.with_label_values(&[outcome]).inc();

        match status {
            CommandStatus::Executed => info!(
                command_id = %command.id,
                drone_id = %command.drone_id,
                command_type = %command.command_type,
                "command executed"
            ),
            _ => warn!(
                command_id = %command.id,
                drone_id = %command.drone_id,
                command_type = %command.command_type,
                status = ?status,
                error = command.error.as_deref().unwrap_or(""),
                "command finished without executing"
            ),
        }

        self.publish(&command);

        let mut history = self.lock_history();
        history.push_back(command);
        while history.len() > self.settings.history_limit {
            history.pop_front();
        }
    }

    fn publish(&self, command: &Command) {
        let _ = self.ctx.events_tx.send(FleetEvent::Command {
            command_id: command.id,
            drone_id: command.drone_id.clone(),
            command_type: command.command_type,
            status: command.status,
            retries: command.retries,
            error: command.error.clone(),
        });
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<Command>> {
        match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Removes a command that is still waiting in the queue.
    pub fn cancel(&self, id: Uuid) -> Result<Command, DispatchError> {
        if self.queue.remove(&id) {
            self.metrics.commands_in_queue.set(self.queue.len() as i64);
            self.finish(id, CommandStatus::Cancelled, None, None);
            info!(command_id = %id, "command cancelled");
            return self
                .get_command(id)
                .ok_or_else(|| DispatchError::UnknownCommand(id.to_string()));
        }

        if self.active.contains_key(&id) {
            return Err(DispatchError::CommandInFlight(id.to_string()));
        }

        match self.get_command(id) {
            Some(command) => Err(DispatchError::InvalidCommand(format!(
                "command {id} already finished as {:?}",
                command.status
            ))),
            None => Err(DispatchError::UnknownCommand(id.to_string())),
        }
    }

    /// Revokes the delivery proof, drops the drone's route and sends it home.
    pub async fn cancel_delivery(&self, order_id: &str) -> Result<CancellationReceipt, DispatchError> {
        let order = self.ctx.registry.store().get_order(order_id).await?;
        let token_revoked = match self.ctx.verifier.revoke(order_id).await {
            Ok(revoked) => revoked,
            Err(err) => {
                warn!(order_id = %order_id, error = %err, "token revocation failed");
                false
            }
        };

        let drone_id = order.and_then(|order| order.drone_id);
        let mut return_command_id = None;

        if let Some(drone_id) = &drone_id {
            self.ctx.planner.discard(drone_id).await;
            match self.submit(CommandRequest {
                drone_id: drone_id.clone(),
                command_type: CommandType::ReturnToBase.as_str().to_string(),
                params: CommandParams::default(),
            }) {
                Ok(receipt) => return_command_id = Some(receipt.command_id),
                Err(err) => {
                    warn!(drone_id = %drone_id, order_id = %order_id, error = %err, "could not recall drone after cancellation");
                }
            }
        }

        info!(order_id = %order_id, token_revoked, "delivery cancelled");
        Ok(CancellationReceipt {
            order_id: order_id.to_string(),
            token_revoked,
            drone_id,
            return_command_id,
        })
    }

    pub fn add_emergency_contact(
        &self,
        drone_id: &str,
        contact: EmergencyContact,
    ) -> Result<Vec<EmergencyContact>, DispatchError> {
        if !self.ctx.registry.contains(drone_id) {
            return Err(DispatchError::UnavailableDrone(format!("drone {drone_id} not found")));
        }
        Ok(self.ctx.notifier.add_contact(drone_id, contact))
    }

    pub fn remove_emergency_contact(&self, drone_id: &str, name: &str) -> bool {
        self.ctx.notifier.remove_contact(drone_id, name)
    }

    pub fn get_command(&self, id: Uuid) -> Option<Command> {
        if let Some(command) = self.active.get(&id) {
            return Some(command.value().clone());
        }
        self.lock_history()
            .iter()
            .rev()
            .find(|command| command.id == id)
            .cloned()
    }

    /// The most recent `limit` finished commands, oldest first.
    pub fn get_command_history(&self, drone_id: Option<&str>, limit: usize) -> Vec<Command> {
        let history = self.lock_history();
        let mut matching: Vec<Command> = history
            .iter()
            .rev()
            .filter(|command| drone_id.is_none_or(|id| command.drone_id == id))
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub fn get_active_commands(&self) -> Vec<Command> {
        let mut active: Vec<Command> = self.active.iter().map(|entry| entry.value().clone()).collect();
        active.sort_by_key(|command| command.enqueued_at);
        active
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            active_commands: self.active.len(),
            processing: self.processing.load(Ordering::SeqCst),
        }
    }

    pub async fn wait_for_work(&self) {
        self.queue.notified().await;
    }
}

pub async fn run_dispatch_loop(dispatcher: Arc<Dispatcher>) {
    info!("dispatch loop started");

    loop {
        dispatcher.process_queue().await;
        dispatcher.wait_for_work().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_is_selected_from_config() {
        let immediate = DispatchSettings::from(&Config::default());
        assert_eq!(immediate.retry, RetryPolicy::immediate(3));

        let config = Config {
            command_max_retries: 5,
            command_retry_backoff: Duration::from_millis(250),
            command_retry_backoff_max: Duration::from_secs(2),
            ..Config::default()
        };
        let settings = DispatchSettings::from(&config);
        assert_eq!(
            settings.retry,
            RetryPolicy::with_backoff(5, Duration::from_millis(250), Duration::from_secs(2))
        );
        assert!(settings.retry.next_delay(1).unwrap() >= Duration::from_millis(250));
    }
}
