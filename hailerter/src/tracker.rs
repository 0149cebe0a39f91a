//! State tracker
//! Owns the flow map, the timeout queue for missing detection and
//! reminders, and the mute queue. Message handling and the periodic
//! sweep both return the notifications to publish; emission is the main
//! loop's job.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::flow::{Flow, PriorState};
use crate::message::{
    classify, FlowId, Message, Notification, Status, StatusInfo, FUTURE_MARGIN,
};
use crate::queue::PrioQueue;

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub skip_initial_error: bool,
    pub remind_interval: Option<i64>,
    pub warning_expected: bool,
    pub default_interval: Option<i64>,
    pub missing_multiple: Option<i64>,
    pub flap_window: u32,
    pub flap_threshold: f64,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        TrackerOptions {
            skip_initial_error: false,
            remind_interval: None,
            warning_expected: false,
            default_interval: None,
            missing_multiple: None,
            flap_window: 10,
            flap_threshold: 0.75,
        }
    }
}

/// A flow row as reported by the `list` control command.
#[derive(Debug, Clone)]
pub struct FlowStatus {
    pub aspect: String,
    pub location: Map<String, Value>,
    pub info: Option<StatusInfo>,
}

pub struct StateTracker {
    options: TrackerOptions,
    flows: HashMap<FlowId, Flow>,
    /// FlowId -> next missing deadline or reminder time.
    timeouts: PrioQueue<FlowId>,
    /// FlowId -> mute expiry. May hold flows never seen yet.
    mutes: PrioQueue<FlowId>,
}

impl StateTracker {
    pub fn new(options: TrackerOptions) -> StateTracker {
        StateTracker {
            options,
            flows: HashMap::new(),
            timeouts: PrioQueue::new(),
            mutes: PrioQueue::new(),
        }
    }

    fn is_muted(&self, id: &FlowId, now: i64) -> bool {
        self.mutes.get(id).is_some_and(|expires| expires > now)
    }

    /// Process one input message; returns the notifications it caused.
    pub fn handle_message(&mut self, message: &Message, now: i64) -> Vec<Notification> {
        // metrics-only messages carry no state
        let state = match &message.state {
            Some(state) => state,
            None => return Vec::new(),
        };
        if message.time > now + FUTURE_MARGIN {
            debug!(aspect = %message.aspect, time = message.time, "dropping future-dated message");
            return Vec::new();
        }

        let (status, info) = classify(
            state,
            message.severity.as_deref(),
            self.options.warning_expected,
        );
        let id = FlowId::new(&message.aspect, &message.location);

        // out-of-order input leaves the flow and every queue untouched
        if let Some(flow) = self.flows.get(&id) {
            if flow.status.is_some() && message.time < flow.status_time {
                return Vec::new();
            }
        }

        // (re)arm missing detection
        let interval = message.interval.or(self.options.default_interval);
        if let (Some(interval), Some(multiple)) = (interval, self.options.missing_multiple) {
            self.timeouts
                .set(id.clone(), message.time + interval * multiple);
        }

        let muted = self.is_muted(&id, now);
        let (flap_window, flap_threshold) = (self.options.flap_window, self.options.flap_threshold);
        let flow = self.flows.entry(id).or_insert_with(|| {
            Flow::new(&message.aspect, &message.location, flap_window, flap_threshold)
        });

        let prior = flow.update(status, message.time);
        if prior == PriorState::Discard {
            return Vec::new();
        }
        flow.last_info = Some(info.clone());

        let mut notifications = Vec::new();
        if flow.flap.is_flapping() {
            let flapping_info = StatusInfo::Flapping {
                window: flow.flap.window(),
                changes: flow.flap.changes(),
            };
            let newly_flapping = prior != PriorState::Flapping;
            if newly_flapping
                || match self.options.remind_interval {
                    Some(interval) => now - flow.notified >= interval,
                    None => false,
                }
            {
                emit(flow, flapping_info, message.time, now, muted, &mut notifications);
            }
        } else if status == Status::Ok {
            // recovery; the first-ever ok stays silent
            let recovered = matches!(
                prior,
                PriorState::Status(Status::Error | Status::Missing) | PriorState::Flapping
            );
            if recovered {
                emit(flow, info, message.time, now, muted, &mut notifications);
            }
        } else {
            let first_ever = prior == PriorState::None;
            if first_ever && self.options.skip_initial_error {
                // recorded, never published; reminders still count from here
                flow.notification_sent(now);
            } else {
                let unchanged = prior == PriorState::Status(Status::Error);
                let reminder_due = match self.options.remind_interval {
                    Some(interval) => now - flow.notified >= interval,
                    None => false,
                };
                if !unchanged || reminder_due {
                    emit(flow, info, message.time, now, muted, &mut notifications);
                }
            }
        }
        notifications
    }

    /// Periodic sweep: evict expired mutes, declare overdue flows
    /// missing, emit reminders for flows that stay missing.
    pub fn sweep(&mut self, now: i64) -> Vec<Notification> {
        while let Some((expires, _)) = self.mutes.peek() {
            if expires > now {
                break;
            }
            self.mutes.pop();
        }

        let mut notifications = Vec::new();
        while let Some((deadline, _)) = self.timeouts.peek() {
            if deadline > now {
                break;
            }
            let Some((_, id)) = self.timeouts.pop() else {
                break;
            };
            let muted = self.is_muted(&id, now);
            let flow = match self.flows.get_mut(&id) {
                Some(flow) => flow,
                None => continue, // forgotten in the meantime
            };

            let was_flapping = flow.flap.is_flapping();
            if flow.status == Some(Status::Missing) {
                // a repeated missing verdict is not a status change
                flow.flap.reset();
            }
            let info = StatusInfo::Missing {
                last_seen: flow.status_time,
            };
            flow.status = Some(Status::Missing);
            flow.last_info = Some(info.clone());
            // the declaration stands even when nothing is published
            emit(flow, info, now, now, muted || was_flapping, &mut notifications);

            if let Some(remind) = self.options.remind_interval {
                self.timeouts.set(id, now + remind);
            }
        }
        notifications
    }

    // ------------------------------------------------------------------
    // control operations

    pub fn list(&self) -> Vec<FlowStatus> {
        let mut rows: Vec<FlowStatus> = self
            .flows
            .values()
            .map(|flow| FlowStatus {
                aspect: flow.aspect.clone(),
                location: flow.location.clone(),
                info: current_info(flow),
            })
            .collect();
        rows.sort_by(|a, b| a.aspect.cmp(&b.aspect));
        rows
    }

    /// Drop the flow record; a future message recreates it from scratch.
    /// An active mute for the flow is left in place.
    pub fn forget(&mut self, id: &FlowId) -> bool {
        self.timeouts.remove(id);
        self.flows.remove(id).is_some()
    }

    pub fn mute(&mut self, id: FlowId, duration: i64, now: i64) {
        self.mutes.set(id, now + duration);
    }

    pub fn unmute(&mut self, id: &FlowId) -> bool {
        self.mutes.remove(id).is_some()
    }

    pub fn list_muted(&self) -> Vec<(FlowId, i64)> {
        let mut rows: Vec<(FlowId, i64)> = self
            .mutes
            .entries()
            .map(|(expires, id)| (id.clone(), expires))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Zero the flap detector without notifying.
    pub fn reset_flapping(&mut self, id: &FlowId) -> bool {
        match self.flows.get_mut(id) {
            Some(flow) => {
                flow.flap.reset();
                true
            }
            None => false,
        }
    }

    /// Zero the notification stamp so the next non-ok message notifies.
    pub fn reset_reminder(&mut self, id: &FlowId) -> bool {
        match self.flows.get_mut(id) {
            Some(flow) => {
                flow.reset_notified();
                true
            }
            None => false,
        }
    }

    /// Direct read access to one flow record.
    pub fn flow(&self, id: &FlowId) -> Option<&Flow> {
        self.flows.get(id)
    }

    /// Pending missing-deadline or reminder time for one flow.
    pub fn timeout_deadline(&self, id: &FlowId) -> Option<i64> {
        self.timeouts.get(id)
    }
}

fn current_info(flow: &Flow) -> Option<StatusInfo> {
    if flow.flap.is_flapping() {
        return Some(StatusInfo::Flapping {
            window: flow.flap.window(),
            changes: flow.flap.changes(),
        });
    }
    match flow.status {
        Some(Status::Missing) => Some(StatusInfo::Missing {
            last_seen: flow.status_time,
        }),
        _ => flow.last_info.clone(),
    }
}

/// One decision point that resolved to "notify". The notification time
/// is stamped unconditionally; a suppressed decision (mute, flapping at
/// sweep time) swallows only the publication itself, so reminder clocks
/// keep counting from the decision, not from the suppression's end.
fn emit(
    flow: &mut Flow,
    info: StatusInfo,
    time: i64,
    now: i64,
    suppressed: bool,
    out: &mut Vec<Notification>,
) {
    flow.notification_sent(now);
    if suppressed {
        return;
    }
    out.push(Notification {
        time,
        aspect: flow.aspect.clone(),
        location: flow.location.clone(),
        info: info.clone(),
        previous: flow.status_info.clone(),
    });
    flow.status_info = Some(info);
}
