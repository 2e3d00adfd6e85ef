//! Virtual time and alarms.
//!
//! The clock is a scheduler-owned service. In real-time mode virtual time
//! tracks the wall clock scaled by the current speed; in jump mode (a
//! simulated clock, or a real-time clock with speed set to
//! [`ClockSpeed::Jump`]) time stands still until the scheduler jumps it to
//! the next scheduled event. Time only progresses while a run is active.
//!
//! Alarms live in a single min-heap keyed by `(fire_time, insertion seq)`,
//! so simultaneous alarms fire in the order they were set. Cancellation is
//! tombstone-based: cancelled entries are skipped when the heap is popped.

use crate::error::KernelError;
use crate::message::{AgentId, Envelope, WakeUp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// How the clock relates to wall time. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    /// Virtual time tracks wall time, scaled by the current speed.
    RealTime,

    /// Virtual time never reads the wall clock; it jumps to the next alarm
    /// when nothing else is pending.
    Simulated,
}

/// Clock speed relative to wall time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClockSpeed {
    /// Virtual seconds per wall second. `Rate(2.0)` runs twice as fast as
    /// real time.
    Rate(f64),

    /// No wall tracking; time jumps to the next scheduled event.
    Jump,
}

/// Handle to a pending alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmId(Uuid);

impl AlarmId {
    /// Creates a new alarm handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (high, _) = self.0.as_u64_pair();
        write!(f, "{:016x}", high)
    }
}

/// A request to schedule an alarm, built fluently:
///
/// ```ignore
/// ctx.set_alarm(AlarmRequest::after(5.0))?;
/// ctx.set_alarm(AlarmRequest::at(deadline).payload(env).ignore_if_idle())?;
/// ```
#[derive(Debug)]
pub struct AlarmRequest {
    time: f64,
    relative: bool,
    payload: Option<Envelope>,
    ignore_if_idle: bool,
}

impl AlarmRequest {
    /// Alarm `secs` virtual seconds from now. Negative intervals are
    /// rejected when the request is scheduled.
    pub fn after(secs: f64) -> Self {
        Self {
            time: secs,
            relative: true,
            payload: None,
            ignore_if_idle: false,
        }
    }

    /// Alarm at an absolute virtual time. Times already in the past fire on
    /// the next cycle.
    pub fn at(time: f64) -> Self {
        Self {
            time,
            relative: false,
            payload: None,
            ignore_if_idle: false,
        }
    }

    /// Message to route when the alarm fires. Without one, the owner
    /// receives a [`WakeUp`] sentinel.
    pub fn payload(mut self, env: Envelope) -> Self {
        self.payload = Some(env);
        self
    }

    /// Discard the alarm instead of servicing it if the scheduler has
    /// nothing else to do when it comes due.
    pub fn ignore_if_idle(mut self) -> Self {
        self.ignore_if_idle = true;
        self
    }

    /// Resolves the request against the current time.
    pub(crate) fn resolve(self, now: f64) -> Result<AlarmSpec, KernelError> {
        let fire_at = if self.relative {
            if self.time < 0.0 {
                return Err(KernelError::NegativeAlarmInterval(self.time));
            }
            now + self.time
        } else {
            self.time
        };
        Ok(AlarmSpec {
            fire_at,
            payload: self.payload,
            ignore_if_idle: self.ignore_if_idle,
        })
    }
}

/// A resolved alarm request: absolute fire time plus delivery options.
#[derive(Debug)]
pub(crate) struct AlarmSpec {
    pub fire_at: f64,
    pub payload: Option<Envelope>,
    pub ignore_if_idle: bool,
}

/// Scheduler-internal actions carried by control alarms.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ControlAction {
    SetSpeed(ClockSpeed),
    Pause,
    Stop,
}

/// What a firing alarm does.
#[derive(Debug)]
pub(crate) enum AlarmPayload {
    /// Route this envelope.
    Deliver(Envelope),
    /// Deliver a [`WakeUp`] sentinel to the owner.
    Wake,
    /// Apply a scheduler control action.
    Control(ControlAction),
}

/// A pending alarm in the heap.
#[derive(Debug)]
pub(crate) struct Alarm {
    pub id: AlarmId,
    pub fire_at: f64,
    pub owner: Option<AgentId>,
    pub payload: AlarmPayload,
    pub ignore_if_idle: bool,
    seq: u64,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Alarm {}

impl Ord for Alarm {
    // Reversed so the BinaryHeap acts as a min-heap on (fire_at, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .total_cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Read-only description of a pending alarm, as returned by `list_alarms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmInfo {
    /// Handle usable with `cancel_alarm`.
    pub id: AlarmId,

    /// Absolute virtual fire time.
    pub fire_at: f64,

    /// Owning agent; `None` for scheduler control alarms.
    pub owner: Option<AgentId>,

    /// Topic of the payload (or the wake-up sentinel topic).
    pub topic: String,
}

/// The virtual time source and alarm store. Scheduler-owned; agents reach
/// it only through their context.
#[derive(Debug)]
pub(crate) struct Clock {
    mode: ClockMode,
    speed: ClockSpeed,

    /// Current virtual time in seconds; monotone while a run is active.
    time: f64,

    /// Virtual time at the last re-anchor.
    virtual_anchor: f64,

    /// Wall instant of the last re-anchor; `Some` only while a real-rate
    /// clock is running.
    wall_anchor: Option<Instant>,

    running: bool,

    alarms: BinaryHeap<Alarm>,
    cancelled: HashSet<AlarmId>,
    next_seq: u64,
}

impl Clock {
    /// A real-time clock at the given speed.
    pub(crate) fn real(speed: ClockSpeed, start_time: f64) -> Self {
        Self::from_parts(ClockMode::RealTime, speed, start_time)
    }

    /// A simulated clock. Always in jump mode; never reads wall time.
    pub(crate) fn simulated(start_time: f64) -> Self {
        Self::from_parts(ClockMode::Simulated, ClockSpeed::Jump, start_time)
    }

    fn from_parts(mode: ClockMode, speed: ClockSpeed, start_time: f64) -> Self {
        Self {
            mode,
            speed,
            time: start_time,
            virtual_anchor: start_time,
            wall_anchor: None,
            running: false,
            alarms: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn mode(&self) -> ClockMode {
        self.mode
    }

    pub(crate) fn speed(&self) -> ClockSpeed {
        self.speed
    }

    /// Current virtual time in seconds.
    pub(crate) fn now(&self) -> f64 {
        match (self.running, self.speed, self.wall_anchor) {
            (true, ClockSpeed::Rate(rate), Some(anchor)) => {
                self.virtual_anchor + anchor.elapsed().as_secs_f64() * rate
            }
            _ => self.time,
        }
    }

    /// Whether time stands still between events.
    pub(crate) fn is_jumping(&self) -> bool {
        matches!(self.speed, ClockSpeed::Jump)
    }

    /// Latches the wall-derived time into `time` (real-rate mode).
    pub(crate) fn advance(&mut self) {
        self.time = self.now();
    }

    /// Resumes the clock at the start of a run.
    pub(crate) fn resume(&mut self) {
        self.running = true;
        self.rebase();
    }

    /// Freezes the clock when a run returns. Time does not progress between
    /// runs.
    pub(crate) fn pause(&mut self) {
        self.time = self.now();
        self.running = false;
        self.wall_anchor = None;
    }

    /// Changes speed, re-anchoring `(wall, virtual)` at the current time.
    pub(crate) fn set_speed(&mut self, speed: ClockSpeed) -> Result<(), KernelError> {
        if self.mode == ClockMode::Simulated && matches!(speed, ClockSpeed::Rate(_)) {
            return Err(KernelError::SpeedUnsupported);
        }
        self.time = self.now();
        self.speed = speed;
        self.rebase();
        Ok(())
    }

    /// Sets virtual time. Moving backwards is rejected.
    pub(crate) fn set_time(&mut self, time: f64) -> Result<(), KernelError> {
        let now = self.now();
        if time < now {
            return Err(KernelError::TimeReversed {
                now,
                requested: time,
            });
        }
        self.time = time;
        self.rebase();
        Ok(())
    }

    /// Jumps forward to `time` (event-jump mode).
    pub(crate) fn jump_to(&mut self, time: f64) {
        debug_assert!(time >= self.time, "jump must move time forward");
        self.time = self.time.max(time);
        self.rebase();
    }

    fn rebase(&mut self) {
        self.virtual_anchor = self.time;
        self.wall_anchor = if self.running && matches!(self.speed, ClockSpeed::Rate(_)) {
            Some(Instant::now())
        } else {
            None
        };
    }

    /// Inserts an agent alarm under a caller-minted id.
    pub(crate) fn schedule(&mut self, id: AlarmId, owner: Option<AgentId>, spec: AlarmSpec) {
        let payload = match spec.payload {
            Some(env) => AlarmPayload::Deliver(env),
            None => AlarmPayload::Wake,
        };
        self.push(Alarm {
            id,
            fire_at: spec.fire_at,
            owner,
            payload,
            ignore_if_idle: spec.ignore_if_idle,
            seq: 0,
        });
    }

    /// Inserts a scheduler control alarm.
    pub(crate) fn schedule_control(&mut self, id: AlarmId, fire_at: f64, action: ControlAction) {
        self.push(Alarm {
            id,
            fire_at,
            owner: None,
            payload: AlarmPayload::Control(action),
            ignore_if_idle: false,
            seq: 0,
        });
    }

    fn push(&mut self, mut alarm: Alarm) {
        alarm.seq = self.next_seq;
        self.next_seq += 1;
        self.alarms.push(alarm);
    }

    /// Tombstones a pending alarm. Unknown ids are ignored.
    pub(crate) fn cancel(&mut self, id: AlarmId) {
        if self.alarms.iter().any(|a| a.id == id) {
            self.cancelled.insert(id);
        }
    }

    /// Tombstones every alarm owned by `owner` (agent teardown).
    pub(crate) fn clear_owned(&mut self, owner: AgentId) {
        let ids: Vec<AlarmId> = self
            .alarms
            .iter()
            .filter(|a| a.owner == Some(owner))
            .map(|a| a.id)
            .collect();
        self.cancelled.extend(ids);
    }

    /// Drops every alarm (scheduler shutdown).
    pub(crate) fn clear_all(&mut self) {
        self.alarms.clear();
        self.cancelled.clear();
    }

    /// Pops the next live alarm due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: f64) -> Option<Alarm> {
        self.prune();
        if self.alarms.peek().is_some_and(|a| a.fire_at <= now) {
            self.alarms.pop()
        } else {
            None
        }
    }

    fn prune(&mut self) {
        while let Some(top) = self.alarms.peek() {
            if self.cancelled.remove(&top.id) {
                self.alarms.pop();
            } else {
                break;
            }
        }
    }

    /// Earliest fire time among live, non-ignorable alarms - the jump
    /// target when the scheduler is otherwise idle.
    pub(crate) fn next_event_time(&self) -> Option<f64> {
        self.live_pending().map(|a| a.fire_at).reduce(f64::min)
    }

    /// Whether any live, non-ignorable alarm is pending.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.live_pending().next().is_some()
    }

    fn live_pending(&self) -> impl Iterator<Item = &Alarm> + '_ {
        self.alarms
            .iter()
            .filter(|a| !self.cancelled.contains(&a.id) && !a.ignore_if_idle)
    }

    /// Lists pending agent alarms, optionally filtered by owner. O(#alarms);
    /// intended for cooperative deduplication, not hot paths.
    pub(crate) fn list_alarms(&self, owner: Option<AgentId>) -> Vec<AlarmInfo> {
        let mut pending: Vec<(&Alarm, &str)> = self
            .alarms
            .iter()
            .filter(|a| !self.cancelled.contains(&a.id))
            .filter(|a| owner.is_none() || a.owner == owner)
            .filter_map(|a| match &a.payload {
                AlarmPayload::Deliver(env) => Some((a, env.topic())),
                AlarmPayload::Wake => Some((a, WakeUp::TAG)),
                AlarmPayload::Control(_) => None,
            })
            .collect();
        pending.sort_by(|(a, _), (b, _)| {
            a.fire_at
                .total_cmp(&b.fire_at)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        pending
            .into_iter()
            .map(|(a, topic)| AlarmInfo {
                id: a.id,
                fire_at: a.fire_at,
                owner: a.owner,
                topic: topic.to_string(),
            })
            .collect()
    }
}
