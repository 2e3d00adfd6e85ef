//! The scheduler: agent registry, message pump and main loop.
//!
//! Each cycle performs, in order:
//!
//! ```text
//! 1. clock advance      real-rate tracking, or a jump to the next alarm
//! 2. alarm firing       due alarms route their payloads into inboxes
//! 3. outbox flush       sends from the previous cycle reach their inboxes
//! 4. activation pass    every hot agent updates exactly once
//! 5. idle detection
//! ```
//!
//! Messages produced during an activation are not visible to any recipient
//! until the next cycle, which is what makes runs replayable: the delivery
//! order depends only on the registry and the outbox order, never on
//! activation timing. The activation pass itself runs either in-process or
//! on scoped worker threads (`workers > 0`); results are merged in
//! activation order, so both modes produce the same journal.

use crate::agent::{Agent, AgentContext, ControlOp, Lifecycle};
use crate::clock::{
    AlarmId, AlarmInfo, AlarmPayload, AlarmRequest, Clock, ClockMode, ClockSpeed, ControlAction,
};
use crate::error::KernelError;
use crate::journal::{DeliveryRecord, Journal};
use crate::message::{AgentId, Envelope, WakeUp};
use crate::router::{Resolution, Router, Subject};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Scheduler construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Clock mode; fixed for the scheduler's lifetime.
    pub mode: ClockMode,

    /// Initial clock speed. A simulated clock only accepts `Jump`.
    pub clock_speed: ClockSpeed,

    /// Virtual time at construction.
    pub start_time: f64,

    /// Parallel activation workers; 0 runs everything in-process.
    pub workers: usize,

    /// Unknown receivers and agent faults become errors instead of log
    /// lines.
    pub strict: bool,

    /// Admit envelopes without copy capability (single-process
    /// optimisation; such messages can only ever reach one recipient).
    pub allow_opaque_messages: bool,

    /// Admit agents that declare themselves non-portable.
    pub allow_pinned_agents: bool,

    /// Record a delivery journal for replay checks and export.
    pub trace: bool,

    /// Sleep per idle real-time cycle, to avoid spinning while waiting on
    /// the wall clock.
    pub idle_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::RealTime,
            clock_speed: ClockSpeed::Rate(1.0),
            start_time: 0.0,
            workers: 0,
            strict: false,
            allow_opaque_messages: false,
            allow_pinned_agents: false,
            trace: false,
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Bounds for one `run` call. Exactly one termination condition ends the
/// run; all state is retained and a later `run` resumes.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Virtual-time budget in seconds.
    pub seconds: Option<f64>,

    /// Cycle budget.
    pub iterations: Option<u64>,

    /// Return as soon as a cycle is idle.
    pub pause_if_idle: bool,

    /// Clock speed to apply before the first cycle.
    pub clock_speed: Option<ClockSpeed>,
}

impl RunOptions {
    /// Bound by virtual time.
    pub fn for_seconds(seconds: f64) -> Self {
        Self {
            seconds: Some(seconds),
            ..Self::default()
        }
    }

    /// Bound by cycle count.
    pub fn for_iterations(iterations: u64) -> Self {
        Self {
            iterations: Some(iterations),
            ..Self::default()
        }
    }

    /// Run until the first idle cycle.
    pub fn until_idle() -> Self {
        Self {
            pause_if_idle: true,
            ..Self::default()
        }
    }

    /// Also return on the first idle cycle.
    pub fn with_pause_if_idle(mut self) -> Self {
        self.pause_if_idle = true;
        self
    }

    /// Apply a clock speed before the first cycle.
    pub fn with_clock_speed(mut self, speed: ClockSpeed) -> Self {
        self.clock_speed = Some(speed);
        self
    }
}

/// Why a `run` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The cycle budget was exhausted.
    Iterations,

    /// A pause was requested - by the virtual-time budget, a timed pause,
    /// or an agent.
    Paused,

    /// `pause_if_idle` was set and a cycle went idle.
    Idle,

    /// The scheduler went idle with nothing schedulable left; no event can
    /// ever reach a single-threaded run, so it returns regardless of
    /// `pause_if_idle`.
    Drained,

    /// `stop` was requested; every agent has been torn down.
    Stopped,
}

/// Summary of one `run` call.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunReport {
    pub reason: StopReason,

    /// Cycles executed by this call.
    pub cycles: u64,

    /// Virtual time when the run returned.
    pub time: f64,
}

/// Counters accumulated across the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    /// Total cycles executed.
    pub cycles: u64,

    /// Envelopes resolved to at least one recipient.
    pub messages_routed: u64,

    /// Copies produced for extra recipients.
    pub copies_made: u64,

    /// Envelopes dropped (no subscribers, unknown receiver, vanished
    /// recipient, uncopyable fan-out).
    pub messages_dropped: u64,

    /// Alarms serviced.
    pub alarms_fired: u64,

    /// Ignorable alarms discarded because the scheduler was idle.
    pub alarms_discarded: u64,

    /// Panics captured from agent hooks.
    pub agent_faults: u64,
}

/// Lifecycle hook being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Update,
    Teardown,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Update => "update",
            Phase::Teardown => "teardown",
        }
    }
}

/// Registry entry. The kernel owns the inbox and flags; the agent box is
/// taken out for the duration of an activation.
struct AgentSlot {
    agent: Option<Box<dyn Agent>>,
    inbox: VecDeque<Envelope>,
    keep_awake: bool,
    lifecycle: Lifecycle,
    class_tag: &'static str,
}

/// One activation, self-contained so it can cross a worker boundary.
struct Job {
    id: AgentId,
    phase: Phase,
    agent: Box<dyn Agent>,
    inbox: VecDeque<Envelope>,
    keep_awake: bool,
    alarms: Vec<AlarmInfo>,
    now: f64,
    cycle: u64,
    allow_opaque: bool,
}

/// What an activation produced.
struct JobResult {
    id: AgentId,
    phase: Phase,
    agent: Box<dyn Agent>,
    inbox: VecDeque<Envelope>,
    keep_awake: bool,
    outbox: Vec<Envelope>,
    ops: Vec<ControlOp>,
    fault: Option<String>,
}

/// Runs one lifecycle hook against a job, capturing panics.
fn run_job(mut job: Job) -> JobResult {
    let mut outbox = Vec::new();
    let mut ops = Vec::new();
    let fault = {
        let mut ctx = AgentContext::new(
            job.id,
            job.now,
            job.cycle,
            &mut job.inbox,
            &mut job.keep_awake,
            &mut outbox,
            &mut ops,
            &job.alarms,
            job.allow_opaque,
        );
        let agent = job.agent.as_mut();
        let outcome = catch_unwind(AssertUnwindSafe(|| match job.phase {
            Phase::Setup => agent.setup(&mut ctx),
            Phase::Update => agent.update(&mut ctx),
            Phase::Teardown => agent.teardown(&mut ctx),
        }));
        outcome.err().map(panic_detail)
    };
    JobResult {
        id: job.id,
        phase: job.phase,
        agent: job.agent,
        inbox: job.inbox,
        keep_awake: job.keep_awake,
        outbox,
        ops,
        fault,
    }
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct CycleStatus {
    idle: bool,
    worked: bool,
}

/// The simulation kernel: registry, router, clock, outbox and main loop.
pub struct Scheduler {
    clock: Clock,
    router: Router,
    slots: HashMap<AgentId, AgentSlot>,

    /// Registration order; teardown on `stop` runs in reverse.
    order: Vec<AgentId>,

    /// Agents with undelivered inbox contents.
    hot: BTreeSet<AgentId>,

    /// The global outbox; flushed through the router once per cycle.
    outbox: VecDeque<Envelope>,

    config: SchedulerConfig,
    stats: SchedulerStats,
    journal: Option<Journal>,
    cycle: u64,
    pause_requested: bool,
    stop_requested: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cycle", &self.cycle)
            .field("order", &self.order)
            .field("pause_requested", &self.pause_requested)
            .field("stop_requested", &self.stop_requested)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// A real-time scheduler at speed 1.0.
    pub fn real_time() -> Self {
        let config = SchedulerConfig::default();
        let clock = Clock::real(config.clock_speed, config.start_time);
        Self::from_parts(clock, config)
    }

    /// A simulated-time scheduler: time jumps to the next event.
    pub fn simulated() -> Self {
        let config = SchedulerConfig {
            mode: ClockMode::Simulated,
            clock_speed: ClockSpeed::Jump,
            ..SchedulerConfig::default()
        };
        let clock = Clock::simulated(config.start_time);
        Self::from_parts(clock, config)
    }

    /// Builds a scheduler from an explicit configuration.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, KernelError> {
        let clock = match (config.mode, config.clock_speed) {
            (ClockMode::Simulated, ClockSpeed::Rate(_)) => {
                return Err(KernelError::SpeedUnsupported)
            }
            (ClockMode::Simulated, ClockSpeed::Jump) => Clock::simulated(config.start_time),
            (ClockMode::RealTime, speed) => Clock::real(speed, config.start_time),
        };
        Ok(Self::from_parts(clock, config))
    }

    fn from_parts(clock: Clock, config: SchedulerConfig) -> Self {
        let journal = config.trace.then(Journal::new);
        Self {
            clock,
            router: Router::new(),
            slots: HashMap::new(),
            order: Vec::new(),
            hot: BTreeSet::new(),
            outbox: VecDeque::new(),
            config,
            stats: SchedulerStats::default(),
            journal,
            cycle: 0,
            pause_requested: false,
            stop_requested: false,
        }
    }

    // -- registry ------------------------------------------------

    /// Registers an agent under a fresh uuid and runs its `setup`.
    pub fn add(&mut self, agent: impl Agent + 'static) -> Result<AgentId, KernelError> {
        self.insert_agent(AgentId::new(), Box::new(agent))
    }

    /// Registers an agent under a caller-chosen uuid (deterministic
    /// scenarios, replay tests).
    pub fn add_with_id(
        &mut self,
        id: AgentId,
        agent: impl Agent + 'static,
    ) -> Result<AgentId, KernelError> {
        self.insert_agent(id, Box::new(agent))
    }

    fn insert_agent(
        &mut self,
        id: AgentId,
        agent: Box<dyn Agent>,
    ) -> Result<AgentId, KernelError> {
        if self.slots.contains_key(&id) {
            return Err(KernelError::DuplicateAgent(id));
        }
        if !agent.portable() && !self.config.allow_pinned_agents {
            return Err(KernelError::AgentNotPortable {
                agent: id,
                class: agent.class_tag(),
            });
        }
        let class_tag = agent.class_tag();
        debug!(agent = %id, class = class_tag, "registering agent");
        self.router.register(id);
        self.router.subscribe(id, Subject::Agent(id));
        self.router.subscribe(id, Subject::Topic(class_tag.to_string()));
        self.slots.insert(
            id,
            AgentSlot {
                agent: Some(agent),
                inbox: VecDeque::new(),
                keep_awake: false,
                lifecycle: Lifecycle::SetupPending,
                class_tag,
            },
        );
        self.order.push(id);

        let now = self.clock.now();
        if let Some(job) = self.prepare_job(id, Phase::Setup, now) {
            let result = run_job(job);
            self.absorb(result)?;
        }
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.lifecycle = Lifecycle::Live;
        }
        Ok(id)
    }

    /// Removes an agent: runs `teardown`, drops its subscriptions and
    /// alarms, deletes the entry.
    pub fn remove(&mut self, id: AgentId) -> Result<(), KernelError> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(KernelError::UnknownAgent(id))?;
        let lifecycle = slot.lifecycle;
        slot.lifecycle = Lifecycle::TeardownPending;
        debug!(agent = %id, "deregistering agent");

        let mut outcome = Ok(());
        if lifecycle == Lifecycle::Live {
            let now = self.clock.now();
            if let Some(job) = self.prepare_job(id, Phase::Teardown, now) {
                let result = run_job(job);
                outcome = self.absorb(result);
            }
        }
        self.drop_slot(id);
        outcome
    }

    /// Tears down every live agent in reverse registration order, then
    /// discards the registry.
    pub fn stop(&mut self) {
        self.shutdown_agents();
    }

    fn shutdown_agents(&mut self) {
        info!(agents = self.order.len(), "scheduler shutdown initiated");
        let ids: Vec<AgentId> = self.order.iter().rev().copied().collect();
        for id in ids {
            if let Err(err) = self.remove(id) {
                warn!(agent = %id, error = %err, "teardown failed during shutdown");
            }
        }
        self.clock.clear_all();
        self.outbox.clear();
        self.hot.clear();
    }

    fn drop_slot(&mut self, id: AgentId) {
        self.router.deregister(id);
        self.clock.clear_owned(id);
        self.slots.remove(&id);
        self.order.retain(|other| *other != id);
        self.hot.remove(&id);
    }

    // -- inspection ----------------------------------------------

    /// Registered agent ids in registration order.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.order.clone()
    }

    /// Whether an agent is registered.
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Borrows a registered agent as its concrete type.
    pub fn agent<T: Agent>(&self, id: AgentId) -> Option<&T> {
        self.slots.get(&id)?.agent.as_ref()?.as_any().downcast_ref()
    }

    /// Mutably borrows a registered agent as its concrete type.
    pub fn agent_mut<T: Agent>(&mut self, id: AgentId) -> Option<&mut T> {
        self.slots
            .get_mut(&id)?
            .agent
            .as_mut()?
            .as_any_mut()
            .downcast_mut()
    }

    /// Read-only view of an agent's inbox.
    pub fn inbox(&self, id: AgentId) -> Option<&VecDeque<Envelope>> {
        self.slots.get(&id).map(|slot| &slot.inbox)
    }

    /// The class tag an agent registered under.
    pub fn class_tag(&self, id: AgentId) -> Option<&'static str> {
        self.slots.get(&id).map(|slot| slot.class_tag)
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// The delivery journal, when tracing is enabled.
    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Current virtual time in seconds.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// The clock mode fixed at construction.
    pub fn clock_mode(&self) -> ClockMode {
        self.clock.mode()
    }

    /// The current clock speed.
    pub fn clock_speed(&self) -> ClockSpeed {
        self.clock.speed()
    }

    // -- clock & alarms ------------------------------------------

    /// Sets virtual time; moving backwards is rejected.
    pub fn set_time(&mut self, time: f64) -> Result<(), KernelError> {
        self.clock.set_time(time)
    }

    /// Changes clock speed immediately, re-anchoring against wall time.
    pub fn set_clock_speed(&mut self, speed: ClockSpeed) -> Result<(), KernelError> {
        self.clock.set_speed(speed)
    }

    /// Schedules a clock speed change as a timed event.
    pub fn set_clock_speed_at(
        &mut self,
        at: f64,
        speed: ClockSpeed,
    ) -> Result<AlarmId, KernelError> {
        if self.clock.mode() == ClockMode::Simulated && matches!(speed, ClockSpeed::Rate(_)) {
            return Err(KernelError::SpeedUnsupported);
        }
        let id = AlarmId::new();
        self.clock
            .schedule_control(id, at, ControlAction::SetSpeed(speed));
        Ok(id)
    }

    /// Schedules a pause at an absolute virtual time.
    pub fn set_pause_time(&mut self, at: f64) -> AlarmId {
        let id = AlarmId::new();
        self.clock.schedule_control(id, at, ControlAction::Pause);
        id
    }

    /// Schedules a full stop (teardown of all agents) at an absolute
    /// virtual time.
    pub fn set_stop_time(&mut self, at: f64) -> AlarmId {
        let id = AlarmId::new();
        self.clock.schedule_control(id, at, ControlAction::Stop);
        id
    }

    /// Schedules an alarm owned by a registered agent.
    pub fn set_alarm(
        &mut self,
        owner: AgentId,
        request: AlarmRequest,
    ) -> Result<AlarmId, KernelError> {
        if !self.slots.contains_key(&owner) {
            return Err(KernelError::UnknownAgent(owner));
        }
        let spec = request.resolve(self.clock.now())?;
        if let Some(payload) = &spec.payload {
            if payload.topic().is_empty() {
                return Err(KernelError::EmptyTopic);
            }
            if !payload.is_copyable() && !self.config.allow_opaque_messages {
                return Err(KernelError::NotCopyable {
                    topic: payload.topic().to_string(),
                });
            }
        }
        let id = AlarmId::new();
        self.clock.schedule(id, Some(owner), spec);
        Ok(id)
    }

    /// Cancels a pending alarm.
    pub fn cancel_alarm(&mut self, id: AlarmId) {
        self.clock.cancel(id);
    }

    /// Cancels every alarm owned by an agent.
    pub fn clear_alarms(&mut self, owner: AgentId) {
        self.clock.clear_owned(owner);
    }

    /// Pending agent alarms, optionally filtered by owner.
    pub fn list_alarms(&self, owner: Option<AgentId>) -> Vec<AlarmInfo> {
        self.clock.list_alarms(owner)
    }

    // -- subscriptions & injection -------------------------------

    /// Subscribes a registered agent to a subject.
    pub fn subscribe(
        &mut self,
        agent: AgentId,
        subject: impl Into<Subject>,
    ) -> Result<(), KernelError> {
        if !self.slots.contains_key(&agent) {
            return Err(KernelError::UnknownAgent(agent));
        }
        self.router.subscribe(agent, subject.into());
        Ok(())
    }

    /// Drops one of a registered agent's subscriptions.
    pub fn unsubscribe(
        &mut self,
        agent: AgentId,
        subject: impl Into<Subject>,
    ) -> Result<(), KernelError> {
        if !self.slots.contains_key(&agent) {
            return Err(KernelError::UnknownAgent(agent));
        }
        self.router.unsubscribe(agent, &subject.into());
        Ok(())
    }

    /// Subjects an agent is subscribed to.
    pub fn subscriptions(&self, agent: AgentId) -> Vec<Subject> {
        self.router.subscriptions(agent)
    }

    /// Sets an agent's keep-awake flag from outside.
    pub fn set_keep_awake(&mut self, id: AgentId, value: bool) -> Result<(), KernelError> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(KernelError::UnknownAgent(id))?;
        slot.keep_awake = value;
        Ok(())
    }

    /// Injects a system-originated message into the outbox. Delivered on
    /// the next cycle like any agent send.
    pub fn post(&mut self, env: Envelope) -> Result<(), KernelError> {
        if env.topic().is_empty() {
            return Err(KernelError::EmptyTopic);
        }
        if !env.is_copyable() && !self.config.allow_opaque_messages {
            return Err(KernelError::NotCopyable {
                topic: env.topic().to_string(),
            });
        }
        self.outbox.push_back(env);
        Ok(())
    }

    // -- run control ---------------------------------------------

    /// Loops cycles until one termination condition fires. State is
    /// retained; a subsequent `run` resumes where this one returned.
    pub fn run(&mut self, options: RunOptions) -> Result<RunReport, KernelError> {
        if let Some(speed) = options.clock_speed {
            self.clock.set_speed(speed)?;
        }
        if let Some(seconds) = options.seconds {
            if seconds < 0.0 {
                return Err(KernelError::NegativeAlarmInterval(seconds));
            }
        }
        self.pause_requested = false;
        self.stop_requested = false;
        self.clock.resume();
        let deadline = options.seconds.map(|seconds| {
            let id = AlarmId::new();
            let at = self.clock.now() + seconds;
            self.clock.schedule_control(id, at, ControlAction::Pause);
            id
        });

        let mut cycles: u64 = 0;
        let outcome = self.run_loop(&options, &mut cycles);

        // A stale virtual-time bound must not fire in a later run.
        if let Some(id) = deadline {
            self.clock.cancel(id);
        }
        self.clock.pause();

        let reason = outcome?;
        debug!(?reason, cycles, time = self.clock.now(), "run returned");
        Ok(RunReport {
            reason,
            cycles,
            time: self.clock.now(),
        })
    }

    fn run_loop(
        &mut self,
        options: &RunOptions,
        cycles: &mut u64,
    ) -> Result<StopReason, KernelError> {
        let mut remaining = options.iterations;
        if remaining == Some(0) {
            return Ok(StopReason::Iterations);
        }
        loop {
            let status = self.run_cycle()?;
            *cycles += 1;

            if self.stop_requested {
                self.shutdown_agents();
                return Ok(StopReason::Stopped);
            }
            if self.pause_requested {
                return Ok(StopReason::Paused);
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
                if *n == 0 {
                    return Ok(StopReason::Iterations);
                }
            }
            if status.idle {
                if options.pause_if_idle {
                    return Ok(StopReason::Idle);
                }
                return Ok(StopReason::Drained);
            }
            if !status.worked && !self.clock.is_jumping() {
                std::thread::sleep(self.config.idle_sleep);
            }
        }
    }

    // -- the cycle -----------------------------------------------

    fn run_cycle(&mut self) -> Result<CycleStatus, KernelError> {
        self.cycle += 1;
        self.stats.cycles = self.cycle;
        let mut worked = false;
        let mut first_err: Option<KernelError> = None;

        // 1. clock advance
        self.clock.advance();
        let quiescent = self.outbox.is_empty() && self.hot.is_empty() && !self.any_keep_awake();
        if self.clock.is_jumping() && quiescent {
            if let Some(at) = self.clock.next_event_time() {
                debug!(from = self.clock.now(), to = at, "jumping to next event");
                self.clock.jump_to(at);
            }
        }
        let now = self.clock.now();

        // 2. alarm firing
        while let Some(alarm) = self.clock.pop_due(now) {
            if alarm.ignore_if_idle && quiescent {
                self.stats.alarms_discarded += 1;
                debug!(alarm = %alarm.id, "alarm due while idle; discarded");
                continue;
            }
            self.stats.alarms_fired += 1;
            worked = true;
            match alarm.payload {
                AlarmPayload::Control(action) => self.apply_control(action),
                AlarmPayload::Wake => {
                    // The sentinel is routed like any payload, so watchers
                    // subscribed to the owner's id see the wake event too.
                    if let Some(owner) = alarm.owner {
                        if let Err(err) = self.route(Envelope::to_agent(owner, WakeUp)) {
                            first_err.get_or_insert(err);
                        }
                    }
                }
                AlarmPayload::Deliver(env) => {
                    if let Err(err) = self.route(env) {
                        first_err.get_or_insert(err);
                    }
                }
            }
        }

        // 3. outbox flush
        if !self.outbox.is_empty() {
            worked = true;
        }
        let outbound: Vec<Envelope> = self.outbox.drain(..).collect();
        for env in outbound {
            if let Err(err) = self.route(env) {
                first_err.get_or_insert(err);
            }
        }

        // 4. activation pass
        let ready = self.activation_set();
        if !ready.is_empty() {
            worked = true;
        }
        let jobs: Vec<Job> = ready
            .into_iter()
            .filter_map(|id| self.prepare_job(id, Phase::Update, now))
            .collect();
        let results = self.execute_jobs(jobs);
        for result in results {
            if let Err(err) = self.absorb(result) {
                first_err.get_or_insert(err);
            }
        }

        // 5. idle detection
        let idle = self.outbox.is_empty()
            && self.hot.is_empty()
            && !self.any_keep_awake()
            && !self.clock.has_pending_work();

        match first_err {
            Some(err) => Err(err),
            None => Ok(CycleStatus { idle, worked }),
        }
    }

    fn apply_control(&mut self, action: ControlAction) {
        match action {
            ControlAction::SetSpeed(speed) => {
                info!(?speed, "timed clock speed change");
                if let Err(err) = self.clock.set_speed(speed) {
                    warn!(error = %err, "timed speed change rejected");
                }
            }
            ControlAction::Pause => self.pause_requested = true,
            ControlAction::Stop => self.stop_requested = true,
        }
    }

    /// Hot agents plus keep-awake agents, in ascending uuid order.
    fn activation_set(&self) -> Vec<AgentId> {
        let mut ready: BTreeSet<AgentId> = self.hot.clone();
        for (id, slot) in &self.slots {
            if slot.keep_awake {
                ready.insert(*id);
            }
        }
        ready
            .into_iter()
            .filter(|id| {
                self.slots
                    .get(id)
                    .is_some_and(|slot| slot.lifecycle == Lifecycle::Live)
            })
            .collect()
    }

    fn any_keep_awake(&self) -> bool {
        self.slots
            .values()
            .any(|slot| slot.keep_awake && slot.lifecycle == Lifecycle::Live)
    }

    fn prepare_job(&mut self, id: AgentId, phase: Phase, now: f64) -> Option<Job> {
        let alarms = self.clock.list_alarms(Some(id));
        let slot = self.slots.get_mut(&id)?;
        let agent = slot.agent.take()?;
        Some(Job {
            id,
            phase,
            agent,
            inbox: std::mem::take(&mut slot.inbox),
            keep_awake: slot.keep_awake,
            alarms,
            now,
            cycle: self.cycle,
            allow_opaque: self.config.allow_opaque_messages,
        })
    }

    /// Runs jobs in-process, or on scoped worker threads in
    /// order-preserving chunks. Either way the caller absorbs results in
    /// activation order, so observable semantics do not depend on the mode.
    fn execute_jobs(&self, jobs: Vec<Job>) -> Vec<JobResult> {
        let workers = self.config.workers;
        if workers <= 1 || jobs.len() <= 1 {
            return jobs.into_iter().map(run_job).collect();
        }

        let chunk_size = jobs.len().div_ceil(workers);
        let mut chunks: Vec<Vec<Job>> = Vec::new();
        let mut jobs = jobs.into_iter();
        loop {
            let chunk: Vec<Job> = jobs.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| {
                    scope.spawn(move || chunk.into_iter().map(run_job).collect::<Vec<JobResult>>())
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(results) => results,
                    Err(_) => {
                        error!("activation worker panicked outside an agent hook");
                        Vec::new()
                    }
                })
                .collect()
        })
    }

    fn absorb(&mut self, result: JobResult) -> Result<(), KernelError> {
        let JobResult {
            id,
            phase,
            agent,
            inbox,
            keep_awake,
            outbox,
            ops,
            fault,
        } = result;

        if let Some(slot) = self.slots.get_mut(&id) {
            slot.agent = Some(agent);
            slot.inbox = inbox;
            slot.keep_awake = keep_awake;
            if slot.inbox.is_empty() {
                self.hot.remove(&id);
            } else {
                self.hot.insert(id);
            }
        }
        self.outbox.extend(outbox);
        self.apply_ops(id, ops);

        if let Some(detail) = fault {
            return self.handle_fault(id, phase, detail);
        }
        Ok(())
    }

    fn apply_ops(&mut self, owner: AgentId, ops: Vec<ControlOp>) {
        for op in ops {
            match op {
                ControlOp::Subscribe(subject) => self.router.subscribe(owner, subject),
                ControlOp::Unsubscribe(subject) => self.router.unsubscribe(owner, &subject),
                ControlOp::SetAlarm(id, spec) => self.clock.schedule(id, Some(owner), spec),
                ControlOp::CancelAlarm(id) => self.clock.cancel(id),
                ControlOp::ClearAlarms => self.clock.clear_owned(owner),
                ControlOp::AddAgent(id, agent) => {
                    if let Err(err) = self.insert_agent(id, agent) {
                        warn!(requested_by = %owner, error = %err, "deferred registration failed");
                    }
                }
                ControlOp::RemoveAgent(id) => {
                    if let Err(err) = self.remove(id) {
                        warn!(requested_by = %owner, error = %err, "deferred removal failed");
                    }
                }
                ControlOp::Pause => self.pause_requested = true,
                ControlOp::Stop => self.stop_requested = true,
            }
        }
    }

    fn handle_fault(
        &mut self,
        id: AgentId,
        phase: Phase,
        detail: String,
    ) -> Result<(), KernelError> {
        self.stats.agent_faults += 1;
        let time = self.clock.now();
        error!(
            cycle = self.cycle,
            time,
            agent = %id,
            phase = phase.name(),
            detail = %detail,
            "agent fault; retiring agent"
        );
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.lifecycle = Lifecycle::Retired;
        }

        // Best-effort teardown; a second fault is only logged.
        if phase != Phase::Teardown {
            if let Some(job) = self.prepare_job(id, Phase::Teardown, time) {
                let result = run_job(job);
                let teardown_faulted = result.fault.is_some();
                if let Some(slot) = self.slots.get_mut(&result.id) {
                    slot.agent = Some(result.agent);
                    slot.inbox = result.inbox;
                    slot.keep_awake = result.keep_awake;
                }
                self.outbox.extend(result.outbox);
                self.apply_ops(id, result.ops);
                if teardown_faulted {
                    warn!(agent = %id, "teardown also faulted");
                }
            }
        }
        self.drop_slot(id);

        if self.config.strict {
            return Err(KernelError::AgentFault {
                agent: id,
                phase: phase.name(),
                cycle: self.cycle,
                time,
                detail,
            });
        }
        Ok(())
    }

    // -- routing & delivery --------------------------------------

    fn route(&mut self, env: Envelope) -> Result<(), KernelError> {
        match self.router.resolve(&env) {
            Resolution::Deliver(recipients) => {
                self.stats.messages_routed += 1;
                // The first recipient receives the original; each extra
                // recipient one copy.
                let mut deliveries: Vec<(AgentId, Envelope)> =
                    Vec::with_capacity(recipients.len());
                for extra in &recipients[1..] {
                    match env.copy() {
                        Ok(copy) => {
                            self.stats.copies_made += 1;
                            deliveries.push((*extra, copy));
                        }
                        Err(err) => {
                            // Opaque fan-out in performance mode.
                            self.stats.messages_dropped += 1;
                            warn!(
                                topic = env.topic(),
                                recipient = %extra,
                                error = %err,
                                "cannot copy message for extra recipient; dropped"
                            );
                        }
                    }
                }
                deliveries.insert(0, (recipients[0], env));
                for (recipient, message) in deliveries {
                    self.deliver(recipient, message);
                }
                Ok(())
            }
            Resolution::NoSubscribers => {
                self.stats.messages_dropped += 1;
                debug!(topic = env.topic(), "broadcast with no subscribers; dropped");
                Ok(())
            }
            Resolution::UnknownReceiver => {
                self.stats.messages_dropped += 1;
                if self.config.strict {
                    return Err(KernelError::UnknownReceiver {
                        id: env.id(),
                        address: env.address().clone(),
                    });
                }
                debug!(
                    topic = env.topic(),
                    address = %env.address(),
                    "unknown receiver; message dropped"
                );
                Ok(())
            }
        }
    }

    fn deliver(&mut self, recipient: AgentId, env: Envelope) {
        if !self.slots.contains_key(&recipient) {
            self.stats.messages_dropped += 1;
            debug!(recipient = %recipient, topic = env.topic(), "recipient vanished; dropped");
            return;
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.push(DeliveryRecord {
                cycle: self.cycle,
                time: self.clock.now(),
                sender: env.sender(),
                recipient,
                topic: env.topic().to_string(),
            });
        }
        if let Some(slot) = self.slots.get_mut(&recipient) {
            slot.inbox.push_back(env);
        }
        self.hot.insert(recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use std::any::Any;

    #[derive(Debug, Clone)]
    struct Note;

    impl MessageBody for Note {
        fn tag(&self) -> &'static str {
            "note"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    /// Counts lifecycle calls; pauses the scheduler when woken with
    /// keep_awake, mirroring a cooperative agent that yields.
    #[derive(Default)]
    struct Probe {
        setups: u32,
        updates: u32,
        received: Vec<String>,
    }

    impl Agent for Probe {
        fn class_tag(&self) -> &'static str {
            "Probe"
        }

        fn setup(&mut self, _ctx: &mut AgentContext) {
            self.setups += 1;
        }

        fn update(&mut self, ctx: &mut AgentContext) {
            self.updates += 1;
            while let Some(msg) = ctx.receive() {
                self.received.push(msg.topic().to_string());
            }
            if ctx.keep_awake() {
                ctx.pause();
                ctx.set_keep_awake(false);
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Unportable;

    impl Agent for Unportable {
        fn class_tag(&self) -> &'static str {
            "Unportable"
        }

        fn update(&mut self, _ctx: &mut AgentContext) {}

        fn portable(&self) -> bool {
            false
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Panicker;

    impl Agent for Panicker {
        fn class_tag(&self) -> &'static str {
            "Panicker"
        }

        fn update(&mut self, _ctx: &mut AgentContext) {
            panic!("boom");
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_add_runs_setup_and_auto_subscribes() {
        let mut s = Scheduler::simulated();
        let id = s.add(Probe::default()).unwrap();

        assert_eq!(s.agent::<Probe>(id).unwrap().setups, 1);
        let subs = s.subscriptions(id);
        assert!(subs.contains(&Subject::Agent(id)));
        assert!(subs.contains(&Subject::Topic("Probe".into())));
    }

    #[test]
    fn test_duplicate_uuid_is_rejected() {
        let mut s = Scheduler::simulated();
        let id = AgentId::from_seed(1);
        s.add_with_id(id, Probe::default()).unwrap();
        let err = s.add_with_id(id, Probe::default()).unwrap_err();
        assert!(matches!(err, KernelError::DuplicateAgent(_)));
    }

    #[test]
    fn test_unportable_agent_is_rejected() {
        let mut s = Scheduler::simulated();
        let err = s.add(Unportable).unwrap_err();
        assert!(matches!(err, KernelError::AgentNotPortable { .. }));
        assert!(s.agent_ids().is_empty());
    }

    #[test]
    fn test_pinned_agents_mode_admits_unportable_agents() {
        let mut s = Scheduler::with_config(SchedulerConfig {
            mode: ClockMode::Simulated,
            clock_speed: ClockSpeed::Jump,
            allow_pinned_agents: true,
            ..SchedulerConfig::default()
        })
        .unwrap();
        assert!(s.add(Unportable).is_ok());
    }

    #[test]
    fn test_remove_runs_teardown_and_cleans_up() {
        let mut s = Scheduler::simulated();
        let id = s.add(Probe::default()).unwrap();
        s.set_alarm(id, AlarmRequest::after(10.0)).unwrap();

        s.remove(id).unwrap();
        assert!(!s.contains(id));
        assert!(s.subscriptions(id).is_empty());
        assert!(s.list_alarms(Some(id)).is_empty());
        assert!(matches!(s.remove(id), Err(KernelError::UnknownAgent(_))));
    }

    #[test]
    fn test_idle_scheduler_drains_immediately() {
        let mut s = Scheduler::simulated();
        let id = s.add(Probe::default()).unwrap();

        let report = s.run(RunOptions::default()).unwrap();
        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.cycles, 1);
        assert_eq!(s.agent::<Probe>(id).unwrap().updates, 0);
    }

    #[test]
    fn test_keep_awake_activates_every_cycle() {
        let mut s = Scheduler::simulated();
        let id = s.add(Probe::default()).unwrap();
        s.set_keep_awake(id, true).unwrap();

        let report = s.run(RunOptions::default()).unwrap();
        // The probe pauses on its first keep-awake activation.
        assert_eq!(report.reason, StopReason::Paused);
        assert_eq!(s.agent::<Probe>(id).unwrap().updates, 1);
    }

    #[test]
    fn test_post_delivers_next_cycle() {
        let mut s = Scheduler::simulated();
        let id = s.add(Probe::default()).unwrap();

        s.post(Envelope::to_agent(id, Note)).unwrap();
        s.run(RunOptions::for_iterations(1)).unwrap();

        let probe = s.agent::<Probe>(id).unwrap();
        assert_eq!(probe.received, vec!["note".to_string()]);
        assert_eq!(s.stats().messages_routed, 1);
    }

    #[test]
    fn test_post_rejects_empty_topic() {
        let mut s = Scheduler::simulated();
        let err = s.post(Envelope::broadcast(Note).with_topic("")).unwrap_err();
        assert!(matches!(err, KernelError::EmptyTopic));
    }

    #[test]
    fn test_unknown_receiver_is_dropped_by_default() {
        let mut s = Scheduler::simulated();
        s.add(Probe::default()).unwrap();
        s.post(Envelope::to_agent(AgentId::from_seed(99), Note)).unwrap();

        s.run(RunOptions::for_iterations(1)).unwrap();
        assert_eq!(s.stats().messages_dropped, 1);
    }

    #[test]
    fn test_unknown_receiver_errors_in_strict_mode() {
        let mut s = Scheduler::with_config(SchedulerConfig {
            mode: ClockMode::Simulated,
            clock_speed: ClockSpeed::Jump,
            strict: true,
            ..SchedulerConfig::default()
        })
        .unwrap();
        s.add(Probe::default()).unwrap();
        s.post(Envelope::to_agent(AgentId::from_seed(99), Note)).unwrap();

        let err = s.run(RunOptions::for_iterations(1)).unwrap_err();
        assert!(matches!(err, KernelError::UnknownReceiver { .. }));
        // The scheduler remains runnable.
        assert!(s.run(RunOptions::for_iterations(1)).is_ok());
    }

    #[test]
    fn test_agent_fault_retires_agent_and_continues() {
        let mut s = Scheduler::simulated();
        let victim = s.add(Panicker).unwrap();
        let bystander = s.add(Probe::default()).unwrap();

        s.post(Envelope::to_agent(victim, Note)).unwrap();
        s.post(Envelope::to_agent(bystander, Note)).unwrap();
        let report = s.run(RunOptions::for_iterations(1)).unwrap();

        assert_eq!(report.reason, StopReason::Iterations);
        assert!(!s.contains(victim));
        assert!(s.contains(bystander));
        assert_eq!(s.stats().agent_faults, 1);
        assert_eq!(s.agent::<Probe>(bystander).unwrap().received.len(), 1);
    }

    #[test]
    fn test_agent_fault_is_an_error_in_strict_mode() {
        let mut s = Scheduler::with_config(SchedulerConfig {
            mode: ClockMode::Simulated,
            clock_speed: ClockSpeed::Jump,
            strict: true,
            ..SchedulerConfig::default()
        })
        .unwrap();
        let victim = s.add(Panicker).unwrap();
        s.post(Envelope::to_agent(victim, Note)).unwrap();

        let err = s.run(RunOptions::for_iterations(1)).unwrap_err();
        assert!(matches!(err, KernelError::AgentFault { .. }));
    }

    #[test]
    fn test_simulated_config_rejects_wall_rate() {
        let err = Scheduler::with_config(SchedulerConfig {
            mode: ClockMode::Simulated,
            clock_speed: ClockSpeed::Rate(2.0),
            ..SchedulerConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, KernelError::SpeedUnsupported));
    }

    #[test]
    fn test_run_zero_iterations_returns_immediately() {
        let mut s = Scheduler::simulated();
        let report = s.run(RunOptions::for_iterations(0)).unwrap();
        assert_eq!(report.reason, StopReason::Iterations);
        assert_eq!(report.cycles, 0);
    }

    #[test]
    fn test_stale_seconds_bound_does_not_leak_into_next_run() {
        let mut s = Scheduler::simulated();
        let id = s.add(Probe::default()).unwrap();

        // Iterations bound fires first; the 100 s pause alarm must not
        // survive into the next run.
        s.set_keep_awake(id, true).unwrap();
        let report = s
            .run(RunOptions {
                seconds: Some(100.0),
                iterations: Some(1),
                ..RunOptions::default()
            })
            .unwrap();
        assert_eq!(report.reason, StopReason::Paused);

        let report = s.run(RunOptions::default()).unwrap();
        assert_ne!(report.time, 100.0);
    }

    #[test]
    fn test_agents_can_add_and_remove_agents() {
        struct Spawner {
            child: Option<AgentId>,
        }

        impl Agent for Spawner {
            fn class_tag(&self) -> &'static str {
                "Spawner"
            }

            fn update(&mut self, ctx: &mut AgentContext) {
                ctx.receive();
                if self.child.is_none() {
                    self.child = Some(ctx.add_agent(Probe::default()));
                }
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let mut s = Scheduler::simulated();
        let spawner = s.add(Spawner { child: None }).unwrap();
        s.post(Envelope::to_agent(spawner, Note)).unwrap();
        s.run(RunOptions::for_iterations(2)).unwrap();

        let child = s.agent::<Spawner>(spawner).unwrap().child.unwrap();
        assert!(s.contains(child));
        assert_eq!(s.agent::<Probe>(child).unwrap().setups, 1);
    }
}
