//! The agent contract and the capability handle agents act through.
//!
//! Agents never touch the scheduler, router or clock directly. Every side
//! effect goes through the [`AgentContext`] passed into the lifecycle
//! hooks: sends are buffered into the cycle's outbox, and mutations of
//! shared structures (subscriptions, alarms, registry changes) become
//! deferred control ops the scheduler applies between activations. That
//! discipline is also what makes the parallel activation mode sound.

use crate::clock::{AlarmId, AlarmInfo, AlarmRequest, AlarmSpec};
use crate::error::KernelError;
use crate::message::{AgentId, Envelope};
use crate::router::Subject;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle of a registered agent. An agent not present in the registry is
/// simply unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Registered, `setup` not yet run.
    SetupPending,

    /// Normal operation.
    Live,

    /// Removal requested, `teardown` not yet run.
    TeardownPending,

    /// Faulted or torn down; no longer activated.
    Retired,
}

/// The contract every simulated agent implements.
///
/// # Contract
/// - `update` must run to completion; there is no preemption.
/// - All side effects go through the context.
/// - Implementations must not retain references to sent messages.
pub trait Agent: Any + Send {
    /// Routing tag shared by all agents of this type. Auto-subscribed at
    /// registration, so `Address::Class(tag)` multicasts reach this agent.
    fn class_tag(&self) -> &'static str;

    /// Called once after registration. May send, subscribe and set alarms.
    fn setup(&mut self, _ctx: &mut AgentContext) {}

    /// Called whenever the agent is hot: non-empty inbox, a fired alarm, or
    /// `keep_awake`.
    fn update(&mut self, ctx: &mut AgentContext);

    /// Called when the agent is removed or the scheduler shuts down.
    fn teardown(&mut self, _ctx: &mut AgentContext) {}

    /// Whether this agent's state may cross a worker boundary. Agents
    /// holding live OS handles (sockets, file descriptors) must return
    /// `false`; they are rejected at registration unless the scheduler
    /// admits pinned agents.
    fn portable(&self) -> bool {
        true
    }

    /// Downcast support for inspection.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Deferred mutations produced during an activation and applied by the
/// scheduler between activations.
#[derive(Debug)]
pub(crate) enum ControlOp {
    Subscribe(Subject),
    Unsubscribe(Subject),
    SetAlarm(AlarmId, AlarmSpec),
    CancelAlarm(AlarmId),
    ClearAlarms,
    AddAgent(AgentId, Box<dyn Agent>),
    RemoveAgent(AgentId),
    Pause,
    Stop,
}

impl fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<agent {}>", self.class_tag())
    }
}

/// The capability handle passed to agent lifecycle hooks.
pub struct AgentContext<'a> {
    id: AgentId,
    now: f64,
    cycle: u64,
    inbox: &'a mut VecDeque<Envelope>,
    keep_awake: &'a mut bool,
    outbox: &'a mut Vec<Envelope>,
    ops: &'a mut Vec<ControlOp>,
    alarms: &'a [AlarmInfo],
    allow_opaque: bool,
}

impl<'a> AgentContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AgentId,
        now: f64,
        cycle: u64,
        inbox: &'a mut VecDeque<Envelope>,
        keep_awake: &'a mut bool,
        outbox: &'a mut Vec<Envelope>,
        ops: &'a mut Vec<ControlOp>,
        alarms: &'a [AlarmInfo],
        allow_opaque: bool,
    ) -> Self {
        Self {
            id,
            now,
            cycle,
            inbox,
            keep_awake,
            outbox,
            ops,
            alarms,
            allow_opaque,
        }
    }

    /// This agent's identity.
    pub fn uuid(&self) -> AgentId {
        self.id
    }

    /// Virtual time, frozen for the duration of the activation.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// The scheduler's cycle counter.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// True if the inbox is non-empty.
    pub fn has_messages(&self) -> bool {
        !self.inbox.is_empty()
    }

    /// Pops the oldest message from the inbox.
    pub fn receive(&mut self) -> Option<Envelope> {
        self.inbox.pop_front()
    }

    /// Enqueues a message for delivery next cycle.
    ///
    /// The envelope must carry a non-empty topic and, unless the scheduler
    /// admits opaque messages, copy capability. The sender is stamped with
    /// this agent's id if unset.
    pub fn send(&mut self, env: Envelope) -> Result<(), KernelError> {
        if env.topic().is_empty() {
            return Err(KernelError::EmptyTopic);
        }
        if !env.is_copyable() && !self.allow_opaque {
            return Err(KernelError::NotCopyable {
                topic: env.topic().to_string(),
            });
        }
        let env = if env.sender().is_none() {
            env.with_sender(self.id)
        } else {
            env
        };
        self.outbox.push(env);
        Ok(())
    }

    /// Subscribes this agent to a topic or agent identity.
    pub fn subscribe(&mut self, subject: impl Into<Subject>) {
        self.ops.push(ControlOp::Subscribe(subject.into()));
    }

    /// Drops a subscription.
    pub fn unsubscribe(&mut self, subject: impl Into<Subject>) {
        self.ops.push(ControlOp::Unsubscribe(subject.into()));
    }

    /// Schedules an alarm owned by this agent. The payload is routed when
    /// the alarm fires; without one the agent receives a wake-up sentinel.
    pub fn set_alarm(&mut self, request: AlarmRequest) -> Result<AlarmId, KernelError> {
        let spec = request.resolve(self.now)?;
        if let Some(payload) = &spec.payload {
            if payload.topic().is_empty() {
                return Err(KernelError::EmptyTopic);
            }
            if !payload.is_copyable() && !self.allow_opaque {
                return Err(KernelError::NotCopyable {
                    topic: payload.topic().to_string(),
                });
            }
        }
        let id = AlarmId::new();
        self.ops.push(ControlOp::SetAlarm(id, spec));
        Ok(id)
    }

    /// Cancels one of this agent's alarms.
    pub fn cancel_alarm(&mut self, id: AlarmId) {
        self.ops.push(ControlOp::CancelAlarm(id));
    }

    /// Cancels every alarm owned by this agent.
    pub fn clear_alarms(&mut self) {
        self.ops.push(ControlOp::ClearAlarms);
    }

    /// Pending alarms owned by this agent, sorted by fire time - snapshot
    /// taken when the activation started. Intended for cooperative
    /// deduplication ("don't set another alarm if one is pending").
    pub fn list_alarms(&self) -> &[AlarmInfo] {
        self.alarms
    }

    /// Whether this agent is activated every cycle.
    pub fn keep_awake(&self) -> bool {
        *self.keep_awake
    }

    /// Requests activation every cycle (or stops requesting it).
    pub fn set_keep_awake(&mut self, value: bool) {
        *self.keep_awake = value;
    }

    /// Asks the scheduler to pause at the end of this cycle. A later `run`
    /// resumes.
    pub fn pause(&mut self) {
        self.ops.push(ControlOp::Pause);
    }

    /// Asks the scheduler to shut down: every live agent is torn down and
    /// the registry discarded.
    pub fn stop(&mut self) {
        self.ops.push(ControlOp::Stop);
    }

    /// Registers another agent. The returned id is assigned immediately;
    /// registration itself is applied between activations.
    pub fn add_agent(&mut self, agent: impl Agent + 'static) -> AgentId {
        let id = AgentId::new();
        self.ops.push(ControlOp::AddAgent(id, Box::new(agent)));
        id
    }

    /// Removes another agent (or this one).
    pub fn remove_agent(&mut self, id: AgentId) {
        self.ops.push(ControlOp::RemoveAgent(id));
    }
}

/// Handler signature for [`Operations`] tables.
pub type OpFn<A> = fn(&mut A, &mut AgentContext, Envelope);

/// A typed topic -> handler table.
///
/// Replaces the runtime-mutable handler mapping of classic agent designs
/// with an explicit registration API. The kernel never interprets it;
/// agents dispatch from their own `update`:
///
/// ```ignore
/// fn update(&mut self, ctx: &mut AgentContext) {
///     while let Some(msg) = ctx.receive() {
///         match self.ops.get(msg.topic()) {
///             Some(op) => op(self, ctx, msg),
///             None => debug!(topic = msg.topic(), "no handler; message dropped"),
///         }
///     }
/// }
/// ```
pub struct Operations<A> {
    handlers: std::collections::BTreeMap<String, OpFn<A>>,
}

impl<A> Operations<A> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            handlers: std::collections::BTreeMap::new(),
        }
    }

    /// Registers a handler for a topic, replacing any previous one.
    pub fn on(&mut self, topic: impl Into<String>, op: OpFn<A>) {
        self.handlers.insert(topic.into(), op);
    }

    /// Looks up the handler for a topic.
    pub fn get(&self, topic: &str) -> Option<OpFn<A>> {
        self.handlers.get(topic).copied()
    }

    /// Registered topics in sorted order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl<A> Default for Operations<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Operations<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Address, MessageBody};

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

    #[derive(Debug)]
    struct NoCopy;

    impl MessageBody for NoCopy {
        fn tag(&self) -> &'static str {
            "no_copy"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    struct Harness {
        inbox: VecDeque<Envelope>,
        keep_awake: bool,
        outbox: Vec<Envelope>,
        ops: Vec<ControlOp>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                inbox: VecDeque::new(),
                keep_awake: false,
                outbox: Vec::new(),
                ops: Vec::new(),
            }
        }

        fn ctx(&mut self, id: AgentId) -> AgentContext<'_> {
            AgentContext::new(
                id,
                0.0,
                1,
                &mut self.inbox,
                &mut self.keep_awake,
                &mut self.outbox,
                &mut self.ops,
                &[],
                false,
            )
        }
    }

    #[test]
    fn test_send_stamps_sender() {
        let id = AgentId::from_seed(1);
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(id);

        ctx.send(Envelope::broadcast(Note)).unwrap();
        assert_eq!(harness.outbox[0].sender(), Some(id));
    }

    #[test]
    fn test_send_rejects_empty_topic() {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(AgentId::from_seed(1));

        let err = ctx.send(Envelope::broadcast(Note).with_topic("")).unwrap_err();
        assert!(matches!(err, KernelError::EmptyTopic));
    }

    #[test]
    fn test_send_rejects_opaque_messages_by_default() {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(AgentId::from_seed(1));

        let err = ctx
            .send(Envelope::opaque(Address::Broadcast, NoCopy))
            .unwrap_err();
        assert!(matches!(err, KernelError::NotCopyable { .. }));
    }

    #[test]
    fn test_receive_is_fifo() {
        let mut harness = Harness::new();
        harness
            .inbox
            .push_back(Envelope::broadcast(Note).with_topic("first"));
        harness
            .inbox
            .push_back(Envelope::broadcast(Note).with_topic("second"));

        let mut ctx = harness.ctx(AgentId::from_seed(1));
        assert!(ctx.has_messages());
        assert_eq!(ctx.receive().unwrap().topic(), "first");
        assert_eq!(ctx.receive().unwrap().topic(), "second");
        assert!(ctx.receive().is_none());
    }

    #[test]
    fn test_set_alarm_rejects_negative_interval() {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(AgentId::from_seed(1));

        let err = ctx.set_alarm(AlarmRequest::after(-0.5)).unwrap_err();
        assert!(matches!(err, KernelError::NegativeAlarmInterval(_)));
        assert!(harness.ops.is_empty());
    }

    #[test]
    fn test_set_alarm_defers_a_resolved_spec() {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(AgentId::from_seed(1));

        let id = ctx.set_alarm(AlarmRequest::after(5.0)).unwrap();
        match &harness.ops[0] {
            ControlOp::SetAlarm(deferred, spec) => {
                assert_eq!(*deferred, id);
                assert_eq!(spec.fire_at, 5.0);
            }
            other => panic!("expected SetAlarm, got {:?}", other),
        }
    }

    #[test]
    fn test_keep_awake_toggles_through_context() {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(AgentId::from_seed(1));
        assert!(!ctx.keep_awake());
        ctx.set_keep_awake(true);
        assert!(ctx.keep_awake());
        drop(ctx);
        assert!(harness.keep_awake);
    }

    #[test]
    fn test_operations_dispatch() {
        struct Counter {
            hits: u32,
            ops: Operations<Counter>,
        }

        fn bump(agent: &mut Counter, _ctx: &mut AgentContext, _msg: Envelope) {
            agent.hits += 1;
        }

        let mut ops = Operations::new();
        ops.on("note", bump);
        let mut counter = Counter { hits: 0, ops };

        let mut harness = Harness::new();
        harness.inbox.push_back(Envelope::broadcast(Note));
        let mut ctx = harness.ctx(AgentId::from_seed(1));

        while let Some(msg) = ctx.receive() {
            if let Some(op) = counter.ops.get(msg.topic()) {
                op(&mut counter, &mut ctx, msg);
            }
        }
        assert_eq!(counter.hits, 1);
        assert!(counter.ops.get("unknown").is_none());
        assert_eq!(counter.ops.topics().collect::<Vec<_>>(), vec!["note"]);
    }
}
