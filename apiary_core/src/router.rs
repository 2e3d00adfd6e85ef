//! Subscription index and message routing - the kernel's mailman.
//!
//! The router resolves each envelope into an ordered recipient list; the
//! scheduler, which owns the inboxes, performs the actual delivery. Both
//! indexes use BTree collections so fan-out order is deterministic
//! (ascending agent id) regardless of subscription order.

use crate::message::{Address, AgentId, Envelope};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A subscription key: a plain topic string or an agent identity.
///
/// Subscribing to an agent's identity delivers a copy of every unicast
/// message addressed to that agent (a "tracker" subscription).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Subject {
    /// A topic string (includes class tags).
    Topic(String),

    /// An agent identity.
    Agent(AgentId),
}

impl From<&str> for Subject {
    fn from(topic: &str) -> Self {
        Subject::Topic(topic.to_string())
    }
}

impl From<String> for Subject {
    fn from(topic: String) -> Self {
        Subject::Topic(topic)
    }
}

impl From<AgentId> for Subject {
    fn from(id: AgentId) -> Self {
        Subject::Agent(id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Topic(topic) => write!(f, "topic:{}", topic),
            Subject::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

/// Resolution of one envelope into recipients.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Deliver in this order; the first recipient receives the original,
    /// the rest receive copies.
    Deliver(Vec<AgentId>),

    /// Broadcast with no listeners on the topic; dropped quietly.
    NoSubscribers,

    /// Unicast to an unregistered agent, or a class tag nobody declares.
    UnknownReceiver,
}

/// The subscription index. Scheduler-owned; agents reach it only through
/// their context.
#[derive(Debug, Default)]
pub(crate) struct Router {
    /// subject -> subscribers.
    lists: BTreeMap<Subject, BTreeSet<AgentId>>,

    /// agent -> subjects, for O(subscribed) teardown.
    reverse: BTreeMap<AgentId, BTreeSet<Subject>>,

    /// Agents that can be direct-delivery targets.
    registered: BTreeSet<AgentId>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks an agent as a valid direct-delivery target.
    pub(crate) fn register(&mut self, agent: AgentId) {
        self.registered.insert(agent);
    }

    /// Removes an agent and all of its subscriptions.
    pub(crate) fn deregister(&mut self, agent: AgentId) {
        self.registered.remove(&agent);
        self.unsubscribe_all(agent);
    }

    /// Adds a subscription. Idempotent.
    pub(crate) fn subscribe(&mut self, agent: AgentId, subject: Subject) {
        self.lists.entry(subject.clone()).or_default().insert(agent);
        self.reverse.entry(agent).or_default().insert(subject);
    }

    /// Removes a subscription. Unknown subscriptions are ignored.
    pub(crate) fn unsubscribe(&mut self, agent: AgentId, subject: &Subject) {
        if let Some(subscribers) = self.lists.get_mut(subject) {
            subscribers.remove(&agent);
            if subscribers.is_empty() {
                self.lists.remove(subject);
            }
        }
        if let Some(subjects) = self.reverse.get_mut(&agent) {
            subjects.remove(subject);
            if subjects.is_empty() {
                self.reverse.remove(&agent);
            }
        }
    }

    /// Drops every subscription held by `agent`.
    pub(crate) fn unsubscribe_all(&mut self, agent: AgentId) {
        if let Some(subjects) = self.reverse.remove(&agent) {
            for subject in subjects {
                if let Some(subscribers) = self.lists.get_mut(&subject) {
                    subscribers.remove(&agent);
                    if subscribers.is_empty() {
                        self.lists.remove(&subject);
                    }
                }
            }
        }
    }

    /// Subjects `agent` is currently subscribed to, in sorted order.
    pub(crate) fn subscriptions(&self, agent: AgentId) -> Vec<Subject> {
        self.reverse
            .get(&agent)
            .map(|subjects| subjects.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribers of a subject, in ascending agent-id order.
    pub(crate) fn subscribers(&self, subject: &Subject) -> Vec<AgentId> {
        self.lists
            .get(subject)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolves an envelope into its recipient list.
    pub(crate) fn resolve(&self, env: &Envelope) -> Resolution {
        match env.address() {
            Address::Agent(id) => {
                if !self.registered.contains(id) {
                    return Resolution::UnknownReceiver;
                }
                // The addressed agent comes first and receives the original;
                // id-subscribers receive copies.
                let mut recipients = vec![*id];
                for watcher in self.subscribers(&Subject::Agent(*id)) {
                    if watcher != *id {
                        recipients.push(watcher);
                    }
                }
                Resolution::Deliver(recipients)
            }
            Address::Class(tag) => {
                let listeners = self.subscribers(&Subject::Topic(tag.clone()));
                if listeners.is_empty() {
                    Resolution::UnknownReceiver
                } else {
                    Resolution::Deliver(listeners)
                }
            }
            Address::Broadcast => {
                let listeners = self.subscribers(&Subject::Topic(env.topic().to_string()));
                if listeners.is_empty() {
                    Resolution::NoSubscribers
                } else {
                    Resolution::Deliver(listeners)
                }
            }
        }
    }
}
