//! Message envelopes and agent identity.
//!
//! Everything agents exchange travels inside an [`Envelope`]: an addressed,
//! topic-tagged carrier for an opaque [`MessageBody`]. Envelopes hold value
//! identifiers only - sender and receiver are ids, never live references -
//! and once an envelope has been handed to `send` it is owned by the kernel
//! and cannot be touched by the sender again.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use uuid::Uuid;

/// Stable identity of an agent.
///
/// Backed by a v4 UUID, so two schedulers can mint ids without ever
/// colliding. Replayable scenarios use [`AgentId::from_seed`] instead of
/// random ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// A fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives a stable identity from a scenario seed.
    ///
    /// The seed fills the high word of the UUID unchanged and a splitmix64
    /// finalizer round fills the low word. Seeded ids therefore sort in
    /// seed order, so activation order (ascending id) follows the order
    /// agents were numbered in a scripted scenario.
    pub fn from_seed(seed: u64) -> Self {
        Self(Uuid::from_u64_pair(seed, splitmix64(seed)))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// splitmix64 finalizer; spreads nearby seeds across the low id bits.
fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Hyphenated UUIDs drown log lines; the high word is enough to tell
        // agents apart, and for seeded ids it is the seed itself in hex.
        let (high, _) = self.0.as_u64_pair();
        write!(f, "{:016x}", high)
    }
}

/// Per-instance identity of a message. Copies receive a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random MessageId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (high, _) = self.0.as_u64_pair();
        write!(f, "{:016x}", high)
    }
}

/// Where an envelope is going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    /// Unicast to a single agent.
    Agent(AgentId),

    /// Multicast to every agent declaring this class tag.
    Class(String),

    /// Routed purely by topic subscription.
    Broadcast,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Agent(id) => write!(f, "agent:{}", id),
            Address::Class(tag) => write!(f, "class:{}", tag),
            Address::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Payload carried by an [`Envelope`].
///
/// Implemented on plain user types. `tag()` names the type for routing and
/// becomes the envelope topic unless overridden; `as_any`/`into_any` support
/// downcasting on receipt.
pub trait MessageBody: Any + fmt::Debug + Send {
    /// The type's routing tag; the default topic of envelopes carrying it.
    fn tag(&self) -> &'static str;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Downcast support for owned bodies.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Sentinel body delivered when an alarm fires without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeUp;

impl WakeUp {
    /// Topic under which wake-up sentinels are delivered.
    pub const TAG: &'static str = "wake_up";
}

impl MessageBody for WakeUp {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Monomorphised clone hook stored by copy-capable envelopes.
type CloneFn = fn(&dyn Any) -> Box<dyn MessageBody>;

/// The message carrier.
///
/// An envelope built with [`Envelope::new`] (or the `to_agent` / `to_class` /
/// `broadcast` shorthands) captures the body's `Clone` impl and can produce
/// independent duplicates on demand, which the router needs for fan-out.
/// [`Envelope::opaque`] builds an envelope *without* that capability; the
/// scheduler only admits those in its documented performance mode.
#[derive(Debug)]
pub struct Envelope {
    sender: Option<AgentId>,
    address: Address,
    topic: String,
    body: Box<dyn MessageBody>,
    clone_body: Option<CloneFn>,
    id: MessageId,
}

impl Envelope {
    /// Creates a copy-capable envelope. The topic defaults to the body's tag.
    pub fn new<B: MessageBody + Clone>(address: Address, body: B) -> Self {
        fn clone_hook<B: MessageBody + Clone>(body: &dyn Any) -> Box<dyn MessageBody> {
            let body = body
                .downcast_ref::<B>()
                .expect("clone hook invoked with a foreign body type");
            Box::new(body.clone())
        }

        let topic = body.tag().to_string();
        Self {
            sender: None,
            address,
            topic,
            body: Box::new(body),
            clone_body: Some(clone_hook::<B>),
            id: MessageId::new(),
        }
    }

    /// Unicast envelope to one agent.
    pub fn to_agent<B: MessageBody + Clone>(receiver: AgentId, body: B) -> Self {
        Self::new(Address::Agent(receiver), body)
    }

    /// Multicast envelope to a class tag.
    pub fn to_class<B: MessageBody + Clone>(tag: impl Into<String>, body: B) -> Self {
        Self::new(Address::Class(tag.into()), body)
    }

    /// Broadcast envelope routed by topic subscription.
    pub fn broadcast<B: MessageBody + Clone>(body: B) -> Self {
        Self::new(Address::Broadcast, body)
    }

    /// Creates an envelope without copy capability.
    ///
    /// Rejected at send time unless the scheduler was configured with
    /// `allow_opaque_messages`, and even then it can only ever reach a single
    /// recipient.
    pub fn opaque<B: MessageBody>(address: Address, body: B) -> Self {
        let topic = body.tag().to_string();
        Self {
            sender: None,
            address,
            topic,
            body: Box::new(body),
            clone_body: None,
            id: MessageId::new(),
        }
    }

    /// Overrides the topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Sets the sender explicitly. `send` stamps the sending agent's id on
    /// envelopes that have none.
    pub fn with_sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// The sending agent, or `None` for system-originated messages.
    pub fn sender(&self) -> Option<AgentId> {
        self.sender
    }

    /// The destination.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The routing topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// This instance's identity.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Whether this envelope can produce copies.
    pub fn is_copyable(&self) -> bool {
        self.clone_body.is_some()
    }

    /// Produces an independent duplicate with a fresh [`MessageId`].
    pub fn copy(&self) -> Result<Envelope, crate::error::KernelError> {
        let clone_body = self.clone_body.ok_or_else(|| {
            crate::error::KernelError::NotCopyable {
                topic: self.topic.clone(),
            }
        })?;
        Ok(Envelope {
            sender: self.sender,
            address: self.address.clone(),
            topic: self.topic.clone(),
            body: clone_body(self.body.as_any()),
            clone_body: self.clone_body,
            id: MessageId::new(),
        })
    }

    /// Borrows the body as a concrete type.
    pub fn body<T: MessageBody>(&self) -> Option<&T> {
        self.body.as_any().downcast_ref()
    }

    /// Takes the body out as a concrete type. The envelope is consumed; a
    /// mismatched type returns `None` and drops the message, so check with
    /// [`Envelope::body`] first when the type is uncertain.
    pub fn take_body<T: MessageBody>(self) -> Option<T> {
        self.body.into_any().downcast::<T>().ok().map(|b| *b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Ping {
        text: String,
    }

    impl MessageBody for Ping {
        fn tag(&self) -> &'static str {
            "ping"
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

    #[test]
    fn test_agent_id_from_seed_is_deterministic() {
        assert_eq!(AgentId::from_seed(7), AgentId::from_seed(7));
        assert_ne!(AgentId::from_seed(7), AgentId::from_seed(8));
    }

    #[test]
    fn test_seeded_ids_sort_in_seed_order() {
        let ids: Vec<AgentId> = (0..20).map(AgentId::from_seed).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_agent_id_display_shows_the_high_word() {
        assert_eq!(format!("{}", AgentId::from_seed(1)), "0000000000000001");
        assert_eq!(format!("{}", AgentId::from_seed(0xbeef)), "000000000000beef");
    }

    #[test]
    fn test_topic_defaults_to_tag() {
        let env = Envelope::broadcast(Ping { text: "hi".into() });
        assert_eq!(env.topic(), "ping");
        assert!(env.sender().is_none());
    }

    #[test]
    fn test_with_topic_overrides_tag() {
        let env = Envelope::broadcast(Ping { text: "hi".into() }).with_topic("pong");
        assert_eq!(env.topic(), "pong");
    }

    #[test]
    fn test_copy_is_independent_instance() {
        let env = Envelope::to_agent(AgentId::from_seed(1), Ping { text: "hi".into() })
            .with_sender(AgentId::from_seed(2));
        let copy = env.copy().unwrap();

        assert_ne!(env.id(), copy.id());
        assert_eq!(env.sender(), copy.sender());
        assert_eq!(env.topic(), copy.topic());
        assert_eq!(env.body::<Ping>().unwrap(), copy.body::<Ping>().unwrap());
    }

    #[test]
    fn test_opaque_envelope_refuses_to_copy() {
        let env = Envelope::opaque(Address::Broadcast, NoCopy);
        assert!(!env.is_copyable());
        assert!(env.copy().is_err());
    }

    #[test]
    fn test_body_downcast() {
        let env = Envelope::broadcast(Ping { text: "hi".into() });
        assert!(env.body::<Ping>().is_some());
        assert!(env.body::<WakeUp>().is_none());

        let ping = env.take_body::<Ping>().unwrap();
        assert_eq!(ping.text, "hi");
    }
}
