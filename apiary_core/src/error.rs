//! Error types for the kernel.
//!
//! All fallible public APIs return `Result<T, KernelError>`. Registration,
//! message-contract and clock errors are fatal to the offending call but
//! leave the scheduler runnable; routing problems are log-and-drop unless
//! strict mode is enabled.

use crate::message::{Address, AgentId, MessageId};
use thiserror::Error;

/// Errors surfaced by the scheduler, router and clock.
#[derive(Debug, Error)]
pub enum KernelError {
    // -- registration --------------------------------------------
    /// An agent with this uuid is already registered.
    #[error("agent {0} is already registered")]
    DuplicateAgent(AgentId),

    /// The agent declared itself non-portable and pinned agents are disabled.
    #[error("agent {agent} ({class}) is not portable and pinned agents are disabled")]
    AgentNotPortable { agent: AgentId, class: &'static str },

    /// The referenced agent is not registered.
    #[error("agent {0} is not registered")]
    UnknownAgent(AgentId),

    // -- message contract ----------------------------------------
    /// Envelopes must carry a non-empty topic.
    #[error("message topic is empty")]
    EmptyTopic,

    /// The envelope has no copy capability.
    #[error("message with topic '{topic}' has no copy capability")]
    NotCopyable { topic: String },

    // -- routing (strict mode only) ------------------------------
    /// No recipient could be resolved for the message.
    #[error("no recipient for message {id} addressed to {address}")]
    UnknownReceiver { id: MessageId, address: Address },

    // -- clock ---------------------------------------------------
    /// Virtual time is monotone; it cannot be set backwards.
    #[error("cannot move time backwards: now={now}, requested={requested}")]
    TimeReversed { now: f64, requested: f64 },

    /// Relative alarm intervals must be non-negative.
    #[error("alarm interval must be non-negative, got {0}")]
    NegativeAlarmInterval(f64),

    /// A simulated clock never tracks wall time.
    #[error("a simulated clock cannot run at a wall-clock rate")]
    SpeedUnsupported,

    // -- agent faults --------------------------------------------
    /// A panic escaped an agent lifecycle hook.
    #[error("agent {agent} faulted during {phase} (cycle {cycle}, t={time}): {detail}")]
    AgentFault {
        agent: AgentId,
        phase: &'static str,
        cycle: u64,
        time: f64,
        detail: String,
    },
}
