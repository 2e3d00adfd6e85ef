//! Apiary - an in-process multi-agent simulation kernel.
//!
//! A population of agents communicates exclusively by messages, driven by a
//! scheduler that owns a virtual clock and a router. Agents are activated
//! deterministically on message arrival and timed alarms; the clock either
//! tracks wall time (at any speed) or jumps straight to the next scheduled
//! event.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         Scheduler                            |
//! |                                                              |
//! |   +--------+      outbox       +--------+                    |
//! |   | Clock  |---- alarms ------>| Router |--- inboxes ---+    |
//! |   +--------+                   +--------+               |    |
//! |        ^                            ^                   v    |
//! |   +----+----------------------------+-------------------+--+ |
//! |   |  Agent   |  Agent   |  Agent   |  Agent   |  Agent  ...| |
//! |   +-----------------------------------------------------+--+ |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use apiary_core::{Agent, AgentContext, Envelope, RunOptions, Scheduler};
//!
//! let mut scheduler = Scheduler::simulated();
//! let receiver = scheduler.add(MyAgent::default())?;
//! scheduler.post(Envelope::to_agent(receiver, Hello))?;
//! scheduler.run(RunOptions::until_idle())?;
//! ```

pub mod agent;
pub mod clock;
pub mod error;
pub mod journal;
pub mod message;
pub mod router;
pub mod scheduler;

// Re-export key types for convenience
pub use agent::{Agent, AgentContext, Lifecycle, OpFn, Operations};
pub use clock::{AlarmId, AlarmInfo, AlarmRequest, ClockMode, ClockSpeed};
pub use error::KernelError;
pub use journal::{DeliveryRecord, Journal};
pub use message::{Address, AgentId, Envelope, MessageBody, MessageId, WakeUp};
pub use router::Subject;
pub use scheduler::{
    RunOptions, RunReport, Scheduler, SchedulerConfig, SchedulerStats, StopReason,
};
