//! Demo agents used by the scenarios.
//!
//! These live outside the kernel on purpose: the kernel ships no agents,
//! only the contract. The ping-pong players show `Operations` dispatch,
//! the auction shows class-tag multicast plus alarms.

use apiary_core::{
    Agent, AgentContext, AgentId, AlarmRequest, Envelope, MessageBody, Operations, WakeUp,
};
use std::any::Any;
use tracing::{debug, warn};

// -- ping-pong -----------------------------------------------------------

/// The ball. The topic ("ping"/"pong"/"smash") is the signal; the body
/// just carries a rally counter for the fun of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ball {
    pub rally: u32,
}

impl MessageBody for Ball {
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

/// Returns every ball until its rally limit, then smashes.
pub struct PingPongPlayer {
    ops: Operations<PingPongPlayer>,
    limit: u32,
    /// Balls this player has returned.
    pub rallies: u32,
    /// "won!" or "beaten!" once the rally ends.
    pub outcome: Option<&'static str>,
}

impl PingPongPlayer {
    pub fn new(limit: u32) -> Self {
        let mut ops = Operations::new();
        ops.on("ping", Self::hit);
        ops.on("pong", Self::hit);
        ops.on("smash", Self::concede);
        Self {
            ops,
            limit,
            rallies: 0,
            outcome: None,
        }
    }

    fn hit(&mut self, ctx: &mut AgentContext, msg: Envelope) {
        let Some(opponent) = msg.sender() else {
            return;
        };
        self.rallies += 1;
        let rally = msg.body::<Ball>().map(|ball| ball.rally).unwrap_or(0) + 1;
        let topic = if self.rallies >= self.limit {
            self.outcome = Some("won!");
            "smash"
        } else if msg.topic() == "ping" {
            "pong"
        } else {
            "ping"
        };
        ctx.send(Envelope::to_agent(opponent, Ball { rally }).with_topic(topic))
            .unwrap_or_else(|err| warn!(%err, "dropped the ball"));
    }

    fn concede(&mut self, _ctx: &mut AgentContext, _msg: Envelope) {
        self.outcome = Some("beaten!");
    }
}

impl Agent for PingPongPlayer {
    fn class_tag(&self) -> &'static str {
        "PingPongPlayer"
    }

    fn update(&mut self, ctx: &mut AgentContext) {
        while let Some(msg) = ctx.receive() {
            match self.ops.get(msg.topic()) {
                Some(op) => op(self, ctx, msg),
                None => debug!(topic = msg.topic(), "no handler; message dropped"),
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// -- broadcast -----------------------------------------------------------

/// Subscribes to one topic and counts what arrives.
pub struct Listener {
    topic: &'static str,
    pub heard: u32,
}

impl Listener {
    pub fn new(topic: &'static str) -> Self {
        Self { topic, heard: 0 }
    }
}

impl Agent for Listener {
    fn class_tag(&self) -> &'static str {
        "Listener"
    }

    fn setup(&mut self, ctx: &mut AgentContext) {
        ctx.subscribe(self.topic);
    }

    fn update(&mut self, ctx: &mut AgentContext) {
        while ctx.receive().is_some() {
            self.heard += 1;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// -- alarm chain ---------------------------------------------------------

/// Re-arms a relative alarm a fixed number of times; the simulated clock
/// jumps from chime to chime.
pub struct Metronome {
    interval: f64,
    rounds: u32,
    pub chimes: u32,
}

impl Metronome {
    pub fn new(interval: f64, rounds: u32) -> Self {
        Self {
            interval,
            rounds,
            chimes: 0,
        }
    }
}

impl Agent for Metronome {
    fn class_tag(&self) -> &'static str {
        "Metronome"
    }

    fn setup(&mut self, ctx: &mut AgentContext) {
        if self.rounds > 0 {
            if let Err(err) = ctx.set_alarm(AlarmRequest::after(self.interval)) {
                warn!(%err, "failed to arm metronome");
            }
        }
    }

    fn update(&mut self, ctx: &mut AgentContext) {
        while let Some(msg) = ctx.receive() {
            if msg.topic() != WakeUp::TAG {
                continue;
            }
            self.chimes += 1;
            // Cooperative deduplication: never more than one alarm pending.
            if self.chimes < self.rounds && ctx.list_alarms().is_empty() {
                if let Err(err) = ctx.set_alarm(AlarmRequest::after(self.interval)) {
                    warn!(%err, "failed to re-arm metronome");
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// -- auction -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CallForBids {
    pub item: String,
    pub reserve: f64,
}

impl MessageBody for CallForBids {
    fn tag(&self) -> &'static str {
        "call_for_bids"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub item: String,
    pub amount: f64,
}

impl MessageBody for Bid {
    fn tag(&self) -> &'static str {
        "bid"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Award {
    pub item: String,
    pub amount: f64,
}

impl MessageBody for Award {
    fn tag(&self) -> &'static str {
        "award"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// First-price, sealed-bid auctioneer. Calls for bids at startup, closes
/// when its deadline alarm fires.
pub struct Auctioneer {
    item: String,
    reserve: f64,
    deadline: f64,
    bids: Vec<(AgentId, f64)>,
    pub winner: Option<(AgentId, f64)>,
}

impl Auctioneer {
    pub fn new(item: impl Into<String>, reserve: f64, deadline: f64) -> Self {
        Self {
            item: item.into(),
            reserve,
            deadline,
            bids: Vec::new(),
            winner: None,
        }
    }

    fn close(&mut self, ctx: &mut AgentContext) {
        let best = self
            .bids
            .iter()
            .filter(|(_, amount)| *amount >= self.reserve)
            .max_by(|(id_a, a), (id_b, b)| {
                // Highest bid wins; ties break on agent id so the outcome
                // is stable.
                a.total_cmp(b).then_with(|| id_b.cmp(id_a))
            })
            .copied();
        match best {
            Some((bidder, amount)) => {
                debug!(item = %self.item, bidder = %bidder, amount, "auction closed");
                self.winner = Some((bidder, amount));
                let award = Award {
                    item: self.item.clone(),
                    amount,
                };
                ctx.send(Envelope::to_agent(bidder, award))
                    .unwrap_or_else(|err| warn!(%err, "failed to send award"));
            }
            None => debug!(item = %self.item, "auction closed with no qualifying bids"),
        }
    }
}

impl Agent for Auctioneer {
    fn class_tag(&self) -> &'static str {
        "Auctioneer"
    }

    fn setup(&mut self, ctx: &mut AgentContext) {
        let call = CallForBids {
            item: self.item.clone(),
            reserve: self.reserve,
        };
        ctx.send(Envelope::to_class("Bidder", call))
            .unwrap_or_else(|err| warn!(%err, "failed to call for bids"));
        if let Err(err) = ctx.set_alarm(AlarmRequest::after(self.deadline)) {
            warn!(%err, "failed to set auction deadline");
        }
    }

    fn update(&mut self, ctx: &mut AgentContext) {
        while let Some(msg) = ctx.receive() {
            if msg.topic() == WakeUp::TAG {
                self.close(ctx);
            } else if let Some(bid) = msg.body::<Bid>() {
                if let Some(bidder) = msg.sender() {
                    self.bids.push((bidder, bid.amount));
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Bids its whole budget on any call whose reserve it can afford.
pub struct Bidder {
    budget: f64,
    pub won: Option<Award>,
}

impl Bidder {
    pub fn new(budget: f64) -> Self {
        Self { budget, won: None }
    }
}

impl Agent for Bidder {
    fn class_tag(&self) -> &'static str {
        "Bidder"
    }

    fn update(&mut self, ctx: &mut AgentContext) {
        while let Some(msg) = ctx.receive() {
            if let Some(award) = msg.body::<Award>() {
                self.won = Some(award.clone());
                continue;
            }
            let Some(call) = msg.body::<CallForBids>() else {
                continue;
            };
            if call.reserve > self.budget {
                continue;
            }
            let Some(auctioneer) = msg.sender() else {
                continue;
            };
            let bid = Bid {
                item: call.item.clone(),
                amount: self.budget,
            };
            ctx.send(Envelope::to_agent(auctioneer, bid))
                .unwrap_or_else(|err| warn!(%err, "failed to bid"));
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
