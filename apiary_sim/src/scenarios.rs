//! Deterministic scenarios exercising the kernel end to end.

use crate::agents::{Auctioneer, Ball, Bidder, Listener, Metronome, PingPongPlayer};
use apiary_core::{AgentId, Envelope, RunOptions, Scheduler};
use serde::Serialize;
use tracing::info;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Two players rally a ball until one smashes.
    PingPong,

    /// One broadcast reaches every topic subscriber exactly once.
    Broadcast,

    /// An alarm chain drives the jump clock through virtual time.
    Alarms,

    /// First-price sealed-bid auction over class-tag multicast.
    Auction,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::PingPong,
            ScenarioId::Broadcast,
            ScenarioId::Alarms,
            ScenarioId::Auction,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::PingPong => "ping_pong",
            ScenarioId::Broadcast => "broadcast",
            ScenarioId::Alarms => "alarms",
            ScenarioId::Auction => "auction",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::PingPong => "Two agents rally a ball, one smash, one concession",
            ScenarioId::Broadcast => "Topic broadcast fans out to 3 subscribers, nobody else",
            ScenarioId::Alarms => "Metronome chimes drive the event-jump clock",
            ScenarioId::Auction => "Auctioneer multicasts a call, closes on a deadline alarm",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ping_pong" | "pingpong" => Ok(ScenarioId::PingPong),
            "broadcast" => Ok(ScenarioId::Broadcast),
            "alarms" => Ok(ScenarioId::Alarms),
            "auction" => Ok(ScenarioId::Auction),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: &'static str,

    /// Whether the scenario's assertions held
    pub passed: bool,

    /// Cycles executed
    pub cycles: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

/// Runs scenarios against a simulated-clock scheduler.
pub struct ScenarioRunner {
    /// Rally limit for the ping-pong players.
    rally_limit: u32,

    /// Number of bidders in the auction.
    bidders: usize,
}

impl ScenarioRunner {
    pub fn new() -> Self {
        Self {
            rally_limit: 5,
            bidders: 3,
        }
    }

    /// Sets the ping-pong rally limit.
    pub fn with_rally_limit(mut self, limit: u32) -> Self {
        self.rally_limit = limit;
        self
    }

    /// Sets the number of auction bidders.
    pub fn with_bidders(mut self, bidders: usize) -> Self {
        self.bidders = bidders;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {}", scenario.name());
        match scenario {
            ScenarioId::PingPong => self.run_ping_pong(),
            ScenarioId::Broadcast => self.run_broadcast(),
            ScenarioId::Alarms => self.run_alarms(),
            ScenarioId::Auction => self.run_auction(),
        }
    }

    fn run_ping_pong(&self) -> ScenarioResult {
        let mut s = Scheduler::simulated();
        let a = AgentId::from_seed(1);
        let b = AgentId::from_seed(2);
        let mut check = || -> Result<(u64, f64), String> {
            s.add_with_id(a, PingPongPlayer::new(self.rally_limit))
                .map_err(|e| e.to_string())?;
            s.add_with_id(b, PingPongPlayer::new(self.rally_limit))
                .map_err(|e| e.to_string())?;

            // A serves to B.
            s.post(
                Envelope::to_agent(b, Ball { rally: 0 })
                    .with_topic("ping")
                    .with_sender(a),
            )
            .map_err(|e| e.to_string())?;

            let report = s.run(RunOptions::until_idle()).map_err(|e| e.to_string())?;

            let winner = s.agent::<PingPongPlayer>(b).ok_or("player b vanished")?;
            let loser = s.agent::<PingPongPlayer>(a).ok_or("player a vanished")?;
            if winner.outcome != Some("won!") {
                return Err(format!("b should have won, got {:?}", winner.outcome));
            }
            if loser.outcome != Some("beaten!") {
                return Err(format!("a should be beaten, got {:?}", loser.outcome));
            }
            if winner.rallies != self.rally_limit {
                return Err(format!("b returned {} balls", winner.rallies));
            }
            Ok((report.cycles, report.time))
        };
        Self::result(ScenarioId::PingPong, check())
    }

    fn run_broadcast(&self) -> ScenarioResult {
        let mut s = Scheduler::simulated();
        let mut check = || -> Result<(u64, f64), String> {
            let listeners: Vec<AgentId> = (1..=3)
                .map(|seed| {
                    let id = AgentId::from_seed(seed);
                    s.add_with_id(id, Listener::new("tick")).map(|_| id)
                })
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?;
            let bystander = s
                .add_with_id(AgentId::from_seed(4), Listener::new("tock"))
                .map_err(|e| e.to_string())?;

            s.post(Envelope::broadcast(Ball { rally: 0 }).with_topic("tick"))
                .map_err(|e| e.to_string())?;
            let report = s.run(RunOptions::until_idle()).map_err(|e| e.to_string())?;

            for id in &listeners {
                let listener = s.agent::<Listener>(*id).ok_or("listener vanished")?;
                if listener.heard != 1 {
                    return Err(format!("listener {} heard {} messages", id, listener.heard));
                }
            }
            let bystander = s.agent::<Listener>(bystander).ok_or("bystander vanished")?;
            if bystander.heard != 0 {
                return Err("the bystander overheard a broadcast".into());
            }
            Ok((report.cycles, report.time))
        };
        Self::result(ScenarioId::Broadcast, check())
    }

    fn run_alarms(&self) -> ScenarioResult {
        let mut s = Scheduler::simulated();
        let mut check = || -> Result<(u64, f64), String> {
            let id = s.add(Metronome::new(2.5, 3)).map_err(|e| e.to_string())?;
            let report = s.run(RunOptions::until_idle()).map_err(|e| e.to_string())?;

            let metronome = s.agent::<Metronome>(id).ok_or("metronome vanished")?;
            if metronome.chimes != 3 {
                return Err(format!("expected 3 chimes, got {}", metronome.chimes));
            }
            if report.time != 7.5 {
                return Err(format!("clock should have jumped to 7.5, is at {}", report.time));
            }
            Ok((report.cycles, report.time))
        };
        Self::result(ScenarioId::Alarms, check())
    }

    fn run_auction(&self) -> ScenarioResult {
        let mut s = Scheduler::simulated();
        let mut check = || -> Result<(u64, f64), String> {
            let auctioneer = s
                .add_with_id(
                    AgentId::from_seed(100),
                    Auctioneer::new("one slightly used kernel", 10.0, 5.0),
                )
                .map_err(|e| e.to_string())?;

            let mut bidders = Vec::new();
            for seed in 0..self.bidders {
                let budget = 12.0 + 14.0 * seed as f64;
                let id = AgentId::from_seed(seed as u64 + 1);
                s.add_with_id(id, Bidder::new(budget)).map_err(|e| e.to_string())?;
                bidders.push((id, budget));
            }
            let (richest, top_budget) = *bidders
                .iter()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .ok_or("no bidders")?;

            let report = s.run(RunOptions::until_idle()).map_err(|e| e.to_string())?;

            let auctioneer = s.agent::<Auctioneer>(auctioneer).ok_or("auctioneer vanished")?;
            match auctioneer.winner {
                Some((winner, amount)) if winner == richest && amount == top_budget => {}
                other => return Err(format!("wrong auction outcome: {:?}", other)),
            }
            let winner = s.agent::<Bidder>(richest).ok_or("winner vanished")?;
            if winner.won.is_none() {
                return Err("the winning bidder never received its award".into());
            }
            Ok((report.cycles, report.time))
        };
        Self::result(ScenarioId::Auction, check())
    }

    fn result(scenario: ScenarioId, outcome: Result<(u64, f64), String>) -> ScenarioResult {
        match outcome {
            Ok((cycles, final_time_secs)) => ScenarioResult {
                scenario: scenario.name(),
                passed: true,
                cycles,
                final_time_secs,
                failure_reason: None,
            },
            Err(reason) => ScenarioResult {
                scenario: scenario.name(),
                passed: false,
                cycles: 0,
                final_time_secs: 0.0,
                failure_reason: Some(reason),
            },
        }
    }
}

impl Default for ScenarioRunner {
    fn default() -> Self {
        Self::new()
    }
}
