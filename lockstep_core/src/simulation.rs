// The deterministic simulation a session drives.
//
// The session engine never looks inside the simulation. It hands over
// commands when their target tick comes up, asks for one step per tick, and
// moves opaque snapshot bytes to joining peers. Determinism is the
// simulation's responsibility: the same snapshot plus the same commands at
// the same ticks must produce the same digests everywhere.
//
// `HashChainSimulation` is a small reference implementation used by the host
// binary and the tests. Its whole state is a pair of generator words, a
// running checksum and a date; commands fold their opcode and payload into
// the checksum, so any disagreement about which command ran when shows up
// in the next digest.

use lockstep_protocol::message::CommandPacket;
use lockstep_protocol::types::{SimDate, StateDigest};
use serde::{Deserialize, Serialize};

use crate::pause::PauseMode;

/// Result of one simulation step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub digest: StateDigest,
    pub date: SimDate,
}

pub trait Simulation {
    /// Apply one command. Called before `advance` for the command's tick.
    fn execute(&mut self, command: &CommandPacket);

    /// Run one tick. A paused simulation keeps its date and state but still
    /// reports its digest.
    fn advance(&mut self, paused: PauseMode) -> StepOutcome;

    /// Serialize the full state for a joining peer.
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the state with a snapshot taken by `snapshot`.
    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Reference simulation: a hash chain over commands and ticks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashChainSimulation {
    seeds: [u32; 2],
    checksum: u64,
    date: SimDate,
    ticks_per_day: u16,
    commands_executed: u64,
}

/// Ticks in one in-game day.
pub const DAY_TICKS: u16 = 74;

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl HashChainSimulation {
    pub fn new(seed: u64) -> Self {
        let state = mix(seed);
        HashChainSimulation {
            seeds: [state as u32, (state >> 32) as u32],
            checksum: mix(state),
            date: SimDate::default(),
            ticks_per_day: DAY_TICKS,
            commands_executed: 0,
        }
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands_executed
    }

    fn outcome(&self) -> StepOutcome {
        StepOutcome {
            digest: StateDigest {
                seeds: self.seeds,
                checksum: self.checksum,
            },
            date: self.date,
        }
    }
}

impl Simulation for HashChainSimulation {
    fn execute(&mut self, command: &CommandPacket) {
        let mut acc = self.checksum ^ (u64::from(command.opcode.0) << 48);
        acc ^= u64::from(command.issuer.slot) << 32;
        for byte in &command.payload {
            acc = mix(acc ^ u64::from(*byte));
        }
        self.checksum = mix(acc);
        self.commands_executed += 1;
    }

    fn advance(&mut self, paused: PauseMode) -> StepOutcome {
        if !paused.is_empty() {
            return self.outcome();
        }

        let next = mix(u64::from(self.seeds[0]) | (u64::from(self.seeds[1]) << 32));
        self.seeds = [next as u32, (next >> 32) as u32];
        self.checksum = mix(self.checksum ^ next);

        self.date.fraction += 1;
        if self.date.fraction >= self.ticks_per_day {
            self.date.fraction = 0;
            self.date.day += 1;
        }
        self.outcome()
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| e.to_string())
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        *self = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::types::{Opcode, ParticipantId};

    use super::*;

    fn command(payload: Vec<u8>) -> CommandPacket {
        CommandPacket {
            target_tick: 1,
            issuer: ParticipantId::HOST,
            opcode: Opcode(30),
            payload,
            callback: None,
        }
    }

    #[test]
    fn same_inputs_same_digests() {
        let mut a = HashChainSimulation::new(7);
        let mut b = HashChainSimulation::new(7);
        for tick in 0..200u8 {
            if tick % 13 == 0 {
                a.execute(&command(vec![tick]));
                b.execute(&command(vec![tick]));
            }
            assert_eq!(a.advance(PauseMode::empty()), b.advance(PauseMode::empty()));
        }
    }

    #[test]
    fn a_missing_command_diverges() {
        let mut a = HashChainSimulation::new(7);
        let mut b = HashChainSimulation::new(7);
        a.execute(&command(vec![1]));
        assert_ne!(
            a.advance(PauseMode::empty()).digest,
            b.advance(PauseMode::empty()).digest
        );
    }

    #[test]
    fn paused_simulation_holds_its_date() {
        let mut sim = HashChainSimulation::new(1);
        let before = sim.advance(PauseMode::empty());
        let paused = sim.advance(PauseMode::MANUAL);
        assert_eq!(before, paused);
    }

    #[test]
    fn day_rolls_over() {
        let mut sim = HashChainSimulation::new(1);
        let mut outcome = StepOutcome::default();
        for _ in 0..DAY_TICKS {
            outcome = sim.advance(PauseMode::empty());
        }
        assert_eq!(outcome.date.day, 1);
        assert!(outcome.date.is_day_start());
    }

    #[test]
    fn snapshot_restores_identical_state() {
        let mut host = HashChainSimulation::new(3);
        host.execute(&command(vec![4, 5]));
        host.advance(PauseMode::empty());

        let mut joiner = HashChainSimulation::new(99);
        joiner.load_snapshot(&host.snapshot().unwrap()).unwrap();
        assert_eq!(joiner, host);
        assert!(joiner.load_snapshot(b"not json").is_err());
    }
}
