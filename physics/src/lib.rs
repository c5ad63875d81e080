//! Deterministic simulation primitives for the arena.
//!
//! Everything in this crate is pure: given the same seed and the same
//! sequence of per-tick inputs, two runs produce bit-identical positions
//! and eliminations.  No ambient randomness, no clocks.

mod collision;
mod motion;
mod rng;
mod showdown;
mod spawn;

pub use collision::{detect_collision, resolve_bounce, resolve_pair, PairOutcome};
pub use motion::{advance, clamp_to_arena};
pub use rng::{sub_seed, Lcg, STREAM_BOUNCE, STREAM_HEARTS, STREAM_ROLES, STREAM_SPAWN, STREAM_TIEBREAK};
pub use showdown::{heart_captured, spawn_hearts, Heart};
pub use spawn::{shuffle_roles, spawn_points};

use serde::{Deserialize, Serialize};

/// Simulation constants.  All fields are configurable; the defaults match
/// the production arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub arena_width: f64,
    pub arena_height: f64,
    pub player_radius: f64,
    /// Units per second.
    pub max_speed: f64,
    /// Simulation steps per second.
    pub tick_rate: u32,
    pub bounce_dist: f64,
    pub large_bounce_dist: f64,
    pub spawn_min_dist: f64,
    pub spawn_padding: f64,
    pub heart_radius: f64,
    pub heart_min_dist: f64,
    pub heart_padding: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            arena_width: 1600.0,
            arena_height: 900.0,
            player_radius: 22.0,
            max_speed: 450.0,
            tick_rate: 30,
            bounce_dist: 10.0,
            large_bounce_dist: 25.0,
            spawn_min_dist: 150.0,
            spawn_padding: 100.0,
            heart_radius: 14.0,
            heart_min_dist: 50.0,
            heart_padding: 80.0,
        }
    }
}

impl PhysicsConfig {
    /// The farthest a player may travel in one tick.
    pub fn max_step(&self) -> f64 {
        self.max_speed / self.tick_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vec2) -> f64 {
        self.distance_sq(other).sqrt()
    }

    pub fn distance_sq(&self, other: &Vec2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// The three collision roles.  Rock beats scissors beats paper beats rock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Rock,
    Paper,
    Scissors,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Rock, Role::Paper, Role::Scissors];

    pub fn beats(&self, other: Role) -> bool {
        matches!(
            (self, other),
            (Role::Rock, Role::Scissors) | (Role::Scissors, Role::Paper) | (Role::Paper, Role::Rock)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Rock => "rock",
            Role::Paper => "paper",
            Role::Scissors => "scissors",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rock" => Ok(Role::Rock),
            "paper" => Ok(Role::Paper),
            "scissors" => Ok(Role::Scissors),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Per-tick movement intent.  Humans steer with a direction, bots with a
/// target point; either may be absent when the player is idle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    Idle,
    Direction { x: i8, y: i8 },
    Target(Vec2),
}

impl Default for Intent {
    fn default() -> Self {
        Intent::Idle
    }
}

/// The physical state of one player inside the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Body {
    pub pos: Vec2,
    /// Position at the start of the current tick, used by the swept test.
    pub prev: Vec2,
    pub alive: bool,
    pub frozen: bool,
    pub role: Role,
}

impl Body {
    pub fn new(pos: Vec2, role: Role) -> Self {
        Self {
            pos,
            prev: pos,
            alive: true,
            frozen: false,
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_table() {
        assert!(Role::Rock.beats(Role::Scissors));
        assert!(Role::Scissors.beats(Role::Paper));
        assert!(Role::Paper.beats(Role::Rock));
        assert!(!Role::Rock.beats(Role::Paper));
        assert!(!Role::Rock.beats(Role::Rock));
    }

    #[test]
    fn max_step_from_defaults() {
        let cfg = PhysicsConfig::default();
        assert_eq!(cfg.max_step(), 15.0);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }
}
