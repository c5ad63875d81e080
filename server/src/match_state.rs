//! Live match state and the deterministic tick.
//!
//! A running match task owns exactly one [`LiveMatch`]; nothing else
//! mutates it.  Given the same seed and the same per-tick inputs the tick
//! produces bit-identical positions and eliminations, so the serialized
//! state doubles as the recovery snapshot and the replay format.

use serde::{Deserialize, Serialize};

use arena_core::error::{Error, Result};
use arena_core::protocol::{round2, HeartView, ReconnectPlayer, SnapshotPlayer};
use arena_core::types::{Address, LobbyId, MatchId, MatchStatus, UserId};
use arena_physics::{
    advance, detect_collision, heart_captured, resolve_bounce, resolve_pair, shuffle_roles,
    spawn_hearts, spawn_points, Body, Heart, Intent, Lcg, PairOutcome, PhysicsConfig, Role, Vec2,
    STREAM_BOUNCE, STREAM_HEARTS, STREAM_ROLES, STREAM_SPAWN, STREAM_TIEBREAK,
};
use arena_storage::{COMPATIBLE_STATE_VERSIONS, CURRENT_STATE_VERSION};

use crate::frame::MatchVerdict;

pub const SHOWDOWN_HEART_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePlayer {
    pub user_id: UserId,
    pub wallet: Address,
    pub body: Body,
    pub intent: Intent,
    pub last_sequence: Option<u64>,
    pub frozen_request: bool,
    pub connected: bool,
    pub disconnected_at_tick: Option<u64>,
    pub hearts: u8,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowdownState {
    pub players: [UserId; 2],
    pub hearts: Vec<Heart>,
    pub freeze_until_tick: u64,
    pub revealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMatch {
    pub version: u32,
    pub match_id: MatchId,
    pub lobby_id: LobbyId,
    pub seed: u64,
    pub status: MatchStatus,
    pub tick: u64,
    /// Insertion order is the pair-iteration order; never reorder.
    pub players: Vec<LivePlayer>,
    pub showdown: Option<ShowdownState>,
    pub snapshot_acc: f64,
    bounce_rng: Lcg,
    tiebreak_rng: Lcg,
}

/// Per-tick knobs that come from configuration, not from match state.
#[derive(Debug, Clone)]
pub struct TickSettings {
    /// Disconnect grace in ticks; expiry is checked inside the tick so
    /// timing follows the simulation clock.
    pub grace_ticks: u64,
    pub snapshot_rate: u32,
    pub hearts_to_win: u8,
    pub freeze_ticks: u64,
}

#[derive(Debug, Clone)]
pub struct EliminationEvent {
    pub user_id: UserId,
    pub eliminated_by: Option<UserId>,
    pub x: f64,
    pub y: f64,
}

/// Everything one tick produced, for the runner to broadcast and persist.
#[derive(Debug, Clone, Default)]
pub struct TickEvents {
    pub eliminations: Vec<EliminationEvent>,
    pub bounces: Vec<(UserId, UserId)>,
    pub captures: Vec<(UserId, u8)>,
    pub showdown_started: Option<[UserId; 2]>,
    pub showdown_ready: bool,
    pub emit_snapshot: bool,
    pub verdict: Option<MatchVerdict>,
}

pub struct NewLivePlayer {
    pub user_id: UserId,
    pub wallet: Address,
    pub is_bot: bool,
    pub connected: bool,
}

impl LiveMatch {
    /// Deal spawns and roles from the seed and build the initial state.
    pub fn new(
        match_id: MatchId,
        lobby_id: LobbyId,
        seed: u64,
        entrants: Vec<NewLivePlayer>,
        cfg: &PhysicsConfig,
    ) -> Self {
        let spawns = spawn_points(&mut Lcg::for_stream(seed, STREAM_SPAWN), cfg);
        let roles = shuffle_roles(&mut Lcg::for_stream(seed, STREAM_ROLES));
        let players = entrants
            .into_iter()
            .zip(spawns.iter().zip(roles.iter()))
            .map(|(entrant, (spawn, role))| LivePlayer {
                user_id: entrant.user_id,
                wallet: entrant.wallet,
                body: Body::new(*spawn, *role),
                intent: Intent::Idle,
                last_sequence: None,
                frozen_request: false,
                connected: entrant.connected,
                disconnected_at_tick: None,
                hearts: 0,
                is_bot: entrant.is_bot,
            })
            .collect();
        Self {
            version: CURRENT_STATE_VERSION,
            match_id,
            lobby_id,
            seed,
            status: MatchStatus::Countdown,
            tick: 0,
            players,
            showdown: None,
            snapshot_acc: 0.0,
            bounce_rng: Lcg::for_stream(seed, STREAM_BOUNCE),
            tiebreak_rng: Lcg::for_stream(seed, STREAM_TIEBREAK),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("encode live match")
    }

    pub fn decode(state_json: &str) -> Result<Self> {
        let state: LiveMatch = serde_json::from_str(state_json)
            .map_err(|e| Error::StorageError(format!("bad match state: {}", e)))?;
        if !COMPATIBLE_STATE_VERSIONS.contains(&state.version) {
            return Err(Error::IncompatibleStateVersion(state.version));
        }
        Ok(state)
    }

    pub fn player(&self, user_id: UserId) -> Option<&LivePlayer> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn player_mut(&mut self, user_id: UserId) -> Option<&mut LivePlayer> {
        self.players.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn alive_count(&self) -> usize {
        self.players.iter().filter(|p| p.body.alive).count()
    }

    pub fn player_ids(&self) -> Vec<UserId> {
        self.players.iter().map(|p| p.user_id).collect()
    }

    /// Accept an input if its sequence advances; later inputs overwrite
    /// earlier targets, nothing is queued.
    pub fn apply_input(
        &mut self,
        user_id: UserId,
        sequence: u64,
        intent: Intent,
        frozen: Option<bool>,
    ) -> bool {
        let Some(player) = self.player_mut(user_id) else {
            return false;
        };
        if let Some(last) = player.last_sequence {
            if sequence <= last {
                return false;
            }
        }
        player.last_sequence = Some(sequence);
        player.intent = intent;
        if let Some(frozen) = frozen {
            player.frozen_request = frozen;
        }
        true
    }

    pub fn mark_disconnected(&mut self, user_id: UserId) {
        let at_tick = self.tick;
        if let Some(player) = self.player_mut(user_id) {
            player.connected = false;
            player.disconnected_at_tick = Some(at_tick);
        }
    }

    /// Restore a connection; sequence numbering restarts with it.
    pub fn mark_reconnected(&mut self, user_id: UserId) {
        if let Some(player) = self.player_mut(user_id) {
            player.connected = true;
            player.disconnected_at_tick = None;
            player.last_sequence = None;
        }
    }

    pub fn grace_remaining_secs(&self, user_id: UserId, grace_ticks: u64, tick_rate: u32) -> u64 {
        self.player(user_id)
            .and_then(|p| p.disconnected_at_tick)
            .map(|at| {
                grace_ticks.saturating_sub(self.tick.saturating_sub(at)) / tick_rate.max(1) as u64
            })
            .unwrap_or(0)
    }

    pub fn snapshot_players(&self) -> Vec<SnapshotPlayer> {
        self.players
            .iter()
            .map(|p| SnapshotPlayer {
                id: p.user_id,
                x: round2(p.body.pos.x),
                y: round2(p.body.pos.y),
                alive: p.body.alive,
                role: p.body.role,
            })
            .collect()
    }

    pub fn reconnect_players(&self) -> Vec<ReconnectPlayer> {
        self.players
            .iter()
            .map(|p| ReconnectPlayer {
                id: p.user_id,
                x: round2(p.body.pos.x),
                y: round2(p.body.pos.y),
                alive: p.body.alive,
                role: p.body.role,
                connected: p.connected,
            })
            .collect()
    }

    pub fn heart_views(&self) -> Vec<HeartView> {
        self.showdown
            .as_ref()
            .map(|s| {
                s.hearts
                    .iter()
                    .map(|h| HeartView {
                        x: round2(h.pos.x),
                        y: round2(h.pos.y),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn final_positions(&self) -> Vec<(UserId, f64, f64)> {
        self.players
            .iter()
            .map(|p| (p.user_id, round2(p.body.pos.x), round2(p.body.pos.y)))
            .collect()
    }

    fn showdown_freeze_active(&self) -> bool {
        self.showdown
            .as_ref()
            .map(|s| !s.revealed)
            .unwrap_or(false)
    }

    /// Execute one simulation tick.
    pub fn run_tick(&mut self, cfg: &PhysicsConfig, settings: &TickSettings) -> TickEvents {
        let mut events = TickEvents::default();
        self.tick += 1;

        // 1. Grace expirations, aligned to the simulation clock.
        for index in 0..self.players.len() {
            let player = &self.players[index];
            if !player.body.alive || player.connected {
                continue;
            }
            if let Some(at) = player.disconnected_at_tick {
                if self.tick.saturating_sub(at) >= settings.grace_ticks {
                    let (x, y) = (player.body.pos.x, player.body.pos.y);
                    let user_id = player.user_id;
                    self.players[index].body.alive = false;
                    events.eliminations.push(EliminationEvent {
                        user_id,
                        eliminated_by: None,
                        x,
                        y,
                    });
                }
            }
        }

        // Mass disconnect: nobody left to play for two or more stakes.
        let alive: Vec<usize> = (0..self.players.len())
            .filter(|&i| self.players[i].body.alive)
            .collect();
        if alive.len() >= 2 && alive.iter().all(|&i| !self.players[i].connected) {
            events.verdict = Some(MatchVerdict::Void {
                reason: "mass_disconnect".into(),
            });
            return events;
        }

        // 2. Early win check.
        if let Some(verdict) = self.last_standing_verdict() {
            events.verdict = Some(verdict);
            return events;
        }

        // 3. Movement.  Bot intents are a pure function of state, so they
        // replay identically.
        let freeze = self.showdown_freeze_active();
        let intents: Vec<Intent> = (0..self.players.len())
            .map(|i| {
                if self.players[i].is_bot {
                    self.bot_intent(i, cfg)
                } else {
                    self.players[i].intent
                }
            })
            .collect();
        for (i, intent) in intents.iter().enumerate() {
            let player = &mut self.players[i];
            if !player.body.alive {
                continue;
            }
            player.body.prev = player.body.pos;
            player.body.frozen = freeze || player.frozen_request;
            advance(&mut player.body, *intent, cfg);
        }

        // 4. Collisions on all unordered alive pairs, insertion order.
        let showdown_mode = self.showdown.is_some();
        for i in 0..self.players.len() {
            for j in (i + 1)..self.players.len() {
                if !self.players[i].body.alive || !self.players[j].body.alive {
                    continue;
                }
                if !detect_collision(&self.players[i].body, &self.players[j].body, cfg) {
                    continue;
                }
                let roles = (self.players[i].body.role, self.players[j].body.role);
                match resolve_pair(roles.0, roles.1, showdown_mode) {
                    PairOutcome::Bounce => {
                        let (left, right) = self.players.split_at_mut(j);
                        resolve_bounce(
                            &mut left[i].body,
                            &mut right[0].body,
                            cfg,
                            &mut self.bounce_rng,
                        );
                        events
                            .bounces
                            .push((self.players[i].user_id, self.players[j].user_id));
                    }
                    PairOutcome::FirstEliminatesSecond => {
                        self.players[j].body.alive = false;
                        events.eliminations.push(EliminationEvent {
                            user_id: self.players[j].user_id,
                            eliminated_by: Some(self.players[i].user_id),
                            x: self.players[j].body.pos.x,
                            y: self.players[j].body.pos.y,
                        });
                    }
                    PairOutcome::SecondEliminatesFirst => {
                        self.players[i].body.alive = false;
                        events.eliminations.push(EliminationEvent {
                            user_id: self.players[i].user_id,
                            eliminated_by: Some(self.players[j].user_id),
                            x: self.players[i].body.pos.x,
                            y: self.players[i].body.pos.y,
                        });
                    }
                }
            }
        }

        // An elimination leaving exactly two alive triggers the showdown.
        if self.showdown.is_none() && self.alive_count() == 2 {
            let pair: Vec<UserId> = self
                .players
                .iter()
                .filter(|p| p.body.alive)
                .map(|p| p.user_id)
                .collect();
            let hearts = spawn_hearts(
                SHOWDOWN_HEART_COUNT,
                &mut Lcg::for_stream(self.seed, STREAM_HEARTS),
                cfg,
            );
            self.showdown = Some(ShowdownState {
                players: [pair[0], pair[1]],
                hearts,
                freeze_until_tick: self.tick + settings.freeze_ticks,
                revealed: false,
            });
            events.showdown_started = Some([pair[0], pair[1]]);
        } else if let Some(showdown) = self.showdown.as_mut() {
            if !showdown.revealed && self.tick >= showdown.freeze_until_tick {
                showdown.revealed = true;
                events.showdown_ready = true;
            }
        }

        // 5. Heart captures, only once the freeze has lifted.
        if self.showdown.as_ref().map(|s| s.revealed).unwrap_or(false) {
            let mut threshold_hits: Vec<UserId> = Vec::new();
            for i in 0..self.players.len() {
                if !self.players[i].body.alive {
                    continue;
                }
                let body = self.players[i].body.clone();
                let intent = intents[i];
                let user_id = self.players[i].user_id;
                let showdown = self.showdown.as_mut().expect("showdown active");
                let mut captured = 0u8;
                for heart in showdown.hearts.iter_mut() {
                    if heart_captured(&body, intent, heart, cfg) {
                        heart.captured = true;
                        captured += 1;
                    }
                }
                if captured > 0 {
                    let player = &mut self.players[i];
                    player.hearts += captured;
                    events.captures.push((user_id, player.hearts));
                    if player.hearts >= settings.hearts_to_win {
                        threshold_hits.push(user_id);
                    }
                }
            }
            match threshold_hits.len() {
                0 => {}
                1 => {
                    events.verdict = Some(MatchVerdict::Winner {
                        user_id: threshold_hits[0],
                        reason: "showdown_winner".into(),
                    });
                }
                _ => {
                    // Both reached the threshold within the same tick.
                    let pick = self.tiebreak_rng.gen_index(threshold_hits.len());
                    events.verdict = Some(MatchVerdict::Winner {
                        user_id: threshold_hits[pick],
                        reason: "showdown_winner_tiebreak".into(),
                    });
                }
            }
            if events.verdict.is_some() {
                return events;
            }
        }

        // 6. Elimination win check, unless the showdown took over.
        if self.showdown.is_none() {
            if let Some(verdict) = self.last_standing_verdict() {
                events.verdict = Some(verdict);
                return events;
            }
        }

        // 7. Snapshot pacing; the accumulator keeps the fractional
        // remainder when snapshot and tick rates differ.
        self.snapshot_acc += settings.snapshot_rate as f64 / cfg.tick_rate as f64;
        if self.snapshot_acc >= 1.0 {
            self.snapshot_acc -= 1.0;
            events.emit_snapshot = true;
        }

        events
    }

    fn last_standing_verdict(&self) -> Option<MatchVerdict> {
        let alive: Vec<&LivePlayer> = self.players.iter().filter(|p| p.body.alive).collect();
        match alive.len() {
            0 => Some(MatchVerdict::Void {
                reason: "no_survivors".into(),
            }),
            1 => Some(MatchVerdict::Winner {
                user_id: alive[0].user_id,
                reason: "last_standing".into(),
            }),
            _ => None,
        }
    }

    /// Chase the nearest prey, flee the nearest predator, or collect the
    /// nearest heart in showdown.
    fn bot_intent(&self, index: usize, cfg: &PhysicsConfig) -> Intent {
        let me = &self.players[index];
        if !me.body.alive {
            return Intent::Idle;
        }
        if let Some(showdown) = &self.showdown {
            if !showdown.revealed {
                return Intent::Idle;
            }
            return showdown
                .hearts
                .iter()
                .filter(|h| !h.captured)
                .min_by(|a, b| {
                    distance_total(&me.body.pos, &a.pos)
                        .total_cmp(&distance_total(&me.body.pos, &b.pos))
                })
                .map(|h| Intent::Target(h.pos))
                .unwrap_or(Intent::Idle);
        }

        let nearest = |predicate: &dyn Fn(Role) -> bool| -> Option<Vec2> {
            self.players
                .iter()
                .enumerate()
                .filter(|(i, p)| *i != index && p.body.alive && predicate(p.body.role))
                .min_by(|(_, a), (_, b)| {
                    distance_total(&me.body.pos, &a.body.pos)
                        .total_cmp(&distance_total(&me.body.pos, &b.body.pos))
                })
                .map(|(_, p)| p.body.pos)
        };

        let my_role = me.body.role;
        if let Some(prey) = nearest(&|role| my_role.beats(role)) {
            return Intent::Target(prey);
        }
        if let Some(predator) = nearest(&|role| role.beats(my_role)) {
            // Run directly away, clamped at the walls.
            let dx = me.body.pos.x - predator.x;
            let dy = me.body.pos.y - predator.y;
            let len = (dx * dx + dy * dy).sqrt().max(1e-9);
            let target = Vec2::new(
                me.body.pos.x + dx / len * 200.0,
                me.body.pos.y + dy / len * 200.0,
            );
            return Intent::Target(arena_physics::clamp_to_arena(target, cfg));
        }
        Intent::Idle
    }
}

fn distance_total(a: &Vec2, b: &Vec2) -> f64 {
    a.distance(b)
}
