//! Heart spawning and capture for the two-player showdown.

use serde::{Deserialize, Serialize};

use crate::{Body, Intent, Lcg, PhysicsConfig, Vec2};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heart {
    pub pos: Vec2,
    pub captured: bool,
}

const HEART_ATTEMPTS: usize = 100;

/// Spawn `count` hearts with a minimum pairwise spacing, padded from the
/// arena edges.  Spacing is relaxed only if placement keeps failing.
pub fn spawn_hearts(count: usize, rng: &mut Lcg, cfg: &PhysicsConfig) -> Vec<Heart> {
    let min_x = cfg.heart_padding;
    let max_x = cfg.arena_width - cfg.heart_padding;
    let min_y = cfg.heart_padding;
    let max_y = cfg.arena_height - cfg.heart_padding;

    let mut hearts: Vec<Heart> = Vec::with_capacity(count);
    while hearts.len() < count {
        let mut placed = false;
        for _ in 0..HEART_ATTEMPTS {
            let candidate = Vec2::new(rng.gen_range(min_x, max_x), rng.gen_range(min_y, max_y));
            if hearts
                .iter()
                .all(|h| h.pos.distance(&candidate) >= cfg.heart_min_dist)
            {
                hearts.push(Heart {
                    pos: candidate,
                    captured: false,
                });
                placed = true;
                break;
            }
        }
        if !placed {
            // Spacing cannot be satisfied; take any in-bounds point.
            hearts.push(Heart {
                pos: Vec2::new(rng.gen_range(min_x, max_x), rng.gen_range(min_y, max_y)),
                captured: false,
            });
        }
    }
    hearts
}

/// Whether a body reaches an uncaptured heart this tick.
///
/// Three predicates, any of which counts: the current position is in
/// range; the clamped target is in range and reachable within one step;
/// or the heart sits within range of the prev->current motion segment.
pub fn heart_captured(body: &Body, intent: Intent, heart: &Heart, cfg: &PhysicsConfig) -> bool {
    if heart.captured || !body.alive {
        return false;
    }
    let reach = cfg.player_radius + cfg.heart_radius;

    if body.pos.distance(&heart.pos) <= reach {
        return true;
    }

    if let Intent::Target(target) = intent {
        let target = crate::clamp_to_arena(target, cfg);
        if target.distance(&heart.pos) <= reach && body.pos.distance(&target) <= cfg.max_step() {
            return true;
        }
    }

    segment_distance(body.prev, body.pos, heart.pos) <= reach
}

fn segment_distance(a: Vec2, b: Vec2, p: Vec2) -> f64 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len_sq = abx * abx + aby * aby;
    if len_sq < 1e-12 {
        return a.distance(&p);
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len_sq).clamp(0.0, 1.0);
    let closest = Vec2::new(a.x + abx * t, a.y + aby * t);
    closest.distance(&p)
}
