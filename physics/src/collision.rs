//! Pair collision detection and resolution.
//!
//! Detection runs on all unordered pairs of alive players in insertion
//! order (i < j); that order is part of the replay format.

use crate::{Body, Lcg, PhysicsConfig, Role, Vec2};

/// Endpoint overlap or swept-circle intersection over the tick's motion.
///
/// The swept test solves `|p + t*d|^2 = (2r)^2` for `t` in `[0, 1]`, where
/// `p` is the relative position at the start of the tick and `d` the
/// relative displacement.  This catches two bodies passing through each
/// other between endpoints at high speed.
pub fn detect_collision(a: &Body, b: &Body, cfg: &PhysicsConfig) -> bool {
    let r_sum = cfg.player_radius * 2.0;
    if a.pos.distance_sq(&b.pos) <= r_sum * r_sum {
        return true;
    }

    let px = a.prev.x - b.prev.x;
    let py = a.prev.y - b.prev.y;
    let dx = (a.pos.x - a.prev.x) - (b.pos.x - b.prev.x);
    let dy = (a.pos.y - a.prev.y) - (b.pos.y - b.prev.y);

    let qa = dx * dx + dy * dy;
    let qb = 2.0 * (px * dx + py * dy);
    let qc = px * px + py * py - r_sum * r_sum;

    if qc <= 0.0 {
        // Already overlapping at the start of the tick.
        return true;
    }
    if qa == 0.0 {
        // No relative motion; endpoint checks were sufficient.
        return false;
    }

    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return false;
    }
    let sqrt_disc = disc.sqrt();
    let t1 = (-qb - sqrt_disc) / (2.0 * qa);
    let t2 = (-qb + sqrt_disc) / (2.0 * qa);
    (0.0..=1.0).contains(&t1) || (t1 < 0.0 && t2 >= 0.0)
}

/// What a resolved collision did to the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// Same role, or showdown mode: both players bounce apart.
    Bounce,
    /// The first body's role wins; the second is eliminated.
    FirstEliminatesSecond,
    /// The second body's role wins; the first is eliminated.
    SecondEliminatesFirst,
}

/// Apply the role table.  In showdown mode every collision bounces.
pub fn resolve_pair(a: Role, b: Role, showdown: bool) -> PairOutcome {
    if showdown || a == b {
        PairOutcome::Bounce
    } else if a.beats(b) {
        PairOutcome::FirstEliminatesSecond
    } else {
        PairOutcome::SecondEliminatesFirst
    }
}

/// Push two overlapping bodies radially apart from their center of mass.
///
/// Starts at `bounce_dist`; if the pair still overlaps, retries up to two
/// more times at `large_bounce_dist`.  Coincident centers are separated
/// along a random angle from the match's bounce stream.
pub fn resolve_bounce(a: &mut Body, b: &mut Body, cfg: &PhysicsConfig, rng: &mut Lcg) {
    let r_sum = cfg.player_radius * 2.0;
    let mut dist = cfg.bounce_dist;
    for attempt in 0..3 {
        if attempt > 0 {
            dist = cfg.large_bounce_dist;
        }
        let center = Vec2::new((a.pos.x + b.pos.x) / 2.0, (a.pos.y + b.pos.y) / 2.0);
        push_from(a, center, dist, cfg, rng);
        push_from(b, center, dist, cfg, rng);
        if a.pos.distance_sq(&b.pos) > r_sum * r_sum {
            return;
        }
    }
}

fn push_from(body: &mut Body, center: Vec2, dist: f64, cfg: &PhysicsConfig, rng: &mut Lcg) {
    let dx = body.pos.x - center.x;
    let dy = body.pos.y - center.y;
    let len = (dx * dx + dy * dy).sqrt();
    let (nx, ny) = if len < 1e-9 {
        let angle = rng.gen_range(0.0, std::f64::consts::TAU);
        (angle.cos(), angle.sin())
    } else {
        (dx / len, dy / len)
    };
    body.pos = crate::clamp_to_arena(
        Vec2::new(body.pos.x + nx * dist, body.pos.y + ny * dist),
        cfg,
    );
}
