//! Per-tick movement.

use crate::{Body, Intent, PhysicsConfig, Vec2};

/// Clamp a point so the full player circle stays inside the arena.
pub fn clamp_to_arena(pos: Vec2, cfg: &PhysicsConfig) -> Vec2 {
    Vec2 {
        x: pos.x.clamp(cfg.player_radius, cfg.arena_width - cfg.player_radius),
        y: pos.y.clamp(cfg.player_radius, cfg.arena_height - cfg.player_radius),
    }
}

/// Advance one body by one tick of its current intent.
///
/// Directions move a full step per axis; targets move at most a step toward
/// the point.  Frozen and dead bodies do not move.  The caller is expected
/// to have saved `prev` already.
pub fn advance(body: &mut Body, intent: Intent, cfg: &PhysicsConfig) {
    if !body.alive || body.frozen {
        return;
    }
    let step = cfg.max_step();
    let next = match intent {
        Intent::Idle => return,
        Intent::Direction { x, y } => Vec2 {
            x: body.pos.x + x as f64 * step,
            y: body.pos.y + y as f64 * step,
        },
        Intent::Target(target) => {
            let target = clamp_to_arena(target, cfg);
            let dist = body.pos.distance(&target);
            if dist <= step {
                target
            } else {
                let scale = step / dist;
                Vec2 {
                    x: body.pos.x + (target.x - body.pos.x) * scale,
                    y: body.pos.y + (target.y - body.pos.y) * scale,
                }
            }
        }
    };
    body.pos = clamp_to_arena(next, cfg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    fn cfg() -> PhysicsConfig {
        PhysicsConfig::default()
    }

    #[test]
    fn direction_moves_one_step_per_axis() {
        let cfg = cfg();
        let mut body = Body::new(Vec2::new(800.0, 450.0), Role::Rock);
        advance(&mut body, Intent::Direction { x: 1, y: -1 }, &cfg);
        assert_eq!(body.pos, Vec2::new(815.0, 435.0));
    }

    #[test]
    fn edge_push_stays_clamped_without_jitter() {
        let cfg = cfg();
        let mut body = Body::new(Vec2::new(cfg.player_radius, 450.0), Role::Rock);
        for _ in 0..10 {
            advance(&mut body, Intent::Direction { x: -1, y: 0 }, &cfg);
            assert_eq!(body.pos.x, cfg.player_radius);
        }
    }

    #[test]
    fn target_does_not_overshoot() {
        let cfg = cfg();
        let mut body = Body::new(Vec2::new(100.0, 100.0), Role::Paper);
        advance(&mut body, Intent::Target(Vec2::new(105.0, 100.0)), &cfg);
        assert_eq!(body.pos, Vec2::new(105.0, 100.0));
    }

    #[test]
    fn target_moves_at_most_max_step() {
        let cfg = cfg();
        let mut body = Body::new(Vec2::new(100.0, 100.0), Role::Paper);
        advance(&mut body, Intent::Target(Vec2::new(1000.0, 100.0)), &cfg);
        assert!((body.pos.x - 115.0).abs() < 1e-9);
        assert_eq!(body.pos.y, 100.0);
    }

    #[test]
    fn out_of_bounds_target_is_clamped_first() {
        let cfg = cfg();
        let mut body = Body::new(Vec2::new(30.0, 30.0), Role::Scissors);
        advance(&mut body, Intent::Target(Vec2::new(-500.0, -500.0)), &cfg);
        assert!(body.pos.x >= cfg.player_radius);
        assert!(body.pos.y >= cfg.player_radius);
    }

    #[test]
    fn frozen_body_stays_put() {
        let cfg = cfg();
        let mut body = Body::new(Vec2::new(100.0, 100.0), Role::Rock);
        body.frozen = true;
        advance(&mut body, Intent::Direction { x: 1, y: 1 }, &cfg);
        assert_eq!(body.pos, Vec2::new(100.0, 100.0));
    }
}
