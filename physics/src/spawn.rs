//! Spawn point sampling and role assignment.

use crate::{Lcg, PhysicsConfig, Role, Vec2};

const REJECTION_ATTEMPTS: usize = 100;

/// Sample three spawn points inside the padded arena with a minimum
/// pairwise distance.  Falls back to an equilateral triangle around the
/// center, rotated by a seeded angle, when rejection sampling fails.
pub fn spawn_points(rng: &mut Lcg, cfg: &PhysicsConfig) -> [Vec2; 3] {
    let min_x = cfg.spawn_padding;
    let max_x = cfg.arena_width - cfg.spawn_padding;
    let min_y = cfg.spawn_padding;
    let max_y = cfg.arena_height - cfg.spawn_padding;

    'outer: for _ in 0..REJECTION_ATTEMPTS {
        let mut points = [Vec2::default(); 3];
        for point in points.iter_mut() {
            *point = Vec2::new(rng.gen_range(min_x, max_x), rng.gen_range(min_y, max_y));
        }
        for i in 0..3 {
            for j in (i + 1)..3 {
                if points[i].distance(&points[j]) < cfg.spawn_min_dist {
                    continue 'outer;
                }
            }
        }
        return points;
    }

    // Equilateral triangle of radius spawn_min_dist around the center.
    let center = Vec2::new(cfg.arena_width / 2.0, cfg.arena_height / 2.0);
    let base = rng.gen_range(0.0, std::f64::consts::TAU);
    let mut points = [Vec2::default(); 3];
    for (i, point) in points.iter_mut().enumerate() {
        let angle = base + i as f64 * std::f64::consts::TAU / 3.0;
        *point = Vec2::new(
            center.x + cfg.spawn_min_dist * angle.cos(),
            center.y + cfg.spawn_min_dist * angle.sin(),
        );
    }
    points
}

/// Fisher-Yates permutation of the three roles, driven by the role stream.
pub fn shuffle_roles(rng: &mut Lcg) -> [Role; 3] {
    let mut roles = Role::ALL;
    rng.shuffle(&mut roles);
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sub_seed, STREAM_ROLES, STREAM_SPAWN};

    #[test]
    fn spawn_points_respect_min_distance_and_bounds() {
        let cfg = PhysicsConfig::default();
        for seed in 0..50 {
            let mut rng = Lcg::for_stream(seed, STREAM_SPAWN);
            let points = spawn_points(&mut rng, &cfg);
            for i in 0..3 {
                assert!(points[i].x >= cfg.spawn_padding);
                assert!(points[i].x <= cfg.arena_width - cfg.spawn_padding);
                assert!(points[i].y >= cfg.spawn_padding);
                assert!(points[i].y <= cfg.arena_height - cfg.spawn_padding);
                for j in (i + 1)..3 {
                    assert!(points[i].distance(&points[j]) >= cfg.spawn_min_dist);
                }
            }
        }
    }

    #[test]
    fn fallback_triangle_when_arena_too_tight() {
        // A tiny arena makes rejection sampling fail every attempt.
        let cfg = PhysicsConfig {
            arena_width: 320.0,
            arena_height: 320.0,
            spawn_padding: 100.0,
            ..PhysicsConfig::default()
        };
        let mut rng = Lcg::new(1);
        let points = spawn_points(&mut rng, &cfg);
        let center = Vec2::new(160.0, 160.0);
        for point in &points {
            assert!((point.distance(&center) - cfg.spawn_min_dist).abs() < 1e-9);
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = Lcg::for_stream(77, STREAM_ROLES);
        let roles = shuffle_roles(&mut rng);
        let mut sorted: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
        sorted.sort();
        assert_eq!(sorted, vec!["paper", "rock", "scissors"]);
    }

    #[test]
    fn spawn_and_roles_diverge_between_streams() {
        let seed = 1234;
        assert_ne!(sub_seed(seed, STREAM_SPAWN), sub_seed(seed, STREAM_ROLES));
    }

    #[test]
    fn same_seed_reproduces_spawns_and_roles() {
        let cfg = PhysicsConfig::default();
        let seed = 555;
        let points_a = spawn_points(&mut Lcg::for_stream(seed, STREAM_SPAWN), &cfg);
        let points_b = spawn_points(&mut Lcg::for_stream(seed, STREAM_SPAWN), &cfg);
        assert_eq!(points_a, points_b);
        let roles_a = shuffle_roles(&mut Lcg::for_stream(seed, STREAM_ROLES));
        let roles_b = shuffle_roles(&mut Lcg::for_stream(seed, STREAM_ROLES));
        assert_eq!(roles_a, roles_b);
    }
}
