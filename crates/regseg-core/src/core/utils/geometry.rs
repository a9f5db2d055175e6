use nalgebra::{Point3, Vector3};

/// Non-normalized triangle normal following the right-hand rule; its length is twice the
/// triangle area.
#[inline]
pub fn triangle_normal(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> Vector3<f64> {
    (b - a).cross(&(c - a))
}

/// Signed volume enclosed by a closed triangle mesh (positive for outward winding).
pub fn signed_volume(points: &[Point3<f64>], triangles: &[[usize; 3]]) -> f64 {
    triangles
        .iter()
        .map(|t| {
            let (a, b, c) = (points[t[0]].coords, points[t[1]].coords, points[t[2]].coords);
            a.dot(&b.cross(&c))
        })
        .sum::<f64>()
        / 6.0
}

/// Intersection of the line `{(x, y, z) : x ∈ ℝ}` with a triangle. Returns the `x`
/// coordinate of the hit, or `None` if the line misses the triangle's projection onto the
/// yz plane. Edges are treated as half-open so that a line through a shared edge is
/// counted exactly once.
pub fn ray_x_intersection(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    y: f64,
    z: f64,
) -> Option<f64> {
    let e0 = edge_function(b.y, b.z, c.y, c.z, y, z);
    let e1 = edge_function(c.y, c.z, a.y, a.z, y, z);
    let e2 = edge_function(a.y, a.z, b.y, b.z, y, z);
    let area = e0 + e1 + e2;
    if area.abs() < f64::EPSILON {
        return None;
    }

    let inside = if area > 0.0 {
        e0 >= 0.0 && e1 >= 0.0 && e2 >= 0.0
    } else {
        e0 <= 0.0 && e1 <= 0.0 && e2 <= 0.0
    };
    if !inside {
        return None;
    }
    if !(owns_edge(e0, b, c, area) && owns_edge(e1, c, a, area) && owns_edge(e2, a, b, area)) {
        return None;
    }

    let (wa, wb, wc) = (e0 / area, e1 / area, e2 / area);
    Some(wa * a.x + wb * b.x + wc * c.x)
}

#[inline]
fn edge_function(y0: f64, z0: f64, y1: f64, z1: f64, y: f64, z: f64) -> f64 {
    (y1 - y0) * (z - z0) - (z1 - z0) * (y - y0)
}

/// Tie-break for points lying exactly on an edge: the edge belongs to the triangle only
/// if it is a "top" or "left" edge in the orientation-normalized yz projection.
fn owns_edge(e: f64, from: &Point3<f64>, to: &Point3<f64>, area: f64) -> bool {
    if e != 0.0 {
        return true;
    }
    let sign = area.signum();
    let dy = (to.y - from.y) * sign;
    let dz = (to.z - from.z) * sign;
    dz > 0.0 || (dz == 0.0 && dy < 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_cube() -> (Vec<Point3<f64>>, Vec<[usize; 3]>) {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        ];
        let triangles = vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [1, 2, 6],
            [1, 6, 5],
            [2, 3, 7],
            [2, 7, 6],
            [3, 0, 4],
            [3, 4, 7],
        ];
        (points, triangles)
    }

    #[test]
    fn triangle_normal_follows_right_hand_rule() {
        let n = triangle_normal(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert_eq!(n, Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn signed_volume_of_outward_cube_is_one() {
        let (points, triangles) = unit_cube();
        assert!((signed_volume(&points, &triangles) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ray_hits_triangle_at_interpolated_x() {
        let a = Point3::new(1.0, 0.0, 0.0);
        let b = Point3::new(2.0, 1.0, 0.0);
        let c = Point3::new(3.0, 0.0, 1.0);
        let x = ray_x_intersection(&a, &b, &c, 0.25, 0.25).unwrap();
        assert!((x - (0.5 * 1.0 + 0.25 * 2.0 + 0.25 * 3.0)).abs() < 1e-12);
        assert!(ray_x_intersection(&a, &b, &c, 0.8, 0.8).is_none());
    }

    #[test]
    fn ray_through_shared_edge_counts_once() {
        let (points, triangles) = unit_cube();
        // The line y = z = 0.5 crosses the diagonal edges of the x = 0 and x = 1 faces.
        let hits: Vec<f64> = triangles
            .iter()
            .filter_map(|t| {
                ray_x_intersection(&points[t[0]], &points[t[1]], &points[t[2]], 0.5, 0.5)
            })
            .collect();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn ray_misses_degenerate_projection() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 0.0, 1.0);
        assert!(ray_x_intersection(&a, &b, &c, 0.0, 0.2).is_none());
    }
}
