use super::image::GeometryError;
use crate::core::utils::geometry::{signed_volume, triangle_normal};
use nalgebra::{Point3, Vector3};
use std::collections::HashMap;

/// Closed triangle surface bounding one region.
///
/// The prior points are the undisplaced positions the contour was built with; the
/// current points are the prior points moved by the latest displacement. Vertex normals
/// always point out of the enclosed region.
#[derive(Debug, Clone)]
pub struct Contour {
    prior_points: Vec<Point3<f64>>,
    points: Vec<Point3<f64>>,
    triangles: Vec<[usize; 3]>,
    normals: Vec<Vector3<f64>>,
}

impl Contour {
    /// Builds a contour from a consistently wound closed mesh. Inward-wound meshes are
    /// flipped so that normals face outward.
    pub fn new(
        points: Vec<Point3<f64>>,
        mut triangles: Vec<[usize; 3]>,
    ) -> Result<Self, GeometryError> {
        if points.is_empty() || triangles.is_empty() {
            return Err(GeometryError::EmptyMesh);
        }
        for (t, tri) in triangles.iter().enumerate() {
            if let Some(&vertex) = tri.iter().find(|&&v| v >= points.len()) {
                return Err(GeometryError::InvalidTriangle {
                    triangle: t,
                    vertex,
                    num_vertices: points.len(),
                });
            }
        }

        if signed_volume(&points, &triangles) < 0.0 {
            for tri in &mut triangles {
                tri.swap(1, 2);
            }
        }

        let normals = vertex_normals(&points, &triangles);
        Ok(Self {
            prior_points: points.clone(),
            points,
            triangles,
            normals,
        })
    }

    /// Geodesic sphere obtained by `subdivisions` rounds of midpoint subdivision of an
    /// icosahedron.
    pub fn icosphere(center: Point3<f64>, radius: f64, subdivisions: usize) -> Self {
        let t = (1.0 + 5.0f64.sqrt()) / 2.0;
        let mut dirs: Vec<Vector3<f64>> = [
            (-1.0, t, 0.0),
            (1.0, t, 0.0),
            (-1.0, -t, 0.0),
            (1.0, -t, 0.0),
            (0.0, -1.0, t),
            (0.0, 1.0, t),
            (0.0, -1.0, -t),
            (0.0, 1.0, -t),
            (t, 0.0, -1.0),
            (t, 0.0, 1.0),
            (-t, 0.0, -1.0),
            (-t, 0.0, 1.0),
        ]
        .iter()
        .map(|&(x, y, z)| Vector3::new(x, y, z).normalize())
        .collect();

        let mut faces: Vec<[usize; 3]> = vec![
            [0, 11, 5],
            [0, 5, 1],
            [0, 1, 7],
            [0, 7, 10],
            [0, 10, 11],
            [1, 5, 9],
            [5, 11, 4],
            [11, 10, 2],
            [10, 7, 6],
            [7, 1, 8],
            [3, 9, 4],
            [3, 4, 2],
            [3, 2, 6],
            [3, 6, 8],
            [3, 8, 9],
            [4, 9, 5],
            [2, 4, 11],
            [6, 2, 10],
            [8, 6, 7],
            [9, 8, 1],
        ];

        for _ in 0..subdivisions {
            let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
            let mut midpoint = |a: usize, b: usize, dirs: &mut Vec<Vector3<f64>>| -> usize {
                let key = (a.min(b), a.max(b));
                *midpoints.entry(key).or_insert_with(|| {
                    let mid = (dirs[a] + dirs[b]).normalize();
                    dirs.push(mid);
                    dirs.len() - 1
                })
            };
            faces = faces
                .iter()
                .flat_map(|&[a, b, c]| {
                    let ab = midpoint(a, b, &mut dirs);
                    let bc = midpoint(b, c, &mut dirs);
                    let ca = midpoint(c, a, &mut dirs);
                    [[a, ab, ca], [b, bc, ab], [c, ca, bc], [ab, bc, ca]]
                })
                .collect();
        }

        for face in &mut faces {
            let n = triangle_normal(
                &Point3::from(dirs[face[0]]),
                &Point3::from(dirs[face[1]]),
                &Point3::from(dirs[face[2]]),
            );
            let centroid = dirs[face[0]] + dirs[face[1]] + dirs[face[2]];
            if n.dot(&centroid) < 0.0 {
                face.swap(1, 2);
            }
        }

        let points: Vec<Point3<f64>> = dirs.iter().map(|d| center + d * radius).collect();
        let normals = vertex_normals(&points, &faces);
        Self {
            prior_points: points.clone(),
            points,
            triangles: faces,
            normals,
        }
    }

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    #[inline]
    pub fn prior_points(&self) -> &[Point3<f64>] {
        &self.prior_points
    }

    #[inline]
    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    #[inline]
    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    #[inline]
    pub fn normals(&self) -> &[Vector3<f64>] {
        &self.normals
    }

    /// Replaces the current points and recomputes the vertex normals.
    pub fn set_points(&mut self, points: Vec<Point3<f64>>) -> Result<(), GeometryError> {
        if points.len() != self.prior_points.len() {
            return Err(GeometryError::BufferSize {
                expected: self.prior_points.len(),
                actual: points.len(),
            });
        }
        self.normals = vertex_normals(&points, &self.triangles);
        self.points = points;
        Ok(())
    }

    pub fn enclosed_volume(&self) -> f64 {
        signed_volume(&self.points, &self.triangles)
    }

    pub fn bounding_box(&self) -> (Point3<f64>, Point3<f64>) {
        let mut lo = Point3::from(Vector3::repeat(f64::INFINITY));
        let mut hi = Point3::from(Vector3::repeat(f64::NEG_INFINITY));
        for p in &self.points {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(p[axis]);
                hi[axis] = hi[axis].max(p[axis]);
            }
        }
        (lo, hi)
    }
}

/// Area-weighted average of the incident face normals, normalized. Isolated or fully
/// degenerate vertices get a zero normal.
fn vertex_normals(points: &[Point3<f64>], triangles: &[[usize; 3]]) -> Vec<Vector3<f64>> {
    let mut normals = vec![Vector3::zeros(); points.len()];
    for tri in triangles {
        let n = triangle_normal(&points[tri[0]], &points[tri[1]], &points[tri[2]]);
        for &v in tri {
            normals[v] += n;
        }
    }
    for n in &mut normals {
        let norm = n.norm();
        if norm > f64::EPSILON {
            *n /= norm;
        } else {
            *n = Vector3::zeros();
        }
    }
    normals
}
