use {crate::geometry::Rect, arrayvec::ArrayVec, glam::Vec2};

/// Clipping a quad against a rectangle yields at most eight vertices.
pub const MAX_CLIP_VERTICES: usize = 8;

/// Polygon produced by the clipper, wound clockwise in y-down space.
pub type ClipPolygon = ArrayVec<Vec2, MAX_CLIP_VERTICES>;

/// Quadrilateral in output coordinates together with its bounding box.
///
/// `axis_aligned` marks quads whose view transform is a pure translation
/// or identity; those take the rectangle-intersection fast path.
#[derive(Clone, Copy, Debug)]
pub struct Quad {
    pub verts: [Vec2; 4],
    pub bbox: Rect,
    pub axis_aligned: bool,
}

impl Quad {
    pub fn new(verts: [Vec2; 4], axis_aligned: bool) -> Self {
        let mut bbox = Rect::new(verts[0].x, verts[0].y, verts[0].x, verts[0].y);
        for v in &verts[1..] {
            bbox.x1 = bbox.x1.min(v.x);
            bbox.y1 = bbox.y1.min(v.y);
            bbox.x2 = bbox.x2.max(v.x);
            bbox.y2 = bbox.y2.max(v.y);
        }

        Quad {
            verts,
            bbox,
            axis_aligned,
        }
    }
}

/// Subtraction with a tie break: inputs that are almost equal give
/// exactly zero.
///
/// Clipping classifies vertices against rectangle edges by the sign of
/// this difference. Snapping near-equal inputs to zero keeps a vertex
/// that sits on an edge from also spawning an intersection point an
/// epsilon away, which is the sole guard against near-duplicate
/// vertices in the output polygon.
pub fn float_difference(a: f32, b: f32) -> f32 {
    let max_diff = 4.0 * f32::MIN_POSITIVE;
    let max_rel_diff = 4.0e-5;

    let diff = a - b;
    let adiff = diff.abs();

    if adiff <= max_diff {
        return 0.0;
    }

    let largest = a.abs().max(b.abs());
    if adiff <= largest * max_rel_diff {
        return 0.0;
    }

    diff
}

/// Clips `quad` against the axis-aligned rectangle `clip`.
///
/// Returns the intersection polygon wound clockwise, or an empty list
/// when the intersection has no area. A non-empty result always has at
/// least three vertices.
pub fn clip_quad(quad: &Quad, clip: &Rect) -> ClipPolygon {
    // Correctness gate as much as a fast path: the general algorithm
    // is only run on quads known to reach into the clip rectangle.
    if !quad.bbox.overlaps(clip) {
        return ClipPolygon::new();
    }

    let polygon = if quad.axis_aligned {
        clip_simple(quad, clip)
    } else {
        clip_transformed(quad, clip)
    };

    if polygon.len() < 3 || polygon_area(&polygon) <= 0.0 {
        return ClipPolygon::new();
    }

    polygon
}

/// Axis-aligned fast path: clamp every vertex into the rectangle.
fn clip_simple(quad: &Quad, clip: &Rect) -> ClipPolygon {
    let mut out = ClipPolygon::new();
    for v in &quad.verts {
        out.push(Vec2::new(
            v.x.clamp(clip.x1, clip.x2),
            v.y.clamp(clip.y1, clip.y2),
        ));
    }
    ensure_clockwise(&mut out);
    out
}

#[derive(Clone, Copy)]
enum Boundary {
    Left(f32),
    Right(f32),
    Top(f32),
    Bottom(f32),
}

impl Boundary {
    /// Signed distance to the inside, snapped to zero when on the edge.
    fn inside(&self, v: Vec2) -> f32 {
        match *self {
            Boundary::Left(x) => float_difference(v.x, x),
            Boundary::Right(x) => float_difference(x, v.x),
            Boundary::Top(y) => float_difference(v.y, y),
            Boundary::Bottom(y) => float_difference(y, v.y),
        }
    }

    /// Point where the segment `p`→`q` crosses the boundary line.
    ///
    /// The clipped coordinate is set exactly to the boundary value.
    fn intersect(&self, p: Vec2, q: Vec2) -> Vec2 {
        match *self {
            Boundary::Left(x) | Boundary::Right(x) => {
                let t = (x - p.x) / (q.x - p.x);
                Vec2::new(x, p.y + t * (q.y - p.y))
            }
            Boundary::Top(y) | Boundary::Bottom(y) => {
                let t = (y - p.y) / (q.y - p.y);
                Vec2::new(p.x + t * (q.x - p.x), y)
            }
        }
    }
}

/// Sutherland-Hodgman against the four half planes of `clip`.
fn clip_transformed(quad: &Quad, clip: &Rect) -> ClipPolygon {
    let boundaries = [
        Boundary::Left(clip.x1),
        Boundary::Right(clip.x2),
        Boundary::Top(clip.y1),
        Boundary::Bottom(clip.y2),
    ];

    let mut polygon = ClipPolygon::new();
    polygon.extend(quad.verts.iter().copied());

    for boundary in boundaries {
        let input = polygon.clone();
        polygon.clear();

        for (i, &cur) in input.iter().enumerate() {
            let prev = input[(i + input.len() - 1) % input.len()];
            let d_prev = boundary.inside(prev);
            let d_cur = boundary.inside(cur);

            if d_cur >= 0.0 {
                if d_prev < 0.0 && d_cur > 0.0 {
                    push_vertex(&mut polygon, boundary.intersect(prev, cur));
                }
                push_vertex(&mut polygon, cur);
            } else if d_prev > 0.0 {
                push_vertex(&mut polygon, boundary.intersect(prev, cur));
            }
        }

        if polygon.is_empty() {
            return polygon;
        }
    }

    // The last boundary pass can still close the ring on its first vertex.
    if polygon.len() > 1 {
        let (first, last) = (polygon[0], polygon[polygon.len() - 1]);
        if float_difference(first.x, last.x) == 0.0 && float_difference(first.y, last.y) == 0.0 {
            polygon.pop();
        }
    }

    ensure_clockwise(&mut polygon);
    polygon
}

/// Appends `v` unless it duplicates the previous vertex.
fn push_vertex(polygon: &mut ClipPolygon, v: Vec2) {
    if let Some(&last) = polygon.last() {
        if float_difference(last.x, v.x) == 0.0 && float_difference(last.y, v.y) == 0.0 {
            return;
        }
    }
    polygon.push(v);
}

/// Signed polygon area; positive means clockwise in y-down coordinates.
pub fn polygon_area(polygon: &[Vec2]) -> f32 {
    let mut doubled = 0.0;
    for (i, a) in polygon.iter().enumerate() {
        let b = polygon[(i + 1) % polygon.len()];
        doubled += (a.x - b.x) * (a.y + b.y);
    }
    doubled / 2.0
}

fn ensure_clockwise(polygon: &mut ClipPolygon) {
    if polygon_area(polygon) < 0.0 {
        polygon.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_quad(r: Rect) -> Quad {
        Quad::new(
            [
                Vec2::new(r.x1, r.y1),
                Vec2::new(r.x2, r.y1),
                Vec2::new(r.x2, r.y2),
                Vec2::new(r.x1, r.y2),
            ],
            true,
        )
    }

    fn rotated_square(cx: f32, cy: f32, half: f32, radians: f32) -> Quad {
        let (sin, cos) = radians.sin_cos();
        let corner = |x: f32, y: f32| Vec2::new(cx + x * cos - y * sin, cy + x * sin + y * cos);
        Quad::new(
            [
                corner(-half, -half),
                corner(half, -half),
                corner(half, half),
                corner(-half, half),
            ],
            false,
        )
    }

    #[test]
    fn float_difference_snaps_near_equal() {
        assert_eq!(float_difference(1.0, 1.0), 0.0);
        assert_eq!(float_difference(1.0, 1.0 + f32::EPSILON), 0.0);
        assert_eq!(float_difference(1e-40, -1e-40), 0.0);
        assert!(float_difference(2.0, 1.0) == 1.0);
        assert!(float_difference(1.0, 2.0) == -1.0);
    }

    #[test]
    fn identity_clip_returns_quad() {
        let r = Rect::new(0.0, 0.0, 10.0, 10.0);
        let polygon = clip_quad(&rect_quad(r), &r);
        assert_eq!(polygon.len(), 4);
        for v in &polygon {
            assert!(r.contains(v.x, v.y));
        }
        assert!(polygon_area(&polygon) > 0.0);
    }

    #[test]
    fn disjoint_quad_is_rejected_before_clipping() {
        let clip = Rect::new(0.0, 0.0, 10.0, 10.0);
        let quad = rect_quad(Rect::new(20.0, 20.0, 30.0, 30.0));
        assert!(clip_quad(&quad, &clip).is_empty());
    }

    #[test]
    fn tangent_quad_has_no_area() {
        let clip = Rect::new(0.0, 0.0, 10.0, 10.0);
        let quad = rect_quad(Rect::new(10.0, 0.0, 20.0, 10.0));
        assert!(clip_quad(&quad, &clip).is_empty());
    }

    #[test]
    fn rotated_quad_against_corner_rect() {
        // Clip rect (-50,-50)..(-10,-10), quad (-20,-20)..(20,20)
        // rotated 30 degrees: exactly one corner region pokes in.
        let clip = Rect::new(-50.0, -50.0, -10.0, -10.0);
        let quad = rotated_square(0.0, 0.0, 20.0, 30f32.to_radians());

        let polygon = clip_quad(&quad, &clip);
        assert!(polygon.len() >= 3 && polygon.len() <= 8);
        assert!(polygon_area(&polygon) > 0.0);

        for v in &polygon {
            assert!(
                v.x >= clip.x1 - 1e-4
                    && v.x <= clip.x2 + 1e-4
                    && v.y >= clip.y1 - 1e-4
                    && v.y <= clip.y2 + 1e-4,
                "{v:?} outside clip rect"
            );
            // Inside the rotated square: rotate back and test the box.
            let (sin, cos) = (-30f32.to_radians()).sin_cos();
            let local = Vec2::new(v.x * cos - v.y * sin, v.x * sin + v.y * cos);
            assert!(
                local.x.abs() <= 20.0 + 1e-3 && local.y.abs() <= 20.0 + 1e-3,
                "{v:?} outside source quad"
            );
        }
    }

    #[test]
    fn vertex_on_clip_edge_does_not_duplicate() {
        // Diamond whose corners lie exactly on the rect edges.
        let clip = Rect::new(0.0, 0.0, 10.0, 10.0);
        let quad = Quad::new(
            [
                Vec2::new(5.0, 0.0),
                Vec2::new(10.0, 5.0),
                Vec2::new(5.0, 10.0),
                Vec2::new(0.0, 5.0),
            ],
            false,
        );

        let polygon = clip_quad(&quad, &clip);
        assert_eq!(polygon.len(), 4);
        for (i, a) in polygon.iter().enumerate() {
            for b in &polygon[i + 1..] {
                assert!(
                    float_difference(a.x, b.x) != 0.0 || float_difference(a.y, b.y) != 0.0,
                    "duplicate vertex {a:?}"
                );
            }
        }
    }

    #[test]
    fn clipping_is_clockwise_regardless_of_input_winding() {
        let clip = Rect::new(0.0, 0.0, 10.0, 10.0);
        let ccw = Quad::new(
            [
                Vec2::new(-5.0, -5.0),
                Vec2::new(-5.0, 15.0),
                Vec2::new(15.0, 15.0),
                Vec2::new(15.0, -5.0),
            ],
            false,
        );
        let polygon = clip_quad(&ccw, &clip);
        assert!(polygon.len() >= 3);
        assert!(polygon_area(&polygon) > 0.0);
    }

    #[test]
    fn general_path_result_count_is_bounded() {
        // A quad rotated 45 degrees over the whole rect clips to an octagon.
        let clip = Rect::new(-10.0, -10.0, 10.0, 10.0);
        let quad = rotated_square(0.0, 0.0, 12.0, 45f32.to_radians());
        let polygon = clip_quad(&quad, &clip);
        assert_eq!(polygon.len(), 8);
        assert!(polygon_area(&polygon) > 0.0);
    }
}
