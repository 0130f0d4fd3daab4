use {crate::geometry::PixelRect, arrayvec::ArrayVec, smallvec::SmallVec};

/// Set of pixels represented as disjoint axis-aligned rectangles.
///
/// Damage and opaque areas are regions. The rectangle list is kept
/// disjoint at all times so rasterizing a region never touches a pixel
/// twice; ordering of the list is deterministic for identical inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Region {
    rects: SmallVec<[PixelRect; 4]>,
}

impl Region {
    pub fn new() -> Self {
        Region {
            rects: SmallVec::new_const(),
        }
    }

    pub fn from_rect(rect: PixelRect) -> Self {
        let mut region = Region::new();
        region.add_rect(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn rects(&self) -> &[PixelRect] {
        &self.rects
    }

    /// Bounding rectangle of the whole region.
    pub fn extents(&self) -> PixelRect {
        let mut extents = PixelRect::EMPTY;
        for r in &self.rects {
            extents = extents.union(r);
        }
        extents
    }

    /// Total number of pixels covered.
    pub fn area(&self) -> u64 {
        self.rects
            .iter()
            .map(|r| r.width() as u64 * r.height() as u64)
            .sum()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    /// Adds `rect` to the region.
    ///
    /// The parts of `rect` already covered are not duplicated.
    pub fn add_rect(&mut self, rect: PixelRect) {
        if rect.is_empty() {
            return;
        }

        let mut fresh: SmallVec<[PixelRect; 4]> = SmallVec::new_const();
        fresh.push(rect);

        for existing in &self.rects {
            let mut next: SmallVec<[PixelRect; 4]> = SmallVec::new_const();
            for piece in fresh.drain(..) {
                next.extend(rect_minus_rect(&piece, existing));
            }
            fresh = next;
            if fresh.is_empty() {
                return;
            }
        }

        self.rects.extend(fresh);
    }

    pub fn union(&mut self, other: &Region) {
        for r in other.rects() {
            self.add_rect(*r);
        }
    }

    pub fn intersect_rect(&mut self, rect: &PixelRect) {
        let mut out: SmallVec<[PixelRect; 4]> = SmallVec::new_const();
        for r in &self.rects {
            if let Some(i) = r.intersect(rect) {
                out.push(i);
            }
        }
        self.rects = out;
    }

    pub fn intersection(&self, other: &Region) -> Region {
        let mut out = Region::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(i) = a.intersect(b) {
                    // Disjoint inputs produce disjoint intersections.
                    out.rects.push(i);
                }
            }
        }
        out
    }

    pub fn subtract_rect(&mut self, rect: &PixelRect) {
        if rect.is_empty() {
            return;
        }

        let mut out: SmallVec<[PixelRect; 4]> = SmallVec::new_const();
        for r in &self.rects {
            out.extend(rect_minus_rect(r, rect));
        }
        self.rects = out;
    }

    pub fn subtract(&mut self, other: &Region) {
        for r in other.rects() {
            self.subtract_rect(r);
        }
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            *r = r.translate(dx, dy);
        }
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Region {
        let mut region = self.clone();
        region.translate(dx, dy);
        region
    }
}

/// Splits `a - b` into at most four disjoint rectangles.
fn rect_minus_rect(a: &PixelRect, b: &PixelRect) -> ArrayVec<PixelRect, 4> {
    let mut out = ArrayVec::new();

    let Some(overlap) = a.intersect(b) else {
        out.push(*a);
        return out;
    };

    // Band above and below the overlap, then the left and right
    // remainders of the middle band.
    if a.y1 < overlap.y1 {
        out.push(PixelRect::new(a.x1, a.y1, a.x2, overlap.y1));
    }
    if overlap.y2 < a.y2 {
        out.push(PixelRect::new(a.x1, overlap.y2, a.x2, a.y2));
    }
    if a.x1 < overlap.x1 {
        out.push(PixelRect::new(a.x1, overlap.y1, overlap.x1, overlap.y2));
    }
    if overlap.x2 < a.x2 {
        out.push(PixelRect::new(overlap.x2, overlap.y1, a.x2, overlap.y2));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rect_keeps_rects_disjoint() {
        let mut region = Region::from_rect(PixelRect::new(0, 0, 10, 10));
        region.add_rect(PixelRect::new(5, 5, 15, 15));

        assert_eq!(region.area(), 100 + 100 - 25);

        for (i, a) in region.rects().iter().enumerate() {
            for b in &region.rects()[i + 1..] {
                assert_eq!(a.intersect(b), None, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn adding_covered_rect_is_noop() {
        let mut region = Region::from_rect(PixelRect::new(0, 0, 10, 10));
        region.add_rect(PixelRect::new(2, 2, 8, 8));
        assert_eq!(region.rects().len(), 1);
        assert_eq!(region.area(), 100);
    }

    #[test]
    fn subtract_punches_hole() {
        let mut region = Region::from_rect(PixelRect::new(0, 0, 10, 10));
        region.subtract_rect(&PixelRect::new(4, 4, 6, 6));

        assert_eq!(region.area(), 96);
        assert!(!region.contains_point(4, 4));
        assert!(!region.contains_point(5, 5));
        assert!(region.contains_point(3, 4));
        assert!(region.contains_point(6, 5));
    }

    #[test]
    fn intersection_of_disjoint_is_empty() {
        let a = Region::from_rect(PixelRect::new(0, 0, 5, 5));
        let b = Region::from_rect(PixelRect::new(5, 0, 10, 5));
        assert!(a.intersection(&b).is_empty());
    }

    #[test]
    fn union_area_matches() {
        let mut a = Region::from_rect(PixelRect::new(0, 0, 4, 4));
        let b = Region::from_rect(PixelRect::new(2, 2, 6, 6));
        a.union(&b);
        assert_eq!(a.area(), 16 + 16 - 4);
        assert_eq!(a.extents(), PixelRect::new(0, 0, 6, 6));
    }

    #[test]
    fn translate_moves_every_rect() {
        let mut region = Region::from_rect(PixelRect::new(0, 0, 2, 2));
        region.add_rect(PixelRect::new(10, 10, 12, 12));
        region.translate(1, -1);
        assert!(region.contains_point(1, 0));
        assert!(region.contains_point(11, 9));
        assert!(!region.contains_point(0, 0));
    }
}
