//! Planar geometry primitives shared by the mesh, solver and resampler

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub};

/// Tolerance used for all "is this numerically zero" decisions
pub const EPS: f64 = 1e-9;

/// A 2D point (or vector) in pixel coordinates
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn dot(self, other: Point) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// z component of the 3D cross product
    #[inline]
    pub fn cross(self, other: Point) -> f64 {
        self.x * other.y - self.y * other.x
    }

    #[inline]
    pub fn norm_sqr(self) -> f64 {
        self.dot(self)
    }

    #[inline]
    pub fn norm(self) -> f64 {
        self.norm_sqr().sqrt()
    }

    /// Component-wise product
    #[inline]
    pub fn scale(self, sx: f64, sy: f64) -> Point {
        Point::new(self.x * sx, self.y * sy)
    }

    /// Round to the nearest integer pixel
    #[inline]
    pub fn to_pixel(self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }

    /// Clamp into `[0, width-1] x [0, height-1]`
    pub fn clamp_inside(self, width: u32, height: u32) -> Point {
        Point::new(
            self.x.clamp(0.0, (width.max(1) - 1) as f64),
            self.y.clamp(0.0, (height.max(1) - 1) as f64),
        )
    }

    /// True when the point falls outside `[0, width-1] x [0, height-1]`
    pub fn is_outside(self, width: u32, height: u32) -> bool {
        self.x < 0.0
            || self.y < 0.0
            || self.x > (width as f64 - 1.0)
            || self.y > (height as f64 - 1.0)
    }

    pub fn approx_eq(self, other: Point, tol: f64) -> bool {
        (self.x - other.x).abs() <= tol && (self.y - other.y).abs() <= tol
    }
}

impl Add for Point {
    type Output = Point;
    #[inline]
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    #[inline]
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    #[inline]
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<Point> for f64 {
    type Output = Point;
    #[inline]
    fn mul(self, rhs: Point) -> Point {
        Point::new(self * rhs.x, self * rhs.y)
    }
}

/// Signed doubled area of triangle `(a, b, c)`; positive when counter-clockwise
/// in a y-up frame
#[inline]
pub fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b - a).cross(c - a)
}

/// Fixed-size grid mapping integer-quantized coordinates to control-point indices.
///
/// One grid is kept per frame. The first point registered at a pixel wins;
/// later registrations at the same pixel are reported as collisions.
#[derive(Debug, Clone)]
pub struct PointIndexGrid {
    width: u32,
    height: u32,
    cells: Vec<Option<usize>>,
}

impl PointIndexGrid {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![None; width as usize * height as usize],
        }
    }

    fn cell(&self, p: Point) -> Option<usize> {
        let (x, y) = p.to_pixel();
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    /// Register `index` at `p`. Returns false if the pixel is outside the grid
    /// or already taken by another point.
    pub fn insert(&mut self, p: Point, index: usize) -> bool {
        match self.cell(p) {
            Some(cell) if self.cells[cell].is_none() => {
                self.cells[cell] = Some(index);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, p: Point) -> Option<usize> {
        self.cell(p).and_then(|cell| self.cells[cell])
    }

    /// Lookup by integer pixel
    pub fn at(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        self.cells[y as usize * self.width as usize + x as usize]
    }
}
