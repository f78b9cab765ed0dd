use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

/// 2D vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2f {
    pub x: f32,
    pub y: f32,
}

impl Vector2f {
    pub const ZERO: Vector2f = Vector2f { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Linear interpolation, `t` is not clamped.
    pub fn lerp(self, other: Vector2f, t: f32) -> Vector2f {
        self + (other - self) * t
    }

    pub fn distance(self, other: Vector2f) -> f32 {
        (other - self).magnitude()
    }
}

impl Add for Vector2f {
    type Output = Vector2f;

    fn add(self, rhs: Vector2f) -> Vector2f {
        Vector2f::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vector2f {
    type Output = Vector2f;

    fn sub(self, rhs: Vector2f) -> Vector2f {
        Vector2f::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vector2f {
    type Output = Vector2f;

    fn mul(self, scalar: f32) -> Vector2f {
        Vector2f::new(self.x * scalar, self.y * scalar)
    }
}
