//! Physical quantities used across the bay
//!
//! Lengths are stored in centimetres, speeds in km/h. Configuration files
//! carry plain centimetre numbers, so `Length` deserializes transparently.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::time::Duration;

const CM_PER_INCH: f64 = 2.54;

/// Distance in centimetres
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Length(f64);

impl Length {
    pub const ZERO: Length = Length(0.0);

    pub fn from_cm(cm: f64) -> Self {
        Self(cm)
    }

    pub fn from_mm(mm: f64) -> Self {
        Self(mm / 10.0)
    }

    pub fn from_m(m: f64) -> Self {
        Self(m * 100.0)
    }

    pub fn from_inches(inches: f64) -> Self {
        Self(inches * CM_PER_INCH)
    }

    pub fn cm(&self) -> f64 {
        self.0
    }

    pub fn inches(&self) -> f64 {
        self.0 / CM_PER_INCH
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self(self.0 * factor)
    }

    /// Ratio of two lengths, 0 when the divisor is zero
    pub fn ratio(&self, other: Length) -> f64 {
        if other.0 == 0.0 {
            0.0
        } else {
            self.0 / other.0
        }
    }
}

impl Add for Length {
    type Output = Length;

    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

impl Sub for Length {
    type Output = Length;

    fn sub(self, rhs: Length) -> Length {
        Length(self.0 - rhs.0)
    }
}

impl Neg for Length {
    type Output = Length;

    fn neg(self) -> Length {
        Length(-self.0)
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} cm", self.0)
    }
}

/// Speed in km/h
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Speed(f64);

impl Speed {
    pub const ZERO: Speed = Speed(0.0);

    pub fn from_kph(kph: f64) -> Self {
        Self(kph)
    }

    /// Average speed covering `distance` in `elapsed`
    ///
    /// Zero elapsed time yields zero rather than infinity.
    pub fn from_travel(distance: Length, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Speed::ZERO;
        }
        // cm/s -> km/h
        Self(distance.abs().cm() / secs * 0.036)
    }

    pub fn kph(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} kph", self.0)
    }
}
