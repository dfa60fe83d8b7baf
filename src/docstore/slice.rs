//! Slice algebra over record positions.
//!
//! Bounds follow Python slice rules for a positive step: negative indices
//! count from the end and everything is clamped to the sequence. Fractional
//! bounds in `[0, 1]` select a relative position and resolve against the
//! length of the sequence being sliced.

use anyhow::Result;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Index(i64),
    Fraction(f64),
}

impl From<i64> for Bound {
    fn from(index: i64) -> Self {
        Bound::Index(index)
    }
}

impl From<f64> for Bound {
    fn from(fraction: f64) -> Self {
        Bound::Fraction(fraction)
    }
}

impl Bound {
    fn resolve(self, len: u64) -> Result<u64> {
        match self {
            Bound::Index(i) if i < 0 => Ok(len.saturating_sub(i.unsigned_abs())),
            Bound::Index(i) => Ok((i as u64).min(len)),
            Bound::Fraction(f) => {
                if !(0.0..=1.0).contains(&f) {
                    anyhow::bail!("fractional slice bound {} outside [0, 1]", f);
                }
                Ok(((f * len as f64) as u64).min(len))
            }
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Index(i) => write!(f, "{}", i),
            Bound::Fraction(x) => write!(f, "{}", x),
        }
    }
}

/// Requested slice, e.g. `SliceSpec::new(10, 20)` or `SliceSpec::from(0.5)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SliceSpec {
    pub start: Option<Bound>,
    pub stop: Option<Bound>,
    pub step: Option<i64>,
}

impl SliceSpec {
    pub fn new<A: Into<Bound>, B: Into<Bound>>(start: A, stop: B) -> Self {
        Self {
            start: Some(start.into()),
            stop: Some(stop.into()),
            step: None,
        }
    }

    /// Everything from `start` to the end.
    pub fn from<A: Into<Bound>>(start: A) -> Self {
        Self {
            start: Some(start.into()),
            ..Self::default()
        }
    }

    /// Everything before `stop`.
    pub fn to<B: Into<Bound>>(stop: B) -> Self {
        Self {
            stop: Some(stop.into()),
            ..Self::default()
        }
    }

    pub fn step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }
}

impl fmt::Display for SliceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(start) = self.start {
            write!(f, "{}", start)?;
        }
        f.write_str(":")?;
        if let Some(stop) = self.stop {
            write!(f, "{}", stop)?;
        }
        if let Some(step) = self.step {
            write!(f, ":{}", step)?;
        }
        Ok(())
    }
}

/// Resolved positions `start, start + step, ...` below `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub stop: u64,
    pub step: u64,
}

impl Span {
    /// Every position of a sequence of `len` records.
    pub fn all(len: u64) -> Self {
        Self {
            start: 0,
            stop: len,
            step: 1,
        }
    }

    pub fn len(&self) -> u64 {
        if self.stop <= self.start {
            0
        } else {
            (self.stop - self.start).div_ceil(self.step)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute position of the `i`-th element.
    pub fn position(&self, i: u64) -> Option<u64> {
        (i < self.len()).then(|| self.start + i * self.step)
    }

    /// Apply `spec` to this span, relative to its own elements.
    pub fn sub(&self, spec: &SliceSpec) -> Result<Span> {
        let step = match spec.step {
            None => 1,
            Some(step) if step > 0 => step as u64,
            Some(step) => anyhow::bail!("slice step must be positive, got {}", step),
        };
        let len = self.len();
        let start = match spec.start {
            Some(bound) => bound.resolve(len)?,
            None => 0,
        };
        let stop = match spec.stop {
            Some(bound) => bound.resolve(len)?,
            None => len,
        };
        let stop = stop.max(start);
        Ok(Span {
            start: self.start + start * self.step,
            stop: (self.start + stop * self.step).min(self.stop.max(self.start)),
            step: self.step * step,
        })
    }
}
