/// Sequence generators
///
/// A sequence hands out integers starting at `start` and moving by
/// `increment` on every call. Values stay within the inclusive bounds
/// `[min_value, max_value]`; when the next value would leave them the
/// sequence either wraps back to `start` (`cycle`) or fails with
/// `SequenceExhausted`, leaving its state untouched.
///
/// Every call is atomic: concurrent callers never observe the same value
/// from a non-cycling sequence.
///
/// # Examples
///
/// ```
/// use livecursor::{Sequence, SequenceDef};
///
/// let seq = Sequence::new(SequenceDef::new("ids").start(5).increment(-1).min_value(4)).unwrap();
/// assert_eq!(seq.next_value().unwrap(), 5);
/// assert_eq!(seq.next_value().unwrap(), 4);
/// assert!(seq.next_value().is_err());
/// assert_eq!(seq.current_value(), Some(4));
/// ```

use crate::error::{CursorError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Declared parameters of a sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDef {
    pub name: String,
    #[serde(default = "default_one")]
    pub start: i64,
    #[serde(default = "default_one")]
    pub increment: i64,
    /// Defaults to `start` for ascending sequences, `i64::MIN` otherwise
    #[serde(default)]
    pub min_value: Option<i64>,
    /// Defaults to `i64::MAX` for ascending sequences, `start` otherwise
    #[serde(default)]
    pub max_value: Option<i64>,
    #[serde(default)]
    pub cycle: bool,
}

fn default_one() -> i64 {
    1
}

impl SequenceDef {
    pub fn new(name: impl Into<String>) -> Self {
        SequenceDef {
            name: name.into(),
            start: 1,
            increment: 1,
            min_value: None,
            max_value: None,
            cycle: false,
        }
    }

    pub fn start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    pub fn increment(mut self, increment: i64) -> Self {
        self.increment = increment;
        self
    }

    pub fn min_value(mut self, min_value: i64) -> Self {
        self.min_value = Some(min_value);
        self
    }

    pub fn max_value(mut self, max_value: i64) -> Self {
        self.max_value = Some(max_value);
        self
    }

    pub fn cycle(mut self, cycle: bool) -> Self {
        self.cycle = cycle;
        self
    }

    /// Effective inclusive bounds.
    pub fn bounds(&self) -> (i64, i64) {
        if self.increment > 0 {
            (self.min_value.unwrap_or(self.start), self.max_value.unwrap_or(i64::MAX))
        } else {
            (self.min_value.unwrap_or(i64::MIN), self.max_value.unwrap_or(self.start))
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| CursorError::InvalidSequence {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.increment == 0 {
            return Err(invalid("increment must not be zero"));
        }
        let (min, max) = self.bounds();
        if min >= max {
            return Err(invalid("min value must be less than max value"));
        }
        if self.start < min || self.start > max {
            return Err(invalid("start value must lie between min and max values"));
        }
        Ok(())
    }
}

/// A live sequence
#[derive(Debug)]
pub struct Sequence {
    def: SequenceDef,
    min: i64,
    max: i64,
    /// Last value handed out, `None` before the first call
    last: Mutex<Option<i64>>,
}

impl Sequence {
    pub fn new(def: SequenceDef) -> Result<Self> {
        def.validate()?;
        let (min, max) = def.bounds();
        Ok(Sequence {
            def,
            min,
            max,
            last: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &SequenceDef {
        &self.def
    }

    /// Advance the sequence and return the new value.
    pub fn next_value(&self) -> Result<i64> {
        let mut last = self.last.lock();
        let candidate = match *last {
            None => Some(self.def.start),
            Some(previous) => previous
                .checked_add(self.def.increment)
                .filter(|v| (self.min..=self.max).contains(v)),
        };
        let value = match candidate {
            Some(v) => v,
            None if self.def.cycle => {
                log::debug!("sequence '{}' wrapped to {}", self.def.name, self.def.start);
                self.def.start
            }
            None => return Err(CursorError::SequenceExhausted(self.def.name.clone())),
        };
        *last = Some(value);
        Ok(value)
    }

    /// Last value handed out, without advancing.
    pub fn current_value(&self) -> Option<i64> {
        *self.last.lock()
    }
}
