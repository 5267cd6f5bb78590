//! Learning-rate schedule driven by stagnation events, plus the detector that
//! raises them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use alexnet_common::{Error, Result};

// ── Decay function ──────────────────────────────────────────────────────────

/// Maps the number of stagnation events to a multiplier on the initial rate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagnationDecay {
    /// `initial · factor^count`, `factor` in (0, 1).
    Exponential { factor: f64 },
    /// `initial / (1 + factor · count)`, `factor` > 0.
    Inverse { factor: f64 },
}

impl Default for StagnationDecay {
    /// Halve the rate on every stagnation event.
    fn default() -> Self {
        Self::Exponential { factor: 0.5 }
    }
}

impl StagnationDecay {
    /// `"exponential"` or `"inverse"`, with the given factor.
    pub fn from_str(kind: &str, factor: f64) -> Result<Self> {
        let decay = match kind {
            "exponential" => Self::Exponential { factor },
            "inverse" => Self::Inverse { factor },
            other => {
                return Err(Error::invalid_config(format!(
                    "unknown stagnation decay {other:?}"
                )))
            }
        };
        decay.validate()?;
        Ok(decay)
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Exponential { factor } if !(factor > 0.0 && factor < 1.0) => Err(
                Error::invalid_config(format!("exponential factor must be in (0, 1), got {factor}")),
            ),
            Self::Inverse { factor } if !(factor > 0.0 && factor.is_finite()) => Err(
                Error::invalid_config(format!("inverse factor must be > 0, got {factor}")),
            ),
            _ => Ok(()),
        }
    }

    fn multiplier(&self, count: usize) -> f64 {
        match *self {
            Self::Exponential { factor } => factor.powi(count.min(i32::MAX as usize) as i32),
            Self::Inverse { factor } => 1.0 / (1.0 + factor * count as f64),
        }
    }
}

// ── Schedule ────────────────────────────────────────────────────────────────

/// Constant rate until told that training has stagnated.
#[derive(Clone, Debug)]
pub struct LrSchedule {
    initial_rate: f64,
    min_rate: f64,
    stagnation_count: usize,
    decay: StagnationDecay,
}

impl LrSchedule {
    pub fn new(initial_rate: f64, min_rate: f64, decay: StagnationDecay) -> Result<Self> {
        if !(initial_rate > 0.0 && initial_rate.is_finite()) {
            return Err(Error::invalid_config(format!(
                "learning rate must be > 0, got {initial_rate}"
            )));
        }
        if !(0.0..initial_rate).contains(&min_rate) {
            return Err(Error::invalid_config(format!(
                "min rate must be in [0, {initial_rate}), got {min_rate}"
            )));
        }
        decay.validate()?;
        Ok(Self {
            initial_rate,
            min_rate,
            stagnation_count: 0,
            decay,
        })
    }

    pub fn current_rate(&self) -> f64 {
        if self.stagnation_count == 0 {
            return self.initial_rate;
        }
        (self.initial_rate * self.decay.multiplier(self.stagnation_count)).max(self.min_rate)
    }

    /// Record one stagnation event. Returns the new effective rate.
    pub fn on_stagnation(&mut self) -> f64 {
        self.stagnation_count += 1;
        self.current_rate()
    }

    pub fn stagnation_count(&self) -> usize {
        self.stagnation_count
    }

    pub fn initial_rate(&self) -> f64 {
        self.initial_rate
    }

    /// Restore the counter, e.g. when resuming a run.
    pub fn set_stagnation_count(&mut self, count: usize) {
        self.stagnation_count = count;
    }
}

// ── Stagnation detector ─────────────────────────────────────────────────────

/// Flags an epoch whose eval accuracy did not beat the previous epoch's.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StagnationDetector {
    previous: f64,
}

impl Default for StagnationDetector {
    fn default() -> Self {
        Self { previous: -1.0 }
    }
}

impl StagnationDetector {
    /// Feed this epoch's accuracy; `true` when `previous >= accuracy`.
    pub fn observe(&mut self, accuracy: f64) -> bool {
        let stagnated = self.previous >= accuracy;
        self.previous = accuracy;
        stagnated
    }

    /// Last observed accuracy, `-1` before the first observation.
    pub fn previous(&self) -> f64 {
        self.previous
    }

    pub fn with_previous(previous: f64) -> Self {
        Self { previous }
    }
}

// ── Persisted state ─────────────────────────────────────────────────────────

/// Everything that moves the rate across epochs. Stored next to each
/// checkpoint so a resumed run continues at the rate it left off.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub stagnation_count: usize,
    pub previous_accuracy: f64,
    #[serde(default)]
    pub global_step: usize,
}

impl ScheduleState {
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
