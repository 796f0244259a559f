// THEORY:
// The per-frame score is noisy: a passing truck, a bird, a gust of rain on the
// lens. The `EventStateMachine` turns that signal into two discrete states,
// NORMAL and EVENT, using hysteresis plus debounce:
//
// - NORMAL → EVENT once `debounce` consecutive scores fall below `trigger`.
// - EVENT → NORMAL once `debounce` consecutive scores reach `recovery`.
// - Any reading that does not cross resets the counter it would have advanced.
//
// `recovery` is strictly above `trigger`, so scores inside the band never flip
// the state in either direction. While in EVENT the machine tracks the worst and
// best score (and when they happened); the closing transition carries them as an
// `EventWindow`, which the recorder uses to centre the highlight clip.
//
// `step` is a pure function over owned values. The state machine wrapper only
// holds the current state so a camera unit can feed it one reading at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_modules::estimator::VisibilityReading;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Normal,
    Event,
}

/// Display label for a single score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisibilityStatus {
    Poor,
    Moderate,
    Good,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub trigger: f64,
    pub recovery: f64,
    pub debounce: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds { trigger: 0.30, recovery: 0.50, debounce: 1 }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        let unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !unit(self.trigger) || !unit(self.recovery) {
            return Err(Error::config("thresholds must lie in 0..1"));
        }
        if self.recovery <= self.trigger {
            return Err(Error::config(format!(
                "recovery threshold {} must be greater than trigger threshold {}",
                self.recovery, self.trigger
            )));
        }
        if self.debounce == 0 {
            return Err(Error::config("debounce count must be at least 1"));
        }
        Ok(())
    }

    pub fn classify(&self, score: f64) -> VisibilityStatus {
        if score < self.trigger {
            VisibilityStatus::Poor
        } else if score < self.recovery {
            VisibilityStatus::Moderate
        } else {
            VisibilityStatus::Good
        }
    }
}

/// A score and the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreMark {
    pub score: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventState {
    pub mode: Mode,
    /// When the current mode was entered. `None` until the first transition.
    pub entered_at: Option<DateTime<Utc>>,
    pub worst: Option<ScoreMark>,
    pub best: Option<ScoreMark>,
    pub below_trigger: u32,
    pub above_recovery: u32,
}

/// The closed span of one EVENT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventWindow {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub worst: ScoreMark,
    pub best: ScoreMark,
}

impl EventWindow {
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTransition {
    pub camera_id: String,
    pub from: Mode,
    pub to: Mode,
    pub at: DateTime<Utc>,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<EventWindow>,
}

/// Advances `state` by one reading.
pub fn step(
    state: &EventState,
    reading: &VisibilityReading,
    thresholds: &Thresholds,
) -> (EventState, Option<EventTransition>) {
    let score = reading.score;
    let at = reading.timestamp;
    let mark = ScoreMark { score, at };
    let mut next = state.clone();

    match state.mode {
        Mode::Normal => {
            if score < thresholds.trigger {
                next.below_trigger += 1;
                if next.below_trigger >= thresholds.debounce {
                    let next = EventState {
                        mode: Mode::Event,
                        entered_at: Some(at),
                        worst: Some(mark),
                        best: Some(mark),
                        below_trigger: 0,
                        above_recovery: 0,
                    };
                    let transition = EventTransition {
                        camera_id: reading.camera_id.clone(),
                        from: Mode::Normal,
                        to: Mode::Event,
                        at,
                        score,
                        window: None,
                    };
                    return (next, Some(transition));
                }
            } else {
                next.below_trigger = 0;
            }
            (next, None)
        }
        Mode::Event => {
            let worst = match state.worst {
                Some(w) if w.score <= score => w,
                _ => mark,
            };
            let best = match state.best {
                Some(b) if b.score >= score => b,
                _ => mark,
            };
            next.worst = Some(worst);
            next.best = Some(best);

            if score >= thresholds.recovery {
                next.above_recovery += 1;
                if next.above_recovery >= thresholds.debounce {
                    let window = EventWindow {
                        started_at: state.entered_at.unwrap_or(at),
                        ended_at: at,
                        worst,
                        best,
                    };
                    let next = EventState {
                        mode: Mode::Normal,
                        entered_at: Some(at),
                        ..EventState::default()
                    };
                    let transition = EventTransition {
                        camera_id: reading.camera_id.clone(),
                        from: Mode::Event,
                        to: Mode::Normal,
                        at,
                        score,
                        window: Some(window),
                    };
                    return (next, Some(transition));
                }
            } else {
                next.above_recovery = 0;
            }
            (next, None)
        }
    }
}

/// Owns one camera's `EventState` and feeds it through `step`.
#[derive(Debug, Clone)]
pub struct EventStateMachine {
    thresholds: Thresholds,
    state: EventState,
}

impl EventStateMachine {
    pub fn new(thresholds: Thresholds) -> Self {
        EventStateMachine { thresholds, state: EventState::default() }
    }

    pub fn observe(&mut self, reading: &VisibilityReading) -> Option<EventTransition> {
        let (next, transition) = step(&self.state, reading, &self.thresholds);
        self.state = next;
        transition
    }

    pub fn state(&self) -> &EventState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}
