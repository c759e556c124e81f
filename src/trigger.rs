//! # Singing Trigger State Machine
//!
//! Turns a noisy per-frame "is someone singing" probability into a debounced
//! trigger event that starts (and keeps alive) lyric auto-scroll.
//!
//! ## Pipeline per frame:
//! 1. **Smoothing**: exponential moving average over the singing probability
//! 2. **Speech veto**: frames that look like spoken conversation are blocked
//! 3. **Hysteresis**: a start threshold to begin, a lower stop threshold to end
//! 4. **Hold**: the signal must stay above the start threshold for `hold_ms`
//! 5. **Cooldown**: fixed dead-time after a trigger
//!
//! ## State Diagram:
//! ```text
//! Idle ──(smoothed ≥ start)──▶ Accumulating ──(held ≥ hold_ms)──▶ Cooldown
//!  ▲                               │                                 │
//!  └──────(dip or speech)──────────┘                      (cooldown expired)
//!  ▲                                                                 │
//!  └──────(smoothed < stop or speech)────── Triggered ◀──(≥ stop)────┘
//! ```
//!
//! The machine is timestamp-driven: it never reads a clock, so it can be
//! called from an audio callback and replayed deterministically in tests.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tuning for the singing detector.
///
/// Shared with clients through `GET /api/v1/config`, so the same values drive
/// the state machine wherever it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingingDetectorConfig {
    /// Smoothed probability needed to start accumulating
    pub start_threshold: f64,

    /// Smoothed probability below which an active trigger ends
    pub stop_threshold: f64,

    /// Contiguous time above `start_threshold` before triggering
    pub hold_ms: i64,

    /// Dead-time after a trigger during which no new trigger is emitted
    pub cooldown_ms: i64,

    /// EMA weight of the newest sample (0 < alpha <= 1)
    pub ema_alpha: f64,

    /// Analysis hop of the classifier feeding the machine
    pub hop_ms: u32,

    /// Analysis window of the classifier feeding the machine
    pub window_ms: u32,

    /// Block frames whose speech probability exceeds `speech_max`
    pub reject_speech: bool,

    /// Speech probability above which a frame is vetoed
    pub speech_max: f64,

    /// Log every state transition
    pub debug: bool,
}

impl Default for SingingDetectorConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.6,
            stop_threshold: 0.4,
            hold_ms: 600,
            cooldown_ms: 1500,
            ema_alpha: 0.3,
            hop_ms: 200,
            window_ms: 960,
            reject_speech: true,
            speech_max: 0.6,
            debug: false,
        }
    }
}

impl SingingDetectorConfig {
    /// Check the invariants the state machine relies on.
    ///
    /// ## What this checks:
    /// - Thresholds are probabilities and `stop_threshold <= start_threshold`
    /// - `ema_alpha` is in `(0, 1]` (0 would freeze the filter)
    /// - Hold and cooldown are not negative, hop and window are not zero
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("start_threshold", self.start_threshold),
            ("stop_threshold", self.stop_threshold),
            ("speech_max", self.speech_max),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }

        if self.stop_threshold > self.start_threshold {
            return Err(anyhow::anyhow!(
                "stop_threshold ({}) must not exceed start_threshold ({})",
                self.stop_threshold,
                self.start_threshold
            ));
        }

        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(anyhow::anyhow!("ema_alpha must be within (0, 1], got {}", self.ema_alpha));
        }

        if self.hold_ms < 0 || self.cooldown_ms < 0 {
            return Err(anyhow::anyhow!("hold_ms and cooldown_ms cannot be negative"));
        }

        if self.hop_ms == 0 || self.window_ms < self.hop_ms {
            return Err(anyhow::anyhow!("window_ms must be at least hop_ms, and hop_ms greater than 0"));
        }

        Ok(())
    }
}

/// One classifier result, produced once per analysis hop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerInput {
    pub probability_singing: f64,
    pub probability_speech: Option<f64>,
    pub timestamp_ms: i64,
}

impl TriggerInput {
    pub fn singing(probability_singing: f64, timestamp_ms: i64) -> Self {
        Self {
            probability_singing,
            probability_speech: None,
            timestamp_ms,
        }
    }

    pub fn with_speech(mut self, probability_speech: f64) -> Self {
        self.probability_speech = Some(probability_speech);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    Idle,
    Accumulating,
    Triggered,
    Cooldown,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Idle => "idle",
            TriggerState::Accumulating => "accumulating",
            TriggerState::Triggered => "triggered",
            TriggerState::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerOutput {
    pub smoothed_probability: f64,
    pub state: TriggerState,
    /// True only on the frame that enters the trigger/cooldown step
    pub should_trigger: bool,
}

/// Hysteresis state machine for one listening session.
///
/// Create one per session and call [`TriggerStateMachine::reset`] before
/// reusing it for the next.
#[derive(Debug, Clone)]
pub struct TriggerStateMachine {
    config: SingingDetectorConfig,
    state: TriggerState,
    smoothed: f64,
    accumulation_start_ms: Option<i64>,
    cooldown_end_ms: Option<i64>,
}

impl TriggerStateMachine {
    pub fn new(config: SingingDetectorConfig) -> Self {
        Self {
            config,
            state: TriggerState::Idle,
            smoothed: 0.0,
            accumulation_start_ms: None,
            cooldown_end_ms: None,
        }
    }

    pub fn config(&self) -> &SingingDetectorConfig {
        &self.config
    }

    /// Feed one frame and return the decision for it.
    ///
    /// At most one transition happens per call. Inputs are trusted: the caller
    /// supplies probabilities in `[0, 1]` and non-decreasing timestamps.
    pub fn process(&mut self, input: TriggerInput) -> TriggerOutput {
        let alpha = self.config.ema_alpha;
        self.smoothed = self.smoothed * (1.0 - alpha) + input.probability_singing * alpha;

        let blocked = self.config.reject_speech
            && input
                .probability_speech
                .is_some_and(|speech| speech > self.config.speech_max);

        let now = input.timestamp_ms;
        let mut should_trigger = false;

        match self.state {
            TriggerState::Idle => {
                if !blocked && self.smoothed >= self.config.start_threshold {
                    self.accumulation_start_ms = Some(now);
                    self.transition(TriggerState::Accumulating, now);
                }
            }
            TriggerState::Accumulating => {
                if blocked || self.smoothed < self.config.start_threshold {
                    // Hold time must be contiguous: a dip forfeits everything accumulated.
                    self.accumulation_start_ms = None;
                    self.transition(TriggerState::Idle, now);
                } else {
                    let started = self.accumulation_start_ms.unwrap_or(now);
                    if now - started >= self.config.hold_ms {
                        self.accumulation_start_ms = None;
                        self.cooldown_end_ms = Some(now + self.config.cooldown_ms);
                        should_trigger = true;
                        self.transition(TriggerState::Cooldown, now);
                    }
                }
            }
            TriggerState::Cooldown => {
                let expired = self.cooldown_end_ms.map_or(true, |end| now >= end);
                if expired {
                    self.cooldown_end_ms = None;
                    if self.smoothed >= self.config.stop_threshold {
                        self.transition(TriggerState::Triggered, now);
                    } else {
                        self.transition(TriggerState::Idle, now);
                    }
                }
            }
            TriggerState::Triggered => {
                if blocked || self.smoothed < self.config.stop_threshold {
                    self.transition(TriggerState::Idle, now);
                }
            }
        }

        TriggerOutput {
            smoothed_probability: self.smoothed,
            state: self.state,
            should_trigger,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn smoothed_probability(&self) -> f64 {
        self.smoothed
    }

    /// Return every field to its initial value.
    pub fn reset(&mut self) {
        self.state = TriggerState::Idle;
        self.smoothed = 0.0;
        self.accumulation_start_ms = None;
        self.cooldown_end_ms = None;
    }

    fn transition(&mut self, next: TriggerState, timestamp_ms: i64) {
        if self.config.debug {
            debug!(
                from = self.state.as_str(),
                to = next.as_str(),
                smoothed = self.smoothed,
                timestamp_ms,
                "singing detector transition"
            );
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> SingingDetectorConfig {
        SingingDetectorConfig {
            start_threshold: 0.5,
            stop_threshold: 0.3,
            hold_ms: 400,
            cooldown_ms: 1000,
            ema_alpha: 0.5,
            reject_speech: false,
            ..SingingDetectorConfig::default()
        }
    }

    /// Feed `value` every 100ms over `[from, to)` and collect the outputs.
    fn feed(machine: &mut TriggerStateMachine, value: f64, from: i64, to: i64) -> Vec<TriggerOutput> {
        (from..to)
            .step_by(100)
            .map(|t| machine.process(TriggerInput::singing(value, t)))
            .collect()
    }

    #[test]
    fn test_ema_recurrence() {
        let mut machine = TriggerStateMachine::new(SingingDetectorConfig {
            ema_alpha: 0.2,
            ..SingingDetectorConfig::default()
        });

        let first = machine.process(TriggerInput::singing(1.0, 0));
        let second = machine.process(TriggerInput::singing(1.0, 100));
        let third = machine.process(TriggerInput::singing(0.0, 200));

        assert_relative_eq!(first.smoothed_probability, 0.2, epsilon = 1e-12);
        assert_relative_eq!(second.smoothed_probability, 0.36, epsilon = 1e-12);
        assert_relative_eq!(third.smoothed_probability, 0.288, epsilon = 1e-12);
        assert_relative_eq!(machine.smoothed_probability(), 0.288, epsilon = 1e-12);
    }

    #[test]
    fn test_sustained_singing_triggers_exactly_once() {
        let mut machine = TriggerStateMachine::new(SingingDetectorConfig {
            ema_alpha: 0.2,
            ..config()
        });

        let outputs = feed(&mut machine, 1.0, 0, 5000);

        let first_accumulating = outputs
            .iter()
            .position(|o| o.state == TriggerState::Accumulating)
            .expect("never started accumulating");
        assert!(outputs[first_accumulating].smoothed_probability >= 0.5);
        assert!(outputs[..first_accumulating].iter().all(|o| o.state == TriggerState::Idle));

        let triggers: Vec<usize> = outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.should_trigger)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(triggers.len(), 1);

        let trigger = triggers[0];
        assert_eq!(outputs[trigger].state, TriggerState::Cooldown);
        // Hold is measured from the frame that entered Accumulating.
        assert_eq!((trigger - first_accumulating) as i64 * 100, 400);
    }

    #[test]
    fn test_hold_completes_on_boundary() {
        let mut machine = TriggerStateMachine::new(config());

        let outputs = feed(&mut machine, 1.0, 0, 500);
        let states: Vec<TriggerState> = outputs.iter().map(|o| o.state).collect();

        assert_eq!(
            states,
            vec![
                TriggerState::Accumulating,
                TriggerState::Accumulating,
                TriggerState::Accumulating,
                TriggerState::Accumulating,
                TriggerState::Cooldown,
            ]
        );
        assert!(outputs[4].should_trigger);
    }

    #[test]
    fn test_dip_while_accumulating_forfeits_hold() {
        let mut machine = TriggerStateMachine::new(config());

        feed(&mut machine, 1.0, 0, 300);
        assert_eq!(machine.state(), TriggerState::Accumulating);

        let dip = machine.process(TriggerInput::singing(0.0, 300));
        assert!(dip.smoothed_probability < 0.5);
        assert_eq!(dip.state, TriggerState::Idle);

        // Back to loud singing: a fresh 400ms hold is required from re-entry.
        let resumed = feed(&mut machine, 1.0, 400, 1200);
        let entered = resumed
            .iter()
            .position(|o| o.state == TriggerState::Accumulating)
            .unwrap();
        let fired = resumed.iter().position(|o| o.should_trigger).unwrap();
        assert_eq!((fired - entered) as i64 * 100, 400);
    }

    #[test]
    fn test_cooldown_suppresses_every_input() {
        let mut machine = TriggerStateMachine::new(config());
        feed(&mut machine, 1.0, 0, 500);
        assert_eq!(machine.state(), TriggerState::Cooldown);

        // Trigger fired at t=400, cooldown ends at t=1400.
        for (i, t) in (500..1400).step_by(100).enumerate() {
            let value = if i % 2 == 0 { 1.0 } else { 0.0 };
            let output = machine.process(TriggerInput::singing(value, t));
            assert!(!output.should_trigger);
            assert_eq!(output.state, TriggerState::Cooldown);
        }
    }

    #[test]
    fn test_cooldown_expiry_keeps_singing_alive() {
        let mut machine = TriggerStateMachine::new(config());
        feed(&mut machine, 1.0, 0, 1400);
        assert_eq!(machine.state(), TriggerState::Cooldown);

        let expired = machine.process(TriggerInput::singing(1.0, 1400));
        assert_eq!(expired.state, TriggerState::Triggered);
        assert!(!expired.should_trigger);

        // Between the thresholds: stays triggered (stop bound applies now).
        let outputs = feed(&mut machine, 0.4, 1500, 3000);
        assert!(outputs.iter().all(|o| o.state == TriggerState::Triggered));
        assert!(outputs.iter().all(|o| !o.should_trigger));

        let silent = feed(&mut machine, 0.0, 3000, 3300);
        assert_eq!(silent.last().unwrap().state, TriggerState::Idle);
    }

    #[test]
    fn test_cooldown_expiry_with_silence_goes_idle() {
        let mut machine = TriggerStateMachine::new(config());
        feed(&mut machine, 1.0, 0, 500);
        feed(&mut machine, 0.0, 500, 1400);

        let expired = machine.process(TriggerInput::singing(0.0, 1400));
        assert!(expired.smoothed_probability < 0.3);
        assert_eq!(expired.state, TriggerState::Idle);
    }

    #[test]
    fn test_between_thresholds_never_starts() {
        let mut machine = TriggerStateMachine::new(config());

        let outputs = feed(&mut machine, 0.4, 0, 5000);
        assert!(outputs.iter().all(|o| o.state == TriggerState::Idle));
    }

    #[test]
    fn test_speech_veto() {
        let veto = SingingDetectorConfig {
            reject_speech: true,
            speech_max: 0.6,
            ..config()
        };
        let mut machine = TriggerStateMachine::new(veto.clone());
        for t in (0..5000).step_by(100) {
            let output = machine.process(TriggerInput::singing(1.0, t).with_speech(0.8));
            assert_eq!(output.state, TriggerState::Idle);
        }

        let mut permissive = TriggerStateMachine::new(SingingDetectorConfig {
            reject_speech: false,
            ..veto
        });
        let output = permissive.process(TriggerInput::singing(1.0, 0).with_speech(0.8));
        assert_eq!(output.state, TriggerState::Accumulating);
    }

    #[test]
    fn test_speech_veto_ends_active_trigger() {
        let mut machine = TriggerStateMachine::new(SingingDetectorConfig {
            reject_speech: true,
            speech_max: 0.6,
            ..config()
        });
        feed(&mut machine, 1.0, 0, 1500);
        assert_eq!(machine.state(), TriggerState::Triggered);

        let output = machine.process(TriggerInput::singing(1.0, 1500).with_speech(0.9));
        assert_eq!(output.state, TriggerState::Idle);
    }

    #[test]
    fn test_reset() {
        let mut machine = TriggerStateMachine::new(config());
        feed(&mut machine, 1.0, 0, 1500);
        assert_eq!(machine.state(), TriggerState::Triggered);

        machine.reset();
        assert_eq!(machine.state(), TriggerState::Idle);
        assert_eq!(machine.smoothed_probability(), 0.0);

        // A fresh session starts the recurrence from zero again.
        let output = machine.process(TriggerInput::singing(1.0, 0));
        assert_relative_eq!(output.smoothed_probability, 0.5);
    }

    #[test]
    fn test_config_validation() {
        assert!(SingingDetectorConfig::default().validate().is_ok());

        let inverted = SingingDetectorConfig {
            start_threshold: 0.3,
            stop_threshold: 0.5,
            ..SingingDetectorConfig::default()
        };
        assert!(inverted.validate().is_err());

        let frozen = SingingDetectorConfig {
            ema_alpha: 0.0,
            ..SingingDetectorConfig::default()
        };
        assert!(frozen.validate().is_err());
    }
}
