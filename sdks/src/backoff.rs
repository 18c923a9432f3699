// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Discovery-poll backoff
//!
//! Pure state machine, no I/O. Each empty discovery result multiplies the
//! sleep up to a cap; the first non-empty result drops it straight back to
//! the floor.

use bazaar_core::domain::node_config::BackoffSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffState {
    pub consecutive_empty_results: u32,
    pub current_sleep_ms: u64,
    pub cap_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BackoffController {
    floor_ms: u64,
    multiplier: u64,
    state: BackoffState,
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::from_settings(&BackoffSettings::default())
    }
}

impl BackoffController {
    /// `floor_ms` is clamped to `[1, cap_ms]` and `multiplier` to at least 1.
    pub fn new(floor_ms: u64, multiplier: u32, cap_ms: u64) -> Self {
        let cap_ms = cap_ms.max(1);
        let floor_ms = floor_ms.clamp(1, cap_ms);
        Self {
            floor_ms,
            multiplier: u64::from(multiplier.max(1)),
            state: BackoffState {
                consecutive_empty_results: 0,
                current_sleep_ms: floor_ms,
                cap_ms,
            },
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(settings.floor_ms, settings.multiplier, settings.cap_ms)
    }

    /// Record one discovery result and return the sleep before the next poll.
    pub fn advance(&mut self, result_was_empty: bool) -> u64 {
        if result_was_empty {
            self.state.current_sleep_ms = self
                .state
                .current_sleep_ms
                .saturating_mul(self.multiplier)
                .min(self.state.cap_ms);
            self.state.consecutive_empty_results = self.state.consecutive_empty_results.saturating_add(1);
        } else {
            self.reset();
        }
        self.state.current_sleep_ms
    }

    pub fn advance_duration(&mut self, result_was_empty: bool) -> Duration {
        Duration::from_millis(self.advance(result_was_empty))
    }

    pub fn reset(&mut self) {
        self.state.current_sleep_ms = self.floor_ms;
        self.state.consecutive_empty_results = 0;
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn floor_ms(&self) -> u64 {
        self.floor_ms
    }

    pub fn current_sleep(&self) -> Duration {
        Duration::from_millis(self.state.current_sleep_ms)
    }
}
