//! Reconnection logic with exponential backoff and jitter

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
///
/// The nominal delay starts at `initial_backoff` and is multiplied after
/// every attempt. Jitter adds up to `jitter * nominal` on top, and the result
/// is capped at `max_backoff`. Because the config requires
/// `multiplier > 1 + jitter`, delays strictly increase until the cap.
pub struct ReconnectManager {
    config: ReconnectConfig,
    nominal: Duration,
    attempt: u32,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            nominal: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or None once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        self.attempt += 1;

        let nominal = self.nominal.min(self.config.max_backoff);
        let jitter = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.config.jitter)
        } else {
            0.0
        };
        let extra = Duration::try_from_secs_f64(nominal.as_secs_f64() * jitter)
            .unwrap_or(self.config.max_backoff);
        let delay = nominal.saturating_add(extra).min(self.config.max_backoff);

        // Saturates at the cap instead of overflowing Duration
        let grown = self.nominal.as_secs_f64() * self.config.multiplier;
        self.nominal = Duration::try_from_secs_f64(grown)
            .map_or(self.config.max_backoff, |next| next.min(self.config.max_backoff));

        Some(delay)
    }

    /// Wait before the next reconnection attempt
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<Duration, ReconnectError> {
        let delay = self
            .next_delay()
            .ok_or(ReconnectError::MaxAttemptsReached)?;

        debug!(
            attempt = self.attempt,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(delay),
        }
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.nominal = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Retries consumed since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_retries
    }
}
