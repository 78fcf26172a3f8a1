// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::device::{Channel, ExchangeError};
use crate::report::{self, ParseError, ParsedReport, ReservedPolicy};
use crate::request::{self, RequestError};
use log::{debug, info, warn};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[cfg(feature = "attester")]
use crate::device::GuestDevice;
#[cfg(feature = "attester")]
use std::path::Path;

/// Failure codes of the report request that are worth another attempt.
pub const DEFAULT_TRANSIENT_CODES: [i32; 3] =
    [Errno::EINTR as i32, Errno::EAGAIN as i32, Errno::EBUSY as i32];

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum Backoff {
    #[default]
    None,
    Fixed {
        delay: Duration,
    },
    /// `base * 2^(retry - 1)`, never more than `cap`.
    Exponential {
        base: Duration,
        cap: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry`, counting from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(cap).min(cap)
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquireOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Budget for the whole acquisition, retries and backoff included.
    pub deadline: Option<Duration>,
    pub transient_codes: Vec<i32>,
    pub reserved_policy: ReservedPolicy,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            deadline: None,
            transient_codes: DEFAULT_TRANSIENT_CODES.to_vec(),
            reserved_policy: ReservedPolicy::Reject,
        }
    }
}

impl AcquireOptions {
    /// Read options from JSON; absent fields keep their defaults.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_transient(&self, error: &ExchangeError) -> bool {
        matches!(error, ExchangeError::ExchangeFailed { code } if self.transient_codes.contains(code))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    /// The device or the platform failed.
    Device,
    /// The report cannot be trusted.
    Integrity,
    /// The caller asked for something impossible.
    Misuse,
}

#[derive(Error, Debug)]
pub enum Failure {
    #[error("invalid request")]
    Request(#[from] RequestError),
    #[error("device exchange failed")]
    Exchange(#[from] ExchangeError),
    #[error("report rejected")]
    Parse(#[from] ParseError),
    #[error("max_attempts must be at least 1")]
    InvalidOptions,
}

impl Failure {
    pub fn category(&self) -> Category {
        match self {
            Failure::Request(_) | Failure::InvalidOptions => Category::Misuse,
            Failure::Exchange(_) => Category::Device,
            Failure::Parse(_) => Category::Integrity,
        }
    }
}

#[derive(Error, Debug)]
#[error("TD report acquisition failed after {attempts} attempt(s)")]
pub struct AcquireError {
    attempts: u32,
    #[source]
    failure: Failure,
}

impl AcquireError {
    fn new(attempts: u32, failure: impl Into<Failure>) -> Self {
        Self {
            attempts,
            failure: failure.into(),
        }
    }

    /// Number of device exchanges performed before giving up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    pub fn into_failure(self) -> Failure {
        self.failure
    }

    pub fn category(&self) -> Category {
        self.failure.category()
    }

    /// The underlying errno, when the device reported one.
    pub fn code(&self) -> Option<i32> {
        match &self.failure {
            Failure::Exchange(e) => e.code(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Acquired {
    pub report: ParsedReport,
    pub attempts: u32,
}

fn remaining(deadline: Option<Duration>, started: Instant) -> Result<Option<Duration>, ExchangeError> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    match deadline.checked_sub(started.elapsed()) {
        Some(left) if !left.is_zero() => Ok(Some(left)),
        _ => Err(ExchangeError::Timeout { after: deadline }),
    }
}

/// Build a request from `user_data`, exchange it over `channel` and validate
/// the report, retrying transient exchange failures as `options` allow.
pub fn acquire_with<C: Channel + ?Sized>(
    channel: &C,
    user_data: &[u8],
    options: &AcquireOptions,
) -> Result<Acquired, AcquireError> {
    if options.max_attempts == 0 {
        return Err(AcquireError::new(0, Failure::InvalidOptions));
    }
    let request = request::build(user_data).map_err(|e| AcquireError::new(0, e))?;

    let started = Instant::now();
    let mut attempts = 0;
    loop {
        let timeout =
            remaining(options.deadline, started).map_err(|e| AcquireError::new(attempts, e))?;
        attempts += 1;
        debug!("TD report attempt {attempts}/{}", options.max_attempts);

        let error = match channel.exchange(&request, timeout) {
            Ok(raw) => {
                let report = report::parse(&raw, &request, options.reserved_policy)
                    .map_err(|e| AcquireError::new(attempts, e))?;
                if attempts > 1 {
                    info!("acquired TD report after {attempts} attempts");
                }
                return Ok(Acquired { report, attempts });
            }
            Err(error) => error,
        };

        if attempts >= options.max_attempts || !options.is_transient(&error) {
            return Err(AcquireError::new(attempts, error));
        }

        let delay = options.backoff.delay(attempts);
        warn!("transient TD report failure on attempt {attempts}: {error}, retrying in {delay:?}");
        if let Some(deadline) = options.deadline {
            let retry_at = started.elapsed().checked_add(delay);
            if retry_at.map_or(true, |at| at >= deadline) {
                return Err(AcquireError::new(
                    attempts,
                    ExchangeError::Timeout { after: deadline },
                ));
            }
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Acquire a validated TD report from the guest device at `device_path`.
#[cfg(feature = "attester")]
pub fn acquire(
    device_path: impl AsRef<Path>,
    user_data: &[u8],
    options: &AcquireOptions,
) -> Result<Acquired, AcquireError> {
    let device = GuestDevice::new(device_path.as_ref());
    acquire_with(&device, user_data, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(64), Duration::from_millis(50));
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);
    }

    #[test]
    fn default_options_do_not_retry() {
        let options = AcquireOptions::default();
        assert_eq!(options.max_attempts, 1);
        assert!(options.is_transient(&ExchangeError::ExchangeFailed {
            code: Errno::EBUSY as i32
        }));
        assert!(!options.is_transient(&ExchangeError::ExchangeFailed {
            code: Errno::EINVAL as i32
        }));
        assert!(!options.is_transient(&ExchangeError::Timeout {
            after: Duration::from_secs(1)
        }));
    }

    #[test]
    fn options_from_json() {
        let json = br#"{
            "max_attempts": 3,
            "backoff": { "kind": "fixed", "delay": { "secs": 0, "nanos": 5000000 } },
            "reserved_policy": "flag"
        }"#;
        let options = AcquireOptions::from_json_slice(json).unwrap();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(
            options.backoff,
            Backoff::Fixed {
                delay: Duration::from_millis(5)
            }
        );
        assert_eq!(options.reserved_policy, ReservedPolicy::Flag);
        assert_eq!(options.deadline, None);
        assert_eq!(options.transient_codes, DEFAULT_TRANSIENT_CODES.to_vec());
    }

    #[test]
    fn zero_attempts_is_misuse() {
        let options = AcquireOptions {
            max_attempts: 0,
            ..Default::default()
        };
        let device = crate::simulate::SimulatedDevice::new();
        let err = acquire_with(&device, b"nonce", &options).unwrap_err();
        assert!(matches!(err.failure(), Failure::InvalidOptions));
        assert_eq!(err.category(), Category::Misuse);
        assert_eq!(device.reports_issued(), 0);
    }
}
