//! Rate limiter configuration.
//!
//! Host applications describe the limiter in TOML:
//!
//! ```toml
//! rate = 10.0          # tokens per second, or "unlimited"
//! burst = 5
//!
//! [gate]
//! ping = false
//! conn = false
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::{Limit, RateLimiter};

/// Default refill rate in tokens per second.
pub const DEFAULT_RATE: f64 = 10.0;

/// Default bucket capacity.
pub const DEFAULT_BURST: u32 = 5;

/// A configured rate - either a number of tokens per second or a keyword.
///
/// Examples:
/// - `2.5` - two and a half tokens per second
/// - `"unlimited"` - never wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateValue {
    PerSecond(f64),
    Text(String),
}

impl RateValue {
    /// Resolve into a [`Limit`].
    ///
    /// Text values may be `"unlimited"`, `"inf"`/`"infinity"`, or a number.
    pub fn limit(&self) -> Result<Limit> {
        match self {
            RateValue::PerSecond(rate) => Limit::per_second(*rate),
            RateValue::Text(text) => {
                let text = text.trim();
                if ["unlimited", "inf", "infinity"]
                    .iter()
                    .any(|k| text.eq_ignore_ascii_case(k))
                {
                    return Ok(Limit::UNLIMITED);
                }
                let rate: f64 = text
                    .parse()
                    .map_err(|_| Error::Config(format!("unrecognized rate: {:?}", text)))?;
                Limit::per_second(rate)
            }
        }
    }
}

impl From<Limit> for RateValue {
    fn from(limit: Limit) -> Self {
        // TOML has no representation for infinity
        if limit.is_unlimited() {
            RateValue::Text("unlimited".to_string())
        } else {
            RateValue::PerSecond(limit.rate())
        }
    }
}

impl Default for RateValue {
    fn default() -> Self {
        RateValue::PerSecond(DEFAULT_RATE)
    }
}

/// Which normally ungated operations should also consume a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Gate health checks.
    #[serde(default)]
    pub ping: bool,
    /// Gate acquisition of dedicated connections.
    #[serde(default)]
    pub conn: bool,
}

impl GatePolicy {
    /// Gate every operation except `close`.
    pub fn all() -> Self {
        Self {
            ping: true,
            conn: true,
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub rate: RateValue,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub gate: GatePolicy,
}

fn default_burst() -> u32 {
    DEFAULT_BURST
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: RateValue::default(),
            burst: DEFAULT_BURST,
            gate: GatePolicy::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: Limit, burst: u32) -> Self {
        Self {
            rate: limit.into(),
            burst,
            gate: GatePolicy::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn limit(&self) -> Result<Limit> {
        self.rate.limit()
    }

    /// Check that a limiter can be built from this configuration.
    pub fn validate(&self) -> Result<()> {
        self.limit()?;
        if self.burst == 0 {
            return Err(Error::InvalidBurst { burst: self.burst });
        }
        Ok(())
    }

    pub fn build_limiter(&self) -> Result<RateLimiter> {
        RateLimiter::new(self.limit()?, self.burst)
    }
}
