//! Middleware configuration.
//!
//! | Variable | Values | Default |
//! |---|---|---|
//! | `CORDON_FATAL_ACTION` | `terminate`, `log-only` | `terminate` |

use crate::error::Error;
use crate::policy::Action;

/// Environment variable holding the fatal action.
pub const FATAL_ACTION_VAR: &str = "CORDON_FATAL_ACTION";

/// Settings for [`Isolation`](crate::middleware::Isolation).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    /// What to do with the process after a trapped error.
    pub fatal_action: Action,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if a variable is set to an unrecognised value.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`. Unset keys keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(raw) = lookup(FATAL_ACTION_VAR) {
            config.fatal_action = raw
                .parse()
                .map_err(|()| Error::Config { key: FATAL_ACTION_VAR, value: raw.clone() })?;
        }
        Ok(config)
    }
}
