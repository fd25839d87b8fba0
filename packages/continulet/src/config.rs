//! Per-thread runtime configuration.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bridge::{BlockOnHost, HostRuntime};

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Environment variable overriding the fiber stack size, in bytes.
pub const STACK_SIZE_ENV: &str = "CONTINULET_STACK_SIZE";

#[derive(Clone)]
pub struct Config {
    /// Bytes reserved for each continuation's native stack.
    pub stack_size: usize,
    /// Runtime that performs blocking joins for parked host calls.
    pub host: Rc<dyn HostRuntime>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            host: Rc::new(BlockOnHost),
        }
    }
}

impl Config {
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes.max(MIN_STACK_SIZE);
        self
    }

    pub fn with_host(mut self, host: Rc<dyn HostRuntime>) -> Self {
        self.host = host;
        self
    }

    /// Defaults, with overrides from the environment applied.
    pub fn from_env() -> Self {
        let raw = std::env::var(STACK_SIZE_ENV).ok();
        Self::default().with_stack_size_override(raw.as_deref())
    }

    fn with_stack_size_override(self, raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return self;
        };
        match raw.trim().parse::<usize>() {
            Ok(bytes) => {
                if bytes < MIN_STACK_SIZE {
                    log::warn!(
                        "{STACK_SIZE_ENV}={bytes} is below the {MIN_STACK_SIZE} byte minimum; clamped"
                    );
                }
                self.with_stack_size(bytes)
            }
            Err(err) => {
                log::warn!("ignoring {STACK_SIZE_ENV}={raw:?}: {err}");
                self
            }
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Config>> = const { RefCell::new(None) };
}

/// Install `config` for switches issued on this thread. Returns the
/// previously installed configuration.
pub fn install(config: Config) -> Option<Config> {
    log::debug!("installing {config:?}");
    CURRENT.with(|current| current.borrow_mut().replace(config))
}

/// Configuration in effect on this thread, read from the environment on
/// first use.
pub fn current() -> Config {
    CURRENT.with(|current| {
        current
            .borrow_mut()
            .get_or_insert_with(Config::from_env)
            .clone()
    })
}
