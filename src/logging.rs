/*
 * Copyright 2019 OysterPack Inc.
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Anchor point for configuring and initializing the [log](https://crates.io/crates/log) system.
//!
//! Logging can only be initialized once per process. The first successful [init](fn.init.html)
//! wins, and the config it was given can be retrieved via [config](fn.config.html).

use fern::Dispatch;
use lazy_static::lazy_static;
use log::{info, warn, Level};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io,
    sync::atomic::{AtomicUsize, Ordering},
};

const LOG_NOT_INITIALIZED: usize = 0;
const LOG_INITIALIZING: usize = 1;
const LOG_INITIALIZED: usize = 2;
// LOG_NOT_INITIALIZED -> LOG_INITIALIZING -> LOG_INITIALIZED
static LOG_STATE: AtomicUsize = AtomicUsize::new(LOG_NOT_INITIALIZED);

lazy_static! {
    static ref LOG_CONFIG: RwLock<Option<LogConfig>> = RwLock::new(None);
}

/// Initializes the logging system.
/// - if logging is already initialized, then a warning is logged and the call returns Ok
/// - if another thread is initializing logging, then the call waits for it to finish. If that
///   attempt failed, then this call tries again with its own config.
///
/// ## Errors
/// If another logger, not managed by this module, was already installed.
pub fn init(config: LogConfig) -> Result<(), log::SetLoggerError> {
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let initialized = initialize_once(&LOG_STATE, move || -> Result<(), log::SetLoggerError> {
        configure_output(&config, configure_levels(&config)).apply()?;
        *LOG_CONFIG.write() = Some(config);
        Ok(())
    })?;
    if initialized {
        info!("logging has been initialized using config: {}", config_json);
    } else {
        warn!("logging has already been initialized");
    }
    Ok(())
}

// Runs `apply` at most once across all callers that share the state.
// - returns false if another caller has already initialized
// - a failed attempt resets the state, letting a waiting caller try again
fn initialize_once<F, E>(state: &AtomicUsize, apply: F) -> Result<bool, E>
where
    F: FnOnce() -> Result<(), E>,
{
    loop {
        match state.compare_exchange(
            LOG_NOT_INITIALIZED,
            LOG_INITIALIZING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(LOG_INITIALIZING) => {
                while state.load(Ordering::SeqCst) == LOG_INITIALIZING {
                    std::thread::yield_now();
                }
            }
            Err(_) => return Ok(false),
        }
    }
    match apply() {
        Ok(()) => {
            state.store(LOG_INITIALIZED, Ordering::SeqCst);
            Ok(true)
        }
        Err(err) => {
            state.store(LOG_NOT_INITIALIZED, Ordering::SeqCst);
            Err(err)
        }
    }
}

/// Returns the LogConfig that was used to initialize the log system.
pub fn config() -> Option<LogConfig> {
    LOG_CONFIG.read().clone()
}

fn configure_levels(config: &LogConfig) -> Dispatch {
    let mut dispatch = Dispatch::new().level(config.root_level().to_level_filter());
    if let Some(target_levels) = config.target_levels() {
        for (target, level) in target_levels {
            dispatch = dispatch.level_for(target.clone(), level.to_level_filter());
        }
    }
    dispatch
}

fn configure_output(config: &LogConfig, dispatch: Dispatch) -> Dispatch {
    let dispatch = dispatch.format(|out, message, record| {
        out.finish(format_args!(
            "{}[{}][{}][{:?}] {}",
            chrono::Local::now().format("[%H:%M:%S%.3f]"),
            record.level(),
            record.target(),
            std::thread::current().name().unwrap_or("unnamed"),
            message
        ))
    });
    match config.output() {
        LogOutput::Stdout => dispatch.chain(io::stdout()),
        LogOutput::Stderr => dispatch.chain(io::stderr()),
    }
}

/// Where log records are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    /// stdout
    Stdout,
    /// stderr
    Stderr,
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Stderr
    }
}

/// Log config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    root_level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_levels: Option<BTreeMap<String, Level>>,
    #[serde(default)]
    output: LogOutput,
}

impl LogConfig {
    /// Returns the root log level.
    pub fn root_level(&self) -> Level {
        self.root_level
    }

    /// Returns the configured target log levels
    pub fn target_levels(&self) -> Option<&BTreeMap<String, Level>> {
        self.target_levels.as_ref()
    }

    /// Returns where log records are written
    pub fn output(&self) -> LogOutput {
        self.output
    }
}

impl Default for LogConfig {
    /// root log level is Warn, logging to stderr
    fn default() -> Self {
        Self {
            root_level: Level::Warn,
            target_levels: None,
            output: LogOutput::default(),
        }
    }
}

/// LogConfig builder
#[derive(Debug)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    /// constructor
    pub fn new(root_level: Level) -> Self {
        Self {
            config: LogConfig {
                root_level,
                ..LogConfig::default()
            },
        }
    }

    /// Sets the log level for the specified target, e.g., a crate or module path
    pub fn target_level<T: Into<String>>(mut self, target: T, level: Level) -> Self {
        self.config
            .target_levels
            .get_or_insert_with(BTreeMap::new)
            .insert(target.into(), level);
        self
    }

    /// Sets the log output
    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    /// Builds and returns the LogConfig
    pub fn build(self) -> LogConfig {
        self.config
    }
}
