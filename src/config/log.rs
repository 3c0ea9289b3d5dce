// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::PathBuf;

/// The `log` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    /// Print log to console.
    ///
    /// Default is true.
    #[serde(default = "Log::default_console_log", rename = "console-log", alias = "console_log")]
    console_log: bool,

    /// Path to log file. If unset, only console logging is used.
    #[serde(default, rename = "log-file", alias = "log_file")]
    log_file: Option<PathBuf>,

    /// Log level.
    ///
    /// Default is info.
    #[serde(default)]
    level: LogLevel,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console_log: true,
            log_file: None,
            level: LogLevel::default(),
        }
    }
}

impl Log {
    fn default_console_log() -> bool {
        true
    }

    #[must_use]
    pub const fn console_log(&self) -> bool {
        self.console_log
    }

    #[must_use]
    pub const fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LogLevel {
    #[serde(alias = "off")]
    Off,

    #[serde(alias = "error")]
    Error,

    #[serde(alias = "warn")]
    Warn,

    #[default]
    #[serde(alias = "info")]
    Info,

    #[serde(alias = "debug")]
    Debug,

    #[serde(alias = "trace")]
    Trace,
}
