// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;

use crate::broker::Broker;
use crate::config::Config;
use crate::error::Error;
use crate::log::init_log;

pub const DEFAULT_CONFIG: &str = "/etc/anzu/anzu.toml";

/// Listener used when no config file is found.
const FALLBACK_CONFIG: &str = r#"
[listeners.default]
type = "tcp"
bind = "0.0.0.0:1883"
"#;

#[derive(Debug, Parser)]
#[command(name = "anzu", version, about = "High performance MQTT broker")]
struct Args {
    /// Specify config file path.
    #[arg(short, long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Test config file and exit.
    #[arg(short, long)]
    test: bool,
}

/// Entry point of the broker binary.
///
/// # Errors
///
/// Returns error if the config is invalid or a listener cannot be bound,
/// which makes the process exit non-zero.
pub fn run_server() -> Result<(), Error> {
    let args = Args::parse();

    let config_file = args.config.or_else(|| {
        let default_config = Path::new(DEFAULT_CONFIG);
        default_config.exists().then(|| default_config.to_path_buf())
    });

    let config = if let Some(config_file) = config_file {
        let config_content = std::fs::read_to_string(&config_file)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;

        if args.test {
            println!(
                "The configuration file {} syntax is Ok",
                config_file.display()
            );
            return Ok(());
        }
        config
    } else {
        toml::from_str(FALLBACK_CONFIG)?
    };

    init_log(config.log())?;

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let broker = Broker::new(config)?;
        broker.run().await
    })
}

/// Run the broker with a prepared config, useful in integration tests.
///
/// # Errors
///
/// Returns error if the config is invalid or a listener cannot be bound.
pub fn run_server_with_config(config: Config) -> Result<(), Error> {
    config.validate()?;
    init_log(config.log())?;
    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let broker = Broker::new(config)?;
        broker.run().await
    })
}
