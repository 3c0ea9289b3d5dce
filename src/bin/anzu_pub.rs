// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::convert::TryFrom;

use anzu::client::{Client, ConnectOptions};
use anzu::error::{Error, ErrorKind};

#[derive(Debug, Parser)]
#[command(name = "anzu-pub", version, about = "Publish one MQTT message")]
struct Args {
    /// Broker address.
    #[arg(short, long, default_value = "127.0.0.1:1883")]
    server: String,

    /// Topic name to publish to.
    #[arg(short, long)]
    topic: String,

    /// Message payload.
    #[arg(short, long, default_value = "")]
    message: String,

    /// Quality of service, 0, 1 or 2.
    #[arg(short, long, default_value_t = 0)]
    qos: u8,

    /// Retain the message on the broker.
    #[arg(short, long)]
    retain: bool,

    /// Client id, random if unset.
    #[arg(short = 'i', long)]
    client_id: Option<String>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(short = 'P', long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let qos = codec::QoS::try_from(args.qos).map_err(|_err| {
        Error::from_string(
            ErrorKind::ParameterError,
            format!("Invalid qos value: {}", args.qos),
        )
    })?;

    let mut options = ConnectOptions::new(&args.server);
    if let Some(client_id) = &args.client_id {
        options.set_client_id(client_id);
    }
    if let Some(username) = &args.username {
        options.set_username(username);
    }
    if let Some(password) = &args.password {
        options.set_password(password.as_bytes());
    }

    let client = Client::connect(&options).await?;
    client
        .publish(&args.topic, args.message.as_bytes(), qos, args.retain)
        .await?;
    client.disconnect().await
}
