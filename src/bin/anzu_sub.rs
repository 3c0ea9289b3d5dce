// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::convert::TryFrom;

use anzu::client::{Client, ConnectOptions};
use anzu::error::{Error, ErrorKind};

#[derive(Debug, Parser)]
#[command(
    name = "anzu-sub",
    version,
    about = "Subscribe to a topic filter and print messages"
)]
struct Args {
    /// Broker address.
    #[arg(short, long, default_value = "127.0.0.1:1883")]
    server: String,

    /// Topic filter to subscribe to.
    #[arg(short, long)]
    topic: String,

    /// Quality of service, 0, 1 or 2.
    #[arg(short, long, default_value_t = 0)]
    qos: u8,

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
    let ack = client.subscribe(&args.topic, qos).await?;
    log::info!("Subscribed to {}, ack: {ack:?}", args.topic);

    loop {
        tokio::select! {
            msg = client.next_message() => {
                let msg = msg?;
                println!(
                    "{} {}",
                    msg.topic(),
                    String::from_utf8_lossy(msg.payload())
                );
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }
    client.disconnect().await
}
