use anyhow::anyhow;
use clap::Parser;
use log::info;
use simplelog::{Config as LogConfig, TermLogger, TerminalMode};
use warp::Filter;

use call_relay_server::{one_to_one, Config, Relay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    TermLogger::init(config.log_level, LogConfig::default(), TerminalMode::Mixed)
        .map_err(|e| anyhow!("failed to initialize logging: {e:?}"))?;

    let relay = Relay::new(config.identity_source(), config.ring_timeout());
    let relay = warp::any().map(move || relay.clone());

    let signaling_channel = warp::path("call")
        .and(warp::ws())
        .and(relay)
        .map(|ws: warp::ws::Ws, relay| {
            ws.on_upgrade(move |socket| one_to_one::user_connected(socket, relay))
        });

    info!(
        "listening on {}, calls ring for {}s",
        config.address, config.ring_timeout_secs
    );
    warp::serve(signaling_channel).run(config.address).await;
    Ok(())
}
