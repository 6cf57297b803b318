use std::env;
use std::process;

use log::{error, info};

use chordkv_node::discovery::{self, HEARTBEAT_INTERVAL};
use chordkv_node::server::spawn_snapshot_logger;
use chordkv_node::{api, Config, NodeServer};

fn usage() -> ! {
    eprintln!("usage: chordkv_node <project> <instance>");
    process::exit(2);
}

async fn bootstrap_address(config: &Config) -> Option<String> {
    if let Some(address) = &config.bootstrap_address {
        return Some(address.clone());
    }
    let own_name = format!("{}_{}", config.project, config.instance);
    match discovery::discover_bootstrap(&config.catalog_url, &config.project, &own_name).await {
        Ok(address) => Some(address),
        Err(e) => {
            info!("No bootstrap peer found ({}); starting a new network", e);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (Some(project), Some(instance)) = (args.next(), args.next()) else {
        usage();
    };

    let config = match Config::from_env(&project, &instance) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    let mut server = match NodeServer::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start node: {}", e);
            process::exit(1);
        }
    };

    let bootstrap = bootstrap_address(&config).await;
    if let Err(e) = server.join(bootstrap.as_deref()).await {
        error!("Failed to join via {:?}: {}; starting a new network", bootstrap, e);
        if let Err(e) = server.join(None).await {
            error!("Failed to start a new network: {}", e);
            process::exit(1);
        }
    }

    let port = server
        .address()
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.port);

    let snapshots = server.subscribe();
    let api_address = config.status_address(port);
    let api_snapshots = snapshots.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run(&api_address, api_snapshots).await {
            error!("Status API stopped: {}", e);
        }
    });
    spawn_snapshot_logger(snapshots, config.snapshot_interval);

    discovery::spawn_heartbeat(
        config.catalog_udp.clone(),
        format!("{}_{}", config.project, config.instance),
        port,
        HEARTBEAT_INTERVAL,
    );

    if let Err(e) = server.run().await {
        error!("Node stopped: {}", e);
        process::exit(1);
    }
}
