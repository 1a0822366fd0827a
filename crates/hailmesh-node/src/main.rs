//! Hailmesh node binary
//!
//! Usage:
//!   hailmesh-node directory
//!   hailmesh-node taxi <id> <lat> <lon>     (stdin: release <customer>)
//!   hailmesh-node customer <id> <lat> <lon>
//!   hailmesh-node scan <file>

use hailmesh_dispatch::NoticeKind;
use hailmesh_geo::TaxiId;
use hailmesh_node::{
    parse_scan, run_scan, DirectoryService, Hail, NodeConfig, TaxiNode,
};
use hailmesh_transfer::{Dispatcher, Endpoint};
use hailmesh_wire::TaxiRecord;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_usage() {
    eprintln!("hailmesh-node - Decentralized taxi dispatch");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  hailmesh-node directory                   Run the directory");
    eprintln!("  hailmesh-node taxi <id> <lat> <lon>       Run a taxi until Ctrl-C");
    eprintln!("  hailmesh-node customer <id> <lat> <lon>   Hail a taxi and print replies");
    eprintln!("  hailmesh-node scan <file>                 Register taxis and run searches from a file");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  HAILMESH_DIRECTORY_ADDR    Directory endpoint (default: 127.0.0.1:20000)");
    eprintln!("  HAILMESH_BIND_ADDR         Local endpoint for taxis and customers (default: 0.0.0.0:0)");
    eprintln!("  HAILMESH_BIAS              Cluster bias box half-width (default: 0.25)");
    eprintln!("  HAILMESH_MAX_APPROACHING   Taxis allowed per customer (default: 2)");
    eprintln!("  HAILMESH_FETCH_TIMEOUT_MS  Reply timeout (default: 2000)");
    eprintln!("  HAILMESH_MAX_PACKET        Largest fetch reply (default: 64000)");
}

enum Role {
    Directory,
    Taxi(TaxiRecord),
    Customer(TaxiRecord),
    Scan(String),
}

fn parse_args(args: &[String]) -> Result<Role, String> {
    let role = args.get(1).ok_or("missing role")?;
    match role.as_str() {
        "directory" => Ok(Role::Directory),
        "taxi" => parse_record(&args[2..]).map(Role::Taxi),
        "customer" => parse_record(&args[2..]).map(Role::Customer),
        "scan" => args
            .get(2)
            .cloned()
            .map(Role::Scan)
            .ok_or_else(|| "scan requires a file argument".to_string()),
        other => Err(format!("unknown role {other:?}")),
    }
}

fn parse_record(args: &[String]) -> Result<TaxiRecord, String> {
    let [id, lat, lon] = args else {
        return Err("expected <id> <lat> <lon>".to_string());
    };
    let lat: f64 = lat.parse().map_err(|e| format!("bad latitude {lat:?}: {e}"))?;
    let lon: f64 = lon.parse().map_err(|e| format!("bad longitude {lon:?}: {e}"))?;
    Ok(TaxiRecord::new(id.as_str(), lat, lon))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hailmesh=info,hailmesh_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let role = match parse_args(&args) {
        Ok(role) => role,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    let config = NodeConfig::from_env()?;

    match role {
        Role::Directory => run_directory(&config).await?,
        Role::Taxi(record) => run_taxi(&config, record).await?,
        Role::Customer(record) => run_customer(&config, record).await?,
        Role::Scan(path) => {
            let text = std::fs::read_to_string(&path)?;
            let lines = parse_scan(&text)?;
            for report in run_scan(&config, &lines).await? {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    Ok(())
}

async fn run_directory(config: &NodeConfig) -> hailmesh_node::Result<()> {
    let endpoint = Endpoint::bind(config.directory_transport()).await?;
    let mut dispatcher = Dispatcher::new(DirectoryService::new(config.directory()));
    dispatcher.register(endpoint).await?;
    tracing::info!("Directory running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    let directory = dispatcher.shutdown().await?;
    tracing::info!(taxis = directory.len(), "Directory stopped");
    Ok(())
}

async fn run_taxi(config: &NodeConfig, record: TaxiRecord) -> hailmesh_node::Result<()> {
    let taxi = TaxiNode::start(
        config,
        record.id.clone(),
        record.location.latitude,
        record.location.longitude,
    )
    .await?;
    println!("{} listening on {}", taxi.id(), taxi.local_addr());
    println!("type `release <customer>` after a drop-off, Ctrl-C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => handle_taxi_command(&taxi, line.trim()).await,
                None => stdin_open = false,
            },
        }
    }

    let negotiator = taxi.shutdown().await?;
    tracing::info!(
        customers = negotiator.graph().customer_count(),
        "Taxi stopped"
    );
    Ok(())
}

async fn handle_taxi_command(taxi: &TaxiNode, line: &str) {
    match line.split_whitespace().collect::<Vec<_>>().as_slice() {
        [] => {}
        ["release", customer] => match taxi.release(&TaxiId::from(*customer)).await {
            Ok(()) => println!("{} released {}", taxi.id(), customer),
            Err(e) => eprintln!("Error: {e}"),
        },
        _ => eprintln!("Error: unknown command {line:?}"),
    }
}

async fn run_customer(config: &NodeConfig, record: TaxiRecord) -> hailmesh_node::Result<()> {
    let mut hail = Hail::start(config, record).await?;
    println!(
        "{} found {} taxis, pinged {}",
        hail.customer().id,
        hail.candidates().len(),
        hail.pinged()
    );

    for notice in hail.collect(config.fetch_timeout).await {
        let kind = match notice.kind {
            NoticeKind::Reply => "reply",
            NoticeKind::Intimation => "intimation",
        };
        println!(
            "{kind}: {} is {} at {}",
            notice.taxi.id, notice.taxi.state, notice.taxi.location
        );
    }

    hail.finish().await?;
    Ok(())
}
