use std::process;
use std::sync::Arc;

use cradle::{EchoWorker, RelayConfig, RelayService, ServerConfig, WorkerRouter};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: cradle-server [--host <addr>] [--port <port>] [--follow-up]";

#[derive(Debug)]
struct Args {
    server: ServerConfig,
    follow_up: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <addr>    Interface to bind [default: 0.0.0.0]");
            eprintln!("  --port <port>    Port to bind [default: 38000]");
            eprintln!("  --follow-up      Keep answering messages after the first reply");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  CRADLE_LOG                    debug, info, warn or error [default: info]");
            eprintln!("  LOG_FORMAT=json               JSON log lines on stderr");
            eprintln!("  CRADLE_POLL_INTERVAL_MS       Loop poll interval [default: 250]");
            eprintln!("  CRADLE_HANDSHAKE_TIMEOUT_MS   Wait for the first message [default: 30000]");
            eprintln!("  CRADLE_PARSE_ERRORS           fatal or skip [default: fatal]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args) {
        tracing::error!(error = %e, "Server failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut server = ServerConfig::default();
    let mut follow_up = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                server.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                server.port = raw
                    .parse()
                    .map_err(|_| format!("invalid port '{raw}'"))?;
            }
            "--follow-up" => follow_up = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args { server, follow_up })
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CRADLE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("cradle={level},cradle_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    tracing::info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
        parse_errors = ?config.parse_errors,
        follow_up = args.follow_up,
        version = cradle::CRADLE_VERSION,
        "Configured relay"
    );

    let router = WorkerRouter::new().route("chat", EchoWorker::new().with_follow_up(args.follow_up));
    let service = Arc::new(RelayService::new(router, config));

    cradle::serve(args.server, service).await
}
