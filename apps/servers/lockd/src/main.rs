use anyhow::Result;
use clap::Parser;
use lock_server::LockServer;
use tracing_subscriber::EnvFilter;

/// Single-node ordered lock service.
#[derive(Debug, Parser)]
#[command(name = "lockd", about = "grants named resource locks in strict arrival order")]
struct Config {
	/// Address to bind.
	#[arg(long, env = "LOCKD_HOST", default_value = "0.0.0.0")]
	host: String,

	/// TCP port to listen on.
	#[arg(long, env = "LOCKD_PORT", default_value_t = lock_wire::DEFAULT_PORT)]
	port: u16,

	/// Log filter, e.g. `info` or `lock_core=debug`.
	#[arg(long, env = "RUST_LOG", default_value = "info")]
	rust_log: String,

	/// Emit logs as JSON.
	#[arg(long, env = "LOCKD_LOG_JSON", default_value_t = false)]
	log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	let config = Config::parse();
	init_tracing(&config);

	let server = LockServer::bind((config.host.as_str(), config.port)).await?;
	tracing::info!(addr = %server.local_addr()?, "lockd listening");

	let shutdown = server.shutdown_token();
	tokio::spawn(async move {
		tokio::signal::ctrl_c().await.ok();
		tracing::info!("received ctrl-c, shutting down");
		shutdown.cancel();
	});

	server.run().await?;
	tracing::info!("lockd stopped");
	Ok(())
}

fn init_tracing(config: &Config) {
	let filter = EnvFilter::new(&config.rust_log);
	if config.log_json {
		tracing_subscriber::fmt().with_env_filter(filter).json().init();
	} else {
		tracing_subscriber::fmt().with_env_filter(filter).init();
	}
}
