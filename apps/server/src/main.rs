use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use tb_core::{
	config::AppConfig,
	init_tracing, Node,
};
use tokio::{net::TcpListener, signal};
use tracing::info;

mod error;
mod routes;

#[derive(Parser, Debug)]
#[command(name = "tb-server", about = "Task board server with a live change feed")]
struct Args {
	/// Where the config, database and logs live
	#[arg(long, env = "DATA_DIR")]
	data_dir: Option<PathBuf>,

	#[arg(long, env = "PORT", default_value_t = 8080)]
	port: u16,

	/// Overrides the level stored in the config
	#[arg(long, env = "LOG_LEVEL")]
	log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut config = match &args.data_dir {
		Some(dir) => AppConfig::load_from(dir)?,
		None => AppConfig::load()?,
	};
	if let Some(level) = args.log_level {
		config.log_level = level;
	}

	let _guard = init_tracing(&config.data_dir, &config.log_level)?;

	let node = Node::with_config(config).await?;
	let app = routes::router(node);

	let addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], args.port));
	let listener = TcpListener::bind(addr).await?;
	info!("Listening on http://localhost:{}", args.port);

	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			if signal::ctrl_c().await.is_ok() {
				info!("Shutting down");
			}
		})
		.await?;

	Ok(())
}
