#![recursion_limit = "1024"]
//! Silo CLI, used to interact with a running Silo cluster, and to launch
//! the Silo daemons

#[macro_use]
extern crate tracing;

mod cli;
mod server;

use std::path::PathBuf;

use structopt::StructOpt;

use cli::*;

#[derive(StructOpt, Debug)]
#[structopt(
	name = "silo",
	about = "Minimalist distributed block file system"
)]
struct Opt {
	/// Path to configuration file
	#[structopt(
		short = "c",
		long = "config",
		env = "SILO_CONFIG_FILE",
		default_value = "/etc/silo.toml"
	)]
	pub config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Command,
}

#[tokio::main]
async fn main() {
	let opt = Opt::from_args();

	// Initialize logging as well as other libraries used in Silo
	if std::env::var("RUST_LOG").is_err() {
		let default_log = match &opt.cmd {
			Command::Server => "info",
			_ => "warn",
		};
		std::env::set_var("RUST_LOG", default_log)
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();
	sodiumoxide::init().expect("Unable to init sodiumoxide");

	let res = match opt.cmd {
		Command::Server => server::run_server(opt.config_file).await,
		cmd => cli_command(opt.config_file, cmd).await,
	};

	if let Err(e) = res {
		error!("{}", e);
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}
