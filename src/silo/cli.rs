use std::path::PathBuf;

use structopt::StructOpt;

use silo_client::SiloClient;

use silo_rpc::control::*;

use silo_util::config::read_config;
use silo_util::error::*;
use silo_util::formater::format_table;
use silo_util::time::now_msec;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Run the Silo daemon (metadata or storage role, from the
	/// configuration file)
	#[structopt(name = "server")]
	Server,

	/// Upload a local file into the namespace
	#[structopt(name = "put")]
	Put(PutOpt),

	/// Download a file from the namespace
	#[structopt(name = "get")]
	Get(GetOpt),

	/// List the entries of a directory
	#[structopt(name = "ls")]
	Ls(PathOpt),

	/// Create a directory
	#[structopt(name = "mkdir")]
	Mkdir(PathOpt),

	/// Remove a directory
	#[structopt(name = "rmdir")]
	Rmdir(RmdirOpt),

	/// Remove a file
	#[structopt(name = "rm")]
	Rm(PathOpt),

	/// Show a file's blocks and replica locations
	#[structopt(name = "info")]
	Info(PathOpt),

	/// Show cluster health: storage nodes and degraded blocks
	#[structopt(name = "status")]
	Status,
}

#[derive(StructOpt, Debug)]
pub struct PutOpt {
	/// Local file to upload
	pub local: PathBuf,
	/// Destination path in the namespace
	pub remote: String,
}

#[derive(StructOpt, Debug)]
pub struct GetOpt {
	/// Path in the namespace
	pub remote: String,
	/// Local destination file
	pub local: PathBuf,
}

#[derive(StructOpt, Debug)]
pub struct PathOpt {
	/// Path in the namespace
	pub path: String,
}

#[derive(StructOpt, Debug)]
pub struct RmdirOpt {
	/// Path in the namespace
	pub path: String,
	/// Also remove every file and directory below
	#[structopt(long = "recursive")]
	pub recursive: bool,
}

pub async fn cli_command(config_file: PathBuf, cmd: Command) -> Result<(), Error> {
	let config = read_config(config_file.clone()).err_context(format!(
		"Unable to read configuration file {}",
		config_file.to_string_lossy()
	))?;
	let client = SiloClient::new(&config)?;

	match cmd {
		Command::Put(opt) => {
			let f = client.put(&opt.local, &opt.remote).await?;
			println!("{}\t{} bytes\t{} block(s)", f.path, f.size, f.blocks.len());
			Ok(())
		}
		Command::Get(opt) => {
			let n = client.get(&opt.remote, &opt.local).await?;
			println!("{} bytes written to {}", n, opt.local.display());
			Ok(())
		}
		Command::Ls(opt) => {
			let listing = client.ls(&opt.path).await?;
			print_listing(&listing);
			Ok(())
		}
		Command::Mkdir(opt) => {
			let d = client.mkdir(&opt.path).await?;
			println!("{}", d.path);
			Ok(())
		}
		Command::Rmdir(opt) => client.rmdir(&opt.path, opt.recursive).await,
		Command::Rm(opt) => client.rm(&opt.path).await,
		Command::Info(opt) => {
			let (file, blocks) = client.info(&opt.path).await?;
			print_file_info(&file, &blocks);
			Ok(())
		}
		Command::Status => {
			let summary = client.status().await?;
			print_status(&summary);
			Ok(())
		}
		Command::Server => unreachable!(),
	}
}

fn short_id(hex_id: &str) -> &str {
	&hex_id[..std::cmp::min(16, hex_id.len())]
}

fn print_listing(listing: &DirListing) {
	let mut table = vec![];
	for entry in listing.entries.iter() {
		match entry.kind {
			EntryKind::Directory => table.push(format!("\tdir\t\t{}/", entry.name)),
			EntryKind::File => table.push(format!(
				"\tfile\t{}\t{}",
				entry.size.unwrap_or(0),
				entry.name
			)),
		}
	}
	if table.is_empty() {
		println!("{} is empty", listing.directory.path);
	} else {
		format_table(table);
	}
}

fn print_file_info(file: &FileRecord, blocks: &[BlockRecord]) {
	println!("Path: {}", file.path);
	println!("Id: {}", file.id);
	println!("Owner: {}", file.owner);
	println!(
		"Size: {} ({})",
		file.size,
		bytesize::ByteSize::b(file.size).to_string_as(true)
	);
	println!("Status: {:?}", file.status);
	println!("\nBlocks:");
	let mut table = vec![];
	for b in blocks.iter() {
		let locations = b
			.locations
			.iter()
			.map(|l| {
				let mut flags = String::new();
				if l.is_leader {
					flags.push('L');
				}
				if l.suspect {
					flags.push('?');
				}
				format!("{}{}", short_id(&l.node.id), flags)
			})
			.collect::<Vec<_>>()
			.join(",");
		table.push(format!(
			"\t{}\t{}\t{}\t{}",
			b.seq,
			short_id(&b.id),
			b.size,
			locations
		));
	}
	format_table(table);
}

fn print_status(summary: &StatusSummary) {
	println!(
		"Metadata leader: {} (term {})",
		if summary.leader_id.is_empty() {
			"unknown"
		} else {
			short_id(&summary.leader_id)
		},
		summary.term
	);
	println!(
		"{} file(s), {} block(s), {} under-replicated",
		summary.files, summary.blocks, summary.under_replicated
	);

	println!("\nStorage nodes:");
	let now = now_msec();
	let mut table = vec![];
	for n in summary.nodes.iter() {
		let last_seen = if n.last_heartbeat_msec > 0 && now >= n.last_heartbeat_msec {
			let ago = std::time::Duration::from_millis(now - n.last_heartbeat_msec);
			timeago::Formatter::new().convert(ago)
		} else {
			"never".to_string()
		};
		table.push(format!(
			"\t{}\t{}:{}\t{}\t{} free of {}\t{} block(s)\t{}",
			short_id(&n.id),
			n.hostname,
			n.rpc_port,
			n.status,
			bytesize::ByteSize::b(n.available_space).to_string_as(true),
			bytesize::ByteSize::b(n.storage_capacity).to_string_as(true),
			n.blocks_stored,
			last_seen,
		));
	}
	format_table(table);

	if !summary.degraded.is_empty() {
		println!("\nDegraded blocks (re-replication failing):");
		for b in summary.degraded.iter() {
			println!("\t{}", b);
		}
	}
	if !summary.fatal.is_empty() {
		println!("\nFATAL: blocks with no healthy replica:");
		for b in summary.fatal.iter() {
			println!("\t{}", b);
		}
	}
	if summary.degraded.is_empty() && summary.fatal.is_empty() {
		println!("\nNo degraded blocks.");
	}
}
