use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use pet_timeledger::alarms::{AlarmScheduler, TokioAlarmTimer};
use pet_timeledger::companion::{Companion, Inbound, Outbound, fired_messages};
use pet_timeledger::config::{Settings, resolve_settings};
use pet_timeledger::domain::format_duration;
use pet_timeledger::ledger::DomainTimeLedger;
use pet_timeledger::storage::FileStore;

type FileCompanion = Companion<Arc<FileStore>, TokioAlarmTimer>;

#[derive(Debug, Parser)]
#[command(
	name = "pet-timeledger",
	version,
	about = "Per-domain browsing time and alarms for the desktop pet"
)]
struct Cli {
	/// JSON store file. Overrides PET_TIMELEDGER_STORE and config.toml.
	#[arg(long)]
	store: Option<PathBuf>,
	/// config.toml location. Overrides PET_TIMELEDGER_CONFIG.
	#[arg(long)]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Read JSON messages on stdin, write replies and notifications on stdout.
	Serve,
	Today,
	Week,
	Alarms,
	/// Set or replace a named alarm. A running `serve` keeps its own alarm
	/// list and will write it back over this one, so stop it first.
	AddAlarm {
		#[arg(long)]
		name: String,
		/// YYYY-MM-DD, local time.
		#[arg(long)]
		date: String,
		/// HH:MM, local time.
		#[arg(long)]
		time: String,
	},
	/// Remove a named alarm. Stop `serve` first, as for `add-alarm`.
	DeleteAlarm {
		#[arg(long)]
		name: String,
	},
	/// Forget all tracked time. Stop `serve` first, or its next event writes
	/// the old totals back.
	Clear,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "pet_timeledger=info".into()),
		)
		.with_writer(std::io::stderr)
		.init();

	if let Err(err) = run().await {
		eprintln!("error: {err:#}");
		std::process::exit(1);
	}
}

async fn run() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let settings = resolve_settings(cli.store, cli.config)?;
	let (mut companion, ticks, missed) = open_companion(&settings)?;

	match cli.command.unwrap_or(Command::Serve) {
		Command::Serve => serve(companion, ticks, missed).await?,
		Command::Today => {
			print_missed(&missed);
			print_today(&companion);
		}
		Command::Week => {
			print_missed(&missed);
			print_week(&companion);
		}
		Command::Alarms => {
			print_missed(&missed);
			print_alarms(&companion);
		}
		Command::AddAlarm { name, date, time } => {
			print_missed(&missed);
			let replies = companion.handle(Inbound::AddAlarm { name, date, time }, Utc::now());
			print_replies(&replies)?;
		}
		Command::DeleteAlarm { name } => {
			print_missed(&missed);
			let replies = companion.handle(Inbound::DeleteAlarm { name }, Utc::now());
			print_replies(&replies)?;
		}
		Command::Clear => {
			companion.handle(Inbound::ClearSaveData, Utc::now());
			println!("cleared saved time data in {}", settings.store_path.display());
		}
	}

	Ok(())
}

/// Opens the store and both services. The ledger reconciles against today
/// before anything else can touch it.
fn open_companion(
	settings: &Settings,
) -> anyhow::Result<(FileCompanion, tokio::sync::mpsc::UnboundedReceiver<()>, Vec<Outbound>)> {
	let store = FileStore::open(&settings.store_path)
		.with_context(|| format!("failed to open store {}", settings.store_path.display()))?;
	let store = Arc::new(store);
	info!(store = %store.path().display(), "store opened");

	let now = Utc::now();
	let ledger = DomainTimeLedger::open(Arc::clone(&store), settings.day_start_offset(), now);
	let (timer, ticks) = TokioAlarmTimer::channel();
	let (scheduler, fired) = AlarmScheduler::open(store, timer, now);

	Ok((Companion::new(ledger, scheduler), ticks, fired_messages(fired)))
}

async fn serve(
	mut companion: FileCompanion,
	mut ticks: tokio::sync::mpsc::UnboundedReceiver<()>,
	missed: Vec<Outbound>,
) -> anyhow::Result<()> {
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	let mut stdout = tokio::io::stdout();
	write_messages(&mut stdout, &missed).await?;
	info!("serving");

	loop {
		let replies = tokio::select! {
			line = lines.next_line() => match line.context("failed to read stdin")? {
				Some(line) => companion.handle_line(&line, Utc::now()),
				None => break,
			},
			Some(()) = ticks.recv() => companion.alarm_timer_elapsed(Utc::now()),
		};
		write_messages(&mut stdout, &replies).await?;
	}

	info!("stdin closed, shutting down");
	Ok(())
}

async fn write_messages(
	stdout: &mut tokio::io::Stdout,
	messages: &[Outbound],
) -> anyhow::Result<()> {
	for message in messages {
		let mut line = serde_json::to_vec(message)?;
		line.push(b'\n');
		stdout.write_all(&line).await?;
	}
	stdout.flush().await?;
	Ok(())
}

fn print_missed(missed: &[Outbound]) {
	for message in missed {
		if let Outbound::AlarmFired { name } = message {
			warn!(alarm = name.as_str(), "alarm came due while not running");
			println!("alarm due: {name}");
		}
	}
}

fn print_replies(replies: &[Outbound]) -> anyhow::Result<()> {
	for reply in replies {
		match reply {
			Outbound::AlarmFired { name } => println!("alarm due: {name}"),
			Outbound::Alarms { .. } => {}
			Outbound::Error { message } => anyhow::bail!("{message}"),
			other => println!("{}", serde_json::to_string(other)?),
		}
	}
	println!("ok");
	Ok(())
}

fn print_today(companion: &FileCompanion) {
	let totals = companion.ledger().total_time();
	if totals.is_empty() {
		println!("no time tracked today");
		return;
	}

	for (domain, seconds) in totals.sorted() {
		println!("{domain}: {}", format_duration(seconds));
	}
}

fn print_week(companion: &FileCompanion) {
	for (day, totals) in companion.ledger().total_time_each_day().iter() {
		println!("{}", day.name());
		if totals.is_empty() {
			println!("  (no activity)");
			continue;
		}
		for (domain, seconds) in totals.sorted() {
			println!("  {domain}: {}", format_duration(seconds));
		}
	}
}

fn print_alarms(companion: &FileCompanion) {
	let mut rows = companion
		.scheduler()
		.alarms()
		.iter()
		.map(|(name, at)| (at.with_timezone(&chrono::Local), name))
		.collect::<Vec<_>>();
	if rows.is_empty() {
		println!("no alarms set");
		return;
	}

	rows.sort();
	for (at, name) in rows {
		println!("{} | {name}", at.format("%Y-%m-%d %H:%M"));
	}
}
