use capsync::net::api_types::{PhotoBatch, VehicleDetails};
use capsync::queue::{DrainOutcome, DrainReport};
use capsync::sync::{SyncEvent, SyncWorker};
use capsync::{logging, Config, ResilientClient, SubmitOutcome};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "capsync")]
#[command(about = "Offline-first sync client for vehicle photo capture")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/capsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Log in; the password is read from CAPSYNC_PASSWORD
  Login {
    #[arg(short, long)]
    username: Option<String>,
  },
  /// Forget the stored session
  Logout,
  /// Fetch a path through the cache and print the body
  Get { path: String },
  /// Queue a photo batch and try to deliver it
  Submit {
    /// Photo as CATEGORY=FILE, e.g. exterior_front=front.jpg (repeatable)
    #[arg(short, long = "photo", value_parser = parse_photo, required = true)]
    photos: Vec<(String, PathBuf)>,
    #[arg(long)]
    vin: Option<String>,
    #[arg(long)]
    make: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    auction_id: Option<String>,
    #[arg(long)]
    asking_price: Option<f64>,
    #[arg(long)]
    notes: Option<String>,
  },
  /// Show pending submissions and the last delivery error
  Status,
  /// Deliver pending submissions now
  Retry,
  /// Precache a cache version without activating it
  Install { version: Option<String> },
  /// Make a cache version current and delete older ones
  Activate { version: Option<String> },
  /// Keep draining the queue on reconnect and on a timer until Ctrl-C
  Watch,
}

fn parse_photo(s: &str) -> std::result::Result<(String, PathBuf), String> {
  match s.split_once('=') {
    Some((category, path)) if !category.is_empty() && !path.is_empty() => {
      Ok((category.to_string(), PathBuf::from(path)))
    }
    _ => Err(format!("expected CATEGORY=FILE, got '{}'", s)),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let client = ResilientClient::new(&config)?;
  let result = run(&client, &config, args.command).await;
  client.settle().await;
  result
}

async fn run(client: &ResilientClient, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Login { username } => {
      let username = username
        .or_else(|| config.api.username.clone())
        .ok_or_else(|| eyre!("No username given and api.username is not configured"))?;
      let password = Config::get_password()?;
      client.login(&username, &password).await?;
      println!("Logged in as {}", username);
    }
    Command::Logout => {
      client.logout().await;
      println!("Logged out");
    }
    Command::Get { path } => {
      let result = client.get(&path).await?;
      eprintln!(
        "HTTP {} ({:?}{})",
        result.data.status,
        result.source,
        result
          .cached_at
          .map(|at| format!(", cached {}", at.to_rfc3339()))
          .unwrap_or_default()
      );
      std::io::stdout().write_all(&result.data.body)?;
      println!();
    }
    Command::Submit {
      photos,
      vin,
      make,
      model,
      year,
      auction_id,
      asking_price,
      notes,
    } => {
      let mut batch = PhotoBatch::new(VehicleDetails {
        vin,
        make,
        model,
        year,
        auction_id,
        asking_price,
        notes,
      });
      for (category, path) in &photos {
        batch.add_file(path, category)?;
      }
      match client.submit(&batch).await? {
        SubmitOutcome::Delivered { id, receipt } => match receipt {
          Some(receipt) => println!("Delivered {} (task {}, {})", id, receipt.task_id, receipt.status),
          None => println!("Delivered {}", id),
        },
        SubmitOutcome::Queued {
          id,
          blocked_by: Some(error),
        } => {
          println!("Queued {}; {}. Run `capsync login` to send it", id, error)
        }
        SubmitOutcome::Queued { id, blocked_by: None } => {
          println!("Queued {}; it will be sent when the connection recovers", id)
        }
      }
    }
    Command::Status => {
      let status = client.queue_status();
      println!("Pending submissions: {}", status.pending);
      if let Some(oldest) = status.oldest {
        println!("Oldest queued at:    {}", oldest.to_rfc3339());
      }
      if let Some(error) = status.last_error {
        println!("Last error:          {}", error);
      }
      println!(
        "Signed in:           {}",
        if client.is_authenticated() { "yes" } else { "no" }
      );
      println!(
        "Cache version:       {}",
        client.active_cache_version().unwrap_or_else(|| "none".into())
      );
    }
    Command::Retry => {
      let report = client.retry_now().await?;
      print_report(&report);
    }
    Command::Install { version } => {
      let version = version.unwrap_or_else(|| client.cache_version().to_string());
      let stored = client.install(&version).await?;
      println!("Installed cache {} ({} precached)", version, stored);
    }
    Command::Activate { version } => {
      let version = version.unwrap_or_else(|| client.cache_version().to_string());
      let activation = client.activate(&version);
      println!(
        "Activated cache {} (removed {} old namespaces)",
        activation.version,
        activation.deleted.len()
      );
    }
    Command::Watch => watch(client, config).await?,
  }
  Ok(())
}

async fn watch(client: &ResilientClient, config: &Config) -> Result<()> {
  if let Err(e) = client.ensure_cache_version().await {
    warn!(error = %e, "cache install failed, continuing with the current version");
  }

  let (handle, mut events) = SyncWorker::spawn(client.queue().clone(), config.sync.interval());
  let monitor = client
    .connectivity_monitor(config.sync.probe_period())
    .spawn(handle.sender());
  println!("Watching; {} submissions pending. Ctrl-C to stop.", client.queue_status().pending);

  loop {
    tokio::select! {
      event = events.recv() => match event {
        Some(SyncEvent::Drained { trigger, report }) => {
          print!("[{:?}] ", trigger);
          print_report(&report);
        }
        Some(SyncEvent::Failed { trigger, error }) => {
          eprintln!("[{:?}] {}; run `capsync login` to resume", trigger, error);
        }
        None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  monitor.abort();
  handle.shutdown().await;
  Ok(())
}

fn print_report(report: &DrainReport) {
  for delivered in &report.delivered {
    match &delivered.receipt {
      Some(receipt) => println!("delivered {} (task {})", delivered.id, receipt.task_id),
      None => println!("delivered {}", delivered.id),
    }
  }
  for (id, error) in &report.rejected {
    println!("rejected {}: {}", id, error);
  }
  for evicted in &report.evicted {
    println!("evicted {}: {}", evicted.id, evicted.reason);
  }
  match &report.outcome {
    DrainOutcome::Completed => println!("{} pending", report.remaining),
    DrainOutcome::Stopped(error) => println!("stopped: {} ({} pending)", error, report.remaining),
    DrainOutcome::AlreadyDraining => println!("a drain is already running"),
  }
}
