//! Headless front end for the bag timeline engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bt_core::events::events::{TaskOutcome, TaskProgress};
use bt_core::events::{downcast, handler_from_fn};
use bt_core::{TimeRange, Timestamp};
use bt_data::{
    ChannelListener, DataError, EngineConfig, ExportRequest, TimelineEngine, TopicFilter,
};

/// Bag timeline - merge, play back and export recorded message logs
#[derive(Parser, Debug)]
#[command(name = "bagtimeline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print time ranges, topics and message counts
    Info {
        #[arg(required = true, value_name = "BAG")]
        bags: Vec<PathBuf>,
    },

    /// Copy messages from the merged timeline into a new bag
    Export {
        #[arg(required = true, value_name = "BAG")]
        bags: Vec<PathBuf>,

        /// Destination; `.db3`, `.sqlite` and `.db` write SQLite, anything else CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Only export these topics (repeatable)
        #[arg(long = "topic", value_name = "TOPIC")]
        topics: Vec<String>,

        /// First timestamp to export, in nanoseconds
        #[arg(long)]
        start: Option<i64>,

        /// Last timestamp to export, in nanoseconds
        #[arg(long)]
        end: Option<i64>,
    },

    /// Play the merged timeline and print the messages delivered
    Play {
        #[arg(required = true, value_name = "BAG")]
        bags: Vec<PathBuf>,

        /// Topics to listen to (repeatable); defaults to every topic
        #[arg(long = "topic", value_name = "TOPIC")]
        topics: Vec<String>,

        /// Playback speed, negative plays backwards
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        speed: f64,

        /// Step from message to message instead of playing at a fixed rate
        #[arg(long)]
        locked: bool,

        /// Stop at the end of the timeline instead of wrapping
        #[arg(long)]
        no_wrap: bool,

        /// Seconds of wall-clock time to play for
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;
    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }
    result
}

/// `RUST_LOG` when it parses, `warn` otherwise
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let engine = TimelineEngine::new(config, Handle::current())?;

    let result = match args.command {
        Command::Info { bags } => {
            open_bags(&engine, &bags).await?;
            print_info(&engine);
            Ok(())
        }
        Command::Export {
            bags,
            output,
            topics,
            start,
            end,
        } => {
            open_bags(&engine, &bags).await?;
            export(&engine, output, topics, start, end).await
        }
        Command::Play {
            bags,
            topics,
            speed,
            locked,
            no_wrap,
            duration,
        } => {
            open_bags(&engine, &bags).await?;
            play(&engine, topics, speed, locked, !no_wrap, duration).await
        }
    };

    engine.close();
    result
}

async fn open_bags(engine: &TimelineEngine, bags: &[PathBuf]) -> Result<()> {
    for bag in bags {
        let update = engine
            .open_source(bag)
            .await
            .with_context(|| format!("opening {}", bag.display()))?;
        info!(bag = %update.name, messages = update.message_count, "opened");
    }
    Ok(())
}

fn format_stamp(stamp: Timestamp) -> String {
    match stamp.to_datetime() {
        Some(datetime) => format!(
            "{} ({})",
            datetime.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            stamp
        ),
        None => stamp.to_string(),
    }
}

fn format_range(range: Option<TimeRange>) -> String {
    match range {
        Some(range) => format!(
            "{} .. {}  [{:.3}s]",
            format_stamp(range.start),
            format_stamp(range.end),
            range.span_nanos() as f64 / 1e9
        ),
        None => "empty".to_string(),
    }
}

fn print_info(engine: &TimelineEngine) {
    let catalog = engine.catalog();

    for (idx, source) in catalog.sources().iter().enumerate() {
        println!("source #{}: {}", idx, source.path().display());
        println!("  range:    {}", format_range(source.time_range()));
        println!("  messages: {}", source.message_count());
    }

    println!("merged:");
    println!("  range:    {}", format_range(catalog.bounds()));
    println!("  messages: {}", catalog.message_count());
    println!("topics:");

    for topic in catalog.topics() {
        let datatype = match catalog.datatype(&topic) {
            Ok(Some(datatype)) => datatype,
            Ok(None) => "-".to_string(),
            Err(DataError::DatatypeConflict { datatypes, .. }) => {
                format!("CONFLICT ({})", datatypes.join(" | "))
            }
            Err(e) => format!("error: {}", e),
        };
        let count = catalog
            .entries(TopicFilter::only([topic.as_str()]), Timestamp::MIN, None)
            .count();
        println!("  {:<32} {:<40} {:>8}", topic, datatype, count);
    }
}

async fn export(
    engine: &TimelineEngine,
    output: PathBuf,
    topics: Vec<String>,
    start: Option<i64>,
    end: Option<i64>,
) -> Result<()> {
    let Some(bounds) = engine.catalog().bounds() else {
        bail!("the loaded bags contain no messages");
    };
    let range = TimeRange::new(
        start.map(Timestamp::from_nanos).unwrap_or(bounds.start),
        end.map(Timestamp::from_nanos).unwrap_or(bounds.end),
    );
    let topics = if topics.is_empty() {
        TopicFilter::All
    } else {
        TopicFilter::only(topics)
    };

    engine
        .events()
        .subscribe::<TaskProgress>(handler_from_fn(|event| {
            if let Some(progress) = downcast::<TaskProgress>(event) {
                eprint!("\r{}: {:>3}%", progress.label, progress.percent);
            }
        }));

    let handle = engine.start_export(ExportRequest {
        destination: output.clone(),
        topics,
        range,
    })?;

    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling export");
            cancel.cancel();
        }
    });

    let report = handle.wait().await?;
    interrupt.abort();
    eprintln!();

    match report.outcome {
        TaskOutcome::Completed { written } => {
            println!("wrote {} messages to {}", written, output.display());
            Ok(())
        }
        TaskOutcome::Cancelled { written } => {
            println!("cancelled after {} of {} messages", written, report.total);
            Ok(())
        }
        TaskOutcome::Failed { written, error } => {
            bail!("export failed after {} messages: {}", written, error)
        }
    }
}

async fn play(
    engine: &TimelineEngine,
    topics: Vec<String>,
    speed: f64,
    locked: bool,
    wrap: bool,
    duration: f64,
) -> Result<()> {
    let topics = if topics.is_empty() {
        engine.catalog().topics()
    } else {
        topics
    };
    if topics.is_empty() {
        bail!("the loaded bags contain no topics");
    }

    let playback = engine.playback();
    playback.set_wrap(wrap);
    playback.set_play_all(locked);
    let speed = playback.set_speed(speed);
    info!(speed, locked, wrap, "starting playback");

    let (listener, mut messages) = ChannelListener::new();
    let ids: Vec<_> = topics
        .iter()
        .map(|topic| (topic.clone(), engine.add_listener(topic, listener.clone())))
        .collect();
    drop(listener);

    engine.start_scheduler();

    let stop_after = tokio::time::sleep(Duration::from_secs_f64(duration.max(0.0)));
    tokio::pin!(stop_after);

    loop {
        tokio::select! {
            _ = &mut stop_after => break,
            _ = tokio::signal::ctrl_c() => break,
            message = messages.recv() => {
                let Some(message) = message else { break };
                let preview = String::from_utf8_lossy(&message.payload[..message.payload.len().min(48)]).into_owned();
                println!(
                    "{}  {:<24} {:<24} {:>6}B  {}",
                    message.stamp,
                    message.topic,
                    message.datatype.as_deref().unwrap_or("-"),
                    message.payload.len(),
                    preview.escape_debug()
                );
            }
        }
    }

    engine.stop_scheduler();
    for (topic, id) in ids {
        engine.remove_listener(&topic, id);
    }
    if let Some(playhead) = playback.playhead() {
        println!("stopped at {}", format_stamp(playhead));
    }
    Ok(())
}
