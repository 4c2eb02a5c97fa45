use std::time::Duration;

use dltview_report::{ConversionRegistry, DataSet, ReportAggregator, SeriesKind};
use dltview_session::{
    Connected, ConnectionStatus, FileAddress, Session, SessionConfig, SessionEvent,
    SessionOptions, connect,
};
use dltview_types::{Filter, FilterKind, SortMode, StreamId};
use facet::Facet;
use figue as args;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type AnyResult<T> = Result<T, String>;

const DEFAULT_ENGINE_URL: &str = "ws://127.0.0.1:6665";
/// A page is printed once no record arrived for this long.
const SETTLE_DELAY: Duration = Duration::from_millis(300);

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Websocket address of the log engine.
    #[facet(args::named, default)]
    engine: Option<String>,
    #[facet(args::named, default)]
    page_size: Option<u32>,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    /// Open a recording and print one window of records.
    Tail {
        #[facet(args::named)]
        file: String,
        #[facet(args::named, default)]
        payload: Option<String>,
        #[facet(args::named, default)]
        apid: Option<String>,
        #[facet(args::named, default)]
        ctid: Option<String>,
        #[facet(args::named, default)]
        sort_by_time: bool,
        /// Start the window at this filtered index.
        #[facet(args::named, default)]
        skip: Option<u32>,
        /// Start the window around the first record at or after this time (ms).
        #[facet(args::named, default)]
        at_time: Option<u64>,
        /// Keep printing updates until interrupted.
        #[facet(args::named, default)]
        follow: bool,
    },
    /// Run a report over a recording and print its series.
    Report {
        #[facet(args::named)]
        file: String,
        /// Regex whose captures become series.
        #[facet(args::named)]
        pattern: String,
        #[facet(args::named, default)]
        apid: Option<String>,
        #[facet(args::named, default)]
        ctid: Option<String>,
    },
}

struct Config {
    engine_url: String,
    session: SessionConfig,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config_from_cli(&cli);
    let Connected {
        conn,
        events,
        transport,
    } = connect(&cfg.engine_url, &cfg.session).await?;
    if let ConnectionStatus::VersionMismatch { .. } = conn.status() {
        transport.shutdown();
        return Err(format!("{}: {}", cfg.engine_url, conn.status()));
    }

    let result = match cli.command {
        CommandKind::Tail {
            file,
            payload,
            apid,
            ctid,
            sort_by_time,
            skip,
            at_time,
            follow,
        } => {
            let mut filter = Filter::new(FilterKind::Positive);
            filter.payload_regex = payload;
            filter.apid = apid;
            filter.ctid = ctid;
            let options = SessionOptions {
                files: FileAddress::parse_local(&file).files(),
                sort: sort_by_time.then_some(SortMode::ByTime),
                filters: vec![filter],
                ..SessionOptions::default()
            };
            let session = Session::new(conn.clone(), cfg.session.clone(), options);
            let outcome = tail(&session, events, skip, at_time, follow).await;
            close(&session).await;
            outcome
        }
        CommandKind::Report {
            file,
            pattern,
            apid,
            ctid,
        } => {
            let mut filter = Filter::report(pattern);
            filter.apid = apid;
            filter.ctid = ctid;
            let options = SessionOptions {
                files: FileAddress::parse_local(&file).files(),
                ..SessionOptions::default()
            };
            let session = Session::new(conn.clone(), cfg.session.clone(), options);
            let outcome = report(&session, filter).await;
            close(&session).await;
            outcome
        }
    };
    transport.shutdown();
    result
}

async fn close(session: &Session) {
    if let Err(e) = session.close().await {
        warn!(%e, "closing the recording failed");
    }
}

async fn tail(
    session: &Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    skip: Option<u32>,
    at_time: Option<u64>,
    follow: bool,
) -> AnyResult<()> {
    let stream_id = session
        .open()
        .await
        .map_err(|e| format!("failed to open recording: {e}"))?;
    info!(%stream_id, window = %session.window(), "recording opened");

    if let Some(time_ms) = at_time {
        match session
            .search_time(time_ms)
            .await
            .map_err(|e| format!("time search failed: {e}"))?
        {
            Some(index) => {
                session
                    .reveal_index(index)
                    .await
                    .map_err(|e| format!("failed to move window to {index}: {e}"))?;
            }
            None => println!("no record at or after {time_ms} ms"),
        }
    } else if let Some(skip) = skip {
        session
            .change_window(skip)
            .await
            .map_err(|e| format!("failed to move window to {skip}: {e}"))?;
    }

    let page_size = session.config().page_size as usize;
    // records arrived since the page was last printed
    let mut unprinted = false;
    loop {
        let settled = tokio::time::sleep(SETTLE_DELAY);
        let event = tokio::select! {
            event = events.recv() => event,
            _ = settled, if unprinted => {
                print_page(session);
                unprinted = false;
                if follow {
                    continue;
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else {
            if unprinted {
                print_page(session);
            }
            break;
        };
        debug!(?event, "session event");
        match event {
            SessionEvent::StreamAborted { stream_id, reason } => {
                return Err(format!("stream {stream_id} aborted: {reason}"));
            }
            SessionEvent::Warning(message) => eprintln!("warning: {message}"),
            event => match tail_step(&event, session.active_stream(), page_size) {
                TailStep::Ignore => {}
                TailStep::Defer => unprinted = true,
                TailStep::Print => {
                    print_page(session);
                    unprinted = false;
                    if !follow {
                        break;
                    }
                }
                TailStep::NoRecords => {
                    println!("no matching records");
                    if !follow {
                        break;
                    }
                }
            },
        }
    }
    Ok(())
}

/// How `tail` reacts to one event of the primary stream.
#[derive(Debug, PartialEq, Eq)]
enum TailStep {
    Ignore,
    /// Records arrived; print once the page settles.
    Defer,
    Print,
    NoRecords,
}

fn tail_step(event: &SessionEvent, active: Option<StreamId>, page_size: usize) -> TailStep {
    match event {
        SessionEvent::RecordsAdded {
            stream_id, visible, ..
        } if Some(*stream_id) == active => {
            if *visible >= page_size {
                TailStep::Print
            } else {
                TailStep::Defer
            }
        }
        SessionEvent::StreamDone { stream_id } if Some(*stream_id) == active => TailStep::Print,
        SessionEvent::EmptyResult { stream_id } if Some(*stream_id) == active => {
            TailStep::NoRecords
        }
        _ => TailStep::Ignore,
    }
}

fn print_page(session: &Session) {
    let window = session.window();
    let records = session.visible_records();
    let total = session
        .connection()
        .metadata()
        .file_msgs
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_owned());
    println!("-- records {window} ({} shown, {total} in file) --", records.len());
    for record in records {
        println!("{record}");
    }
}

async fn report(session: &Session, filter: Filter) -> AnyResult<()> {
    session
        .open()
        .await
        .map_err(|e| format!("failed to open recording: {e}"))?;
    let aggregator = ReportAggregator::new(ConversionRegistry::new());
    let mut revision = aggregator.subscribe();
    let Some(stream_id) = aggregator
        .attach(session, vec![filter])
        .await
        .map_err(|e| format!("failed to start report: {e}"))?
    else {
        return Err("report filter set is already running".to_owned());
    };
    info!(%stream_id, "report stream started");

    while aggregator.finished_streams() == 0 {
        tokio::select! {
            changed = revision.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                debug!(records = aggregator.records_processed(), "report running");
            }
        }
    }

    println!(
        "{} records processed, {} series",
        aggregator.records_processed(),
        aggregator.dataset_count()
    );
    for dataset in aggregator.datasets() {
        println!("{}", summarize(&dataset));
    }
    for warning in aggregator.warnings() {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn summarize(dataset: &DataSet) -> String {
    let detail = match dataset.kind {
        SeriesKind::Numeric => match (dataset.min, dataset.max) {
            (Some(min), Some(max)) => format!("min {min}, max {max}"),
            _ => "no values".to_owned(),
        },
        SeriesKind::State | SeriesKind::Timeline => {
            format!("values [{}]", dataset.value_labels.join(", "))
        }
    };
    format!(
        "{} ({:?}): {} points, {detail}",
        dataset.name,
        dataset.kind,
        dataset.point_count()
    )
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("dltview")
                .description("Windowed views and reports over engine-indexed log recordings")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn config_from_cli(cli: &Cli) -> Config {
    let engine_url = cli
        .engine
        .clone()
        .or_else(|| std::env::var("DLTVIEW_ENGINE").ok())
        .unwrap_or_else(|| DEFAULT_ENGINE_URL.to_owned());

    let mut session = SessionConfig::from_env();
    if let Some(page_size) = cli.page_size {
        session.page_size = page_size;
        session = session.validated();
    }

    Config {
        engine_url,
        session,
    }
}
