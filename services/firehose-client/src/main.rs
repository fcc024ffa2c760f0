// firehose-client: subscribe to the firehose, match rules, dispatch
// moderation actions.

use clap::Parser;
use fh_activity::{EventCache, EventRecorder, Outcome};
use fh_matcher::MatcherStore;
use firehose_client::config::{self, Config};
use firehose_client::controller::Controller;
use firehose_client::cursor::Cursor;
use firehose_client::datasource::Datasource;
use firehose_client::metrics::Metrics;
use firehose_client::moderation::action_router::{self, ActionRouter};
use firehose_client::moderation::auxiliary_data::AuxiliaryData;
use firehose_client::moderation::embed_checker::{self, EmbedChecker};
use firehose_client::moderation::list_manager::{self, ListManager};
use firehose_client::moderation::ozone::OzoneAdapter;
use firehose_client::moderation::report_agent::{self, AccountReport, ReportAgent, ReportContent};
use firehose_client::payload::PayloadDispatcher;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "firehose-client", version)]
struct Args {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

fn init_logging(config: &Config) -> Result<(), String> {
    let level = match config.logging.level.as_str() {
        // "critical" narrows to error, the closest native level.
        "critical" => "error",
        other => other,
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if config.logging.filename.is_empty() || config.logging.filename == "-" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.filename)
            .map_err(|e| format!("open log file '{}': {e}", config.logging.filename))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();
    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            return 1;
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("FATAL: {e}");
        return 1;
    }
    info!(version = env!("CARGO_PKG_VERSION"), "firehose-client starting");

    let metrics = match Metrics::register() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!(error = %e, "metrics registration failed");
            return 1;
        }
    };
    let controller = Controller::new();
    let cursor = Arc::new(Cursor::new());

    // Rule store: file-backed rules load now, DB rules arrive on the first
    // auxiliary refresh tick.
    let matcher = Arc::new(MatcherStore::new(config.filters.use_db));
    if !config.filters.use_db {
        let filename = config.filters.filename.clone().unwrap_or_default();
        if let Err(e) = matcher.load_filter_file(std::path::Path::new(&filename)) {
            error!(filename = %filename, error = %e, "cannot load filter file");
            return 1;
        }
    }

    // Queues between the subsystems.
    let (action_tx, action_rx) = mpsc::channel(action_router::QUEUE_LIMIT);
    let (report_tx, report_rx) = mpsc::channel(report_agent::QUEUE_LIMIT);
    let (list_tx, list_rx) = mpsc::channel(list_manager::QUEUE_LIMIT);
    let (embed_tx, embed_rx) = mpsc::channel(embed_checker::QUEUE_LIMIT);
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<Outcome>(64);

    // Moderation service view for dedupe.
    let moderation_url = match config.moderation_data.connection_url() {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "moderation DB configuration invalid");
            return 1;
        }
    };
    let ozone = match OzoneAdapter::connect(&moderation_url).await {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            error!(error = %e, "cannot reach moderation DB");
            return 1;
        }
    };
    let ozone_task = ozone.clone().start(controller.clone());

    // Embed analysis.
    let embed_checker = Arc::new(EmbedChecker::new(
        config.embed_checker.follow_links,
        matcher.clone(),
        metrics.clone(),
        report_tx.clone(),
        action_tx.clone(),
    ));
    let embed_tasks = embed_checker.clone().start(
        embed_rx,
        config.embed_checker.number_of_threads,
        controller.clone(),
    );

    // Auxiliary store: cursor + rule/host refresh.
    let auxiliary = match AuxiliaryData::connect(
        &config.auxiliary_data.connection_string,
        cursor.clone(),
        matcher.clone(),
        embed_checker.clone(),
        metrics.clone(),
    )
    .await
    {
        Ok(auxiliary) => auxiliary,
        Err(e) => {
            error!(error = %e, "cannot reach auxiliary DB");
            return 1;
        }
    };
    if config.datasource.rewind {
        match auxiliary.read_rewind_point().await {
            Ok(seq) => {
                info!(seq, "rewinding to persisted cursor");
                cursor.seed(seq);
            }
            Err(e) => error!(error = %e, "rewind point unavailable, starting live"),
        }
    }
    let auxiliary_task = auxiliary.start(controller.clone());

    // Activity recording, with escalations bridged to the report agent.
    let activity_metrics = Arc::new(metrics.activity.clone());
    let cache = EventCache::new(
        activity_metrics.clone(),
        Some(config.auto_reporter.service_did.clone()),
    );
    let (recorder, recorder_task) = EventRecorder::start(
        cache,
        activity_metrics,
        Some(outcome_tx),
        controller.subscribe(),
    );
    let outcome_report_tx = report_tx.clone();
    let outcome_task = tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                Outcome::BlocksModeration { did } => {
                    let _ = outcome_report_tx
                        .send(AccountReport {
                            did,
                            content: ReportContent::BlocksModeration,
                        })
                        .await;
                }
            }
        }
    });

    // Moderation emitters.
    let report_agent = match ReportAgent::new(config.auto_reporter.clone(), metrics.clone()) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "report agent init failed");
            return 1;
        }
    };
    let report_task = report_agent.start(report_rx, controller.clone());

    let list_manager = match ListManager::new(
        config.list_manager.clone(),
        matcher.clone(),
        ozone.clone(),
        metrics.clone(),
    ) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "list manager init failed");
            return 1;
        }
    };
    let list_task = list_manager.start(list_rx, controller.clone());

    let router = ActionRouter::new(
        matcher.clone(),
        ozone.clone(),
        metrics.clone(),
        report_tx.clone(),
        list_tx.clone(),
    );
    let router_task = router.start(action_rx, controller.clone());

    // Ingest.
    let dispatcher = PayloadDispatcher::new(
        matcher.clone(),
        recorder,
        action_tx.clone(),
        embed_tx.clone(),
        cursor.clone(),
        metrics.clone(),
    );
    let datasource = Datasource::new(
        config.datasource.hosts.clone(),
        config.datasource.port,
        config.datasource.subscription.clone(),
        dispatcher,
        cursor.clone(),
        metrics.clone(),
        controller.clone(),
    );

    let signal_controller = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining workers");
            signal_controller.stop();
        }
    });

    datasource.run().await;

    // Drop the producer ends so consumers drain and exit.
    drop(action_tx);
    drop(report_tx);
    drop(list_tx);
    drop(embed_tx);
    for task in [
        ozone_task,
        auxiliary_task,
        recorder_task,
        outcome_task,
        report_task,
        list_task,
        router_task,
    ] {
        let _ = task.await;
    }
    for task in embed_tasks {
        let _ = task.await;
    }

    if controller.has_failed() {
        error!("terminating after fatal error");
        1
    } else {
        info!("clean shutdown");
        0
    }
}
