// ORR bus arrivals server
// Serves live-or-scheduled arrivals per stop plus the static timetable files,
// or regenerates those files from GTFS with `generate-timetables`.

use actix_files as fs;
use actix_web::{App, HttpServer, middleware, web};
use anyhow::{Context, Result};
use clap::Parser;
use std::ffi::OsStr;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use orr_arrivals::config::{Cli, Commands, Config, GenerateArgs};
use orr_arrivals::server::{self, AppState};
use orr_arrivals::timetable_gen;

/// Colored stderr logging, plus a daily JSON log file when `LOG_FILE_PATH` is set.
fn init_logging() -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let (json_layer, guard) = match std::env::var("LOG_FILE_PATH") {
        Ok(log_file_path) => {
            let path = Path::new(&log_file_path);
            let log_dir = path.parent().unwrap_or(Path::new("logs"));
            let log_file_name = path.file_name().unwrap_or(OsStr::new("orr-arrivals.log"));

            let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(non_blocking_file)
                .with_filter(EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")));

            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

async fn run_server(config: Config) -> Result<()> {
    let app_state = AppState::new(config.reconciler().context("Failed to build data sources")?);
    let timetable_dir = config.timetable_dir.clone();

    info!(bind = %config.bind, "Server starting");
    info!(
        timetable_dir = %config.timetable_dir,
        timetable_origin = config.timetable_origin.as_deref().unwrap_or("-"),
        ttl_secs = config.timetable_ttl_secs,
        "Static timetables"
    );
    match &config.live_feed_url {
        Some(url) => info!(
            url = %url,
            timeout_secs = config.live_timeout_secs,
            retries = config.live_retries,
            window_mins = config.live_window_mins,
            "Live feed enabled"
        ),
        None => info!("No LIVE_FEED_URL configured, serving static timetables only"),
    }

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(server::configure)
            .service(fs::Files::new("/timetables", &timetable_dir))
    })
    .bind(config.bind.as_str())
    .with_context(|| format!("Failed to bind {}", config.bind))?
    .run()
    .await?;

    Ok(())
}

fn generate_timetables(args: &GenerateArgs) -> Result<()> {
    info!(
        gtfs = %args.gtfs.display(),
        stops = %args.stops.display(),
        output = %args.output.display(),
        "Generating timetables"
    );

    let report = timetable_gen::run(args).context("Timetable generation failed")?;
    info!(
        stops = report.stops,
        timetables = report.timetables_written,
        trips = report.trips_written,
        "Timetable generation complete"
    );
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateTimetables(args)) => generate_timetables(&args),
        None => actix_web::rt::System::new().block_on(run_server(cli.server)),
    }
}
