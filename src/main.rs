use std::{path::Path, process::ExitCode, sync::Arc};

use clap::Parser;

use perfmon::{
    config::PerfConfig,
    lifecycle::ComposeLifecycle,
    metrics::MetricsAggregator,
    monitor::{self, DockerEventSource, DockerHealthInspector},
    orchestrator::TestOrchestrator,
};

mod cli;

fn analyze(config: &PerfConfig, snapshot: &Path) -> ExitCode {
    let mut aggregator = MetricsAggregator::new(config.output_dir.clone(), config.thresholds.clone());
    if let Err(e) = aggregator.load_snapshot(snapshot) {
        log::error!("Unable to load snapshot {snapshot:?}: {e}");
        return ExitCode::FAILURE;
    }
    println!("{}", aggregator.generate_report());
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::Args::parse();
    let mut config = match PerfConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) if args.analyze.is_some() => {
            log::warn!("Unable to load {:?} ({e}), using defaults", args.config);
            match PerfConfig::try_init_from_string("") {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Invalid default config: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        Err(e) => {
            log::error!("Unable to load {:?}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    if let Some(snapshot) = &args.analyze {
        return analyze(&config, snapshot);
    }

    let docker = match monitor::docker::connect() {
        Ok(docker) => docker,
        Err(e) => {
            log::error!("Unable to connect to docker: {e}");
            return ExitCode::FAILURE;
        }
    };
    let lifecycle = Arc::new(ComposeLifecycle::from_config(&config));
    let mut orchestrator = TestOrchestrator::new(
        config,
        lifecycle,
        Arc::new(DockerEventSource::default()),
        Arc::new(DockerHealthInspector::new(docker)),
    );

    let filter = (!args.environments.is_empty()).then_some(args.environments.as_slice());
    let combined = tokio::select! {
        combined = orchestrator.run_all_environments_test(filter) => Some(combined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(combined) = combined else {
        log::warn!("Interrupted");
        orchestrator.abort().await;
        return ExitCode::FAILURE;
    };

    if let Err(e) = orchestrator.aggregator().save_snapshot(None) {
        log::error!("Unable to save metrics snapshot: {e}");
    }
    if let Err(e) = orchestrator.save_results(&combined, args.output.as_deref()) {
        log::error!("Unable to save results: {e}");
    }
    if args.save_baseline {
        match orchestrator.aggregator_mut().save_baseline() {
            Ok(path) => log::info!("Baseline saved to {path:?}"),
            Err(e) => log::error!("Unable to save baseline: {e}"),
        }
    }

    println!("{}", orchestrator.generate_performance_report());

    if combined.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
