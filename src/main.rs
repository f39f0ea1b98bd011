use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::{ClientAction, Commands, MatchMode, SampleArgs};
use toolmeister::assembler;
use toolmeister::config::Config;
use toolmeister::controller::{CollectReport, CommandReport, Controller, ControllerSink};
use toolmeister::domain::{SampleId, SampleState};
use toolmeister::id::generate_run_id;
use toolmeister::ipc::{MeisterServer, MeisterServerConfig};
use toolmeister::meister::ToolMeister;
use toolmeister::trigger::{Armed, Trigger, TriggerEvaluator, TriggerMode, drive};

/// Exit status for a command where some hosts failed
const EXIT_PARTIAL: i32 = 2;

fn setup_logging(level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolmeister")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("toolmeister.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // RUST_LOG wins over the configured level
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn sample_id(args: &SampleArgs) -> SampleId {
    SampleId::new(&args.run, args.iteration, args.sample)
}

/// Print a command report; returns true when some hosts failed
fn print_report(report: &CommandReport, verbose: bool) -> bool {
    let marker = if report.is_partial() { "partial".yellow() } else { "ok".green() };
    println!("{} {}", marker, report);
    if verbose {
        for (host, outcome) in &report.hosts {
            println!("  {:<20} {:?}", host, outcome);
        }
    }
    for error in &report.errors {
        let mut at = Vec::new();
        if let Some(host) = &error.host {
            at.push(host.as_str());
        }
        if let Some(tool) = &error.tool {
            at.push(tool.as_str());
        }
        println!("  {} {:?} {}: {}", "!".yellow(), error.kind, at.join("/"), error.message);
    }
    if let Some(summary) = report.failure_summary() {
        eprintln!("{}", summary.red());
    }
    report.is_partial()
}

fn print_collect(report: &CollectReport, verbose: bool) -> bool {
    let partial = print_report(&report.command, verbose);
    if report.assembly.noop {
        println!("  sample already collected");
    } else {
        println!("  assembled {} file(s)", report.assembly.copied_files);
    }
    partial
}

async fn run_application(cli: &Cli, config: &Config) -> Result<bool> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    if let Commands::Meister {
        listen,
        hostname,
        output_dir,
    } = &cli.command
    {
        return run_meister(listen.as_deref(), hostname.as_deref(), output_dir.as_ref(), config).await;
    }

    let mut config = config.clone();
    if let Commands::ToolMeisterStart {
        sysinfo: Some(items), ..
    } = &cli.command
    {
        config.controller.sysinfo = items.clone();
    }
    let controller = Controller::from_config(&config).context("Failed to set up controller")?;
    let verbose = cli.is_verbose();

    match &cli.command {
        Commands::RegisterToolSet {
            tools,
            group,
            remotes,
            params,
            force,
            label,
        } => {
            let params: BTreeMap<String, String> = params.iter().cloned().collect();
            for remote in remotes {
                for tool in tools {
                    controller.register_tool(group, remote, tool, &params, *force, label.as_deref())?;
                    println!("{} {} on {} in group {}", "registered".green(), tool, remote, group);
                }
            }
            Ok(false)
        }
        Commands::UnregisterTool { tool, group, remote } => {
            controller.unregister_tool(group, remote, tool)?;
            println!("{} {} from {} in group {}", "unregistered".green(), tool, remote, group);
            Ok(false)
        }
        Commands::ListTools { group, catalog } => {
            if *catalog {
                for name in controller.catalog().list() {
                    if let Some(tool) = controller.catalog().get(name) {
                        println!("{:<16} {:<18} {}", tool.name, tool.kind.as_str(), tool.description);
                    }
                }
                return Ok(false);
            }
            let groups = match group {
                Some(group) => vec![group.clone()],
                None => controller.registry().list_groups()?,
            };
            for group in groups {
                println!("{}", group.bold());
                for binding in controller.registry().list_group(&group)? {
                    let params: Vec<String> = binding.params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                    println!("  {:<20} {:<12} {}", binding.host, binding.tool, params.join(" "));
                }
                if let Some(trigger) = controller.registry().trigger(&group)? {
                    println!("  trigger: start={:?} stop={:?} ({:?})", trigger.start, trigger.stop, trigger.mode);
                }
            }
            Ok(false)
        }
        Commands::ClearTools { group } => {
            controller.delete_group(group)?;
            println!("{} group {}", "deleted".green(), group);
            Ok(false)
        }
        Commands::RegisterTrigger {
            group,
            start,
            stop,
            mode,
        } => {
            let mode = match mode {
                MatchMode::Substring => TriggerMode::Substring,
                MatchMode::Regex => TriggerMode::Regex,
            };
            controller.set_trigger(group, &Trigger::new(start, stop, mode))?;
            println!("{} trigger for group {}", "registered".green(), group);
            Ok(false)
        }
        Commands::ToolMeisterStart { run, group, .. } => {
            let run = run.clone().unwrap_or_else(|| generate_run_id(group));
            let report = controller.begin_run(&run, group).await?;
            println!("{} {}", "run".green(), run);
            Ok(print_report(&report, verbose))
        }
        Commands::StartTools { sample, group } => {
            let report = controller.start_sample(group, &sample_id(sample)).await?;
            Ok(print_report(&report, verbose))
        }
        Commands::StopTools { sample, no_collect } => {
            let id = sample_id(sample);
            let report = controller.stop_sample(&id).await?;
            let mut partial = print_report(&report, verbose);
            if !no_collect {
                partial |= print_collect(&controller.collect_sample(&id).await?, verbose);
            }
            Ok(partial)
        }
        Commands::ToolMeisterClient {
            action,
            group,
            run,
            iteration,
            sample,
        } => {
            let id = || {
                run.as_ref()
                    .map(|run| SampleId::new(run, *iteration, *sample))
                    .ok_or_else(|| eyre::eyre!("--run is required for {:?}", action))
            };
            match action {
                ClientAction::Start => Ok(print_report(&controller.start_sample(group, &id()?).await?, verbose)),
                ClientAction::Stop => Ok(print_report(&controller.stop_sample(&id()?).await?, verbose)),
                ClientAction::Collect => Ok(print_collect(&controller.collect_sample(&id()?).await?, verbose)),
                ClientAction::Terminate => Ok(print_report(&controller.terminate(group).await?, verbose)),
                ClientAction::Status => {
                    let outcome = controller.status(group).await?;
                    for (host, result) in &outcome.results {
                        match result.ack() {
                            Some(status) => {
                                println!("{} {} up {}s", "ok".green(), host, status.uptime_ms / 1000);
                                for (sample, state) in &status.samples {
                                    println!("  {:<24} {}", sample, state);
                                }
                            }
                            None => println!("{} {} {}", "!!".red(), host, result.reason().unwrap_or_default()),
                        }
                    }
                    let failures = outcome.failures();
                    if !failures.is_empty() {
                        let details: Vec<String> = failures.iter().map(|(h, r)| format!("{} ({})", h, r)).collect();
                        eprintln!("{}", format!("{} host(s) failed: {}", failures.len(), details.join(", ")).red());
                    }
                    Ok(!failures.is_empty())
                }
            }
        }
        Commands::ToolMeisterStop { run, terminate } => {
            let report = controller.end_run(run, *terminate).await?;
            Ok(print_report(&report, verbose))
        }
        Commands::WatchTriggers {
            group,
            run,
            iteration,
            no_collect,
        } => {
            let trigger = controller
                .registry()
                .trigger(group)?
                .ok_or_else(|| eyre::eyre!("no trigger registered for group {}", group))?;
            let mut evaluator = TriggerEvaluator::new(&trigger)?;

            // Resume after the samples this iteration already has.
            let existing = controller
                .samples_of(run)?
                .into_iter()
                .filter(|s| s.sample.iteration == *iteration)
                .collect::<Vec<_>>();
            let first = existing.iter().map(|s| s.sample.sample).max().map_or(1, |n| n + 1);
            if existing.iter().any(|s| s.state == SampleState::ToolsRunning) {
                evaluator = evaluator.with_armed(Armed::ForStop);
            }

            let mut sink = ControllerSink::new(&controller, group, run, *iteration).with_collect(!no_collect);
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let summary = drive(&mut evaluator, stdin, &mut sink, first).await?;

            let mut partial = false;
            for report in &sink.reports {
                partial |= print_report(report, verbose);
            }
            for collected in &sink.collected {
                partial |= print_collect(collected, verbose);
            }
            println!(
                "{} {} line(s), {} started, {} stopped",
                "done".green(),
                summary.lines,
                summary.started,
                summary.stopped
            );
            if summary.armed == Armed::ForStop {
                eprintln!("{}", "input ended with a sample still running".yellow());
            }
            Ok(partial)
        }
        Commands::Assemble { sample } => {
            let report = controller.assemble_sample(&sample_id(sample))?;
            if report.noop {
                println!("sample already collected");
            } else {
                println!("{} {} file(s)", "assembled".green(), report.copied_files);
            }
            for gap in &report.partial {
                println!("  {} {}", "!".yellow(), gap.message);
            }
            Ok(!report.partial.is_empty())
        }
        Commands::Package { run } => {
            let package = assembler::package(controller.assembler().results_dir(), run).await?;
            println!("{} {}", "packaged".green(), package.tarball.display());
            println!("  sha256 {}", package.sha256);
            Ok(false)
        }
        Commands::Meister { .. } => Ok(false),
    }
}

async fn run_meister(
    listen: Option<&str>,
    hostname: Option<&str>,
    output_dir: Option<&PathBuf>,
    config: &Config,
) -> Result<bool> {
    let mut settings = config.meister.clone();
    if let Some(listen) = listen {
        settings.listen = listen.to_string();
    }
    if let Some(hostname) = hostname {
        settings.hostname = Some(hostname.to_string());
    }
    if let Some(dir) = output_dir {
        settings.output_dir = dir.clone();
    }

    let meister = Arc::new(ToolMeister::from_config(&settings));
    let server = MeisterServer::bind(MeisterServerConfig {
        listen: settings.listen.clone(),
        max_clients: settings.max_clients,
        max_message_bytes: settings.max_message_bytes,
    })
    .await?;
    println!(
        "{} {} on {}",
        "tool meister".green(),
        meister.hostname(),
        server.local_addr()?
    );

    let shutdown = meister.shutdown_signal();
    let on_interrupt = Arc::clone(&meister);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping tools");
            if let Err(e) = on_interrupt.terminate().await {
                log::error!("terminate failed: {}", e);
            }
        }
    });

    server.run(meister, shutdown).await?;
    Ok(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    setup_logging(config.log_level.as_deref()).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    let partial = run_application(&cli, &config).await.context("Application failed")?;
    if partial {
        std::process::exit(EXIT_PARTIAL);
    }
    Ok(())
}
