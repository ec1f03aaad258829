use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use mend_classifier::{Classifier, ErrorContext, RuleClassifier};
use mend_core::{LogNotifier, LoopMetrics, MendConfig, Orchestrator, StateStore};
use mend_model::{MemoryFixture, MemoryTarget, TargetId};
use mend_repair::StrategyRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let config = || {
        Arg::new("config")
            .long("config")
            .short('c')
            .value_parser(value_parser!(PathBuf))
            .help("Configuration file (.toml, .yaml or .json); defaults apply when omitted")
    };
    Command::new("mend")
        .version(mend_core::VERSION)
        .about("Self-healing remediation loop for workflow engines")
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("run")
                .about("Run the loop against a fixture-backed engine")
                .arg(config())
                .arg(
                    Arg::new("fixture")
                        .long("fixture")
                        .short('f')
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Engine fixture (.json or .yaml)"),
                )
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Run a single tick and exit"),
                ),
        )
        .subcommand(
            Command::new("classify")
                .about("Classify one error message and print the analysis")
                .arg(config())
                .arg(
                    Arg::new("text")
                        .long("text")
                        .required(true)
                        .help("Error message"),
                )
                .arg(Arg::new("error-type").long("error-type").help("Engine error class"))
                .arg(Arg::new("step").long("step").help("Failing step name"))
                .arg(Arg::new("step-type").long("step-type").help("Failing step type")),
        )
        .subcommand(
            Command::new("status")
                .about("Summarise the persisted snapshot")
                .arg(config()),
        )
        .subcommand(
            Command::new("audit")
                .about("Print or verify the persisted audit trail")
                .arg(config())
                .arg(
                    Arg::new("verify")
                        .long("verify")
                        .action(ArgAction::SetTrue)
                        .help("Only check the hash chain"),
                )
                .arg(
                    Arg::new("resource")
                        .long("resource")
                        .help("Only entries for this incident or resource"),
                ),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mend=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> Result<MendConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => MendConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(MendConfig::default()),
    }
}

fn classifier(config: &MendConfig) -> Result<RuleClassifier> {
    RuleClassifier::new(
        config.classifier.clone(),
        StrategyRegistry::with_defaults(),
        config.credentials.clone(),
    )
    .context("building classifier")
}

async fn run(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let Some(fixture_path) = args.get_one::<PathBuf>("fixture") else {
        bail!("--fixture is required");
    };
    let fixture = MemoryFixture::load(fixture_path)
        .with_context(|| format!("loading fixture {}", fixture_path.display()))?;
    let target = Arc::new(MemoryTarget::from_fixture(fixture));
    let store = StateStore::new(config.snapshot_path());
    let classifier = Arc::new(classifier(&config)?);

    let orchestrator = Orchestrator::new(config, target, classifier, Arc::new(LogNotifier))
        .with_store(store);
    if orchestrator.restore().await.context("restoring state")? {
        tracing::info!("resumed from snapshot");
    }

    if args.get_flag("once") {
        let report = orchestrator.tick().await?;
        orchestrator.persist().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        println!("{}", serde_json::to_string_pretty(&orchestrator.metrics().await)?);
        return Ok(());
    }

    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current tick");
            let _ = tx.send(true);
        }
    });
    orchestrator.run(rx).await?;
    Ok(())
}

async fn classify(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let classifier = classifier(&config)?;
    let Some(text) = args.get_one::<String>("text") else {
        bail!("--text is required");
    };
    let mut ctx = ErrorContext::new(TargetId::from("cli"), text.clone());
    if let Some(error_type) = args.get_one::<String>("error-type") {
        ctx = ctx.with_error_type(error_type.clone());
    }
    let step_type = args.get_one::<String>("step-type").cloned();
    if let Some(step) = args.get_one::<String>("step") {
        ctx = ctx.with_step(step.clone(), step_type);
    } else if step_type.is_some() {
        ctx = ctx.with_step("step", step_type);
    }
    let analysis = classifier.classify(&ctx).await;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn open_snapshot(config: &MendConfig) -> Result<mend_core::Snapshot> {
    let path = config.snapshot_path();
    StateStore::new(&path)
        .load()
        .with_context(|| format!("reading snapshot {}", path.display()))?
        .with_context(|| format!("no snapshot at {}", path.display()))
}

fn status(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let snapshot = open_snapshot(&config)?;
    let fix_attempts = snapshot
        .active
        .iter()
        .chain(&snapshot.history)
        .map(|i| u64::from(i.attempts))
        .sum();
    let mut metrics = LoopMetrics::from_incidents(&snapshot.active, &snapshot.history, fix_attempts);
    metrics.emergency = snapshot.emergency;

    println!("Mend status");
    println!("===========");
    if let Some(at) = snapshot.saved_at {
        println!("Saved: {}", at.to_rfc3339());
    }
    println!("Emergency: {}", if metrics.emergency { "YES" } else { "no" });
    println!("Active incidents: {}", metrics.active);
    println!("Resolved: {}", metrics.resolved);
    println!("Escalated: {}", metrics.escalated);
    println!("Resolution rate: {:.1}%", metrics.resolution_rate * 100.0);
    if let Some(secs) = metrics.mean_resolution_secs {
        println!("Mean time to resolve: {secs:.0}s");
    }
    println!("Fix attempts: {}", metrics.fix_attempts);
    println!("Backups retained: {}", snapshot.backups.len());
    println!("Audit entries: {}", snapshot.audit.len());
    for incident in &snapshot.active {
        println!(
            "  {} {} [{}] attempts={} {}",
            incident.id, incident.target_id, incident.phase, incident.attempts, incident.description
        );
    }
    Ok(())
}

fn audit(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    // loading verifies the chain
    let snapshot = open_snapshot(&config)?;
    if args.get_flag("verify") {
        println!("audit chain intact ({} entries)", snapshot.audit.len());
        return Ok(());
    }
    let resource = args.get_one::<String>("resource");
    for entry in snapshot
        .audit
        .iter()
        .filter(|e| resource.map_or(true, |r| &e.resource == r))
    {
        println!(
            "{:>5} {} {:<20} {} {}",
            entry.sequence,
            entry.timestamp.to_rfc3339(),
            entry.action.as_str(),
            entry.resource,
            entry.details
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        Some(("classify", args)) => classify(args).await,
        Some(("status", args)) => status(args),
        Some(("audit", args)) => audit(args),
        _ => Ok(()),
    }
}
