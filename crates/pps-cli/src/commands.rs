use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::{ColoredString, Colorize};
use pps_engine::{
    EngineContext, EntryView, Operator, PassReport, PurgeDecision, RetentionManager, Service,
    ServiceConfig,
};
use pps_ledger::{JournaledLedger, LedgerStats};
use pps_repo::DirectoryRepository;
use pps_types::DatasetState;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::cli::*;

/// The ledger and repositories named by a service configuration.
struct Node {
    ledger: Arc<JournaledLedger>,
    ctx: EngineContext,
}

impl Node {
    fn open(config: &ServiceConfig) -> anyhow::Result<Self> {
        let ledger = Arc::new(
            JournaledLedger::open(&config.ledger_path, config.ledger_sync)
                .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?,
        );
        let source = DirectoryRepository::open("source", &config.source_root)
            .with_context(|| format!("opening source {}", config.source_root.display()))?;
        let destination = DirectoryRepository::open("destination", &config.destination_root)
            .with_context(|| format!("opening destination {}", config.destination_root.display()))?;
        let ctx = EngineContext::new(
            Arc::new(source),
            Arc::new(destination),
            ledger.clone(),
            config.engine.clone(),
        );
        Ok(Self { ledger, ctx })
    }
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    if let Command::InitConfig(args) = &cli.command {
        return cmd_init_config(&cli.config, args);
    }

    let config = ServiceConfig::load(&cli.config)?;
    let node = Node::open(&config)?;
    match cli.command {
        Command::Run => cmd_run(node).await,
        Command::Once => cmd_once(node, format).await,
        Command::Status => cmd_status(node, format),
        Command::Show(args) => cmd_show(node, args, format),
        Command::List(args) => cmd_list(node, args, format),
        Command::Requeue(args) => cmd_requeue(node, args, format),
        Command::Purge(args) => cmd_purge(node, args, format).await,
        Command::Validate => cmd_validate(node, format),
        Command::Compact => cmd_compact(node, format),
        Command::InitConfig(_) => Ok(()),
    }
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(value),
    }
    Ok(())
}

fn paint(state: DatasetState) -> ColoredString {
    let label = state.as_str();
    match state {
        DatasetState::Pending | DatasetState::Retrying => label.yellow(),
        DatasetState::Replicated => label.green(),
        DatasetState::Purgeable => label.cyan(),
        DatasetState::Purged => label.dimmed(),
        DatasetState::Failed => label.red().bold(),
    }
}

async fn cmd_run(node: Node) -> anyhow::Result<()> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for Ctrl-C; stop the process to exit");
                std::future::pending::<()>().await;
            }
        }
    });
    Service::new(node.ctx).run(rx).await?;
    Ok(())
}

async fn cmd_once(node: Node, format: OutputFormat) -> anyhow::Result<()> {
    let report = Service::new(node.ctx).run_once().await?;
    emit(format, &report, print_pass)
}

fn print_pass(report: &PassReport) {
    let d = &report.discovery;
    match &d.listing_error {
        Some(e) => println!("{} source listing failed: {}", "✗".red().bold(), e),
        None => println!(
            "Discovery: {} listed, {} new",
            d.listed.to_string().bold(),
            d.registered.to_string().green()
        ),
    }
    let t = &report.transfers;
    println!(
        "Transfers: {} replicated, {} retrying, {} failed",
        t.replicated.to_string().green(),
        t.retrying.to_string().yellow(),
        t.failed.to_string().red()
    );
    let r = &report.reconcile;
    println!(
        "Reconcile: {} claims released, {} audited, {} demoted{}",
        (r.claims_released + r.stuck_released).to_string().bold(),
        r.audited,
        r.demoted.to_string().yellow(),
        if r.audit_skipped { " (audit skipped: destination unreachable)" } else { "" }
    );
    let p = &report.retention;
    println!(
        "Retention: {} due, {} purged, {} unverified, {} delete failures",
        p.due,
        p.purged.to_string().green(),
        p.unverified.to_string().yellow(),
        p.delete_failed.to_string().red()
    );
}

fn cmd_status(node: Node, format: OutputFormat) -> anyhow::Result<()> {
    let stats = Operator::new(node.ctx).stats()?;
    emit(format, &stats, print_stats)
}

fn print_stats(stats: &LedgerStats) {
    println!("Ledger: {} entries as of {}", stats.total.to_string().bold(), stats.as_of);
    for (state, count) in &stats.by_state {
        println!("  {:<12} {}", paint(*state), count);
    }
    println!(
        "Claims: {} active, {} lapsed; {} waiting on backoff or embargo",
        stats.claimed, stats.expired_claims, stats.waiting
    );
    if let Some(oldest) = stats.oldest_pending {
        println!("Oldest pending: {}", oldest.to_string().yellow());
    }
    if stats.demotions > 0 {
        println!("Demotions: {}", stats.demotions.to_string().yellow());
    }
    if !stats.failures.is_empty() {
        println!("\n{}", "Failed datasets:".red().bold());
        for (id, error) in &stats.failures {
            println!("  {}  {}", id, error.as_deref().unwrap_or("-").dimmed());
        }
    }
}

fn cmd_show(node: Node, args: ShowArgs, format: OutputFormat) -> anyhow::Result<()> {
    let view = Operator::new(node.ctx).show(&args.id)?;
    emit(format, &view, print_view)
}

fn print_view(view: &EntryView) {
    let e = &view.entry;
    println!("Dataset {}  {}", e.dataset_id.to_string().bold(), paint(view.effective_state));
    println!("  Type:        {}", e.reference.dataset_type.cyan());
    println!("  Fingerprint: {}", e.reference.fingerprint.short_hex().dimmed());
    println!("  Discovered:  {}", e.discovered_at);
    println!("  Attempts:    {} ({} since requeue)", e.attempt_count, e.attempts_since_requeue());
    let optional = [
        ("Last attempt", e.last_attempt_at),
        ("Next attempt", e.next_attempt_at),
        ("Completed", e.completed_at),
        ("Retain until", e.retention_deadline),
        ("Purged", e.purged_at),
    ];
    for (label, at) in optional {
        if let Some(at) = at {
            println!("  {:<13}{}", format!("{label}:"), at);
        }
    }
    if let Some(claim) = &e.claim {
        println!("  Claimed by:  {} until {}", claim.owner.yellow(), claim.expires_at);
    }
    if let Some(error) = &e.last_error {
        println!("  Last error:  {}", error.red());
    }
    if e.demotions > 0 {
        println!("  Demotions:   {}", e.demotions);
    }
}

fn cmd_list(node: Node, args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let views = Operator::new(node.ctx).list(args.state, args.limit)?;
    emit(format, &views, |views| {
        if views.is_empty() {
            println!("No {} datasets.", paint(args.state));
        }
        for view in views {
            let e = &view.entry;
            println!(
                "{}  {:<10} {:<24} attempts {}",
                e.dataset_id,
                paint(view.effective_state),
                e.reference.dataset_type,
                e.attempt_count
            );
        }
    })
}

fn cmd_requeue(node: Node, args: RequeueArgs, format: OutputFormat) -> anyhow::Result<()> {
    let entry = Operator::new(node.ctx).requeue(&args.id)?;
    emit(format, &entry, |entry| {
        println!(
            "{} Requeued {} ({} attempts so far)",
            "✓".green().bold(),
            entry.dataset_id.to_string().bold(),
            entry.attempt_count
        );
    })
}

async fn cmd_purge(node: Node, args: PurgeArgs, format: OutputFormat) -> anyhow::Result<()> {
    let decision = RetentionManager::new(node.ctx).purge(&args.id).await?;
    emit(format, &decision, |decision| match decision {
        PurgeDecision::Purged => println!("{} Purged {} from the source", "✓".green().bold(), args.id),
        PurgeDecision::AlreadyPurged => println!("{} already purged", args.id),
        PurgeDecision::Deferred { until } => {
            println!("Retention window open until {}", until.to_string().yellow())
        }
        PurgeDecision::RetainForever => println!("{} is retained forever", args.id),
        PurgeDecision::NotReplicated { state } => {
            println!("{} Not replicated (state {})", "✗".red().bold(), paint(*state))
        }
        PurgeDecision::Busy => println!("{} is claimed by another task; try again", args.id),
        PurgeDecision::Unverified { reason } => {
            println!("{} Destination copy unverified: {}", "✗".red().bold(), reason)
        }
        PurgeDecision::DeleteFailed { reason } => {
            println!("{} Source delete failed: {}", "✗".red().bold(), reason)
        }
    })
}

fn cmd_validate(node: Node, format: OutputFormat) -> anyhow::Result<()> {
    let report = Operator::new(node.ctx).validate()?;
    emit(format, &report, |report| {
        if report.violations.is_empty() {
            println!(
                "{} {} entries checked, no violations",
                "✓".green().bold(),
                report.entries_checked
            );
        }
        for v in &report.violations {
            println!("{} {} {:?}: {}", "✗".red().bold(), v.dataset_id, v.kind, v.description);
        }
    })?;
    if !report.violations.is_empty() {
        bail!("{} ledger violations", report.violations.len());
    }
    Ok(())
}

fn cmd_compact(node: Node, format: OutputFormat) -> anyhow::Result<()> {
    let report = node.ledger.compact()?;
    emit(format, &report, |report| {
        println!(
            "{} Compacted {} entries: {} -> {} bytes",
            "✓".green().bold(),
            report.entries,
            report.bytes_before,
            report.bytes_after
        );
    })
}

fn cmd_init_config(path: &Path, args: &InitConfigArgs) -> anyhow::Result<()> {
    if path.exists() && !args.force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    let text = ServiceConfig::default().to_toml()?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    println!("{} Wrote {}", "✓".green().bold(), path.display().to_string().bold());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_config_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pps.toml");
        let args = InitConfigArgs { force: false };

        cmd_init_config(&path, &args).unwrap();
        assert_eq!(ServiceConfig::load(&path).unwrap(), ServiceConfig::default());

        assert!(cmd_init_config(&path, &args).is_err());
        cmd_init_config(&path, &InitConfigArgs { force: true }).unwrap();
    }

    #[tokio::test]
    async fn node_opens_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            ledger_path: dir.path().join("ledger.journal"),
            source_root: dir.path().join("source"),
            destination_root: dir.path().join("archive"),
            ..ServiceConfig::default()
        };
        let node = Node::open(&config).unwrap();
        let report = Service::new(node.ctx.clone()).run_once().await.unwrap();
        assert_eq!(report.discovery.listed, 0);
        assert!(dir.path().join("source").is_dir());
        assert_eq!(node.ledger.compact().unwrap().entries, 0);
    }
}
