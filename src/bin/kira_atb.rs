use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_atb_fetch::app::{App, FetchResult, PipelineReport, PlanSummary, ProgressSinkKind};
use kira_atb_fetch::config::{ConfigLoader, ConfigOverrides};
use kira_atb_fetch::domain::FetchOutcome;
use kira_atb_fetch::error::AtbError;
use kira_atb_fetch::fetcher::{ArchiveFetcher, HttpArchiveSource};
use kira_atb_fetch::output::{JsonOutput, OutputMode};
use kira_atb_fetch::plan::ArchiveChecksums;
use kira_atb_fetch::selection::read_selection;
use kira_atb_fetch::store::Store;
use kira_atb_fetch::tui::Tui;

const EXIT_INCOMPLETE: u8 = 3;

#[derive(Parser)]
#[command(name = "kira-atb")]
#[command(about = "Fetch AllTheBacteria assembly archives and extract selected genomes")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download archives and extract the selected members")]
    Fetch(FetchArgs),
    #[command(about = "Show the fetch plan without downloading (alias: fetch --dry-run)")]
    Plan(FetchArgs),
}

#[derive(Args, Clone)]
struct FetchArgs {
    /// Tab-separated selection table, optionally gzip-compressed
    selection: PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    jobs: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    strip_components: Option<usize>,

    #[arg(long)]
    delete_archives: bool,

    #[arg(long)]
    dry_run: bool,
}

impl FetchArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            jobs: self.jobs,
            max_attempts: self.max_attempts,
            timeout_secs: self.timeout_secs,
            strip_components: self.strip_components,
            delete_archives: self.delete_archives,
            output_dir: self.output_dir.clone(),
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_INCOMPLETE),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(atb) = report.downcast_ref::<AtbError>() {
                return ExitCode::from(map_exit_code(atb));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &AtbError) -> u8 {
    match error {
        AtbError::PlanConflict { .. }
        | AtbError::InvalidArchiveId(_)
        | AtbError::ConfigRead(_)
        | AtbError::ConfigParse(_)
        | AtbError::InvalidConfig(_)
        | AtbError::SelectionRead(_)
        | AtbError::SelectionColumns(_) => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<bool> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Fetch(args) => {
            let dry_run = args.dry_run;
            run_fetch(args, dry_run, output_mode)
        }
        Commands::Plan(args) => run_fetch(args, true, output_mode),
    }
}

fn run_fetch(args: FetchArgs, dry_run: bool, output_mode: OutputMode) -> miette::Result<bool> {
    let config = ConfigLoader::resolve(args.config.as_deref())?.apply(&args.overrides())?;
    let selection = read_selection(&args.selection)?;
    tracing::debug!(rows = selection.len(), path = %args.selection.display(), "read selection");

    let source = HttpArchiveSource::new(config.timeout)?;
    let fetcher = ArchiveFetcher::new(source, config.retry_base);
    let store = Store::from_path(&config.output_dir)?;
    let app = App::new(store, fetcher);
    let options = config.fetch_options(dry_run);

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.fetch(&selection, &ArchiveChecksums::new(), options, &JsonOutput)?;
            JsonOutput::print_fetch(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let kind = if dry_run {
                ProgressSinkKind::Plan
            } else {
                ProgressSinkKind::Fetch
            };
            let mut tui = Tui::new(kind);
            let result = tui.run(move |sink| {
                app.fetch(&selection, &ArchiveChecksums::new(), options, sink)
            })?;
            print_fetch_summary(&result);
            result
        }
    };

    Ok(match &result {
        FetchResult::DryRun(_) => true,
        FetchResult::Completed(report) => report.is_complete(),
    })
}

fn print_fetch_summary(result: &FetchResult) {
    match result {
        FetchResult::DryRun(summary) => print_plan_summary(summary),
        FetchResult::Completed(report) => print_report_summary(report),
    }
}

fn print_plan_summary(summary: &PlanSummary) {
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}KIRA-ATB plan{reset}");
    for line in plan_lines(summary) {
        println!("{line}");
    }
}

fn plan_lines(summary: &PlanSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "{} archives, {} members, staged under {}",
        summary.archive_count, summary.member_count, summary.archives_dir
    )];
    for entry in &summary.archives {
        let checksum = entry
            .expected_checksum
            .as_ref()
            .map(|checksum| checksum.to_string())
            .unwrap_or_else(|| "no checksum".to_string());
        lines.push(format!(
            "  {} ({} members, {checksum})",
            entry.archive_id,
            entry.wanted_members.len()
        ));
        lines.push(format!("    {}", entry.source_url));
        for member in &entry.wanted_members {
            lines.push(format!("    - {member}"));
        }
    }
    lines
}

fn print_report_summary(report: &PipelineReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}KIRA-ATB summary{reset}");
    println!("{green}Extracted members: {}{reset}", report.found_members());
    let missing = report.missing_members();
    let missing_color = if missing > 0 { yellow } else { green };
    println!("{missing_color}Missing members: {missing}{reset}");
    let failed = report.failed_archives().count();
    let failed_color = if failed > 0 { red } else { green };
    println!("{failed_color}Failed archives: {failed}{reset}");

    for archive in &report.archives {
        let color = match &archive.fetch {
            FetchOutcome::AlreadyValid => green,
            FetchOutcome::Downloaded { .. } => cyan,
            FetchOutcome::Failed { .. } => red,
        };
        println!(
            "{color}  {} ({}): {} found, {} missing{reset}",
            archive.archive_id,
            archive.fetch.label(),
            archive.found_count,
            archive.missing_count
        );
        if let FetchOutcome::Failed { reason, attempts } = &archive.fetch {
            println!("{red}    after {attempts} attempts: {reason}{reset}");
        }
        for member in &archive.extraction.missing {
            println!("{yellow}    missing: {member}{reset}");
        }
        for collision in &archive.extraction.collisions {
            println!(
                "{yellow}    collision: {} <- {}{reset}",
                collision.output_name,
                collision.members.join(", ")
            );
        }
        if archive.archive_deleted {
            println!("    archive removed: {}", archive.archive_path);
        }
    }

    println!("Output: {}", report.output_dir);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use kira_atb_fetch::plan::FetchPlanEntry;

    use super::*;

    #[test]
    fn plan_lists_every_member() {
        let summary = PlanSummary {
            archive_count: 1,
            member_count: 2,
            archives_dir: "assemblies/_archives".to_string(),
            archives: vec![FetchPlanEntry {
                archive_id: "batch_1.tar.xz".parse().unwrap(),
                source_url: "https://example.org/batch_1.tar.xz".to_string(),
                expected_checksum: Some("6cd3556deb0da54bca060b4c39479839".parse().unwrap()),
                wanted_members: BTreeSet::from([
                    "batch_1/SAMN002.fa".to_string(),
                    "batch_1/SAMN001.fa".to_string(),
                ]),
            }],
        };

        let lines = plan_lines(&summary);
        assert_eq!(
            lines,
            vec![
                "1 archives, 2 members, staged under assemblies/_archives".to_string(),
                "  batch_1.tar.xz (2 members, md5:6cd3556deb0da54bca060b4c39479839)".to_string(),
                "    https://example.org/batch_1.tar.xz".to_string(),
                "    - batch_1/SAMN001.fa".to_string(),
                "    - batch_1/SAMN002.fa".to_string(),
            ]
        );
    }
}
