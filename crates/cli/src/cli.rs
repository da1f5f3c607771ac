use crate::config::load_config;
use crate::regex_extractor::RegexExtractor;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fnindex_core::{
    ExportFormat, FsStorage, HistoryManager, IndexConfig, IndexStore, ProjectRoot, ScanOptions,
    UpdateOptions, UpdateService,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_INDEX: &str = "functions";
const MAX_ERRORS_DISPLAY: usize = 20;

#[derive(Parser)]
#[command(name = "fnindex")]
#[command(about = "Incremental content-addressed function index")]
#[command(version)]
pub struct Cli {
    /// Project root (default: current directory)
    #[arg(short = 'P', long = "project", global = true)]
    pub project_root: Option<PathBuf>,

    /// Index directory relative to the project (default: .fnindex)
    #[arg(long = "index-dir", global = true)]
    pub index_dir: Option<String>,

    /// Index name (default: functions)
    #[arg(short = 'i', long = "index", global = true, default_value = DEFAULT_INDEX)]
    pub index: String,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the index from scratch [aliases: b]
    #[command(visible_alias = "b")]
    Build {
        /// Scan root relative to the project (default: .)
        #[arg(short = 'r', long = "root")]
        root: Option<String>,

        /// Domain tag stored on every record
        #[arg(short = 'd', long = "domain")]
        domain: Option<String>,

        /// Include glob, repeatable (replaces the defaults)
        #[arg(long = "include")]
        include: Vec<String>,

        /// Exclude glob, repeatable (replaces the defaults)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },

    /// Re-extract only what changed since the last build or update [aliases: up, u]
    #[command(visible_alias = "up", visible_alias = "u")]
    Update {
        /// Back up the index before changing it
        #[arg(short = 'b', long = "backup")]
        backup: bool,

        /// Restore the latest backup if the update fails
        #[arg(short = 'r', long = "restore")]
        restore: bool,
    },

    /// Check every line of the index [aliases: check]
    #[command(visible_alias = "check")]
    Validate,

    /// Write the parseable lines of a damaged index to a .repaired file
    Repair,

    /// Export the index [aliases: e]
    #[command(visible_alias = "e")]
    Export {
        /// Export format (jsonl|json|csv)
        #[arg(short = 'f', long = "format", default_value = "jsonl")]
        format: String,

        /// Output file (default: <index-dir>/exports/<index>.<ext>)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Back up one index, or all of them
    Backup {
        /// Index to back up (default: all indexes)
        #[arg(value_name = "INDEX")]
        target: Option<String>,
    },

    /// List backups, most recent first
    Backups,

    /// Restore every file captured by a backup
    Restore {
        #[arg(value_name = "BACKUP_ID")]
        backup_id: String,
    },

    /// List managed indexes [aliases: ls]
    #[command(visible_alias = "ls")]
    List,

    /// Show index statistics [aliases: st]
    #[command(visible_alias = "st")]
    Status,

    /// Numbered versions of the index file
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
pub enum HistoryAction {
    /// Snapshot the current index file
    Save,
    /// List saved versions
    List,
    /// Overwrite the index with a saved version
    Restore { version: u32 },
    /// Line diff between two versions
    Diff { from: u32, to: u32 },
}

/// Everything a command needs, resolved once from the flags and `fnindex.toml`.
struct Workspace {
    root: ProjectRoot,
    config: IndexConfig,
    store: IndexStore,
}

impl Workspace {
    fn open(cli: &Cli) -> Result<Self> {
        let root = match &cli.project_root {
            Some(path) => ProjectRoot::new(path),
            None => ProjectRoot::new(std::env::current_dir().context("Failed to read current directory")?),
        };
        if !root.as_path().is_dir() {
            bail!("Project root does not exist: {}", root.as_path().display());
        }

        let mut config = load_config(&root)?;
        if let Some(index_dir) = &cli.index_dir {
            config.index_dir = index_dir.clone();
        }

        let storage = Arc::new(FsStorage::new(root.as_path()));
        let store = IndexStore::new(storage, &config.index_dir, config.writer.max_backups);
        Ok(Self {
            root,
            config,
            store,
        })
    }

    fn service(&self, domain: &str) -> Result<UpdateService> {
        Ok(UpdateService::new(
            self.store.clone(),
            Arc::new(RegexExtractor::new(domain)?),
            self.root.clone(),
            self.config.update.clone(),
        ))
    }

    fn history(&self) -> HistoryManager {
        HistoryManager::new(self.store.writer().clone(), self.config.history.clone())
    }
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn print_errors(errors: &[String]) {
    for error in errors.iter().take(MAX_ERRORS_DISPLAY) {
        println!("  {} {}", "✗".red(), error);
    }
    if errors.len() > MAX_ERRORS_DISPLAY {
        println!("  ... and {} more", errors.len() - MAX_ERRORS_DISPLAY);
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open(&self)?;
        let id = self.index.as_str();

        match self.command {
            Commands::Build {
                root,
                domain,
                include,
                exclude,
            } => handle_build(&workspace, id, root, domain, include, exclude),
            Commands::Update { backup, restore } => handle_update(&workspace, id, backup, restore),
            Commands::Validate => handle_validate(&workspace, id),
            Commands::Repair => handle_repair(&workspace, id),
            Commands::Export { format, output } => handle_export(&workspace, id, &format, output),
            Commands::Backup { target } => handle_backup(&workspace, target.as_deref()),
            Commands::Backups => handle_backups(&workspace),
            Commands::Restore { backup_id } => handle_restore(&workspace, &backup_id),
            Commands::List => handle_list(&workspace),
            Commands::Status => handle_status(&workspace, id),
            Commands::History { action } => handle_history(&workspace, id, action),
        }
    }
}

// Command handlers

fn handle_build(
    workspace: &Workspace,
    id: &str,
    root: Option<String>,
    domain: Option<String>,
    include: Vec<String>,
    exclude: Vec<String>,
) -> Result<()> {
    let mut scan = ScanOptions::default();
    if let Some(root) = root {
        scan.root = root;
    }
    if let Some(domain) = domain {
        scan.domain = domain;
    }
    if !include.is_empty() {
        scan.include = include;
    }
    if !exclude.is_empty() {
        scan.exclude = exclude;
    }

    let service = workspace.service(&scan.domain)?;
    let pb = spinner("Building index...")?;
    let result = service.build_index(id, scan);
    pb.finish_and_clear();
    let report = result?;

    println!(
        "{} Built {} in {:.2}s ({} functions in {} files)",
        "✅".green(),
        IndexStore::index_file_name(id).bold(),
        report.execution_time.as_secs_f64(),
        report.functions,
        report.files
    );
    if !report.errors.is_empty() {
        println!("{} {} files could not be extracted:", "⚠️".yellow(), report.errors.len());
        print_errors(&report.errors);
    }
    Ok(())
}

fn handle_update(workspace: &Workspace, id: &str, backup: bool, restore: bool) -> Result<()> {
    let domain = workspace
        .store
        .load_metadata(id)?
        .map(|m| m.scan.domain)
        .unwrap_or_else(|| ScanOptions::default().domain);
    let service = workspace.service(&domain)?;

    let pb = spinner("Updating index...")?;
    let result = service.update_index(
        id,
        UpdateOptions {
            auto_backup: backup,
            auto_restore: restore,
        },
    );
    pb.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(failure) => {
            println!("{} Update failed: {}", "❌".red(), failure);
            if let Some(backup_id) = &failure.restored_backup {
                println!("  Restored backup {}", backup_id.cyan());
            }
            print_errors(&failure.errors);
            return Err(failure.into());
        }
    };

    if report.has_changes() {
        println!(
            "{} Updated in {:.2}s (+{} ~{} -{} functions, +{} ~{} -{} files)",
            "✅".green(),
            report.execution_time.as_secs_f64(),
            report.added,
            report.updated,
            report.deleted,
            report.files_added,
            report.files_modified,
            report.files_deleted
        );
    } else {
        println!(
            "{} Up to date ({} files unchanged)",
            "✅".green(),
            report.files_unchanged
        );
    }
    if let Some(backup_id) = &report.backup_id {
        println!("  Backup: {}", backup_id.cyan());
    }
    if !report.errors.is_empty() {
        println!(
            "{} {} files kept their previous records:",
            "⚠️".yellow(),
            report.errors.len()
        );
        print_errors(&report.errors);
    }
    Ok(())
}

fn handle_validate(workspace: &Workspace, id: &str) -> Result<()> {
    let report = workspace.store.validate_index(id)?;
    if report.valid {
        println!(
            "{} {} is valid ({} records)",
            "✅".green(),
            IndexStore::index_file_name(id).bold(),
            report.total_lines
        );
        return Ok(());
    }

    println!(
        "{} {}: {}",
        "❌".red(),
        IndexStore::index_file_name(id).bold(),
        report.error.as_deref().unwrap_or("invalid")
    );
    if report.recoverable == Some(true) {
        println!(
            "  Lines {:?} can be dropped with `fnindex repair`",
            report.invalid_lines
        );
    }
    bail!("{} failed validation", IndexStore::index_file_name(id))
}

fn handle_repair(workspace: &Workspace, id: &str) -> Result<()> {
    let report = workspace.store.repair_index(id)?;
    println!(
        "{} Recovered {} records, lost {}",
        "🔧".cyan(),
        report.recovered,
        report.lost
    );
    println!("  Written to {}", report.repaired_file.display());
    Ok(())
}

fn handle_export(workspace: &Workspace, id: &str, format: &str, output: Option<PathBuf>) -> Result<()> {
    let format: ExportFormat = format.parse()?;
    let path = workspace
        .store
        .export_to_file(id, format, output.as_deref())?;
    println!("{} Exported to {}", "📦".cyan(), path.display());
    Ok(())
}

fn handle_backup(workspace: &Workspace, index: Option<&str>) -> Result<()> {
    let manifest = workspace.store.create_backup(index)?;
    println!(
        "{} Created backup {} ({} files, {} bytes)",
        "💾".cyan(),
        manifest.id.bold(),
        manifest.files.len(),
        manifest.total_size
    );
    Ok(())
}

fn handle_backups(workspace: &Workspace) -> Result<()> {
    let backups = workspace.store.list_backups()?;
    if backups.is_empty() {
        println!("No backups");
        return Ok(());
    }
    for backup in backups {
        println!(
            "  {}  {}  {}",
            backup.id.bold(),
            backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
            backup.indexes.join(", ").dimmed()
        );
    }
    Ok(())
}

fn handle_restore(workspace: &Workspace, backup_id: &str) -> Result<()> {
    let manifest = workspace.store.restore_from_backup(backup_id)?;
    println!(
        "{} Restored {} files from {}",
        "♻️".cyan(),
        manifest.files.len(),
        manifest.id.bold()
    );
    Ok(())
}

fn handle_list(workspace: &Workspace) -> Result<()> {
    let indexes = workspace.store.get_index_list()?;
    if indexes.is_empty() {
        println!("No indexes in {}", workspace.store.index_dir().display());
    }
    for index in indexes {
        println!("  {}", index);
    }
    Ok(())
}

fn handle_status(workspace: &Workspace, id: &str) -> Result<()> {
    let name = IndexStore::index_file_name(id);
    let Some(metadata) = workspace.store.load_metadata(id)? else {
        println!("{} {} has not been built yet", "❌".red(), name.bold());
        return Ok(());
    };

    println!("{}", name.bold());
    println!("  Scan root:     {}", workspace.root.join(&metadata.scan.root).display());
    println!("  Domain:        {}", metadata.scan.domain);
    println!("  Files:         {}", metadata.stats.total_files);
    println!("  Functions:     {}", metadata.stats.total_functions);
    println!("  Created:       {}", metadata.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Last updated:  {}", metadata.last_updated.format("%Y-%m-%d %H:%M:%S"));

    let path = workspace.store.index_path(id);
    let file_backups = workspace.store.writer().list_backups(&path)?.len();
    let versions = workspace.history().get_versions(&path)?.len();
    let backups = workspace
        .store
        .list_backups()?
        .into_iter()
        .filter(|b| b.indexes.contains(&name))
        .count();
    println!("  Write backups: {}", file_backups);
    println!("  Versions:      {}", versions);
    println!("  Backups:       {}", backups);
    Ok(())
}

fn handle_history(workspace: &Workspace, id: &str, action: HistoryAction) -> Result<()> {
    let history = workspace.history();
    let path = workspace.store.index_path(id);

    match action {
        HistoryAction::Save => {
            let version = history.save_version(&path)?;
            println!("{} Saved version {}", "💾".cyan(), version);
        }
        HistoryAction::List => {
            let versions = history.get_versions(&path)?;
            if versions.is_empty() {
                println!("No versions of {}", IndexStore::index_file_name(id));
            }
            for version in versions {
                println!(
                    "  v{:<4} {}",
                    version.version,
                    version.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        HistoryAction::Restore { version } => {
            history.restore_version(&path, version)?;
            println!("{} Restored version {}", "♻️".cyan(), version);
        }
        HistoryAction::Diff { from, to } => {
            for line in history.compare_versions(&path, from, to)? {
                if line.starts_with('+') {
                    println!("{}", line.green());
                } else {
                    println!("{}", line.red());
                }
            }
        }
    }
    Ok(())
}
