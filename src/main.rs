mod binary_patch;
mod bps;
mod builtin;
mod cache;
mod catalog;
mod config;
mod crc32;
mod engine;
mod filter;
mod identify;
mod ips;
mod library;
mod manager;
mod patch_format;
mod source;
mod ups;
mod util;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::builtin::BuiltinLoader;
use crate::cache::{ManifestCache, QueryCache};
use crate::catalog::{Catalog, PatchCatalogEntry};
use crate::config::Config;
use crate::engine::PatchEngine;
use crate::filter::{FilterField, FilterSet};
use crate::library::Library;
use crate::manager::{DirectorySink, PatchManager, Validation};
use crate::source::PatchSource;

#[derive(Parser)]
#[command(name = "romhack", about = "Browse a ROM hack catalog and patch base ROMs")]
struct Cli {
    /// Path to a config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Catalog manifest URL or local path (overrides the config)
    #[arg(long, global = true)]
    catalog: Option<String>,
    /// Only use the cached catalog; never touch the network
    #[arg(long, global = true)]
    offline: bool,
    /// Bypass the catalog cache
    #[arg(long, global = true)]
    no_cache: bool,
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the CRC32 of one or more files
    Crc32 {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List catalog entries, optionally searched and filtered
    List {
        /// Text to search for in titles, tags, authors and base ROMs
        #[arg(long, short)]
        search: Option<String>,
        #[arg(long)]
        base_rom: Vec<String>,
        #[arg(long)]
        system: Vec<String>,
        #[arg(long)]
        status: Vec<String>,
        #[arg(long)]
        difficulty: Vec<String>,
        #[arg(long)]
        tag: Vec<String>,
        #[arg(long)]
        fakemons: Vec<String>,
        #[arg(long)]
        graphics: Vec<String>,
        #[arg(long)]
        story: Vec<String>,
        #[arg(long)]
        mechanic: Vec<String>,
        /// Whole-star rating bucket, e.g. "4 Stars"
        #[arg(long)]
        rating: Vec<String>,
    },
    /// Show available filter values and how many entries carry each
    Filters,
    /// Show one catalog entry in full
    Show { id: String },
    /// Check a ROM against the checksum a hack expects
    Validate {
        #[arg(long)]
        hack: String,
        #[arg(long)]
        rom: PathBuf,
    },
    /// Apply a hack's patch to a ROM
    Apply {
        #[arg(long)]
        hack: String,
        #[arg(long)]
        rom: PathBuf,
        /// Directory to write the patched ROM into
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Find catalog entries whose base ROM matches the given files
    Identify {
        #[arg(required = true)]
        roms: Vec<PathBuf>,
    },
    /// Manage the catalog cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache size
    Stats,
    /// Remove every cached file
    Clear,
    /// Remove expired or damaged cache files
    Prune,
}

struct App {
    config: Config,
    offline: bool,
    cache: Option<ManifestCache>,
}

impl App {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = Config::load(cli.config.as_deref())?;
        if let Some(location) = &cli.catalog {
            config.catalog.location = location.clone();
        }
        let cache = (config.cache.enabled && !cli.no_cache).then(|| {
            ManifestCache::new(config.cache.dir.clone(), config.catalog.manifest_ttl())
        });
        Ok(Self {
            config,
            offline: cli.offline,
            cache,
        })
    }

    fn manifest_cache(&self) -> ManifestCache {
        ManifestCache::new(
            self.config.cache.dir.clone(),
            self.config.catalog.manifest_ttl(),
        )
    }

    async fn open_catalog(&self) -> Result<(Arc<dyn PatchSource>, Catalog)> {
        let (source, manifest) = source::open_catalog(&self.config.catalog.location)?;
        let catalog =
            library::load_catalog(source.as_ref(), &manifest, self.cache.as_ref(), self.offline)
                .await?;
        Ok((source, catalog))
    }

    fn new_engine(&self) -> Arc<PatchEngine> {
        let loader = BuiltinLoader::new(self.config.engine.formats.clone());
        Arc::new(PatchEngine::new(Arc::new(loader)))
    }
}

fn lookup(catalog: &Catalog, id: &str) -> Result<PatchCatalogEntry> {
    catalog
        .get(id)
        .cloned()
        .with_context(|| format!("Unknown hack id: {}", id))
}

fn print_entry_line(entry: &PatchCatalogEntry) {
    println!(
        "{:<32} {:<6} {:<8} {}",
        entry.id,
        entry.patch_type,
        entry.crc32.as_deref().unwrap_or("-"),
        entry.title
    );
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let app = App::new(&cli)?;

    match cli.command {
        Commands::Crc32 { files } => {
            for (path, crc) in identify::checksum_files(files).await? {
                println!("{}  {}", crate::crc32::format_crc32(crc), path.display());
            }
        }
        Commands::List {
            search,
            base_rom,
            system,
            status,
            difficulty,
            tag,
            fakemons,
            graphics,
            story,
            mechanic,
            rating,
        } => {
            let (_, catalog) = app.open_catalog().await?;
            let mut filters = FilterSet::new();
            for (field, values) in [
                (FilterField::BaseRom, base_rom),
                (FilterField::System, system),
                (FilterField::Status, status),
                (FilterField::Difficulty, difficulty),
                (FilterField::Tags, tag),
                (FilterField::Fakemons, fakemons),
                (FilterField::Graphics, graphics),
                (FilterField::Story, story),
                (FilterField::Mechanics, mechanic),
                (FilterField::Rating, rating),
            ] {
                for value in values {
                    filters.set(field, &value, true);
                }
            }

            let mut library = Library::new(catalog, QueryCache::default(), QueryCache::default());
            let total = library.catalog().len();
            let hits = library.query(search.as_deref().unwrap_or(""), &filters);
            for entry in &hits {
                print_entry_line(entry);
            }
            println!("\n{} of {} entries", hits.len(), total);
        }
        Commands::Filters => {
            let (_, catalog) = app.open_catalog().await?;
            for (field, values) in filter::filter_options(catalog.entries()) {
                println!("{}:", field.label());
                for (value, count) in values {
                    println!("  {} ({})", value, count);
                }
            }
        }
        Commands::Show { id } => {
            let (source, catalog) = app.open_catalog().await?;
            let entry = lookup(&catalog, &id)?;
            println!("{}", entry.title);
            println!("  Id: {}", entry.id);
            println!("  Type: {}", entry.patch_type);
            println!("  Patch: {}", source.describe(&entry.file));
            println!("  CRC32: {}", entry.crc32.as_deref().unwrap_or("-"));
            let meta = &entry.meta;
            for (label, value) in [
                ("Base ROM", entry.base_rom()),
                ("System", meta.system.as_deref()),
                ("Author", meta.author.as_deref()),
                ("Status", meta.status.as_deref()),
                ("Difficulty", meta.difficulty.as_deref()),
                ("Fakemons", meta.fakemons.as_deref()),
                ("Graphics", meta.graphics.as_deref()),
                ("Story", meta.story.as_deref()),
                ("Version", meta.version.as_deref()),
            ] {
                if let Some(value) = value {
                    println!("  {}: {}", label, value);
                }
            }
            if let Some(rating) = meta.rating {
                println!("  Rating: {}", rating);
            }
            if !meta.tags.is_empty() {
                println!("  Tags: {}", meta.tags.join(", "));
            }
            if !meta.mechanics.is_empty() {
                println!("  Mechanics: {}", meta.mechanics.join(", "));
            }
            if let Some(description) = &meta.description {
                println!("\n{}", description);
            }
            if let Some(changelog) = &entry.changelog {
                println!("\nChangelog:\n{}", changelog);
            }
        }
        Commands::Validate { hack, rom } => {
            let (source, catalog) = app.open_catalog().await?;
            let entry = lookup(&catalog, &hack)?;
            let engine = app.new_engine();
            engine.init().await?;

            let sink = Arc::new(DirectorySink::new(app.config.output.dir.clone()));
            let manager = PatchManager::new(engine, source, sink);
            manager.set_selected_hack(Some(entry));

            let rom = engine::read_bin_file(&rom).await?;
            match manager.validate_rom(&rom).await? {
                Validation::Checked(result) => {
                    println!("  Expected: {}", result.expected);
                    println!("  Actual:   {}", result.calculated_crc32);
                }
                Validation::Indeterminate => {
                    println!("{} declares no base ROM checksum", hack);
                }
                Validation::Superseded => {}
            }
            if let Some(message) = manager.validation_message() {
                println!("{}", message);
            }
        }
        Commands::Apply { hack, rom, output } => {
            let (source, catalog) = app.open_catalog().await?;
            let entry = lookup(&catalog, &hack)?;
            let engine = app.new_engine();
            if let Err(e) = engine.init().await {
                println!("Patching disabled: {}", e);
            }

            let output = output.unwrap_or_else(|| app.config.output.dir.clone());
            let sink = Arc::new(DirectorySink::new(output));
            let manager = PatchManager::new(engine, source, sink);
            manager.set_selected_hack(Some(entry));

            println!("Applying patch...");
            println!("  Hack: {}", hack);
            let rom = engine::read_bin_file(&rom).await?;
            println!("  ROM: {} ({} bytes)", rom.file_name, rom.len());

            if manager.can_apply() {
                if let Ok(Validation::Checked(_)) = manager.validate_rom(&rom).await {
                    if let Some(message) = manager.validation_message() {
                        println!("  Validation: {}", message);
                    }
                }
            }

            let start = Instant::now();
            let result = manager.apply_patch(Some(&rom)).await;
            let elapsed = start.elapsed();

            if let Some(status) = manager.status() {
                println!("\n{}", status);
            }
            let path = result?;
            println!("  Output: {}", path.display());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Identify { roms } => {
            let (_, catalog) = app.open_catalog().await?;
            for found in identify::identify_roms(&catalog, roms).await? {
                if found.matches.is_empty() {
                    println!("{}  {}  (no matching hacks)", found.crc32, found.path.display());
                } else {
                    println!(
                        "{}  {}  -> {}",
                        found.crc32,
                        found.path.display(),
                        found.matches.join(", ")
                    );
                }
            }
        }
        Commands::Cache { action } => {
            let cache = app.manifest_cache();
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats()?;
                    println!("Cache directory: {}", cache.dir().display());
                    println!("  Files: {}", stats.files);
                    println!("  Bytes: {}", stats.bytes);
                }
                CacheAction::Clear => {
                    println!("Removed {} cached file(s)", cache.clear()?);
                }
                CacheAction::Prune => {
                    println!("Pruned {} cached file(s)", cache.prune()?);
                }
            }
        }
    }

    Ok(())
}
