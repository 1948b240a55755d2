//! Command-line runner for the suitability engine.
//!
//! Loads one or more recipes plus their raster assets from JSON, evaluates
//! every recipe as a scenario and prints the summary statistics as JSON.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use seplan_core::compositor::Diagnostics;
use seplan_core::recipe::{RecordError, ValidationReport};
use seplan_core::stats::Rollup;
use seplan_core::{
    rollup, validate_recipe, AreaOfInterest, CancelToken, Dispatcher, EngineConfig, LayerCatalog, LayerSelection,
    LocalBackend, Raster, RecipeRecord, Scenario, SummaryStats, SUMMARY_STATS_VERSION,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "seplan", about = "Restoration suitability index and zonal statistics")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute suitability statistics for one or more recipes.
    Compute(ComputeArgs),

    /// Check recipes and report every invalid record.
    Validate {
        #[arg(short, long, required = true)]
        recipe: Vec<PathBuf>,

        /// Layer catalog JSON used to complete id-only records.
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct ComputeArgs {
    /// Recipe JSON file. Repeat to compare several scenarios.
    #[arg(short, long, required = true)]
    recipe: Vec<PathBuf>,

    /// Area of interest JSON. Overrides the AOI stored in the recipes.
    #[arg(short, long)]
    aoi: Option<PathBuf>,

    /// Directory holding one raster JSON per asset reference
    /// (`<assets>/<asset_ref>.json`).
    #[arg(long)]
    assets: PathBuf,

    /// Layer catalog JSON. Recipe records naming a catalogued id take its
    /// asset reference and descriptive fields.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Engine configuration JSON; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the statistics here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write each scenario's suitability raster into this directory.
    #[arg(long)]
    export_raster: Option<PathBuf>,

    /// Drop invalid constraints instead of failing.
    #[arg(long)]
    repair: bool,
}

// ── Output ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Report {
    version: u32,
    scenarios: Vec<ScenarioReport>,
}

#[derive(Serialize)]
struct ScenarioReport {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    stats: Vec<SummaryStats>,
    rollup: Rollup,
    diagnostics: Diagnostics,
    removed_constraints: Vec<RecordError>,
    elapsed_ms: u64,
}

// ── Loading ───────────────────────────────────────────────────────────────────

struct Loaded {
    id: String,
    selection: LayerSelection,
    aoi: AreaOfInterest,
    removed: Vec<RecordError>,
}

fn scenario_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn load_catalog(path: Option<&Path>) -> Result<Option<LayerCatalog>> {
    path.map(|p| LayerCatalog::load(p).with_context(|| format!("reading catalog {}", p.display())))
        .transpose()
}

fn read_recipe(path: &Path, catalog: Option<&LayerCatalog>) -> Result<RecipeRecord> {
    let mut recipe = RecipeRecord::load(path).with_context(|| format!("reading recipe {}", path.display()))?;
    if let Some(catalog) = catalog {
        recipe
            .resolve(catalog)
            .with_context(|| format!("resolving recipe {} against the catalog", path.display()))?;
    }
    Ok(recipe)
}

fn load_recipe(
    path: &Path,
    catalog: Option<&LayerCatalog>,
    aoi_override: Option<&AreaOfInterest>,
    repair: bool,
) -> Result<Loaded> {
    let mut recipe = read_recipe(path, catalog)?;
    let removed = if repair {
        recipe.filter_invalid_constraints()
    } else {
        Vec::new()
    };
    let selection = recipe
        .to_selection()
        .with_context(|| format!("recipe {} is invalid", path.display()))?;
    let aoi = match (aoi_override, recipe.aoi) {
        (Some(aoi), _) => aoi.clone(),
        (None, Some(aoi)) => aoi,
        (None, None) => bail!("recipe {} has no AOI and --aoi was not given", path.display()),
    };
    Ok(Loaded {
        id: scenario_id(path),
        selection,
        aoi,
        removed,
    })
}

/// Load every raster the selections reference. All rasters must share a grid.
fn load_assets(dir: &Path, selections: &[&LayerSelection]) -> Result<LocalBackend> {
    let mut refs = BTreeSet::new();
    for selection in selections {
        refs.extend(selection.benefits.iter().map(|l| l.asset_ref.clone()));
        refs.extend(selection.costs.iter().map(|l| l.asset_ref.clone()));
        refs.extend(selection.constraints.iter().map(|l| l.asset_ref.clone()));
    }
    if refs.is_empty() {
        bail!("recipes reference no raster assets");
    }

    let mut rasters = Vec::with_capacity(refs.len());
    for asset_ref in refs {
        let path = dir.join(format!("{asset_ref}.json"));
        let text = fs::read_to_string(&path).with_context(|| format!("reading asset {}", path.display()))?;
        let raster = Raster::from_json(&text).with_context(|| format!("parsing asset {}", path.display()))?;
        rasters.push((asset_ref, raster));
    }
    info!(assets = rasters.len(), dir = %dir.display(), "loaded raster assets");
    Ok(LocalBackend::from_assets(rasters)?)
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn compute(args: &ComputeArgs) -> Result<()> {
    let config = match args.config.as_deref() {
        Some(p) => EngineConfig::load(p).with_context(|| format!("reading config {}", p.display()))?,
        None => EngineConfig::default(),
    };
    let aoi_override = match args.aoi.as_deref() {
        Some(p) => {
            let text = fs::read_to_string(p).with_context(|| format!("reading AOI {}", p.display()))?;
            Some(serde_json::from_str::<AreaOfInterest>(&text).with_context(|| format!("parsing AOI {}", p.display()))?)
        }
        None => None,
    };

    let catalog = load_catalog(args.catalog.as_deref())?;

    let loaded = args
        .recipe
        .iter()
        .map(|p| load_recipe(p, catalog.as_ref(), aoi_override.as_ref(), args.repair))
        .collect::<Result<Vec<_>>>()?;
    let ids: BTreeSet<&str> = loaded.iter().map(|l| l.id.as_str()).collect();
    if ids.len() != loaded.len() {
        bail!("recipes to compare must have unique file names");
    }

    let selections: Vec<&LayerSelection> = loaded.iter().map(|l| &l.selection).collect();
    let backend = Arc::new(load_assets(&args.assets, &selections)?);
    let dispatcher = Dispatcher::new(backend.clone());

    let scenarios: Vec<Scenario> = loaded
        .iter()
        .map(|l| Scenario::new(&l.id, &l.selection, l.aoi.clone(), config.clone()))
        .collect();

    let mut failed = 0usize;
    let mut reports = Vec::with_capacity(scenarios.len());
    for ((id, outcome), l) in dispatcher.run(&scenarios).into_iter().zip(&loaded) {
        let report = match outcome {
            Ok(out) => {
                if let Some(dir) = args.export_raster.as_deref() {
                    let region = l.aoi.primary()?;
                    let raster = out
                        .result
                        .suitability_index
                        .materialize(&*backend, region, &CancelToken::new(&id))?;
                    fs::create_dir_all(dir)?;
                    let path = dir.join(format!("{id}.json"));
                    fs::write(&path, raster.to_json()?).with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "wrote suitability raster");
                }
                ScenarioReport {
                    id,
                    error: None,
                    rollup: rollup(&out.stats),
                    stats: out.stats.clone(),
                    diagnostics: out.diagnostics.clone(),
                    removed_constraints: l.removed.clone(),
                    elapsed_ms: out.elapsed_ms,
                }
            }
            Err(e) => {
                failed += 1;
                warn!(scenario = %id, error = %e, "scenario failed");
                ScenarioReport {
                    id,
                    error: Some(e.to_string()),
                    stats: Vec::new(),
                    rollup: Rollup::new(),
                    diagnostics: Diagnostics::default(),
                    removed_constraints: l.removed.clone(),
                    elapsed_ms: 0,
                }
            }
        };
        reports.push(report);
    }

    let report = Report {
        version: SUMMARY_STATS_VERSION,
        scenarios: reports,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match args.output.as_deref() {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "wrote statistics");
        }
        None => println!("{json}"),
    }

    if failed > 0 {
        bail!("{failed} of {} scenarios failed", report.scenarios.len());
    }
    Ok(())
}

fn validate(recipes: &[PathBuf], catalog: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(catalog)?;
    let mut reports: Vec<(String, ValidationReport)> = Vec::new();
    for path in recipes {
        let recipe = read_recipe(path, catalog.as_ref())?;
        reports.push((scenario_id(path), validate_recipe(&recipe)));
    }
    let errors: usize = reports.iter().map(|(_, r)| r.total_errors()).sum();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    if errors > 0 {
        bail!("{errors} invalid records");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("seplan=info,seplan_core=info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Compute(args) => compute(&args),
        Command::Validate { recipe, catalog } => validate(&recipe, catalog.as_deref()),
    }
}
