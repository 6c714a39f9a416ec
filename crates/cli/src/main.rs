use bridge_core::{
    infer_template_id, resolve_mapping_dir, resolve_template_dir, BridgeConfig, MappingRepository,
    TemplateStore, TranslationContext, Translator,
};
use bridge_types::TemplateId;
use clap::{Parser, Subcommand};
use fhir::{parse_resource, parse_resource_yaml, r4, FhirPath};
use openehr::FlatRecord;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "openEHR flat / FHIR mapping CLI")]
struct Cli {
    /// Directory of mapping YAML files (default: BRIDGE_MAPPING_DIR or ./mappings)
    #[arg(long, global = true)]
    mapping_dir: Option<PathBuf>,
    /// Directory of web template JSON files (default: BRIDGE_TEMPLATE_DIR or ./templates)
    #[arg(long, global = true)]
    template_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a flat composition into FHIR resources
    ToFhir {
        /// Template id (optional, inferred from the first flat path)
        #[arg(long)]
        template_id: Option<String>,
        /// Flat composition JSON file
        input: PathBuf,
    },
    /// Translate a FHIR resource or Bundle into a flat composition
    ToOpenehr {
        /// Template id
        #[arg(long)]
        template_id: String,
        /// FHIR JSON (or YAML) file
        input: PathBuf,
    },
    /// Load every mapping file and report the ones that fail
    CheckMappings {
        /// Mapping directory (overrides --mapping-dir)
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("bridge=warn".parse()?))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mapping_override = cli.mapping_dir.or_else(|| env_path("BRIDGE_MAPPING_DIR"));
    let template_override = cli.template_dir.or_else(|| env_path("BRIDGE_TEMPLATE_DIR"));

    match cli.command {
        Some(Commands::ToFhir { template_id, input }) => {
            let config = config(mapping_override, template_override)?;
            let record = FlatRecord::from_json(&read(&input)?)?;
            let template_id = match template_id {
                Some(id) => TemplateId::new(id)?,
                None => infer_template_id(&record)?,
            };
            let (repository, store) = load(&config)?;
            let template = store.get(&template_id)?;
            let types = r4()?;
            let evaluator = FhirPath::new(types);
            let ctx = context(&config, &repository, &evaluator, template_id)?;
            let collection = Translator.record_to_resource(&ctx, &record, &*template)?;
            println!("{}", serde_json::to_string_pretty(&collection.to_json(types))?);
        }
        Some(Commands::ToOpenehr { template_id, input }) => {
            let config = config(mapping_override, template_override)?;
            let template_id = TemplateId::new(template_id)?;
            let (repository, store) = load(&config)?;
            let template = store.get(&template_id)?;
            let types = r4()?;
            let text = read(&input)?;
            let parsed = match input.extension().and_then(|e| e.to_str()) {
                Some("yml" | "yaml") => parse_resource_yaml(&text, types)?,
                _ => parse_resource(&text, types)?,
            };
            let evaluator = FhirPath::new(types);
            let ctx = context(&config, &repository, &evaluator, template_id)?;
            let record =
                Translator.resource_to_record(&ctx, &parsed.graph, &[parsed.root], &*template)?;
            println!("{}", serde_json::to_string_pretty(&record.to_json_value())?);
        }
        Some(Commands::CheckMappings { dir }) => {
            let dir = resolve_mapping_dir(dir.or(mapping_override))?;
            let (repository, report) = MappingRepository::load_dir(&dir)?;
            println!("Mapping directory: {}", dir.display());
            print!("{report}");
            for id in repository.template_ids() {
                println!("template: {id}");
            }
            if !report.is_clean() {
                let failed = report.failed.len();
                return Err(format!("{failed} mapping file(s) failed to load").into());
            }
        }
        None => {
            println!("Use 'bridge --help' for commands");
        }
    }

    Ok(())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn config(
    mapping: Option<PathBuf>,
    template: Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let language = std::env::var("BRIDGE_DEFAULT_LANGUAGE").unwrap_or_else(|_| "en".into());
    let territory = std::env::var("BRIDGE_DEFAULT_TERRITORY").unwrap_or_else(|_| "DE".into());
    Ok(BridgeConfig::new(
        resolve_mapping_dir(mapping)?,
        resolve_template_dir(template)?,
        language,
        territory,
        String::new(),
    )?)
}

fn load(
    config: &BridgeConfig,
) -> Result<(MappingRepository, TemplateStore), Box<dyn std::error::Error>> {
    let (repository, report) = MappingRepository::load_dir(config.mapping_dir())?;
    if !report.is_clean() {
        eprintln!(
            "Warning: {} mapping file(s) skipped, run check-mappings for details",
            report.failed.len()
        );
    }
    Ok((repository, TemplateStore::new(config.template_dir())))
}

fn context<'a>(
    config: &BridgeConfig,
    repository: &'a MappingRepository,
    evaluator: &'a FhirPath<'static>,
    template_id: TemplateId,
) -> Result<TranslationContext<'a>, Box<dyn std::error::Error>> {
    Ok(TranslationContext::new(repository, r4()?, evaluator, template_id)
        .with_defaults(config.default_language(), config.default_territory()))
}

fn read(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()).into())
}
