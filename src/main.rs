use anyhow::{Context, Result};
use annocache::cli::{Cli, Commands, OutputFormat};
use annocache::config::clear_db;
use annocache::container::ContainerLocation;
use annocache::engine::AnnotationEngine;
use annocache::query::QueryOptions;
use annocache::view::{ModuleView, Shadowed};
use clap::Parser;
use serde::Serialize;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let options = cli.engine_options()?;

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = options.resolve_cache_path()?;
            clear_db(&db_path)?;
            emit(
                cli.format,
                &ClearResult {
                    db_path: db_path.to_string_lossy().to_string(),
                },
                |r| format!("cleared {}", r.db_path),
            )?;
        }
        Commands::Stats => {
            let engine = AnnotationEngine::open(options)?;
            let stats = engine.stats()?;
            emit(cli.format, &stats, |s| {
                format!("store: {}\nstored_indexes: {}", s.store, s.stored_indexes)
            })?;
        }
        Commands::Invalidate { container } => {
            let engine = AnnotationEngine::open(options)?;
            let location = ContainerLocation::parse(&container);
            engine
                .invalidate(&location)
                .with_context(|| format!("Failed to invalidate {container}"))?;
            emit(
                cli.format,
                &InvalidateResult {
                    container: location.logical_path(),
                },
                |r| format!("invalidated {}", r.container),
            )?;
        }
        command => {
            let specs = cli.container_specs()?;
            if specs.is_empty() {
                anyhow::bail!("No containers given; use -c PATH[:policy] or --lib DIR");
            }
            let engine = AnnotationEngine::open(options)?;
            let start = Instant::now();
            let view = engine.open_module(&specs)?;
            let open_ms = start.elapsed().as_millis() as u64;
            run_query(&engine, &view, command, cli.format, open_ms)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("annocache=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_query(
    engine: &AnnotationEngine,
    view: &ModuleView,
    command: Commands,
    format: OutputFormat,
    open_ms: u64,
) -> Result<()> {
    let base = engine.query_options();
    let select = |strict: bool, all: bool| -> QueryOptions {
        let mut q = base.clone();
        q.strict = strict;
        if all {
            q = q.all_policies();
        }
        q
    };

    match command {
        Commands::Scan => {
            let summary = ScanSummary::from_view(view, open_ms, engine.decode_calls());
            emit(format, &summary, |s| {
                let mut out = format!("classes: {}\ndecoded: {}\n", s.classes, s.decoded_classes);
                for c in &s.containers {
                    out.push_str(&format!(
                        "- {} [{}] {} classes{}\n",
                        c.name,
                        c.policy,
                        c.classes,
                        if c.incomplete { " (incomplete)" } else { "" }
                    ));
                }
                for hidden in &s.shadowed {
                    out.push_str(&format!(
                        "shadowed: {} in {} by {}\n",
                        hidden.class_name, hidden.shadowed, hidden.winner
                    ));
                }
                out
            })
        }
        Commands::Annotated {
            annotation,
            inherited,
            strict,
            all,
        } => {
            let classes =
                engine.classes_with_annotation(view, &annotation, inherited, &select(strict, all))?;
            emit_names("annotated", &annotation, classes, format)
        }
        Commands::Assignable {
            type_name,
            strict,
            all,
        } => {
            let classes = engine.classes_assignable_to(view, &type_name, &select(strict, all))?;
            emit_names("assignable", &type_name, classes, format)
        }
        Commands::Package { prefix, all } => {
            let classes = engine.classes_in_package(view, &prefix, &select(false, all));
            emit_names("package", &prefix, classes, format)
        }
        Commands::Chain { class_name } => {
            let result = ChainResult {
                super_chain: view.super_chain(&class_name),
                inherited_annotations: view
                    .inherited_annotations(&class_name)
                    .iter()
                    .cloned()
                    .collect(),
                container: view.container_of(&class_name).map(|c| c.name()),
                class_name,
            };
            emit(format, &result, |r| {
                let mut out = r.super_chain.join(" -> ");
                out.push('\n');
                for a in &r.inherited_annotations {
                    out.push_str(&format!("@{a}\n"));
                }
                out
            })
        }
        Commands::Invalidate { .. } | Commands::Stats | Commands::Clear => Ok(()),
    }
}

fn emit_names(query: &str, target: &str, classes: Vec<String>, format: OutputFormat) -> Result<()> {
    let result = QueryResult {
        query: query.to_string(),
        target: target.to_string(),
        count: classes.len(),
        classes,
    };
    emit(format, &result, |r| r.classes.join("\n"))
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl Fn(&T) -> String) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Text => text(value),
    };
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ContainerSummary {
    name: String,
    policy: String,
    signature: String,
    classes: usize,
    incomplete: bool,
    failures: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
struct ScanSummary {
    classes: usize,
    decoded_classes: u64,
    duration_ms: u64,
    containers: Vec<ContainerSummary>,
    shadowed: Vec<Shadowed>,
}

impl ScanSummary {
    fn from_view(view: &ModuleView, duration_ms: u64, decoded_classes: u64) -> Self {
        let table = view.container_table();
        let containers = view
            .containers()
            .iter()
            .zip(table.rows())
            .map(|(c, row)| ContainerSummary {
                name: row.name.clone(),
                policy: row.policy.to_string(),
                signature: row.signature.clone(),
                classes: c.index.len(),
                incomplete: c.incomplete(),
                failures: c.index.failures.clone(),
            })
            .collect();
        Self {
            classes: view.len(),
            decoded_classes,
            duration_ms,
            containers,
            shadowed: view.shadowed().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryResult {
    query: String,
    target: String,
    count: usize,
    classes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChainResult {
    class_name: String,
    container: Option<String>,
    super_chain: Vec<String>,
    inherited_annotations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InvalidateResult {
    container: String,
}

#[derive(Debug, Serialize)]
struct ClearResult {
    db_path: String,
}
