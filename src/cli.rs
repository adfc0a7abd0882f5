use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::EngineOptions;
use crate::container::{ContainerLocation, ContainerSpec, ScanPolicy};
use crate::identity::IdentityPolicy;
use crate::scan::scan_archives;

#[derive(Debug, Clone, Parser)]
#[command(name = "annocache")]
#[command(about = "Scan Java class files for annotations and cache the results per container")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Container in classpath order, optionally suffixed with `:seed`,
    /// `:partial`, `:excluded` or `:external`. Nested archives use
    /// `outer.war!/WEB-INF/lib/inner.jar`.
    #[arg(short = 'c', long = "container", value_name = "PATH[:POLICY]")]
    pub containers: Vec<String>,

    /// Directory whose archives are appended as external containers.
    #[arg(long = "lib", value_name = "DIR")]
    pub libs: Vec<PathBuf>,

    /// LMDB file, or an existing directory for one file per index.
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[arg(long)]
    pub no_cache: bool,

    #[arg(long)]
    pub read_only: bool,

    #[arg(long)]
    pub always_valid: bool,

    /// Include a content digest in container identities.
    #[arg(long)]
    pub digest: bool,

    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    #[arg(long)]
    pub log_queries: bool,

    /// Package prefix treated as platform types by strict queries.
    #[arg(long = "platform", value_name = "PREFIX")]
    pub platform: Vec<String>,

    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Open the module and summarize its containers.
    Scan,
    Annotated {
        annotation: String,

        #[arg(long)]
        inherited: bool,

        #[arg(long)]
        strict: bool,

        /// Report classes from every container, not only seed and partial ones.
        #[arg(long)]
        all: bool,
    },
    Assignable {
        type_name: String,

        #[arg(long)]
        strict: bool,

        #[arg(long)]
        all: bool,
    },
    Package {
        prefix: String,

        #[arg(long)]
        all: bool,
    },
    /// Superclass chain and inherited annotations of one class.
    Chain { class_name: String },
    Invalidate { container: String },
    Stats,
    Clear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

impl Cli {
    /// Environment first, then flags on top.
    pub fn engine_options(&self) -> Result<EngineOptions> {
        let mut options = EngineOptions::from_env()?;
        if let Some(db) = self.db.clone() {
            options.cache_path = Some(db);
        }
        options.disabled |= self.no_cache;
        options.read_only |= self.read_only;
        options.always_valid |= self.always_valid;
        options.log_queries |= self.log_queries;
        if self.digest {
            options.identity_policy = IdentityPolicy::ContentDigest;
        }
        if let Some(n) = self.threads {
            options.scan_threads = n.max(1);
        }
        if !self.platform.is_empty() {
            options.platform_allow_list = self.platform.clone();
        }
        Ok(options)
    }

    pub fn container_specs(&self) -> Result<Vec<ContainerSpec>> {
        let mut specs: Vec<ContainerSpec> = self
            .containers
            .iter()
            .map(|raw| ContainerSpec::parse(raw))
            .collect();
        for dir in &self.libs {
            let archives = scan_archives(dir)
                .with_context(|| format!("Failed to scan library directory: {}", dir.display()))?;
            specs.extend(
                archives
                    .into_iter()
                    .map(|p| ContainerSpec::new(ContainerLocation::Archive(p), ScanPolicy::External)),
            );
        }
        Ok(specs)
    }
}
