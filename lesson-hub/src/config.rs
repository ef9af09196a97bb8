use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use lesson_hub_core::keycloak::KeycloakConfig;
use lesson_hub_core::pipeline::{CalloutDef, CalloutTable, DEFAULT_PLANTUML_URL};

pub const DEFAULT_START_PAGE: &str = "/md/index.md";
pub const DEFAULT_EXCLUDED_DIRS: &str = "node_modules,slides";

#[derive(Parser, Debug, Clone)]
#[command(name = "lesson-hub")]
#[command(about = "Serves a markdown lesson tree with role-gated content")]
pub struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Directory holding the markdown tree
    #[arg(short = 'r', long, default_value = "md")]
    pub content_root: PathBuf,

    /// URL prefix the tree is served under
    #[arg(short, long, default_value = "md/")]
    pub prefix: String,

    /// keycloak.json adapter file; without it preferences live in memory
    #[arg(short, long)]
    pub keycloak_config: Option<PathBuf>,

    /// Rescan the tree when files change
    #[arg(long)]
    pub autoscan: bool,

    /// JSON file adding or overriding callout types
    #[arg(long)]
    pub callouts: Option<PathBuf>,
}

/// Settings taken from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub start_page: String,
    pub plantuml_url: String,
    pub autoscan: bool,
    pub excluded_dirs: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn load_config() -> Config {
    Config {
        start_page: env_or("START_PAGE", DEFAULT_START_PAGE),
        plantuml_url: env_or("PLANTUML_URL", DEFAULT_PLANTUML_URL),
        autoscan: env_or("AUTOSCAN", "false") == "true",
        excluded_dirs: parse_list(&env_or("EXCLUDED_DIRS", DEFAULT_EXCLUDED_DIRS)),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Everything the server needs, command line and environment combined.
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: String,
    pub content_root: PathBuf,
    pub prefix: String,
    pub start_page: String,
    pub plantuml_url: String,
    pub autoscan: bool,
    pub excluded_dirs: Vec<String>,
}

impl Settings {
    pub fn new(cli: &Cli, config: Config) -> Self {
        Self {
            addr: cli.addr.clone(),
            content_root: cli.content_root.clone(),
            prefix: cli.prefix.clone(),
            start_page: config.start_page,
            plantuml_url: config.plantuml_url,
            autoscan: cli.autoscan || config.autoscan,
            excluded_dirs: config.excluded_dirs,
        }
    }

    /// Defaults for a tree at `content_root`, ignoring the environment.
    pub fn for_root(content_root: impl Into<PathBuf>) -> Self {
        Self {
            addr: "127.0.0.1:0".into(),
            content_root: content_root.into(),
            prefix: "md/".into(),
            start_page: DEFAULT_START_PAGE.into(),
            plantuml_url: DEFAULT_PLANTUML_URL.into(),
            autoscan: false,
            excluded_dirs: parse_list(DEFAULT_EXCLUDED_DIRS),
        }
    }
}

pub fn load_keycloak(path: &Path) -> Result<KeycloakConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    KeycloakConfig::from_json(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// The built-in callout table, extended by `path` when given. Broken alias
/// chains in the file are a startup error.
pub fn load_callouts(path: Option<&Path>) -> Result<CalloutTable> {
    let Some(path) = path else {
        return Ok(CalloutTable::obsidian());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let defs: BTreeMap<String, CalloutDef> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(CalloutTable::obsidian_with(defs)?)
}
