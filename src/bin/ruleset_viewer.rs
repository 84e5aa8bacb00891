//! # Ruleset Viewer CLI
//!
//! Command-line tool for inspecting and editing the rules in a rule store.
//!
//! Usage:
//!   ruleset_viewer show <project> [--since RFC3339] [--json]
//!   ruleset_viewer version <project>
//!   ruleset_viewer add <project> <definition> --bug <system/id> --user <user>
//!   ruleset_viewer set-active <project> <rule_id> <true|false> --user <user>

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rulecache::config::{CacheConfig, ENV_DB_PATH};
use rulecache::store::validation::generate_rule_id;
use rulecache::{
    BugId, FailureAssociationRule, ReadContext, Ruleset, RulesetCache, SqliteRuleStore,
    SystemClock,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ruleset_viewer")]
#[command(about = "Inspect and edit failure association rules", long_about = None)]
struct Cli {
    /// Path to the rule database
    #[arg(short, long, env = ENV_DB_PATH, default_value = "./var/data/rules.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active rules of a project, most recently updated first
    Show {
        /// Project name
        project: String,

        /// Only rules updated after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the rules version of a project
    Version {
        /// Project name
        project: String,
    },

    /// Create a new rule
    Add {
        /// Project name
        project: String,

        /// Rule definition, e.g. 'reason LIKE "%timeout%"'
        definition: String,

        /// Associated bug, as system/id
        #[arg(long)]
        bug: BugId,

        /// User recorded as the author of the change
        #[arg(long, default_value = "weetbix")]
        user: String,
    },

    /// Activate or deactivate an existing rule
    SetActive {
        /// Project name
        project: String,

        /// Rule ID
        rule_id: String,

        /// New state
        #[arg(action = clap::ArgAction::Set)]
        active: bool,

        /// User recorded as the author of the change
        #[arg(long, default_value = "weetbix")]
        user: String,
    },
}

#[derive(Serialize)]
struct RuleView<'a> {
    rule_id: &'a str,
    last_updated: DateTime<Utc>,
    rule_definition: &'a str,
}

#[derive(Serialize)]
struct ShowOutput<'a> {
    project: &'a str,
    rules_version: DateTime<Utc>,
    rules: Vec<RuleView<'a>>,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let clock = Arc::new(SystemClock);
    let store = SqliteRuleStore::open(&cli.db, clock.clone()).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Show {
            project,
            since,
            json,
        } => {
            let ruleset = load_ruleset(store, clock, &project)?;
            let rules = match since {
                Some(t) => ruleset.active_rules_updated_since(t),
                None => ruleset.active_rules_sorted(),
            };

            if json {
                let output = ShowOutput {
                    project: ruleset.project(),
                    rules_version: ruleset.rules_version(),
                    rules: rules
                        .iter()
                        .map(|rule| RuleView {
                            rule_id: rule.rule_id(),
                            last_updated: rule.last_updated(),
                            rule_definition: rule.predicate().definition(),
                        })
                        .collect(),
                };
                let text = serde_json::to_string_pretty(&output).map_err(|e| e.to_string())?;
                println!("{}", text);
            } else {
                println!(
                    "📋 {} active rules for '{}' (version {}):\n",
                    rules.len(),
                    project,
                    ruleset.rules_version()
                );
                for rule in rules {
                    println!(
                        "{} | {} | {}",
                        rule.rule_id(),
                        rule.last_updated().to_rfc3339(),
                        rule.predicate().definition()
                    );
                }
            }
        }

        Commands::Version { project } => {
            let ruleset = load_ruleset(store, clock, &project)?;
            let summary = ruleset.summary();
            println!("Project:       {}", summary.project);
            println!("Rules Version: {}", summary.rules_version.to_rfc3339());
            println!("Active Rules:  {}", summary.active_rules);
        }

        Commands::Add {
            project,
            definition,
            bug,
            user,
        } => {
            let rule = FailureAssociationRule::new(project, generate_rule_id(), definition)
                .with_bug(bug);
            let stored = store.create_rule(&rule, &user).map_err(|e| e.to_string())?;
            println!(
                "✅ Created rule {} at {}",
                stored.rule_id,
                stored.last_updated.to_rfc3339()
            );
        }

        Commands::SetActive {
            project,
            rule_id,
            active,
            user,
        } => {
            let rule = store
                .read_rule(&project, &rule_id)
                .map_err(|e| e.to_string())?
                .with_active(active);
            let stored = store.update_rule(&rule, &user).map_err(|e| e.to_string())?;
            println!(
                "{} Rule {} is now {} (updated {})",
                if active { "✅" } else { "🚫" },
                stored.rule_id,
                if active { "active" } else { "inactive" },
                stored.last_updated.to_rfc3339()
            );
        }
    }

    Ok(())
}

/// Loads a project through the cache, the same path the server uses.
fn load_ruleset(
    store: SqliteRuleStore,
    clock: Arc<SystemClock>,
    project: &str,
) -> Result<Arc<Ruleset>, String> {
    let config = CacheConfig::default();
    let ctx = match config.read_timeout() {
        Some(timeout) => ReadContext::with_timeout(timeout),
        None => ReadContext::background(),
    };
    let cache = RulesetCache::new(Arc::new(store), clock, &config);
    cache.ruleset(&ctx, project).map_err(|e| e.to_string())
}
