//! Task orchestration CLI.
//!
//! Operates on `.tasktree/` under `--root`. Every command prints its result
//! as pretty JSON on stdout; failures print `<code>: <message>` on stderr and
//! exit with a code from [`tasktree::exit_codes`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use tasktree::core::context::ContextOptions;
use tasktree::core::creation::NewNode;
use tasktree::core::types::{Action, MergeStrategy};
use tasktree::dispatch::DisableOptions;
use tasktree::graph::{Document, NodeKind};
use tasktree::io::config::load_config;
use tasktree::io::layout::{InitOptions, ProjectPaths, init_project};
use tasktree::io::store::FileStore;
use tasktree::io::vcs::GitVcs;
use tasktree::validate::validate_project;
use tasktree::{Orchestrator, exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "tasktree",
    version,
    about = "Planning/execution task graphs with isolated, version-controlled dispatch"
)]
struct Cli {
    /// Project root containing `.tasktree/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Workspace (independent task graph) to operate on.
    #[arg(short, long, global = true, default_value = "default")]
    workspace: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.tasktree/` scaffolding.
    Init {
        /// Rewrite config and `.gitignore` of an existing project.
        #[arg(short, long)]
        force: bool,
    },
    /// Check layout, config, graphs and the dispatch session.
    Validate,
    /// Print the workspace graph.
    Show,
    /// Create a node.
    Create(CreateArgs),
    /// Remove a node and its subtree.
    Remove { node_id: String },
    /// Apply a lifecycle action (start, submit, complete, fail, cancel, retry, reopen).
    Transition {
        node_id: String,
        action: Action,
        #[arg(short, long)]
        conclusion: Option<String>,
    },
    /// Print the aggregated context of a node.
    Context(ContextArgs),
    /// Append a log entry to a node.
    Log { node_id: String, message: String },
    /// Add or expire a cross-node reference.
    Reference {
        #[command(subcommand)]
        command: LinkCommand,
    },
    /// Attach or expire a document.
    Document {
        #[command(subcommand)]
        command: DocumentCommand,
    },
    /// Mark a node as a context boundary (or clear the mark).
    Isolate {
        node_id: String,
        #[arg(long)]
        off: bool,
    },
    /// Delegate execution nodes to an isolated worker.
    Dispatch {
        #[command(subcommand)]
        command: DispatchCommand,
    },
}

#[derive(Args)]
struct CreateArgs {
    node_id: String,
    #[arg(long = "type", value_name = "planning|execution")]
    kind: NodeKind,
    #[arg(short, long)]
    parent: Option<String>,
    #[arg(short, long)]
    title: String,
    #[arg(long)]
    problem: Option<String>,
    #[arg(long)]
    isolate: bool,
    /// Execution node that verifies this one.
    #[arg(long)]
    verified_by: Option<String>,
}

#[derive(Args)]
struct ContextArgs {
    node_id: String,
    /// Override `context.max_log_entries`.
    #[arg(long)]
    max_log: Option<usize>,
    #[arg(long)]
    no_log: bool,
    /// Newest log entries first.
    #[arg(long)]
    reverse_log: bool,
    #[arg(long)]
    no_problem: bool,
}

#[derive(Subcommand)]
enum LinkCommand {
    Add { node_id: String, target: String },
    Expire { node_id: String, target: String },
}

#[derive(Subcommand)]
enum DocumentCommand {
    Add {
        node_id: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
        /// Read content from this file instead of `--content`.
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,
        #[arg(long)]
        content: Option<String>,
    },
    Expire { node_id: String, document_id: String },
}

#[derive(Subcommand)]
enum DispatchCommand {
    /// Enable dispatch mode for the workspace.
    Enable {
        /// Record timestamps instead of using git.
        #[arg(long)]
        no_vcs: bool,
    },
    /// Start dispatching an implementing execution node.
    Prepare {
        node_id: String,
        /// Print only the markdown brief.
        #[arg(long)]
        brief: bool,
    },
    /// Report the worker's result.
    Complete {
        node_id: String,
        #[arg(long)]
        failed: bool,
        #[arg(short, long)]
        conclusion: Option<String>,
    },
    /// Report the verifier's verdict for a node in testing.
    Verify {
        node_id: String,
        #[arg(long)]
        failed: bool,
        #[arg(short, long)]
        conclusion: Option<String>,
    },
    /// Disable dispatch mode and merge the isolation branch.
    Disable {
        #[arg(long, value_name = "sequential|squash|cherry-pick|skip")]
        strategy: Option<MergeStrategy>,
        #[arg(long, conflicts_with = "keep_branch")]
        delete_branch: bool,
        #[arg(long)]
        keep_branch: bool,
        #[arg(short, long)]
        message: Option<String>,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        let code = match err.downcast_ref::<tasktree::Error>() {
            Some(typed) => {
                eprintln!("{}: {:#}", typed.code(), err);
                exit_codes::for_error(typed)
            }
            None => {
                eprintln!("{:#}", err);
                exit_codes::INVALID
            }
        };
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    let ws = cli.workspace.as_str();
    match cli.command {
        Command::Init { force } => {
            let paths = init_project(root, &InitOptions { force })?;
            print_json(&serde_json::json!({
                "initialized": paths.tasktree_dir.display().to_string(),
            }))
        }
        Command::Validate => print_json(&validate_project(root)?),
        Command::Show => print_json(&open(root)?.graph(ws)?),
        Command::Create(args) => {
            let new = NewNode {
                id: args.node_id,
                kind: args.kind,
                parent_id: args.parent,
                title: args.title,
                problem: args.problem,
                isolate: args.isolate,
                verified_by: args.verified_by,
            };
            print_json(&open(root)?.create_node(ws, new)?)
        }
        Command::Remove { node_id } => print_json(&serde_json::json!({
            "removed": open(root)?.remove_node(ws, &node_id)?,
        })),
        Command::Transition {
            node_id,
            action,
            conclusion,
        } => print_json(
            &open(root)?.transition(ws, &node_id, action, conclusion.as_deref())?,
        ),
        Command::Context(args) => {
            let orch = open(root)?;
            let options = context_options(orch.default_context_options(), &args);
            print_json(&orch.get_context(ws, &args.node_id, &options)?)
        }
        Command::Log { node_id, message } => {
            open(root)?.append_log(ws, &node_id, &message)?;
            print_json(&serde_json::json!({ "node_id": node_id, "logged": true }))
        }
        Command::Reference { command } => match command {
            LinkCommand::Add { node_id, target } => {
                let added = open(root)?.add_reference(ws, &node_id, &target)?;
                print_json(&serde_json::json!({ "node_id": node_id, "target": target, "added": added }))
            }
            LinkCommand::Expire { node_id, target } => {
                open(root)?.expire_reference(ws, &node_id, &target)?;
                print_json(&serde_json::json!({ "node_id": node_id, "target": target, "expired": true }))
            }
        },
        Command::Document { command } => match command {
            DocumentCommand::Add {
                node_id,
                id,
                title,
                file,
                content,
            } => {
                let content = match file {
                    Some(path) => std::fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?,
                    None => content.unwrap_or_default(),
                };
                open(root)?.add_document(ws, &node_id, Document { id: id.clone(), title, content })?;
                print_json(&serde_json::json!({ "node_id": node_id, "document_id": id }))
            }
            DocumentCommand::Expire {
                node_id,
                document_id,
            } => {
                open(root)?.expire_document(ws, &node_id, &document_id)?;
                print_json(&serde_json::json!({ "node_id": node_id, "document_id": document_id, "expired": true }))
            }
        },
        Command::Isolate { node_id, off } => {
            open(root)?.set_isolate(ws, &node_id, !off)?;
            print_json(&serde_json::json!({ "node_id": node_id, "isolate": !off }))
        }
        Command::Dispatch { command } => run_dispatch(root, ws, command),
    }
}

fn run_dispatch(root: &Path, ws: &str, command: DispatchCommand) -> Result<()> {
    let orch = open(root)?;
    match command {
        DispatchCommand::Enable { no_vcs } => print_json(&orch.dispatch_enable(ws, !no_vcs)?),
        DispatchCommand::Prepare { node_id, brief } => {
            let outcome = orch.dispatch_prepare(ws, &node_id)?;
            if brief {
                print!("{}", outcome.brief);
                return Ok(());
            }
            print_json(&outcome)
        }
        DispatchCommand::Complete {
            node_id,
            failed,
            conclusion,
        } => print_json(&orch.dispatch_complete(ws, &node_id, !failed, conclusion.as_deref())?),
        DispatchCommand::Verify {
            node_id,
            failed,
            conclusion,
        } => print_json(&orch.dispatch_verify(ws, &node_id, !failed, conclusion.as_deref())?),
        DispatchCommand::Disable {
            strategy,
            delete_branch,
            keep_branch,
            message,
        } => {
            let options = DisableOptions {
                delete_branch: match (delete_branch, keep_branch) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                message,
            };
            print_json(&orch.dispatch_disable(ws, strategy, &options)?)
        }
    }
}

fn open(root: &Path) -> Result<Orchestrator<FileStore, GitVcs>> {
    let paths = ProjectPaths::new(root);
    let config = load_config(&paths.config_path).context("load config.toml")?;
    Ok(Orchestrator::new(
        FileStore::new(paths),
        GitVcs::new(root),
        config,
    ))
}

fn context_options(defaults: ContextOptions, args: &ContextArgs) -> ContextOptions {
    ContextOptions {
        include_log: defaults.include_log && !args.no_log,
        max_log_entries: args.max_log.unwrap_or(defaults.max_log_entries),
        reverse_log: defaults.reverse_log || args.reverse_log,
        include_problem: defaults.include_problem && !args.no_problem,
    }
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
