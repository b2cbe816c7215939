use std::path::PathBuf;

use atty::Stream;
use clap::{value_parser, ArgAction, Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use crust_core::{CommandStatus, ExecutionOutcome, Project};
use serde_json::Value;

mod style;

use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = CrustCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let project = Project::load(cli.config.as_deref()).map_err(|err| eyre!("{err:?}"))?;
    let outcome = dispatch(&project, &cli.command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("crust_store={level},crust_core={level},crust_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn dispatch(project: &Project, command: &Command) -> anyhow::Result<ExecutionOutcome> {
    match command {
        Command::Import(args) => crust_core::import(project, &args.paths, args.tag.as_deref()),
        Command::Run(args) => {
            crust_core::run(project, args.source_tag.as_deref(), args.tag.as_deref())
        }
        Command::Export(args) => crust_core::export(project, &args.node, &args.dest),
        Command::Show(args) => crust_core::show(project, &args.node),
        Command::Reflog(args) => crust_core::reflog(project, args.tag.as_deref()),
    }
}

fn emit_output(cli: &CrustCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = match outcome.status {
        CommandStatus::Ok => 0,
        CommandStatus::UserError => 1,
        CommandStatus::Failure => 2,
    };

    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else if !cli.quiet {
        println!("{}", style.status(&outcome.status, &outcome.message));
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Hint: {hint}")));
        }
    }

    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Migrate a C codebase to safe Rust, one audited step at a time",
    long_about = "Drives external C-to-Rust transpilers, a language model, and an \
unsafe-code detector over a content-addressed store until no unsafe code remains.",
    after_help = "Examples:\n  crust import src/\n  crust run\n  crust show current\n  crust export current --dest out/"
)]
struct CrustCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)"
    )]
    quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q")]
    trace: bool,
    #[arg(long, help = "Emit {status,message,details} JSON envelopes")]
    json: bool,
    #[arg(long, help = "Disable colored human output")]
    no_color: bool,
    #[arg(long, value_parser = value_parser!(PathBuf), help = "Path to crust.toml (defaults to ./crust.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(
        about = "Snapshot C sources into the store and tag them.",
        override_usage = "crust import [PATH ...] [--tag NAME]",
        after_help = "Examples:\n  crust import\n  crust import src/ include/\n  crust import --tag baseline main.c\n"
    )]
    Import(ImportArgs),
    #[command(
        about = "Translate, refactor, and validate until no unsafe code remains.",
        override_usage = "crust run [--tag NAME] [--source-tag NAME]",
        after_help = "Examples:\n  crust run\n  crust --json run\n"
    )]
    Run(RunArgs),
    #[command(
        about = "Materialize a tree (tag, id, or id prefix) to a directory.",
        override_usage = "crust export [NODE] --dest DIR",
        after_help = "Examples:\n  crust export current --dest out/\n  crust export 4f2a --dest /tmp/snapshot\n"
    )]
    Export(ExportArgs),
    #[command(
        about = "Describe a node: file bytes, tree listing, or step provenance.",
        after_help = "Examples:\n  crust show current\n  crust show 4f2a\n"
    )]
    Show(ShowArgs),
    #[command(
        about = "Print the history of a tag, oldest first.",
        after_help = "Examples:\n  crust reflog\n  crust reflog op_history\n"
    )]
    Reflog(ReflogArgs),
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[arg(
        value_name = "PATH",
        help = "Files or directories to import (defaults to src_globs from crust.toml)"
    )]
    paths: Vec<PathBuf>,
    #[arg(long, help = "Tag to set (defaults to c_code)")]
    tag: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, help = "Working tag to advance (defaults to current)")]
    tag: Option<String>,
    #[arg(
        long = "source-tag",
        help = "Tag holding the C sources (defaults to c_code)"
    )]
    source_tag: Option<String>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(value_name = "NODE", default_value = "current")]
    node: String,
    #[arg(long, value_parser = value_parser!(PathBuf), help = "Destination directory")]
    dest: PathBuf,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[arg(value_name = "NODE", default_value = "current")]
    node: String,
}

#[derive(Args, Debug)]
struct ReflogArgs {
    #[arg(value_name = "TAG", help = "Tag name (defaults to current)")]
    tag: Option<String>,
}
