use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use mimic_contracts::events::EventWriter;
use mimic_contracts::extract::FencedFallback;
use mimic_contracts::transcript::ContextPolicy;
use mimic_engine::{ChatClient, ChromeRenderer, ImageHost, RefineEngine, RunOptions};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "mimic-rs", version, about = "Refines generated HTML toward a reference design")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the screenshot-feedback refinement loop against a design image.
    Refine(RefineArgs),
}

#[derive(Debug, Parser)]
struct RefineArgs {
    /// URL of the reference design image.
    #[arg(long, short = 'i')]
    image: String,
    /// Number of refinement rounds.
    #[arg(long, short = 'n', default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    iterations: u64,
    /// Vision-capable chat model.
    #[arg(long, default_value = "gpt-4o")]
    model: String,
    /// Run directory for screenshots, conversation logs, and events.
    #[arg(long, default_value = "mimic-run")]
    out: PathBuf,
    /// How much transcript each round replays to the model.
    #[arg(long, value_enum, default_value_t = ContextArg::Full)]
    context: ContextArg,
    /// Artifact value when a reply has no ```html fence.
    #[arg(long, value_enum, default_value_t = FallbackArg::Raw)]
    fallback: FallbackArg,
    /// Ask for a copy-quality pass on the final round.
    #[arg(long)]
    polish_final: bool,
    /// Events file override (defaults to <out>/events.jsonl).
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ContextArg {
    Full,
    Windowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FallbackArg {
    Raw,
    Empty,
}

impl From<ContextArg> for ContextPolicy {
    fn from(value: ContextArg) -> Self {
        match value {
            ContextArg::Full => ContextPolicy::FullHistory,
            ContextArg::Windowed => ContextPolicy::Windowed,
        }
    }
}

impl From<FallbackArg> for FencedFallback {
    fn from(value: FallbackArg) -> Self {
        match value {
            FallbackArg::Raw => FencedFallback::RawText,
            FallbackArg::Empty => FencedFallback::Empty,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mimic-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Refine(args) => run_refine(args),
    }
}

fn run_refine(args: RefineArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(events_path, Uuid::new_v4().to_string());

    let chat = ChatClient::from_env(args.model.clone())?;
    let render = ChromeRenderer::discover()?;
    let publish = ImageHost::from_env()?;

    let options = RunOptions {
        design_url: args.image,
        iterations: args.iterations,
        context_policy: args.context.into(),
        fenced_fallback: args.fallback.into(),
        polish_final: args.polish_final,
        out_dir: args.out,
    };

    println!(
        "Starting refinement: {} iteration(s) with {}",
        options.iterations,
        chat.model()
    );
    let engine = RefineEngine::new(
        options,
        events,
        Box::new(chat),
        Box::new(render),
        Box::new(publish),
    );
    let html = engine.run()?;
    println!("Refinement complete. Final HTML:");
    println!("{html}");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn refine_defaults_match_the_documented_surface() {
        let cli = Cli::try_parse_from(["mimic-rs", "refine", "--image", "https://x/d.png"]).unwrap();
        let Command::Refine(args) = cli.command;
        assert_eq!(args.image, "https://x/d.png");
        assert_eq!(args.iterations, 3);
        assert_eq!(args.model, "gpt-4o");
        assert_eq!(args.context, ContextArg::Full);
        assert_eq!(args.fallback, FallbackArg::Raw);
        assert!(!args.polish_final);
        assert_eq!(args.out, PathBuf::from("mimic-run"));
    }

    #[test]
    fn short_flags_mirror_the_long_ones() {
        let cli = Cli::try_parse_from([
            "mimic-rs", "refine", "-i", "https://x/d.png", "-n", "5",
        ])
        .unwrap();
        let Command::Refine(args) = cli.command;
        assert_eq!(args.image, "https://x/d.png");
        assert_eq!(args.iterations, 5);
    }

    #[test]
    fn image_is_required() {
        assert!(Cli::try_parse_from(["mimic-rs", "refine"]).is_err());
    }

    #[test]
    fn zero_iterations_is_rejected_at_parse_time() {
        assert!(Cli::try_parse_from([
            "mimic-rs", "refine", "--image", "https://x/d.png", "--iterations", "0",
        ])
        .is_err());
    }

    #[test]
    fn policy_flags_map_to_the_engine_enums() {
        let cli = Cli::try_parse_from([
            "mimic-rs",
            "refine",
            "--image",
            "https://x/d.png",
            "--context",
            "windowed",
            "--fallback",
            "empty",
            "--polish-final",
        ])
        .unwrap();
        let Command::Refine(args) = cli.command;
        assert_eq!(ContextPolicy::from(args.context), ContextPolicy::Windowed);
        assert_eq!(FencedFallback::from(args.fallback), FencedFallback::Empty);
        assert!(args.polish_final);
    }
}
