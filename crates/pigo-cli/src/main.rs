//! pigo — an interactive, tool-augmented coding assistant for the terminal.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pigo_agent::Agent;
use pigo_core::PigoConfig;

#[derive(Parser)]
#[command(name = "pigo", version, about = "An interactive, tool-augmented coding assistant")]
struct Cli {
    /// Config file path (default: config.json under $PIGO_HOME or ~/.pigo)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single prompt and exit instead of starting the interactive loop
    #[arg(short, long)]
    prompt: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = PigoConfig::load(cli.config.as_deref())?;
    tracing::debug!(model = %config.model, api_type = %config.api_type, "configuration resolved");
    let mut agent = Agent::new(&config)?;

    if let Some(prompt) = cli.prompt {
        return run_one_turn(&mut agent, &prompt).await;
    }

    repl(&mut agent).await
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "pigo_core=info,pigo_memory=info,pigo_hooks=info,pigo_agent=info,pigo_cli=info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// One-shot mode: a single turn, then exit.
async fn run_one_turn(agent: &mut Agent, input: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    run_turn_interruptible(agent, input, &mut stdout).await?;
    Ok(())
}

/// Interactive loop: read a line, run a turn, repeat. `exit`/`quit` leaves.
async fn repl(agent: &mut Agent) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    println!("pigo — model {} (exit/quit to leave)", agent.model());

    loop {
        print!("> ");
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        if let Err(e) = run_turn_interruptible(agent, input, &mut stdout).await {
            eprintln!("error: {e}");
        }
    }

    let usage = agent.usage();
    println!(
        "bye — {} prompt + {} completion = {} tokens",
        usage.prompt, usage.completion, usage.total
    );
    Ok(())
}

/// Run a turn with Ctrl-C wired to the cancellation token. The turn future
/// itself is never dropped mid-flight — cancellation propagates through the
/// token so partial output lands in the transcript.
async fn run_turn_interruptible(
    agent: &mut Agent,
    input: &str,
    out: &mut std::io::Stdout,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = agent.run_turn(input, out, &cancel).await;
    watcher.abort();
    result?;
    Ok(())
}
