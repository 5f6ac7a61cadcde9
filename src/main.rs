use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chief::cli::{Cli, Command};
use chief::config::Config;
use chief::event::Event;
use chief::git;
use chief::instance::InstanceState;
use chief::manager::Manager;
use chief::paths::Paths;
use chief::prd;
use chief::runner::{AssistantRunner, ClaudeRunner};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let repo_dir = std::env::current_dir().context("failed to read current directory")?;
    let home = default_home()?;
    let paths = Paths::new(&repo_dir, home);

    match cli.command {
        Command::Run { name, max_iterations } => run(&paths, &repo_dir, &name, max_iterations).await?,
        Command::Status { name } => status(&paths, &name)?,
        Command::Gc => {
            git::prune_worktrees(&repo_dir)?;
            println!("pruned stale worktree administrative files");
        }
    }

    Ok(())
}

async fn run(paths: &Paths, repo_dir: &std::path::Path, name: &str, max_iterations: u32) -> Result<()> {
    let config = Config::load(&paths.config_yaml())?;
    let runner: Arc<dyn AssistantRunner> = Arc::new(ClaudeRunner::default());
    let manager = Manager::new(paths.clone(), repo_dir.to_path_buf(), config, runner);

    manager.register(name);
    manager.set_max_iterations(max_iterations);

    let mut events = manager.events().context("event stream already taken")?;
    manager.start(name);

    while let Some(tagged) = events.recv().await {
        print_event(&tagged.event);
        if matches!(tagged.event, Event::Complete { .. } | Event::Error { .. } | Event::MaxIterationsReached { .. }) {
            break;
        }
    }

    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::IterationStart { iteration } => println!("[{iteration}] iteration start"),
        Event::AssistantText { iteration, text } => println!("[{iteration}] {text}"),
        Event::ToolStart { iteration, tool, .. } => println!("[{iteration}] tool: {tool}"),
        Event::ToolResult { iteration, text } => println!("[{iteration}] tool result: {text}"),
        Event::StoryStarted { iteration, story_id } => println!("[{iteration}] working on {story_id}"),
        Event::ProgressUpdated { iteration, blocks } => {
            println!("[{iteration}] progress log updated ({} stories)", blocks.len());
        }
        Event::Retrying { iteration, text } => println!("[{iteration}] retrying: {text}"),
        Event::MaxIterationsReached { iteration } => println!("[{iteration}] max iterations reached"),
        Event::Complete { iteration } => println!("[{iteration}] complete"),
        Event::Error { iteration, err } => println!("[{iteration}] error: {err}"),
    }
}

fn status(paths: &Paths, name: &str) -> Result<()> {
    let prd = prd::load(&paths.prd_json(name))?;
    println!("{} ({})", prd.project, name);
    for story in &prd.user_stories {
        let mark = if story.passes { "x" } else { " " };
        let in_progress = if story.in_progress { " (in progress)" } else { "" };
        println!("  [{mark}] {} {}{}", story.id, story.title, in_progress);
    }
    if prd.all_pass() {
        println!("state: {:?}", InstanceState::Complete);
    }
    Ok(())
}

fn default_home() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .context("HOME not set")
}
