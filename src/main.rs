use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use daylog::{
    DefaultCommandParser, EditOutcome, Engine, JsonSnapshotStore, SystemClock, TagClass,
};

#[derive(Debug, Parser)]
#[command(
    name = "daylog",
    about = "A terse command-driven ledger of today's tasks",
    version
)]
struct Cli {
    /// Directory holding the per-day snapshot files. Defaults to ~/.daylog.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply one command line to today's ledger.
    Exec(ExecArgs),

    /// Print today's tasks in display order.
    List(ListArgs),

    /// Print today's tag index.
    Tags(TagsArgs),

    /// Print the column layout of today's scheduled tasks.
    Timeline(TimelineArgs),

    /// Read command lines from stdin until EOF.
    Repl,
}

#[derive(Debug, Args)]
struct ExecArgs {
    /// The command line to apply, e.g. "930-1045.Write report /work".
    #[arg(required = true)]
    line: Vec<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TagsArgs {
    /// Emit JSON instead of one class per line.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TimelineArgs {
    /// Emit JSON instead of a block listing.
    #[arg(long)]
    json: bool,
    /// Tag class shown next to each block.
    #[arg(long, default_value_t = 1)]
    class: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let engine = open_engine(cli.dir, verbose)?;
    match cli.command {
        Commands::Exec(args) => handle_exec(engine, args, verbose),
        Commands::List(args) => handle_list(engine, args),
        Commands::Tags(args) => handle_tags(engine, args),
        Commands::Timeline(args) => handle_timeline(engine, args),
        Commands::Repl => handle_repl(engine, verbose),
    }
}

fn open_engine(dir: Option<PathBuf>, verbose: bool) -> Result<Engine> {
    let dir = match dir {
        Some(dir) => dir,
        None => default_dir()?,
    };
    if verbose {
        eprintln!("Using snapshot directory {:?}", dir);
    }
    Engine::open(
        Box::new(DefaultCommandParser),
        Box::new(SystemClock),
        Box::new(JsonSnapshotStore::new(dir)),
    )
}

fn default_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; pass --dir explicitly")?;
    Ok(PathBuf::from(home).join(".daylog"))
}

fn handle_exec(mut engine: Engine, args: ExecArgs, verbose: bool) -> Result<()> {
    let line = args.line.join(" ");
    let outcome = engine
        .apply(&line)
        .with_context(|| format!("applying {:?}", line))?;
    if verbose {
        eprintln!("{}", describe_outcome(&outcome));
    }
    print_table(&engine);
    Ok(())
}

fn handle_list(engine: Engine, args: ListArgs) -> Result<()> {
    if args.json {
        let tasks = engine.ordered_tasks();
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        print_table(&engine);
    }
    Ok(())
}

fn handle_tags(engine: Engine, args: TagsArgs) -> Result<()> {
    let index = engine.tag_index();
    if args.json {
        println!("{}", serde_json::to_string_pretty(index)?);
        return Ok(());
    }
    if index.is_empty() {
        eprintln!("No tags for {}.", engine.today());
        return Ok(());
    }
    for (TagClass(class), tags) in index.iter() {
        println!("{class}: {}", tags.join(" "));
    }
    Ok(())
}

fn handle_timeline(engine: Engine, args: TimelineArgs) -> Result<()> {
    let layout = engine.timeline();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }
    if layout.blocks.is_empty() {
        eprintln!("No scheduled tasks for {}.", engine.today());
        return Ok(());
    }
    println!("{} column(s)", layout.max_concurrent);
    for block in &layout.blocks {
        let tags = engine.task_tags_in_class(block.id, TagClass(args.class));
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!("  {}", tags.join(" "))
        };
        println!(
            "{}-{} col {} [{:.2}, {:.2}) #{}{}",
            block.begin.format("%H:%M"),
            block.end.format("%H:%M"),
            block.column,
            block.x0,
            block.x1,
            block.id,
            tags
        );
    }
    Ok(())
}

fn handle_repl(mut engine: Engine, verbose: bool) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush().context("flushing stdout")?;
        let mut line = String::new();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .context("reading stdin")?;
        if read == 0 {
            break;
        }
        let line = line.trim_end_matches(['\n', '\r']);
        // One bad line must not end the session.
        match engine.apply(line) {
            Ok(outcome) => {
                if verbose {
                    eprintln!("{}", describe_outcome(&outcome));
                }
                print_table(&engine);
            }
            Err(err) => eprintln!("error: {err:#}"),
        }
    }
    Ok(())
}

fn describe_outcome(outcome: &EditOutcome) -> String {
    match outcome {
        EditOutcome::Created(id) => format!("created task {id}"),
        EditOutcome::Updated(id) => format!("updated task {id}"),
        EditOutcome::Deleted(id) => format!("deleted task {id}"),
        EditOutcome::Noop => "no change".to_string(),
    }
}

fn print_table(engine: &Engine) {
    let tasks = engine.ordered_tasks();
    if tasks.is_empty() {
        println!("No tasks for {}.", engine.today());
        return;
    }
    println!("{:>4}  {:<5}  {:<5}  Body", "Ref", "Begin", "End");
    for task in tasks {
        println!(
            "{:>4}  {:<5}  {:<5}  {}",
            task.id,
            format_time(task.begin),
            format_time(task.end),
            task.body.as_deref().unwrap_or("")
        );
    }
}

fn format_time(time: Option<chrono::NaiveDateTime>) -> String {
    time.map(|t| t.format("%H:%M").to_string())
        .unwrap_or_default()
}
