//! Aurora CLI: compile and run Aurora Scheme programs.

mod colors;
mod config;

use aurora_compiler::compiler::emit::emit_json;
use aurora_compiler::{format_error, CompileError, FsSources, ModuleLoader};
use aurora_vm::{ProcessState, Runtime, RuntimeConfig, StdoutSink};
use clap::{Parser as ClapParser, Subcommand};
use colors::{gray, red, status_label, yellow};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(ClapParser, Debug)]
#[command(name = "aurora", version, about = "Aurora Scheme compiler and process VM")]
struct Cli {
    /// Log compiler and runtime activity (overrides AURORA_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile and run a source file
    Run {
        #[arg()]
        file: PathBuf,

        /// Fail any process after this many instructions
        #[arg(long)]
        max_steps: Option<u64>,

        /// Log every executed instruction
        #[arg(long)]
        trace: bool,
    },
    /// Compile a source file to an AIL listing
    Compile {
        #[arg()]
        file: PathBuf,

        /// Emit the program as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the analysed syntax tree as source
    Ast {
        #[arg()]
        file: PathBuf,

        /// Show variables under their scope-qualified names
        #[arg(long)]
        renamed: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("AURORA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", red("error:"), message);
    std::process::exit(1);
}

fn load_config() -> config::AuroraConfig {
    match config::AuroraConfig::load() {
        Ok((path, cfg)) => {
            if let Some(path) = path {
                tracing::debug!(path = %path.display(), "loaded config");
            }
            cfg
        }
        Err(e) => fail(e),
    }
}

/// Compile `file` together with everything it imports.
fn build(file: &Path, search_path: &[PathBuf]) -> aurora_compiler::compiler::ail::Program {
    let loader = ModuleLoader::new(FsSources::new(search_path.to_vec()));
    match loader.load(file) {
        Ok(module) => module.program,
        Err(e) => {
            eprintln!("{} compilation failed", red("error:"));
            eprintln!("{}", format_error(&e, &file.display().to_string()));
            std::process::exit(1);
        }
    }
}

fn cmd_run(file: &Path, max_steps: Option<u64>, trace: bool) {
    let cfg = load_config();
    let mut runtime_config: RuntimeConfig = cfg.runtime_config();
    if max_steps.is_some() {
        runtime_config.max_steps = max_steps;
    }
    runtime_config.trace_instructions |= trace;

    eprintln!("{} {}", status_label("Compiling"), file.display());
    let program = build(file, &runtime_config.search_path);

    eprintln!("{} {}", status_label("Running"), file.display());
    let mut runtime = Runtime::new(runtime_config).with_sink(StdoutSink);
    if let Err(e) = runtime.spawn(program) {
        fail(e);
    }
    let report = runtime.run();
    println!();

    for p in &report.processes {
        let line = format!("process {}: {} steps, peak call depth {}", p.pid, p.steps, p.peak_call_depth);
        match (&p.state, &p.error) {
            (ProcessState::Failed, Some(err)) => eprintln!("{} {} ({})", red("runtime error:"), err, gray(&line)),
            _ => tracing::info!("{}", line),
        }
    }
    if !report.succeeded() {
        std::process::exit(1);
    }
}

fn cmd_compile(file: &Path, json: bool, output: Option<&Path>) {
    let cfg = load_config();
    let program = build(file, &cfg.modules.search_path);
    let text = if json {
        emit_json(&program).unwrap_or_else(|e| fail(e))
    } else {
        program.to_ail_text()
    };
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                fail(format!("cannot write '{}': {}", path.display(), e));
            }
            eprintln!("{} {}", status_label("Wrote"), path.display());
        }
        None => print!("{}", text),
    }
}

fn cmd_ast(file: &Path, renamed: bool) {
    let source = std::fs::read_to_string(file)
        .unwrap_or_else(|e| fail(format!("cannot read '{}': {}", file.display(), e)));
    let filename = file.display().to_string();
    let analysed = aurora_compiler::parse(&source).and_then(|mut ast| {
        aurora_compiler::analyse(&mut ast)?;
        Ok::<_, CompileError>(ast)
    });
    let ast = match analysed {
        Ok(ast) => ast,
        Err(e) => fail(format_error(&e, &filename)),
    };
    if !ast.dependencies.is_empty() {
        eprintln!("{} imports are shown unresolved", yellow("note:"));
    }
    let rendered = if renamed {
        ast.render_program(&|name: &str| name.to_string())
    } else {
        ast.render_program(&|name: &str| ast.original_name(name).to_string())
    };
    println!("{}", rendered);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run { file, max_steps, trace } => cmd_run(&file, max_steps, trace),
        Commands::Compile { file, json, output } => cmd_compile(&file, json, output.as_deref()),
        Commands::Ast { file, renamed } => cmd_ast(&file, renamed),
    }
}
