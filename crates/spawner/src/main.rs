//! Command-line interface for the native spawner.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use libspawner::{
    LaunchSpec, ProcessFactory, Pty, PtyMode, SpawnSignal, Spawner, SpawnerInputStream,
};
use log::{info, warn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

/// Top-level argument parser describing the spawner interface.
#[derive(Parser, Debug)]
#[command(name = "spawner", version, about = "Launch programs through the native spawner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PtyArg {
    Console,
    Terminal,
}

impl From<PtyArg> for PtyMode {
    fn from(arg: PtyArg) -> Self {
        match arg {
            PtyArg::Console => PtyMode::Console,
            PtyArg::Terminal => PtyMode::Terminal,
        }
    }
}

/// Subcommands exposed by the spawner frontend.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program and relay its output.
    Run {
        /// Attach the program to a pseudo-terminal.
        #[arg(long, value_enum)]
        pty: Option<PtyArg>,
        /// Start the program in its own session and return immediately.
        #[arg(long, conflicts_with = "pty")]
        detached: bool,
        /// Working directory for the program.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// KEY=VALUE; any use replaces the inherited environment.
        #[arg(long = "env")]
        env: Vec<String>,
        /// Grace period in milliseconds between terminate and kill.
        #[arg(long)]
        graceful_ms: Option<u64>,
        prog: String,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Drive a program on a terminal-mode pty interactively.
    Shell {
        prog: String,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Report which launch backend and sandbox are in effect.
    Probe,
    /// Display version information for diagnostics.
    Version,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let factory = ProcessFactory::from_env();
    match cli.cmd {
        Command::Run {
            pty,
            detached,
            dir,
            env,
            graceful_ms,
            prog,
            args,
        } => {
            let mut spec = LaunchSpec::new(std::iter::once(prog).chain(args));
            if !env.is_empty() {
                spec = spec.envp(&env);
            }
            if let Some(dir) = dir {
                spec = spec.dir(dir);
            }
            if let Some(ms) = graceful_ms {
                spec = spec.graceful_exit(Duration::from_millis(ms));
            }
            if let Some(mode) = pty {
                spec = spec.pty(Pty::new(mode.into())?);
            }
            if detached {
                spec = spec.detached();
            }
            let code = run_program(&factory, spec, detached)?;
            std::process::exit(code);
        }
        Command::Shell { prog, args } => {
            let code = run_shell(&factory, std::iter::once(prog).chain(args).collect())?;
            std::process::exit(code);
        }
        Command::Probe => {
            let config = factory.config();
            println!("native:        {}", factory.has_native());
            println!("sandbox:       {:?}", config.sandbox);
            println!("graceful exit: {:?}", config.graceful_exit);
            Ok(())
        }
        Command::Version => {
            println!("spawner {}", libspawner::version());
            Ok(())
        }
    }
}

fn run_program(factory: &ProcessFactory, spec: LaunchSpec, detached: bool) -> Result<i32> {
    info!("Launching {:?}", spec.argv());
    let child = factory.launch(spec)?;
    if detached {
        println!("{}", child.pid());
        return Ok(0);
    }
    child.stdin().close()?;

    let out = relay(child.stdout(), io::stdout());
    let err = relay(child.stderr(), io::stderr());
    let code = child.wait_for();
    finish(out);
    finish(err);
    info!("{} exited with {code}", child.command());
    Ok(code)
}

fn relay<W>(stream: Arc<SpawnerInputStream>, mut sink: W) -> thread::JoinHandle<()>
where
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut source = &*stream;
        if let Err(e) = io::copy(&mut source, &mut sink) {
            warn!("relay stopped: {e}");
        }
        let _ = sink.flush();
    })
}

fn run_shell(factory: &ProcessFactory, argv: Vec<String>) -> Result<i32> {
    let spec = LaunchSpec::new(argv).pty(Pty::new(PtyMode::Terminal)?);
    let child = factory.launch(spec)?;
    info!("{} running as pid {}", child.command(), child.pid());

    let pump = relay(child.stdout(), io::stdout());
    let stdin = child.stdin();
    let mut editor = DefaultEditor::new().context("line editor")?;

    loop {
        match editor.readline("") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if let Some(command) = line.strip_prefix(':') {
                    if !shell_command(&child, command)? {
                        break;
                    }
                    continue;
                }
                if let Err(e) = (&*stdin).write_all(format!("{line}\n").as_bytes()) {
                    warn!("child stopped reading input: {e}");
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => child.interrupt_ctrl_c()?,
            Err(ReadlineError::Eof) => {
                // VEOF, so the child sees end-of-input on its terminal.
                (&*stdin).write_all(b"\x04")?;
                let code = child.wait_for();
                finish(pump);
                return Ok(code);
            }
            Err(e) => return Err(e.into()),
        }
        if !child.is_running() {
            break;
        }
    }

    if child.is_running() {
        child.destroy();
    }
    let code = child.wait_for();
    finish(pump);
    Ok(code)
}

fn finish(pump: thread::JoinHandle<()>) {
    if pump.join().is_err() {
        warn!("output relay panicked");
    }
}

/// Handle a `:command` line; returns `false` when the session should end.
fn shell_command(child: &Spawner, command: &str) -> Result<bool> {
    let mut words = command.split_whitespace();
    let signal = match words.next() {
        Some("int") => SpawnSignal::Interrupt,
        Some("ctrlc") => SpawnSignal::CtrlC,
        Some("hup") => SpawnSignal::Hangup,
        Some("term") => SpawnSignal::Terminate,
        Some("kill") => SpawnSignal::Kill,
        Some("size") => {
            let cols = words.next().and_then(|w| w.parse::<u16>().ok());
            let rows = words.next().and_then(|w| w.parse::<u16>().ok());
            match (cols, rows, child.pty()) {
                (Some(cols), Some(rows), Some(pty)) => pty.set_terminal_size(cols, rows)?,
                _ => eprintln!("usage: :size COLS ROWS"),
            }
            return Ok(true);
        }
        Some("quit") => return Ok(false),
        other => {
            eprintln!("unknown command {other:?}; try :int :ctrlc :hup :term :kill :size :quit");
            return Ok(true);
        }
    };
    child.raise(signal)?;
    Ok(true)
}
