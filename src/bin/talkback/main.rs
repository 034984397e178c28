use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use talkback::config::Config;
use talkback::error::PlaybackError;

#[derive(Parser)]
#[command(
    name = "talkback",
    about = "Play streamed agent speech and track whose turn it is",
    long_about = "Talkback is the playback side of a real-time voice agent client. It \
        decodes streamed audio segments, schedules them gaplessly onto the output \
        device through a lock-free ring buffer, and follows the agent's turn \
        lifecycle so it can tell the peer exactly when the user has heard the \
        whole reply."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/talkback/config.yaml if not specified. Built-in
    /// defaults are used when the file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the talkback crate, showing segment
    /// scheduling, probe decisions and turn phase changes.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded session script through the output device
    ///
    /// Reads a JSON-lines script of timed events (state markers, audio
    /// payloads, WAV files and speaking activity), feeds it through the full
    /// engine in real time and prints everything the session reports,
    /// including end-of-turn acknowledgements, as JSON lines on stdout.
    Replay {
        /// Script file (.jsonl)
        file: PathBuf,

        /// Keep the session alive this long after the last event (ms)
        #[arg(long, default_value_t = 3000)]
        linger_ms: u64,
    },

    /// List available audio output devices
    ///
    /// Shows all audio output devices recognized by the system. Use --pick
    /// to interactively select one and save it to your config file, or
    /// use --set to write a device name directly.
    Devices {
        /// Write the chosen device name to the config file
        #[arg(long, conflicts_with = "pick")]
        set: Option<String>,

        /// Interactively pick a device and save it to the config file
        #[arg(long, conflicts_with = "set")]
        pick: bool,
    },

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(Config::default_path)
}

fn load_config(cli: &Cli) -> Result<Config, PlaybackError> {
    let path = config_path(cli);
    // An explicit --config must exist; the default location is optional.
    if cli.config.is_some() {
        Config::load(&path)
    } else {
        Config::load_or_default(&path)
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("talkback=debug,info")
    } else {
        EnvFilter::new("talkback=info,warn")
    };

    // stdout carries replay output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_completions_if_missing();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Install completions for `$SHELL` when none exist yet. Failures are ignored.
fn install_completions_if_missing() {
    let Ok(shell_env) = std::env::var("SHELL") else {
        return;
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };

    let (shell, path) = if shell_env.ends_with("/bash") {
        let dir = home.join(".local/share/bash-completion/completions");
        (Shell::Bash, dir.join("talkback"))
    } else if shell_env.ends_with("/zsh") {
        (Shell::Zsh, home.join(".zfunc/_talkback"))
    } else if shell_env.ends_with("/fish") {
        (
            Shell::Fish,
            home.join(".config/fish/completions/talkback.fish"),
        )
    } else {
        return;
    };

    if path.exists() {
        return;
    }

    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "talkback", &mut buf);

    let _ = std::fs::write(&path, buf);
}

fn run(cli: &Cli) -> Result<(), PlaybackError> {
    match &cli.command {
        Command::Replay { file, linger_ms } => {
            let config = load_config(cli)?;
            run_replay(&config, file, Duration::from_millis(*linger_ms))
        }
        Command::Devices { set, pick } => run_devices(cli, set.as_deref(), *pick),
        Command::Completions { shell } => {
            generate(
                *shell,
                &mut Cli::command(),
                "talkback",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn run_replay(config: &Config, file: &Path, linger: Duration) -> Result<(), PlaybackError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(talkback::replay::run(config, file, linger))
}

fn list_devices() -> Result<(Vec<String>, Option<String>), PlaybackError> {
    let devices = talkback::audio::output::list_output_devices()?;
    let default_name = talkback::audio::output::default_output_device_name();
    Ok((devices, default_name))
}

fn print_device_list(devices: &[String], default_name: Option<&str>) {
    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
}

fn run_devices(cli: &Cli, set: Option<&str>, pick: bool) -> Result<(), PlaybackError> {
    if let Some(device_name) = set {
        let path = config_path(cli);
        Config::set_audio_device(&path, device_name)?;
        println!("Set output device to: {device_name}");
        return Ok(());
    }

    let (devices, default_name) = list_devices()?;

    if devices.is_empty() {
        println!("No audio output devices found.");
        return Ok(());
    }

    if !pick {
        print_device_list(&devices, default_name.as_deref());
        return Ok(());
    }

    println!("Available audio output devices:");
    print_device_list(&devices, default_name.as_deref());
    println!();

    print!("Select device [1-{}]: ", devices.len());
    std::io::stdout()
        .flush()
        .map_err(|e| PlaybackError::Other(format!("failed to flush stdout: {e}")))?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| PlaybackError::Other(format!("failed to read input: {e}")))?;

    let choice: usize = input
        .trim()
        .parse()
        .map_err(|_| PlaybackError::Other("invalid selection: enter a number".to_string()))?;

    if choice < 1 || choice > devices.len() {
        return Err(PlaybackError::Other(format!(
            "selection out of range: pick 1-{}",
            devices.len()
        )));
    }

    let selected = &devices[choice - 1];
    Config::set_audio_device(&config_path(cli), selected)?;
    println!("Set output device to: {selected}");
    Ok(())
}
