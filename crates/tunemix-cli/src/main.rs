//! tunemix CLI: music player powered by the tunemix engine.
//!
//! Commands:
//!   tunemix play <file> [options]   Play a file on the default output device
//!   tunemix sniff <file>            Show which backend a file would use
//!   tunemix info                    Show the negotiated output format
//!
//! Options:
//!   --loops <n>       Extra passes (MPEG only, -1 = forever)
//!   --volume <0-128>  Music volume
//!   --cmd "<cmd>"     Play through an external command
//!   --config <file>   JSON mixer configuration
//!
//! While playing, stdin accepts: pause, resume, rewind, stop, volume <n>,
//! status.

use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tunemix_core::sniff::sniff_path;
use tunemix_core::{AudioOutput, Engine, MixerConfig, PlaybackCommand};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return;
    }

    let config = match load_config(&args[1..]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let result = match args[0].as_str() {
        "play" => cmd_play(config, &args[1..]),
        "sniff" => cmd_sniff(&config, &args[1..]),
        "info" => cmd_info(config),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("tunemix: {}", e);
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_play(mut config: MixerConfig, args: &[String]) -> Result<(), String> {
    let Some(file) = positional(args) else {
        return Err("usage: tunemix play <file> [--loops N] [--volume V] [--cmd CMD]".into());
    };
    let loops = parse_flag(args, "--loops")?.unwrap_or(0);
    let volume: Option<i32> = parse_flag(args, "--volume")?;
    if let Some(cmd) = flag_value(args, "--cmd") {
        config.music_command = Some(cmd.to_string());
    }

    let (engine, output) = AudioOutput::open(config).map_err(|e| e.to_string())?;
    log::debug!("tunemix: device '{}'", output.device_name());

    let music = engine.load(file).map_err(|e| e.to_string())?;
    if let Some(v) = volume {
        engine.set_volume(v);
    }
    engine.play(&music, loops).map_err(|e| e.to_string())?;
    println!("playing {} ({})", file, music.kind());

    let lines = spawn_stdin_reader();
    let started = Instant::now();

    while engine.is_playing() {
        while let Ok(line) = lines.try_recv() {
            if !handle_line(&engine, line.trim()) {
                engine.halt().ok();
            }
        }
        print_progress(&engine, started.elapsed());
        std::thread::sleep(Duration::from_millis(250));
    }
    println!();

    engine.free_music(music);
    engine.shutdown();
    drop(output);
    Ok(())
}

fn cmd_sniff(config: &MixerConfig, args: &[String]) -> Result<(), String> {
    let Some(file) = positional(args) else {
        return Err("usage: tunemix sniff <file>".into());
    };
    let (kind, magic) = sniff_path(
        std::path::Path::new(file),
        &config.backend_set(),
        config.music_command.as_deref(),
    )
    .map_err(|e| e.to_string())?;
    println!("{}: {} (magic {:02X?})", file, kind, magic);
    Ok(())
}

fn cmd_info(config: MixerConfig) -> Result<(), String> {
    let (engine, output) = AudioOutput::open(config).map_err(|e| e.to_string())?;
    let info = serde_json::json!({
        "device": output.device_name(),
        "hardware": engine.hardware_format(),
        "correction": engine.correction(),
        "backends": engine.backends().kinds().collect::<Vec<_>>(),
        "status": engine.status(),
    });
    println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default());
    engine.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive control
// ---------------------------------------------------------------------------

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Apply one stdin line. Returns false when the user asked to quit.
fn handle_line(engine: &Engine, line: &str) -> bool {
    match line {
        "" => true,
        "quit" | "q" => false,
        "status" => {
            println!();
            println!("{}", serde_json::to_string_pretty(&engine.status()).unwrap_or_default());
            true
        }
        _ => {
            match PlaybackCommand::parse_line(line) {
                Some(cmd) => {
                    if let Err(e) = engine.command(cmd) {
                        eprintln!("\n{}", e);
                    }
                }
                None => eprintln!("\nunknown input: {} (pause, resume, rewind, stop, volume <n>, status, quit)", line),
            }
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(args: &[String]) -> Result<MixerConfig, String> {
    let config = match flag_value(args, "--config") {
        Some(path) => MixerConfig::from_path(path).map_err(|e| e.to_string())?,
        None => MixerConfig::default(),
    };
    Ok(config.apply_env())
}

const VALUE_FLAGS: [&str; 4] = ["--loops", "--volume", "--cmd", "--config"];

/// First argument that is neither a flag nor a flag's value.
fn positional(args: &[String]) -> Option<&str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with("--") {
            return Some(arg);
        }
    }
    None
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
    match flag_value(args, flag) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid value for {}: {}", flag, v)),
        None => Ok(None),
    }
}

fn print_progress(engine: &Engine, elapsed: Duration) {
    let status = engine.status();
    let state = if status.paused { "paused " } else { "playing" };
    let kind = status.kind.map(|k| k.name()).unwrap_or("-");

    print!(
        "\r  {} [{}] {}  vol: {}/128    ",
        state,
        kind,
        fmt_time(elapsed.as_millis() as u64),
        status.volume,
    );
    std::io::stdout().flush().ok();
}

fn fmt_time(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn print_usage() {
    println!("tunemix - CLI music player");
    println!();
    println!("usage: tunemix <command> [args]");
    println!();
    println!("commands:");
    println!("  play <file>            Play a file on the default output device");
    println!("  sniff <file>           Show which backend a file would use");
    println!("  info                   Show the negotiated output format");
    println!();
    println!("options:");
    println!("  --loops <n>            Extra passes (MPEG only, -1 = forever)");
    println!("  --volume <0-128>       Music volume");
    println!("  --cmd \"<command>\"      Play through an external command");
    println!("  --config <file>        JSON mixer configuration");
    println!();
    println!("environment:");
    println!("  TUNEMIX_MUSIC_CMD      External player command");
    println!("  RUST_LOG               Log level (error, warn, info, debug)");
}
