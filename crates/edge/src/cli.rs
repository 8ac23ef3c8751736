use std::path::PathBuf;

use anyhow::Context;

pub(crate) enum Command {
    /// Run the integrated ingest + publisher engine for the configured stream.
    Livestream,
    /// Run only the on-demand hook listener against an externally-managed
    /// ingest process, restarting it via `systemctl` on hook receipt.
    Hookstream { service: String, delay_secs: u64 },
    /// Print the resolved, validated configuration and exit.
    Info,
    /// Run a bundled TURN relay for deployments without an external one.
    Turn,
}

pub(crate) struct Args {
    pub command: Command,
    pub config_path: PathBuf,
}

fn print_help() {
    println!("edgecast-edge - edge video publisher");
    println!();
    println!("USAGE:");
    println!("    edgecast-edge <SUBCOMMAND> [OPTIONS]");
    println!();
    println!("SUBCOMMANDS:");
    println!("    livestream                  run ingest + publisher engine");
    println!("    hookstream                  run hook-driven service restarter only");
    println!("    info                        print resolved config and exit");
    println!("    turn                        run a bundled TURN relay");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              TOML config file [default: ./config/edgecast.toml]");
    println!("    --service <NAME>             hookstream: systemd unit to restart");
    println!("    --delay <SECS>               hookstream: delay before restart [default: 5]");
    println!("    -V, --version                print version and exit");
    println!("    -h, --help                   print this help and exit");
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        anyhow::bail!("a subcommand is required");
    }

    let command_name = args[1].as_str();
    if command_name == "-V" || command_name == "--version" {
        println!("edgecast-edge {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    if command_name == "-h" || command_name == "--help" {
        print_help();
        std::process::exit(0);
    }

    let mut config_path = PathBuf::from("./config/edgecast.toml");
    let mut service: Option<String> = None;
    let mut delay_secs: u64 = 5;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("missing --config value")?);
            }
            "--service" => {
                i += 1;
                service = Some(args.get(i).context("missing --service value")?.clone());
            }
            "--delay" => {
                i += 1;
                delay_secs = args
                    .get(i)
                    .context("missing --delay value")?
                    .parse()
                    .context("invalid --delay value")?;
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    let command = match command_name {
        "livestream" => Command::Livestream,
        "hookstream" => Command::Hookstream {
            service: service.context("hookstream requires --service <NAME>")?,
            delay_secs,
        },
        "info" => Command::Info,
        "turn" => Command::Turn,
        other => anyhow::bail!("unknown subcommand: {other}"),
    };

    Ok(Args {
        command,
        config_path,
    })
}
