use std::path::PathBuf;

pub(crate) enum Command {
    /// Run the cloud relay: publisher engine, subscriber WS endpoint, and
    /// the supporting HTTP server, all in one process.
    Broadcast,
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
    println!("edgecast-cloud - cloud media relay");
    println!();
    println!("USAGE:");
    println!("    edgecast-cloud <SUBCOMMAND> [OPTIONS]");
    println!();
    println!("SUBCOMMANDS:");
    println!("    broadcast                   run the relay's publisher + subscriber engines");
    println!("    info                        print resolved config and exit");
    println!("    turn                        run a bundled TURN relay");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              TOML config file [default: ./config/edgecast.toml]");
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
        println!("edgecast-cloud {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    if command_name == "-h" || command_name == "--help" {
        print_help();
        std::process::exit(0);
    }

    let mut config_path = PathBuf::from("./config/edgecast.toml");

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("missing --config value"))?,
                );
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
        "broadcast" => Command::Broadcast,
        "info" => Command::Info,
        "turn" => Command::Turn,
        other => anyhow::bail!("unknown subcommand: {other}"),
    };

    Ok(Args {
        command,
        config_path,
    })
}
