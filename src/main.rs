use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger::Env;
use tokio::io::AsyncWriteExt;

use marauder_console_lib::catalog;
use marauder_console_lib::console::{self, ConsoleInput, LocalCommand, SharedLines, StdinPortPicker};
use marauder_console_lib::serial::{
    AutoPicker, PortPicker, SerialBackend, SerialManager, SystemSerialBackend,
};
use marauder_console_lib::{ConsoleConfig, MacroRunner};

fn cli() -> Command {
    Command::new("marauder-console")
        .about("Serial console for ESP32 Marauder boards")
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_name("PATH")
                .help("Serial port to open instead of prompting"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .help("Baud rate (default 115200)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Config file (default: <config dir>/marauder-console/config.toml)"),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .help("List candidate serial ports and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-commands")
                .long("list-commands")
                .value_name("FILTER")
                .num_args(0..=1)
                .default_missing_value("")
                .help("Print the command reference and exit"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print listings as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-connect")
                .long("no-connect")
                .help("Start without connecting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("yes")
                .long("yes")
                .short('y')
                .help("Pick the first matching port without asking")
                .action(ArgAction::SetTrue),
        )
}

fn build_config(matches: &ArgMatches) -> Result<ConsoleConfig> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = ConsoleConfig::load(path.map(|p| p.as_path()))?;
    if let Some(port) = matches.get_one::<String>("port") {
        config.port = Some(port.clone());
    }
    if let Some(baud) = matches.get_one::<u32>("baud") {
        config.baud_rate = *baud;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();
    let config = build_config(&matches).context("Failed to load configuration")?;
    let json = matches.get_flag("json");

    if let Some(query) = matches.get_one::<String>("list-commands") {
        let hits = catalog::filter(query);
        if json {
            println!("{}", serde_json::to_string_pretty(&hits)?);
        } else {
            print!("{}", console::format_commands(&hits));
        }
        return Ok(());
    }

    let lines = console::stdin_lines();
    let picker: Arc<dyn PortPicker> = if matches.get_flag("yes") {
        Arc::new(AutoPicker)
    } else {
        Arc::new(StdinPortPicker::new(lines.clone()))
    };
    let backend = Arc::new(
        SystemSerialBackend::new(picker)
            .with_filters(config.usb_filters.clone())
            .with_preferred_port(config.port.clone())
            .with_auto_select(config.auto_select),
    );

    if matches.get_flag("list-ports") {
        backend.is_available().await?;
        let ports = backend.discover_devices()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&ports)?);
        } else if ports.is_empty() {
            println!("No USB serial devices found");
        } else {
            print!("{}", console::format_ports(&ports));
        }
        return Ok(());
    }

    let manager = Arc::new(SerialManager::with_read_buffer(backend, config.read_buffer_size));
    let runner = Arc::new(MacroRunner::new(config.macro_step_delay()));

    spawn_output_printer(&manager).await;

    println!("ESP32 Marauder Console // type :help for local commands");
    if !matches.get_flag("no-connect") {
        connect(&manager, config.baud_rate).await;
    }

    tokio::select! {
        res = run_console(&manager, &runner, &lines, config.baud_rate) => res?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    manager.disconnect().await;
    Ok(())
}

async fn spawn_output_printer(manager: &SerialManager) {
    let mut rx = manager.subscribe().await;
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = rx.recv().await {
            let written = async {
                stdout.write_all(chunk.text.as_bytes()).await?;
                stdout.flush().await
            }
            .await;
            if let Err(e) = written {
                log::warn!("Failed to write device output: {}", e);
            }
        }
    });
}

async fn connect(manager: &SerialManager, baud_rate: u32) {
    if manager.connect(baud_rate).await {
        println!("{}", manager.device_info());
    } else if let Some(error) = manager.error() {
        eprintln!("Connection failed: {}", error);
    }
}

async fn run_console(
    manager: &Arc<SerialManager>,
    runner: &Arc<MacroRunner>,
    lines: &SharedLines,
    default_baud: u32,
) -> Result<()> {
    let mut state_rx = manager.watch_state();
    loop {
        let next = {
            let mut guard = lines.lock().await;
            guard.next_line().await?
        };
        let Some(line) = next else {
            log::debug!("stdin closed");
            return Ok(());
        };

        match ConsoleInput::parse(&line) {
            ConsoleInput::Empty => {}
            ConsoleInput::Device(text) => {
                if !manager.is_connected() {
                    eprintln!("Not connected (use :connect)");
                }
                manager.send(&text).await;
            }
            ConsoleInput::Local(cmd) => match cmd {
                LocalCommand::Help => print!("{}", console::help_text()),
                LocalCommand::Commands(filter) => {
                    print!("{}", console::format_commands(&catalog::filter(filter.as_deref().unwrap_or(""))))
                }
                LocalCommand::Macros => print!("{}", console::format_macros(catalog::MACROS)),
                LocalCommand::RunMacro(name) => match catalog::find_macro(&name) {
                    Some(m) => {
                        let manager = manager.clone();
                        let runner = runner.clone();
                        tokio::spawn(async move {
                            match runner.run(&manager, m.steps).await {
                                Ok(sent) => log::info!("Macro '{}' finished ({} steps)", m.name, sent),
                                Err(e) => eprintln!("Macro '{}' not started: {}", m.name, e),
                            }
                        });
                    }
                    None => eprintln!("Unknown macro: {}", name),
                },
                LocalCommand::Status => {
                    let snapshot = state_rx.borrow_and_update().clone();
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    println!("{}", serde_json::to_string_pretty(&manager.metrics())?);
                }
                LocalCommand::Connect(baud) => connect(manager, baud.unwrap_or(default_baud)).await,
                LocalCommand::Disconnect => {
                    manager.disconnect().await;
                    println!("Disconnected");
                }
                LocalCommand::Quit => return Ok(()),
                LocalCommand::Unknown(text) => eprintln!("Unknown command: {} (try :help)", text),
            },
        }
    }
}
