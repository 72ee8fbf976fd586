//! Line-oriented console front-end: input classification, listings and the
//! stdin-backed port picker.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::catalog::{Macro, MarauderCommand};
use crate::serial::{DeviceDescriptor, PortPicker};

/// Local commands start with ':' and never reach the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    Help,
    Commands(Option<String>),
    Macros,
    RunMacro(String),
    Status,
    Connect(Option<u32>),
    Disconnect,
    Quit,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Empty,
    Device(String),
    Local(LocalCommand),
}

impl ConsoleInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ConsoleInput::Empty;
        }
        let Some(rest) = line.strip_prefix(':') else {
            return ConsoleInput::Device(line.to_string());
        };

        let (word, arg) = match rest.split_once(char::is_whitespace) {
            Some((w, a)) => (w, Some(a.trim()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };

        let cmd = match word.to_lowercase().as_str() {
            "help" | "?" => LocalCommand::Help,
            "commands" | "cmds" => LocalCommand::Commands(arg.map(str::to_string)),
            "macros" => LocalCommand::Macros,
            "macro" => match arg {
                Some(name) => LocalCommand::RunMacro(name.to_string()),
                None => LocalCommand::Macros,
            },
            "status" => LocalCommand::Status,
            "connect" => match arg.map(str::parse::<u32>) {
                None => LocalCommand::Connect(None),
                Some(Ok(baud)) => LocalCommand::Connect(Some(baud)),
                Some(Err(_)) => LocalCommand::Unknown(line.to_string()),
            },
            "disconnect" => LocalCommand::Disconnect,
            "quit" | "exit" | "q" => LocalCommand::Quit,
            _ => LocalCommand::Unknown(line.to_string()),
        };
        ConsoleInput::Local(cmd)
    }
}

pub fn help_text() -> &'static str {
    concat!(
        "Anything not starting with ':' is sent to the device as-is.\n",
        "  :commands [filter]   command reference\n",
        "  :macros              list macros\n",
        "  :macro <name|n>      run a macro\n",
        "  :status              connection status\n",
        "  :connect [baud]      connect (default 115200)\n",
        "  :disconnect          close the port\n",
        "  :quit                disconnect and exit\n",
    )
}

pub fn format_commands(commands: &[&MarauderCommand]) -> String {
    if commands.is_empty() {
        return "No matching commands\n".to_string();
    }
    let width = commands.iter().map(|c| c.cmd.len()).max().unwrap_or(0);
    let mut out = String::new();
    for c in commands {
        out.push_str(&format!(
            "  {:<width$}  {:<11}  {}\n",
            c.cmd,
            c.category.as_str(),
            c.description,
            width = width
        ));
    }
    out
}

pub fn format_macros(macros: &[Macro]) -> String {
    let mut out = String::new();
    for (i, m) in macros.iter().enumerate() {
        out.push_str(&format!("  {}. {} - {}\n", i + 1, m.name, m.description));
        out.push_str(&format!("     {}\n", m.steps.join(" -> ")));
    }
    out
}

pub fn format_ports(ports: &[DeviceDescriptor]) -> String {
    let mut out = String::new();
    for (i, p) in ports.iter().enumerate() {
        out.push_str(&format!(
            "  {}. {}  VID {} PID {}  {}\n",
            i + 1,
            p.port_name,
            p.vid_label(),
            p.pid_label(),
            p.product.as_deref().or(p.manufacturer.as_deref()).unwrap_or("")
        ));
    }
    out
}

pub type SharedLines = Arc<Mutex<Lines<BufReader<Stdin>>>>;

pub fn stdin_lines() -> SharedLines {
    Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
}

/// Asks on the console which port to open; blank input or `q` cancels
pub struct StdinPortPicker {
    lines: SharedLines,
}

impl StdinPortPicker {
    pub fn new(lines: SharedLines) -> Self {
        Self { lines }
    }
}

/// Parse a 1-based picker answer
pub fn parse_pick(answer: &str, count: usize) -> Option<usize> {
    let answer = answer.trim();
    if answer.is_empty() || answer.eq_ignore_ascii_case("q") {
        return None;
    }
    answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .filter(|&i| i < count)
}

#[async_trait::async_trait]
impl PortPicker for StdinPortPicker {
    async fn pick(&self, candidates: &[DeviceDescriptor]) -> Option<usize> {
        let mut stdout = tokio::io::stdout();
        let prompt = format!(
            "Select a port:\n{}Port number (blank to cancel): ",
            format_ports(candidates)
        );
        if let Err(e) = stdout.write_all(prompt.as_bytes()).await {
            log::warn!("Failed to write port prompt: {}", e);
        }
        let _ = stdout.flush().await;

        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(answer)) => {
                let picked = parse_pick(&answer, candidates.len());
                if picked.is_none() {
                    log::info!("Port selection cancelled");
                }
                picked
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to read port selection: {}", e);
                None
            }
        }
    }
}
