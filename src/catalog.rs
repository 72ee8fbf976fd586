//! Static Marauder command reference and macro definitions.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandCategory {
    General,
    WifiScan,
    WifiAttack,
    Bluetooth,
    Aux,
}

impl CommandCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCategory::General => "General",
            CommandCategory::WifiScan => "WiFi Scan",
            CommandCategory::WifiAttack => "WiFi Attack",
            CommandCategory::Bluetooth => "Bluetooth",
            CommandCategory::Aux => "Aux",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarauderCommand {
    pub cmd: &'static str,
    pub description: &'static str,
    pub category: CommandCategory,
}

#[derive(Debug, Clone, Serialize)]
pub struct Macro {
    pub name: &'static str,
    pub description: &'static str,
    pub steps: &'static [&'static str],
}

const fn command(
    cmd: &'static str,
    description: &'static str,
    category: CommandCategory,
) -> MarauderCommand {
    MarauderCommand { cmd, description, category }
}

pub static COMMANDS: &[MarauderCommand] = &[
    command("help", "Display available commands", CommandCategory::General),
    command("reboot", "Reboot the ESP32 Marauder", CommandCategory::General),
    command("info", "Show device information", CommandCategory::General),
    command("scanap", "Scan for Access Points", CommandCategory::WifiScan),
    command("scansta", "Scan for Stations", CommandCategory::WifiScan),
    command("stopscan", "Stop any running scan", CommandCategory::WifiScan),
    command("attack -t deauth", "Deauthentication Attack", CommandCategory::WifiAttack),
    command("attack -t beacon", "Beacon Spam Attack", CommandCategory::WifiAttack),
    command("evilportal -c start", "Start Evil Portal", CommandCategory::WifiAttack),
    command("btspamall", "Spam Bluetooth devices", CommandCategory::Bluetooth),
    command("sniffbt", "Sniff Bluetooth traffic", CommandCategory::Bluetooth),
    command("listap", "List discovered Access Points", CommandCategory::Aux),
    command("select -a all", "Select all discovered APs", CommandCategory::Aux),
    command("clearap", "Clear the list of APs", CommandCategory::Aux),
];

pub static MACROS: &[Macro] = &[
    Macro {
        name: "Full Recon",
        description: "Scan APs, then stations, then list all.",
        steps: &["scanap", "stopscan", "scansta", "stopscan", "listap"],
    },
    Macro {
        name: "Target & Deauth",
        description: "Scan, select target index, and attack.",
        steps: &["scanap", "stopscan", "select -a 0", "attack -t deauth"],
    },
];

/// Case-insensitive search over command, description and category name
pub fn filter(query: &str) -> Vec<&'static MarauderCommand> {
    let needle = query.trim().to_lowercase();
    COMMANDS
        .iter()
        .filter(|c| {
            needle.is_empty()
                || c.cmd.to_lowercase().contains(&needle)
                || c.description.to_lowercase().contains(&needle)
                || c.category.as_str().to_lowercase().contains(&needle)
        })
        .collect()
}

/// Look up a macro by case-insensitive name or 1-based index
pub fn find_macro(name_or_index: &str) -> Option<&'static Macro> {
    let key = name_or_index.trim();
    if let Ok(index) = key.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| MACROS.get(i));
    }
    MACROS.iter().find(|m| m.name.eq_ignore_ascii_case(key))
}
