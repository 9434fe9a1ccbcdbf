//! Target backend registration and dispatch
//!
//! This module provides a centralized registry for all target backends, with
//! support for feature-gated inclusion and dynamic help text generation.

use gnwflash_core::target::TargetMemory;

/// Information about a target backend
pub struct TargetInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names/aliases
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// Get information about all available backends (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_targets() -> Vec<TargetInfo> {
    let mut targets = Vec::new();

    #[cfg(feature = "probe")]
    targets.push(TargetInfo {
        name: "probe-rs",
        aliases: &["probe", "swd"],
        description: "Any SWD debug probe supported by probe-rs (ST-Link, J-Link, CMSIS-DAP)",
    });

    #[cfg(feature = "dummy")]
    targets.push(TargetInfo {
        name: "dummy",
        aliases: &[],
        description: "In-memory flashapp emulator for testing",
    });

    targets
}

/// Generate help text listing all available backends
pub fn target_help() -> String {
    let targets = available_targets();

    if targets.is_empty() {
        return "No target backends available (recompile with backend features enabled)"
            .to_string();
    }

    let mut help = String::from("Available targets:\n");
    for t in &targets {
        let aliases = if t.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", t.aliases.join(", "))
        };
        help.push_str(&format!("  {:10} - {}{}\n", t.name, t.description, aliases));
    }
    help
}

/// Generate a short list of backend names for CLI help
pub fn target_names_short() -> String {
    let targets = available_targets();
    let names: Vec<&str> = targets.iter().map(|t| t.name).collect();
    names.join(", ")
}

/// Resolve a name or alias to the canonical backend name
pub fn find_target(name: &str) -> Option<&'static str> {
    available_targets()
        .into_iter()
        .find(|t| t.name == name || t.aliases.contains(&name))
        .map(|t| t.name)
}

/// Open the named backend
#[allow(unused_variables)]
pub fn open_target(
    name: &str,
    chip: &str,
) -> Result<Box<dyn TargetMemory>, Box<dyn std::error::Error>> {
    let canonical_name = find_target(name).ok_or_else(|| unknown_target_error(name))?;

    match canonical_name {
        #[cfg(feature = "probe")]
        "probe-rs" => {
            let target = gnwflash_probe::ProbeTarget::attach(chip).map_err(|e| {
                format!(
                    "{}\nMake sure the probe is connected and the Game & Watch is powered on.",
                    e
                )
            })?;
            Ok(Box::new(target))
        }

        #[cfg(feature = "dummy")]
        "dummy" => Ok(Box::new(gnwflash_dummy::DummyFlashApp::new_default()?)),

        _ => Err(unknown_target_error(name)),
    }
}

fn unknown_target_error(name: &str) -> Box<dyn std::error::Error> {
    format!("Unknown target: {}\n\n{}", name, target_help()).into()
}
