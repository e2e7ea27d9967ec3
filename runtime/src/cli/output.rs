//! Output helpers shared by subcommands.
//!
//! Global flags are published as `HARVEST_*` environment variables by
//! `main` so every command can check them without threading arguments.

use crate::progress::HarvestItem;
use serde::Serialize;
use std::io::Write;

pub fn is_json() -> bool {
    flag("HARVEST_JSON")
}

pub fn is_quiet() -> bool {
    flag("HARVEST_QUIET")
}

pub fn is_verbose() -> bool {
    flag("HARVEST_VERBOSE")
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

/// Pretty-print a JSON value on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("  Error: could not serialize output: {e}"),
    }
}

/// One output item per stdout line.
pub fn print_item(out: &mut impl Write, item: &HarvestItem) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, item)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Human status line on stderr, suppressed by `--quiet` and `--json`.
pub fn status(message: impl std::fmt::Display) {
    if !is_quiet() && !is_json() {
        eprintln!("  {message}");
    }
}
