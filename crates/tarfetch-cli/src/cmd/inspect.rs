//! `tarfetch inspect` - list the entries of a stored shard

use std::io::Read;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, CellAlignment, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use tarfetch_core::{fmt_bytes, fmt_num};

use super::StoreArgs;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Shard name, e.g. crawl-12.tar
    pub name: String,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// One tar entry as listed by `inspect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
    /// PAX attribute keys, in archive order
    pub pax_keys: Vec<String>,
}

/// Walk a tar stream and collect entry names, sizes and PAX keys.
pub fn list_entries(reader: impl Read) -> Result<Vec<EntryInfo>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries().context("Cannot read tar stream")? {
        let mut entry = entry.context("Corrupt tar entry")?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let size = entry.header().size()?;
        let mut pax_keys = Vec::new();
        if let Some(exts) = entry.pax_extensions()? {
            for ext in exts {
                pax_keys.push(ext?.key()?.to_string());
            }
        }
        out.push(EntryInfo {
            name,
            size,
            pax_keys,
        });
    }
    Ok(out)
}

pub fn run(args: InspectArgs, config: &Config) -> Result<()> {
    let store = args.store.open(config, false)?;
    let reader = store
        .read(&args.name)
        .with_context(|| format!("Cannot read shard {}", args.name))?;
    let entries = list_entries(reader).with_context(|| format!("{}: invalid shard", args.name))?;

    if entries.is_empty() {
        eprintln!("{}: empty shard", args.name);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Entry").fg(Color::Cyan),
            Cell::new("Size").fg(Color::Cyan),
            Cell::new("Metadata").fg(Color::Cyan),
        ]);

    let mut total = 0u64;
    for e in &entries {
        total += e.size;
        table.add_row(vec![
            Cell::new(&e.name),
            Cell::new(fmt_bytes(e.size)).set_alignment(CellAlignment::Right),
            Cell::new(e.pax_keys.join(", ")),
        ]);
    }

    eprintln!("\n{table}");
    eprintln!(
        "  {}: {} entries, {}",
        args.name,
        fmt_num(entries.len()),
        fmt_bytes(total)
    );
    Ok(())
}
