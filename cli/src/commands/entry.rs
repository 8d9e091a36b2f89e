use std::process;

use anyhow::{Result, bail};

use nibble_core::error::SyncError;
use nibble_core::models::{EntryId, EntryPatch, NewEntry, parse_category};
use nibble_core::session::SyncSession;

use super::helpers::{json_error, parse_amount, parse_date};

/// Macro values as typed on the command line, before parsing.
pub(crate) struct MacroArgs {
    pub calories: Option<String>,
    pub protein: Option<String>,
    pub carbs: Option<String>,
    pub fat: Option<String>,
}

fn parse_optional(label: &str, value: Option<&String>) -> Result<Option<f64>> {
    value.map(|v| parse_amount(label, v)).transpose()
}

pub(crate) struct LogArgs {
    pub name: String,
    pub macros: MacroArgs,
    pub meal: String,
    pub quantity: Option<String>,
    pub notes: Option<String>,
    pub date: Option<String>,
}

pub(crate) async fn cmd_log(session: &SyncSession, args: LogArgs, json: bool) -> Result<()> {
    let Some(calories) = parse_optional("calories", args.macros.calories.as_ref())? else {
        bail!("Calories are required");
    };
    let entry = NewEntry {
        category: parse_category(&args.meal)?,
        name: args.name.trim().to_string(),
        quantity: args.quantity.unwrap_or_default(),
        calories,
        protein: parse_optional("protein", args.macros.protein.as_ref())?.unwrap_or(0.0),
        carbs: parse_optional("carbs", args.macros.carbs.as_ref())?.unwrap_or(0.0),
        fat: parse_optional("fat", args.macros.fat.as_ref())?.unwrap_or(0.0),
        notes: args.notes.filter(|n| !n.trim().is_empty()),
        date: parse_date(args.date)?,
    };

    let id = session.create(entry.clone()).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "id": id, "entry": entry })
        );
    } else {
        let name = &entry.name;
        let meal = entry.category;
        let date = entry.date;
        let cal = entry.calories;
        println!("Logged {name} for {meal} on {date}: {cal:.0} kcal [{id}]");
    }
    Ok(())
}

pub(crate) struct UpdateArgs {
    pub name: Option<String>,
    pub macros: MacroArgs,
    pub meal: Option<String>,
    pub quantity: Option<String>,
    pub notes: Option<String>,
    pub clear_notes: bool,
    pub date: Option<String>,
}

fn build_patch(args: UpdateArgs) -> Result<EntryPatch> {
    if args.clear_notes && args.notes.is_some() {
        bail!("Use either --notes or --clear-notes, not both");
    }
    let notes = if args.clear_notes {
        Some(None)
    } else {
        args.notes.map(Some)
    };
    let patch = EntryPatch {
        category: args.meal.as_deref().map(parse_category).transpose()?,
        name: args.name.map(|n| n.trim().to_string()),
        quantity: args.quantity,
        calories: parse_optional("calories", args.macros.calories.as_ref())?,
        protein: parse_optional("protein", args.macros.protein.as_ref())?,
        carbs: parse_optional("carbs", args.macros.carbs.as_ref())?,
        fat: parse_optional("fat", args.macros.fat.as_ref())?,
        notes,
        date: args.date.map(Some).map(parse_date).transpose()?,
    };
    if patch.is_empty() {
        bail!("Nothing to update. Provide at least one field to change");
    }
    Ok(patch)
}

fn not_found(entry_id: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(&format!("Entry {entry_id} not found")));
    } else {
        eprintln!("Entry {entry_id} not found");
    }
    process::exit(2);
}

pub(crate) async fn cmd_update(
    session: &SyncSession,
    entry_id: &str,
    args: UpdateArgs,
    json: bool,
) -> Result<()> {
    let patch = build_patch(args)?;
    match session.update(&EntryId::new(entry_id), patch.clone()).await {
        Ok(()) => {}
        Err(SyncError::NotFound(_)) => not_found(entry_id, json),
        Err(e) => return Err(e.into()),
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "updated": entry_id, "changes": patch })
        );
    } else {
        println!("Updated entry {entry_id}");
    }
    Ok(())
}

pub(crate) async fn cmd_delete(session: &SyncSession, entry_id: &str, json: bool) -> Result<()> {
    match session.delete(&EntryId::new(entry_id)).await {
        Ok(()) => {}
        Err(SyncError::NotFound(_)) => not_found(entry_id, json),
        Err(e) => return Err(e.into()),
    }

    if json {
        println!("{}", serde_json::json!({ "deleted": entry_id }));
    } else {
        println!("Deleted entry {entry_id}");
    }
    Ok(())
}
