use std::process;

use anyhow::Result;
use chrono::{Duration, Local, NaiveDate};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nibble_core::analytics::{self, DaySummary};
use nibble_core::models::GoalConfiguration;
use nibble_core::session::SyncSession;

use super::helpers::{no_neg_zero, parse_date, truncate};

pub(crate) fn print_day_summary(summary: &DaySummary) {
    let date = summary.date;
    println!("=== {date} ===\n");

    for group in &summary.categories {
        let label = group.category.as_str().to_uppercase();
        let sub_cal = no_neg_zero(group.subtotal.calories);
        println!("  {label} ({sub_cal:.0} kcal)");
        for e in &group.entries {
            let name = truncate(&e.name, 40);
            let quantity = if e.quantity.is_empty() {
                String::new()
            } else {
                format!(" ({})", e.quantity)
            };
            let id = &e.id;
            let cal = e.calories;
            let (p, c, f) = (e.protein, e.carbs, e.fat);
            println!("    [{id}] {name}{quantity}: {cal:.0} kcal | P:{p:.0}g C:{c:.0}g F:{f:.0}g");
        }
        println!();
    }

    let t = &summary.totals;
    let (total_cal, total_p, total_c, total_f) = (
        no_neg_zero(t.calories),
        no_neg_zero(t.protein),
        no_neg_zero(t.carbs),
        no_neg_zero(t.fat),
    );
    println!("  TOTAL: {total_cal:.0} kcal | P:{total_p:.0}g C:{total_c:.0}g F:{total_f:.0}g");

    if let Some(goal) = &summary.goal {
        let gcal = goal.daily_calories;
        let rcal = summary.remaining_calories.unwrap_or(gcal - total_cal);
        if let (Some(pg), Some(cg), Some(fg)) = (goal.protein_g, goal.carbs_g, goal.fat_g) {
            println!("  GOAL: {gcal:.0} kcal | P:{pg:.0}g C:{cg:.0}g F:{fg:.0}g");
            let rp = pg - total_p;
            let rc = cg - total_c;
            let rf = fg - total_f;
            println!("  REMAINING: {rcal:.0} kcal | P:{rp:.0}g C:{rc:.0}g F:{rf:.0}g");
        } else {
            println!("  GOAL: {gcal:.0} kcal");
            println!("  REMAINING: {rcal:.0} kcal");
        }
    }
}

pub(crate) async fn cmd_summary(
    session: &SyncSession,
    goal: Option<&GoalConfiguration>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    session.load(date).await?;
    let entries = session.cache().entries_for(date);
    let summary = analytics::day_summary(date, &entries, goal);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.categories.is_empty() {
        eprintln!("No entries for {date}");
        process::exit(2);
    }

    print_day_summary(&summary);
    Ok(())
}

/// Dates from `anchor` backwards, newest first.
fn days_back(anchor: NaiveDate, days: u32) -> impl Iterator<Item = NaiveDate> {
    (0..i64::from(days)).map(move |i| anchor - Duration::days(i))
}

pub(crate) async fn cmd_history(
    session: &SyncSession,
    goal: Option<&GoalConfiguration>,
    days: u32,
    json: bool,
) -> Result<()> {
    #[derive(Tabled)]
    struct HistoryRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Calories")]
        calories: String,
        #[tabled(rename = "Protein")]
        protein: String,
        #[tabled(rename = "Carbs")]
        carbs: String,
        #[tabled(rename = "Fat")]
        fat: String,
        #[tabled(rename = "Remaining")]
        remaining: String,
    }

    let today = Local::now().date_naive();
    session.cache().load_history(today, days).await?;
    let entries = session.cache().history_entries();
    let shown = session.cache().window().lookback.map_or(days, |range| {
        u32::try_from((range.end - range.start).num_days() + 1).unwrap_or(days)
    });

    let summaries: Vec<DaySummary> = days_back(today, shown)
        .map(|date| analytics::day_summary(date, &entries, goal))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.iter().all(|s| s.categories.is_empty()) {
        eprintln!("No entries in the last {shown} days");
        process::exit(2);
    }

    let rows: Vec<HistoryRow> = summaries
        .iter()
        .map(|s| {
            let cal = no_neg_zero(s.totals.calories);
            let p = no_neg_zero(s.totals.protein);
            let c = no_neg_zero(s.totals.carbs);
            let f = no_neg_zero(s.totals.fat);
            HistoryRow {
                date: s.date.to_string(),
                calories: format!("{cal:.0}"),
                protein: format!("{p:.0}g"),
                carbs: format!("{c:.0}g"),
                fat: format!("{f:.0}g"),
                remaining: s
                    .remaining_calories
                    .map_or("-".to_string(), |r| format!("{:.0}", no_neg_zero(r))),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}
