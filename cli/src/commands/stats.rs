use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nibble_core::analytics::{Achievement, Dashboard, TrendDirection, find_achievement};
use nibble_core::session::SyncSession;

use crate::config::Config;

use super::helpers::no_neg_zero;

/// Achievements look back further than the weekly report.
const STATS_LOOKBACK_DAYS: u32 = 30;

fn arrow(direction: TrendDirection) -> &'static str {
    match direction {
        TrendDirection::Up => "↑",
        TrendDirection::Down => "↓",
        TrendDirection::Flat => "→",
    }
}

fn print_dashboard(dash: &Dashboard, unlocked: &[&Achievement]) {
    #[derive(Tabled)]
    struct TrendRow {
        #[tabled(rename = "Metric")]
        metric: String,
        #[tabled(rename = "This week")]
        current: String,
        #[tabled(rename = "Last week")]
        previous: String,
        #[tabled(rename = "Change")]
        change: String,
    }

    let stats = &dash.stats;
    println!("Streak: {} day(s) (longest {})", dash.streak, stats.longest_streak);
    println!(
        "Logged: {} entries over {} day(s)",
        stats.entry_count, stats.days_logged
    );
    if let (Some(days), Some(rate)) = (dash.week.goal_days, dash.week.achievement_rate) {
        let pct = rate * 100.0;
        println!("On target: {days}/7 days this week ({pct:.0}%)");
    }
    println!();

    let rows: Vec<TrendRow> = dash
        .week
        .trends
        .iter()
        .map(|t| TrendRow {
            metric: t.metric.to_string(),
            current: format!("{:.0}", no_neg_zero(t.current)),
            previous: format!("{:.0}", no_neg_zero(t.previous)),
            change: format!("{} {:.0}", arrow(t.trend.direction), t.trend.magnitude()),
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    if !unlocked.is_empty() {
        println!("\nAchievements:");
        for a in unlocked {
            println!("  * {}: {}", a.name, a.description);
        }
    }
    if !dash.newly_unlocked.is_empty() {
        println!("\nNew!");
        for a in &dash.newly_unlocked {
            println!("  * {}: {}", a.name, a.description);
        }
    }
}

pub(crate) async fn cmd_stats(session: &SyncSession, config: &Config, json: bool) -> Result<()> {
    #[derive(Serialize)]
    struct StatsOutput<'a> {
        #[serde(flatten)]
        dashboard: &'a Dashboard,
        unlocked: Vec<&'a str>,
    }

    let today = Local::now().date_naive();
    session
        .cache()
        .load_history(today, STATS_LOOKBACK_DAYS)
        .await?;

    let mut unlocked = config.load_achievements()?;
    let dash = session.dashboard(config.goal(), today, &unlocked);

    let earlier: Vec<&Achievement> = unlocked.iter().filter_map(|id| find_achievement(id)).collect();
    if json {
        let output = StatsOutput {
            dashboard: &dash,
            unlocked: earlier.iter().map(|a| a.id).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_dashboard(&dash, &earlier);
    }

    if !dash.newly_unlocked.is_empty() {
        unlocked.extend(dash.newly_unlocked.iter().map(|a| a.id.to_string()));
        config.save_achievements(&unlocked)?;
    }
    Ok(())
}
