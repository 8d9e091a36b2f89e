use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info};

use nibble_core::analytics;
use nibble_core::connection::ConnectionState;
use nibble_core::models::GoalConfiguration;
use nibble_core::session::SyncSession;

use super::helpers::parse_date;
use super::summary::print_day_summary;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

fn render(
    session: &SyncSession,
    goal: Option<&GoalConfiguration>,
    date: NaiveDate,
    json: bool,
) -> Result<()> {
    let entries = session.cache().entries_for(date);
    let summary = analytics::day_summary(date, &entries, goal);
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        print_day_summary(&summary);
        println!();
    }
    Ok(())
}

/// Print the day's summary, then reprint whenever the live feed changes it. Runs until Ctrl-C.
pub(crate) async fn cmd_watch(
    session: &SyncSession,
    goal: Option<&GoalConfiguration>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let mut revisions = session.cache().watch_revision();
    let mut connection = session.watch_connection();

    session.load(date).await?;
    revisions.borrow_and_update();
    render(session, goal, date, json)?;
    if !json {
        eprintln!("Watching {date} (Ctrl-C to stop)");
    }

    let mut reconnect = tokio::time::interval(RECONNECT_INTERVAL);
    reconnect.tick().await;

    loop {
        let disconnected = *connection.borrow() == ConnectionState::Disconnected;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                revisions.borrow_and_update();
                render(session, goal, date, json)?;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!(%state, "connection changed");
                if !json {
                    eprintln!("Connection: {state}");
                }
            }
            _ = reconnect.tick(), if disconnected => {
                // The session refetches the day once the feed is back.
                let state = session.test_connection().await;
                debug!(%state, "reconnect attempt");
            }
        }
    }

    Ok(())
}
