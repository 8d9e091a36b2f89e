mod entry;
mod goal;
mod helpers;
mod stats;
mod status;
mod summary;
mod watch;

pub(crate) use entry::{LogArgs, MacroArgs, UpdateArgs, cmd_delete, cmd_log, cmd_update};
pub(crate) use goal::{cmd_goal_set, cmd_goal_show};
pub(crate) use helpers::connect;
pub(crate) use stats::cmd_stats;
pub(crate) use status::cmd_status;
pub(crate) use summary::{cmd_history, cmd_summary};
pub(crate) use watch::cmd_watch;
