mod goal;
mod helpers;
mod progress;
mod remote;
mod summary;
mod user;

pub(crate) use goal::{cmd_goal_history, cmd_goal_show};
pub(crate) use progress::{cmd_progress_monthly, cmd_progress_weekly};
pub(crate) use remote::{cmd_remote_status, cmd_remote_summary};
pub(crate) use summary::cmd_summary;
pub(crate) use user::{ProfileArgs, cmd_user_create, cmd_user_delete, cmd_user_list};
