mod server_monitor_actor;
mod server_monitor_handle;
mod server_monitor_helpers;

pub(crate) use server_monitor_actor::*;
pub(crate) use server_monitor_handle::*;
pub(crate) use server_monitor_helpers::*;
