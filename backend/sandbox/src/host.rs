//! Host group membership.
//!
//! VirtualBox only passes USB devices through for members of `vboxusers`.
//! The check reads the groups of the running process rather than
//! `/etc/group`, so a freshly added membership that needs a re-login is
//! reported as missing.

use nix::unistd::{getegid, getgroups, Group};
use tracing::debug;

use usbcage_core::CageError;

/// Names of the current process's effective and supplementary groups.
pub fn current_group_names() -> Result<Vec<String>, CageError> {
    let mut gids = getgroups().map_err(std::io::Error::from)?;
    gids.push(getegid());
    gids.sort_by_key(|g| g.as_raw());
    gids.dedup();

    let mut names = Vec::with_capacity(gids.len());
    for gid in gids {
        match Group::from_gid(gid).map_err(std::io::Error::from)? {
            Some(group) => names.push(group.name),
            None => debug!(gid = gid.as_raw(), "Group id without a name"),
        }
    }
    Ok(names)
}

pub fn user_in_group(group: &str) -> Result<bool, CageError> {
    Ok(current_group_names()?.iter().any(|g| g == group))
}
