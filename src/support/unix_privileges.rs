//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of footer-milter.
//
// footer-milter is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// footer-milter is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// footer-milter. If not, see <http://www.gnu.org/licenses/>.

use std::ffi::CString;

use log::{error, info};

use super::sysexits::*;
use super::system_config::SecurityConfig;

/// If a system user is configured, switch to it if not already that user.
///
/// On failure, an error message has already been logged, and the appropriate
/// exit code is returned.
pub fn assume_system(security: &SecurityConfig) -> Result<(), Sysexit> {
    macro_rules! fatal {
        ($sysexit:expr, $($stuff:tt)*) => {{
            error!($($stuff)*);
            return Err($sysexit)
        }}
    }

    if security.system_user.is_empty() {
        return Ok(());
    }

    let system_user =
        match nix::unistd::User::from_name(&security.system_user) {
            Ok(Some(user)) => user,
            Ok(None) => fatal!(
                EX_NOUSER,
                "system_user '{}' does not exist!",
                security.system_user
            ),
            Err(e) => fatal!(
                EX_OSFILE,
                "Unable to look up system_user '{}': {}",
                security.system_user,
                e
            ),
        };

    if nix::unistd::ROOT == system_user.uid {
        fatal!(
            EX_CONFIG,
            "system_user '{}' must not be root",
            security.system_user
        );
    }

    if system_user.uid == nix::unistd::getuid() {
        return Ok(());
    }

    let user_name = match CString::new(system_user.name.clone()) {
        Ok(name) => name,
        Err(_) => fatal!(EX_CONFIG, "system_user contains a NUL byte"),
    };

    if let Err(e) = nix::unistd::initgroups(&user_name, system_user.gid) {
        fatal!(EX_OSERR, "Unable to set up groups for system user: {}", e);
    }

    if let Err(e) = nix::unistd::setgid(system_user.gid)
        .and_then(|_| nix::unistd::setuid(system_user.uid))
    {
        fatal!(
            EX_OSERR,
            "Failed to set UID:GID to {}:{}: {}",
            system_user.uid,
            system_user.gid,
            e
        );
    }

    info!(
        "Dropped privileges to {} ({}:{})",
        security.system_user, system_user.uid, system_user.gid
    );
    Ok(())
}
