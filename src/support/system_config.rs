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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for footer-milter.
///
/// This is stored in a file named `footer-milter.toml` under the
/// configuration root, which is typically `/usr/local/etc/footer-milter` or
/// `/etc/footer-milter`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Options relating to operational security.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Configuration for the milter listener and message handling.
    ///
    /// The defaults are reasonable for most installations.
    #[serde(default)]
    pub milter: MilterConfig,

    /// Where to find the footer catalog.
    #[serde(default)]
    pub footers: FooterConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// If non-empty, set the process UID to this value after the listening
    /// socket has been bound but before accepting any connection. The name
    /// must refer to a non-root user.
    ///
    /// The footer catalog is reloaded while running, so it must remain
    /// readable by this user.
    #[serde(default)]
    pub system_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MilterConfig {
    /// The address to listen on. This is either a TCP socket address such
    /// as `127.0.0.1:10099`, or `unix:` followed by the path of a UNIX
    /// socket to create.
    pub listen: String,

    /// The name to report in the modification header when the MTA does not
    /// provide a `{daemon_name}` macro.
    ///
    /// If unset, the system host name is used.
    pub daemon_name: String,

    /// The maximum number of header and body bytes accumulated for a single
    /// message. Larger messages pass through without a footer.
    pub max_message_size: usize,

    /// The name of the header added to every message which received a
    /// footer.
    pub header_name: String,
}

impl Default for MilterConfig {
    fn default() -> Self {
        MilterConfig {
            listen: "127.0.0.1:10099".to_owned(),
            daemon_name: String::new(),
            max_message_size: 50 * 1024 * 1024,
            header_name: "X-FooterMilter-Modified".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FooterConfig {
    /// The path to the footer catalog, relative to the configuration root.
    ///
    /// The catalog is reread after a message completes if its modification
    /// time has changed.
    pub path: PathBuf,
}

impl Default for FooterConfig {
    fn default() -> Self {
        FooterConfig {
            path: "footers.toml".into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!("127.0.0.1:10099", config.milter.listen);
        assert_eq!("X-FooterMilter-Modified", config.milter.header_name);
        assert_eq!(PathBuf::from("footers.toml"), config.footers.path);
        assert!(config.security.system_user.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let config: SystemConfig = toml::from_str(
            r#"
[security]
system_user = "milter"

[milter]
listen = "[::1]:8891"
daemon_name = "mail.example.com"
max_message_size = 1024

[footers]
path = "/srv/footers.toml"
"#,
        )
        .unwrap();

        assert_eq!("milter", config.security.system_user);
        assert_eq!("[::1]:8891", config.milter.listen);
        assert_eq!("mail.example.com", config.milter.daemon_name);
        assert_eq!(1024, config.milter.max_message_size);
        assert_eq!("X-FooterMilter-Modified", config.milter.header_name);
        assert_eq!(PathBuf::from("/srv/footers.toml"), config.footers.path);
    }
}
