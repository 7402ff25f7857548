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

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::warn;
use structopt::StructOpt;

use crate::footer::mapping::FooterCatalog;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the mail filter.
    ///
    /// footer-milter listens on the configured address for milter
    /// connections from Postfix or Sendmail and handles each connection on
    /// its own thread. If `system_user` is configured, privileges are
    /// dropped once the socket is bound.
    Serve(CommonOptions),
    Rewrite(RewriteSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `footer-milter.toml` etc
    /// [default: /etc/footer-milter or /usr/local/etc/footer-milter]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

/// Show what the filter would do to a message.
///
/// The message is read from FILE, or standard input by default, and put
/// through the same processing as a message received from the MTA with the
/// given envelope sender. The header that would be added and the new body
/// are written to standard output. If the message would pass through
/// unmodified, nothing is written and the exit status is 1.
///
/// The message may use UNIX or DOS line endings.
#[derive(StructOpt)]
pub(super) struct RewriteSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// The envelope sender of the message.
    #[structopt(short, long)]
    pub(super) sender: String,

    /// The MTA name to report in the added header
    /// [default: `daemon_name` from the configuration]
    #[structopt(short, long)]
    pub(super) daemon: Option<String>,

    /// The file containing the message. "-" reads from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) file: PathBuf,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Serve(common) => {
            let (root, system_config, catalog) = load_system(common);
            init_daemon_log(&root);
            super::serve::serve(system_config, catalog);
        },
        Command::Rewrite(mut cmd) => {
            let common = std::mem::take(&mut cmd.common);
            let (_, system_config, catalog) = load_system(common);
            crate::init_simple_log();
            super::rewrite::rewrite(system_config, catalog, cmd);
        },
    }
}

fn load_system(
    common: CommonOptions,
) -> (PathBuf, SystemConfig, FooterCatalog) {
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/footer-milter/footer-milter.toml").is_file() {
            "/etc/footer-milter".to_owned().into()
        } else if Path::new("/usr/local/etc/footer-milter/footer-milter.toml")
            .is_file()
        {
            "/usr/local/etc/footer-milter".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/footer-milter nor /usr/local/etc/footer-milter\n\
                 looks like the footer-milter root; use\n\
                 --root=/path/to/footer-milter if your installation is\n\
                 elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("footer-milter.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        eprintln!("Error reading '{}': {}", system_config_path.display(), e);
        EX_CONFIG.exit();
    }

    let mut system_config: SystemConfig =
        match toml::from_slice(&system_config_toml) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    system_config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            },
        };

    if system_config.milter.daemon_name.is_empty() {
        system_config.milter.daemon_name = host_name();
    }

    // Relative to the root, unless absolute
    let catalog_path = root.join(&system_config.footers.path);
    let catalog = match FooterCatalog::load(catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("{}", e);
            EX_CONFIG.exit()
        },
    };

    (root, system_config, catalog)
}

fn host_name() -> String {
    let mut buf = [0u8; 256];
    let host_name = match nix::unistd::gethostname(&mut buf) {
        Ok(host_name) => host_name,
        Err(e) => {
            eprintln!(
                "Failed to determine host name; you may need to explicitly \
                 configure daemon_name: {}",
                e
            );
            EX_OSERR.exit()
        },
    };

    match host_name.to_str() {
        Ok(host_name) => host_name.to_owned(),
        Err(_) => {
            eprintln!("System host name is not UTF-8");
            EX_OSERR.exit()
        },
    }
}

fn init_daemon_log(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // log4rs *or* syslog, since log4rs has no syslog appender of its own
    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            eprintln!(
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_MAIL,
        hostname: None,
        process: env!("CARGO_PKG_NAME").to_owned(),
        pid: nix::unistd::getpid().as_raw(),
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            if let Err(e) = log::set_boxed_logger(Box::new(
                syslog::BasicLogger::new(logger),
            )) {
                eprintln!("Failed to initialise logging: {}", e);
                EX_SOFTWARE.exit();
            }
            log::set_max_level(log::LevelFilter::Info);
        },
        Err(e) => {
            crate::init_simple_log();
            warn!("Unable to connect to syslog, logging to stderr: {}", e);
        },
    }
}
