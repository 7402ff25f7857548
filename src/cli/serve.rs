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
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::footer::mapping::FooterCatalog;
use crate::milter::server::Server;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::{MilterConfig, SystemConfig};
use crate::support::unix_privileges;

// Need to use this and not eprintln! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

const IO_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Where the MTA connects to.
enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub fn serve(system_config: SystemConfig, catalog: FooterCatalog) {
    let listen = system_config.milter.listen.clone();
    let listener = bind(&listen);

    // The socket is bound; nothing else needs privileges
    if let Err(exit) = unix_privileges::assume_system(&system_config.security)
    {
        exit.exit();
    }

    info!("Listening for MTA connections on {}", listen);

    let config = Arc::new(system_config.milter);
    let catalog = Arc::new(catalog);

    match listener {
        Listener::Tcp(listener) => {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    },
                };

                let peer_name = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown-socket".to_owned());
                // The MTA expects answers quickly, so don't let them sit in
                // the send buffer
                let _ = stream.set_nodelay(true);
                let _ = stream.set_read_timeout(Some(IO_TIMEOUT));
                let _ = stream.set_write_timeout(Some(IO_TIMEOUT));

                match stream.try_clone() {
                    Ok(read) => spawn_connection(
                        read, stream, peer_name, &catalog, &config,
                    ),
                    Err(e) => {
                        warn!("{} Unable to set up I/O: {}", peer_name, e)
                    },
                }
            }
        },

        Listener::Unix(listener) => {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    },
                };

                let _ = stream.set_read_timeout(Some(IO_TIMEOUT));
                let _ = stream.set_write_timeout(Some(IO_TIMEOUT));

                match stream.try_clone() {
                    Ok(read) => spawn_connection(
                        read,
                        stream,
                        "unix".to_owned(),
                        &catalog,
                        &config,
                    ),
                    Err(e) => warn!("Unable to set up I/O: {}", e),
                }
            }
        },
    }
}

/// Bind to `listen`, which is either a socket address or `unix:` followed
/// by a path.
fn bind(listen: &str) -> Listener {
    if let Some(path) = listen.strip_prefix("unix:") {
        let path = Path::new(path);
        // A socket left over from a previous run prevents binding
        match fs::remove_file(path) {
            Ok(()) => (),
            Err(e) if io::ErrorKind::NotFound == e.kind() => (),
            Err(e) => fatal!(
                EX_CANTCREAT,
                "Unable to remove old socket '{}': {}",
                path.display(),
                e
            ),
        }

        match UnixListener::bind(path) {
            Ok(listener) => Listener::Unix(listener),
            Err(e) => fatal!(
                EX_OSERR,
                "Unable to listen on '{}': {}",
                path.display(),
                e
            ),
        }
    } else {
        match TcpListener::bind(listen) {
            Ok(listener) => Listener::Tcp(listener),
            Err(e) => fatal!(EX_OSERR, "Unable to listen on {}: {}", listen, e),
        }
    }
}

fn spawn_connection<S: Read + Write + Send + 'static>(
    read: S,
    write: S,
    peer_name: String,
    catalog: &Arc<FooterCatalog>,
    config: &Arc<MilterConfig>,
) {
    let catalog = Arc::clone(catalog);
    let config = Arc::clone(config);
    let log_prefix = LogPrefix::new(format!("milter:{}", peer_name));

    let spawned = thread::Builder::new()
        .name(format!("milter:{}", peer_name))
        .spawn(move || {
            info!("{} Connection established", log_prefix);
            let mut server = Server::new(
                io::BufReader::new(read),
                io::BufWriter::new(write),
                catalog,
                config,
                log_prefix.clone(),
            );

            match server.run() {
                Ok(()) => info!("{} Normal MTA disconnect", log_prefix),
                Err(e) => {
                    warn!("{} Abnormal MTA disconnect: {}", log_prefix, e)
                },
            }
        });

    if let Err(e) = spawned {
        error!("milter:{} Unable to start thread: {}", peer_name, e);
    }
}
