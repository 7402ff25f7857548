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
use std::sync::Arc;

use log::info;

use super::main::RewriteSubcommand;
use crate::footer::mapping::FooterCatalog;
use crate::footer::session::{FooterSession, Modification};
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

pub(super) fn rewrite(
    system_config: SystemConfig,
    catalog: FooterCatalog,
    cmd: RewriteSubcommand,
) {
    let mut message = Vec::new();
    let read_result = if "-" == cmd.file.as_os_str() {
        io::stdin().read_to_end(&mut message)
    } else {
        fs::File::open(&cmd.file).and_then(|mut f| f.read_to_end(&mut message))
    };
    if let Err(e) = read_result {
        eprintln!("Error reading '{}': {}", cmd.file.display(), e);
        EX_NOINPUT.exit();
    }

    let mut session = FooterSession::new(
        Arc::new(catalog),
        Arc::new(system_config.milter),
        LogPrefix::new("rewrite".to_owned()),
    );

    // Feed the message through in the same shape the MTA would deliver it
    let (header, body) = split_message(&message);
    session.on_connect(cmd.daemon.as_deref());
    session.on_sender_known(&cmd.sender);
    for (name, value) in header_fields(header) {
        session.on_header(name, &value);
    }
    session.on_end_of_headers();
    session.on_body_chunk(body);
    let modifications = session.on_end_of_message();

    if modifications.is_empty() {
        info!("Message would pass through unmodified");
        std::process::exit(1);
    }

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    if let Err(e) = write_modifications(&mut stdout, &modifications) {
        eprintln!("Error writing output: {}", e);
        EX_IOERR.exit();
    }
}

fn write_modifications(
    mut out: impl Write,
    modifications: &[Modification],
) -> io::Result<()> {
    for modification in modifications {
        if let Modification::AddHeader { ref name, ref value } = *modification
        {
            writeln!(out, "{}: {}", name, value.replace('\n', "\n\t"))?;
        }
    }

    for modification in modifications {
        if let Modification::ReplaceBody(ref body) = *modification {
            out.write_all(b"\n")?;
            out.write_all(body)?;
        }
    }

    out.flush()
}

/// Split `message` after the blank line ending its header.
///
/// The header includes its final line ending. A message with no blank line
/// is all header.
fn split_message(message: &[u8]) -> (&[u8], &[u8]) {
    let mut start = 0;
    while start < message.len() {
        let line = match memchr::memchr(b'\n', &message[start..]) {
            Some(end) => &message[start..start + end + 1],
            None => &message[start..],
        };

        if b"\n" == line || b"\r\n" == line {
            return (&message[..start], &message[start + line.len()..]);
        }

        start += line.len();
    }

    (message, &[])
}

/// Break `header` into its fields the way an MTA reports them to a milter.
///
/// Continuation lines stay in the value, joined with bare line feeds. Lines
/// which are not part of any field are skipped.
fn header_fields(header: &[u8]) -> Vec<(&[u8], Vec<u8>)> {
    let mut fields: Vec<(&[u8], Vec<u8>)> = Vec::new();

    for line in header.split(|&b| b'\n' == b) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if b' ' == line[0] || b'\t' == line[0] {
            if let Some(&mut (_, ref mut value)) = fields.last_mut() {
                value.push(b'\n');
                value.extend_from_slice(line);
            }
            continue;
        }

        if let Some(colon) = memchr::memchr(b':', line) {
            let name = &line[..colon];
            let value = &line[colon + 1..];
            let value = value.strip_prefix(b" ").unwrap_or(value);
            fields.push((name, value.to_vec()));
        }
    }

    fields
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_message_finds_blank_line() {
        assert_eq!(
            (&b"Subject: foo\r\n"[..], &b"body\r\n\r\nmore\r\n"[..]),
            split_message(b"Subject: foo\r\n\r\nbody\r\n\r\nmore\r\n")
        );
        assert_eq!(
            (&b"Subject: foo\n"[..], &b""[..]),
            split_message(b"Subject: foo\n\n")
        );
        assert_eq!(
            (&b"Subject: foo\n"[..], &b""[..]),
            split_message(b"Subject: foo\n")
        );
        assert_eq!((&b""[..], &b"body\n"[..]), split_message(b"\nbody\n"));
    }

    #[test]
    fn header_fields_unfold_like_mta() {
        let fields = header_fields(
            b"From: alice@example.com\r\n\
              Content-Type: multipart/mixed;\r\n\
              \tboundary=foo\r\n\
              X-Empty:\r\n\
              garbage\r\n",
        );

        assert_eq!(3, fields.len());
        assert_eq!(
            (&b"From"[..], b"alice@example.com".to_vec()),
            fields[0]
        );
        assert_eq!(
            (
                &b"Content-Type"[..],
                b"multipart/mixed;\n\tboundary=foo".to_vec()
            ),
            fields[1]
        );
        assert_eq!((&b"X-Empty"[..], Vec::new()), fields[2]);
    }

    #[test]
    fn modifications_written_as_message() {
        let mut out = Vec::new();
        write_modifications(
            &mut out,
            &[
                Modification::ReplaceBody(b"Hello\nRegards\n".to_vec()),
                Modification::AddHeader {
                    name: "X-Footer".to_owned(),
                    value: "Mail body modified\nby smtpd".to_owned(),
                },
            ],
        )
        .unwrap();

        assert_eq!(
            "X-Footer: Mail body modified\n\tby smtpd\n\nHello\nRegards\n",
            String::from_utf8(out).unwrap()
        );
    }
}
