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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement.
///
/// The prefix starts out as the peer description of the connection. The
/// daemon name lasts for the whole connection, while the queue id and sender
/// are cleared after every message.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    peer: String,
    daemon: Option<String>,
    queue_id: Option<String>,
    sender: Option<String>,
}

impl LogPrefix {
    pub fn new(peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peer,
                daemon: None,
                queue_id: None,
                sender: None,
            })),
        }
    }

    pub fn set_daemon(&self, daemon: String) {
        self.inner.lock().unwrap().daemon = Some(sanitise(daemon));
    }

    pub fn set_queue_id(&self, queue_id: String) {
        self.inner.lock().unwrap().queue_id = Some(sanitise(queue_id));
    }

    pub fn set_sender(&self, sender: String) {
        self.inner.lock().unwrap().sender = Some(sanitise(sender));
    }

    /// Forget everything specific to the message that just finished.
    pub fn clear_message(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue_id = None;
        inner.sender = None;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.peer)?;

        let fields = [
            ("daemon", &inner.daemon),
            ("id", &inner.queue_id),
            ("from", &inner.sender),
        ];
        let mut first = true;
        for &(name, value) in &fields {
            if let Some(ref value) = *value {
                let sep = if first { "[" } else { " " };
                write!(f, "{}{}={}", sep, name, value)?;
                first = false;
            }
        }

        if !first {
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_tracks_message_fields() {
        let prefix = LogPrefix::new("milter:127.0.0.1:4000".to_owned());
        assert_eq!("milter:127.0.0.1:4000", prefix.to_string());

        let clone = prefix.clone();
        clone.set_daemon("smtpd".to_owned());
        clone.set_queue_id("4ABC\r\n".to_owned());
        clone.set_sender("alice@example.com".to_owned());
        assert_eq!(
            "milter:127.0.0.1:4000[daemon=smtpd id=4ABC \
             from=alice@example.com]",
            prefix.to_string()
        );

        prefix.clear_message();
        assert_eq!("milter:127.0.0.1:4000[daemon=smtpd]", clone.to_string());
    }
}
