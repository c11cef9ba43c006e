//! FTP reply plumbing: upstream replies ride inside synthetic HTTP-shaped
//! wrappers (`FTP-Status`, `FTP-Reason`, `FTP-Pre`), and the gateway
//! reconstructs correct single- or multi-line FTP replies from them.

use bytes::{BufMut, BytesMut};

use crate::errors::FtpProtocolError;

/// The wrapper a relayed upstream reply travels in.
#[derive(Debug, Clone, Default)]
pub struct ReplyWrapper {
    /// `FTP-Status`: the upstream status code, when the reply is a genuine
    /// FTP one. Foreign (internally-generated) replies have none.
    pub status: Option<u16>,
    /// `FTP-Reason`: the final reply line's text.
    pub reason: Option<String>,
    /// `FTP-Pre`: preamble lines of a multi-line reply, unquoted.
    pub pre: Vec<String>,
}

impl ReplyWrapper {
    pub fn new(status: u16, reason: &str) -> ReplyWrapper {
        ReplyWrapper {
            status: Some(status),
            reason: Some(reason.to_string()),
            pre: Vec::new(),
        }
    }

    pub fn foreign(reason: &str) -> ReplyWrapper {
        ReplyWrapper {
            status: None,
            reason: Some(reason.to_string()),
            pre: Vec::new(),
        }
    }

    /// Whether this is a real FTP reply rather than an internal error.
    pub fn is_ftp(&self) -> bool {
        self.status.is_some()
    }

    /// Reconstruct the wire form: preamble lines first, then the
    /// `STATUS REASON` terminator.
    pub fn print(&self, out: &mut BytesMut) {
        for line in &self.pre {
            out.put_slice(line.as_bytes());
            out.put_slice(b"\r\n");
        }
        if let Some(status) = self.status {
            let reason = self.reason.as_deref().unwrap_or("");
            out.put_slice(format!("{status} {reason}\r\n").as_bytes());
        }
    }
}

/// Quote one preamble line in the reference format: `"` line `"`.
pub fn quote_pre(line: &str) -> String {
    format!("\"{}\"", line.replace('"', "\"\""))
}

/// Undo `quote_pre`. Returns None for values that are not quoted strings.
pub fn unquote_pre(value: &str) -> Option<String> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\"\"", "\""))
}

/// Accumulating parser for raw FTP control replies, including multi-line
/// `NNN-` blocks terminated by a matching `NNN ` line.
#[derive(Default)]
pub struct ReplyParser {
    lines: Vec<String>,
}

/// One complete upstream reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    pub code: u16,
    /// All lines, final one included, without CRLF.
    pub lines: Vec<String>,
}

impl RawReply {
    /// The final line's text after the code.
    pub fn reason(&self) -> &str {
        let last = self.lines.last().map(String::as_str).unwrap_or("");
        last.get(4..).unwrap_or("")
    }

    pub fn into_wrapper(self) -> ReplyWrapper {
        let reason = self.reason().to_string();
        let n = self.lines.len();
        ReplyWrapper {
            status: Some(self.code),
            reason: Some(reason),
            pre: self.lines.into_iter().take(n - 1).collect(),
        }
    }
}

impl ReplyParser {
    pub fn new() -> ReplyParser {
        ReplyParser::default()
    }

    /// Feed one input buffer; consumes complete CRLF lines from `buf` and
    /// returns a reply once its terminating line has arrived.
    pub fn advance(&mut self, buf: &mut BytesMut) -> Result<Option<RawReply>, FtpProtocolError> {
        while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
            let raw = buf.split_to(nl + 1);
            let line = std::str::from_utf8(&raw)
                .map_err(|_| FtpProtocolError::ForeignReply)?
                .trim_end_matches(['\r', '\n'])
                .to_string();
            self.lines.push(line);

            if let Some(reply) = self.take_if_complete()? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    fn take_if_complete(&mut self) -> Result<Option<RawReply>, FtpProtocolError> {
        let first = self.lines.first().ok_or(FtpProtocolError::ForeignReply)?;
        let code: u16 = first
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or(FtpProtocolError::ForeignReply)?;

        let last = self.lines.last().expect("at least one line");
        let terminated = last.len() >= 4
            && last.starts_with(&format!("{code:03}"))
            && last.as_bytes()[3] == b' ';
        let single = self.lines.len() == 1 && first.len() == 3;

        if terminated || single {
            let lines = std::mem::take(&mut self.lines);
            Ok(Some(RawReply { code, lines }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_reply() {
        let mut p = ReplyParser::new();
        let mut buf = BytesMut::from(&b"230 User logged in\r\n"[..]);
        let reply = p.advance(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code, 230);
        assert_eq!(reply.reason(), "User logged in");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multi_line_reply_waits_for_terminator() {
        let mut p = ReplyParser::new();
        let mut buf = BytesMut::from(&b"211-Features:\r\n MDTM\r\n SIZE\r\n"[..]);
        assert!(p.advance(&mut buf).unwrap().is_none());

        let mut rest = BytesMut::from(&b"211 End\r\n"[..]);
        let reply = p.advance(&mut rest).unwrap().unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.lines.len(), 4);
        assert_eq!(reply.reason(), "End");

        let w = reply.into_wrapper();
        assert_eq!(w.status, Some(211));
        assert_eq!(w.pre.len(), 3);
        assert_eq!(w.pre[1], " MDTM");
    }

    #[test]
    fn test_partial_lines_buffer() {
        let mut p = ReplyParser::new();
        let mut buf = BytesMut::from(&b"150 Opening"[..]);
        assert!(p.advance(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b" data connection\r\n");
        let reply = p.advance(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code, 150);
    }

    #[test]
    fn test_garbage_is_a_foreign_reply() {
        let mut p = ReplyParser::new();
        let mut buf = BytesMut::from(&b"not ftp at all\r\n"[..]);
        assert!(p.advance(&mut buf).is_err());
    }

    #[test]
    fn test_print_reconstructs_multiline() {
        let mut w = ReplyWrapper::new(226, "Transfer complete");
        w.pre.push("226-Details:".to_string());
        let mut out = BytesMut::new();
        w.print(&mut out);
        assert_eq!(&out[..], b"226-Details:\r\n226 Transfer complete\r\n");
    }

    #[test]
    fn test_quote_round_trip() {
        for s in ["EPSV", " MDTM", "has \"quotes\" inside"] {
            assert_eq!(unquote_pre(&quote_pre(s)).unwrap(), s);
        }
        assert!(unquote_pre("no quotes").is_none());
    }
}
