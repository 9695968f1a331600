//! Server-mode driver
//!
//! A long-running co-process speaking a minimal line protocol over the
//! standard streams. One request is two lines (entry specifier, props
//! JSON); one response is a header block, a blank line, then exactly
//! `Length` bytes of body. Every failure becomes a `Status:Error`
//! response; the loop only ends on EOF.
//!
//! Standard out carries protocol bytes only. Console lines captured during
//! request *i* are flushed to stderr before response *i* is written.

use std::io::{self, BufRead, Write};

use crate::ops::ConsoleLine;
use crate::sandbox::Sandbox;

/// Response status line values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The render completed; the body is the rendered string
    Ok,
    /// The render failed; the body is the error message
    Error,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Error => "Error",
        }
    }
}

/// One parsed request
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    /// Entry module specifier
    pub entry: String,
    /// Props JSON for the render
    pub props: String,
}

/// Run the server loop until EOF on standard input.
pub fn run(sandbox: &mut Sandbox) -> io::Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let stdout = io::stdout();
    let mut output = stdout.lock();

    tracing::info!("server mode: reading requests from stdin");

    while let Some(request) = read_request(&mut input)? {
        match sandbox.render(&request.entry, &request.props) {
            Ok(render) => {
                emit_console(&render.console);
                write_response(&mut output, Status::Ok, render.body.as_bytes())?;
            }
            Err(err) => {
                write_response(&mut output, Status::Error, err.to_string().as_bytes())?;
            }
        }
    }

    tracing::info!("stdin closed; shutting down");
    Ok(())
}

/// Read one two-line request. `None` means EOF (clean shutdown), including
/// EOF in the middle of a request.
fn read_request(input: &mut impl BufRead) -> io::Result<Option<Request>> {
    let mut entry = String::new();
    if input.read_line(&mut entry)? == 0 {
        return Ok(None);
    }

    let mut props = String::new();
    if input.read_line(&mut props)? == 0 {
        return Ok(None);
    }

    Ok(Some(Request {
        entry: trim_line(&entry),
        props: trim_line(&props),
    }))
}

fn trim_line(line: &str) -> String {
    line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()
}

/// Write one framed response. `Length` is the exact byte count of the body.
fn write_response(output: &mut impl Write, status: Status, body: &[u8]) -> io::Result<()> {
    write!(output, "Status:{}\nLength:{}\n\n", status.as_str(), body.len())?;
    output.write_all(body)?;
    output.flush()
}

/// Print captured console lines to stderr, level-tagged.
pub fn emit_console(lines: &[ConsoleLine]) {
    for line in lines {
        eprintln!("[{}] {}", line.level, line.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_request() {
        let mut input = Cursor::new("entry.js\n{\"name\":\"Ada\"}\n");
        let request = read_request(&mut input).unwrap().unwrap();
        assert_eq!(request.entry, "entry.js");
        assert_eq!(request.props, r#"{"name":"Ada"}"#);
    }

    #[test]
    fn test_read_request_crlf() {
        let mut input = Cursor::new("entry.js\r\n{}\r\n");
        let request = read_request(&mut input).unwrap().unwrap();
        assert_eq!(request.entry, "entry.js");
        assert_eq!(request.props, "{}");
    }

    #[test]
    fn test_read_request_eof() {
        let mut input = Cursor::new("");
        assert!(read_request(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_read_request_truncated_is_eof() {
        let mut input = Cursor::new("entry.js\n");
        assert!(read_request(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_read_two_requests() {
        let mut input = Cursor::new("a.js\n{}\nb.js\n{\"x\":1}\n");
        let first = read_request(&mut input).unwrap().unwrap();
        let second = read_request(&mut input).unwrap().unwrap();
        assert_eq!(first.entry, "a.js");
        assert_eq!(second.entry, "b.js");
        assert_eq!(second.props, r#"{"x":1}"#);
    }

    #[test]
    fn test_write_ok_response() {
        let mut output = Vec::new();
        write_response(&mut output, Status::Ok, b"hello Ada").unwrap();
        assert_eq!(output, b"Status:Ok\nLength:9\n\nhello Ada");
    }

    #[test]
    fn test_write_error_response() {
        let mut output = Vec::new();
        write_response(&mut output, Status::Error, b"RenderError: boom").unwrap();
        assert_eq!(output, b"Status:Error\nLength:17\n\nRenderError: boom");
    }

    #[test]
    fn test_length_counts_bytes_not_chars() {
        let mut output = Vec::new();
        let body = "héllo".as_bytes();
        write_response(&mut output, Status::Ok, body).unwrap();
        let expected = format!("Status:Ok\nLength:{}\n\nhéllo", body.len());
        assert_eq!(output, expected.as_bytes());
    }

    #[test]
    fn test_multiline_body_not_framed_internally() {
        let mut output = Vec::new();
        write_response(&mut output, Status::Ok, b"line one\nline two\n").unwrap();
        assert_eq!(output, b"Status:Ok\nLength:18\n\nline one\nline two\n");
    }
}
