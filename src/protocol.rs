//! The wire protocol: one command line in, bytes or a status line out.
//!
//! Grammar per connection: `<cmd> <arg>` terminated by CR, LF, or CRLF,
//! both tokens word characters only. `set` is the only command that reads
//! further bytes (the opaque value, until EOF); nothing after the first
//! line is ever interpreted as text.

use std::io::{self, BufRead};

pub const STORED: &[u8] = b"STORED\r\n";
pub const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
pub const ERROR: &[u8] = b"ERROR\r\n";
pub const CLIENT_ERROR_SYNTAX: &[u8] = b"CLIENT_ERROR invalid syntax\r\n";
pub const CLIENT_ERROR_ACCESS: &[u8] = b"CLIENT_ERROR access denied\r\n";

/// Upper bound on the command line; anything longer is malformed.
const MAX_LINE: usize = 4096;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Set(String),
    /// Well-formed line, verb we do not serve.
    Unknown,
}

fn is_word(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Read the command line, consuming the terminator but nothing past it.
///
/// A bare CR terminates the line; a following LF is consumed only when it
/// is actually an LF, so a `set` body beginning with arbitrary bytes
/// survives intact.
pub fn read_command_line<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte)? {
            0 => return Ok(line), // EOF before terminator
            _ => match byte[0] {
                b'\n' => return Ok(line),
                b'\r' => {
                    let peeked = reader.fill_buf()?;
                    if peeked.first() == Some(&b'\n') {
                        reader.consume(1);
                    }
                    return Ok(line);
                }
                other => {
                    if line.len() > MAX_LINE {
                        return Ok(line); // overlong, parser will reject
                    }
                    line.push(other);
                }
            },
        }
    }
}

/// Parse the command line. `Err(())` is the invalid-syntax wire reply;
/// `Ok(Command::Unknown)` is a well-formed verb we answer `ERROR` to.
pub fn parse_command(line: &[u8]) -> Result<Command, ()> {
    if line.len() > MAX_LINE {
        return Err(());
    }
    let text = std::str::from_utf8(line).map_err(|_| ())?;
    let mut tokens = text.split(' ');
    let (Some(cmd), Some(arg), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(());
    };
    if !is_word(cmd) || !is_word(arg) {
        return Err(());
    }
    Ok(match cmd {
        "get" => Command::Get(arg.to_string()),
        "set" => Command::Set(arg.to_string()),
        _ => Command::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Read};

    fn read_line(bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut reader = BufReader::new(bytes);
        let line = read_command_line(&mut reader).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        (line, rest)
    }

    #[test]
    fn accepts_all_three_terminators() {
        for input in [&b"get k\n"[..], b"get k\r", b"get k\r\n"] {
            let (line, rest) = read_line(input);
            assert_eq!(line, b"get k");
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn body_after_terminator_is_untouched() {
        let (line, rest) = read_line(b"set k\r\n\r\nbinary\x00body\r");
        assert_eq!(line, b"set k");
        assert_eq!(rest, b"\r\nbinary\x00body\r");

        // A bare CR terminator must not eat a body that starts with
        // something other than LF.
        let (line, rest) = read_line(b"set k\rXYZ");
        assert_eq!(line, b"set k");
        assert_eq!(rest, b"XYZ");
    }

    #[test]
    fn parses_known_verbs() {
        assert_eq!(
            parse_command(b"get some_key1"),
            Ok(Command::Get("some_key1".into()))
        );
        assert_eq!(
            parse_command(b"set some_key1"),
            Ok(Command::Set("some_key1".into()))
        );
    }

    #[test]
    fn well_formed_unknown_verb_is_unknown() {
        assert_eq!(parse_command(b"delete foo"), Ok(Command::Unknown));
        assert_eq!(parse_command(b"GET foo"), Ok(Command::Unknown));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        for line in [
            &b""[..],
            b"get",
            b"get ",
            b" get k",
            b"get  k",
            b"get bad-key",
            b"get a b",
            b"get k\x00",
            b"g\xffet k",
        ] {
            assert_eq!(parse_command(line), Err(()), "{line:?} accepted");
        }
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut line = b"get ".to_vec();
        line.extend(std::iter::repeat(b'a').take(MAX_LINE + 10));
        let mut reader = BufReader::new(&line[..]);
        let read = read_command_line(&mut reader).unwrap();
        assert!(parse_command(&read).is_err());
    }
}
