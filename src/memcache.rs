//! Minimal memcached text-protocol client for the shared cache.
//!
//! Only `get` and `set` are spoken, one TCP connection per operation, first
//! reachable server wins. Values placed here are already sealed by the
//! cache layer; this module never sees plaintext.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MemcacheClient {
    servers: Vec<String>,
}

impl MemcacheClient {
    pub fn new(servers: Vec<String>) -> MemcacheClient {
        MemcacheClient { servers }
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for server in &self.servers {
            match TcpStream::connect(server) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(IO_TIMEOUT))?;
                    stream.set_write_timeout(Some(IO_TIMEOUT))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no memcache servers configured")
        }))
    }

    pub fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let mut stream = self.connect()?;
        stream.write_all(format!("set {key} 0 0 {}\r\n", value.len()).as_bytes())?;
        stream.write_all(value)?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim_end() == "STORED" {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("memcache set refused: {}", line.trim_end()),
            ))
        }
    }

    pub fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let mut stream = self.connect()?;
        stream.write_all(format!("get {key}\r\n").as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let header = header.trim_end();

        if header == "END" {
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes>
        let mut parts = header.split_whitespace();
        if parts.next() != Some("VALUE") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected memcache reply: {header}"),
            ));
        }
        let len: usize = parts
            .nth(2)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad VALUE header"))?;

        let mut value = vec![0u8; len];
        reader.read_exact(&mut value)?;
        let mut trailer = [0u8; 2];
        reader.read_exact(&mut trailer)?; // CRLF after the data block

        let mut end = String::new();
        reader.read_line(&mut end)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn set_then_get_round_trips() {
        let (addr, _table) = testutil::spawn_fake_memcached();
        let client = MemcacheClient::new(vec![addr]);
        client.set("skeepd:ns:k:", b"\x00binary\xffvalue").unwrap();
        assert_eq!(
            client.get("skeepd:ns:k:").unwrap().unwrap(),
            b"\x00binary\xffvalue"
        );
    }

    #[test]
    fn absent_key_is_none() {
        let (addr, _table) = testutil::spawn_fake_memcached();
        let client = MemcacheClient::new(vec![addr]);
        assert!(client.get("skeepd:ns:missing:").unwrap().is_none());
    }

    #[test]
    fn unreachable_server_is_an_io_error() {
        let client = MemcacheClient::new(vec!["127.0.0.1:1".to_string()]);
        assert!(client.get("k").is_err());
        assert!(client.set("k", b"v").is_err());
    }

    #[test]
    fn no_servers_is_an_io_error() {
        let client = MemcacheClient::new(Vec::new());
        assert!(client.get("k").is_err());
    }
}
