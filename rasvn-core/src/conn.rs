//! Buffered, incremental framing over a bidirectional byte stream.
//!
//! Both directions run through small fixed buffers. Payloads larger than a
//! buffer bypass it and go to the stream directly. Filling the read buffer
//! always flushes the write buffer first: requests and responses interleave
//! on one stream, and blocking on a read while the peer waits for our
//! buffered bytes would deadlock both sides.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};
use crate::item::{is_valid_word, Item};

const BUF_SIZE: usize = 4096;

/// Cooperative cancellation predicate, polled before blocking reads and
/// between dispatcher iterations.
pub type CancelFn = Arc<dyn Fn() -> bool + Send + Sync>;

fn is_ws(c: u8) -> bool {
    c == b' ' || c == b'\n'
}

/// A stateful protocol endpoint bound to one byte stream.
pub struct Connection<S> {
    stream: S,
    read_buf: Box<[u8; BUF_SIZE]>,
    read_ptr: usize,
    read_end: usize,
    write_buf: Box<[u8; BUF_SIZE]>,
    write_pos: usize,
    cancel: Option<CancelFn>,
    read_timeout: Option<Duration>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Connection<S> {
        Connection {
            stream,
            read_buf: Box::new([0; BUF_SIZE]),
            read_ptr: 0,
            read_end: 0,
            write_buf: Box::new([0; BUF_SIZE]),
            write_pos: 0,
            cancel: None,
            read_timeout: None,
        }
    }

    pub fn set_cancel_fn(&mut self, cancel: CancelFn) {
        self.cancel = Some(cancel);
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Surface a pending cancellation request as an error.
    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(f) if f() => Err(Error::new(ErrorKind::Cancelled, "operation cancelled")),
            _ => Ok(()),
        }
    }

    // --- write buffer ---

    /// Copy as much of `data` as fits into the write buffer; returns the
    /// number of bytes consumed.
    fn writebuf_push(&mut self, data: &[u8]) -> usize {
        let space = BUF_SIZE - self.write_pos;
        let copy = space.min(data.len());
        self.write_buf[self.write_pos..self.write_pos + copy].copy_from_slice(&data[..copy]);
        self.write_pos += copy;
        copy
    }

    /// Write all buffered bytes to the stream.
    pub async fn flush(&mut self) -> Result<()> {
        let mut count = 0;
        while count < self.write_pos {
            let n = self
                .stream
                .write(&self.write_buf[count..self.write_pos])
                .await
                .map_err(|e| Error::io(e, "write failure"))?;
            count += n;
        }
        self.write_pos = 0;
        Ok(())
    }

    async fn writebuf_write(&mut self, data: &[u8]) -> Result<()> {
        let mut data = data;
        if self.write_pos > 0 && self.write_pos + data.len() > BUF_SIZE {
            // Fill and then empty the buffer.
            let consumed = self.writebuf_push(data);
            data = &data[consumed..];
            self.flush().await?;
        }
        while data.len() > BUF_SIZE {
            // Save on copying by writing directly to the stream.
            let n = self
                .stream
                .write(data)
                .await
                .map_err(|e| Error::io(e, "write failure"))?;
            data = &data[n..];
        }
        self.writebuf_push(data);
        Ok(())
    }

    // --- read buffer ---

    /// Copy buffered bytes into `out`; returns the number copied.
    fn readbuf_drain(&mut self, out: &mut [u8]) -> usize {
        let avail = self.read_end - self.read_ptr;
        let copy = avail.min(out.len());
        out[..copy].copy_from_slice(&self.read_buf[self.read_ptr..self.read_ptr + copy]);
        self.read_ptr += copy;
        copy
    }

    async fn stream_read(&mut self, out: &mut [u8]) -> Result<usize> {
        let fut = self.stream.read(out);
        let n = match self.read_timeout {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| Error::new(ErrorKind::Io, "read timed out"))?,
            None => fut.await,
        };
        n.map_err(|e| Error::io(e, "read failure"))
    }

    /// Refill the read buffer, which must be empty. The write buffer is
    /// flushed first; see the module comment.
    async fn readbuf_fill(&mut self) -> Result<()> {
        assert_eq!(self.read_ptr, self.read_end, "read buffer not empty");
        self.flush().await?;
        self.check_cancelled()?;
        let timeout = self.read_timeout;
        let fut = self.stream.read(&mut self.read_buf[..]);
        let n = match timeout {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| Error::new(ErrorKind::Io, "read timed out"))?,
            None => fut.await,
        }
        .map_err(|e| Error::io(e, "read failure"))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::ConnectionClosed,
                "connection closed unexpectedly",
            ));
        }
        self.read_ptr = 0;
        self.read_end = n;
        Ok(())
    }

    async fn readbuf_getchar(&mut self) -> Result<u8> {
        if self.read_ptr == self.read_end {
            self.readbuf_fill().await?;
        }
        let c = self.read_buf[self.read_ptr];
        self.read_ptr += 1;
        Ok(c)
    }

    async fn readbuf_getchar_skip_whitespace(&mut self) -> Result<u8> {
        loop {
            let c = self.readbuf_getchar().await?;
            if !is_ws(c) {
                return Ok(c);
            }
        }
    }

    /// Read exactly `out.len()` bytes, draining the buffer first and reading
    /// large remainders directly from the stream.
    async fn readbuf_read(&mut self, out: &mut [u8]) -> Result<()> {
        let mut pos = self.readbuf_drain(out);
        while out.len() - pos > BUF_SIZE {
            self.flush().await?;
            let n = self.stream_read(&mut out[pos..]).await?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::ConnectionClosed,
                    "connection closed unexpectedly",
                ));
            }
            pos += n;
        }
        while pos < out.len() {
            self.readbuf_fill().await?;
            pos += self.readbuf_drain(&mut out[pos..]);
        }
        Ok(())
    }

    // --- writing data items ---

    pub async fn write_number(&mut self, n: u64) -> Result<()> {
        let rendered = format!("{n} ");
        self.writebuf_write(rendered.as_bytes()).await
    }

    pub async fn write_string(&mut self, s: &[u8]) -> Result<()> {
        let header = format!("{}:", s.len());
        self.writebuf_write(header.as_bytes()).await?;
        self.writebuf_write(s).await?;
        self.writebuf_write(b" ").await
    }

    pub async fn write_cstring(&mut self, s: &str) -> Result<()> {
        self.write_string(s.as_bytes()).await
    }

    pub async fn write_word(&mut self, w: &str) -> Result<()> {
        debug_assert!(is_valid_word(w), "invalid word {w:?}");
        self.writebuf_write(w.as_bytes()).await?;
        self.writebuf_write(b" ").await
    }

    pub async fn start_list(&mut self) -> Result<()> {
        self.writebuf_write(b"( ").await
    }

    pub async fn end_list(&mut self) -> Result<()> {
        self.writebuf_write(b") ").await
    }

    /// Write a whole item tree. The tree is rendered up front; the byte
    /// writer still streams large payloads past the buffer.
    pub async fn write_item(&mut self, item: &Item) -> Result<()> {
        let mut rendered = Vec::new();
        render_item(&mut rendered, item);
        self.writebuf_write(&rendered).await
    }

    // --- reading data items ---

    /// Read one item, of any kind.
    pub async fn read_item(&mut self) -> Result<Item> {
        let first = self.readbuf_getchar_skip_whitespace().await?;
        self.read_item_after(first).await
    }

    /// Parse one item whose first byte has already been consumed. Lists are
    /// handled iteratively with an explicit stack of open lists.
    async fn read_item_after(&mut self, first: u8) -> Result<Item> {
        let mut open: Vec<Vec<Item>> = Vec::new();
        let mut c = first;
        loop {
            let item = if c.is_ascii_digit() {
                // A number or a string; read the number part either way.
                let mut val = u64::from(c - b'0');
                loop {
                    c = self.readbuf_getchar().await?;
                    if !c.is_ascii_digit() {
                        break;
                    }
                    val = val
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(u64::from(c - b'0')))
                        .ok_or_else(|| Error::malformed("number overflows 64 bits"))?;
                }
                if c == b':' {
                    let mut data = vec![0u8; val as usize];
                    self.readbuf_read(&mut data).await?;
                    let term = self.readbuf_getchar().await?;
                    if !is_ws(term) {
                        return Err(Error::malformed("malformed network data"));
                    }
                    Item::Str(Bytes::from(data))
                } else {
                    if !is_ws(c) {
                        return Err(Error::malformed("malformed network data"));
                    }
                    Item::Number(val)
                }
            } else if c.is_ascii_alphabetic() {
                let mut word = String::new();
                word.push(c as char);
                loop {
                    c = self.readbuf_getchar().await?;
                    if c.is_ascii_alphanumeric() || c == b'-' {
                        word.push(c as char);
                    } else {
                        break;
                    }
                }
                if !is_ws(c) {
                    return Err(Error::malformed("malformed network data"));
                }
                Item::Word(word)
            } else if c == b'(' {
                open.push(Vec::new());
                c = self.readbuf_getchar_skip_whitespace().await?;
                continue;
            } else if c == b')' && !open.is_empty() {
                // A ')' is only reachable via the whitespace skip, so it is
                // always preceded by whitespace.
                let list = open.pop().expect("open list");
                let term = self.readbuf_getchar().await?;
                if !is_ws(term) {
                    return Err(Error::malformed("malformed network data"));
                }
                Item::List(list)
            } else {
                return Err(Error::malformed("malformed network data"));
            };

            match open.last_mut() {
                Some(parent) => {
                    parent.push(item);
                    c = self.readbuf_getchar_skip_whitespace().await?;
                }
                None => return Ok(item),
            }
        }
    }
}

fn render_item(out: &mut Vec<u8>, item: &Item) {
    match item {
        Item::Number(n) => {
            out.extend_from_slice(format!("{n} ").as_bytes());
        }
        Item::Str(s) => {
            out.extend_from_slice(format!("{}:", s.len()).as_bytes());
            out.extend_from_slice(s);
            out.push(b' ');
        }
        Item::Word(w) => {
            debug_assert!(is_valid_word(w), "invalid word {w:?}");
            out.extend_from_slice(w.as_bytes());
            out.push(b' ');
        }
        Item::List(items) => {
            out.extend_from_slice(b"( ");
            for sub in items {
                render_item(out, sub);
            }
            out.extend_from_slice(b") ");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::duplex;

    async fn roundtrip(item: Item) -> Item {
        // Roomy channel: the writer runs to completion before the reader.
        let (a, b) = duplex(64 * 1024);
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);
        tx.write_item(&item).await.unwrap();
        tx.flush().await.unwrap();
        rx.read_item().await.unwrap()
    }

    #[tokio::test]
    async fn item_roundtrips() {
        for item in [
            Item::Number(0),
            Item::Number((1 << 63) - 1),
            Item::Number(u64::MAX),
            Item::str(&b""[..]),
            Item::str(&b"hello world\n"[..]),
            Item::str(&b"\x00\xffbinary"[..]),
            Item::word("get-latest-rev"),
            Item::List(vec![]),
            Item::List(vec![
                Item::word("success"),
                Item::List(vec![Item::Number(42), Item::str(&b"a b"[..])]),
            ]),
        ] {
            assert_eq!(roundtrip(item.clone()).await, item);
        }
    }

    #[tokio::test]
    async fn wire_bytes_exact() {
        let (a, mut b) = duplex(256);
        let mut tx = Connection::new(a);
        tx.write_item(&Item::List(vec![Item::str(&b""[..])]))
            .await
            .unwrap();
        tx.write_string(b"hello world\n").await.unwrap();
        tx.write_number(9).await.unwrap();
        tx.flush().await.unwrap();
        drop(tx);
        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got[..], b"( 0: ) 12:hello world\n 9 ".as_slice());
    }

    #[tokio::test]
    async fn embedded_whitespace_string() {
        let (a, b) = duplex(64);
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);
        tx.write_string(b"hello world\n").await.unwrap();
        tx.write_word("done").await.unwrap();
        tx.flush().await.unwrap();
        let item = rx.read_item().await.unwrap();
        assert_eq!(item, Item::str(&b"hello world\n"[..]));
        assert_eq!(rx.read_item().await.unwrap(), Item::word("done"));
    }

    #[tokio::test]
    async fn large_string_bypasses_buffer() {
        let payload = vec![0xabu8; BUF_SIZE * 3 + 17];
        let item = roundtrip(Item::str(payload.clone())).await;
        assert_eq!(item.as_str().unwrap().as_ref(), &payload[..]);
    }

    #[tokio::test]
    async fn malformed_inputs() {
        for bad in [
            &b"@ "[..],   // unknown first byte
            &b"3:ab"[..], // truncated string payload
            &b"12x "[..], // number with a non-whitespace terminator
        ] {
            let (a, b) = duplex(64);
            let mut tx = Connection::new(a);
            let mut rx = Connection::new(b);
            tx.writebuf_write(bad).await.unwrap();
            tx.flush().await.unwrap();
            drop(tx);
            assert!(rx.read_item().await.is_err());
        }
    }

    #[tokio::test]
    async fn word_terminator_must_be_whitespace() {
        let (a, b) = duplex(64);
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);
        tx.writebuf_write(b"abc( ").await.unwrap();
        tx.flush().await.unwrap();
        let err = rx.read_item().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[tokio::test]
    async fn closed_stream_is_connection_closed() {
        let (a, b) = duplex(64);
        let rx_side = Connection::new(a);
        drop(rx_side);
        let mut rx = Connection::new(b);
        let err = rx.read_item().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn read_flushes_pending_writes() {
        // Each side writes a small item (too small to flush on its own) and
        // then blocks reading. Without flush-before-read both would hang.
        let (a, b) = duplex(BUF_SIZE);
        let left = tokio::spawn(async move {
            let mut conn = Connection::new(a);
            conn.write_number(1).await.unwrap();
            conn.read_item().await.unwrap()
        });
        let right = tokio::spawn(async move {
            let mut conn = Connection::new(b);
            conn.write_number(2).await.unwrap();
            conn.read_item().await.unwrap()
        });
        let (l, r) = (left.await.unwrap(), right.await.unwrap());
        assert_eq!(l, Item::Number(2));
        assert_eq!(r, Item::Number(1));
    }

    #[tokio::test]
    async fn cancellation_fires_before_blocking_read() {
        let (a, _keep_open) = duplex(64);
        let mut conn = Connection::new(a);
        let flag = Arc::new(AtomicBool::new(true));
        let f = flag.clone();
        conn.set_cancel_fn(Arc::new(move || f.load(Ordering::Relaxed)));
        let err = conn.read_item().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn read_timeout_surfaces_as_io() {
        let (a, _keep_open) = duplex(64);
        let mut conn = Connection::new(a);
        conn.set_read_timeout(Some(Duration::from_millis(10)));
        let err = conn.read_item().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
    }
}
