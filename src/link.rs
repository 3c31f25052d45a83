use crate::{DaqError, DaqResult, DeviceSettings, Packet, Word};
use log::{debug, info, warn};
use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    thread,
    time::Duration,
};

pub const CMD_NUM_WORDS: &[u8] = b"sendnumw";
pub const CMD_SEND_DATA: &[u8] = b"senddata";
/// Width of the ASCII decimal word-count reply.
pub const COUNT_REPLY_LEN: usize = 10;
pub const DEFAULT_DEVICE_PORT: u16 = 8888;

/// TCP session with the device.
///
/// Generic over the stream so the protocol can run over anything `Read + Write`; in
/// production this is a `TcpStream`.
#[derive(Debug)]
pub struct DeviceLink<S = TcpStream> {
    stream: S,
    packet_size: usize,
    backoff: Duration,
    buffer: Vec<u8>,
}

impl DeviceLink<TcpStream> {
    pub fn connect(address: &str, settings: &DeviceSettings) -> DaqResult<Self> {
        let addr = resolve(address)?;
        info!("Connecting to device at {addr}");
        let stream = TcpStream::connect_timeout(
            &addr,
            Duration::from_millis(settings.connect_timeout_ms),
        )
        .map_err(|e| DaqError::link(&format!("connect {addr}"), e))?;
        let io_timeout = Some(Duration::from_millis(settings.read_timeout_ms.max(1)));
        stream
            .set_read_timeout(io_timeout)
            .map_err(|e| DaqError::link("set read timeout", e))?;
        stream
            .set_write_timeout(io_timeout)
            .map_err(|e| DaqError::link("set write timeout", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DaqError::link("set nodelay", e))?;
        info!("Connected to device at {addr}");
        Ok(Self::new(
            stream,
            settings.packet_size,
            Duration::from_secs_f64(1.0 / settings.max_rate),
        ))
    }

    /// `connect`, retried `connect_retries` more times `connect_retry_ms` apart.
    pub fn connect_with_retry(address: &str, settings: &DeviceSettings) -> DaqResult<Self> {
        let mut attempt = 0;
        loop {
            match Self::connect(address, settings) {
                Ok(link) => return Ok(link),
                Err(e) if attempt < settings.connect_retries => {
                    attempt += 1;
                    warn!(
                        "Device connect failed ({e}), retry {attempt}/{}",
                        settings.connect_retries
                    );
                    thread::sleep(Duration::from_millis(settings.connect_retry_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A second handle on the socket, used to unblock a read from another thread.
    pub fn interrupter(&self) -> DaqResult<LinkInterrupter> {
        self.stream
            .try_clone()
            .map(LinkInterrupter)
            .map_err(|e| DaqError::link("clone device socket", e))
    }
}

/// Shuts the device socket down so a blocked `poll` returns with an error.
#[derive(Debug)]
pub struct LinkInterrupter(TcpStream);

impl LinkInterrupter {
    pub fn interrupt(&self) {
        if let Err(e) = self.0.shutdown(Shutdown::Both) {
            debug!("Device socket shutdown: {e}");
        }
    }
}

impl<S: Read + Write> DeviceLink<S> {
    pub fn new(stream: S, packet_size: usize, backoff: Duration) -> Self {
        Self {
            stream,
            packet_size,
            backoff,
            buffer: vec![0u8; 4 * packet_size],
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// How many words the device currently holds.
    pub fn buffered_words(&mut self) -> DaqResult<usize> {
        self.stream
            .write_all(CMD_NUM_WORDS)
            .map_err(|e| DaqError::link("send sendnumw", e))?;
        let mut reply = [0u8; COUNT_REPLY_LEN];
        self.stream
            .read_exact(&mut reply)
            .map_err(|e| DaqError::link("read word count", e))?;
        parse_count(&reply)
    }

    /// Request one packet and read exactly `4 * packet_size` bytes.
    pub fn fetch_packet(&mut self) -> DaqResult<Packet> {
        self.stream
            .write_all(CMD_SEND_DATA)
            .map_err(|e| DaqError::link("send senddata", e))?;
        self.stream
            .read_exact(&mut self.buffer)
            .map_err(|e| DaqError::link("read packet", e))?;
        Ok(words_from_le_bytes(&self.buffer))
    }

    /// One poll cycle. `Ok(None)` means fewer than `packet_size` words are buffered and
    /// the caller should back off before retrying.
    pub fn poll(&mut self) -> DaqResult<Option<Packet>> {
        let available = self.buffered_words()?;
        if available < self.packet_size {
            debug!("Device holds {available} words, need {}", self.packet_size);
            return Ok(None);
        }
        self.fetch_packet().map(Some)
    }

    /// Sleep one polling interval (`1 / max_rate`).
    pub fn backoff(&self) {
        thread::sleep(self.backoff);
    }

    pub fn backoff_interval(&self) -> Duration {
        self.backoff
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn resolve(address: &str) -> DaqResult<SocketAddr> {
    let with_port = if address.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_DEVICE_PORT}")
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| DaqError::link(&format!("resolve {with_port}"), e))?
        .next()
        .ok_or_else(|| DaqError::Link(format!("no address for {with_port}")))
}

/// Parse the fixed-width decimal count reply. Padding with spaces or NULs is accepted.
pub fn parse_count(reply: &[u8]) -> DaqResult<usize> {
    let text = std::str::from_utf8(reply)
        .map_err(|e| DaqError::link("word count reply", e))?
        .trim_matches(|c: char| c == '\0' || c.is_whitespace());
    text.parse::<usize>()
        .map_err(|e| DaqError::link(&format!("word count reply {text:?}"), e))
}

/// Format a count the way the device does: right-aligned in `COUNT_REPLY_LEN` bytes.
pub fn format_count(count: usize) -> [u8; COUNT_REPLY_LEN] {
    let mut reply = [b' '; COUNT_REPLY_LEN];
    let digits = count.to_string();
    let digits = digits.as_bytes();
    let digits = &digits[digits.len().saturating_sub(COUNT_REPLY_LEN)..];
    reply[COUNT_REPLY_LEN - digits.len()..].copy_from_slice(digits);
    reply
}

pub fn words_from_le_bytes(bytes: &[u8]) -> Vec<Word> {
    bytes
        .chunks_exact(4)
        .map(|b| Word::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
