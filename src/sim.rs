//! A stand-in device that speaks the SoftGlue socket protocol.
//!
//! Used by the integration tests and by `--simulate`. Event payloads come from
//! [`RandomWalk`] objects owned by the generator; nothing here is global.

use crate::{
    link::{format_count, CMD_NUM_WORDS, CMD_SEND_DATA},
    DaqError, DaqResult, Word, LONG_EVENT_WORDS, LONG_FORM_MARKER, SHORT_EVENT_WORDS,
    START_MARKER,
};
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const PAYLOAD_MASK: Word = 0x3FFF_FFFF;

/// A position that drifts by a uniform step in `[-step/2, step/2)` per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomWalk {
    position: f64,
    step: f64,
}

impl RandomWalk {
    pub fn new(start: f64, step: f64) -> Self {
        Self {
            position: start,
            step,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn next<R: Rng>(&mut self, rng: &mut R) -> f64 {
        self.position += (rng.random::<f64>() - 0.5) * self.step;
        self.position
    }
}

/// Produces a plausible word stream: short events from 8 random walks, occasional long
/// events, and unmarked filler between runs.
pub struct EventGenerator {
    walks: Vec<RandomWalk>,
    rng: StdRng,
    long_probability: f64,
    scale: f64,
}

impl EventGenerator {
    pub fn new(seed: u64, long_probability: f64) -> Self {
        let walks = (0..SHORT_EVENT_WORDS)
            .map(|i| RandomWalk::new(10.0 + i as f64, 0.1))
            .collect();
        Self {
            walks,
            rng: StdRng::seed_from_u64(seed),
            long_probability,
            scale: 1000.0,
        }
    }

    fn sample(&mut self, walk: usize) -> Word {
        let position = self.walks[walk].next(&mut self.rng);
        ((position * self.scale).round().max(0.0) as u64 as Word) & PAYLOAD_MASK
    }

    /// Append whole runs until at least `n` words were added.
    pub fn fill(&mut self, out: &mut VecDeque<Word>, n: usize) {
        let target = out.len() + n;
        while out.len() < target {
            let filler = self.rng.random_range(0..3);
            for _ in 0..filler {
                out.push_back(self.rng.random::<Word>() & PAYLOAD_MASK);
            }
            if self.rng.random_bool(self.long_probability) {
                out.push_back(LONG_FORM_MARKER | (self.rng.random::<Word>() & PAYLOAD_MASK));
                for _ in 1..LONG_EVENT_WORDS {
                    out.push_back(self.rng.random::<Word>() & PAYLOAD_MASK);
                }
            } else {
                for walk in 0..SHORT_EVENT_WORDS {
                    let value = self.sample(walk);
                    out.push_back(if walk == 0 { value | START_MARKER } else { value });
                }
            }
        }
    }
}

/// Where the simulated device's words come from.
pub enum Feed {
    /// A fixed word sequence; once exhausted the device reports fewer words than a packet.
    Scripted(Vec<Word>),
    /// Generated runs, topped up to at least `words_per_request` on every `sendnumw`.
    Generated {
        generator: EventGenerator,
        words_per_request: usize,
    },
}

pub struct SimulatedDevice {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    words_served: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Listen on an ephemeral localhost port and serve connections one at a time.
    pub fn spawn(packet_size: usize, feed: Feed) -> DaqResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| DaqError::link("bind simulated device", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DaqError::link("configure simulated device", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DaqError::link("simulated device address", e))?;
        let stop = Arc::new(AtomicBool::new(false));
        let words_served = Arc::new(AtomicU64::new(0));

        let server = Server {
            packet_size,
            feed,
            pending: VecDeque::new(),
            stop: Arc::clone(&stop),
            words_served: Arc::clone(&words_served),
        };
        let thread = thread::Builder::new()
            .name("sim-device".into())
            .spawn(move || server.run(listener))
            .map_err(|e| DaqError::link("spawn simulated device", e))?;
        info!("Simulated device listening on {addr}");

        Ok(Self {
            addr,
            stop,
            words_served,
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn words_served(&self) -> u64 {
        self.words_served.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Server {
    packet_size: usize,
    feed: Feed,
    pending: VecDeque<Word>,
    stop: Arc<AtomicBool>,
    words_served: Arc<AtomicU64>,
}

impl Server {
    fn run(mut self, listener: TcpListener) {
        if let Feed::Scripted(words) = &mut self.feed {
            self.pending.extend(words.drain(..));
        }
        while !self.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Simulated device: client {peer}");
                    if let Err(e) = self.serve(stream) {
                        debug!("Simulated device: client {peer} left: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    warn!("Simulated device accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn serve(&mut self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_millis(20)))?;
        let mut command = [0u8; 8];
        // Bytes of `command` received so far; kept across read timeouts.
        let mut filled = 0;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match stream.read(&mut command[filled..]) {
                Ok(0) => return Ok(()),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e),
            }
            if filled < command.len() {
                continue;
            }
            filled = 0;

            if command == CMD_NUM_WORDS {
                if let Feed::Generated {
                    generator,
                    words_per_request,
                } = &mut self.feed
                {
                    let missing = words_per_request.saturating_sub(self.pending.len());
                    if missing > 0 {
                        generator.fill(&mut self.pending, missing);
                    }
                }
                stream.write_all(&format_count(self.pending.len()))?;
            } else if command == CMD_SEND_DATA {
                let mut bytes = Vec::with_capacity(4 * self.packet_size);
                for _ in 0..self.packet_size {
                    let word = self.pending.pop_front().unwrap_or(0);
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
                stream.write_all(&bytes)?;
                self.words_served
                    .fetch_add(self.packet_size as u64, Ordering::Relaxed);
            } else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command {:?}", String::from_utf8_lossy(&command)),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, DecodeState, DeviceLink};

    #[test]
    fn random_walk_is_owned_state() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut a = RandomWalk::new(10.0, 0.1);
        let b = a.clone();
        for _ in 0..100 {
            let p = a.next(&mut rng);
            assert!((p - 10.0).abs() <= 0.05 * 100.0);
        }
        // Advancing one walker never moves another.
        assert_eq!(b.position(), 10.0);
        assert_ne!(a.position(), 10.0);
    }

    #[test]
    fn generated_stream_decodes_into_events() {
        let mut generator = EventGenerator::new(7, 0.1);
        let mut words = VecDeque::new();
        generator.fill(&mut words, 4000);
        let words: Vec<Word> = words.into_iter().collect();
        let (decoded, _) = decode(&words, DecodeState::default());
        assert!(decoded.events.len() > 100);
        assert!(decoded.long_events > 0);
        for event in &decoded.events {
            assert!(event.words.iter().all(|w| w & START_MARKER == 0));
        }
    }

    #[test]
    fn speaks_the_wire_protocol() {
        let script: Vec<Word> = vec![0, 0x8000_0008, 1, 2, 3, 4, 5, 6, 7, 0];
        let device = SimulatedDevice::spawn(5, Feed::Scripted(script)).unwrap();
        let stream = TcpStream::connect(device.addr()).unwrap();
        let mut link = DeviceLink::new(stream, 5, Duration::from_millis(1));

        assert_eq!(link.buffered_words().unwrap(), 10);
        assert_eq!(link.poll().unwrap().unwrap(), vec![0, 0x8000_0008, 1, 2, 3]);
        assert_eq!(link.poll().unwrap().unwrap(), vec![4, 5, 6, 7, 0]);
        assert!(link.poll().unwrap().is_none());
        assert_eq!(device.words_served(), 10);
    }

    #[test]
    fn commands_split_across_writes_are_reassembled() {
        let script: Vec<Word> = (0..7).collect();
        let device = SimulatedDevice::spawn(5, Feed::Scripted(script)).unwrap();
        let mut stream = TcpStream::connect(device.addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // Longer than the device's read timeout, so the halves arrive in separate reads.
        stream.write_all(&CMD_NUM_WORDS[..3]).unwrap();
        thread::sleep(Duration::from_millis(80));
        stream.write_all(&CMD_NUM_WORDS[3..]).unwrap();
        let mut reply = [0u8; crate::link::COUNT_REPLY_LEN];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, format_count(7));

        // The stream is still aligned for the next command.
        let mut link = DeviceLink::new(stream, 5, Duration::from_millis(1));
        assert_eq!(link.poll().unwrap().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn generated_backlog_stays_bounded() {
        let feed = Feed::Generated {
            generator: EventGenerator::new(3, 0.1),
            words_per_request: 50,
        };
        let device = SimulatedDevice::spawn(50, feed).unwrap();
        let stream = TcpStream::connect(device.addr()).unwrap();
        let mut link = DeviceLink::new(stream, 50, Duration::from_millis(1));

        let first = link.buffered_words().unwrap();
        assert!(first >= 50 && first < 50 + LONG_EVENT_WORDS + 3);
        // A client that only asks for the count never makes the backlog grow.
        for _ in 0..200 {
            assert_eq!(link.buffered_words().unwrap(), first);
        }
        assert!(link.poll().unwrap().is_some());
        assert!(link.buffered_words().unwrap() >= 50);
    }
}
