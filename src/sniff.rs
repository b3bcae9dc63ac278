// src/sniff.rs
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use pcap::{Activated, Active, Capture, Device, Offline, PacketHeader};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::error::{MonitorError, Result};
use crate::models::domain::Observation;
use crate::monitor::CancelToken;
use crate::parser::{self, Frame, LinkType};

pub enum Poll {
    Frame(Frame),
    /// Nothing arrived within the source's read timeout.
    Idle,
    /// The source will never yield again.
    Exhausted,
}

/// The capture collaborator: an unbounded, non-restartable stream of frames.
pub trait CaptureSource: Send {
    fn next_frame(&mut self) -> Result<Poll>;
}

pub struct PcapSource<T: Activated = Active> {
    cap: Capture<T>,
    linktype: LinkType,
    /// Set when replaying a savefile; live frames are stamped on arrival.
    replay: Option<ReplayClock>,
}

impl PcapSource<Active> {
    pub fn open(interface: &str, config: &CaptureConfig) -> Result<Self> {
        let mut cap = create_capture(interface, config)?;
        configure_capture(&mut cap, config)?;
        let linktype = LinkType::from(cap.get_datalink());
        info!("capturing on {} (link type {:?})", interface, linktype);
        Ok(PcapSource {
            cap,
            linktype,
            replay: None,
        })
    }
}

impl PcapSource<Offline> {
    /// Replays a savefile. Frames keep their recorded spacing, anchored at
    /// the moment the file is opened.
    pub fn from_file(path: &Path, config: &CaptureConfig) -> Result<Self> {
        let mut cap = Capture::from_file(path)?;
        configure_capture(&mut cap, config)?;
        let linktype = LinkType::from(cap.get_datalink());
        info!("replaying {} (link type {:?})", path.display(), linktype);
        Ok(PcapSource {
            cap,
            linktype,
            replay: Some(ReplayClock::new(Instant::now())),
        })
    }
}

struct ReplayClock {
    started: Instant,
    first: Option<Duration>,
}

impl ReplayClock {
    fn new(started: Instant) -> Self {
        ReplayClock {
            started,
            first: None,
        }
    }

    fn at(&mut self, header: &PacketHeader) -> Instant {
        let recorded = Duration::from_secs(header.ts.tv_sec.max(0) as u64)
            + Duration::from_micros(header.ts.tv_usec.max(0) as u64);
        let first = *self.first.get_or_insert(recorded);
        self.started + recorded.saturating_sub(first)
    }
}

fn create_capture(interface: &str, config: &CaptureConfig) -> Result<Capture<Active>> {
    match Device::list() {
        Ok(devices) if !devices.iter().any(|d| d.name == interface) => {
            return Err(MonitorError::NoSuchDevice(interface.to_string()));
        }
        Ok(_) => {}
        // let the open below report the real problem
        Err(e) => debug!("could not list capture devices: {}", e),
    }

    let cap = Capture::from_device(interface)?
        .promisc(config.promisc)
        .snaplen(config.snaplen)
        .timeout(config.read_timeout_ms)
        .immediate_mode(true)
        .open()?;
    Ok(cap)
}

fn configure_capture<T: Activated>(cap: &mut Capture<T>, config: &CaptureConfig) -> Result<()> {
    if let Some(filter) = &config.filter {
        cap.filter(filter, true)?;
    }
    Ok(())
}

impl<T: Activated + Send> CaptureSource for PcapSource<T> {
    fn next_frame(&mut self) -> Result<Poll> {
        match self.cap.next() {
            Ok(packet) => {
                let timestamp = match self.replay.as_mut() {
                    Some(clock) => clock.at(packet.header),
                    None => Instant::now(),
                };
                Ok(Poll::Frame(Frame {
                    timestamp,
                    linktype: self.linktype,
                    data: packet.data.to_vec(),
                    wire_len: packet.header.len,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Poll::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(Poll::Exhausted),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replays frames from any iterator; exhausted when the iterator ends.
pub struct IterSource<I> {
    frames: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    pub fn new(frames: I) -> Self {
        IterSource { frames }
    }
}

impl<I> CaptureSource for IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    fn next_frame(&mut self) -> Result<Poll> {
        Ok(self.frames.next().map_or(Poll::Exhausted, Poll::Frame))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub rejected: u64,
}

/// Pulls frames until cancelled, exhausted, or the pipeline hangs up.
///
/// Per-frame extraction errors are counted and skipped; only a failure of
/// the source itself ends the loop with an error.
pub fn process_frames<S: CaptureSource>(
    source: &mut S,
    sender: &Sender<Observation>,
    cancel: &CancelToken,
) -> Result<CaptureStats> {
    let mut stats = CaptureStats::default();
    while !cancel.is_cancelled() {
        let frame = match source.next_frame()? {
            Poll::Frame(frame) => frame,
            Poll::Idle => continue,
            Poll::Exhausted => {
                info!("capture source exhausted after {} frames", stats.frames);
                break;
            }
        };
        stats.frames += 1;

        match parser::observe(&frame) {
            Ok(obs) => {
                if sender.send(obs).is_err() {
                    debug!("pipeline closed, stopping capture");
                    break;
                }
            }
            Err(e) => {
                stats.rejected += 1;
                debug!("dropping frame: {}", e);
            }
        }
    }
    Ok(stats)
}

pub fn start_sniffing<S>(
    mut source: S,
    sender: Sender<Observation>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<Result<CaptureStats>>>
where
    S: CaptureSource + 'static,
{
    thread::Builder::new()
        .name("bwmon-capture".into())
        .spawn(move || {
            let result = process_frames(&mut source, &sender, &cancel);
            if let Err(e) = &result {
                warn!("capture stopped: {}", e);
            }
            result
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use etherparse::PacketBuilder;
    use std::fs;
    use std::path::PathBuf;

    // LINKTYPE_RAW: records start at the IP header
    const LINKTYPE_RAW: u32 = 101;

    fn tcp_bytes() -> Vec<u8> {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).tcp(1000, 80, 0, 512);
        let mut data = Vec::new();
        builder.write(&mut data, &[]).unwrap();
        data
    }

    // (seconds, microseconds, original length, captured bytes)
    fn write_savefile(name: &str, records: &[(u32, u32, u32, Vec<u8>)]) -> PathBuf {
        let mut file = Vec::new();
        file.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        file.extend_from_slice(&2u16.to_le_bytes());
        file.extend_from_slice(&4u16.to_le_bytes());
        file.extend_from_slice(&0i32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&65535u32.to_le_bytes());
        file.extend_from_slice(&LINKTYPE_RAW.to_le_bytes());
        for (secs, micros, orig_len, data) in records {
            file.extend_from_slice(&secs.to_le_bytes());
            file.extend_from_slice(&micros.to_le_bytes());
            file.extend_from_slice(&(data.len() as u32).to_le_bytes());
            file.extend_from_slice(&orig_len.to_le_bytes());
            file.extend_from_slice(data);
        }
        let path = std::env::temp_dir().join(format!("bwmon-{}-{}.pcap", name, std::process::id()));
        fs::write(&path, file).unwrap();
        path
    }

    fn tcp_frame(len_on_wire: u32) -> Frame {
        let data = tcp_bytes();
        Frame {
            timestamp: Instant::now(),
            linktype: LinkType::RawIp,
            data,
            wire_len: len_on_wire,
        }
    }

    struct FailingSource;

    impl CaptureSource for FailingSource {
        fn next_frame(&mut self) -> Result<Poll> {
            Err(pcap::Error::PcapError("interface went down".into()).into())
        }
    }

    #[test]
    fn test_bad_frames_do_not_stop_the_stream() {
        let frames = vec![tcp_frame(60), tcp_frame(0), tcp_frame(1500)];
        let mut source = IterSource::new(frames.into_iter());
        let (tx, rx) = unbounded();

        let stats = process_frames(&mut source, &tx, &CancelToken::new()).unwrap();
        assert_eq!(stats, CaptureStats { frames: 3, rejected: 1 });

        let lengths: Vec<u64> = rx.try_iter().map(|o| o.length).collect();
        assert_eq!(lengths, vec![60, 1500]);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut source = IterSource::new(std::iter::repeat_with(|| tcp_frame(60)));
        let (tx, rx) = unbounded();

        let stats = process_frames(&mut source, &tx, &cancel).unwrap();
        assert_eq!(stats.frames, 0);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_stops_when_pipeline_hangs_up() {
        let mut source = IterSource::new(std::iter::repeat_with(|| tcp_frame(60)));
        let (tx, rx) = unbounded();
        drop(rx);
        let stats = process_frames(&mut source, &tx, &CancelToken::new()).unwrap();
        assert_eq!(stats.frames, 1);
    }

    #[test]
    fn test_savefile_replay() {
        let path = write_savefile(
            "replay",
            &[
                (1_700_000_000, 250_000, 60, tcp_bytes()),
                (1_700_000_001, 750_000, 1500, tcp_bytes()),
            ],
        );
        let mut source = PcapSource::from_file(&path, &CaptureConfig::default()).unwrap();
        assert_eq!(source.linktype, LinkType::RawIp);

        let first = match source.next_frame().unwrap() {
            Poll::Frame(frame) => frame,
            _ => panic!("expected a frame"),
        };
        let second = match source.next_frame().unwrap() {
            Poll::Frame(frame) => frame,
            _ => panic!("expected a frame"),
        };
        assert!(matches!(source.next_frame().unwrap(), Poll::Exhausted));
        fs::remove_file(&path).unwrap();

        assert_eq!(first.wire_len, 60);
        assert_eq!(second.wire_len, 1500);
        assert_eq!(second.data.len(), 40);
        assert_eq!(second.timestamp - first.timestamp, Duration::from_millis(1500));
        assert_eq!(parser::observe(&second).unwrap().length, 1500);
    }

    #[test]
    fn test_savefile_feeds_the_capture_thread() {
        let path = write_savefile(
            "thread",
            &[(10, 0, 60, tcp_bytes()), (11, 0, 80, tcp_bytes())],
        );
        let source = PcapSource::from_file(&path, &CaptureConfig::default()).unwrap();
        let (tx, rx) = unbounded();

        let stats = start_sniffing(source, tx, CancelToken::new())
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(stats, CaptureStats { frames: 2, rejected: 0 });
        let lengths: Vec<u64> = rx.try_iter().map(|o| o.length).collect();
        assert_eq!(lengths, vec![60, 80]);
    }

    #[test]
    fn test_source_failure_is_fatal() {
        let (tx, _rx) = unbounded();
        let handle = start_sniffing(FailingSource, tx, CancelToken::new()).unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(MonitorError::Capture(_))));
    }
}
