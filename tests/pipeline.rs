use std::thread;
use std::time::{Duration, Instant};

use bwmon::monitor::{monitor_source, run_pipeline};
use bwmon::parser::{Frame, LinkType};
use bwmon::{
    AddressLabeler, CancelToken, IterSource, MonitorConfig, OutputFormat, Reporter,
    TumblingAggregator,
};
use etherparse::PacketBuilder;

fn tcp(at: Instant, src: [u8; 4], dst: [u8; 4], wire_len: u32) -> Frame {
    let builder = PacketBuilder::ipv4(src, dst, 64).tcp(40000, 443, 1, 1024);
    let mut data = Vec::new();
    builder.write(&mut data, &[]).unwrap();
    Frame {
        timestamp: at,
        linktype: LinkType::RawIp,
        data,
        wire_len,
    }
}

fn arp(at: Instant) -> Frame {
    let mut data = vec![0xff; 12];
    data.extend_from_slice(&[0x08, 0x06]);
    data.extend_from_slice(&[0u8; 28]);
    Frame {
        timestamp: at,
        linktype: LinkType::Ethernet,
        data,
        wire_len: 42,
    }
}

fn config(detailed: bool) -> MonitorConfig {
    windowed(detailed, 1.0)
}

fn windowed(detailed: bool, window_secs: f64) -> MonitorConfig {
    let mut config = MonitorConfig::new("test0", detailed, window_secs).unwrap();
    config.dns.enabled = false;
    config.poll_interval = Duration::from_millis(5);
    config
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn monitor(frames: Vec<Frame>, config: &MonitorConfig) -> String {
    let mut out = Vec::new();
    let cancel = CancelToken::new();
    monitor_source(IterSource::new(frames.into_iter()), config, &mut out, &cancel).unwrap();
    // the run stops its own capture thread without firing the caller's token
    assert!(!cancel.is_cancelled());
    String::from_utf8(out).unwrap()
}

#[test]
fn tumbling_epoch_reports_one_flow() {
    let t0 = Instant::now();
    let frames = vec![
        tcp(t0, [10, 0, 0, 1], [10, 0, 0, 2], 100),
        tcp(t0 + ms(500), [10, 0, 0, 1], [10, 0, 0, 2], 200),
        // closes the first epoch
        tcp(t0 + ms(1200), [10, 0, 0, 3], [10, 0, 0, 4], 60),
    ];

    let out = monitor(frames, &config(false));
    assert!(out.starts_with("Monitoring traffic on interface: test0\n"));

    let report: Vec<&str> = out
        .split("--- Traffic Breakdown (last 1s) ---\n")
        .nth(1)
        .unwrap()
        .lines()
        .collect();
    assert_eq!(
        report,
        vec!["10.0.0.1 (Private Network) → 10.0.0.2 (Private Network) (TCP): 2.34 Kbps"]
    );
}

#[test]
fn tumbling_leaves_non_ip_frames_out() {
    let t0 = Instant::now();
    let frames = vec![
        arp(t0),
        tcp(t0 + ms(10), [127, 0, 0, 1], [127, 0, 0, 1], 128),
        tcp(t0 + ms(1100), [127, 0, 0, 1], [127, 0, 0, 1], 40),
    ];

    let out = monitor(frames, &config(false));
    assert!(out.contains("127.0.0.1 (Localhost) → 127.0.0.1 (Localhost) (TCP): 1.00 Kbps\n"));
    assert!(!out.contains("Unknown"));
}

#[test]
fn malformed_frames_contribute_nothing() {
    let t0 = Instant::now();
    let frames = vec![
        tcp(t0, [10, 0, 0, 1], [10, 0, 0, 2], 256),
        // claims fewer bytes on the wire than were captured
        tcp(t0 + ms(200), [10, 0, 0, 1], [10, 0, 0, 2], 1),
        tcp(t0 + ms(400), [10, 0, 0, 1], [10, 0, 0, 2], 0),
        tcp(t0 + ms(1100), [10, 0, 0, 3], [10, 0, 0, 4], 40),
    ];

    let out = monitor(frames, &config(false));
    assert!(out.contains("10.0.0.1 (Private Network) → 10.0.0.2 (Private Network) (TCP): 2.00 Kbps\n"));
}

#[test]
fn sliding_window_forgets_old_traffic() {
    let t0 = Instant::now();
    let frames = vec![
        tcp(t0, [10, 0, 0, 1], [10, 0, 0, 2], 100),
        tcp(t0 + ms(1500), [10, 0, 0, 1], [10, 0, 0, 2], 100),
    ];

    let out = monitor(frames, &config(true));
    assert!(out.starts_with("Starting detailed bandwidth monitor on test0\n"));
    assert!(out.contains("--- Traffic Breakdown (last 1s) ---\n10.0.0.1 → 10.0.0.2 (TCP): 0.80 Kbps\n"));
}

#[test]
fn sliding_counts_unattributed_frames() {
    let t0 = Instant::now();
    let frames = vec![arp(t0), tcp(t0 + ms(1100), [10, 0, 0, 1], [10, 0, 0, 2], 1000)];

    let out = monitor(frames, &windowed(true, 2.0));
    assert!(out.contains("10.0.0.1 → 10.0.0.2 (TCP): 8.00 Kbps\n"));
    assert!(out.contains("Unknown → Unknown (N/A): 0.34 Kbps\n"));
}

#[test]
fn json_output_is_one_object_per_report() {
    let t0 = Instant::now();
    let frames = vec![
        tcp(t0, [10, 0, 0, 1], [8, 8, 8, 8], 500),
        tcp(t0 + ms(1100), [10, 0, 0, 1], [8, 8, 8, 8], 500),
    ];
    let mut config = config(false);
    config.format = OutputFormat::Json;

    let out = monitor(frames, &config);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 1);

    let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(value["mode"], "tumbling");
    assert_eq!(value["flows"][0]["destination"], "8.8.8.8");
    assert_eq!(value["flows"][0]["destination_label"], "No-DNS");
    assert_eq!(value["flows"][0]["bytes"], 500);
}

#[test]
fn idle_epoch_reports_no_traffic() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let cancel = CancelToken::new();
    let stopper = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(ms(1300));
            cancel.cancel();
        })
    };

    let mut aggregator = TumblingAggregator::new(Instant::now());
    let mut reporter = Reporter::new(Vec::new(), AddressLabeler::offline(), OutputFormat::Text);
    let stats = run_pipeline(&rx, &mut aggregator, &mut reporter, &cancel, ms(10)).unwrap();
    stopper.join().unwrap();
    drop(tx);

    assert_eq!(stats.observations, 0);
    assert_eq!(stats.reports, 1);
    let out = String::from_utf8(reporter.into_inner()).unwrap();
    assert_eq!(out, "\n--- Traffic Breakdown (last 1s) ---\nNo traffic detected.\n");
}
