use softglue_daq::{
    link::{format_count, CMD_NUM_WORDS, CMD_SEND_DATA},
    sim::{Feed, SimulatedDevice},
    AcqStatus, AcquisitionController, Conf, DaqError, LogReset, Word, ATTR_LONG_EVENTS,
    ATTR_NUM_EVENTS, START_MARKER,
};
use std::{
    io::{Read, Write},
    net::TcpListener,
    path::Path,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

const PACKET: usize = 10;

fn conf(dir: &Path, address: &str) -> Conf {
    let mut conf = Conf::load(None).unwrap();
    conf.device.address = address.to_string();
    conf.device.packet_size = PACKET;
    conf.device.max_rate = 1000.0;
    conf.device.reset_settle_ms = 0;
    conf.device.connect_timeout_ms = 1000;
    conf.device.read_timeout_ms = 1000;
    conf.output.directory = dir.to_string_lossy().into_owned();
    conf.output.file_name = "run".into();
    conf.output.resize_by = 3;
    conf.events.labels = ["x", "y", "z", "t", "a", "b", "c", "d"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    conf
}

/// Five short events, 40 words, so runs straddle every packet boundary.
fn five_events() -> Vec<Word> {
    (0..5u32)
        .flat_map(|k| {
            (0..8u32).map(move |i| (k * 10 + i) | if i == 0 { START_MARKER } else { 0 })
        })
        .collect()
}

fn events_in(path: &Path) -> u64 {
    let file = hdf5::File::open(path).unwrap();
    file.group("entry/data")
        .unwrap()
        .attr(ATTR_NUM_EVENTS)
        .unwrap()
        .read_scalar()
        .unwrap()
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn session_persists_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::spawn(PACKET, Feed::Scripted(five_events())).unwrap();
    let mut controller = AcquisitionController::new(
        conf(dir.path(), &device.addr().to_string()),
        Box::new(LogReset),
    )
    .unwrap();

    controller.start().unwrap();
    assert_eq!(controller.status(), AcqStatus::Acquiring);
    wait_for("all events decoded", || {
        controller
            .session_stats()
            .is_some_and(|s| s.events_decoded == 5)
    });
    wait_for("the last batch published", || {
        controller.snapshots().latest().first_event_id == 3
    });

    let report = controller.stop().unwrap();
    assert_eq!(controller.status(), AcqStatus::Idle);
    assert_eq!(report.events_written, 5);
    assert_eq!(report.stats.events_written, 5);
    assert_eq!(report.stats.packets, 4);
    assert_eq!(report.file, dir.path().join("run.h5"));

    let file = hdf5::File::open(&report.file).unwrap();
    let group = file.group("entry/data").unwrap();
    let count: u64 = group.attr(ATTR_NUM_EVENTS).unwrap().read_scalar().unwrap();
    let long: u64 = group.attr(ATTR_LONG_EVENTS).unwrap().read_scalar().unwrap();
    assert_eq!(count, 5);
    assert_eq!(long, 0);
    for label in ["x", "y", "z", "t", "a", "b", "c", "d"] {
        assert_eq!(group.dataset(label).unwrap().size(), 5, "column {label}");
    }
    let x = group.dataset("x").unwrap().read_raw::<u32>().unwrap();
    let d = group.dataset("d").unwrap().read_raw::<u32>().unwrap();
    assert_eq!(x, [0, 10, 20, 30, 40]);
    assert_eq!(d, [7, 17, 27, 37, 47]);

    // The last packet completed events 3 and 4; telemetry always keeps the newest batch.
    let snapshot = controller.snapshots().latest();
    assert_eq!(snapshot.num_events, 2);
    assert_eq!(snapshot.first_event_id, 3);
    assert_eq!(snapshot.streams[0].label, "x");
    assert_eq!(snapshot.streams[0].events, [30, 40]);
}

#[test]
fn control_rejects_illegal_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::spawn(PACKET, Feed::Scripted(Vec::new())).unwrap();
    let mut controller = AcquisitionController::new(
        conf(dir.path(), &device.addr().to_string()),
        Box::new(LogReset),
    )
    .unwrap();

    assert!(matches!(
        controller.stop(),
        Err(DaqError::State {
            status: AcqStatus::Idle,
            ..
        })
    ));
    assert_eq!(controller.status(), AcqStatus::Idle);

    controller.start().unwrap();
    assert!(matches!(
        controller.start(),
        Err(DaqError::State {
            status: AcqStatus::Acquiring,
            ..
        })
    ));
    assert_eq!(controller.status(), AcqStatus::Acquiring);
    assert!(controller.reap().is_none());
    wait_for("an empty poll", || {
        controller.session_stats().is_some_and(|s| s.empty_polls > 0)
    });

    let report = controller.stop().unwrap();
    assert_eq!(report.events_written, 0);
    assert_eq!(report.stats.packets, 0);
    assert_eq!(controller.status(), AcqStatus::Idle);
}

#[test]
fn auto_increment_gives_each_session_its_own_file() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::spawn(PACKET, Feed::Scripted(five_events())).unwrap();
    let mut conf = conf(dir.path(), &device.addr().to_string());
    conf.output.auto_increment = true;
    conf.output.file_number = 7;
    let mut controller = AcquisitionController::new(conf, Box::new(LogReset)).unwrap();

    controller.start().unwrap();
    wait_for("first session events", || {
        controller
            .session_stats()
            .is_some_and(|s| s.events_written == 5)
    });
    let first = controller.stop().unwrap();

    controller.start().unwrap();
    let second = controller.stop().unwrap();

    assert_eq!(first.file, dir.path().join("run_0007.h5"));
    assert_eq!(second.file, dir.path().join("run_0008.h5"));
    assert_eq!(controller.file_number(), 9);
    assert!(first.file.exists() && second.file.exists());
    assert_eq!(second.events_written, 0);
}

#[test]
fn failed_connect_leaves_controller_idle() {
    let dir = tempfile::tempdir().unwrap();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut conf = conf(dir.path(), &addr.to_string());
    conf.output.auto_increment = true;
    let mut controller = AcquisitionController::new(conf, Box::new(LogReset)).unwrap();

    assert!(matches!(controller.start(), Err(DaqError::Link(_))));
    assert_eq!(controller.status(), AcqStatus::Idle);
    assert_eq!(controller.file_number(), 0);
}

#[test]
fn link_failure_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut controller = AcquisitionController::new(
        conf(dir.path(), &listener.local_addr().unwrap().to_string()),
        Box::new(LogReset),
    )
    .unwrap();

    controller.start().unwrap();
    // Device hangs up before answering anything.
    let (stream, _) = listener.accept().unwrap();
    drop(stream);

    wait_for("session to stop itself", || {
        controller.status() == AcqStatus::Stopping
    });
    assert!(matches!(controller.reap(), Some(Err(DaqError::Link(_)))));
    assert_eq!(controller.status(), AcqStatus::Idle);
    assert!(controller.reap().is_none());

    // The file is still closed cleanly.
    let file = hdf5::File::open(dir.path().join("run.h5")).unwrap();
    let count: u64 = file
        .group("entry/data")
        .unwrap()
        .attr(ATTR_NUM_EVENTS)
        .unwrap()
        .read_scalar()
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn restarted_controller_never_overwrites_an_earlier_file() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::spawn(PACKET, Feed::Scripted(five_events())).unwrap();
    let mut conf = conf(dir.path(), &device.addr().to_string());
    conf.output.auto_increment = true;
    conf.output.file_number = 7;

    let mut first = AcquisitionController::new(conf.clone(), Box::new(LogReset)).unwrap();
    first.start().unwrap();
    wait_for("first session events", || {
        first.session_stats().is_some_and(|s| s.events_written == 5)
    });
    let first_report = first.stop().unwrap();
    drop(first);

    // Same configured number, as after a process restart.
    let mut second = AcquisitionController::new(conf, Box::new(LogReset)).unwrap();
    second.start().unwrap();
    let second_report = second.stop().unwrap();

    assert_eq!(first_report.file, dir.path().join("run_0007.h5"));
    assert_eq!(second_report.file, dir.path().join("run_0008.h5"));
    assert_eq!(second.file_number(), 9);
    assert_eq!(events_in(&first_report.file), 5);
    assert_eq!(events_in(&second_report.file), 0);
}

#[test]
fn stop_does_not_wait_out_a_stalled_read() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut conf = conf(dir.path(), &listener.local_addr().unwrap().to_string());
    conf.device.read_timeout_ms = 10_000;
    conf.device.stop_grace_ms = 50;

    // Answers the word count, then never sends the packet.
    let (stalled_tx, stalled_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let device = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut command = [0u8; 8];
        stream.read_exact(&mut command).unwrap();
        assert_eq!(command, CMD_NUM_WORDS);
        stream.write_all(&format_count(PACKET)).unwrap();
        stream.read_exact(&mut command).unwrap();
        assert_eq!(command, CMD_SEND_DATA);
        stalled_tx.send(()).unwrap();
        let _ = release_rx.recv_timeout(Duration::from_secs(20));
    });

    let mut controller = AcquisitionController::new(conf, Box::new(LogReset)).unwrap();
    controller.start().unwrap();
    stalled_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let asked = Instant::now();
    let report = controller.stop().unwrap();
    assert!(asked.elapsed() < Duration::from_secs(2), "stop took {:?}", asked.elapsed());
    assert_eq!(controller.status(), AcqStatus::Idle);
    assert_eq!(report.events_written, 0);
    assert_eq!(events_in(&report.file), 0);

    release_tx.send(()).unwrap();
    device.join().unwrap();
}

#[test]
fn storage_failure_is_reaped_and_keeps_written_events() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::spawn(PACKET, Feed::Scripted(five_events())).unwrap();
    let mut conf = conf(dir.path(), &device.addr().to_string());
    // Packets complete 1, 1, 1 and 2 events; the fourth batch overflows the cap.
    conf.output.max_events = 3;
    let mut controller = AcquisitionController::new(conf, Box::new(LogReset)).unwrap();

    controller.start().unwrap();
    wait_for("writer to stop the session", || {
        controller.status() == AcqStatus::Stopping
    });
    assert!(matches!(controller.reap(), Some(Err(DaqError::Storage(_)))));
    assert_eq!(controller.status(), AcqStatus::Idle);
    assert_eq!(events_in(&dir.path().join("run.h5")), 3);

    // The controller is usable again after the failure.
    assert!(controller.reap().is_none());
    assert!(controller.stop().is_err());
}
