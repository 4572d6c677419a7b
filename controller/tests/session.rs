//! Full-session tests: the real runtime core on one thread, the real
//! controller loop on the other, connected by an in-process channel pair.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use framelock_controller::{GameLoop, InputLog, LoopState, SlotTable, UiEvent};
use framelock_protocol::{Channel, SharedConfig};
use framelock_runtime::{FrameFlow, RuntimeContext};

const BUILD_ID: &str = "framelock-session-test";

/// Runs the runtime side: handshake, then frame boundaries until teardown,
/// calling `frame` once per released frame.
fn spawn_runtime<F>(channel: Channel, mut frame: F) -> JoinHandle<()>
where
    F: FnMut(&RuntimeContext) + Send + 'static,
{
    thread::Builder::new()
        .name("runtime".into())
        .spawn(move || {
            let ctx = RuntimeContext::new(channel, BUILD_ID);
            match ctx.handshake() {
                Ok(FrameFlow::Continue) => {},
                _ => return,
            }
            loop {
                frame(&ctx);
                match ctx.frame_boundary() {
                    Ok(FrameFlow::Continue) => {},
                    _ => return,
                }
            }
        })
        .expect("thread spawn")
}

fn start_session(
    dir: &std::path::Path,
) -> (GameLoop, mpsc::Receiver<UiEvent>, JoinHandle<()>) {
    start_session_with(dir, |_| {})
}

fn start_session_with<F>(
    dir: &std::path::Path,
    frame: F,
) -> (GameLoop, mpsc::Receiver<UiEvent>, JoinHandle<()>)
where
    F: FnMut(&RuntimeContext) + Send + 'static,
{
    let (ours, theirs) = Channel::pair().unwrap();
    let runtime = spawn_runtime(theirs, frame);

    let (tx, rx) = mpsc::channel();
    // No frame pacing in tests.
    let mut config = SharedConfig::default();
    config.fast_forward = true;
    let mut game_loop = GameLoop::new(ours, config, InputLog::new(), SlotTable::new(dir), tx);
    game_loop.handshake(&[".sav".into()]).unwrap();
    (game_loop, rx, runtime)
}

#[test]
fn save_at_ten_load_at_fifty_reports_ten() {
    let dir = tempfile::tempdir().unwrap();
    let (mut game_loop, rx, runtime) = start_session(dir.path());

    for _ in 0..10 {
        game_loop.advance().unwrap();
    }
    assert_eq!(game_loop.counters().frame_count, 10);

    game_loop.queue_save(0);
    game_loop.advance().unwrap();

    while game_loop.counters().frame_count < 50 {
        game_loop.advance().unwrap();
    }

    let _ = rx.try_iter().count();
    game_loop.queue_load(0);
    game_loop.advance().unwrap();

    // The load reported frame 10, then exactly one more frame ran.
    let events: Vec<_> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, UiEvent::FrameAdvanced(c) if c.frame_count == 10)));
    assert_eq!(game_loop.counters().frame_count, 11);
    assert_eq!(game_loop.position(), 11);

    game_loop.quit();
    runtime.join().unwrap();
}

#[test]
fn frame_counter_is_monotonic_between_loads() {
    let dir = tempfile::tempdir().unwrap();
    let (mut game_loop, _rx, runtime) = start_session(dir.path());

    let mut last = 0;
    for _ in 0..20 {
        game_loop.advance().unwrap();
        let now = game_loop.counters().frame_count;
        assert!(now > last, "counter went from {last} to {now}");
        last = now;
    }

    game_loop.quit();
    runtime.join().unwrap();
}

#[test]
fn two_runs_report_identical_counters_and_randomness() {
    fn one_run() -> (Vec<(u64, i64, i64)>, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let (bytes_tx, bytes_rx) = mpsc::channel();
        let (mut game_loop, _rx, runtime) = start_session_with(dir.path(), move |ctx| {
            // Target code: read the randomness device every frame.
            let path = c"/dev/urandom";
            let fd = unsafe { ctx.open_hook(path.as_ptr(), libc::O_RDONLY, 0) };
            let mut buf = [0u8; 8];
            unsafe { ctx.read_hook(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            unsafe { ctx.close_hook(fd) };
            let _ = bytes_tx.send(buf);
        });

        let mut trace = Vec::new();
        for _ in 0..8 {
            game_loop.advance().unwrap();
            let c = game_loop.counters();
            trace.push((c.frame_count, c.monotonic.sec, c.monotonic.nsec));
        }
        game_loop.quit();
        runtime.join().unwrap();

        let bytes = bytes_rx.into_iter().flatten().collect();
        (trace, bytes)
    }

    let (first_trace, first_bytes) = one_run();
    let (second_trace, second_bytes) = one_run();
    assert_eq!(first_trace, second_trace);
    assert_eq!(first_bytes, second_bytes);
    assert!(!first_bytes.is_empty());
}

#[test]
fn loading_an_empty_slot_is_reported_and_execution_continues() {
    let dir = tempfile::tempdir().unwrap();
    let (mut game_loop, rx, runtime) = start_session(dir.path());

    game_loop.advance().unwrap();
    game_loop.queue_load(4);
    game_loop.advance().unwrap();

    let events: Vec<_> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, UiEvent::Alert(text) if text.contains("slot 4"))));
    assert_eq!(game_loop.counters().frame_count, 2);

    game_loop.quit();
    runtime.join().unwrap();
}

#[test]
fn controller_quit_releases_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let (mut game_loop, _rx, runtime) = start_session(dir.path());

    game_loop.advance().unwrap();
    game_loop.quit();
    assert_eq!(game_loop.state(), LoopState::Exiting);

    // The runtime must unblock and tear down, not hang at its boundary.
    runtime.join().unwrap();
}

#[test]
fn dropping_the_controller_channel_releases_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let (mut game_loop, _rx, runtime) = start_session(dir.path());

    game_loop.advance().unwrap();
    // No UserQuit, no teardown call: the channel just goes away.
    drop(game_loop);

    runtime.join().unwrap();
}

#[test]
fn virtual_save_files_survive_a_state_load() {
    let dir = tempfile::tempdir().unwrap();
    let (cmd_tx, cmd_rx) = mpsc::channel::<&'static [u8]>();
    let (seen_tx, seen_rx) = mpsc::channel::<Vec<u8>>();

    let (mut game_loop, _rx, runtime) = start_session_with(dir.path(), move |ctx| {
        // Target code: per released frame, either write the commanded bytes
        // into a virtualized save file or read the whole file back.
        let path = c"/game/progress.sav";
        if let Ok(bytes) = cmd_rx.try_recv() {
            let fd = unsafe { ctx.open_hook(path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644) };
            assert!(fd >= 0);
            unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
            unsafe { ctx.close_hook(fd) };
        } else {
            let fd = unsafe { ctx.open_hook(path.as_ptr(), libc::O_RDONLY, 0) };
            if fd >= 0 {
                let mut buf = [0u8; 64];
                let n = unsafe { ctx.read_hook(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                unsafe { ctx.close_hook(fd) };
                let _ = seen_tx.send(buf[..n.max(0) as usize].to_vec());
            }
        }
    });

    // Frame 1 writes "early", then we save the state.
    cmd_tx.send(b"early").unwrap();
    game_loop.advance().unwrap();
    game_loop.queue_save(2);
    game_loop.advance().unwrap();
    let _ = seen_rx.recv().unwrap();

    // Frame 3 overwrites the file, then the load rewinds it.
    cmd_tx.send(b"later").unwrap();
    game_loop.advance().unwrap();

    game_loop.queue_load(2);
    game_loop.advance().unwrap();
    let after_load = seen_rx.recv().unwrap();
    assert_eq!(after_load, b"early");

    game_loop.quit();
    runtime.join().unwrap();
}
