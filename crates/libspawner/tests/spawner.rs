//! End-to-end launches against real `/bin/sh`, `cat` and `sleep` children.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use libspawner::{
    LaunchSpec, ProcessFactory, Pty, PtyMode, Sandbox, SpawnError, SpawnerConfig,
    SpawnerInputStream,
};

fn native() -> ProcessFactory {
    ProcessFactory::new(SpawnerConfig::default())
}

fn standard() -> ProcessFactory {
    ProcessFactory::standard(SpawnerConfig::default())
}

fn drain(stream: &SpawnerInputStream) -> String {
    let mut text = String::new();
    let mut reader = stream;
    reader.read_to_string(&mut text).expect("drain stream");
    text
}

/// Read until `marker` shows up, so tests can sync with a shell script.
fn read_until(stream: &SpawnerInputStream, marker: &str) -> String {
    let mut seen = String::new();
    let mut buf = [0u8; 256];
    while !seen.contains(marker) {
        let n = stream.read(&mut buf).expect("read");
        assert!(n > 0, "stream ended before {marker:?}; got {seen:?}");
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    seen
}

#[test]
fn echo_drains_to_the_exact_string() {
    for factory in [native(), standard()] {
        let child = factory.exec_args(["echo", "hello spawner"]).unwrap();
        assert_eq!(drain(&child.stdout()), "hello spawner\n");
        assert_eq!(child.wait_for(), 0);
        assert_eq!(child.exit_value().unwrap(), 0);
    }
}

#[test]
fn exit_value_matches_wait_and_is_stable() {
    let child = native().exec_args(["sh", "-c", "exit 3"]).unwrap();
    let waited = child.wait_for();
    assert_eq!(waited, 3);
    assert_eq!(child.exit_value().unwrap(), waited);
    assert_eq!(child.exit_value().unwrap(), waited);
    assert_eq!(child.wait_for(), waited);
    assert!(child.is_done());
    assert!(!child.is_running());
}

#[test]
fn exit_value_before_completion_is_illegal_state() {
    let child = native().exec_args(["sleep", "30"]).unwrap();
    assert!(child.is_running());
    assert!(matches!(child.exit_value(), Err(SpawnError::IllegalState(_))));
    assert!(child.exit_status().is_none());
    child.kill().unwrap();
    assert_eq!(child.wait_for(), 128 + 9);
}

#[test]
fn stream_accessors_return_the_same_instance() {
    for factory in [native(), standard()] {
        let child = factory.exec_args(["cat"]).unwrap();
        assert!(Arc::ptr_eq(&child.stdin(), &child.stdin()));
        assert!(Arc::ptr_eq(&child.stdout(), &child.stdout()));
        assert!(Arc::ptr_eq(&child.stderr(), &child.stderr()));
        child.stdin().close().unwrap();
        assert_eq!(child.wait_for(), 0);
    }
}

#[test]
fn repeated_close_is_harmless() {
    let child = native().exec_args(["cat"]).unwrap();
    let stdin = child.stdin();
    stdin.close().unwrap();
    stdin.close().unwrap();
    let stdout = child.stdout();
    assert_eq!(drain(&stdout), "");
    stdout.close().unwrap();
    stdout.close().unwrap();
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn stdin_round_trips_through_cat() {
    let child = native().exec_args(["cat"]).unwrap();
    let stdin = child.stdin();
    (&*stdin).write_all(b"ping\npong\n").unwrap();
    stdin.close().unwrap();
    assert_eq!(drain(&child.stdout()), "ping\npong\n");
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn stderr_is_kept_apart_from_stdout() {
    let child = native()
        .exec_args(["sh", "-c", "echo out; echo err 1>&2"])
        .unwrap();
    let stdout = child.stdout();
    let stderr = child.stderr();
    assert_eq!(drain(&stdout), "out\n");
    assert_eq!(drain(&stderr), "err\n");
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn unrequested_streams_are_closed_by_wait() {
    let child = native().exec_args(["true"]).unwrap();
    assert_eq!(child.wait_for(), 0);
    assert!(child.stdout().is_closed());
    assert!(child.stdin().is_closed());
    let err = child.stdin().write(b"late").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
}

#[test]
fn missing_executable_fails_synchronously() {
    let started = Instant::now();
    for argv in [["/definitely/not/a/program"], ["definitely-not-a-program-xyz"]] {
        match native().exec_args(argv) {
            Err(SpawnError::Launch { command, reason }) => {
                assert_eq!(command, argv[0]);
                assert!(reason.contains("No such file"), "{reason}");
            }
            other => panic!("expected a launch failure, got {other:?}"),
        }
    }
    match standard().exec_args(["/definitely/not/a/program"]) {
        Err(SpawnError::Launch { .. }) => {}
        other => panic!("expected a launch failure, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn missing_executable_maps_to_not_found() {
    let err: io::Error = native()
        .exec_args(["/definitely/not/a/program"])
        .unwrap_err()
        .into();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[test]
fn bad_working_directory_is_a_launch_failure() {
    let spec = LaunchSpec::new(["true"]).dir("/definitely/not/a/dir");
    match native().launch(spec) {
        Err(SpawnError::Launch { reason, .. }) => assert!(reason.starts_with("chdir"), "{reason}"),
        other => panic!("expected a launch failure, got {other:?}"),
    }
}

#[test]
fn destroy_terminates_a_sleeper() {
    let child = native().exec_args(["sleep", "600"]).unwrap();
    let started = Instant::now();
    child.destroy();
    let value = child.wait_for();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(value, 128 + 15);
    assert!(!child.is_running());
}

#[test]
fn destroy_escalates_when_terminate_is_ignored() {
    let spec = LaunchSpec::new(["sh", "-c", "trap '' TERM; echo ready; while :; do sleep 1; done"])
        .graceful_exit(Duration::from_millis(200));
    let child = native().launch(spec).unwrap();
    read_until(&child.stdout(), "ready");

    let started = Instant::now();
    child.destroy();
    assert_eq!(child.wait_for(), 128 + 9);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn signals_reach_the_child() {
    let factory = native();

    let child = factory.exec_args(["sleep", "600"]).unwrap();
    child.interrupt().unwrap();
    assert_eq!(child.wait_for(), 128 + 2);

    let child = factory.exec_args(["sleep", "600"]).unwrap();
    child.interrupt_ctrl_c().unwrap();
    assert_eq!(child.wait_for(), 128 + 2);

    let child = factory.exec_args(["sleep", "600"]).unwrap();
    child.hangup().unwrap();
    assert_eq!(child.wait_for(), 128 + 1);

    let child = factory.exec_args(["sleep", "600"]).unwrap();
    child.terminate().unwrap();
    assert_eq!(child.wait_for(), 128 + 15);
    // Signals after reaping are dropped rather than sent to a recycled pid.
    child.kill().unwrap();
}

#[test]
fn concurrent_waiters_all_see_the_status() {
    let child = Arc::new(
        native()
            .exec_args(["sh", "-c", "sleep 0.2; exit 5"])
            .unwrap(),
    );
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let child = Arc::clone(&child);
            thread::spawn(move || child.wait_for())
        })
        .collect();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), 5);
    }
}

#[test]
fn explicit_environment_replaces_the_inherited_one() {
    let spec = LaunchSpec::new(["sh", "-c", "echo \"$GREETING:$HOME\""]).env("GREETING", "hi");
    let child = native().launch(spec).unwrap();
    assert_eq!(drain(&child.stdout()), "hi:\n");
    assert_eq!(child.wait_for(), 0);

    let child = standard()
        .exec_with(["sh", "-c", "echo $GREETING"], Some(&["GREETING=std"][..]), None)
        .unwrap();
    assert_eq!(drain(&child.stdout()), "std\n");
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    for factory in [native(), standard()] {
        let child = factory
            .exec_with(["pwd", "-P"], None, Some(dir.path()))
            .unwrap();
        assert_eq!(drain(&child.stdout()).trim_end(), expected.to_str().unwrap());
        assert_eq!(child.wait_for(), 0);
    }
}

#[test]
#[allow(deprecated)]
fn legacy_command_line_is_split_on_whitespace() {
    let child = native().exec("echo   legacy\twords").unwrap();
    assert_eq!(drain(&child.stdout()), "legacy words\n");
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn detached_children_have_null_streams() {
    let child = native()
        .exec_detached(["sh", "-c", "exit 4"], None, None)
        .unwrap();
    assert_eq!(drain(&child.stdout()), "");
    assert!(child.stdin().write(b"x").is_err());
    assert_eq!(child.wait_for(), 4);
}

#[test]
fn terminal_pty_carries_all_streams() {
    let pty = Pty::new(PtyMode::Terminal).unwrap();
    let child = native()
        .exec_pty(
            ["sh", "-c", "test -t 0 && test -t 1 && test -t 2 && echo on-a-tty"],
            None,
            None,
            pty,
        )
        .unwrap();
    assert!(child.pty().is_some());
    let stdout = child.stdout();
    assert!(Arc::ptr_eq(&stdout, &child.pty().unwrap().input_stream()));
    assert!(drain(&stdout).contains("on-a-tty"));
    assert_eq!(drain(&child.stderr()), "");
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn console_pty_keeps_stderr_separate() {
    let pty = Pty::new(PtyMode::Console).unwrap();
    let spec = LaunchSpec::new(["sh", "-c", "test -t 0 && echo out; echo err 1>&2"]).pty(pty);
    let child = native().launch(spec).unwrap();
    let stdout = child.stdout();
    let stderr = child.stderr();
    assert!(drain(&stdout).contains("out"));
    assert_eq!(drain(&stderr), "err\n");
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn pty_input_reaches_the_child() {
    let pty = Pty::new(PtyMode::Console).unwrap();
    let spec = LaunchSpec::new(["sh", "-c", "read line; echo got:$line"]).pty(pty);
    let child = native().launch(spec).unwrap();
    (&*child.stdin()).write_all(b"hello\n").unwrap();
    assert!(read_until(&child.stdout(), "got:hello").contains("got:hello"));
    assert_eq!(child.wait_for(), 0);
}

#[test]
fn standard_factory_rejects_pty_up_front() {
    let pty = Pty::new(PtyMode::Terminal).unwrap();
    let result = standard().exec_pty(["true"], None, None, pty);
    assert!(matches!(result, Err(SpawnError::Unsupported(_))));
}

#[test]
fn interior_nul_is_rejected_before_launch() {
    for (factory, program) in [(native(), "/bin/s\0h"), (standard(), "s\0h")] {
        let result = factory.launch(LaunchSpec::new([program]));
        assert!(matches!(result, Err(SpawnError::CStringError(_))), "{result:?}");
    }
    let result = native().exec_args(["echo", "a\0b"]);
    assert!(matches!(result, Err(SpawnError::CStringError(_))));
}

#[test]
fn closing_stdout_does_not_wait_for_a_silent_child() {
    let child = native().exec_args(["sleep", "30"]).unwrap();
    let stdout = child.stdout();
    let reader = {
        let stdout = Arc::clone(&stdout);
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            stdout.read(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(100));

    let (done, closed) = mpsc::channel();
    {
        let stdout = Arc::clone(&stdout);
        thread::spawn(move || {
            let _ = done.send(stdout.close());
        });
    }
    closed
        .recv_timeout(Duration::from_secs(3))
        .expect("close waited on the blocked reader")
        .unwrap();
    assert!(stdout.is_closed());

    child.kill().unwrap();
    assert_eq!(child.wait_for(), 128 + 9);
    assert_eq!(reader.join().unwrap().unwrap(), 0);
}

#[test]
fn flatpak_sandbox_routes_through_flatpak_spawn() {
    let bin = tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
    let helper = bin.path().join("flatpak-spawn");
    fs::write(&helper, "#!/bin/sh\necho \"$@\"\n").unwrap();
    fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

    let factory = ProcessFactory::new(SpawnerConfig::default().with_sandbox(Sandbox::Flatpak));
    let path = bin.path().to_str().unwrap();
    // A concurrent fork may briefly hold the script open for writing.
    let child = (0..20)
        .find_map(|_| {
            match factory.launch(LaunchSpec::new(["echo", "hi"]).env("PATH", path)) {
                Err(SpawnError::Launch { reason, .. }) if reason.contains("busy") => {
                    thread::sleep(Duration::from_millis(50));
                    None
                }
                other => Some(other),
            }
        })
        .expect("helper stayed busy")
        .unwrap();
    assert_eq!(child.command(), "flatpak-spawn");
    assert_eq!(drain(&child.stdout()), "--host --watch-bus echo hi\n");
    assert_eq!(child.wait_for(), 0);
}
