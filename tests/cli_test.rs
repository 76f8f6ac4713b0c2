// Binary-level tests for `deck` and `launcher`.
//
// The fallback tests run without a terminal, so both binaries must exec the
// command directly. The deck tests spawn `deck` inside a real pty.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};

const DECK: &str = env!("CARGO_BIN_EXE_deck");
const LAUNCHER: &str = env!("CARGO_BIN_EXE_launcher");

/// Run a binary with no terminal attached and an isolated environment.
fn run_detached(binary: &str, args: &[&str], socket: Option<&str>) -> Output {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .env("CARDDECK_LOG_FILE", dir.path().join("test.log"))
        .env("CARDDECK_CONFIG_DIR", dir.path())
        .env_remove("CARDDECK_SOCKET")
        .env_remove("CARDDECK_NAMING");
    if let Some(socket) = socket {
        cmd.env("CARDDECK_SOCKET", socket);
    }
    cmd.output().unwrap()
}

#[test]
fn test_no_arguments_is_a_usage_error() {
    assert_eq!(run_detached(DECK, &[], None).status.code(), Some(3));
    assert_eq!(run_detached(LAUNCHER, &[], None).status.code(), Some(3));
}

#[test]
fn test_launcher_without_deck_runs_command_directly() {
    let out = run_detached(LAUNCHER, &["sh", "-c", "echo direct; exit 42"], None);
    assert_eq!(out.status.code(), Some(42));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "direct\n");
    assert!(String::from_utf8_lossy(&out.stderr).contains("CARDDECK_SOCKET"));
}

#[test]
fn test_launcher_with_error_marker_runs_command_directly() {
    let out = run_detached(LAUNCHER, &["sh", "-c", "exit 9"], Some("(error)"));
    assert_eq!(out.status.code(), Some(9));
}

#[test]
fn test_launcher_without_tty_runs_command_directly() {
    let out = run_detached(LAUNCHER, &["sh", "-c", "exit 4"], Some("/nonexistent/sock"));
    assert_eq!(out.status.code(), Some(4));
    assert!(String::from_utf8_lossy(&out.stderr).contains("tty"));
}

#[test]
fn test_deck_without_tty_runs_command_directly() {
    let out = run_detached(DECK, &["sh", "-c", "exit 5"], None);
    assert_eq!(out.status.code(), Some(5));
}

#[test]
fn test_failed_fallback_exits_one() {
    let out = run_detached(LAUNCHER, &["/nonexistent/carddeck-missing"], None);
    assert_eq!(out.status.code(), Some(1));
}

type SharedOutput = Arc<Mutex<String>>;

fn spawn_output_capture(mut reader: Box<dyn Read + Send>) -> (thread::JoinHandle<()>, SharedOutput) {
    let buffer: SharedOutput = Arc::new(Mutex::new(String::new()));
    let buf_clone = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => buf_clone
                    .lock()
                    .unwrap()
                    .push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
    });
    (handle, buffer)
}

/// Run `deck <argv>` in a pty. Returns the exit code and everything the
/// deck wrote to its terminal.
fn run_deck_in_pty(argv: &[&str], dir: &Path) -> (u32, String) {
    run_in_pty(DECK, argv, dir)
}

/// Run `program <argv>` in a pty with `$DECK` and `$LAUNCHER` exported.
fn run_in_pty(program: &str, argv: &[&str], dir: &Path) -> (u32, String) {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .unwrap();

    let mut cmd = CommandBuilder::new(program);
    cmd.args(argv);
    cmd.env("CARDDECK_LOG_FILE", dir.join("deck.log"));
    cmd.env("CARDDECK_CONFIG_DIR", dir);
    cmd.env("DECK", DECK);
    cmd.env("LAUNCHER", LAUNCHER);
    cmd.env_remove("CARDDECK_SOCKET");
    cmd.env_remove("CARDDECK_NAMING");

    let mut child = pair.slave.spawn_command(cmd).unwrap();
    drop(pair.slave);
    let (reader, output) = spawn_output_capture(pair.master.try_clone_reader().unwrap());

    let deadline = Instant::now() + Duration::from_secs(60);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(
            Instant::now() < deadline,
            "deck did not exit; output so far: {:?}",
            output.lock().unwrap()
        );
        thread::sleep(Duration::from_millis(20));
    };

    drop(pair.master);
    let _ = reader.join();
    let text = output.lock().unwrap().clone();
    (status.exit_code(), text)
}

#[test]
fn test_deck_runs_command_on_root_card() {
    let dir = tempfile::tempdir().unwrap();
    let (code, output) = run_deck_in_pty(
        &["sh", "-c", "test -S \"$CARDDECK_SOCKET\" && echo root-says-hi; exit 7"],
        dir.path(),
    );
    assert_eq!(code, 7, "output: {output:?}");
    assert!(output.contains("root-says-hi"), "output: {output:?}");
    assert!(!output.contains("From card"), "root card must not be bracketed: {output:?}");
}

#[test]
fn test_launcher_inside_deck_gets_its_own_card() {
    let dir = tempfile::tempdir().unwrap();
    let (code, output) = run_deck_in_pty(
        &[
            "sh",
            "-c",
            "\"$LAUNCHER\" sh -c 'echo nested-output; exit 3'; echo launcher=$?; sleep 1",
        ],
        dir.path(),
    );
    assert_eq!(code, 0, "output: {output:?}");
    assert!(output.contains("From card 0 {{{"), "output: {output:?}");
    assert!(output.contains("nested-output"), "output: {output:?}");
    assert!(output.contains("}}}"), "output: {output:?}");
    assert!(output.contains("launcher=3"), "output: {output:?}");
}

#[test]
fn test_deck_maps_missing_command_to_127() {
    let dir = tempfile::tempdir().unwrap();
    let (code, output) = run_deck_in_pty(&["/nonexistent/carddeck-missing"], dir.path());
    assert_eq!(code, 127, "output: {output:?}");
}

/// Runs `deck` under a range of descriptor limits. Somewhere in the range
/// the limit leaves room for the deck's own setup but not for the card's
/// pty, so `openpty` fails after the terminal is already in raw mode. Every
/// run must still end with the command's own exit status and a terminal
/// that is back in cooked mode.
#[test]
fn test_pty_allocation_failure_falls_back_to_direct_exec() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"
        n=6
        while [ $n -le 40 ]; do
            ( ulimit -n $n; export CARDDECK_LOG_FILE="$LOGDIR/deck-$n.log"; exec "$DECK" sh -c 'exit 6' )
            echo $? > "$LOGDIR/code-$n"
            if stty -a | grep -qE '(^| )-echo( |;|$)'; then echo "echo-left-off-at-$n"; fi
            n=$((n + 1))
        done
    "#;
    let logdir = dir.path().join("runs");
    std::fs::create_dir(&logdir).unwrap();
    let script = format!("LOGDIR='{}'; {script}", logdir.display());
    let (code, output) = run_in_pty("sh", &["-c", &script], dir.path());
    assert_eq!(code, 0, "output: {output:?}");
    assert!(!output.contains("echo-left-off"), "terminal not restored: {output:?}");

    let mut pty_failures = 0;
    for n in 6..=40 {
        let log = std::fs::read_to_string(logdir.join(format!("deck-{n}.log"))).unwrap_or_default();
        if !log.contains("openpty") {
            continue;
        }
        pty_failures += 1;
        let exit = std::fs::read_to_string(logdir.join(format!("code-{n}"))).unwrap();
        assert_eq!(exit.trim(), "6", "limit {n}: fallback exit status; log: {log}");
    }
    assert!(pty_failures > 0, "no descriptor limit made openpty fail");
}
