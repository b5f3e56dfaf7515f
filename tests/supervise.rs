// Signal supervision against real children.
//
// The supervisor reaps with waitpid(-1) and marks the whole process a child
// subreaper, so this binary holds a single test.
use crest::container::Process;
use crest::signals::{SignalSupervisor, Supervisor};
use crest::terminal::Terminal;
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

fn process_for(pid: u32) -> Process {
    let mut process = Process::new(false);
    process.pid = Some(Pid::from_raw(pid as i32));
    process
}

#[test]
fn test_supervisor_forwards_signals_and_reaps_exit_codes() {
    let mut supervisor = SignalSupervisor::new(Terminal::Passthrough).unwrap();

    // Own process group, so SIGTERM goes out through killpg.
    let mut trapped = Command::new("sh")
        .args([
            "-c",
            "trap 'exit 3' TERM; echo ready; while :; do sleep 0.05; done",
        ])
        .stdout(Stdio::piped())
        .process_group(0)
        .spawn()
        .unwrap();
    let mut line = String::new();
    BufReader::new(trapped.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line.trim(), "ready");

    // Aimed at this thread, which has the signal blocked for the supervisor.
    assert_eq!(
        unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGTERM) },
        0
    );
    assert_eq!(supervisor.forward(&process_for(trapped.id())).unwrap(), 3);

    // Death by signal reports 128 + signo.
    let killed = Command::new("sh")
        .args(["-c", "kill -KILL $$"])
        .spawn()
        .unwrap();
    assert_eq!(supervisor.forward(&process_for(killed.id())).unwrap(), 137);

    supervisor.close().unwrap();
}
