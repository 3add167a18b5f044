use std::{net::UdpSocket, process::Command};

fn autoref() -> Command {
    Command::new(env!("CARGO_BIN_EXE_autoref"))
}

#[test]
fn zero_vision_port_exits_before_binding() {
    // the referee port stays free only if nothing was bound
    let output = autoref()
        .args(["--vision-port", "0", "--gc-port", "38701", "--duration", "1"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("vision"), "stderr: {}", stderr);
    assert!(UdpSocket::bind("127.0.0.1:38701").is_ok());
}

#[test]
fn negative_gc_port_is_rejected() {
    let output = autoref()
        .args(["--gc-port", "-5", "--duration", "1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn entry_point_requires_a_script() {
    let output = autoref()
        .args(["--entry-point", "main", "--duration", "1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
