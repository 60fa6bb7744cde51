use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use crate::config::ChildConfig;

/// The supervision loop run inside each forked worker link.
///
/// Spawns the actual worker program with inherited standard streams and
/// keeps respawning it after a crash, asking the parent over the
/// back-channel to resend whatever the dead worker had queued. A worker
/// that cannot be started at all raises `'x'`, which the parent treats as
/// fatal. Diagnostics travel as `'{'`-framed, NUL-terminated JSON records
/// on the same back-channel.
pub fn run(config: &ChildConfig) -> i32 {
    // The parent created this descriptor for us and passed its number on
    // the command line; nothing else in this process owns it.
    let mut backchannel = unsafe { File::from_raw_fd(config.backchannel_fd) };

    if config.exec.is_empty() {
        eprintln!("worker {}: no worker program configured", config.ordinal);
        let _ = backchannel.write_all(b"x");
        return 1;
    }

    loop {
        match Command::new(&config.exec[0]).args(&config.exec[1..]).status() {
            Err(err) => {
                eprintln!(
                    "worker {}: failed to start {:?}: {err}",
                    config.ordinal, config.exec
                );
                let _ = backchannel.write_all(b"x");
                return 0;
            }
            Ok(status) if status.success() => {
                write_record(
                    &mut backchannel,
                    "info",
                    "worker process completed",
                    serde_json::json!({ "worker": config.ordinal }),
                );
                return 0;
            }
            Ok(status) => {
                write_record(
                    &mut backchannel,
                    "warning",
                    "worker process errored, requesting resend",
                    serde_json::json!({
                        "worker": config.ordinal,
                        "code": status.code(),
                        "signal": status.signal(),
                    }),
                );
                let _ = backchannel.write_all(b"r");
            }
        }
    }
}

/// Write a NUL-terminated JSON log record; the leading `'{'` doubles as the
/// control byte on the parent side.
fn write_record(backchannel: &mut File, level: &str, message: &str, fields: serde_json::Value) {
    let record = serde_json::json!({
        "when": chrono::Utc::now().to_rfc3339(),
        "level": level,
        "module": "jobherd::worker::child",
        "message": message,
        "fields": fields,
    });
    let mut bytes = record.to_string().into_bytes();
    bytes.push(0);
    let _ = backchannel.write_all(&bytes);
}
