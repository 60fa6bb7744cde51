use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::SimulateConfig;
use crate::worker::profile::DurationProfile;

/// Simulated worker body: read a command, pretend to work on it for a
/// pseudo-normally distributed interval, echo it back. With `can_die` set
/// the simulator crashes deliberately when it draws a long sample, which
/// exercises the resend path in the parent. Round-trip gaps between echo
/// and the next command are reported on stderr at the end.
pub fn run(config: &SimulateConfig) -> i32 {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut rng = rand::thread_rng();
    let crash_limit = (config.mean_ms + config.sd_ms) as f64;
    let mut times = DurationProfile::new(Duration::from_micros(5), 1.2, 96);
    let mut last_echo: Option<Instant> = None;

    for line in stdin.lock().lines() {
        let Ok(command) = line else { break };
        if command.is_empty() {
            continue;
        }
        if let Some(echoed_at) = last_echo.take() {
            times.record(echoed_at.elapsed());
        }
        let pause = sample_ms(&mut rng, config);
        std::thread::sleep(Duration::from_millis(pause.max(0.0) as u64));
        if config.can_die && sample_ms(&mut rng, config) > crash_limit {
            eprintln!("Crash during work... {}", std::process::id());
            return 3;
        }
        {
            let mut out = stdout.lock();
            let _ = writeln!(out, "{command}");
            let _ = out.flush();
        }
        last_echo = Some(Instant::now());
        if config.can_die && sample_ms(&mut rng, config) > crash_limit {
            // The half-written reply is exactly the noise the parent must
            // tolerate on its result stream.
            println!("Uh oh, crashed");
            let _ = io::stdout().flush();
            eprintln!("Crash after work... {}", std::process::id());
            return 2;
        }
    }

    eprintln!(
        "{}",
        serde_json::to_string(&times).unwrap_or_else(|_| "{}".to_string())
    );
    0
}

/// Pseudo-normal sample in milliseconds: an Irwin-Hall sum of twelve
/// uniforms has mean 6 and unit variance, so `mean + sd * (sum - 6)`
/// approximates N(mean, sd).
pub(crate) fn sample_ms<R: Rng>(rng: &mut R, config: &SimulateConfig) -> f64 {
    let sum: f64 = (0..12).map(|_| rng.gen::<f64>()).sum();
    config.mean_ms as f64 + config.sd_ms as f64 * (sum - 6.0)
}
