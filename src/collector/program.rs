//! External program collectors.
//!
//! Programs live in `<dir>/<cadence-seconds>/<executable>`. Each tick the
//! program is run to completion and every stdout line is turned into a
//! point. Lines use the plaintext protocol (`[put ]metric ts value k=v ...`)
//! or the wire JSON object. Stderr is passed through to the agent's stderr.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use super::Collector;
use crate::point::{line, Emitter, RateType, SampleBatch, Unit, Value};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs one executable per tick and parses its output.
pub struct ProgramCollector {
    name: String,
    path: PathBuf,
    cadence: Duration,
    timeout: Duration,
}

impl ProgramCollector {
    pub fn new(path: impl Into<PathBuf>, cadence: Duration, timeout: Duration) -> Self {
        let path = path.into();
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: format!("program.{file}"),
            path,
            cadence,
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the program and returns its stdout once it exits successfully.
    ///
    /// The timeout covers both the program and anything it leaves holding
    /// stdout open. On expiry the program's whole process group is killed.
    fn run(&self) -> Result<String> {
        let mut cmd = Command::new(&self.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.path.display()))?;

        let mut stdout = child.stdout.take().context("program stdout not captured")?;
        let (out_tx, out_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut out = String::new();
            let _ = out_tx.send(stdout.read_to_string(&mut out).map(|_| out));
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("waiting for program")? {
                break status;
            }
            if Instant::now() >= deadline {
                return Err(self.kill_on_timeout(&mut child));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        // Background helpers forked by the program may still hold the pipe.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let out = match out_rx.recv_timeout(remaining) {
            Ok(read) => read.context("reading program output")?,
            Err(RecvTimeoutError::Timeout) => return Err(self.kill_on_timeout(&mut child)),
            Err(RecvTimeoutError::Disconnected) => bail!("stdout reader panicked"),
        };

        if !status.success() {
            bail!("{} exited with {status}", self.path.display());
        }

        Ok(out)
    }

    fn kill_on_timeout(&self, child: &mut Child) -> anyhow::Error {
        kill_process_group(child);
        let _ = child.wait();
        anyhow!("{} timed out after {:?}", self.path.display(), self.timeout)
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // Spawned with process_group(0), so the group id is the child's pid.
    if let Ok(pgid) = i32::try_from(child.id()) {
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

impl Collector for ProgramCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn cadence(&self) -> Option<Duration> {
        Some(self.cadence)
    }

    fn init(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.path)
            .with_context(|| format!("stat {}", self.path.display()))?;
        if !is_executable(&meta) {
            bail!("{} is not executable", self.path.display());
        }
        Ok(())
    }

    fn collect(&self, emitter: &Emitter) -> Result<SampleBatch> {
        let out = self.run()?;
        let mut batch = emitter.batch();

        for raw in out.lines() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match decode_line(raw) {
                Ok(parsed) => batch.add_at(
                    &parsed.metric,
                    parsed.value,
                    &parsed.tag_pairs(),
                    RateType::Gauge,
                    Unit::None,
                    "",
                    parsed.timestamp,
                ),
                Err(e) => {
                    tracing::warn!(collector = %self.name, line = raw, error = %e, "skipping unparsable line");
                }
            }
        }

        Ok(batch)
    }
}

#[derive(Deserialize)]
struct JsonLine {
    metric: String,
    timestamp: i64,
    value: Value,
    #[serde(default, deserialize_with = "tag_pairs")]
    tags: Vec<(String, String)>,
}

/// Reads the `tags` object as ordered pairs. Repeated keys are kept so the
/// emitter rejects them like it does for plaintext lines.
fn tag_pairs<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Pairs;

    impl<'de> Visitor<'de> for Pairs {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of tag keys to values")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut pairs = Vec::new();
            while let Some(pair) = map.next_entry()? {
                pairs.push(pair);
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(Pairs)
}

fn decode_line(raw: &str) -> Result<line::ParsedLine> {
    if raw.starts_with('{') {
        let json: JsonLine = serde_json::from_str(raw).context("decoding JSON point")?;
        return Ok(line::ParsedLine {
            metric: json.metric,
            timestamp: json.timestamp,
            value: json.value,
            tags: json.tags,
        });
    }
    Ok(line::parse(raw)?)
}

/// Finds program collectors under `dir`.
///
/// Only numeric subdirectories are considered; their name is the cadence in
/// seconds. Cadence `0` denotes a continuously running program, which is not
/// supported. Results are sorted by name.
pub fn discover(dir: &Path, timeout: Duration) -> Result<Vec<ProgramCollector>> {
    let mut found = Vec::new();

    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading program dir {}", dir.display()))?;

    for entry in entries {
        let entry = entry.context("reading program dir entry")?;
        let sub = entry.path();
        if !sub.is_dir() {
            continue;
        }

        let Some(secs) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };

        if secs == 0 {
            tracing::warn!(dir = %sub.display(), "continuous programs are not supported, skipping");
            continue;
        }

        let programs =
            std::fs::read_dir(&sub).with_context(|| format!("reading {}", sub.display()))?;
        for program in programs {
            let program = program.context("reading program entry")?;
            let meta = program.metadata().context("reading program metadata")?;
            if !meta.is_file() || !is_executable(&meta) {
                continue;
            }
            found.push(ProgramCollector::new(
                program.path(),
                Duration::from_secs(secs),
                timeout,
            ));
        }
    }

    found.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    Ok(found)
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    meta.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::point::Tagset;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn emitter() -> Emitter {
        let mut defaults = Tagset::new();
        defaults.insert("host", "box");
        Emitter::new(defaults)
    }

    #[test]
    fn test_program_output_becomes_points() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(
            dir.path(),
            "app",
            "echo 'app.jobs 1700000000 3 queue=high'\n\
             echo 'put app.lag 1700000001 0.5'\n\
             echo 'garbage'\n\
             echo '{\"metric\":\"app.json\",\"timestamp\":1700000002,\"value\":9,\"tags\":{\"k\":\"v\"}}'",
        );

        let c = ProgramCollector::new(path, Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(c.name(), "program.app");
        c.init().expect("init");

        let batch = c.collect(&emitter()).expect("collect");
        let points = batch.points();
        assert_eq!(points.len(), 3);

        assert_eq!(points[0].metric(), "app.jobs");
        assert_eq!(points[0].timestamp(), 1_700_000_000);
        assert_eq!(points[0].tags().get("queue"), Some("high"));
        assert_eq!(points[0].tags().get("host"), Some("box"));

        assert_eq!(points[1].value(), Value::Float(0.5));
        assert_eq!(points[2].tags().get("k"), Some("v"));
    }

    #[test]
    fn test_program_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path(), "fails", "echo 'm 1 1'\nexit 2");

        let c = ProgramCollector::new(path, Duration::from_secs(10), Duration::from_secs(5));
        let err = c.collect(&emitter()).err().expect("non-zero exit");
        assert!(err.to_string().contains("exited"));
    }

    #[test]
    fn test_program_timeout_kills() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path(), "slow", "exec sleep 10");

        let c = ProgramCollector::new(path, Duration::from_secs(10), Duration::from_millis(200));
        let start = Instant::now();
        let err = c.collect(&emitter()).err().expect("timeout");
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_covers_backgrounded_helpers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path(), "forks", "sleep 5 &\necho 'm 1700000000 1'");

        let c = ProgramCollector::new(path, Duration::from_secs(10), Duration::from_millis(200));
        let start = Instant::now();
        let err = c.collect(&emitter()).err().expect("helper holds stdout past the timeout");
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_json_tags_keep_repeated_keys() {
        let parsed = decode_line(
            r#"{"metric":"m","timestamp":1,"value":2,"tags":{"k":"a","k":"b","z":"c"}}"#,
        )
        .expect("decode");
        assert_eq!(parsed.tag_pairs(), vec![("k", "a"), ("k", "b"), ("z", "c")]);

        let parsed = decode_line(r#"{"metric":"m","timestamp":1,"value":2}"#).expect("decode");
        assert!(parsed.tags.is_empty());
    }

    #[test]
    fn test_duplicate_tags_rejected_in_both_formats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(
            dir.path(),
            "dups",
            "echo 'app.line 1700000000 1 k=a k=b'\n\
             echo '{\"metric\":\"app.json\",\"timestamp\":1700000000,\"value\":1,\"tags\":{\"k\":\"a\",\"k\":\"b\"}}'\n\
             echo 'app.ok 1700000000 1 k=a'",
        );

        let c = ProgramCollector::new(path, Duration::from_secs(10), Duration::from_secs(5));
        let batch = c.collect(&emitter()).expect("collect");
        let names: Vec<&str> = batch.points().iter().map(|p| p.metric()).collect();
        assert_eq!(names, vec!["app.ok"]);
    }

    #[test]
    fn test_init_rejects_missing_program() {
        let c = ProgramCollector::new(
            "/nonexistent/program",
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        assert!(c.init().is_err());
    }

    #[test]
    fn test_discover_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fast = dir.path().join("5");
        let slow = dir.path().join("60");
        let continuous = dir.path().join("0");
        let other = dir.path().join("docs");
        for d in [&fast, &slow, &continuous, &other] {
            std::fs::create_dir(d).expect("mkdir");
        }

        write_script(&fast, "b_check", "true");
        write_script(&slow, "a_check", "true");
        write_script(&continuous, "stream", "true");
        write_script(&other, "ignored", "true");
        std::fs::write(fast.join("README"), "not executable").expect("write");

        let found = discover(dir.path(), Duration::from_secs(1)).expect("discover");
        let names: Vec<&str> = found.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["program.a_check", "program.b_check"]);
        assert_eq!(found[0].cadence(), Some(Duration::from_secs(60)));
        assert_eq!(found[1].cadence(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_discover_missing_dir() {
        assert!(discover(Path::new("/nonexistent/scout"), Duration::from_secs(1)).is_err());
    }
}
