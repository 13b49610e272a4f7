//! Linux host counters read from `/proc`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use super::Collector;
use crate::point::{Emitter, RateType, SampleBatch, Unit};

/// `/proc/meminfo` fields reported as `linux.mem.<name>`.
const MEMINFO_FIELDS: &[(&str, &str, &str)] = &[
    ("MemTotal", "total", "Total usable RAM."),
    ("MemFree", "free", "Unused RAM."),
    ("MemAvailable", "available", "RAM available for new workloads without swapping."),
    ("Buffers", "buffers", "Raw disk block cache."),
    ("Cached", "cached", "Page cache."),
    ("SwapTotal", "swap_total", "Total swap space."),
    ("SwapFree", "swap_free", "Unused swap space."),
];

#[derive(Debug, Clone, PartialEq)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
    pub runnable: u64,
    pub total_threads: u64,
}

/// Parses `/proc/loadavg`, e.g. `0.10 0.20 0.30 1/234 5678`.
pub fn parse_loadavg(s: &str) -> Result<LoadAvg> {
    let fields: Vec<&str> = s.split_whitespace().collect();
    let [one, five, fifteen, procs, ..] = fields.as_slice() else {
        bail!("loadavg: expected at least 4 fields, got {}", fields.len());
    };
    let (runnable, total) = procs
        .split_once('/')
        .with_context(|| format!("loadavg: malformed process field {procs:?}"))?;

    Ok(LoadAvg {
        one: one.parse().context("loadavg: 1 min")?,
        five: five.parse().context("loadavg: 5 min")?,
        fifteen: fifteen.parse().context("loadavg: 15 min")?,
        runnable: runnable.parse().context("loadavg: runnable")?,
        total_threads: total.parse().context("loadavg: total threads")?,
    })
}

/// Parses `/proc/meminfo` into bytes keyed by field name.
pub fn parse_meminfo(s: &str) -> HashMap<String, u64> {
    s.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let bytes = match parts.next() {
                Some("kB") => value.saturating_mul(1024),
                _ => value,
            };
            Some((key.trim().to_string(), bytes))
        })
        .collect()
}

/// Parses the first field of `/proc/uptime` (seconds since boot).
pub fn parse_uptime(s: &str) -> Result<f64> {
    let first = s.split_whitespace().next().context("uptime: empty")?;
    first.parse().context("uptime: invalid seconds")
}

/// Load average, memory and uptime from procfs.
pub struct SystemCollector {
    proc_root: PathBuf,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn read(&self, file: &str) -> Result<String> {
        let path = self.proc_root.join(file);
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn collect_loadavg(&self, batch: &mut SampleBatch) -> Result<()> {
        let load = parse_loadavg(&self.read("loadavg")?)?;
        let gauge = |batch: &mut SampleBatch, name: &str, v: f64, desc: &str| {
            batch.add(name, v, &[], RateType::Gauge, Unit::Load, desc);
        };
        gauge(batch, "linux.loadavg.1_min", load.one, "System load average over 1 minute.");
        gauge(batch, "linux.loadavg.5_min", load.five, "System load average over 5 minutes.");
        gauge(batch, "linux.loadavg.15_min", load.fifteen, "System load average over 15 minutes.");
        batch.add(
            "linux.loadavg.runnable",
            load.runnable,
            &[],
            RateType::Gauge,
            Unit::Count,
            "Currently runnable scheduling entities.",
        );
        batch.add(
            "linux.loadavg.total_threads",
            load.total_threads,
            &[],
            RateType::Gauge,
            Unit::Count,
            "Scheduling entities on the system.",
        );
        Ok(())
    }

    fn collect_meminfo(&self, batch: &mut SampleBatch) -> Result<()> {
        let mem = parse_meminfo(&self.read("meminfo")?);

        for (field, name, desc) in MEMINFO_FIELDS {
            if let Some(v) = mem.get(*field) {
                batch.add(
                    &format!("linux.mem.{name}"),
                    *v,
                    &[],
                    RateType::Gauge,
                    Unit::Bytes,
                    desc,
                );
            }
        }

        let total = *mem.get("MemTotal").context("meminfo: missing MemTotal")?;
        let free = ["MemFree", "Buffers", "Cached"]
            .iter()
            .filter_map(|k| mem.get(*k))
            .sum::<u64>()
            .min(total);

        batch.add("os.mem.total", total, &[], RateType::Gauge, Unit::Bytes, "Total memory.");
        batch.add("os.mem.free", free, &[], RateType::Gauge, Unit::Bytes, "Free memory including caches.");
        batch.add("os.mem.used", total - free, &[], RateType::Gauge, Unit::Bytes, "Used memory.");
        if total > 0 {
            batch.add(
                "os.mem.percent_free",
                free as f64 / total as f64 * 100.0,
                &[],
                RateType::Gauge,
                Unit::Percent,
                "Percentage of memory free.",
            );
        }
        Ok(())
    }

    fn collect_uptime(&self, batch: &mut SampleBatch) -> Result<()> {
        let secs = parse_uptime(&self.read("uptime")?)?;
        batch.add(
            "os.system.uptime",
            secs.trunc(),
            &[],
            RateType::Gauge,
            Unit::Seconds,
            "Seconds since boot.",
        );
        Ok(())
    }
}

impl Collector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    fn init(&self) -> Result<()> {
        self.read("loadavg").map(|_| ())
    }

    fn collect(&self, emitter: &Emitter) -> Result<SampleBatch> {
        let mut batch = emitter.batch();
        self.collect_loadavg(&mut batch)?;
        self.collect_meminfo(&mut batch)?;
        self.collect_uptime(&mut batch)?;
        Ok(batch)
    }
}
