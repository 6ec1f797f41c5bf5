use std::process::Command;
use std::sync::Mutex;
use std::time::Instant;

/// One reading of the inference server's resource use. Fields the platform
/// cannot report stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: Option<f64>,
    pub gpu_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self, pid: u32) -> ResourceSample;
}

/// Reads `/proc` on Linux and falls back to `ps` elsewhere. GPU load comes
/// from `nvidia-smi` when it is installed.
#[derive(Debug)]
pub struct ProcessSampler {
    previous: Mutex<Option<CpuReading>>,
    clock_ticks: f64,
    gpu_available: bool,
}

#[derive(Debug, Clone, Copy)]
struct CpuReading {
    pid: u32,
    ticks: u64,
    at: Instant,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        let gpu_available = Command::new("nvidia-smi")
            .arg("-L")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        Self {
            previous: Mutex::new(None),
            clock_ticks: clock_ticks_per_second(),
            gpu_available,
        }
    }

    fn cpu_from_proc(&self, pid: u32) -> Option<f64> {
        let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let ticks = parse_proc_stat_ticks(&raw)?;
        let now = Instant::now();

        let mut previous = self
            .previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let percent = match *previous {
            Some(reading) if reading.pid == pid => {
                let elapsed = now.duration_since(reading.at).as_secs_f64();
                if elapsed <= 0.0 {
                    None
                } else {
                    let used = ticks.saturating_sub(reading.ticks) as f64 / self.clock_ticks;
                    Some(used / elapsed * 100.0)
                }
            }
            _ => None,
        };
        *previous = Some(CpuReading {
            pid,
            ticks,
            at: now,
        });
        percent
    }

    fn gpu_percent(&self) -> Option<f64> {
        if !self.gpu_available {
            return None;
        }
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<f64>().ok())
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&self, pid: u32) -> ResourceSample {
        let proc_status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok();
        let (cpu_percent, rss_bytes) = match proc_status {
            Some(status) => (self.cpu_from_proc(pid), parse_vm_rss(&status)),
            None => sample_with_ps(pid),
        };
        ResourceSample {
            cpu_percent,
            gpu_percent: self.gpu_percent(),
            rss_bytes,
        }
    }
}

/// utime + stime from `/proc/<pid>/stat`. The command name may contain
/// spaces, so fields are counted after the closing parenthesis.
pub fn parse_proc_stat_ticks(raw: &str) -> Option<u64> {
    let after_name = &raw[raw.rfind(')')? + 1..];
    let fields = after_name.split_whitespace().collect::<Vec<&str>>();
    // Field 3 (state) is fields[0]; utime and stime are fields 14 and 15.
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(utime + stime)
}

pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kilobytes = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kilobytes * 1024)
}

fn sample_with_ps(pid: u32) -> (Option<f64>, Option<u64>) {
    let Ok(output) = Command::new("ps")
        .args(["-o", "%cpu=,rss=", "-p", &pid.to_string()])
        .output()
    else {
        return (None, None);
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut fields = text.split_whitespace();
    let cpu = fields.next().and_then(|value| value.parse::<f64>().ok());
    let rss = fields
        .next()
        .and_then(|value| value.parse::<u64>().ok())
        .map(|kilobytes| kilobytes * 1024);
    (cpu, rss)
}

#[cfg(unix)]
fn clock_ticks_per_second() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

#[cfg(not(unix))]
fn clock_ticks_per_second() -> f64 {
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_stat_ticks_skip_command_names_with_spaces() {
        let raw = "1234 (llama server) S 1 1234 1234 0 -1 4194560 500 0 0 0 250 50 0 0 20 0 8 0 100 0 0";
        assert_eq!(parse_proc_stat_ticks(raw), Some(300));
    }

    #[test]
    fn vm_rss_is_reported_in_bytes() {
        let status = "Name:\tllama-server\nVmPeak:\t  900 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sampling_this_process_reports_memory() {
        let sampler = ProcessSampler::new();
        let sample = sampler.sample(std::process::id());
        assert!(sample.rss_bytes.unwrap_or(0) > 0);
    }
}
