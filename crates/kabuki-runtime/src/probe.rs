//! Host capacity probe
//!
//! One shell round trip gathers CPU load, CPU count, available memory and
//! the accelerator table; sections are separated by a marker line.

use kabuki_core::{AcceleratorReading, KabukiError, KabukiResult, ResourceReading};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::Transport;

const SECTION_MARKER: &str = "<<>>";

/// Script run on the host to read its capacity
pub const PROBE_COMMAND: &str = "top -b -n1 -i | head -n 5; echo '<<>>'; \
     nproc 2>/dev/null || getconf _NPROCESSORS_ONLN; echo '<<>>'; \
     grep MemAvailable /proc/meminfo; echo '<<>>'; \
     nvidia-smi --query-gpu=name,memory.total,memory.free,utilization.gpu \
     --format=csv,noheader,nounits 2>/dev/null || true";

/// Probe the host behind `transport`.
pub async fn probe_reading(
    transport: &dyn Transport,
    timeout: Duration,
) -> KabukiResult<ResourceReading> {
    let host = transport.host().to_string();
    let output = tokio::time::timeout(
        timeout,
        transport
            .shell_command(PROBE_COMMAND)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| KabukiError::connectivity(&host, format!("probe timed out after {:?}", timeout)))?
    .map_err(|e| KabukiError::connectivity(&host, format!("failed to start transport: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KabukiError::connectivity(
            &host,
            format!(
                "probe exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ),
        ));
    }

    let reading = parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
    debug!(
        host = %host,
        cpu = reading.cpu_usage_fraction,
        cpus = reading.cpu_count,
        free_mib = reading.free_memory_mib(),
        accelerators = reading.accelerators.len(),
        "Probed host"
    );
    Ok(reading)
}

/// Parse the output of [`PROBE_COMMAND`].
pub fn parse_probe_output(output: &str) -> KabukiResult<ResourceReading> {
    let mut sections = vec![String::new()];
    for line in output.lines() {
        if line.trim() == SECTION_MARKER {
            sections.push(String::new());
        } else if let Some(current) = sections.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }
    if sections.len() < 3 {
        return Err(KabukiError::Protocol(format!(
            "probe output has {} sections, expected 4",
            sections.len()
        )));
    }

    let cpu_usage_fraction = parse_cpu_usage(&sections[0])?;
    let cpu_count = sections[1]
        .trim()
        .parse::<u32>()
        .map_err(|_| KabukiError::Protocol(format!("bad cpu count '{}'", sections[1].trim())))?;
    let free_memory_kb = parse_mem_available(&sections[2])?;
    let accelerators = sections
        .get(3)
        .map(|s| parse_accelerators(s))
        .unwrap_or_default();

    Ok(ResourceReading {
        cpu_usage_fraction,
        free_memory_kb,
        cpu_count,
        accelerators,
    })
}

/// `%Cpu(s):  3.1 us,  1.0 sy, ...` gives 0.031
fn parse_cpu_usage(section: &str) -> KabukiResult<f64> {
    let line = section
        .lines()
        .find(|l| l.contains("Cpu(s):"))
        .ok_or_else(|| KabukiError::Protocol("no Cpu(s) line in top output".to_string()))?;
    let fields = line.split_once("Cpu(s):").map(|(_, rest)| rest).unwrap_or("");
    for field in fields.split(',') {
        let field = field.trim();
        if let Some(value) = field.strip_suffix("us") {
            let value = value.trim().trim_end_matches('%');
            return value
                .parse::<f64>()
                .map(|pct| pct / 100.0)
                .map_err(|_| KabukiError::Protocol(format!("bad cpu usage '{}'", field)));
        }
    }
    Err(KabukiError::Protocol(format!("no user cpu in '{}'", line.trim())))
}

fn parse_mem_available(section: &str) -> KabukiResult<i64> {
    section
        .lines()
        .find_map(|l| l.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<i64>().ok())
        .ok_or_else(|| KabukiError::Protocol("no MemAvailable in probe output".to_string()))
}

fn parse_accelerators(section: &str) -> Vec<AcceleratorReading> {
    let mut accelerators = Vec::new();
    for line in section.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            debug!(line, "Ignoring non-accelerator probe line");
            continue;
        }
        let (Ok(total_memory), Ok(free_memory)) =
            (fields[1].parse::<i64>(), fields[2].parse::<i64>())
        else {
            warn!(line, "Ignoring accelerator line with unreadable memory");
            continue;
        };
        // Some boards report "[N/A]" for utilization.
        let utilization_fraction = fields[3].parse::<f64>().map(|u| u / 100.0).unwrap_or(0.0);
        accelerators.push(AcceleratorReading {
            name: fields[0].to_string(),
            total_memory,
            free_memory,
            utilization_fraction,
        });
    }
    accelerators
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    const SAMPLE: &str = "\
top - 10:21:07 up 12 days,  3:02,  2 users,  load average: 0.52, 0.58, 0.59
Tasks: 312 total,   1 running, 311 sleeping,   0 stopped,   0 zombie
%Cpu(s): 12.5 us,  1.0 sy,  0.0 ni, 86.1 id,  0.3 wa,  0.0 hi,  0.1 si,  0.0 st
MiB Mem :  64237.1 total,  20012.4 free,  10321.0 used,  33903.7 buff/cache
MiB Swap:   2048.0 total,   2048.0 free,      0.0 used.  53170.2 avail Mem
<<>>
16
<<>>
MemAvailable:   54446284 kB
<<>>
GeForce GTX 1080 Ti, 11178, 3551, 28
GeForce GTX 1080 Ti, 11178, 11170, [N/A]
";

    #[test]
    fn test_parse_full_output() {
        let reading = parse_probe_output(SAMPLE).unwrap();
        assert!((reading.cpu_usage_fraction - 0.125).abs() < 1e-9);
        assert_eq!(reading.cpu_count, 16);
        assert_eq!(reading.free_memory_kb, 54446284);
        assert_eq!(reading.accelerators.len(), 2);
        assert_eq!(reading.accelerators[0].name, "GeForce GTX 1080 Ti");
        assert_eq!(reading.accelerators[0].free_memory, 3551);
        assert!((reading.accelerators[0].utilization_fraction - 0.28).abs() < 1e-9);
        assert_eq!(reading.accelerators[1].utilization_fraction, 0.0);
    }

    #[test]
    fn test_parse_host_without_accelerators() {
        let output = "%Cpu(s):  3.0%us,  1.0%sy\n<<>>\n4\n<<>>\nMemAvailable: 2048 kB\n<<>>\n";
        let reading = parse_probe_output(output).unwrap();
        assert!((reading.cpu_usage_fraction - 0.03).abs() < 1e-9);
        assert_eq!(reading.cpu_count, 4);
        assert!(reading.accelerators.is_empty());
    }

    #[test]
    fn test_malformed_accelerator_lines_are_skipped() {
        let table = "NVIDIA-SMI has failed because it couldn't communicate\nTesla V100, 16160, 16000, 0\n";
        let accelerators = parse_accelerators(table);
        assert_eq!(accelerators.len(), 1);
        assert_eq!(accelerators[0].name, "Tesla V100");
    }

    #[test]
    fn test_parse_truncated_output() {
        let err = parse_probe_output("%Cpu(s): 1.0 us\n").unwrap_err();
        assert!(matches!(err, KabukiError::Protocol(_)));

        let err = parse_probe_output("nothing\n<<>>\n4\n<<>>\nMemAvailable: 1 kB\n").unwrap_err();
        assert!(matches!(err, KabukiError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_probe_reports_failed_transport_as_connectivity() {
        let transport = LocalTransport::new();
        struct Failing(LocalTransport);
        impl Transport for Failing {
            fn shell_command(&self, _script: &str) -> tokio::process::Command {
                self.0.shell_command("echo 'Permission denied (publickey)' >&2; exit 255")
            }
            fn host(&self) -> &str {
                "locked-box"
            }
        }
        let err = probe_reading(&Failing(transport), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            KabukiError::Connectivity { host, message } => {
                assert_eq!(host, "locked-box");
                assert!(message.contains("Permission denied"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
