use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fastipc_transport::{
    segment_name, OutboundTransport, Segment, SegmentReader, TransportConfig,
    FRAME_AREA_OFFSET,
};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{transport_error, CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, print_table, OutputFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        platform_check(),
        shared_memory_check(),
        transport_check(),
        compiled_features_check(),
    ];

    let failed = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let output = DoctorOutput {
        checks,
        overall: if failed { "fail" } else { "pass" },
    };
    print_doctor(&output, format);

    Ok(if failed { HEALTH_CHECK_FAILED } else { SUCCESS })
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => {
            let rows: Vec<_> = output
                .checks
                .iter()
                .map(|c| (c.name, format!("{} {}", status_text(c.status), c.detail)))
                .collect();
            print_table(["CHECK", "RESULT"], &rows);
        }
        OutputFormat::Pretty => {
            println!("fastipc doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<20} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
    }
}

fn scratch_name(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("fastipc-doctor-{tag}-{}-{nanos}", std::process::id())
}

fn platform_check() -> CheckResult {
    CheckResult::pass(
        "platform",
        format!(
            "{}/{}: POSIX shared memory backend",
            std::env::consts::OS,
            std::env::consts::ARCH
        ),
    )
}

/// Two mappings of one segment see each other's frames.
fn shared_memory_check() -> CheckResult {
    const NAME: &str = "shared_memory";
    let name = segment_name(&scratch_name("shm"), 0);

    let result = (|| {
        let created = Segment::create(&name, fastipc_transport::DEFAULT_MIN_SEGMENT_SIZE)?;
        let opened = Segment::open(&name)?;
        created.write_frame(FRAME_AREA_OFFSET, b"doctor")?;
        let (frame, _) = opened.read_frame(FRAME_AREA_OFFSET)?;
        Ok::<_, fastipc_transport::TransportError>((frame, opened.capacity()))
    })();

    match result {
        Ok((frame, capacity)) if frame.as_ref() == b"doctor" => {
            CheckResult::pass(NAME, format!("{capacity} byte segment mapped twice"))
        }
        Ok(_) => CheckResult::fail(NAME, "frame read back differs from frame written"),
        Err(err) => CheckResult::fail(NAME, transport_error("segment", err).to_string()),
    }
}

/// One frame through a writer and reader, including the wake signal.
fn transport_check() -> CheckResult {
    const NAME: &str = "transport";
    let name = scratch_name("pair");
    let config = TransportConfig {
        min_segment_size: 256,
        open_timeout: Duration::from_millis(500),
        ..TransportConfig::default()
    };

    let started = Instant::now();
    let result = (|| {
        let writer = OutboundTransport::create(&name, config.clone())?;
        let reader = SegmentReader::open(&name, config)?;
        let payload = vec![0x5a; 1024];
        writer.write(b"ping")?;
        writer.write(&payload)?;
        let mut received = Vec::new();
        while let Some(frame) = reader.try_next_message()? {
            received.push(frame);
        }
        Ok::<_, fastipc_transport::TransportError>((received, payload, writer.segment_count()))
    })();

    match result {
        Ok((received, payload, segments))
            if received.len() == 2
                && received[0].as_ref() == b"ping"
                && received[1].as_ref() == payload.as_slice() =>
        {
            CheckResult::pass(
                NAME,
                format!(
                    "2 frames over {segments} segments in {:.2}ms",
                    started.elapsed().as_secs_f64() * 1000.0
                ),
            )
        }
        Ok((received, ..)) => CheckResult::fail(
            NAME,
            format!("expected 2 frames back, got {}", received.len()),
        ),
        Err(err) => CheckResult::fail(NAME, transport_error("transport", err).to_string()),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "channel") {
        features.push("channel");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult {
        name: "compiled_features",
        status: CheckStatus::Info,
        detail: features.join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            checks: vec![CheckResult::pass("x", "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn checks_pass_on_this_host() {
        assert_eq!(shared_memory_check().status, CheckStatus::Pass);
        assert_eq!(transport_check().status, CheckStatus::Pass);
    }
}
