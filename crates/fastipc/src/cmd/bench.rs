use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fastipc_channel::{
    CallSpec, Channel, ChannelConfig, Domain, MethodKey, Param, Registry, TypeKey, Value,
};
use fastipc_transport::TransportConfig;
use serde::Serialize;
use tracing::info;

use crate::cmd::{parse_duration, BenchArgs};
use crate::exit::{channel_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_json, print_table, OutputFormat};

/// Type served by the guest side of the loopback pair.
struct Echo;

struct BenchApi {
    registry: Arc<Registry>,
    echo: TypeKey,
    reverse: MethodKey,
}

fn bench_api() -> fastipc_channel::Result<BenchApi> {
    let mut builder = Registry::builder();
    let echo = builder.add_type::<Echo>("bench", "bench::Echo");
    builder.activator(echo, || Echo);
    let reverse = builder.method::<Echo, _>(echo, "reverse", &[Param::Any], Param::Any, |_, args| {
        Ok(Value::String(args.string(0)?.chars().rev().collect()))
    });
    Ok(BenchApi {
        registry: builder.build()?,
        echo,
        reverse,
    })
}

#[derive(Debug, Serialize)]
struct BenchOutput {
    calls: u32,
    payload_bytes: usize,
    total_ms: f64,
    calls_per_sec: f64,
    min_us: f64,
    p50_us: f64,
    p99_us: f64,
    max_us: f64,
    owner_messages: u64,
    guest_messages: u64,
}

pub fn run(args: BenchArgs, format: OutputFormat) -> CliResult<i32> {
    if args.calls == 0 {
        return Err(CliError::new(USAGE, "--calls must be greater than zero"));
    }
    let deadline = parse_duration(&args.timeout)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime", err))?;
    let output = runtime.block_on(measure(&args, deadline))?;

    print_bench(&output, format);
    Ok(SUCCESS)
}

async fn measure(args: &BenchArgs, deadline: Duration) -> CliResult<BenchOutput> {
    let api = bench_api().map_err(|err| channel_error("registry", err))?;
    let mut transport = TransportConfig::default();
    if let Some(size) = args.segment_size {
        transport.min_segment_size = size;
    }
    let config = ChannelConfig::new()
        .with_module("bench")
        .with_transport(transport)
        .with_call_timeout(deadline);

    let name = loopback_name();
    let owner = Channel::open(&name, Domain::Owner, Arc::clone(&api.registry), config.clone())
        .map_err(|err| channel_error("open owner", err))?;
    let guest = Channel::open(&name, Domain::Guest, Arc::clone(&api.registry), config)
        .map_err(|err| channel_error("open guest", err))?;

    let echo = owner
        .activate(api.echo)
        .await
        .map_err(|err| channel_error("activate", err))?;
    let payload = "x".repeat(args.payload);
    let call = || CallSpec::method(api.reverse, [Value::String(payload.clone())]);

    for _ in 0..args.warmup {
        echo.run(call())
            .await
            .map_err(|err| channel_error("warmup call", err))?;
    }

    let mut samples = Vec::with_capacity(args.calls as usize);
    let started = Instant::now();
    for _ in 0..args.calls {
        let sent = Instant::now();
        echo.run(call())
            .await
            .map_err(|err| channel_error("call", err))?;
        samples.push(sent.elapsed());
    }
    let total = started.elapsed();

    let output = summarize(&mut samples, total, args.payload);
    info!(
        calls = output.calls,
        total_ms = output.total_ms,
        "benchmark finished"
    );

    drop(echo);
    Ok(BenchOutput {
        owner_messages: owner.messages_received(),
        guest_messages: guest.messages_received(),
        ..output
    })
}

fn loopback_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("fastipc-bench-{}-{nanos}", std::process::id())
}

fn summarize(samples: &mut [Duration], total: Duration, payload_bytes: usize) -> BenchOutput {
    samples.sort_unstable();
    let micros = |d: Duration| (d.as_secs_f64() * 1_000_000.0 * 100.0).round() / 100.0;
    let percentile = |p: f64| {
        let rank = ((samples.len() - 1) as f64 * p).round() as usize;
        micros(samples[rank])
    };
    let total_secs = total.as_secs_f64();

    BenchOutput {
        calls: samples.len() as u32,
        payload_bytes,
        total_ms: (total_secs * 1000.0 * 100.0).round() / 100.0,
        calls_per_sec: if total_secs > 0.0 {
            (samples.len() as f64 / total_secs).round()
        } else {
            0.0
        },
        min_us: micros(samples[0]),
        p50_us: percentile(0.50),
        p99_us: percentile(0.99),
        max_us: micros(samples[samples.len() - 1]),
        owner_messages: 0,
        guest_messages: 0,
    }
}

fn print_bench(output: &BenchOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => print_table(
            ["METRIC", "VALUE"],
            &[
                ("calls", output.calls.to_string()),
                ("payload", format!("{} B", output.payload_bytes)),
                ("total", format!("{:.2} ms", output.total_ms)),
                ("throughput", format!("{} calls/s", output.calls_per_sec)),
                ("min", format!("{:.2} us", output.min_us)),
                ("p50", format!("{:.2} us", output.p50_us)),
                ("p99", format!("{:.2} us", output.p99_us)),
                ("max", format!("{:.2} us", output.max_us)),
                (
                    "messages",
                    format!("owner={} guest={}", output.owner_messages, output.guest_messages),
                ),
            ],
        ),
        OutputFormat::Pretty => {
            println!("fastipc bench\n");
            println!("  Calls:       {} x {} B", output.calls, output.payload_bytes);
            println!("  Total:       {:.2} ms", output.total_ms);
            println!("  Throughput:  {} calls/s", output.calls_per_sec);
            println!(
                "  Latency:     min {:.2} us, p50 {:.2} us, p99 {:.2} us, max {:.2} us",
                output.min_us, output.p50_us, output.p99_us, output.max_us
            );
        }
        OutputFormat::Raw => println!("{}", output.calls_per_sec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_orders_samples() {
        let mut samples: Vec<_> = [30u64, 10, 20, 40]
            .iter()
            .map(|us| Duration::from_micros(*us))
            .collect();
        let out = summarize(&mut samples, Duration::from_millis(1), 8);
        assert_eq!(out.calls, 4);
        assert_eq!(out.min_us, 10.0);
        assert_eq!(out.max_us, 40.0);
        assert_eq!(out.calls_per_sec, 4000.0);
    }

    #[test]
    fn loopback_pair_completes_calls() {
        let args = BenchArgs {
            calls: 50,
            warmup: 5,
            payload: 64,
            timeout: "5s".to_string(),
            segment_size: Some(512),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let out = runtime
            .block_on(measure(&args, Duration::from_secs(5)))
            .unwrap();
        assert_eq!(out.calls, 50);
        // Activation reply plus one reply per call.
        assert_eq!(out.owner_messages, 56);
        assert!(out.min_us <= out.p50_us && out.p50_us <= out.max_us);
    }
}
