//! rtaccel CLI - drives scripted scenes through the acceleration structure
//! builders on the headless device.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rtaccel::accel::{Blas, Tlas};
use rtaccel::bench::{CsvLogSink, HostBenchmark};
use rtaccel::config::AccelConfig;
use rtaccel::device::{CommandBuffer, Context, HeadlessDevice};
use rtaccel::scene::{GeometryStore, Mesh, MeshInstance, Primitive, TransformNode, Vertex};
use rtaccel::util::{Mat4, Quat, Vec3};

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut config_path: Option<String> = None;
    let mut csv_path: Option<String> = None;
    let mut filtered_args: Vec<&str> = Vec::new();
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            "-c" | "--config" => config_path = iter.next().cloned(),
            "--csv" => csv_path = iter.next().cloned(),
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match filtered_args[0] {
        // Demo command - static + animated scene with lean refits
        "demo" | "d" => parse_counts(&filtered_args[1..])
            .and_then(|(s, a, f)| cmd_demo(&config, s, a, f, csv_path.as_deref())),
        // Config command - print effective configuration
        "config" => cmd_config(&config),
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Install the fmt subscriber. With the `chrome` feature and
/// `RTACCEL_TRACE=1`, spans are also written to `trace.json`.
#[cfg(feature = "chrome")]
fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    if env::var("RTACCEL_TRACE").ok().as_deref() == Some("1") {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file("trace.json")
            .build();
        tracing_subscriber::registry().with(filter).with(fmt).with(chrome_layer).init();
        return Some(guard);
    }
    tracing_subscriber::registry().with(filter).with(fmt).init();
    None
}

#[cfg(not(feature = "chrome"))]
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(path: Option<&str>) -> anyhow::Result<AccelConfig> {
    match path {
        Some(path) => AccelConfig::load_from(path).with_context(|| format!("loading config {path}")),
        None => Ok(AccelConfig::load()?),
    }
}

fn parse_counts(args: &[&str]) -> anyhow::Result<(usize, usize, u64)> {
    let mut counts = [4u64, 4, 8];
    for (slot, arg) in counts.iter_mut().zip(args) {
        *slot = arg.parse().with_context(|| format!("not a number: {arg}"))?;
    }
    Ok((counts[0] as usize, counts[1] as usize, counts[2]))
}

fn print_help() {
    println!("rtaccel - acceleration structure toolkit");
    println!();
    println!("USAGE:");
    println!("    rtaccel-cli [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    d, demo [static] [animated] [frames]   Build a scene and run lean refits (default 4 4 8)");
    println!("    config                                 Print the effective configuration as JSON");
    println!("    h, help                                Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose        Show debug output");
    println!("    -vv, --trace         Show trace output (very verbose)");
    println!("    -q, --quiet          Errors only");
    println!("    -c, --config <path>  JSON config file (default: $RTACCEL_CONFIG)");
    println!("    --csv <path>         Write BLAS build phase timings as CSV");
    println!();
    println!("NOTES:");
    println!("    - RUST_LOG overrides the verbosity flags");
    println!("    - With --features chrome, RTACCEL_TRACE=1 writes trace.json");
}

fn cmd_config(config: &AccelConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Unit cube split into two primitives (sides and caps).
fn cube() -> (Vec<Vertex>, Vec<u32>, Mesh) {
    let vertices: Vec<Vertex> = (0..8)
        .map(|i| {
            Vertex::new([
                if i & 1 == 0 { -0.5 } else { 0.5 },
                if i & 2 == 0 { -0.5 } else { 0.5 },
                if i & 4 == 0 { -0.5 } else { 0.5 },
            ])
        })
        .collect();
    #[rustfmt::skip]
    let indices: Vec<u32> = vec![
        // sides
        0, 1, 5, 0, 5, 4,   1, 3, 7, 1, 7, 5,
        3, 2, 6, 3, 6, 7,   2, 0, 4, 2, 4, 6,
        // caps
        0, 2, 3, 0, 3, 1,   4, 5, 7, 4, 7, 6,
    ];
    let mesh = Mesh::new("cube", vec![Primitive::new(0, 0, 24, 7), Primitive::new(1, 24, 12, 7)]);
    (vertices, indices, mesh)
}

fn cmd_demo(
    config: &AccelConfig,
    static_count: usize,
    animated_count: usize,
    frames: u64,
    csv_path: Option<&str>,
) -> anyhow::Result<()> {
    let device = Arc::new(HeadlessDevice::new());
    let ctx: Context = device.clone();

    let (vertices, indices, mesh) = cube();
    let store = GeometryStore::create(&ctx, &vertices, &indices)?;

    let mut bench = HostBenchmark::new();
    let mut blas = Blas::with_config(config);
    blas.create_or_update(&ctx, Arc::new(mesh), &store, Some(&mut bench))?;
    if let Some(log) = bench.last_log() {
        println!("BLAS build ({}):", blas.name());
        println!("{}", log.print_pretty());
        println!();
        if let Some(path) = csv_path {
            let mut sink = CsvLogSink::create(path, ',').with_context(|| format!("creating {path}"))?;
            sink.append_log(log)?;
            sink.flush()?;
        }
    }

    let mut tlas = Tlas::new(&ctx, config.clone());
    let mut nodes = Vec::with_capacity(animated_count);
    for i in 0..static_count + animated_count {
        let is_static = i < static_count;
        let node = TransformNode::new(
            format!("node{i}"),
            Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
            is_static,
        );
        tlas.add_instance_auto(&MeshInstance::new(node.clone(), blas.instance_ref()));
        if !is_static {
            nodes.push(node);
        }
    }
    tlas.create_or_update()?;
    if tlas.is_dirty() {
        bail!("TLAS still dirty after rebuild");
    }
    println!(
        "TLAS: {} instances ({} static, {} animated), {} metadata records, address {:#x}",
        tlas.instance_count(),
        static_count,
        animated_count,
        tlas.geometry_meta_buffer().record_count(),
        tlas.device_address()
    );

    for frame in 0..frames {
        let angle = frame as f32 * 0.1;
        for node in &nodes {
            let t = node.global().w_axis.truncate();
            node.set_global(Mat4::from_rotation_translation(Quat::from_rotation_y(angle), t));
        }
        let mut cmd = CommandBuffer::new(format!("frame {frame}"));
        tlas.update_lean(&mut cmd, frame)?;
        tracing::debug!(frame, commands = cmd.len(), "frame recorded");
        ctx.submit(cmd)?;
    }

    let stats = device.stats();
    println!();
    println!("Device stats after {frames} frames:");
    println!("  submissions  {:>8}  (waits {})", stats.submissions, stats.waits);
    println!("  builds       {:>8}", stats.builds);
    println!("  refits       {:>8}", stats.updates);
    println!("  barriers     {:>8}", stats.barriers);
    println!("  copies       {:>8}  ({} regions, {} bytes)", stats.copies, stats.copy_regions, stats.bytes_copied);
    println!("  live         {:>8}  ({} bytes)", device.live_count(), device.allocated_bytes());

    tlas.destroy();
    blas.destroy();
    drop(store);
    let leaks = device.dump_live();
    if !leaks.is_empty() {
        bail!("{} resources leaked", leaks.len());
    }
    Ok(())
}
