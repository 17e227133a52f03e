/// Preview: fabricates a short chain from a content library and prints it.
///
/// Usage: preview --library <library.ron> [--config <config.ron>]
///                [--segments <n>] [--seed <n>] [--chain <name>] [--picks]
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use segment_craft::core::pipeline::SegmentEngine;
use segment_craft::core::store::{InMemorySegmentStore, StaticContent};
use segment_craft::schema::content::SourceMaterial;
use segment_craft::schema::segment::{Chain, ChainId, SegmentGraph};

fn print_usage() {
    println!("Usage: preview --library <library.ron> [options]");
    println!();
    println!("Options:");
    println!("  --library <file>   Content library (RON)");
    println!("  --config <file>    Fabrication config (RON); defaults apply when omitted");
    println!("  --segments <n>     Number of segments to fabricate (default 4)");
    println!("  --seed <n>         Entropy seed (default 42)");
    println!("  --chain <name>     Chain name shown in the report (default \"preview\")");
    println!("  --picks            Print every pick, not just a per-arrangement summary");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut library = None;
    let mut config = None;
    let mut segments: usize = 4;
    let mut seed: u64 = 42;
    let mut chain_name = "preview".to_string();
    let mut show_picks = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--library" if i + 1 < args.len() => {
                i += 1;
                library = Some(args[i].clone());
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                config = Some(args[i].clone());
            }
            "--segments" if i + 1 < args.len() => {
                i += 1;
                segments = args[i]
                    .parse()
                    .with_context(|| format!("invalid --segments value '{}'", args[i]))?;
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i]
                    .parse()
                    .with_context(|| format!("invalid --seed value '{}'", args[i]))?;
            }
            "--chain" if i + 1 < args.len() => {
                i += 1;
                chain_name = args[i].clone();
            }
            "--picks" => show_picks = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let Some(library) = library else {
        print_usage();
        bail!("--library is required");
    };

    init_tracing();

    let source = SourceMaterial::load_from_ron(Path::new(&library))
        .with_context(|| format!("failed to load library {}", library))?;
    println!(
        "Loaded scope '{}': {} programs, {} instruments",
        source.scope,
        source.programs.len(),
        source.instruments.len()
    );

    let mut builder = SegmentEngine::builder().seed(seed);
    if let Some(ref path) = config {
        builder = builder.config_file(path);
    }
    let engine = builder.build()?;

    let chain_id = ChainId(1);
    let mut store = InMemorySegmentStore::new();
    store.add_chain(Chain::new(chain_id, &chain_name));
    let content = StaticContent(Arc::new(source));

    for n in 0..segments {
        match engine.fabricate_next(&content, &mut store, chain_id) {
            Ok(report) => {
                print_graph(&report.graph, &content.0, show_picks);
                for missing in &report.diagnostics {
                    println!("    missing: {}", missing);
                }
            }
            Err(e) => {
                // A failed segment blocks planning of the next one
                eprintln!("segment #{} failed: {}", n, e);
                eprintln!("chain '{}' stopped after {} segments", chain_name, n);
                std::process::exit(1);
            }
        }
    }

    println!("\n{} segments fabricated on chain '{}'", segments, chain_name);
    Ok(())
}

fn print_graph(graph: &SegmentGraph, source: &SourceMaterial, show_picks: bool) {
    let seg = &graph.segment;
    println!("\n=== Segment #{} ({:?}) ===", seg.offset, seg.segment_type);
    println!(
        "  {:.2}s..{:.2}s  key {}  {} beats (delta {})  {:.1} bpm  density {:.2}",
        seg.begin_at,
        seg.end_at.unwrap_or(seg.begin_at),
        seg.key.as_deref().unwrap_or("-"),
        seg.total,
        seg.delta,
        seg.tempo,
        seg.density
    );
    println!("  memes: {}", graph.meme_names().join(", "));

    let chords: Vec<String> = graph
        .chords
        .iter()
        .map(|c| format!("{}@{}", c.name, c.position))
        .collect();
    if !chords.is_empty() {
        println!("  chords: {}", chords.join(" "));
    }

    for choice in &graph.choices {
        let name = source
            .program(choice.program_id)
            .map(|p| p.name.as_str())
            .unwrap_or("?");
        let window = match (choice.delta_in, choice.delta_out) {
            (None, None) => String::new(),
            (i, o) => format!(
                ", beats {}..{}",
                i.map(|d| d.to_string()).unwrap_or_default(),
                o.map(|d| d.to_string()).unwrap_or_default()
            ),
        };
        println!(
            "  {:?}: {} (transpose {:+}{}{})",
            choice.program_type,
            name,
            choice.transpose,
            choice
                .instrument_type
                .map(|t| format!(", {:?}", t))
                .unwrap_or_default(),
            window
        );
        for arrangement in graph.arrangements.iter().filter(|a| a.choice_id == choice.id) {
            let instrument = source
                .instrument(arrangement.instrument_id)
                .map(|i| i.name.as_str())
                .unwrap_or("?");
            let picks: Vec<_> = graph.picks_of(arrangement.id).collect();
            println!("    {} -> {} picks", instrument, picks.len());
            if show_picks {
                for pick in picks {
                    println!(
                        "      {:>7.3}s +{:.3}s  {:<8} {:<4} amp {:.2}{}",
                        pick.start,
                        pick.length,
                        pick.track,
                        pick.tones,
                        pick.amplitude,
                        pick.pitch_hz
                            .map(|hz| format!("  {:.1} Hz", hz))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }
}
