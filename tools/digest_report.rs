/// Digest Report: prints the chord Markov digest of a content library and
/// samples a few progressions from it.
///
/// Usage: digest_report <library.ron> [--order <n>] [--walks <n>] [--length <n>]
///                      [--seed <n>] [--key <key>] [--reverse]
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use segment_craft::core::digest::{ChordMarkovDigest, ChordMarkovNode, ChordNode};
use segment_craft::core::music::Key;
use segment_craft::schema::content::SourceMaterial;

const USAGE: &str = "Usage: digest_report <library.ron> [--order <n>] [--walks <n>] \
                     [--length <n>] [--seed <n>] [--key <key>] [--reverse]";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("{}", USAGE);
        process::exit(0);
    }

    let library_path = &args[1];
    let mut order = 2usize;
    let mut walks = 3usize;
    let mut length = 8usize;
    let mut seed: u64 = 42;
    let mut key_name = "C".to_string();
    let mut show_reverse = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--order" if i + 1 < args.len() => {
                i += 1;
                order = parse_arg(&args[i], "--order")?;
            }
            "--walks" if i + 1 < args.len() => {
                i += 1;
                walks = parse_arg(&args[i], "--walks")?;
            }
            "--length" if i + 1 < args.len() => {
                i += 1;
                length = parse_arg(&args[i], "--length")?;
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = parse_arg(&args[i], "--seed")?;
            }
            "--key" if i + 1 < args.len() => {
                i += 1;
                key_name = args[i].clone();
            }
            "--reverse" => show_reverse = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("{}", USAGE);
                process::exit(1);
            }
        }
        i += 1;
    }

    // Debug logging shows sequences skipped for unparseable keys
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    let key: Key = key_name
        .parse()
        .with_context(|| format!("invalid --key '{}'", key_name))?;
    let source = SourceMaterial::load_from_ron(Path::new(library_path))
        .with_context(|| format!("failed to load library {}", library_path))?;
    let digest = ChordMarkovDigest::compute(&source, order);

    println!(
        "Chord digest of '{}' (order {}): {} forward states, {} reverse states",
        source.scope,
        digest.order(),
        digest.forward().len(),
        digest.reverse().len()
    );

    println!("\n=== Forward ===\n");
    print_nodes(digest.forward().values(), &key);
    if show_reverse {
        println!("\n=== Reverse ===\n");
        print_nodes(digest.reverse().values(), &key);
    }

    println!("\n=== Sequence affinity ===\n");
    for program in &source.programs {
        for sequence in program.sequences.iter().filter(|s| !s.chords.is_empty()) {
            let Ok(seq_key) = sequence.key_or(program).parse::<Key>() else {
                println!("{:<24} (unparseable key)", sequence.name);
                continue;
            };
            let chords = sequence.sorted_chords();
            let nodes = ChordNode::progression(chords.iter().map(|c| c.name.as_str()), &seq_key);
            println!(
                "{:<24} {:.3}  {}",
                format!("{}/{}", program.name, sequence.name),
                digest.progression_affinity(&nodes),
                chords
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }
    }

    println!("\n=== Sample walks in {} ===\n", key);
    let mut rng = StdRng::seed_from_u64(seed);
    for n in 0..walks {
        let walk = digest.walk(&mut rng, length);
        let names: Vec<String> = walk.iter().map(|node| render(node, &key)).collect();
        println!(
            "#{}: {} (affinity {:.3})",
            n + 1,
            if names.is_empty() {
                "(empty)".to_string()
            } else {
                names.join(" ")
            },
            digest.progression_affinity(&walk)
        );
    }

    Ok(())
}

fn parse_arg<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid {} value '{}'", flag, value))
}

fn print_nodes<'a>(nodes: impl Iterator<Item = &'a ChordMarkovNode>, key: &Key) {
    let mut nodes: Vec<&ChordMarkovNode> = nodes.collect();
    nodes.sort_by(|a, b| a.precedent.cmp(&b.precedent));
    for node in nodes {
        let precedent: Vec<String> = node.precedent.iter().map(|n| render(n, key)).collect();
        let total = node.total().max(1) as f64;
        let next: Vec<String> = node
            .observations
            .iter()
            .map(|(n, count)| format!("{} {:.0}%", render(n, key), 100.0 * *count as f64 / total))
            .collect();
        println!("{:<24} -> {}", precedent.join(" "), next.join(", "));
    }
}

/// Spell a key-relative node as a chord name in `key`.
fn render(node: &ChordNode, key: &Key) -> String {
    match node {
        ChordNode::Bookend => "|".to_string(),
        ChordNode::Chord { delta, form } => {
            let root = key.root.transpose(*delta as i32).name(key.adjustment);
            match form.as_str() {
                "major" => root.to_string(),
                "minor" => format!("{}m", root),
                other => format!("{}{}", root, other),
            }
        }
    }
}
