/// Content Linter: checks a content library for material craft would trip on.
///
/// Usage: content_linter <library.ron> [--strict] [--memes]
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::process;

use segment_craft::core::digest::MemeDigest;
use segment_craft::core::music::{parse_notes, Chord, Key, Note};
use segment_craft::schema::content::{Program, ProgramType, SourceMaterial};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: content_linter <library.ron> [--strict] [--memes]");
        println!("  --strict   treat warnings as errors");
        println!("  --memes    print which programs and instruments carry each meme");
        process::exit(0);
    }

    let library_path = &args[1];
    let mut strict = false;
    let mut show_memes = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--strict" => strict = true,
            "--memes" => show_memes = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                process::exit(1);
            }
        }
        i += 1;
    }

    let source = SourceMaterial::load_from_ron(Path::new(library_path))
        .with_context(|| format!("failed to load library {}", library_path))?;
    println!(
        "Loaded scope '{}': {} programs, {} instruments",
        source.scope,
        source.programs.len(),
        source.instruments.len()
    );

    let (errors, warnings) = lint_library(&source);

    println!("\n=== Content Lint Report ===\n");

    if errors.is_empty() && warnings.is_empty() {
        println!("All checks passed!");
    }

    for warning in &warnings {
        println!("WARNING: {}", warning);
    }

    for error in &errors {
        println!("ERROR: {}", error);
    }

    println!(
        "\nSummary: {} errors, {} warnings",
        errors.len(),
        warnings.len()
    );

    if show_memes {
        print_memes(&source);
    }

    if errors.is_empty() && !(strict && !warnings.is_empty()) {
        process::exit(0);
    } else {
        process::exit(1);
    }
}

fn lint_library(source: &SourceMaterial) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if source.programs_of(ProgramType::Main).next().is_none() {
        errors.push("no Main program; every segment would fail".to_string());
    }
    if source.programs_of(ProgramType::Macro).next().is_none() {
        warnings.push("no Macro program; chains cannot progress between mains".to_string());
    }

    let mut program_ids = HashSet::new();
    for program in &source.programs {
        if !program_ids.insert(program.id) {
            errors.push(format!("duplicate program id {}", program.id));
        }
        lint_program(program, &mut errors, &mut warnings);
    }

    let mut audio_ids = HashSet::new();
    for instrument in &source.instruments {
        let name = &instrument.name;
        if instrument.memes.is_empty() {
            warnings.push(format!("instrument '{}' has no memes", name));
        }
        if instrument.audios.is_empty() {
            warnings.push(format!("instrument '{}' has no audio", name));
        }
        for audio in &instrument.audios {
            if !audio_ids.insert(audio.id) {
                errors.push(format!("duplicate audio id {} in '{}'", audio.id, name));
            }
            for event in &audio.events {
                if let Err(e) = Note::parse_tones(&event.tones) {
                    errors.push(format!(
                        "instrument '{}' audio '{}': bad tones '{}': {}",
                        name, audio.name, event.tones, e
                    ));
                }
            }
            if instrument.multiphonic && audio.first_tones().is_none() {
                warnings.push(format!(
                    "multiphonic instrument '{}' audio '{}' has no tones and can never be picked",
                    name, audio.name
                ));
            }
        }
    }

    (errors, warnings)
}

fn lint_program(program: &Program, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let name = &program.name;

    if program.memes.is_empty() && program.bindings.iter().all(|b| b.memes.is_empty()) {
        warnings.push(format!("program '{}' has no memes", name));
    }
    if let Err(e) = program.parsed_key() {
        errors.push(format!("program '{}': bad key '{}': {}", name, program.key, e));
    }
    if program.tempo <= 0.0 {
        errors.push(format!("program '{}': tempo must be positive", name));
    }
    if program.program_type.is_structural() && program.bindings.is_empty() {
        errors.push(format!("{:?} program '{}' has no bindings", program.program_type, name));
    }
    if !program.program_type.is_structural() && program.voices.is_empty() {
        warnings.push(format!("program '{}' has no voices", name));
    }

    for binding in &program.bindings {
        if program.sequence(binding.sequence_id).is_none() {
            errors.push(format!(
                "program '{}': binding {} references missing sequence {}",
                name, binding.id, binding.sequence_id
            ));
        }
    }

    for sequence in &program.sequences {
        let key = sequence.key_or(program);
        if let Err(e) = key.parse::<Key>() {
            errors.push(format!(
                "program '{}' sequence '{}': bad key '{}': {}",
                name, sequence.name, key, e
            ));
        }
        if program.program_type == ProgramType::Main && sequence.total == 0 {
            errors.push(format!(
                "main program '{}' sequence '{}' has zero length",
                name, sequence.name
            ));
        }

        for chord in &sequence.chords {
            if let Err(e) = chord.name.parse::<Chord>() {
                errors.push(format!(
                    "program '{}' sequence '{}': bad chord '{}': {}",
                    name, sequence.name, chord.name, e
                ));
            }
            if sequence.total > 0 && chord.position >= sequence.total as f64 {
                warnings.push(format!(
                    "program '{}' sequence '{}': chord '{}' at {} lies past the end",
                    name, sequence.name, chord.name, chord.position
                ));
            }
            for voicing in &chord.voicings {
                if let Err(e) = parse_notes(&voicing.notes) {
                    errors.push(format!(
                        "program '{}' chord '{}': bad {:?} voicing '{}': {}",
                        name, chord.name, voicing.instrument_type, voicing.notes, e
                    ));
                }
            }
        }

        for pattern in &sequence.patterns {
            let Some(voice) = program.voice(pattern.voice_id) else {
                errors.push(format!(
                    "program '{}' pattern {} references missing voice {}",
                    name, pattern.id, pattern.voice_id
                ));
                continue;
            };
            if pattern.total == 0 {
                errors.push(format!(
                    "program '{}' pattern {} ({:?}) has zero length",
                    name, pattern.id, pattern.pattern_type
                ));
            }
            for event in &pattern.events {
                if voice.track(event.track_id).is_none() {
                    errors.push(format!(
                        "program '{}' pattern {}: event {} references missing track {}",
                        name, pattern.id, event.id, event.track_id
                    ));
                }
                if let Err(e) = Note::parse_tones(&event.tones) {
                    errors.push(format!(
                        "program '{}' pattern {}: bad tones '{}': {}",
                        name, pattern.id, event.tones, e
                    ));
                }
            }
        }
    }
}

fn print_memes(source: &SourceMaterial) {
    let digest = MemeDigest::compute(source);
    println!("\n=== Memes ===\n");
    for meme in digest.memes() {
        let programs: Vec<String> = digest
            .programs_with(meme)
            .into_iter()
            .filter_map(|id| source.program(id))
            .map(|p| p.name.clone())
            .collect();
        let instruments: Vec<String> = digest
            .instruments_with(meme)
            .into_iter()
            .filter_map(|id| source.instrument(id))
            .map(|i| i.name.clone())
            .collect();
        println!(
            "{:<16} programs [{}]  instruments [{}]",
            meme,
            programs.join(", "),
            instruments.join(", ")
        );
    }
}
