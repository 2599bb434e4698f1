// ============================================================================
// Autor      : Marcus Schlieper (ExpChat.ai)
// Erstellt   : 14.02.2026
// Datei      : main.rs – Einstiegspunkt der Anwendung
// Historie   : 14.02.2026  MS  Erste Version: Training + Sampling per CLI
//              21.02.2026  MS  Checkpoint-Restore (--load), Vokabular-Check
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

use smiles_lm::{
    fit, sample_sequence, Config, Corpus, LstmModel, ModelSize, SequenceModel, I_MAX_SAMPLE_LEN,
    S_START,
};

// ---------------------------------------------------------------------------
// Laufzeit-Argumente
// ---------------------------------------------------------------------------

/// Explizite Konfiguration des Laufs; es gibt keinen globalen Flag-Zustand.
struct RunArgs {
    size: ModelSize,
    p_data: PathBuf,
    s_load: Option<String>,
    i_samples: usize,
}

fn print_usage() {
    eprintln!("Aufruf: smiles-lm --data_path <VERZEICHNIS> [--model small|medium|large|normal] [--load <CKPT>] [--samples <N>]");
}

fn parse_args() -> Result<RunArgs> {
    let mut size = ModelSize::Small;
    let mut p_data: Option<PathBuf> = None;
    let mut s_load: Option<String> = None;
    let mut i_samples: usize = 0;

    let mut it = env::args().skip(1);
    while let Some(s_arg) = it.next() {
        match s_arg.as_str() {
            "--model" => {
                let s_val = it.next().context("--model erwartet einen Wert")?;
                size = s_val.parse()?;
            }
            "--data_path" => {
                let s_val = it.next().context("--data_path erwartet einen Wert")?;
                p_data = Some(PathBuf::from(s_val));
            }
            "--load" => {
                s_load = Some(it.next().context("--load erwartet einen Pfad")?);
            }
            "--samples" => {
                let s_val = it.next().context("--samples erwartet eine Zahl")?;
                i_samples = s_val
                    .parse()
                    .with_context(|| format!("--samples: '{}' ist keine Zahl", s_val))?;
            }
            _ => {
                print_usage();
                bail!("unbekanntes Argument '{}'", s_arg);
            }
        }
    }

    let Some(p_data) = p_data else {
        print_usage();
        bail!("--data_path muss auf das Datenverzeichnis zeigen");
    };

    Ok(RunArgs { size, p_data, s_load, i_samples })
}

// ---------------------------------------------------------------------------
// Programmlauf
// ---------------------------------------------------------------------------

fn run() -> Result<()> {
    let args = parse_args()?;

    println!("Initialisierung laeuft ...");
    let corpus = Corpus::load(&args.p_data)?;

    let config = Config::preset(args.size);
    if corpus.vocab.len() > config.i_vocab_size {
        bail!(
            "Korpus-Vokabular ({} Tokens) uebersteigt vocab_size={} des Presets '{}'",
            corpus.vocab.len(),
            config.i_vocab_size,
            args.size
        );
    }

    let mut model = LstmModel::new(&config);

    if let Some(s_ckpt) = &args.s_load {
        println!("loading model ...");
        model.load_checkpoint(s_ckpt)?;
        println!("model loaded.");
    }

    println!("=== MODELL-INFO ===");
    println!(
        "Konfiguration        : model={}, num_layers={}, hidden_size={}, batch_size={}, num_steps={}",
        args.size, config.i_num_layers, config.i_hidden_size, config.i_batch_size, config.i_num_steps
    );
    println!(
        "Korpus               : train={} valid={} test={} (Vokabular: {})",
        corpus.v_train.len(),
        corpus.v_valid.len(),
        corpus.v_test.len(),
        corpus.vocab.len()
    );
    println!("Gesamtparameter      : {}", model.total_parameters());

    fit(&mut model, &corpus, &config)?;

    if args.i_samples > 0 {
        let i_seed = corpus
            .vocab
            .token_id(S_START)
            .with_context(|| format!("Startmarker '{}' nicht im Vokabular", S_START))?;
        model.set_training(false);
        println!("=== SAMPLING ({} Sequenzen) ===", args.i_samples);
        for _ in 0..args.i_samples {
            let s_smile = sample_sequence(&mut model, i_seed, &corpus.vocab, "", I_MAX_SAMPLE_LEN)?;
            println!("{s_smile}");
        }
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Fehler: {e:#}");
        std::process::exit(1);
    }
}
