// sampler.rs
// ============================================================================
// Autor:   Marcus Schlieper (ExpChat.ai)
// Hinweis: Stochastische Sequenz-Generierung: ausgehend von einem Seed-Token
//          autoregressiv im Einzelschritt-Modus (batch=1, num_steps=1)
//          Tokens aus der Ausgabeverteilung ziehen, bis der EOS-Marker
//          faellt oder die Laengenkappe greift. Kategoriales Sampling,
//          niemals Greedy-Argmax, damit die Vielfalt erhalten bleibt.
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;

use crate::corpus::{Vocab, S_EOS};
use crate::model::SequenceModel;

/// Standard-Laengenkappe pro generierter Sequenz.
pub const I_MAX_SAMPLE_LEN: usize = 500;

/// Generiert eine Sequenz ab `i_seed` und liefert die mit `s_separator`
/// verbundene Zeichenkette.
///
/// Hinweis: das erste Zeichen des Ergebnisses wird verworfen. Das
/// kompensiert das fuehrende Trennzeichen-Artefakt des Seed-Tokens und
/// bleibt absichtlich erhalten (zur Pruefung markiert, siehe DESIGN.md).
pub fn sample_sequence(
    model: &mut dyn SequenceModel,
    i_seed: usize,
    vocab: &Vocab,
    s_separator: &str,
    i_max_len: usize,
) -> Result<String> {
    let mut rng = rand::rng();
    let mut state = model.zero_state(1);
    let mut v_parts: Vec<String> = Vec::new();

    let mut i_element = i_seed;
    let mut i_count = 0usize;

    loop {
        let s_word = vocab
            .decode_id(i_element)
            .with_context(|| format!("Token-ID {} nicht im Vokabular", i_element))?;
        if s_word == S_EOS || i_count >= i_max_len {
            break;
        }
        v_parts.push(s_word.to_string());

        let (a_probs, next_state) = model.step(&state, &[i_element]);
        state = next_state;

        let mut v_weights: Vec<f32> = a_probs.row(0).to_vec();
        let d_sum: f32 = v_weights.iter().sum();
        if d_sum > 1.0 {
            for d_w in &mut v_weights {
                *d_w /= d_sum;
            }
        }

        let dist = WeightedIndex::new(&v_weights)
            .context("Ausgabeverteilung ist kein gueltiges Kategorial-Gewicht")?;
        i_element = dist.sample(&mut rng);
        i_count += 1;
    }

    let s_joined = v_parts.join(s_separator);
    // erste Stelle abschneiden (siehe Funktionskommentar)
    Ok(s_joined.chars().skip(1).collect())
}
