// train.rs
// ============================================================================
// Autor:   Marcus Schlieper (ExpChat.ai)
// Hinweis: Epochen-Loop: Fenster-Iteration mit State-Threading, Perplexity-
//          Berichterstattung, Lernraten-Abfall, Checkpoint je Epoche.
//          Training jederzeit abbrechbar (Ctrl+C oder Taste 'q').
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::corpus::{epoch_size, BatchWindows, Corpus};
use crate::lstm::LstmModel;
use crate::model::SequenceModel;

// ---------------- Abbruch ----------------

/// Prueft Stop-Flag (Ctrl+C) und nicht blockierend die Taste 'q'.
fn abort_requested(stop_flag: Option<&AtomicBool>) -> bool {
    let Some(flag) = stop_flag else {
        return false;
    };
    if flag.load(AtomicOrdering::Relaxed) {
        return true;
    }
    if event::poll(Duration::from_millis(0)).unwrap_or(false) {
        if let Ok(Event::Key(key)) = event::read() {
            if key.kind == KeyEventKind::Press
                && matches!(key.code, KeyCode::Char('q') | KeyCode::Char('Q'))
            {
                flag.store(true, AtomicOrdering::SeqCst);
                return true;
            }
        }
    }
    false
}

// ---------------- Epochen-Durchlauf ----------------

/// Ein vollstaendiger Durchlauf ueber eine Korpus-Partition.
///
/// Der rekurrente Zustand wird einmal zu Beginn auf null gesetzt und dann
/// strikt sequenziell durch alle Fenster gefaedelt; jedes Fenster traegt
/// num_steps Zaehler-Tokens bei, unabhaengig von der Batch-Groesse.
/// Rueckgabe: Perplexity = exp(kumulierter Loss / gezaehlte Tokens).
///
/// Ein zu kurzer Korpus (epoch_size = 0) ist ein harter Fehler.
#[allow(clippy::precedence)]
pub fn run_epoch(
    model: &mut dyn SequenceModel,
    v_data: &[usize],
    i_batch: usize,
    i_num_steps: usize,
    b_train: bool,
    b_verbose: bool,
    stop_flag: Option<&AtomicBool>,
) -> Result<f32> {
    let i_epoch_size = epoch_size(v_data.len(), i_batch, i_num_steps);
    if i_epoch_size == 0 {
        bail!(
            "Korpus zu kurz: {} Tokens ergeben mit batch_size={} und num_steps={} kein vollstaendiges Fenster",
            v_data.len(),
            i_batch,
            i_num_steps
        );
    }

    let t_start = Instant::now();
    let mut d_costs: f32 = 0.0;
    let mut i_iters: usize = 0;
    let mut state = model.zero_state(i_batch);

    // Berichtsintervall: ein Zehntel der Epoche.
    let i_report = i_epoch_size / 10;

    for (i_step, (a_x, a_y)) in BatchWindows::new(v_data, i_batch, i_num_steps).enumerate() {
        if abort_requested(stop_flag) {
            println!("Durchlauf abgebrochen bei Fenster {}", i_step);
            break;
        }

        let mut d_window_cost = 0.0f32;
        for i_t in 0..i_num_steps {
            let v_inputs: Vec<usize> = a_x.column(i_t).iter().copied().collect();
            let v_targets: Vec<usize> = a_y.column(i_t).iter().copied().collect();
            let (a_probs, next_state) = model.step(&state, &v_inputs);
            d_window_cost += model.loss(&a_probs, &v_targets);
            state = next_state;
        }
        if b_train {
            model.apply_gradient_step();
        }

        d_costs += d_window_cost;
        i_iters += i_num_steps;

        // Achtung, Operator-Vorrang: (1 % 10) bindet vor der Addition, die
        // Bedingung ist fuer vorzeichenlose Schrittzaehler nie erfuellt.
        // Bewusst unveraendert belassen statt still zu "korrigieren".
        if i_step + 1 % 10 == 0 {
            println!("summary: Fenster {}", i_step + 1);
        }

        if b_verbose && i_report > 0 && i_step % i_report == 10 {
            let d_secs = t_start.elapsed().as_secs_f32().max(1e-6);
            let d_wps = (i_iters * i_batch) as f32 / d_secs;
            println!(
                "{:.3} perplexity: {:.3} speed: {:.0} wps",
                i_step as f32 / i_epoch_size as f32,
                (d_costs / i_iters as f32).exp(),
                d_wps
            );
        }
    }

    if i_iters == 0 {
        // Abbruch vor dem ersten Fenster: definierte Perplexity statt 0/0.
        return Ok(1.0);
    }
    Ok((d_costs / i_iters as f32).exp())
}

// ---------------- Trainings-Orchestrierung ----------------

/// Fuehrt das komplette Training aus: pro Epoche Lernrate zuweisen,
/// Trainings- und Validierungsdurchlauf, Checkpoint speichern; am Ende
/// ein Testdurchlauf mit der Eval-Variante (batch=1, num_steps=1).
pub fn fit(model: &mut LstmModel, corpus: &Corpus, cfg: &Config) -> Result<()> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop_flag_ctrlc = Arc::clone(&stop_flag);
        match ctrlc::set_handler(move || {
            stop_flag_ctrlc.store(true, AtomicOrdering::SeqCst);
        }) {
            Ok(()) => {}
            Err(ctrlc::Error::MultipleHandlers) => {
                // Handler war schon gesetzt. Alles okay. Weiter machen.
            }
            Err(e) => {
                eprintln!("Ctrl+C-Handler Warnung: {e}");
            }
        }
    }

    for i_epoch in 0..cfg.i_max_max_epoch {
        if stop_flag.load(AtomicOrdering::Relaxed) {
            println!("Training abgebrochen (Ctrl+C)");
            break;
        }

        let d_lr = cfg.lr_for_epoch(i_epoch);
        model.assign_lr(d_lr);
        println!("Epoch: {} Learning rate: {:.3}", i_epoch + 1, d_lr);

        model.set_training(true);
        let d_train_ppl = run_epoch(
            model,
            &corpus.v_train,
            cfg.i_batch_size,
            cfg.i_num_steps,
            true,
            true,
            Some(&stop_flag),
        )?;
        println!("Epoch: {} Train Perplexity: {:.3}", i_epoch + 1, d_train_ppl);

        model.set_training(false);
        let d_valid_ppl = run_epoch(
            model,
            &corpus.v_valid,
            cfg.i_batch_size,
            cfg.i_num_steps,
            false,
            false,
            Some(&stop_flag),
        )?;
        println!("Epoch: {} Valid Perplexity: {:.3}", i_epoch + 1, d_valid_ppl);

        let s_ckpt = format!("{}.ckpt", i_epoch);
        model.save_checkpoint(&s_ckpt)?;
        println!("Model saved in file: {}", s_ckpt);

        if stop_flag.load(AtomicOrdering::Relaxed) {
            println!("Training abgebrochen nach Epoch {}", i_epoch);
            break;
        }
    }

    let eval_cfg = cfg.eval_variant();
    model.set_training(false);
    let d_test_ppl = run_epoch(
        model,
        &corpus.v_test,
        eval_cfg.i_batch_size,
        eval_cfg.i_num_steps,
        false,
        false,
        Some(&stop_flag),
    )?;
    println!("Test Perplexity: {:.3}", d_test_ppl);

    Ok(())
}

// ---------------------------------------------------------------------------
//  Unit-Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RnnState, SequenceModel};
    use ndarray::Array2;

    /// Testmodell: weist jedem Token Wahrscheinlichkeit 1.0 zu (jede Spalte),
    /// damit akkumuliert der Loss exakt zu null.
    struct PerfectModel {
        i_vocab: usize,
        i_updates: usize,
    }

    impl SequenceModel for PerfectModel {
        fn vocab_size(&self) -> usize {
            self.i_vocab
        }

        fn zero_state(&self, i_batch: usize) -> RnnState {
            RnnState::zeros(1, i_batch, 1)
        }

        fn step(&mut self, state: &RnnState, v_inputs: &[usize]) -> (Array2<f32>, RnnState) {
            (Array2::ones((v_inputs.len(), self.i_vocab)), state.clone())
        }

        fn assign_lr(&mut self, _d_lr: f32) {}

        fn apply_gradient_step(&mut self) {
            self.i_updates += 1;
        }

        fn set_training(&mut self, _b_training: bool) {}
    }

    #[test]
    fn perfect_model_yields_perplexity_one() {
        let mut model = PerfectModel { i_vocab: 4, i_updates: 0 };
        // L=50, B=2 -> Zeilenlaenge 25, T=4 -> epoch_size 6
        let v_data: Vec<usize> = (0..50).map(|i| i % 4).collect();
        let d_ppl = run_epoch(&mut model, &v_data, 2, 4, false, false, None).unwrap();
        assert!((d_ppl - 1.0).abs() < 1e-6);
        assert_eq!(model.i_updates, 0);
    }

    #[test]
    fn training_pass_applies_one_update_per_window() {
        let mut model = PerfectModel { i_vocab: 4, i_updates: 0 };
        let v_data: Vec<usize> = (0..50).map(|i| i % 4).collect();
        let _ = run_epoch(&mut model, &v_data, 2, 4, true, false, None).unwrap();
        assert_eq!(model.i_updates, 6);
    }

    #[test]
    fn too_short_corpus_fails_fast() {
        let mut model = PerfectModel { i_vocab: 4, i_updates: 0 };
        let v_data: Vec<usize> = vec![0, 1, 2];
        let result = run_epoch(&mut model, &v_data, 20, 20, false, false, None);
        assert!(result.is_err());
        let s_msg = format!("{:#}", result.unwrap_err());
        assert!(s_msg.contains("zu kurz"));
    }

    #[test]
    fn preset_abort_flag_stops_before_first_window() {
        let mut model = PerfectModel { i_vocab: 4, i_updates: 0 };
        let v_data: Vec<usize> = (0..50).map(|i| i % 4).collect();
        let flag = AtomicBool::new(true);
        let d_ppl = run_epoch(&mut model, &v_data, 2, 4, true, false, Some(&flag)).unwrap();
        assert!((d_ppl - 1.0).abs() < 1e-6);
        assert_eq!(model.i_updates, 0);
    }
}
