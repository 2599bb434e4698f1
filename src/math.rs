// math.rs
// ============================================================================
// Autor:   Marcus Schlieper (ExpChat.ai)
// Hinweis: Numerik-Helfer: Softmax (seriell und parallel), CE-Loss,
//          Logit-Gradienten, Dropout-Masken, Sigmoid.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{Array2, Axis};
use rand::Rng;
use rayon::prelude::*;

// ---------------- Softmax ----------------

/// Numerisch stabile Soft-max-Funktion (zeilenweise).
pub fn softmax(a_logits: &Array2<f32>) -> Array2<f32> {
    let mut a_result = a_logits.clone();
    for mut row in a_result.rows_mut() {
        let d_max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let v_exp: Vec<f32> = row.iter().map(|&x| (x - d_max).exp()).collect();
        let d_sum: f32 = v_exp.iter().sum();
        for (i_idx, &d_val) in v_exp.iter().enumerate() {
            row[i_idx] = d_val / d_sum;
        }
    }
    a_result
}

/// Parallele Variante fuer groessere Batches (eine Zeile pro Batch-Element).
pub fn softmax_rows_par(m: &Array2<f32>) -> Array2<f32> {
    let mut out = m.clone();
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max_v = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max_v).exp();
                sum += *v;
            }
            if sum > 0.0 {
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
        });
    out
}

// ---------------- CE-Loss und Logit-Gradienten ----------------

/// Kreuzentropie fuer einen Zeitschritt: Mittel ueber die Batch-Zeilen
/// von -ln p(target), nach unten auf 1e-15 begrenzt.
pub fn cross_entropy_loss_step(a_probs: &Array2<f32>, v_target: &[usize]) -> f32 {
    let mut d_loss = 0.0;
    for (i_row, &i_tgt) in v_target.iter().enumerate() {
        let d_p = a_probs[(i_row, i_tgt)].max(1e-15);
        d_loss -= d_p.ln();
    }
    d_loss / v_target.len() as f32
}

/// Ableitung der Kreuzentropie nach den Logits (Soft-max integriert):
/// (p - onehot) / batch.
pub fn compute_gradients_step(a_probs: &Array2<f32>, v_target: &[usize]) -> Array2<f32> {
    let mut a_grad = a_probs.clone();
    for (i_row, &i_tgt) in v_target.iter().enumerate() {
        a_grad[(i_row, i_tgt)] -= 1.0;
    }
    let d_batch = v_target.len() as f32;
    a_grad.mapv(|x| x / d_batch)
}

// ---------------- Dropout ----------------

/// Erzeugt eine Dropout-Maske mit invertierter Skalierung: Eintraege sind
/// 1/keep_prob (behalten) oder 0 (verworfen). Die Maske wird im Backward-Pass
/// erneut multipliziert, daher bewahrt der Aufrufer sie auf.
pub fn dropout_mask(i_rows: usize, i_cols: usize, d_keep_prob: f32) -> Array2<f32> {
    let d_keep = d_keep_prob.clamp(0.0, 1.0);
    if d_keep >= 1.0 {
        return Array2::ones((i_rows, i_cols));
    }
    let d_scale = if d_keep > 0.0 { 1.0 / d_keep } else { 0.0 };
    let mut rng = rand::rng();
    Array2::from_shape_fn((i_rows, i_cols), |_| {
        if rng.random::<f32>() < d_keep { d_scale } else { 0.0 }
    })
}

// ---------------- Aktivierungen ----------------

pub fn sigmoid(d_x: f32) -> f32 {
    1.0 / (1.0 + (-d_x).exp())
}
