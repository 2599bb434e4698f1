// model.rs
// ============================================================================
// Autor:   Marcus Schlieper (ExpChat.ai)
// Hinweis: Vertrag des Sequenzmodells. Trainings-Loop und Sampler kennen
//          nur dieses Trait; die Zustandsfortschreibung (State-Threading)
//          laeuft ausschliesslich ueber step(). Der Zustand selbst ist fuer
//          Aufrufer opak.
// ============================================================================

#![forbid(unsafe_code)]

use bincode::{Decode, Encode};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::math::cross_entropy_loss_step;

// ---------------- Rekurrenter Zustand ----------------

/// Zellzustand und Hidden-Zustand einer Schicht, je [batch, hidden].
#[derive(Clone, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct LayerState {
    #[bincode(with_serde)]
    pub(crate) a_c: Array2<f32>,
    #[bincode(with_serde)]
    pub(crate) a_h: Array2<f32>,
}

/// Der durch die Fenster einer Epoche gefaedelte Gesamtzustand,
/// eine Ebene pro Schicht. Wird zu Beginn jedes Durchlaufs auf null
/// zurueckgesetzt (zero_state).
#[derive(Clone, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct RnnState {
    pub(crate) v_layers: Vec<LayerState>,
}

impl RnnState {
    pub fn zeros(i_layers: usize, i_batch: usize, i_hidden: usize) -> Self {
        let v_layers = (0..i_layers)
            .map(|_| LayerState {
                a_c: Array2::zeros((i_batch, i_hidden)),
                a_h: Array2::zeros((i_batch, i_hidden)),
            })
            .collect();
        RnnState { v_layers }
    }

    pub fn batch_size(&self) -> usize {
        self.v_layers.first().map(|l| l.a_c.nrows()).unwrap_or(0)
    }
}

// ---------------- Modell-Vertrag ----------------

/// Schnittstelle, die Trainings-Loop und Sampler vom Modell verlangen.
///
/// step() nimmt den aktuellen Zustand und einen Batch von Token-IDs
/// (ein Zeitschritt) und liefert die Ausgabeverteilung [batch, vocab]
/// sowie den Folgezustand. Jeder Schritt haengt vom Vorgaenger ab, die
/// Reihenfolge ist daher strikt sequenziell.
pub trait SequenceModel {
    fn vocab_size(&self) -> usize;

    /// Nullinitialisierter Zustand fuer die gegebene Batch-Groesse.
    fn zero_state(&self, i_batch: usize) -> RnnState;

    /// Ein Zeitschritt: Eingabe-Tokens -> (Verteilung, neuer Zustand).
    fn step(&mut self, state: &RnnState, v_inputs: &[usize]) -> (Array2<f32>, RnnState);

    /// Kreuzentropie des Zeitschritts, gemittelt ueber den Batch.
    /// Nur Trainingslaeufe muessen daraus Gradienten ableiten.
    fn loss(&mut self, a_probs: &Array2<f32>, v_targets: &[usize]) -> f32 {
        cross_entropy_loss_step(a_probs, v_targets)
    }

    /// Setzt die Lernrate fuer nachfolgende Parameter-Updates.
    fn assign_lr(&mut self, d_lr: f32);

    /// Wendet den aufgelaufenen Fenster-Gradienten an (Norm-begrenzt).
    fn apply_gradient_step(&mut self);

    /// Schaltet Trainingsmodus (Dropout, Gradienten-Aufzeichnung) um.
    fn set_training(&mut self, b_training: bool);
}

// ---------------------------------------------------------------------------
//  Unit-Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_state_has_requested_shape() {
        let state = RnnState::zeros(2, 4, 8);
        assert_eq!(state.v_layers.len(), 2);
        assert_eq!(state.batch_size(), 4);
        assert_eq!(state.v_layers[0].a_h.dim(), (4, 8));
        assert!(state.v_layers.iter().all(|l| l.a_c.iter().all(|&v| v == 0.0)));
    }
}
