// config.rs
// ============================================================================
// Autor:   Marcus Schlieper (ExpChat.ai)
// Hinweis: Hyperparameter-Presets (small/medium/large/normal) als
//          geschlossene Enumeration plus Konfigurations-Record.
//          Keine globalen Flags: die Config wird explizit durchgereicht.
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::bail;
use std::fmt;
use std::str::FromStr;

// ---------------- Modellgroesse ----------------

/// Geschlossene Auswahl der Preset-Namen. Unbekannte Namen sind ein harter
/// Fehler, es wird nie still auf einen Default zurueckgefallen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelSize {
    Small,
    Medium,
    Large,
    Normal,
}

impl FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            "normal" => Ok(ModelSize::Normal),
            _ => bail!(
                "unbekannte Modellgroesse '{}' (erlaubt: small, medium, large, normal)",
                s
            ),
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
            ModelSize::Normal => "normal",
        };
        write!(f, "{s}")
    }
}

// ---------------- Hyperparameter ----------------

/// Fester Hyperparameter-Record. Wird einmal pro Lauf aus einem Preset
/// konstruiert und danach nicht mehr veraendert; einzige Ausnahme ist die
/// Eval-Variante, die batch_size und num_steps auf 1/1 zwingt
/// (inkrementelles Dekodieren mit einem Token pro Schritt).
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub d_init_scale: f32,
    pub d_learning_rate: f32,
    pub d_max_grad_norm: f32,
    pub i_num_layers: usize,
    pub i_num_steps: usize,
    pub i_hidden_size: usize,
    pub i_max_epoch: usize,
    pub i_max_max_epoch: usize,
    pub d_keep_prob: f32,
    pub d_lr_decay: f32,
    pub i_batch_size: usize,
    pub i_vocab_size: usize,
}

impl Config {
    pub fn preset(size: ModelSize) -> Self {
        match size {
            ModelSize::Small => Config {
                d_init_scale: 0.1,
                d_learning_rate: 1.0,
                d_max_grad_norm: 5.0,
                i_num_layers: 2,
                i_num_steps: 20,
                i_hidden_size: 200,
                i_max_epoch: 4,
                i_max_max_epoch: 13,
                d_keep_prob: 1.0,
                d_lr_decay: 0.5,
                i_batch_size: 20,
                i_vocab_size: 90,
            },
            ModelSize::Medium => Config {
                d_init_scale: 0.05,
                d_learning_rate: 1.0,
                d_max_grad_norm: 5.0,
                i_num_layers: 2,
                i_num_steps: 35, // Zeichen pro Element
                i_hidden_size: 800,
                i_max_epoch: 6,
                i_max_max_epoch: 39,
                d_keep_prob: 0.5,
                d_lr_decay: 0.8,
                i_batch_size: 20, // Elemente pro Batch
                i_vocab_size: 10000,
            },
            ModelSize::Large => Config {
                d_init_scale: 0.04,
                d_learning_rate: 1.0,
                d_max_grad_norm: 10.0,
                i_num_layers: 2,
                i_num_steps: 35,
                i_hidden_size: 850,
                i_max_epoch: 14,
                i_max_max_epoch: 55,
                d_keep_prob: 0.5,
                d_lr_decay: 1.0 / 1.15,
                i_batch_size: 20,
                i_vocab_size: 90,
            },
            ModelSize::Normal => Config {
                d_init_scale: 0.05,
                d_learning_rate: 0.8,
                d_max_grad_norm: 5.0,
                i_num_layers: 2,
                i_num_steps: 35,
                i_hidden_size: 128,
                i_max_epoch: 6,
                i_max_max_epoch: 39,
                d_keep_prob: 0.6,
                d_lr_decay: 0.97,
                i_batch_size: 20,
                i_vocab_size: 83,
            },
        }
    }

    /// Variante fuer die abschliessende Test-Auswertung und das Sampling:
    /// ein Element, ein Zeitschritt.
    pub fn eval_variant(&self) -> Self {
        let mut cfg = self.clone();
        cfg.i_batch_size = 1;
        cfg.i_num_steps = 1;
        cfg
    }

    /// Lernrate fuer Epoche i (0-basiert): nach max_epoch Epochen faellt die
    /// Basisrate geometrisch mit lr_decay.
    pub fn lr_for_epoch(&self, i_epoch: usize) -> f32 {
        let d_exp = (i_epoch as f32 - self.i_max_epoch as f32).max(0.0);
        self.d_learning_rate * self.d_lr_decay.powf(d_exp)
    }
}

// ---------------------------------------------------------------------------
//  Unit-Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_names_parse() {
        assert_eq!("small".parse::<ModelSize>().unwrap(), ModelSize::Small);
        assert_eq!("normal".parse::<ModelSize>().unwrap(), ModelSize::Normal);
        assert!("gross".parse::<ModelSize>().is_err());
    }

    #[test]
    fn small_preset_literal_values() {
        let cfg = Config::preset(ModelSize::Small);
        assert_eq!(cfg.i_num_steps, 20);
        assert_eq!(cfg.i_hidden_size, 200);
        assert_eq!(cfg.i_max_max_epoch, 13);
        assert_eq!(cfg.i_batch_size, 20);
        assert_eq!(cfg.i_vocab_size, 90);
        assert!((cfg.d_keep_prob - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn eval_variant_forces_single_step() {
        let cfg = Config::preset(ModelSize::Medium).eval_variant();
        assert_eq!(cfg.i_batch_size, 1);
        assert_eq!(cfg.i_num_steps, 1);
        // alle uebrigen Felder bleiben unveraendert
        assert_eq!(cfg.i_hidden_size, 800);
    }

    #[test]
    fn lr_decays_geometrically_after_max_epoch() {
        let mut cfg = Config::preset(ModelSize::Small);
        cfg.d_learning_rate = 1.0;
        cfg.d_lr_decay = 0.5;
        cfg.i_max_epoch = 4;
        assert!((cfg.lr_for_epoch(0) - 1.0).abs() < 1e-6);
        assert!((cfg.lr_for_epoch(4) - 1.0).abs() < 1e-6);
        assert!((cfg.lr_for_epoch(6) - 0.25).abs() < 1e-6);
    }
}
