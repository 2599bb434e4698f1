// =============================================
// lib.rs
// =============================================
pub mod config;
pub mod corpus;
pub mod lstm;
pub mod math;
pub mod model;
pub mod sampler;
pub mod train;

// Re-export key structs for easier access
pub use config::{Config, ModelSize};
pub use corpus::{BatchWindows, Corpus, Vocab, S_EOS, S_START};
pub use lstm::LstmModel;
pub use model::{RnnState, SequenceModel};
pub use sampler::{sample_sequence, I_MAX_SAMPLE_LEN};
pub use train::{fit, run_epoch};
