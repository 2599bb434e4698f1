// corpus.rs
// ============================================================================
// Autor:   Marcus Schlieper (ExpChat.ai)
// Hinweis: Korpus-Objekt fuer die SMILES-Textpartitionen: Einlesen der drei
//          Dateien (train/valid/test), Vokabular-Aufbau nach Haeufigkeit,
//          Kodierung in Token-IDs sowie Fenster-Iteration [B, T] fuer das
//          Training. Der Korpus ist nach dem Laden unveraenderlich.
// ============================================================================

#![deny(unsafe_code)]

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Satzende-Marker: ersetzt beim Einlesen jeden Zeilenumbruch.
pub const S_EOS: &str = "<eos>";
/// Startmarker vor jeder SMILES-Sequenz in den Datendateien.
pub const S_START: &str = "|";

pub const P_TRAIN: &str = "ptb.train.txt";
pub const P_VALID: &str = "ptb.valid.txt";
pub const P_TEST: &str = "ptb.test.txt";

// ---------------- Vokabular ----------------

/// Bidirektionale Abbildung Token <-> ID. IDs werden nach absteigender
/// Haeufigkeit im Trainingskorpus vergeben, Gleichstand lexikographisch.
#[derive(Clone, Debug)]
pub struct Vocab {
    m_word_to_id: HashMap<String, usize>,
    v_id_to_word: Vec<String>,
}

impl Vocab {
    pub fn from_tokens(v_tokens: &[String]) -> Self {
        let mut m_count: HashMap<&str, usize> = HashMap::new();
        for s_tok in v_tokens {
            *m_count.entry(s_tok.as_str()).or_insert(0) += 1;
        }

        let mut v_pairs: Vec<(&str, usize)> = m_count.into_iter().collect();
        v_pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let v_id_to_word: Vec<String> = v_pairs.iter().map(|(s, _)| s.to_string()).collect();
        let m_word_to_id = v_id_to_word
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();

        Vocab { m_word_to_id, v_id_to_word }
    }

    pub fn len(&self) -> usize {
        self.v_id_to_word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v_id_to_word.is_empty()
    }

    pub fn token_id(&self, s_token: &str) -> Option<usize> {
        self.m_word_to_id.get(s_token).copied()
    }

    pub fn decode_id(&self, i_id: usize) -> Option<&str> {
        self.v_id_to_word.get(i_id).map(|s| s.as_str())
    }

    /// Kodiert eine Token-Folge. Unbekannte Tokens sind ein harter Fehler,
    /// die Pipeline kennt kein <unk>.
    pub fn encode(&self, v_tokens: &[String]) -> Result<Vec<usize>> {
        v_tokens
            .iter()
            .map(|s_tok| {
                self.token_id(s_tok)
                    .with_context(|| format!("Token '{}' nicht im Vokabular", s_tok))
            })
            .collect()
    }

    /// Dekodiert eine ID-Folge zurueck in Tokens.
    pub fn decode(&self, v_ids: &[usize]) -> Result<Vec<String>> {
        v_ids
            .iter()
            .map(|&i_id| {
                self.decode_id(i_id)
                    .map(|s| s.to_string())
                    .with_context(|| format!("Token-ID {} nicht im Vokabular", i_id))
            })
            .collect()
    }
}

// ---------------- Korpus ----------------

/// Die drei Partitionen als ID-Folgen plus zugehoeriges Vokabular.
#[derive(Clone, Debug)]
pub struct Corpus {
    pub v_train: Vec<usize>,
    pub v_valid: Vec<usize>,
    pub v_test: Vec<usize>,
    pub vocab: Vocab,
}

impl Corpus {
    /// Laedt ptb.train.txt / ptb.valid.txt / ptb.test.txt aus dem
    /// Datenverzeichnis. Das Vokabular wird ausschliesslich aus der
    /// Trainingspartition aufgebaut.
    pub fn load(p_data_dir: &Path) -> Result<Self> {
        let v_train_tokens = read_tokens(&p_data_dir.join(P_TRAIN))?;
        let v_valid_tokens = read_tokens(&p_data_dir.join(P_VALID))?;
        let v_test_tokens = read_tokens(&p_data_dir.join(P_TEST))?;

        if v_train_tokens.is_empty() {
            bail!("Trainingsdatei in {:?} enthaelt keine Tokens", p_data_dir);
        }

        let vocab = Vocab::from_tokens(&v_train_tokens);
        let v_train = vocab.encode(&v_train_tokens).context("Trainingspartition")?;
        let v_valid = vocab.encode(&v_valid_tokens).context("Validierungspartition")?;
        let v_test = vocab.encode(&v_test_tokens).context("Testpartition")?;

        Ok(Corpus { v_train, v_valid, v_test, vocab })
    }
}

/// Liest eine Partitionsdatei: Zeilenumbrueche werden durch den EOS-Marker
/// ersetzt, anschliessend wird an Leerraum getrennt.
fn read_tokens(p_path: &Path) -> Result<Vec<String>> {
    let s_content = fs::read_to_string(p_path)
        .with_context(|| format!("Korpusdatei {:?} kann nicht gelesen werden", p_path))?;
    Ok(s_content
        .replace('\n', &format!(" {S_EOS} "))
        .split_whitespace()
        .map(|s| s.to_string())
        .collect())
}

// ---------------- Fenster-Iteration ----------------

/// Anzahl vollstaendiger [B, T]-Fenster einer Partition:
/// (len / batch - 1) / num_steps. Null bedeutet: Korpus zu kurz.
pub fn epoch_size(i_len: usize, i_batch: usize, i_num_steps: usize) -> usize {
    let i_batch_len = i_len / i_batch;
    if i_batch_len == 0 {
        return 0;
    }
    (i_batch_len - 1) / i_num_steps
}

/// Iteriert einen ID-Strom als Folge nicht ueberlappender Fenster der Form
/// [batch, num_steps]. Der Strom wird dazu in `batch` gleich lange,
/// zusammenhaengende Zeilen zerlegt; ein Rest, der keine volle Laenge
/// ergibt, wird verworfen. Das Target-Fenster ist das Input-Fenster um
/// eine Position verschoben.
pub struct BatchWindows {
    a_data: Array2<usize>,
    i_num_steps: usize,
    i_epoch_size: usize,
    i_cursor: usize,
}

impl BatchWindows {
    pub fn new(v_data: &[usize], i_batch: usize, i_num_steps: usize) -> Self {
        let i_batch_len = v_data.len() / i_batch;
        let mut a_data = Array2::zeros((i_batch, i_batch_len));
        for i_row in 0..i_batch {
            for i_col in 0..i_batch_len {
                a_data[(i_row, i_col)] = v_data[i_row * i_batch_len + i_col];
            }
        }
        BatchWindows {
            a_data,
            i_num_steps,
            i_epoch_size: epoch_size(v_data.len(), i_batch, i_num_steps),
            i_cursor: 0,
        }
    }

    pub fn epoch_size(&self) -> usize {
        self.i_epoch_size
    }
}

impl Iterator for BatchWindows {
    type Item = (Array2<usize>, Array2<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.i_cursor >= self.i_epoch_size {
            return None;
        }
        let i_from = self.i_cursor * self.i_num_steps;
        let a_x = self
            .a_data
            .slice(s![.., i_from..i_from + self.i_num_steps])
            .to_owned();
        let a_y = self
            .a_data
            .slice(s![.., i_from + 1..i_from + self.i_num_steps + 1])
            .to_owned();
        self.i_cursor += 1;
        Some((a_x, a_y))
    }
}

// ---------------------------------------------------------------------------
//  Unit-Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn toks(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn vocab_orders_by_frequency_then_name() {
        let vocab = Vocab::from_tokens(&toks(&["C", "C", "O", "N", "N", "N"]));
        // N dreimal, C zweimal, O einmal
        assert_eq!(vocab.decode_id(0), Some("N"));
        assert_eq!(vocab.decode_id(1), Some("C"));
        assert_eq!(vocab.decode_id(2), Some("O"));
        assert_eq!(vocab.len(), 3);
    }

    #[test]
    fn encode_decode_round_trip() {
        let v_tokens = toks(&["|", "C", "C", "(", "=", "O", ")", "<eos>"]);
        let vocab = Vocab::from_tokens(&v_tokens);
        let v_ids = vocab.encode(&v_tokens).unwrap();
        assert!(v_ids.iter().all(|&i| i < vocab.len()));
        assert_eq!(vocab.decode(&v_ids).unwrap(), v_tokens);
    }

    #[test]
    fn encode_rejects_unknown_token() {
        let vocab = Vocab::from_tokens(&toks(&["C", "O"]));
        assert!(vocab.encode(&toks(&["C", "X"])).is_err());
    }

    #[test]
    fn epoch_size_literal_case() {
        // L=1000, B=20, T=20 -> (50 - 1) / 20 = 2
        assert_eq!(epoch_size(1000, 20, 20), 2);
        assert_eq!(epoch_size(10, 20, 20), 0);
    }

    #[test]
    fn windows_are_contiguous_and_shifted() {
        // 2 Zeilen zu je 10 Tokens, T=4 -> epoch_size = (10-1)/4 = 2
        let v_data: Vec<usize> = (0..20).collect();
        let mut it = BatchWindows::new(&v_data, 2, 4);
        assert_eq!(it.epoch_size(), 2);

        let (a_x, a_y) = it.next().unwrap();
        assert_eq!(a_x.dim(), (2, 4));
        assert_eq!(a_x.row(0).to_vec(), vec![0, 1, 2, 3]);
        assert_eq!(a_x.row(1).to_vec(), vec![10, 11, 12, 13]);
        assert_eq!(a_y.row(0).to_vec(), vec![1, 2, 3, 4]);

        let (a_x2, _) = it.next().unwrap();
        assert_eq!(a_x2.row(0).to_vec(), vec![4, 5, 6, 7]);
        assert!(it.next().is_none());
    }

    #[test]
    fn corpus_load_reads_all_three_partitions() {
        let p_dir = std::env::temp_dir().join("smiles_lm_corpus_test");
        fs::create_dir_all(&p_dir).unwrap();
        fs::write(p_dir.join(P_TRAIN), " | C C O \n | N C \n").unwrap();
        fs::write(p_dir.join(P_VALID), " | C O \n").unwrap();
        fs::write(p_dir.join(P_TEST), " | N C O \n").unwrap();

        let corpus = Corpus::load(&p_dir).unwrap();
        // Tokens: |, C, O, <eos>, N
        assert_eq!(corpus.vocab.len(), 5);
        assert_eq!(corpus.v_train.len(), 9);
        assert_eq!(corpus.v_valid.len(), 4);
        assert_eq!(corpus.v_test.len(), 5);

        fs::remove_dir_all(&p_dir).ok();
    }

    #[test]
    fn corpus_load_fails_on_missing_file() {
        let p_dir = std::env::temp_dir().join("smiles_lm_missing_dir");
        assert!(Corpus::load(&p_dir).is_err());
    }
}
