//! BM25 relevance re-ranking over history turns.
//!
//! Each turn becomes one document. Turns are ranked against the current
//! query, weak matches are dropped (unless that would drop everything), and
//! the ranking is consumed greedily until the history budget is spent. The
//! selected turns are returned in their original chronological order.

use std::collections::HashMap;

use sage_core::Message;
use tracing::debug;

use crate::tokens::is_cjk;
use crate::turns::{Turn, group_turns};

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;
const MIN_RELEVANCE: f64 = 0.1;

/// Lowercase, strip punctuation, split on whitespace. CJK runs become
/// single-character tokens alongside any embedded Latin words; other words
/// shorter than two characters are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c.is_whitespace() || is_cjk(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut tokens = Vec::new();
    for word in cleaned.split_whitespace() {
        if word.chars().any(is_cjk) {
            tokens.extend(word.chars().filter(|c| is_cjk(*c)).map(String::from));
            let mut run = String::new();
            for c in word.chars() {
                if c.is_ascii_alphabetic() {
                    run.push(c);
                } else if !run.is_empty() {
                    tokens.push(std::mem::take(&mut run));
                }
            }
            if !run.is_empty() {
                tokens.push(run);
            }
        } else if word.chars().count() > 1 {
            tokens.push(word.to_owned());
        }
    }
    tokens
}

/// Okapi BM25 over a fixed corpus.
#[derive(Debug)]
pub struct Bm25 {
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_len: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25 {
    /// Index a tokenized corpus.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(corpus: &[Vec<String>]) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_len = Vec::with_capacity(corpus.len());
        let mut containing: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for doc in corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in doc {
                *freqs.entry(token.clone()).or_default() += 1;
            }
            for token in freqs.keys() {
                *containing.entry(token.clone()).or_default() += 1;
            }
            total_len += doc.len();
            doc_len.push(doc.len());
            doc_freqs.push(freqs);
        }

        let n = corpus.len() as f64;
        let avgdl = if corpus.is_empty() { 0.0 } else { total_len as f64 / n };

        let mut idf = HashMap::with_capacity(containing.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (token, df) in containing {
            let df = df as f64;
            let value = (n - df + 0.5).ln() - (df + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(token.clone());
            }
            let _ = idf.insert(token, value);
        }
        if !idf.is_empty() {
            let floor = EPSILON * (idf_sum / idf.len() as f64);
            for token in negative {
                let _ = idf.insert(token, floor);
            }
        }

        Self {
            doc_freqs,
            doc_len,
            avgdl,
            idf,
        }
    }

    /// Score every document against `query`.
    #[allow(clippy::cast_precision_loss)]
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.doc_freqs.len()];
        if self.avgdl <= 0.0 {
            return scores;
        }
        for q in query {
            let Some(idf) = self.idf.get(q) else {
                continue;
            };
            for (i, freqs) in self.doc_freqs.iter().enumerate() {
                let tf = freqs.get(q).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let norm = 1.0 - B + B * self.doc_len[i] as f64 / self.avgdl;
                scores[i] += idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
            }
        }
        scores
    }
}

/// Pick the most relevant turns that fit in `budget`, chronological order.
pub fn retrieve_turns(turns: &[Turn], query: &str, budget: usize) -> Vec<Turn> {
    if turns.is_empty() || query.trim().is_empty() {
        return turns.to_vec();
    }

    let corpus: Vec<Vec<String>> = turns.iter().map(|t| tokenize(&t.text())).collect();
    let bm25 = Bm25::new(&corpus);
    let scores = bm25.scores(&tokenize(query));

    let mut ranked: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let relevant: Vec<(usize, f64)> = ranked
        .iter()
        .copied()
        .filter(|(_, score)| *score > MIN_RELEVANCE)
        .collect();
    let candidates = if relevant.is_empty() { ranked } else { relevant };

    let mut used = 0;
    let mut picked = Vec::new();
    for (idx, score) in candidates {
        let cost = turns[idx].tokens();
        if used + cost > budget {
            debug!(turn = idx, cost, used, budget, "history budget reached");
            break;
        }
        used += cost;
        picked.push(idx);
        debug!(turn = idx, score, cost, "history turn selected");
    }
    picked.sort_unstable();
    picked.into_iter().map(|i| turns[i].clone()).collect()
}

/// Message-level convenience over [`retrieve_turns`].
pub fn retrieve(history: &[Message], query: &str, budget: usize) -> Vec<Message> {
    if history.is_empty() || query.trim().is_empty() {
        return history.to_vec();
    }
    retrieve_turns(&group_turns(history), query, budget)
        .into_iter()
        .flat_map(|t| t.messages)
        .collect()
}
