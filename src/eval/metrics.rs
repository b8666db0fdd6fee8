//! Corpus-level text-similarity metrics
//!
//! Corpus BLEU with modified n-gram precision and brevity penalty
//! (sacrebleu-style, reported on a 0-100 scale) and ROUGE-1/2/L/Lsum F1
//! means. Tokenization is lowercased whitespace splitting with punctuation
//! trimmed, applied identically to references and predictions.

use std::collections::HashMap;

/// Corpus scores over a set of (reference, prediction) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusScores {
    /// Corpus BLEU, 0-100
    pub bleu: f64,
    /// Mean ROUGE-1 F1, 0-1
    pub rouge1: f64,
    /// Mean ROUGE-2 F1, 0-1
    pub rouge2: f64,
    /// Mean ROUGE-L F1, 0-1
    pub rouge_l: f64,
    /// Mean ROUGE-Lsum F1, 0-1
    pub rouge_lsum: f64,
    /// Number of scored pairs
    pub n: usize,
}

/// Score a corpus of predictions against single references.
pub fn score_corpus(references: &[String], predictions: &[String]) -> CorpusScores {
    assert_eq!(
        references.len(),
        predictions.len(),
        "references and predictions must pair up"
    );
    let n = references.len();
    if n == 0 {
        return CorpusScores {
            bleu: 0.0,
            rouge1: 0.0,
            rouge2: 0.0,
            rouge_l: 0.0,
            rouge_lsum: 0.0,
            n: 0,
        };
    }
    let mut rouge1 = 0.0;
    let mut rouge2 = 0.0;
    let mut rouge_l_total = 0.0;
    let mut rouge_lsum_total = 0.0;
    for (reference, prediction) in references.iter().zip(predictions) {
        rouge1 += rouge_n(reference, prediction, 1);
        rouge2 += rouge_n(reference, prediction, 2);
        rouge_l_total += rouge_l(reference, prediction);
        rouge_lsum_total += rouge_l_sum(reference, prediction);
    }
    CorpusScores {
        bleu: corpus_bleu(references, predictions, 4) * 100.0,
        rouge1: rouge1 / n as f64,
        rouge2: rouge2 / n as f64,
        rouge_l: rouge_l_total / n as f64,
        rouge_lsum: rouge_lsum_total / n as f64,
        n,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

fn extract_ngrams(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for window in tokens.windows(n) {
            *counts.entry(window).or_insert(0) += 1;
        }
    }
    counts
}

/// Corpus BLEU: clipped n-gram matches are summed over the whole corpus
/// before taking the geometric mean, and the brevity penalty compares
/// corpus-level lengths.
pub fn corpus_bleu(references: &[String], predictions: &[String], max_n: usize) -> f64 {
    let mut clipped = vec![0usize; max_n];
    let mut totals = vec![0usize; max_n];
    let mut hyp_len = 0usize;
    let mut ref_len = 0usize;

    for (reference, prediction) in references.iter().zip(predictions) {
        let ref_tokens = tokenize(reference);
        let hyp_tokens = tokenize(prediction);
        hyp_len += hyp_tokens.len();
        ref_len += ref_tokens.len();
        for n in 1..=max_n {
            let ref_ngrams = extract_ngrams(&ref_tokens, n);
            let hyp_ngrams = extract_ngrams(&hyp_tokens, n);
            for (ngram, &count) in &hyp_ngrams {
                totals[n - 1] += count;
                let reference_count = ref_ngrams.get(ngram).copied().unwrap_or(0);
                clipped[n - 1] += count.min(reference_count);
            }
        }
    }

    let mut log_precision_sum = 0.0;
    for n in 0..max_n {
        if totals[n] == 0 || clipped[n] == 0 {
            return 0.0;
        }
        log_precision_sum += (clipped[n] as f64 / totals[n] as f64).ln();
    }
    let geometric_mean = (log_precision_sum / max_n as f64).exp();

    let brevity_penalty = if hyp_len >= ref_len {
        1.0
    } else if hyp_len == 0 {
        0.0
    } else {
        (1.0 - ref_len as f64 / hyp_len as f64).exp()
    };
    brevity_penalty * geometric_mean
}

/// ROUGE-N F1: clipped n-gram overlap between one reference and prediction.
pub fn rouge_n(reference: &str, prediction: &str, n: usize) -> f64 {
    let ref_tokens = tokenize(reference);
    let hyp_tokens = tokenize(prediction);
    if ref_tokens.len() < n || hyp_tokens.len() < n {
        return 0.0;
    }
    let ref_ngrams = extract_ngrams(&ref_tokens, n);
    let hyp_ngrams = extract_ngrams(&hyp_tokens, n);

    let mut overlap = 0usize;
    for (ngram, &count) in &hyp_ngrams {
        overlap += count.min(ref_ngrams.get(ngram).copied().unwrap_or(0));
    }
    let ref_total: usize = ref_ngrams.values().sum();
    let hyp_total: usize = hyp_ngrams.values().sum();
    f1(overlap, hyp_total, ref_total)
}

/// ROUGE-L F1 from the longest common subsequence of the token streams.
pub fn rouge_l(reference: &str, prediction: &str) -> f64 {
    let ref_tokens = tokenize(reference);
    let hyp_tokens = tokenize(prediction);
    if ref_tokens.is_empty() || hyp_tokens.is_empty() {
        return 0.0;
    }
    let lcs = lcs_length(&ref_tokens, &hyp_tokens);
    f1(lcs, hyp_tokens.len(), ref_tokens.len())
}

/// Summary-level ROUGE-L: union LCS over newline-separated segments. For
/// single-line texts this coincides with [`rouge_l`].
pub fn rouge_l_sum(reference: &str, prediction: &str) -> f64 {
    let ref_lines: Vec<&str> = reference.lines().filter(|l| !l.trim().is_empty()).collect();
    let hyp_lines: Vec<&str> = prediction.lines().filter(|l| !l.trim().is_empty()).collect();
    if ref_lines.len() <= 1 && hyp_lines.len() <= 1 {
        return rouge_l(reference, prediction);
    }
    let hyp_tokens: Vec<String> = hyp_lines.iter().flat_map(|line| tokenize(line)).collect();
    let ref_token_count: usize = ref_lines.iter().map(|line| tokenize(line).len()).sum();
    if hyp_tokens.is_empty() || ref_token_count == 0 {
        return 0.0;
    }
    let mut union_lcs = 0usize;
    for line in &ref_lines {
        let line_tokens = tokenize(line);
        union_lcs += lcs_length(&line_tokens, &hyp_tokens);
    }
    f1(union_lcs, hyp_tokens.len(), ref_token_count)
}

fn f1(overlap: usize, hyp_total: usize, ref_total: usize) -> f64 {
    if hyp_total == 0 || ref_total == 0 || overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / hyp_total as f64;
    let recall = overlap as f64 / ref_total as f64;
    2.0 * precision * recall / (precision + recall)
}

fn lcs_length(a: &[String], b: &[String]) -> usize {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            table[i][j] = if a[i - 1] == b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table[a.len()][b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_corpus_scores_perfectly() {
        let texts = strings(&["a red ceramic mug on a table", "blue running shoe"]);
        let scores = score_corpus(&texts, &texts);
        assert_abs_diff_eq!(scores.bleu, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(scores.rouge1, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(scores.rouge2, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(scores.rouge_l, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(scores.rouge_lsum, 1.0, epsilon = 1e-9);
        assert_eq!(scores.n, 2);
    }

    #[test]
    fn disjoint_corpus_scores_zero() {
        let refs = strings(&["a red mug"]);
        let preds = strings(&["blue shoe box"]);
        let scores = score_corpus(&refs, &preds);
        assert_eq!(scores.bleu, 0.0);
        assert_eq!(scores.rouge1, 0.0);
        assert_eq!(scores.rouge_l, 0.0);
    }

    #[test]
    fn partial_overlap_lands_in_between() {
        let refs = strings(&["a red ceramic mug on the table"]);
        let preds = strings(&["a red mug on the table"]);
        let scores = score_corpus(&refs, &preds);
        assert!(scores.bleu > 0.0 && scores.bleu < 100.0);
        assert!(scores.rouge1 > 0.5 && scores.rouge1 < 1.0);
        assert!(scores.rouge2 > 0.0 && scores.rouge2 < 1.0);
    }

    #[test]
    fn tokenization_is_case_and_punctuation_insensitive() {
        let refs = strings(&["A red Mug."]);
        let preds = strings(&["a red mug"]);
        let scores = score_corpus(&refs, &preds);
        assert_abs_diff_eq!(scores.rouge1, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn brevity_penalty_punishes_short_hypotheses() {
        let refs = strings(&["a red ceramic mug sits on the wooden table"]);
        let long = strings(&["a red ceramic mug sits on the wooden table"]);
        let short = strings(&["a red ceramic mug"]);
        let full = corpus_bleu(&refs, &long, 4);
        let clipped = corpus_bleu(&refs, &short, 4);
        assert!(clipped < full);
    }

    #[test]
    fn rouge_lsum_equals_rouge_l_for_single_lines() {
        let reference = "a red mug on the table";
        let prediction = "a mug on a table";
        assert_abs_diff_eq!(
            rouge_l_sum(reference, prediction),
            rouge_l(reference, prediction),
            epsilon = 1e-12
        );
    }

    #[test]
    fn empty_corpus_is_all_zeros() {
        let scores = score_corpus(&[], &[]);
        assert_eq!(scores.n, 0);
        assert_eq!(scores.bleu, 0.0);
    }
}
